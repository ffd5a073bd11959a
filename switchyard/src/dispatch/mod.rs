//! Request dispatcher.
//!
//! The dispatcher turns an HTTP request into a worker call. For each request
//! it:
//! 1. Checks the `application` header when the service requires it
//! 2. Resolves the `token` header (default `public`) to a worker or queue
//! 3. Runs the service's pre-processing hook
//! 4. Calls the worker directly, or through the queue with a size-based priority
//! 5. Runs the service's post-processing hook
//!
//! Whether calls are local or remote is decided once, from the
//! [`ServiceConfig`] variant, when the dispatcher is built.

pub mod config;
pub mod service;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{DispatchError, QueueError};
use crate::queue::QueueClient;
use crate::response::Response;
use crate::worker::{Request, WorkerHandle};

pub use config::{BrokerSettings, PriorityLimits, ServiceConfig, Targets};
pub use service::{MultiService, PlainText, TextService};

/// Token used when the caller sends none.
pub const DEFAULT_TOKEN: &str = "public";

/// Parsed inbound request.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub token: Option<String>,
    pub application: Option<String>,
    pub body: Map<String, Value>,
}

/// Anything that can answer a [`DispatchRequest`].
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<Response, DispatchError>;

    /// Declare broker topology. A no-op for local services.
    async fn prepare(&self) -> Result<(), QueueError>;

    /// Release broker resources.
    async fn close(&self);
}

enum Backend {
    Local(HashMap<String, WorkerHandle>),
    Remote {
        queues: HashMap<String, String>,
        client: QueueClient,
        limits: PriorityLimits,
    },
}

/// Resolved worker reference for one request.
enum Target<'a> {
    Local(&'a WorkerHandle),
    Remote {
        queue: &'a str,
        client: &'a QueueClient,
        limits: PriorityLimits,
    },
}

/// Shared state behind both dispatcher flavours.
struct Core {
    backend: Backend,
    application_required: bool,
}

impl Core {
    fn new(config: ServiceConfig) -> Self {
        let (targets, application_required) = config.into_parts();

        let backend = match targets {
            Targets::Local(workers) => {
                info!(tokens = workers.len(), mode = "local", "dispatcher_configured");
                Backend::Local(workers)
            }
            Targets::Remote { queues, broker } => {
                info!(
                    tokens = queues.len(),
                    mode = "remote",
                    exchange = %broker.exchange,
                    max_priority = broker.limits.max_priority(),
                    max_length = broker.limits.max_length(),
                    "dispatcher_configured"
                );
                Backend::Remote {
                    queues,
                    client: QueueClient::new(broker.url, broker.exchange),
                    limits: broker.limits,
                }
            }
        };

        Self {
            backend,
            application_required,
        }
    }

    fn resolve(&self, token: &str) -> Option<Target<'_>> {
        match &self.backend {
            Backend::Local(workers) => workers.get(token).map(Target::Local),
            Backend::Remote {
                queues,
                client,
                limits,
            } => queues.get(token).map(|queue| Target::Remote {
                queue,
                client,
                limits: *limits,
            }),
        }
    }

    /// Check headers, resolve the token and build the payload forwarded to
    /// the worker. The token itself is never forwarded.
    fn accept(&self, request: DispatchRequest) -> Result<(Target<'_>, Request), DispatchError> {
        if self.application_required && request.application.is_none() {
            return Err(DispatchError::BadRequest(
                "Missing required header: application".to_string(),
            ));
        }

        let token = request.token.as_deref().unwrap_or(DEFAULT_TOKEN);
        let target = self.resolve(token).ok_or_else(|| {
            warn!(token_length = token.len(), "dispatch_token_rejected");
            DispatchError::Unauthorized
        })?;

        let mut payload = request.body;
        payload.remove("token");
        payload.insert(
            "application".to_string(),
            request.application.map(Value::String).unwrap_or(Value::Null),
        );

        Ok((target, payload))
    }

    async fn call_one(
        &self,
        target: Target<'_>,
        request: Request,
        length: usize,
    ) -> Result<Response, DispatchError> {
        match target {
            Target::Local(worker) => Ok(worker.process_one(request).await?),
            Target::Remote {
                queue,
                client,
                limits,
            } => {
                let priority = limits
                    .priority(length)
                    .ok_or_else(|| DispatchError::text_too_long(length))?;
                debug!(queue = queue, length = length, priority = priority, "dispatch_remote");
                Ok(client.call(queue, &request, priority).await?)
            }
        }
    }

    async fn call_many(
        &self,
        target: Target<'_>,
        requests: Vec<Request>,
    ) -> Result<Vec<Response>, DispatchError> {
        match target {
            Target::Local(worker) => Ok(worker.process_many(requests).await?),
            Target::Remote {
                queue,
                client,
                limits,
            } => {
                let length = requests.len();
                let priority = limits
                    .priority(length)
                    .ok_or_else(|| DispatchError::request_too_long(length))?;
                debug!(queue = queue, length = length, priority = priority, "dispatch_remote");
                Ok(client.call_many(queue, &requests, priority).await?)
            }
        }
    }

    async fn prepare(&self) -> Result<(), QueueError> {
        match &self.backend {
            Backend::Local(_) => Ok(()),
            Backend::Remote {
                queues,
                client,
                limits,
            } => {
                client
                    .declare_topology(queues.values(), limits.max_priority())
                    .await
            }
        }
    }

    async fn close(&self) {
        if let Backend::Remote { client, .. } = &self.backend {
            client.close().await;
        }
    }
}

/// Dispatcher for services that take one `text` per request.
pub struct Dispatcher<S = PlainText> {
    core: Core,
    service: S,
}

impl Dispatcher<PlainText> {
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_service(config, PlainText)
    }
}

impl<S: TextService> Dispatcher<S> {
    pub fn with_service(config: ServiceConfig, service: S) -> Self {
        Self {
            core: Core::new(config),
            service,
        }
    }
}

#[async_trait]
impl<S: TextService> Dispatch for Dispatcher<S> {
    async fn dispatch(&self, request: DispatchRequest) -> Result<Response, DispatchError> {
        let (target, mut request) = self.core.accept(request)?;

        match request.get("text") {
            None => {
                request.insert("text".to_string(), Value::Null);
            }
            Some(Value::String(_)) | Some(Value::Null) => {}
            Some(scalar @ (Value::Bool(_) | Value::Number(_))) => {
                let text = scalar.to_string();
                request.insert("text".to_string(), Value::String(text));
            }
            Some(_) => {
                return Err(DispatchError::BadRequest(
                    "Field 'text' must be a string".to_string(),
                ))
            }
        }

        let request = self.service.pre_process(request)?;
        let length = self.service.measure(&request);
        let response = self.core.call_one(target, request, length).await?;
        let response = self.service.post_process(response)?;

        info!(
            status = response.http_status_code,
            length = length,
            "dispatch_completed"
        );

        Ok(response)
    }

    async fn prepare(&self) -> Result<(), QueueError> {
        self.core.prepare().await
    }

    async fn close(&self) {
        self.core.close().await
    }
}

/// Dispatcher for services that fan one request out into subrequests.
///
/// Queue priority is derived from the number of subrequests.
pub struct MultiDispatcher<S> {
    core: Core,
    service: S,
}

impl<S: MultiService> MultiDispatcher<S> {
    pub fn new(config: ServiceConfig, service: S) -> Self {
        Self {
            core: Core::new(config),
            service,
        }
    }
}

#[async_trait]
impl<S: MultiService> Dispatch for MultiDispatcher<S> {
    async fn dispatch(&self, request: DispatchRequest) -> Result<Response, DispatchError> {
        let (target, request) = self.core.accept(request)?;

        let requests = self.service.pre_process(request)?;
        let count = requests.len();
        let responses = self.core.call_many(target, requests).await?;
        let response = self.service.post_process(responses)?;

        info!(
            status = response.http_status_code,
            subrequests = count,
            "dispatch_completed"
        );

        Ok(response)
    }

    async fn prepare(&self) -> Result<(), QueueError> {
        self.core.prepare().await
    }

    async fn close(&self) {
        self.core.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::response::Content;
    use crate::worker::{process_in_batches, tokenizer::tokenize, BatchSize, BatchWorker, Worker};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Answers with its own name and the forwarded payload.
    struct Named {
        name: &'static str,
        calls: AtomicUsize,
    }

    impl Named {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Worker for Named {
        async fn process_one(&self, request: Request) -> Result<Response, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Response::json(json!({ "worker": self.name, "request": request })))
        }
    }

    fn local(workers: Vec<(&str, Arc<Named>)>) -> ServiceConfig {
        let workers = workers
            .into_iter()
            .map(|(token, worker)| (token.to_string(), WorkerHandle::Single(worker)))
            .collect();
        ServiceConfig::local(workers).unwrap()
    }

    fn remote(max_priority: u32, max_length: usize) -> ServiceConfig {
        // Nothing listens here; tests must fail before touching the broker.
        let broker = BrokerSettings {
            url: "amqp://127.0.0.1:1/%2f".into(),
            exchange: "switchyard".into(),
            limits: PriorityLimits::new(max_priority, max_length).unwrap(),
        };
        ServiceConfig::remote(
            HashMap::from([("public".to_string(), "tokenize".to_string())]),
            broker,
        )
        .unwrap()
    }

    fn text_request(token: Option<&str>, text: &str) -> DispatchRequest {
        let mut body = Map::new();
        body.insert("text".into(), json!(text));
        DispatchRequest {
            token: token.map(String::from),
            application: None,
            body,
        }
    }

    fn content(response: &Response) -> &Value {
        match &response.content {
            Some(Content::Json(value)) => value,
            other => panic!("expected JSON content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tokens_resolve_to_their_workers() {
        let alpha = Named::new("alpha");
        let beta = Named::new("beta");
        let dispatcher =
            Dispatcher::new(local(vec![("public", alpha.clone()), ("beta-token", beta.clone())]));

        let response = dispatcher.dispatch(text_request(None, "a")).await.unwrap();
        assert_eq!(content(&response)["worker"], "alpha");

        let response = dispatcher
            .dispatch(text_request(Some("beta-token"), "b"))
            .await
            .unwrap();
        assert_eq!(content(&response)["worker"], "beta");

        assert_eq!(alpha.calls(), 1);
        assert_eq!(beta.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_token_is_unauthorized_before_any_work() {
        let alpha = Named::new("alpha");
        let dispatcher = Dispatcher::new(local(vec![("public", alpha.clone())]));

        let err = dispatcher
            .dispatch(text_request(Some("stolen"), "a"))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Unauthorized));
        assert_eq!(alpha.calls(), 0);
    }

    #[tokio::test]
    async fn test_forwarded_payload() {
        let alpha = Named::new("alpha");
        let dispatcher = Dispatcher::new(local(vec![("public", alpha)]));

        let mut request = text_request(Some("public"), "Tere");
        request.application = Some("web-demo".into());
        request.body.insert("token".into(), json!("leaked"));

        let response = dispatcher.dispatch(request).await.unwrap();

        assert_eq!(
            content(&response)["request"],
            json!({ "text": "Tere", "application": "web-demo" })
        );
    }

    #[tokio::test]
    async fn test_missing_text_is_forwarded_as_null() {
        let alpha = Named::new("alpha");
        let dispatcher = Dispatcher::new(local(vec![("public", alpha)]));

        let response = dispatcher.dispatch(DispatchRequest::default()).await.unwrap();

        assert_eq!(
            content(&response)["request"],
            json!({ "text": null, "application": null })
        );
    }

    #[tokio::test]
    async fn test_scalar_text_is_stringified() {
        let dispatcher = Dispatcher::new(local(vec![("public", Named::new("alpha"))]));
        let mut request = DispatchRequest::default();
        request.body.insert("text".into(), json!(42));

        let response = dispatcher.dispatch(request).await.unwrap();

        assert_eq!(content(&response)["request"]["text"], "42");
    }

    #[tokio::test]
    async fn test_structured_text_is_rejected() {
        let dispatcher = Dispatcher::new(local(vec![("public", Named::new("alpha"))]));
        let mut request = DispatchRequest::default();
        request.body.insert("text".into(), json!(["a", "b"]));

        let err = dispatcher.dispatch(request).await.unwrap_err();

        assert!(matches!(err, DispatchError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_application_header_can_be_required() {
        let alpha = Named::new("alpha");
        let config = local(vec![("public", alpha.clone())]).with_application_required(true);
        let dispatcher = Dispatcher::new(config);

        let err = dispatcher.dispatch(text_request(None, "a")).await.unwrap_err();
        assert!(matches!(err, DispatchError::BadRequest(_)));
        assert_eq!(alpha.calls(), 0);

        let mut request = text_request(None, "a");
        request.application = Some("cli".into());
        assert!(dispatcher.dispatch(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_local_mode_ignores_priority() {
        let dispatcher = Dispatcher::new(local(vec![("public", Named::new("alpha"))]));
        let huge = "x".repeat(50_000);

        assert!(dispatcher.dispatch(text_request(None, &huge)).await.is_ok());
    }

    #[tokio::test]
    async fn test_remote_text_too_long() {
        let dispatcher = Dispatcher::new(remote(10, 20000));
        let text = "ä".repeat(20001);

        let err = dispatcher.dispatch(text_request(None, &text)).await.unwrap_err();

        assert!(matches!(
            err,
            DispatchError::PayloadTooLarge { length: 20001, .. }
        ));
        assert_eq!(err.to_string(), "The text is too long (20001 characters).");
    }

    #[test]
    fn test_remote_tokens_resolve_to_their_queues() {
        let broker = BrokerSettings {
            url: "amqp://127.0.0.1:1/%2f".into(),
            exchange: "switchyard".into(),
            limits: PriorityLimits::default(),
        };
        let queues = HashMap::from([
            ("public".to_string(), "tokenize".to_string()),
            ("vip".to_string(), "tokenize-fast".to_string()),
        ]);
        let core = Core::new(ServiceConfig::remote(queues, broker).unwrap());

        for (token, expected) in [("public", "tokenize"), ("vip", "tokenize-fast")] {
            match core.resolve(token) {
                Some(Target::Remote { queue, limits, .. }) => {
                    assert_eq!(queue, expected);
                    assert_eq!(limits, PriorityLimits::default());
                }
                _ => panic!("token {token} did not resolve to a queue"),
            }
        }
        assert!(core.resolve("other").is_none());
    }

    #[tokio::test]
    async fn test_remote_unknown_token() {
        let dispatcher = Dispatcher::new(remote(10, 20000));

        let err = dispatcher
            .dispatch(text_request(Some("nope"), "a"))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Unauthorized));
    }

    struct Uppercase;

    impl TextService for Uppercase {
        fn pre_process(&self, mut request: Request) -> Result<Request, DispatchError> {
            let text = request
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| DispatchError::BadRequest("No text provided".into()))?
                .to_uppercase();
            request.insert("text".into(), json!(text));
            Ok(request)
        }

        fn post_process(&self, mut response: Response) -> Result<Response, DispatchError> {
            response.http_status_code = 201;
            Ok(response)
        }
    }

    #[tokio::test]
    async fn test_text_service_hooks() {
        let dispatcher =
            Dispatcher::with_service(local(vec![("public", Named::new("alpha"))]), Uppercase);

        let response = dispatcher.dispatch(text_request(None, "tere")).await.unwrap();

        assert_eq!(response.http_status_code, 201);
        assert_eq!(content(&response)["request"]["text"], "TERE");

        let err = dispatcher
            .dispatch(DispatchRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::BadRequest(_)));
    }

    /// Splits text into one subrequest per sentence and joins the answers.
    struct Sentences;

    impl MultiService for Sentences {
        fn pre_process(&self, request: Request) -> Result<Vec<Request>, DispatchError> {
            let text = request.get("text").and_then(Value::as_str).unwrap_or("");
            Ok(tokenize(text)
                .into_iter()
                .map(|sentence| {
                    let mut sub = request.clone();
                    sub.insert("text".into(), json!(sentence.join(" ")));
                    sub
                })
                .collect())
        }

        fn post_process(&self, responses: Vec<Response>) -> Result<Response, DispatchError> {
            let merged: Vec<Value> = responses
                .iter()
                .map(|response| match &response.content {
                    Some(Content::Json(value)) => value["n"].clone(),
                    _ => Value::Null,
                })
                .collect();
            Ok(Response::json(json!(merged)))
        }
    }

    /// Numbers requests in arrival order and records batch sizes.
    struct Counter {
        next: AtomicUsize,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Worker for Counter {
        async fn process_one(&self, _request: Request) -> Result<Response, WorkerError> {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            Ok(Response::json(json!({ "n": n })))
        }

        async fn process_many(&self, requests: Vec<Request>) -> Result<Vec<Response>, WorkerError> {
            process_in_batches(self, requests).await
        }
    }

    #[async_trait]
    impl BatchWorker for Counter {
        fn batch_size(&self) -> BatchSize {
            BatchSize::new(2).unwrap()
        }

        async fn process_batch(&self, batch: Vec<Request>) -> Result<Vec<Response>, WorkerError> {
            self.batches.lock().unwrap().push(batch.len());
            let mut responses = Vec::new();
            for request in batch {
                responses.push(self.process_one(request).await?);
            }
            Ok(responses)
        }
    }

    #[tokio::test]
    async fn test_multi_dispatch_local() {
        let counter = Arc::new(Counter {
            next: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
        });
        let config = ServiceConfig::local(HashMap::from([(
            "public".to_string(),
            WorkerHandle::Batched(counter.clone()),
        )]))
        .unwrap();
        let dispatcher = MultiDispatcher::new(config, Sentences);

        let response = dispatcher
            .dispatch(text_request(None, "Üks. Kaks! Kolm? Neli."))
            .await
            .unwrap();

        assert_eq!(content(&response), &json!([0, 1, 2, 3]));
        assert_eq!(*counter.batches.lock().unwrap(), vec![2, 2]);
    }

    #[tokio::test]
    async fn test_multi_dispatch_remote_too_many_subrequests() {
        let dispatcher = MultiDispatcher::new(remote(2, 3), Sentences);

        let err = dispatcher
            .dispatch(text_request(None, "A. B. C. D."))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "The request is too long (4 elements).");
    }

    #[tokio::test]
    async fn test_local_prepare_is_a_no_op() {
        let dispatcher = Dispatcher::new(local(vec![("public", Named::new("alpha"))]));

        assert!(dispatcher.prepare().await.is_ok());
        dispatcher.close().await;
    }
}
