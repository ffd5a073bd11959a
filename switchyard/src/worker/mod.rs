//! Worker contract implemented by pluggable business logic.
//!
//! A worker comes in two flavours:
//! - [`Worker`]: handles one request at a time
//! - [`BatchWorker`]: additionally handles up to `batch_size` requests in one call
//!
//! [`WorkerHandle`] wraps either flavour so the dispatcher and the queue
//! worker can pick the right code path without inspecting types at runtime.

pub mod tokenizer;

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::WorkerError;
use crate::response::Response;

pub use tokenizer::WhitespaceTokenizer;

/// A single structured request as forwarded by the dispatcher.
pub type Request = Map<String, Value>;

/// Single-request processing contract.
///
/// Errors returned here are not converted into responses; they abort the
/// calling context. Workers that want to report a failure to the caller
/// should return a [`Response`] with a non-success status instead.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn process_one(&self, request: Request) -> Result<Response, WorkerError>;

    /// Process requests one after another, preserving order.
    async fn process_many(&self, requests: Vec<Request>) -> Result<Vec<Response>, WorkerError> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.process_one(request).await?);
        }
        Ok(responses)
    }
}

/// Positive batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSize(NonZeroUsize);

impl BatchSize {
    pub fn new(size: usize) -> Result<Self, WorkerError> {
        NonZeroUsize::new(size)
            .map(BatchSize)
            .ok_or(WorkerError::InvalidBatchSize(size))
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

/// Worker that can process several requests in one call.
///
/// Implementors override [`Worker::process_many`] with
/// [`process_in_batches`] so that direct calls are chunked by `batch_size`
/// the same way [`WorkerHandle::process_many`] chunks them.
#[async_trait]
pub trait BatchWorker: Worker {
    fn batch_size(&self) -> BatchSize;

    /// Process up to `batch_size` requests, returning exactly one response
    /// per request in the same order.
    async fn process_batch(&self, batch: Vec<Request>) -> Result<Vec<Response>, WorkerError>;
}

/// Split `requests` into consecutive chunks of `batch_size` and run each
/// through [`BatchWorker::process_batch`], concatenating the results.
pub async fn process_in_batches<W>(
    worker: &W,
    requests: Vec<Request>,
) -> Result<Vec<Response>, WorkerError>
where
    W: BatchWorker + ?Sized,
{
    let batch_size = worker.batch_size().get();
    let mut responses = Vec::with_capacity(requests.len());
    let mut remaining = requests.into_iter();

    loop {
        let chunk: Vec<Request> = remaining.by_ref().take(batch_size).collect();
        if chunk.is_empty() {
            break;
        }

        let expected = chunk.len();
        let processed = worker.process_batch(chunk).await?;
        if processed.len() != expected {
            return Err(WorkerError::BatchLengthMismatch {
                expected,
                actual: processed.len(),
            });
        }
        responses.extend(processed);
    }

    Ok(responses)
}

/// A worker together with its capability.
#[derive(Clone)]
pub enum WorkerHandle {
    Single(Arc<dyn Worker>),
    Batched(Arc<dyn BatchWorker>),
}

impl WorkerHandle {
    pub fn single(worker: impl Worker + 'static) -> Self {
        WorkerHandle::Single(Arc::new(worker))
    }

    pub fn batched(worker: impl BatchWorker + 'static) -> Self {
        WorkerHandle::Batched(Arc::new(worker))
    }

    /// Largest number of requests handed over in one call.
    pub fn batch_size(&self) -> usize {
        match self {
            WorkerHandle::Single(_) => 1,
            WorkerHandle::Batched(worker) => worker.batch_size().get(),
        }
    }

    pub async fn process_one(&self, request: Request) -> Result<Response, WorkerError> {
        match self {
            WorkerHandle::Single(worker) => worker.process_one(request).await,
            WorkerHandle::Batched(worker) => worker.process_one(request).await,
        }
    }

    pub async fn process_many(&self, requests: Vec<Request>) -> Result<Vec<Response>, WorkerError> {
        match self {
            WorkerHandle::Single(worker) => worker.process_many(requests).await,
            WorkerHandle::Batched(worker) => process_in_batches(worker.as_ref(), requests).await,
        }
    }

    /// Process an already-formed batch of at most `batch_size` requests.
    pub async fn process_batch(&self, batch: Vec<Request>) -> Result<Vec<Response>, WorkerError> {
        let expected = batch.len();
        let responses = match self {
            WorkerHandle::Single(worker) => worker.process_many(batch).await?,
            WorkerHandle::Batched(worker) => worker.process_batch(batch).await?,
        };

        if responses.len() != expected {
            return Err(WorkerError::BatchLengthMismatch {
                expected,
                actual: responses.len(),
            });
        }
        Ok(responses)
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerHandle::Single(_) => f.write_str("WorkerHandle::Single"),
            WorkerHandle::Batched(worker) => f
                .debug_struct("WorkerHandle::Batched")
                .field("batch_size", &worker.batch_size().get())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn request(n: usize) -> Request {
        let mut request = Request::new();
        request.insert("n".into(), json!(n));
        request
    }

    fn echo(request: &Request) -> Response {
        Response::json(json!({ "echo": request["n"] }))
    }

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        async fn process_one(&self, request: Request) -> Result<Response, WorkerError> {
            Ok(echo(&request))
        }
    }

    /// Records the size of every batch it is handed.
    struct RecordingBatcher {
        size: BatchSize,
        seen: Mutex<Vec<usize>>,
    }

    impl RecordingBatcher {
        fn new(size: usize) -> Self {
            Self {
                size: BatchSize::new(size).unwrap(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Worker for RecordingBatcher {
        async fn process_one(&self, request: Request) -> Result<Response, WorkerError> {
            Ok(echo(&request))
        }

        async fn process_many(&self, requests: Vec<Request>) -> Result<Vec<Response>, WorkerError> {
            process_in_batches(self, requests).await
        }
    }

    #[async_trait]
    impl BatchWorker for RecordingBatcher {
        fn batch_size(&self) -> BatchSize {
            self.size
        }

        async fn process_batch(&self, batch: Vec<Request>) -> Result<Vec<Response>, WorkerError> {
            self.seen.lock().unwrap().push(batch.len());
            Ok(batch.iter().map(echo).collect())
        }
    }

    struct ShortBatcher;

    #[async_trait]
    impl Worker for ShortBatcher {
        async fn process_one(&self, request: Request) -> Result<Response, WorkerError> {
            Ok(echo(&request))
        }
    }

    #[async_trait]
    impl BatchWorker for ShortBatcher {
        fn batch_size(&self) -> BatchSize {
            BatchSize::new(2).unwrap()
        }

        async fn process_batch(&self, _batch: Vec<Request>) -> Result<Vec<Response>, WorkerError> {
            Ok(vec![Response::default()])
        }
    }

    #[test]
    fn test_batch_size_rejects_zero() {
        assert!(matches!(
            BatchSize::new(0),
            Err(WorkerError::InvalidBatchSize(0))
        ));
        assert_eq!(BatchSize::new(4).unwrap().get(), 4);
    }

    #[tokio::test]
    async fn test_default_process_many_matches_process_one() {
        let requests: Vec<Request> = (0..5).map(request).collect();
        let expected: Vec<Response> = requests.iter().map(echo).collect();

        let responses = Echo.process_many(requests).await.unwrap();

        assert_eq!(responses, expected);
    }

    #[tokio::test]
    async fn test_batched_process_many_chunks_in_order() {
        let batcher = Arc::new(RecordingBatcher::new(3));
        let handle = WorkerHandle::Batched(batcher.clone());
        let requests: Vec<Request> = (0..7).map(request).collect();
        let expected: Vec<Response> = requests.iter().map(echo).collect();

        let responses = handle.process_many(requests).await.unwrap();

        assert_eq!(responses, expected);
        assert_eq!(*batcher.seen.lock().unwrap(), vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_batch_worker_process_many_called_directly() {
        let batcher = RecordingBatcher::new(3);
        let requests: Vec<Request> = (0..7).map(request).collect();
        let expected: Vec<Response> = requests.iter().map(echo).collect();

        let responses = batcher.process_many(requests).await.unwrap();

        assert_eq!(responses, expected);
        assert_eq!(*batcher.seen.lock().unwrap(), vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_batched_process_many_empty_input() {
        let batcher = Arc::new(RecordingBatcher::new(3));
        let handle = WorkerHandle::Batched(batcher.clone());

        let responses = handle.process_many(Vec::new()).await.unwrap();

        assert!(responses.is_empty());
        assert!(batcher.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_short_batch_is_an_error() {
        let handle = WorkerHandle::batched(ShortBatcher);

        let err = handle.process_many(vec![request(0), request(1)]).await.unwrap_err();

        assert!(matches!(
            err,
            WorkerError::BatchLengthMismatch { expected: 2, actual: 1 }
        ));
    }

    #[tokio::test]
    async fn test_single_handle_batch_falls_back_to_sequential() {
        let handle = WorkerHandle::single(Echo);
        assert_eq!(handle.batch_size(), 1);

        let responses = handle.process_batch(vec![request(1), request(2)]).await.unwrap();

        assert_eq!(responses, vec![echo(&request(1)), echo(&request(2))]);
    }
}
