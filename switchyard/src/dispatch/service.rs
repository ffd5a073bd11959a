//! Per-service hooks run around the worker call.

use serde_json::Value;

use crate::error::DispatchError;
use crate::response::Response;
use crate::worker::Request;

/// Hooks for services that forward one text request per HTTP call.
///
/// Every hook has a pass-through default.
pub trait TextService: Send + Sync + 'static {
    /// Validate or reshape the request before it reaches the worker.
    fn pre_process(&self, request: Request) -> Result<Request, DispatchError> {
        Ok(request)
    }

    /// Size used for queue priority: characters in `text`.
    fn measure(&self, request: &Request) -> usize {
        request
            .get("text")
            .and_then(Value::as_str)
            .map(|text| text.chars().count())
            .unwrap_or(0)
    }

    /// Adjust the worker's response before it is returned.
    fn post_process(&self, response: Response) -> Result<Response, DispatchError> {
        Ok(response)
    }
}

/// Hooks for services that split one HTTP call into several worker requests
/// and merge the answers back together.
pub trait MultiService: Send + Sync + 'static {
    /// Split the request into subrequests.
    fn pre_process(&self, request: Request) -> Result<Vec<Request>, DispatchError>;

    /// Merge one response per subrequest, in subrequest order, into the
    /// final response.
    fn post_process(&self, responses: Vec<Response>) -> Result<Response, DispatchError>;
}

/// Text service without any hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainText;

impl TextService for PlainText {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_measure_counts_characters() {
        let mut request = Request::new();
        assert_eq!(PlainText.measure(&request), 0);

        request.insert("text".into(), json!("Tõlge"));
        assert_eq!(PlainText.measure(&request), 5);

        request.insert("text".into(), Value::Null);
        assert_eq!(PlainText.measure(&request), 0);
    }
}
