//! Sentence and word tokenizer used by the bundled worker binary.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{process_in_batches, BatchSize, BatchWorker, Request, Worker};
use crate::error::WorkerError;
use crate::response::Response;

const SENTENCE_END: [char; 3] = ['.', '!', '?'];
const TRAILING_PUNCTUATION: [char; 8] = ['.', '!', '?', ',', ';', ':', ')', '"'];

/// Splits `text` into sentences of whitespace-separated tokens.
///
/// Responds with `{"text": [["Tere", "!"], ...]}`.
#[derive(Debug, Clone)]
pub struct WhitespaceTokenizer {
    batch_size: BatchSize,
}

impl WhitespaceTokenizer {
    pub fn new() -> Self {
        Self {
            batch_size: BatchSize(std::num::NonZeroUsize::MIN),
        }
    }

    pub fn with_batch_size(batch_size: usize) -> Result<Self, WorkerError> {
        Ok(Self {
            batch_size: BatchSize::new(batch_size)?,
        })
    }

    fn respond(&self, request: &Request) -> Response {
        match request.get("text") {
            Some(Value::String(text)) => {
                let sentences = tokenize(text);
                debug!(
                    text_length = text.chars().count(),
                    sentences = sentences.len(),
                    "tokenizer_request_processed"
                );
                Response::json(json!({ "text": sentences }))
            }
            Some(Value::Null) | None => Response::error(400, "No text provided"),
            Some(_) => Response::error(400, "Field 'text' must be a string"),
        }
    }
}

impl Default for WhitespaceTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Worker for WhitespaceTokenizer {
    async fn process_one(&self, request: Request) -> Result<Response, WorkerError> {
        Ok(self.respond(&request))
    }

    async fn process_many(&self, requests: Vec<Request>) -> Result<Vec<Response>, WorkerError> {
        process_in_batches(self, requests).await
    }
}

#[async_trait]
impl BatchWorker for WhitespaceTokenizer {
    fn batch_size(&self) -> BatchSize {
        self.batch_size
    }

    async fn process_batch(&self, batch: Vec<Request>) -> Result<Vec<Response>, WorkerError> {
        Ok(batch.iter().map(|request| self.respond(request)).collect())
    }
}

/// Tokenize text into sentences. Trailing punctuation becomes its own token
/// and `.`, `!` or `?` closes the current sentence.
pub fn tokenize(text: &str) -> Vec<Vec<String>> {
    let mut sentences = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for word in text.split_whitespace() {
        let core = word.trim_end_matches(TRAILING_PUNCTUATION);
        let trailing = &word[core.len()..];

        if !core.is_empty() {
            current.push(core.to_string());
        }
        current.extend(trailing.chars().map(String::from));

        if trailing.contains(SENTENCE_END) {
            sentences.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        sentences.push(current);
    }

    sentences
}
