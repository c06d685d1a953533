use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use altec_common::AltecError;

use crate::circuit_breaker::CircuitBreaker;

/// Outcome of a single opaque call into a model service (ASR, vision-language,
/// embedding, summarization, ...). Pipelines are agnostic to which concrete model
/// backs a call — this is the seam the out-of-scope model adapters plug into.
#[derive(Clone, Debug)]
pub struct AdapterResponse {
    pub payload: serde_json::Value,
}

/// A single named operation a model adapter exposes (e.g. "transcribe", "caption").
/// Object-safe via a hand-boxed future, mirroring the teacher's `LlmCaller` trait
/// rather than reaching for an async-trait macro crate.
pub trait ModelAdapter: Send + Sync {
    fn invoke<'a>(
        &'a self,
        operation: &'a str,
        input: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterResponse, AltecError>> + Send + 'a>>;
}

/// A deterministic in-process adapter for tests: returns a canned response per
/// operation and counts invocations, the "side-effect counter external to the
/// executor" the testable-property scenarios call for.
pub struct MockAdapter {
    counters: std::sync::Mutex<std::collections::HashMap<String, u32>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self {
            counters: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocation_count(&self, operation: &str) -> u32 {
        self.counters
            .lock()
            .unwrap()
            .get(operation)
            .copied()
            .unwrap_or(0)
    }
}

impl ModelAdapter for MockAdapter {
    fn invoke<'a>(
        &'a self,
        operation: &'a str,
        input: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterResponse, AltecError>> + Send + 'a>> {
        Box::pin(async move {
            let mut counters = self.counters.lock().unwrap();
            *counters.entry(operation.to_string()).or_insert(0) += 1;
            Ok(AdapterResponse {
                payload: serde_json::json!({ "operation": operation, "echo": input }),
            })
        })
    }
}

/// Production `ModelAdapter`: each `invoke` is a `POST {base_url}/{operation}` with
/// the accumulated checkpoint as the JSON body, grounded on the teacher's
/// `llm::openai::send_chat_completion` (a bare `reqwest::Client`, status-code-driven
/// error classification, JSON request/response bodies). The concrete ASR/vision-LLM/
/// embedding/summarization services this dispatches to are out of scope (§1) — this
/// is the one seam a real deployment backs with those services.
pub struct HttpModelAdapter {
    http: reqwest::Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
}

impl HttpModelAdapter {
    pub fn new(base_url: impl Into<String>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            breaker,
        }
    }
}

impl ModelAdapter for HttpModelAdapter {
    fn invoke<'a>(
        &'a self,
        operation: &'a str,
        input: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterResponse, AltecError>> + Send + 'a>> {
        Box::pin(async move {
            // The model service is a soft dependency per task (retried within
            // `invoke_with_retry`), but a fully-down service shouldn't take every
            // in-flight task through its own retry budget — the breaker short-circuits
            // new calls once enough have already failed.
            if !self.breaker.allow() {
                return Err(AltecError::ModelAdapter {
                    message: format!("{operation}: circuit open, model adapter presumed unavailable"),
                    transient: true,
                });
            }

            let url = format!("{}/{}", self.base_url.trim_end_matches('/'), operation);
            let result = async {
                let response = self.http.post(&url).json(input).send().await.map_err(|e| {
                    AltecError::ModelAdapter {
                        message: format!("{operation}: {e}"),
                        transient: true,
                    }
                })?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    // A 5xx (or other server-side) response is the upstream's problem and
                    // worth retrying; a 4xx means the request itself was malformed and
                    // retrying it would just fail the same way.
                    return Err(AltecError::ModelAdapter {
                        message: format!("{operation}: {status}: {body}"),
                        transient: status.is_server_error(),
                    });
                }

                let payload = response.json::<serde_json::Value>().await.map_err(|e| {
                    AltecError::ModelAdapter {
                        message: format!("{operation}: malformed response: {e}"),
                        transient: true,
                    }
                })?;

                Ok(AdapterResponse { payload })
            }
            .await;

            match &result {
                Ok(_) => self.breaker.record_success(),
                Err(_) => self.breaker.record_failure(),
            }
            result
        })
    }
}
