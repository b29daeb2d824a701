//! Round-robin dispatch of validation requests to the worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No validation workers configured")]
    NoWorkers,

    #[error("Validation request to {worker} timed out after {timeout_ms}ms")]
    Timeout { worker: String, timeout_ms: u64 },

    #[error("Validation request to {worker} failed: {source}")]
    Request {
        worker: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    email: &'a str,
    api_key: &'a str,
}

/// Round-robin selector over a fixed list of validation endpoints.
///
/// The cursor is local to this router; separate worker processes each keep
/// their own.
pub struct DispatchRouter {
    client: Client,
    workers: Vec<String>,
    api_key: String,
    timeout: Duration,
    cursor: AtomicUsize,
}

impl DispatchRouter {
    pub fn new(
        client: Client,
        workers: Vec<String>,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        if workers.is_empty() {
            return Err(DispatchError::NoWorkers);
        }

        Ok(Self {
            client,
            workers,
            api_key,
            timeout,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Advance the cursor and return the endpoint it pointed at.
    pub fn next_worker(&self) -> &str {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index]
    }

    /// Validate one email on the next worker and return its JSON verbatim.
    ///
    /// Exactly one cursor step per call, whatever the outcome. Failures are
    /// returned to the caller, never retried here.
    pub async fn validate(&self, email: &str) -> Result<Value, DispatchError> {
        let worker = self.next_worker();
        let url = format!("{worker}/validate");

        debug!(worker = %worker, "validation_request_starting");

        let result = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&ValidateRequest {
                email,
                api_key: &self.api_key,
            })
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        let response = match result {
            Ok(response) => response,
            Err(e) => return Err(self.request_error(worker, e)),
        };

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| self.request_error(worker, e))?;

        debug!(worker = %worker, "validation_request_complete");
        Ok(body)
    }

    fn request_error(&self, worker: &str, e: reqwest::Error) -> DispatchError {
        if e.is_timeout() {
            error!(
                worker = %worker,
                timeout_seconds = self.timeout.as_secs_f64(),
                error = %e,
                "validation_request_timeout"
            );
            DispatchError::Timeout {
                worker: worker.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            error!(worker = %worker, error = %e, "validation_request_error");
            DispatchError::Request {
                worker: worker.to_string(),
                source: e,
            }
        }
    }
}
