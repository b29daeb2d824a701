//! Message processing - validate one email and publish the result.
//!
//! This module holds the per-message step of the poll loop: check the
//! required fields, send the email to the next validation worker, and
//! publish the worker's response to the message's results queue. Settling
//! the original message (ack or reject) is left to the caller.

use tracing::{error, info};

use crate::dispatch::DispatchRouter;
use crate::queue::{Message, QueueGateway};

/// Outcome of processing one message, deciding how it is settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Validated and published; acknowledge the original.
    Published,
    /// Validation or publish failed; reject with requeue.
    Failed(String),
    /// A required field is missing; reject without requeue.
    Malformed(&'static str),
}

impl ProcessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Published => "published",
            ProcessOutcome::Failed(_) => "failed",
            ProcessOutcome::Malformed(_) => "malformed",
        }
    }
}

/// Validates emails and publishes results to the results virtual host.
pub struct EmailProcessor {
    router: DispatchRouter,
    results: QueueGateway,
}

impl EmailProcessor {
    pub fn new(router: DispatchRouter, results: QueueGateway) -> Self {
        Self { router, results }
    }

    pub fn results(&self) -> &QueueGateway {
        &self.results
    }

    /// Process a single message.
    ///
    /// 1. Require `email` and `queueName`
    /// 2. Validate the email on the next worker
    /// 3. Publish the worker's response verbatim to `queueName`
    pub async fn process_message(&self, message: &Message) -> ProcessOutcome {
        let delivery_tag = message.delivery_tag();

        let Some(email) = message.email() else {
            error!(
                delivery_tag = ?delivery_tag,
                payload = %serde_json::Value::Object(message.payload.clone()),
                "message_missing_email"
            );
            return ProcessOutcome::Malformed("email");
        };
        let Some(queue_name) = message.queue_name() else {
            error!(
                delivery_tag = ?delivery_tag,
                payload = %serde_json::Value::Object(message.payload.clone()),
                "message_missing_queue_name"
            );
            return ProcessOutcome::Malformed("queueName");
        };

        let result = match self.router.validate(email).await {
            Ok(result) => result,
            Err(e) => {
                error!(email = %email, error = %e, "email_validation_failed");
                return ProcessOutcome::Failed(e.to_string());
            }
        };

        if let Err(e) = self.results.publish_message(queue_name, &result).await {
            error!(
                email = %email,
                queue = %queue_name,
                error = %e,
                "validation_result_publish_failed"
            );
            return ProcessOutcome::Failed(e.to_string());
        }

        info!(
            email = %email,
            queue = %queue_name,
            row_number = ?message.row_number(),
            total_rows = ?message.total_rows(),
            result = %result,
            "email_validation_complete"
        );

        ProcessOutcome::Published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBroker;
    use httpmock::prelude::*;
    use reqwest::Client;
    use serde_json::json;
    use std::time::Duration;

    fn processor(worker: String, results: &FakeBroker) -> EmailProcessor {
        let router = DispatchRouter::new(
            Client::new(),
            vec![worker],
            "key-123".to_string(),
            Duration::from_secs(5),
        )
        .unwrap();
        EmailProcessor::new(router, results.gateway("results"))
    }

    fn message(body: serde_json::Value) -> Message {
        Message::decode(&serde_json::to_vec(&body).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_result_is_published_to_named_queue() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/validate");
                then.status(200).json_body(json!({"valid": true}));
            })
            .await;
        let results = FakeBroker::new();

        let outcome = processor(server.base_url(), &results)
            .process_message(&message(json!({
                "email": "a@x.com",
                "queueName": "job-42-results",
                "rowNumber": 1,
                "totalRows": 1
            })))
            .await;

        assert_eq!(outcome, ProcessOutcome::Published);
        assert_eq!(
            results.published(),
            vec![("job-42-results".to_string(), json!({"valid": true}))]
        );
    }

    #[tokio::test]
    async fn test_missing_fields_are_malformed() {
        let results = FakeBroker::new();
        // The worker must never be called
        let processor = processor("http://127.0.0.1:1".to_string(), &results);

        assert_eq!(
            processor
                .process_message(&message(json!({"queueName": "job-42-results"})))
                .await,
            ProcessOutcome::Malformed("email")
        );
        assert_eq!(
            processor
                .process_message(&message(json!({"email": "a@x.com"})))
                .await,
            ProcessOutcome::Malformed("queueName")
        );
        assert!(results.published().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_worker_fails() {
        let results = FakeBroker::new();
        let outcome = processor("http://127.0.0.1:1".to_string(), &results)
            .process_message(&message(json!({
                "email": "a@x.com",
                "queueName": "job-42-results"
            })))
            .await;

        assert!(matches!(outcome, ProcessOutcome::Failed(_)));
        assert!(results.published().is_empty());
    }
}
