//! Queue gateway: discovery, fetch/ack/reject, publish and introspection.
//!
//! Every AMQP operation runs inside the same reconnect envelope:
//!
//! ```text
//! attempt ──ok──────────────────────────────→ Ok
//!    │ retryable error
//!    ↓
//! connect() ──failed──→ Err(ReconnectFailed)
//!    │ ok
//!    ↓
//! attempt once more ─────────────────────────→ Ok | Err
//! ```
//!
//! Management API reads never go through the envelope. Their failures are
//! logged and degrade to empty/`None` results.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::connection::BrokerSession;
use super::error::{BrokerError, GatewayError};
use super::management::ManagementApi;
use super::types::{
    DeliveryHandle, Message, MessageCountKind, MessageCounts, QueueArguments, QueueInfo,
};

/// Default wall-clock bound for `drain_queue`.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(300);

/// Pause after an empty or failed fetch while the management API still reports messages.
const DRAIN_EMPTY_BACKOFF: Duration = Duration::from_millis(500);

/// Queue operations for one virtual host.
pub struct QueueGateway {
    vhost: String,
    session: Arc<dyn BrokerSession>,
    management: Arc<dyn ManagementApi>,
    drain_timeout: Duration,
}

impl QueueGateway {
    pub fn new(
        vhost: impl Into<String>,
        session: Arc<dyn BrokerSession>,
        management: Arc<dyn ManagementApi>,
    ) -> Self {
        Self {
            vhost: vhost.into(),
            session,
            management,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    /// Establish the underlying session.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.session.connect().await.map_err(Into::into)
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    /// Run `op`; on a retryable failure reconnect and run it exactly once more.
    async fn with_reconnect<T, F, Fut>(
        &self,
        operation: &'static str,
        op: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e.into()),
            Err(e) => {
                warn!(
                    vhost = %self.vhost,
                    operation = operation,
                    error = %e,
                    "rabbitmq_operation_failed_reconnecting"
                );
            }
        }

        if let Err(e) = self.session.connect().await {
            error!(
                vhost = %self.vhost,
                operation = operation,
                error = %e,
                "rabbitmq_reconnect_failed"
            );
            return Err(GatewayError::ReconnectFailed { operation });
        }

        op().await.map_err(|e| {
            error!(
                vhost = %self.vhost,
                operation = operation,
                error = %e,
                "rabbitmq_operation_retry_failed"
            );
            e.into()
        })
    }

    // =========================================================================
    // Discovery and introspection (management API)
    // =========================================================================

    /// Names of all queues in this virtual host. Empty on any failure.
    pub async fn discover_queues(&self) -> Vec<String> {
        match self.management.list_queues().await {
            Ok(queues) => queues.into_iter().map(|q| q.name).collect(),
            Err(e) => {
                error!(vhost = %self.vhost, error = %e, "management_list_queues_failed");
                Vec::new()
            }
        }
    }

    async fn queue_info(&self, queue: &str) -> Option<QueueInfo> {
        match self.management.queue_info(queue).await {
            Ok(info) => Some(info),
            Err(e) => {
                error!(
                    vhost = %self.vhost,
                    queue = %queue,
                    error = %e,
                    "management_queue_info_failed"
                );
                None
            }
        }
    }

    /// One message count of a queue, or `None` if the management API failed.
    pub async fn message_count(&self, queue: &str, kind: MessageCountKind) -> Option<u64> {
        self.queue_info(queue).await.map(|info| info.count(kind))
    }

    /// Like `message_count`, taking the kind by name. Unknown kinds are an error.
    pub async fn message_count_by_name(
        &self,
        queue: &str,
        kind: &str,
    ) -> Result<Option<u64>, GatewayError> {
        let kind: MessageCountKind = kind.parse()?;
        Ok(self.message_count(queue, kind).await)
    }

    pub async fn message_counts(&self, queue: &str) -> Option<MessageCounts> {
        self.queue_info(queue).await.map(|info| info.counts())
    }

    /// Arguments the queue was declared with.
    pub async fn queue_metadata(&self, queue: &str) -> Option<QueueArguments> {
        self.queue_info(queue).await.map(|info| info.arguments)
    }

    /// Number of rows the job queue was created for (`row_count` argument).
    pub async fn expected_message_count(&self, queue: &str) -> Option<u64> {
        self.queue_metadata(queue).await.and_then(|a| a.row_count)
    }

    /// Job a results queue belongs to (`jobuid` argument).
    pub async fn job_uid(&self, queue: &str) -> Option<String> {
        self.queue_metadata(queue).await.and_then(|a| a.jobuid)
    }

    // =========================================================================
    // Queue administration
    // =========================================================================

    /// Declare a durable queue. Idempotent for matching arguments.
    pub async fn create_queue(
        &self,
        queue: &str,
        arguments: &QueueArguments,
    ) -> Result<(), GatewayError> {
        self.with_reconnect("create_queue", || {
            self.session.declare_queue(queue, arguments)
        })
        .await?;

        info!(vhost = %self.vhost, queue = %queue, "rabbitmq_queue_created");
        Ok(())
    }

    pub async fn delete_queue(&self, queue: &str) -> Result<(), GatewayError> {
        self.with_reconnect("delete_queue", || self.session.delete_queue(queue))
            .await?;

        info!(vhost = %self.vhost, queue = %queue, "rabbitmq_queue_deleted");
        Ok(())
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Publish a JSON body as a persistent message.
    pub async fn publish_message<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        body: &T,
    ) -> Result<(), GatewayError> {
        let payload = serde_json::to_vec(body).map_err(GatewayError::Encode)?;

        self.with_reconnect("publish_message", || {
            self.session.publish(queue, &payload)
        })
        .await?;

        debug!(
            vhost = %self.vhost,
            queue = %queue,
            body_length = payload.len(),
            "rabbitmq_message_published"
        );
        Ok(())
    }

    /// Fetch at most one message. `Ok(None)` means the queue was empty.
    ///
    /// Without `auto_ack` the returned message carries a delivery handle
    /// and must be settled with `acknowledge` or `reject`. A body that is
    /// not a JSON object is rejected without requeue and reported as
    /// `GatewayError::Decode`.
    pub async fn fetch_message(
        &self,
        queue: &str,
        auto_ack: bool,
    ) -> Result<Option<Message>, GatewayError> {
        let delivery = self
            .with_reconnect("fetch_message", || self.session.get(queue, auto_ack))
            .await?;

        let Some(delivery) = delivery else {
            debug!(vhost = %self.vhost, queue = %queue, "rabbitmq_queue_empty");
            return Ok(None);
        };

        // Read after the fetch: a reconnect inside the envelope bumps it
        let handle = DeliveryHandle {
            tag: delivery.tag,
            generation: self.session.generation(),
        };

        match Message::decode(&delivery.body) {
            Ok(message) => {
                debug!(
                    vhost = %self.vhost,
                    queue = %queue,
                    delivery_tag = delivery.tag,
                    "rabbitmq_message_fetched"
                );
                if auto_ack {
                    Ok(Some(message))
                } else {
                    Ok(Some(message.with_handle(handle)))
                }
            }
            Err(source) => {
                error!(
                    vhost = %self.vhost,
                    queue = %queue,
                    delivery_tag = delivery.tag,
                    error = %source,
                    body_preview = %String::from_utf8_lossy(
                        &delivery.body[..delivery.body.len().min(500)]
                    ),
                    "rabbitmq_message_decode_failed"
                );
                if !auto_ack {
                    if let Err(e) = self.settle(handle, Settle::Reject { requeue: false }).await {
                        warn!(
                            queue = %queue,
                            delivery_tag = delivery.tag,
                            error = %e,
                            "rabbitmq_undecodable_reject_failed"
                        );
                    }
                }
                Err(GatewayError::Decode {
                    queue: queue.to_string(),
                    source,
                })
            }
        }
    }

    pub async fn acknowledge(&self, message: &Message) -> Result<(), GatewayError> {
        let handle = message.handle.ok_or_else(|| {
            error!(vhost = %self.vhost, "rabbitmq_ack_missing_delivery_handle");
            GatewayError::MissingDeliveryHandle
        })?;

        self.settle(handle, Settle::Ack).await
    }

    pub async fn reject(&self, message: &Message, requeue: bool) -> Result<(), GatewayError> {
        let handle = message.handle.ok_or_else(|| {
            error!(vhost = %self.vhost, "rabbitmq_reject_missing_delivery_handle");
            GatewayError::MissingDeliveryHandle
        })?;

        self.settle(handle, Settle::Reject { requeue }).await
    }

    async fn settle(&self, handle: DeliveryHandle, settle: Settle) -> Result<(), GatewayError> {
        let operation = match settle {
            Settle::Ack => "acknowledge",
            Settle::Reject { .. } => "reject",
        };

        self.with_reconnect(operation, || self.settle_once(handle, settle))
            .await?;

        match settle {
            Settle::Ack => debug!(
                vhost = %self.vhost,
                delivery_tag = handle.tag,
                "rabbitmq_message_acked"
            ),
            Settle::Reject { requeue } => debug!(
                vhost = %self.vhost,
                delivery_tag = handle.tag,
                requeue = requeue,
                "rabbitmq_message_rejected"
            ),
        }
        Ok(())
    }

    async fn settle_once(&self, handle: DeliveryHandle, settle: Settle) -> Result<(), BrokerError> {
        let current = self.session.generation();
        if handle.generation != current {
            return Err(BrokerError::StaleDelivery {
                tag: handle.tag,
                generation: handle.generation,
                current,
            });
        }

        match settle {
            Settle::Ack => self.session.ack(handle.tag).await,
            Settle::Reject { requeue } => self.session.nack(handle.tag, requeue).await,
        }
    }

    /// Fetch with auto-ack until the queue reports no ready or unacked
    /// messages, or the drain timeout elapses.
    ///
    /// Returns whatever was collected; a timeout yields a partial result.
    pub async fn drain_queue(&self, queue: &str) -> Vec<Message> {
        let started = Instant::now();
        let mut messages = Vec::new();

        loop {
            if started.elapsed() >= self.drain_timeout {
                warn!(
                    vhost = %self.vhost,
                    queue = %queue,
                    retrieved = messages.len(),
                    timeout_seconds = self.drain_timeout.as_secs(),
                    "rabbitmq_drain_timed_out"
                );
                break;
            }

            let remaining = match self.message_counts(queue).await {
                Some(counts) => counts.ready + counts.unacked,
                None => break,
            };
            if remaining == 0 {
                break;
            }

            match self.fetch_message(queue, true).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {
                    warn!(
                        vhost = %self.vhost,
                        queue = %queue,
                        reported_remaining = remaining,
                        "rabbitmq_drain_expected_more_messages"
                    );
                    sleep(DRAIN_EMPTY_BACKOFF).await;
                }
                Err(e) => {
                    error!(vhost = %self.vhost, queue = %queue, error = %e, "rabbitmq_drain_fetch_failed");
                    if matches!(e, GatewayError::ReconnectFailed { .. }) {
                        break;
                    }
                    sleep(DRAIN_EMPTY_BACKOFF).await;
                }
            }
        }

        info!(
            vhost = %self.vhost,
            queue = %queue,
            retrieved = messages.len(),
            "rabbitmq_drain_complete"
        );
        messages
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Reject { requeue: bool },
}
