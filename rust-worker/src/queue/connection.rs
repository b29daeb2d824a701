//! Broker session management over AMQP.
//!
//! `BrokerConnection` owns one connection and channel to a single virtual
//! host. It is the only place that touches low-level session state; retry
//! around individual operations lives in `QueueGateway`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::error::BrokerError;
use super::types::{QueueArguments, RawDelivery};

/// Operations on one broker session.
///
/// Implementations hold at most one live channel. `generation` increases on
/// every successful `connect`, so delivery handles can be tied to the
/// connection they were fetched on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// (Re)establish the session, replacing any previous channel.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Close the session. Failures are logged and swallowed.
    async fn disconnect(&self);

    fn generation(&self) -> u64;

    async fn declare_queue(&self, queue: &str, arguments: &QueueArguments)
        -> Result<(), BrokerError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError>;

    async fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<RawDelivery>, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

/// Where and as whom to connect.
#[derive(Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat in seconds negotiated with the broker
    pub heartbeat: u16,
}

impl BrokerSettings {
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat),
                ..Default::default()
            },
        }
    }
}

/// Bounded, fixed-delay retry for establishing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Failed,
}

/// A single AMQP connection and channel bound to one virtual host.
pub struct BrokerConnection {
    settings: BrokerSettings,
    policy: ConnectPolicy,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    generation: AtomicU64,
    failed: AtomicBool,
}

impl BrokerConnection {
    /// Create an unconnected session. Call `connect` before use.
    pub fn new(settings: BrokerSettings, policy: ConnectPolicy) -> Self {
        Self {
            settings,
            policy,
            connection: RwLock::new(None),
            channel: RwLock::new(None),
            generation: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        let channel = self.channel.read().await;
        match channel.as_ref() {
            Some(ch) if ch.status().connected() => ConnectionState::Connected,
            _ if self.failed.load(Ordering::SeqCst) => ConnectionState::Failed,
            _ => ConnectionState::Unconnected,
        }
    }

    async fn open(&self) -> Result<(Connection, Channel), lapin::Error> {
        let conn =
            Connection::connect_uri(self.settings.amqp_uri(), ConnectionProperties::default())
                .await?;
        let ch = conn.create_channel().await?;

        // Only one unacknowledged message in flight per connection
        ch.basic_qos(1, BasicQosOptions::default()).await?;

        Ok((conn, ch))
    }

    async fn channel(&self) -> Result<Channel, BrokerError> {
        let channel = self.channel.read().await;
        match channel.as_ref() {
            Some(ch) if ch.status().connected() => Ok(ch.clone()),
            _ => Err(BrokerError::NotConnected),
        }
    }
}

#[async_trait]
impl BrokerSession for BrokerConnection {
    async fn connect(&self) -> Result<(), BrokerError> {
        // Drop whatever is left of the previous session first
        self.disconnect().await;

        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            info!(
                host = %self.settings.host,
                port = self.settings.port,
                vhost = %self.settings.vhost,
                attempt = attempt,
                "rabbitmq_connecting"
            );

            match self.open().await {
                Ok((conn, ch)) => {
                    *self.connection.write().await = Some(conn);
                    *self.channel.write().await = Some(ch);
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    self.failed.store(false, Ordering::SeqCst);

                    info!(
                        vhost = %self.settings.vhost,
                        generation = generation,
                        prefetch_count = 1,
                        "rabbitmq_connected"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        vhost = %self.settings.vhost,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        "rabbitmq_connect_attempt_failed"
                    );
                    if attempt < max_attempts {
                        sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }

        self.failed.store(true, Ordering::SeqCst);
        error!(
            vhost = %self.settings.vhost,
            attempts = max_attempts,
            "rabbitmq_connect_failed"
        );
        Err(BrokerError::ConnectExhausted {
            attempts: max_attempts,
        })
    }

    async fn disconnect(&self) {
        let mut connection = self.connection.write().await;
        let mut channel = self.channel.write().await;

        if let Some(ch) = channel.take() {
            if ch.status().connected() {
                if let Err(e) = ch.close(200, "Normal shutdown").await {
                    warn!(error = %e, "rabbitmq_channel_close_error");
                }
            }
        }

        if let Some(conn) = connection.take() {
            if conn.status().connected() {
                if let Err(e) = conn.close(200, "Normal shutdown").await {
                    warn!(error = %e, "rabbitmq_connection_close_error");
                }
            }
            debug!(vhost = %self.settings.vhost, "rabbitmq_disconnected");
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn declare_queue(
        &self,
        queue: &str,
        arguments: &QueueArguments,
    ) -> Result<(), BrokerError> {
        let ch = self.channel().await?;
        ch.queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            field_table(arguments),
        )
        .await?;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let ch = self.channel().await?;
        ch.queue_delete(queue, QueueDeleteOptions::default()).await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        let ch = self.channel().await?;
        ch.basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            body,
            BasicProperties::default()
                .with_delivery_mode(2) // Persistent
                .with_content_type("application/json".into()),
        )
        .await?
        .await?;
        Ok(())
    }

    async fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<RawDelivery>, BrokerError> {
        let ch = self.channel().await?;
        let message = ch
            .basic_get(queue, BasicGetOptions { no_ack: auto_ack })
            .await?;

        Ok(message.map(|mut m| RawDelivery {
            tag: m.delivery.delivery_tag,
            body: std::mem::take(&mut m.delivery.data),
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let ch = self.channel().await?;
        ch.basic_ack(delivery_tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let ch = self.channel().await?;
        ch.basic_nack(
            delivery_tag,
            BasicNackOptions {
                requeue,
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }
}

/// Convert declared queue arguments to an AMQP field table.
fn field_table(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();

    if let Some(row_count) = arguments.row_count {
        table.insert("row_count".into(), AMQPValue::LongLongInt(row_count as i64));
    }
    if let Some(jobuid) = &arguments.jobuid {
        table.insert("jobuid".into(), AMQPValue::LongString(jobuid.clone().into()));
    }
    for (key, value) in &arguments.extra {
        table.insert(key.clone().into(), amqp_value(value));
    }

    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(s.clone().into()),
        other => AMQPValue::LongString(other.to_string().into()),
    }
}
