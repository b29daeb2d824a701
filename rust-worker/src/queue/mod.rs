//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - `BrokerConnection`: one AMQP session per virtual host, with bounded reconnect
//! - `ManagementClient`: management HTTP API for discovery and counts
//! - `QueueGateway`: fetch/ack/reject/publish wrapped in a reconnect-and-retry envelope
//!
//! ## Architecture
//!
//! ```text
//! job vhost:     job-* queues ──fetch──→ PollLoop ──ack/reject──→ job-* queues
//! results vhost:                         PollLoop ──publish────→ *-results queues
//! ```

pub mod connection;
pub mod error;
pub mod gateway;
pub mod management;
pub mod types;

pub use connection::{BrokerConnection, BrokerSession, BrokerSettings, ConnectPolicy, ConnectionState};
pub use error::{BrokerError, GatewayError, ManagementError};
pub use gateway::{QueueGateway, DRAIN_TIMEOUT};
pub use management::{ManagementApi, ManagementClient};
pub use types::{
    DeliveryHandle, Message, MessageCountKind, MessageCounts, QueueArguments, QueueInfo,
    RawDelivery,
};
