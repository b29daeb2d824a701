//! Mail List Shield worker - fair multi-queue email validation.
//!
//! This library provides the modules shared by the two binaries:
//! - `maillistshield-worker`: drains job queues and dispatches validation
//! - `maillistshield-queue-admin`: operator CLI for queue inspection and cleanup
//!
//! ## Architecture
//!
//! ```text
//! job-* queues → PollLoop → DispatchRouter → validator pool
//!                    ↓
//!              *-results queues (results vhost)
//! ```

pub mod config;
pub mod dispatch;
pub mod heartbeat;
pub mod poll_loop;
pub mod processor;
pub mod queue;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use dispatch::{DispatchError, DispatchRouter};
pub use poll_loop::{LoopSettings, LoopState, PauseSwitch, PollLoop, RoundReport};
pub use processor::{EmailProcessor, ProcessOutcome};
pub use queue::{
    BrokerConnection, ConnectPolicy, GatewayError, ManagementClient, Message, QueueGateway,
};
