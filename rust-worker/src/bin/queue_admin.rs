//! Mail List Shield Queue Admin - inspect and clean up job and results queues.
//!
//! Uses the same configuration as the worker. Examples:
//!
//! ```text
//! maillistshield-queue-admin list
//! maillistshield-queue-admin --vhost results counts job-42-results
//! maillistshield-queue-admin --vhost results drain job-42-results > results.jsonl
//! maillistshield-queue-admin create job-43 --row-count 1000 --jobuid 8f2c
//! QUEUE_ADMIN_VHOST=results maillistshield-queue-admin counts job-42-results --kind ready
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::Client;
use serde_json::Value;
use tracing::info;

use maillistshield::queue::QueueArguments;
use maillistshield::{telemetry, BrokerConnection, Config, ConnectPolicy, ManagementClient, QueueGateway};

#[derive(Parser)]
#[command(name = "maillistshield-queue-admin", about = "Inspect and manage worker queues")]
struct Cli {
    /// Which configured virtual host to operate on
    #[arg(long, env = "QUEUE_ADMIN_VHOST", value_enum, default_value_t = VhostRole::Jobs)]
    vhost: VhostRole,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum VhostRole {
    Jobs,
    Results,
}

#[derive(Subcommand)]
enum Command {
    /// List queue names
    List,
    /// Show message counts (all kinds, or one of ready/unacked/total)
    Counts {
        queue: String,
        #[arg(long, env = "QUEUE_ADMIN_COUNT_KIND")]
        kind: Option<String>,
    },
    /// Show the arguments a queue was declared with
    Metadata { queue: String },
    /// Declare a durable queue
    Create {
        queue: String,
        #[arg(long)]
        row_count: Option<u64>,
        #[arg(long)]
        jobuid: Option<String>,
    },
    /// Delete a queue
    Delete { queue: String },
    /// Fetch every message with auto-ack and print one JSON object per line
    Drain { queue: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_stderr();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    let vhost = match cli.vhost {
        VhostRole::Jobs => config.jobs_vhost(),
        VhostRole::Results => config.results_vhost(),
    }
    .to_string();

    let client = Client::new();
    let management = ManagementClient::new(
        client,
        &config.rabbitmq_management_url,
        &vhost,
        config.rabbitmq_username.clone(),
        config.rabbitmq_password.clone(),
    )
    .context("Failed to build management API client")?;
    let session = BrokerConnection::new(config.broker_settings(&vhost), ConnectPolicy::default());
    let gateway = QueueGateway::new(vhost.clone(), Arc::new(session), Arc::new(management));

    let needs_amqp = matches!(
        cli.command,
        Command::Create { .. } | Command::Delete { .. } | Command::Drain { .. }
    );
    if needs_amqp {
        gateway
            .connect()
            .await
            .context("Failed to connect to RabbitMQ")?;
    }

    let result = execute(&gateway, cli.command).await;

    if needs_amqp {
        gateway.disconnect().await;
    }
    result
}

async fn execute(gateway: &QueueGateway, command: Command) -> Result<()> {
    match command {
        Command::List => {
            for name in gateway.discover_queues().await {
                println!("{name}");
            }
        }
        Command::Counts { queue, kind: None } => {
            let counts = gateway
                .message_counts(&queue)
                .await
                .context("Management API did not return counts")?;
            println!("{}", serde_json::to_string(&counts)?);
        }
        Command::Counts {
            queue,
            kind: Some(kind),
        } => {
            let Some(count) = gateway.message_count_by_name(&queue, &kind).await? else {
                bail!("Management API did not return a {kind} count for {queue}");
            };
            println!("{count}");
        }
        Command::Metadata { queue } => {
            let arguments = gateway
                .queue_metadata(&queue)
                .await
                .context("Management API did not return queue metadata")?;
            println!("{}", serde_json::to_string(&arguments)?);
        }
        Command::Create {
            queue,
            row_count,
            jobuid,
        } => {
            let arguments = QueueArguments {
                row_count,
                jobuid,
                ..Default::default()
            };
            gateway.create_queue(&queue, &arguments).await?;
        }
        Command::Delete { queue } => {
            gateway.delete_queue(&queue).await?;
        }
        Command::Drain { queue } => {
            let messages = gateway.drain_queue(&queue).await;
            for message in &messages {
                println!("{}", Value::Object(message.payload.clone()));
            }
            info!(queue = %queue, retrieved = messages.len(), "queue_drained");
        }
    }

    Ok(())
}
