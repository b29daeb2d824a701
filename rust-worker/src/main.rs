//! Mail List Shield Worker - round-robin email validation over RabbitMQ.
//!
//! This worker discovers every job queue in the jobs virtual host, pulls a
//! fixed batch from each per round, validates each email on the next
//! validator in the pool, and publishes the result to the results vhost.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::signal;
use tracing::{info, info_span, Instrument};

use maillistshield::{
    heartbeat, telemetry, BrokerConnection, Config, ConnectPolicy, DispatchRouter,
    EmailProcessor, LoopSettings, ManagementClient, PauseSwitch, PollLoop, QueueGateway,
};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();

    info!("worker_starting");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        rabbitmq_host = %config.rabbitmq_host,
        jobs_vhost = %config.jobs_vhost(),
        results_vhost = %config.results_vhost(),
        validation_workers = config.validation_workers.len(),
        rows_per_round = config.rows_per_round,
        polling_interval_seconds = config.polling_interval_secs,
        paused = config.pause,
        heartbeat_enabled = config.uptime_monitor.is_some(),
        "config_loaded"
    );

    let span = info_span!("worker", service = %config.service_name);
    run(config).instrument(span).await
}

fn gateway(
    config: &Config,
    client: &Client,
    vhost: &str,
) -> Result<(QueueGateway, Arc<BrokerConnection>)> {
    let session = Arc::new(BrokerConnection::new(
        config.broker_settings(vhost),
        ConnectPolicy::default(),
    ));
    let management = ManagementClient::new(
        client.clone(),
        &config.rabbitmq_management_url,
        vhost,
        config.rabbitmq_username.clone(),
        config.rabbitmq_password.clone(),
    )
    .context("Failed to build management API client")?;

    let gateway = QueueGateway::new(vhost, session.clone(), Arc::new(management));
    Ok((gateway, session))
}

async fn run(config: Config) -> Result<()> {
    // Shared HTTP client for the management API, validators and heartbeat
    let client = Client::builder()
        .pool_max_idle_per_host(16)
        .build()
        .context("Failed to create HTTP client")?;

    let (jobs, jobs_session) = gateway(&config, &client, config.jobs_vhost())?;
    let (results, results_session) = gateway(&config, &client, config.results_vhost())?;

    // A failed initial connect is not fatal: every operation reconnects
    // on demand.
    for (gateway, session) in [(&jobs, &jobs_session), (&results, &results_session)] {
        if let Err(e) = gateway.connect().await {
            tracing::error!(
                vhost = %gateway.vhost(),
                connection_state = ?session.state().await,
                error = %e,
                "rabbitmq_initial_connect_failed"
            );
        }
    }

    let router = DispatchRouter::new(
        client.clone(),
        config.validation_workers.clone(),
        config.validator_api_key.clone(),
        config.validation_timeout(),
    )
    .context("Failed to create dispatch router")?;

    let heartbeat = config
        .uptime_monitor
        .clone()
        .map(|url| heartbeat::spawn(client.clone(), url, config.polling_interval()));

    let poll_loop = PollLoop::new(
        jobs,
        EmailProcessor::new(router, results),
        LoopSettings {
            rows_per_round: config.rows_per_round,
            polling_interval: config.polling_interval(),
        },
        PauseSwitch::new(config.pause),
    );

    info!("worker_ready");

    tokio::select! {
        _ = poll_loop.run() => {}
        _ = shutdown_signal() => info!("worker_stopping"),
    }

    if let Some(handle) = heartbeat {
        handle.abort();
    }
    poll_loop.source().disconnect().await;
    poll_loop.processor().results().disconnect().await;

    info!("worker_shutdown_complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
