//! Poll loop - fair round-robin draining of every discovered job queue.
//!
//! ```text
//!            ┌──────── pause flag set ────────┐
//!            ↓                                │
//!         Paused ──sleep interval──→ Discovering ──no queues: sleep interval──┐
//!                                        │  ↑                                 │
//!                                        │  └─────────────────────────────────┘
//!                                        ↓
//!                                  DrainingRound ──→ Pacing ──sleep remainder──→ Discovering
//! ```
//!
//! One round visits every discovered queue once and pulls up to
//! `rows_per_round` messages from each. The queue list is re-read every
//! round, since job queues come and go.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use crate::processor::{EmailProcessor, ProcessOutcome};
use crate::queue::QueueGateway;

/// Shared pause flag. While set, the loop idles one interval at a time.
#[derive(Debug, Clone, Default)]
pub struct PauseSwitch(Arc<AtomicBool>);

impl PauseSwitch {
    pub fn new(paused: bool) -> Self {
        Self(Arc::new(AtomicBool::new(paused)))
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, paused: bool) {
        self.0.store(paused, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub rows_per_round: usize,
    pub polling_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Paused,
    Discovering,
    DrainingRound { queues: Vec<String>, started: Instant },
    Pacing { started: Instant },
}

/// Counters for one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub queues: usize,
    pub empty_fetches: usize,
    pub fetch_errors: usize,
    pub published: usize,
    pub requeued: usize,
    pub malformed: usize,
    pub settle_errors: usize,
}

/// How long to sleep after a round that took `elapsed`.
///
/// `None` when the round used up the whole interval; overruns are not
/// made up for.
pub fn pacing_delay(elapsed: Duration, interval: Duration) -> Option<Duration> {
    interval.checked_sub(elapsed).filter(|d| !d.is_zero())
}

pub struct PollLoop {
    source: QueueGateway,
    processor: EmailProcessor,
    settings: LoopSettings,
    pause: PauseSwitch,
}

impl PollLoop {
    pub fn new(
        source: QueueGateway,
        processor: EmailProcessor,
        settings: LoopSettings,
        pause: PauseSwitch,
    ) -> Self {
        Self {
            source,
            processor,
            settings,
            pause,
        }
    }

    pub fn source(&self) -> &QueueGateway {
        &self.source
    }

    pub fn processor(&self) -> &EmailProcessor {
        &self.processor
    }

    /// Run forever. Stop by dropping the future.
    pub async fn run(&self) {
        info!(
            vhost = %self.source.vhost(),
            rows_per_round = self.settings.rows_per_round,
            polling_interval_seconds = self.settings.polling_interval.as_secs(),
            "poll_loop_started"
        );

        let mut state = LoopState::Discovering;
        loop {
            state = self.step(state).await;
        }
    }

    /// Perform one state transition.
    pub async fn step(&self, state: LoopState) -> LoopState {
        let interval = self.settings.polling_interval;

        match state {
            LoopState::Paused => {
                sleep(interval).await;
                LoopState::Discovering
            }
            LoopState::Discovering => {
                if self.pause.is_paused() {
                    info!("poll_loop_paused");
                    return LoopState::Paused;
                }

                let started = Instant::now();
                let queues = self.source.discover_queues().await;
                if queues.is_empty() {
                    debug!(vhost = %self.source.vhost(), "poll_loop_no_queues");
                    sleep(interval).await;
                    return LoopState::Discovering;
                }

                debug!(queues = ?queues, "poll_loop_queues_discovered");
                LoopState::DrainingRound { queues, started }
            }
            LoopState::DrainingRound { queues, started } => {
                let report = self.run_round(&queues).await;
                info!(
                    queues = report.queues,
                    published = report.published,
                    requeued = report.requeued,
                    malformed = report.malformed,
                    empty_fetches = report.empty_fetches,
                    fetch_errors = report.fetch_errors,
                    settle_errors = report.settle_errors,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "poll_loop_round_complete"
                );
                LoopState::Pacing { started }
            }
            LoopState::Pacing { started } => {
                if let Some(delay) = pacing_delay(started.elapsed(), interval) {
                    sleep(delay).await;
                }
                LoopState::Discovering
            }
        }
    }

    /// Visit each queue once, pulling up to `rows_per_round` messages.
    ///
    /// An empty fetch does not end the visit early; every attempt is
    /// independent.
    pub async fn run_round(&self, queues: &[String]) -> RoundReport {
        let mut report = RoundReport {
            queues: queues.len(),
            ..Default::default()
        };

        for queue in queues {
            debug!(
                queue = %queue,
                rows_per_round = self.settings.rows_per_round,
                "poll_loop_queue_visit"
            );
            for _ in 0..self.settings.rows_per_round {
                self.process_next(queue, &mut report).await;
            }
        }

        report
    }

    async fn process_next(&self, queue: &str, report: &mut RoundReport) {
        let message = match self.source.fetch_message(queue, false).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(queue = %queue, "poll_loop_queue_empty");
                report.empty_fetches += 1;
                return;
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "poll_loop_fetch_failed");
                report.fetch_errors += 1;
                return;
            }
        };

        let outcome = self.processor.process_message(&message).await;
        let settled = match &outcome {
            ProcessOutcome::Published => {
                report.published += 1;
                self.source.acknowledge(&message).await
            }
            ProcessOutcome::Failed(_) => {
                report.requeued += 1;
                self.source.reject(&message, true).await
            }
            ProcessOutcome::Malformed(_) => {
                report.malformed += 1;
                self.source.reject(&message, false).await
            }
        };

        // The broker redelivers anything left unsettled once the channel goes
        if let Err(e) = settled {
            report.settle_errors += 1;
            error!(
                queue = %queue,
                delivery_tag = ?message.delivery_tag(),
                outcome = outcome.as_str(),
                error = %e,
                "poll_loop_settle_failed"
            );
        }

        debug!(
            queue = %queue,
            row_number = ?message.row_number(),
            total_rows = ?message.total_rows(),
            outcome = outcome.as_str(),
            "poll_loop_message_processed"
        );
    }
}
