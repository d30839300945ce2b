//! RetentionActor - Periodic buffer cleanup
//!
//! Every sweep:
//!
//! 1. Purges records enqueued before `now - retention`, whatever their state
//! 2. Purges delivered records older than the confirmation grace period
//! 3. Returns in-flight records with a stale lease to pending
//!
//! The first sweep runs at startup. A failed sweep is logged and retried on
//! the next interval; it never stops the actor.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};

use crate::buffer::{BufferStore, StorageError};
use crate::config::RetentionConfig;

use super::SHUTDOWN_TIMEOUT;
use super::messages::{RetentionCommand, RetentionStats, SweepReport};

pub struct RetentionActor {
    buffer: Arc<dyn BufferStore>,
    config: RetentionConfig,
    command_rx: mpsc::Receiver<RetentionCommand>,
    stats: RetentionStats,
}

impl RetentionActor {
    pub fn new(
        buffer: Arc<dyn BufferStore>,
        config: RetentionConfig,
        command_rx: mpsc::Receiver<RetentionCommand>,
    ) -> Self {
        Self {
            buffer,
            config,
            command_rx,
            stats: RetentionStats::default(),
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        info!(
            "starting retention actor (retention {}d, grace {:?}, every {:?})",
            self.config.retention.as_secs() / 86_400,
            self.config.confirmation_grace,
            self.config.interval
        );

        // first tick completes immediately, giving the startup sweep
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    let _ = self.sweep().await;
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(RetentionCommand::RunNow { respond_to }) => {
                        debug!("received RunNow command");
                        let result = self.sweep().await;
                        if let Some(tx) = respond_to {
                            let _ = tx.send(result);
                        }
                    }

                    Some(RetentionCommand::GetStats { respond_to }) => {
                        let _ = respond_to.send(self.stats.clone());
                    }

                    Some(RetentionCommand::Shutdown { respond_to }) => {
                        debug!("received shutdown command");
                        shutdown_ack = Some(respond_to);
                        break;
                    }

                    None => {
                        warn!("command channel closed, shutting down");
                        break;
                    }
                }
            }
        }

        info!("retention actor stopped");
        if let Some(tx) = shutdown_ack {
            let _ = tx.send(());
        }
    }

    async fn sweep(&mut self) -> Result<SweepReport, StorageError> {
        let result = self.try_sweep().await;

        self.stats.last_sweep = Some(Utc::now());
        match &result {
            Ok(report) => {
                self.stats.sweeps += 1;
                self.stats.total_expired += report.expired;
                self.stats.total_confirmed += report.confirmed;
                self.stats.total_requeued += report.requeued;

                if report.expired > 0 {
                    warn!(
                        "retention removed {} records that were never confirmed",
                        report.expired
                    );
                }
                debug!(
                    "sweep complete: {} expired, {} confirmed, {} requeued",
                    report.expired, report.confirmed, report.requeued
                );
            }
            Err(e) => {
                self.stats.failed_sweeps += 1;
                self.stats.last_error = Some(e.to_string());
                error!("retention sweep failed, will retry next interval: {}", e);
            }
        }

        result
    }

    async fn try_sweep(&self) -> Result<SweepReport, StorageError> {
        let retention = to_chrono(self.config.retention);
        let grace = to_chrono(self.config.confirmation_grace);

        let outcome = self.buffer.purge_older_than(retention, grace).await?;

        let lease_cutoff = Utc::now()
            .checked_sub_signed(to_chrono(self.config.in_flight_lease))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let requeued = self.buffer.requeue_in_flight(lease_cutoff).await?;
        if requeued > 0 {
            warn!("returned {} stale in-flight records to pending", requeued);
        }

        Ok(SweepReport {
            expired: outcome.expired,
            confirmed: outcome.confirmed,
            requeued,
        })
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Handle for controlling the RetentionActor
#[derive(Clone)]
pub struct RetentionHandle {
    sender: mpsc::Sender<RetentionCommand>,
}

impl RetentionHandle {
    pub fn spawn(buffer: Arc<dyn BufferStore>, config: RetentionConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = RetentionActor::new(buffer, config, cmd_rx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Run a sweep now and wait for its report.
    pub async fn run_now(&self) -> Result<SweepReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RetentionCommand::RunNow {
                respond_to: Some(tx),
            })
            .await
            .context("failed to send RunNow command")?;

        let report = rx.await.context("failed to receive sweep result")??;
        Ok(report)
    }

    /// Queue a sweep without waiting for it.
    pub fn request_run(&self) -> Result<()> {
        self.sender
            .try_send(RetentionCommand::RunNow { respond_to: None })
            .context("retention actor is not accepting commands")
    }

    pub async fn get_stats(&self) -> Option<RetentionStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RetentionCommand::GetStats { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RetentionCommand::Shutdown { respond_to: tx })
            .await
            .is_err()
        {
            return;
        }

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, rx).await.is_err() {
            warn!("retention actor did not stop within {:?}", SHUTDOWN_TIMEOUT);
        }
    }
}
