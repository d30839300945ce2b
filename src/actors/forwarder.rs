//! ForwarderActor - Drains the buffer and delivers batches upstream
//!
//! ## Cycle
//!
//! ```text
//! IDLE ──tick / FlushNow──► DRAINING ──► SENDING ──2xx──► mark_delivered ──► IDLE
//!                                            │
//!                                            └──error──► mark_failed ──► BACKOFF ──delay──► IDLE
//! ```
//!
//! A failed delivery puts the whole batch back to pending and delays the next
//! cycle with capped exponential backoff. The wait is a `select!` branch, so a
//! `Shutdown` or `FlushNow` command interrupts it immediately.
//!
//! When a full batch is accepted the actor drains again straight away (up to
//! [`MAX_BATCHES_PER_CYCLE`] batches) to work down a backlog.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::backoff::Backoff;
use crate::buffer::{BufferStore, IngestRecord, StorageError};
use crate::config::ForwarderConfig;
use crate::health::LinkStatusStore;
use crate::uplink::{IngestBatch, UplinkClient, UplinkError};

use super::SHUTDOWN_TIMEOUT;
use super::messages::{FlushOutcome, ForwarderCommand, ForwarderState, ForwarderStats};

/// Upper bound on back-to-back batches in one cycle
pub const MAX_BATCHES_PER_CYCLE: usize = 10;

/// Why a forwarder cycle stopped early
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Uplink(#[from] UplinkError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Actor that moves buffered records to the central service
pub struct ForwarderActor {
    buffer: Arc<dyn BufferStore>,
    client: UplinkClient,
    organization_id: Option<String>,
    config: ForwarderConfig,

    /// Delivery link status, read by the health reporter
    link: LinkStatusStore,

    command_rx: mpsc::Receiver<ForwarderCommand>,

    backoff: Backoff,

    /// Set while waiting out a backoff delay
    retry_at: Option<Instant>,

    stats: ForwarderStats,
}

impl ForwarderActor {
    pub fn new(
        buffer: Arc<dyn BufferStore>,
        client: UplinkClient,
        organization_id: Option<String>,
        config: ForwarderConfig,
        link: LinkStatusStore,
        command_rx: mpsc::Receiver<ForwarderCommand>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff);
        Self {
            buffer,
            client,
            organization_id,
            config,
            link,
            command_rx,
            backoff,
            retry_at: None,
            stats: ForwarderStats::default(),
        }
    }

    #[instrument(skip(self), fields(endpoint = %self.client.endpoint()))]
    pub async fn run(mut self) {
        info!(
            "starting forwarder (interval {:?}, batch size {})",
            self.config.interval, self.config.batch_size
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown_ack = None;

        loop {
            let in_backoff = self.retry_at.is_some();
            let retry_at = self.retry_at.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;

                _ = ticker.tick(), if !in_backoff => {
                    self.run_logged_cycle().await;
                }

                _ = sleep_until(retry_at), if in_backoff => {
                    trace!("backoff elapsed");
                    self.leave_backoff();
                    self.run_logged_cycle().await;
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(ForwarderCommand::FlushNow { respond_to }) => {
                        debug!("received FlushNow command");
                        self.leave_backoff();
                        let result = self.run_cycle().await;
                        match respond_to {
                            Some(tx) => {
                                let _ = tx.send(result);
                            }
                            None => log_cycle(&result),
                        }
                    }

                    Some(ForwarderCommand::GetStats { respond_to }) => {
                        let _ = respond_to.send(self.stats.clone());
                    }

                    Some(ForwarderCommand::Shutdown { respond_to }) => {
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

        info!("forwarder stopped");
        if let Some(tx) = shutdown_ack {
            let _ = tx.send(());
        }
    }

    async fn run_logged_cycle(&mut self) {
        let result = self.run_cycle().await;
        log_cycle(&result);
    }

    fn leave_backoff(&mut self) {
        self.retry_at = None;
        self.stats.next_attempt_at = None;
        if self.stats.state == ForwarderState::Backoff {
            self.stats.state = ForwarderState::Idle;
        }
    }

    /// One IDLE → ... → IDLE pass. Returns what was delivered.
    async fn run_cycle(&mut self) -> Result<FlushOutcome, ForwardError> {
        self.stats.cycles += 1;
        let mut outcome = FlushOutcome::default();

        for _ in 0..MAX_BATCHES_PER_CYCLE {
            self.stats.state = ForwarderState::Draining;
            let records = match self.buffer.drain_batch(self.config.batch_size).await {
                Ok(records) => records,
                Err(e) => {
                    self.stats.state = ForwarderState::Idle;
                    self.stats.last_error = Some(e.to_string());
                    return Err(e.into());
                }
            };

            if records.is_empty() {
                break;
            }

            let full = records.len() >= self.config.batch_size;
            self.deliver_drained(records, &mut outcome).await?;

            if !full {
                break;
            }
        }

        self.stats.state = ForwarderState::Idle;
        Ok(outcome)
    }

    /// Send one drained batch upstream, split into one batch per organization.
    ///
    /// On an uplink failure every record of the drain that was not confirmed
    /// goes back to pending, including tenants that were not sent yet.
    async fn deliver_drained(
        &mut self,
        records: Vec<IngestRecord>,
        outcome: &mut FlushOutcome,
    ) -> Result<(), ForwardError> {
        let mut batches = IngestBatch::per_organization(
            self.client.gateway_id(),
            self.organization_id.as_deref(),
            records,
        )
        .into_iter();

        while let Some(batch) = batches.next() {
            let ids = batch.record_ids();

            self.stats.state = ForwarderState::Sending;
            trace!("sending batch {} ({} records)", batch.batch_id, ids.len());

            if let Err(e) = self.client.deliver(&batch).await {
                self.link.record_failure(e.to_string()).await;

                let mut failed = ids;
                failed.extend(batches.flat_map(|rest| rest.record_ids()));
                if let Err(mark_err) = self.buffer.mark_failed(&failed).await {
                    error!("failed to return batch {} to pending: {}", batch.batch_id, mark_err);
                }
                self.enter_backoff(&e);
                return Err(e.into());
            }

            self.link.record_success().await;
            self.backoff.reset();
            self.stats.consecutive_failures = 0;
            self.stats.last_success = Some(Utc::now());
            self.stats.batches_sent += 1;
            outcome.batches += 1;

            match self.buffer.mark_delivered(&ids).await {
                Ok(marked) => {
                    self.stats.delivered_records += marked;
                    outcome.delivered += marked;
                }
                Err(e) => {
                    // records stay in-flight until the lease sweep requeues them
                    self.stats.state = ForwarderState::Idle;
                    self.stats.last_error = Some(e.to_string());
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    fn enter_backoff(&mut self, error: &UplinkError) {
        let delay = self.backoff.next_delay();

        self.stats.failed_batches += 1;
        self.stats.consecutive_failures = self.backoff.attempt();
        self.stats.last_error = Some(error.to_string());
        self.stats.state = ForwarderState::Backoff;
        self.stats.next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));

        self.retry_at = Some(Instant::now() + delay);

        warn!(
            "delivery failed ({} in a row), retrying in {:?}: {}",
            self.backoff.attempt(),
            delay,
            error
        );
    }
}

fn log_cycle(result: &Result<FlushOutcome, ForwardError>) {
    match result {
        Ok(outcome) if outcome.delivered > 0 => {
            debug!(
                "delivered {} records in {} batches",
                outcome.delivered, outcome.batches
            );
        }
        Ok(_) => trace!("nothing to forward"),
        Err(ForwardError::Storage(e)) => error!("forwarder storage error: {}", e),
        // already logged when entering backoff
        Err(ForwardError::Uplink(_)) => {}
    }
}

/// Handle for controlling the ForwarderActor
#[derive(Clone)]
pub struct ForwarderHandle {
    sender: mpsc::Sender<ForwarderCommand>,
}

impl ForwarderHandle {
    /// Spawn a new forwarder actor
    pub fn spawn(
        buffer: Arc<dyn BufferStore>,
        client: UplinkClient,
        organization_id: Option<String>,
        config: ForwarderConfig,
        link: LinkStatusStore,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = ForwarderActor::new(buffer, client, organization_id, config, link, cmd_rx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Run a cycle now and wait for its result.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ForwarderCommand::FlushNow {
                respond_to: Some(tx),
            })
            .await
            .context("failed to send FlushNow command")?;

        let outcome = rx.await.context("failed to receive flush result")??;
        Ok(outcome)
    }

    /// Queue a flush without waiting for it.
    pub fn request_flush(&self) -> Result<()> {
        self.sender
            .try_send(ForwarderCommand::FlushNow { respond_to: None })
            .context("forwarder is not accepting commands")
    }

    pub async fn get_stats(&self) -> Option<ForwarderStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ForwarderCommand::GetStats { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Stop the actor, waiting at most [`SHUTDOWN_TIMEOUT`] for it to exit.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ForwarderCommand::Shutdown { respond_to: tx })
            .await
            .is_err()
        {
            return;
        }

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, rx).await.is_err() {
            warn!("forwarder did not stop within {:?}", SHUTDOWN_TIMEOUT);
        }
    }
}
