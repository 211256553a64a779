use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::aggregator::{Aggregator, IngestSummary};
use crate::config::ChannelConfig;
use crate::graceful_shutdown::{self, ShutdownRx, ShutdownTx};
use crate::health::HealthCounters;
use crate::lifecycle::Service;
use crate::recorder::JsonlAppender;
use crate::types::{now_ms, TradeBatch};

/// One delivery on the inbound channel. `ack` resolves once the batch is fully handled.
#[derive(Debug)]
pub struct InboundBatch {
    pub batch: TradeBatch,
    pub ack: oneshot::Sender<BatchOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Ingested(IngestSummary),
    DeadLettered { attempts: u32, error: String },
    /// Shutdown arrived while the batch was still being retried; it was not committed.
    Interrupted,
}

/// Producer side of the inbound channel.
#[derive(Clone)]
pub struct InboundSender {
    tx: mpsc::Sender<InboundBatch>,
}

impl InboundSender {
    /// Enqueues `batch` and waits for its outcome.
    pub async fn submit(&self, batch: TradeBatch) -> anyhow::Result<BatchOutcome> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(InboundBatch { batch, ack: ack_tx })
            .await
            .map_err(|_| anyhow!("inbound channel closed"))?;
        ack_rx.await.context("batch consumer dropped the ack")
    }
}

pub fn inbound_channel(capacity: usize) -> (InboundSender, mpsc::Receiver<InboundBatch>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (InboundSender { tx }, rx)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub window: Duration,
}

impl From<&ChannelConfig> for RetryPolicy {
    fn from(cfg: &ChannelConfig) -> Self {
        Self {
            delay: Duration::from_millis(cfg.retry_delay_ms),
            window: Duration::from_millis(cfg.retry_window_ms),
        }
    }
}

#[derive(Debug, Serialize)]
struct DeadLetter<'a> {
    ts_ms: u64,
    batch_id: &'a str,
    attempts: u32,
    error: &'a str,
    batch: &'a TradeBatch,
}

struct Worker {
    aggregator: Arc<Aggregator>,
    policy: RetryPolicy,
    dead_letter_path: PathBuf,
    dead_letter: Option<JsonlAppender>,
    health: Arc<HealthCounters>,
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<InboundBatch>,
        mut shutdown: ShutdownRx,
    ) {
        loop {
            let inbound = tokio::select! {
                _ = graceful_shutdown::requested(&mut shutdown) => break,
                msg = rx.recv() => match msg {
                    Some(v) => v,
                    None => {
                        info!("inbound channel closed");
                        break;
                    }
                },
            };

            let outcome = self.handle(&inbound.batch, &mut shutdown).await;
            let _ = inbound.ack.send(outcome.clone());
            if outcome == BatchOutcome::Interrupted {
                break;
            }
        }

        if let Some(out) = self.dead_letter.as_mut() {
            if let Err(e) = out.flush_and_sync() {
                warn!(error = %e, "dead-letter flush/sync failed");
            }
        }
    }

    /// Ingests with a fixed retry delay until the retry window is exhausted. Rejections such
    /// as an unknown asset fail the same way on every attempt and go straight to dead-letter.
    async fn handle(
        &mut self,
        batch: &TradeBatch,
        shutdown: &mut ShutdownRx,
    ) -> BatchOutcome {
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match self.aggregator.ingest(batch).await {
                Ok(summary) => return BatchOutcome::Ingested(summary),
                Err(e) => e,
            };

            let retry = !err.is_rejection()
                && started.elapsed() + self.policy.delay <= self.policy.window;
            if !retry {
                return self.send_to_dead_letter(batch, attempts, &err.to_string());
            }

            self.health.inc_batch_retries(1);
            warn!(
                batch_id = %batch.batch_id,
                attempt = attempts,
                error = %err,
                delay_ms = self.policy.delay.as_millis() as u64,
                "batch ingest failed; retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.policy.delay) => {}
                _ = graceful_shutdown::requested(shutdown) => {
                    warn!(
                        batch_id = %batch.batch_id,
                        "shutdown during retry; batch left uncommitted"
                    );
                    return BatchOutcome::Interrupted;
                }
            }
        }
    }

    fn send_to_dead_letter(
        &mut self,
        batch: &TradeBatch,
        attempts: u32,
        error: &str,
    ) -> BatchOutcome {
        self.health.inc_batches_dead_lettered(1);
        error!(
            batch_id = %batch.batch_id,
            attempts,
            error,
            "batch dead-lettered"
        );

        let line = DeadLetter {
            ts_ms: now_ms(),
            batch_id: &batch.batch_id,
            attempts,
            error,
            batch,
        };
        if let Err(e) = self.write_dead_letter(&line) {
            error!(error = %e, batch_id = %batch.batch_id, "dead-letter write failed");
        }
        BatchOutcome::DeadLettered {
            attempts,
            error: error.to_string(),
        }
    }

    fn write_dead_letter(&mut self, line: &DeadLetter<'_>) -> anyhow::Result<()> {
        if self.dead_letter.is_none() {
            self.dead_letter = Some(JsonlAppender::open(&self.dead_letter_path)?);
        }
        if let Some(out) = self.dead_letter.as_mut() {
            out.write_json(line)?;
            out.flush()?;
        }
        Ok(())
    }
}

/// Single sequential consumer of the inbound channel.
pub struct BatchConsumer {
    aggregator: Arc<Aggregator>,
    policy: RetryPolicy,
    dead_letter_path: PathBuf,
    health: Arc<HealthCounters>,
    rx: Option<mpsc::Receiver<InboundBatch>>,
    shutdown: Option<ShutdownTx>,
    handle: Option<JoinHandle<()>>,
}

impl BatchConsumer {
    pub fn new(
        aggregator: Arc<Aggregator>,
        rx: mpsc::Receiver<InboundBatch>,
        policy: RetryPolicy,
        dead_letter_path: PathBuf,
        health: Arc<HealthCounters>,
    ) -> Self {
        Self {
            aggregator,
            policy,
            dead_letter_path,
            health,
            rx: Some(rx),
            shutdown: None,
            handle: None,
        }
    }

    /// Waits until the consumer exits on its own, i.e. after every sender was dropped and the
    /// queue drained.
    pub async fn join(&mut self) -> anyhow::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| anyhow!("batch consumer join failed: {e}"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Service for BatchConsumer {
    fn name(&self) -> &'static str {
        "batch_consumer"
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| anyhow!("batch consumer already started"))?;
        let (tx, shutdown_rx) = graceful_shutdown::channel();
        let worker = Worker {
            aggregator: self.aggregator.clone(),
            policy: self.policy,
            dead_letter_path: self.dead_letter_path.clone(),
            dead_letter: None,
            health: self.health.clone(),
        };
        self.handle = Some(tokio::spawn(worker.run(rx, shutdown_rx)));
        self.shutdown = Some(tx);
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            graceful_shutdown::request(&tx);
        }
        self.join().await
    }
}
