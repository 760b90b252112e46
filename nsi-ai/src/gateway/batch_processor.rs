//! Request batching in front of the gateway
//!
//! Pending requests are collected and flushed as one gateway call when the queue
//! reaches `max_batch_size` or `max_wait_ms` after the first queued request,
//! whichever comes first. Answers are routed back to callers by request id.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use nsi_common::config::BatchSettings;

use super::{AiGateway, GatewayAnswer, GatewayError};
use crate::providers::ClassificationRequest;

type Reply = oneshot::Sender<Result<GatewayAnswer, GatewayError>>;

enum Command {
    Submit(ClassificationRequest, Reply),
    Flush(oneshot::Sender<()>),
}

/// Batch processor telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Requests waiting for the next flush
    pub queue_size: usize,
    pub total_batches: u64,
    pub total_items: u64,
    pub avg_items_per_batch: f64,
    /// Sum of batch sizes minus batches dispatched
    pub api_calls_saved: u64,
    pub max_batch_size: usize,
    pub max_wait_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queue_size: AtomicUsize,
    total_batches: AtomicU64,
    total_items: AtomicU64,
}

pub struct BatchProcessor {
    tx: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    settings: BatchSettings,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchProcessor {
    /// Start the background collector; must be called inside a tokio runtime
    pub fn start(gateway: Arc<AiGateway>, settings: BatchSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.max_batch_size.max(1) * 16);
        let counters = Arc::new(Counters::default());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_collector(
            gateway,
            settings.clone(),
            rx,
            counters.clone(),
            shutdown.clone(),
        ));

        Self {
            tx,
            counters,
            settings,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue one request and wait for its answer
    pub async fn submit(&self, request: ClassificationRequest) -> Result<GatewayAnswer, GatewayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Submit(request, reply_tx))
            .await
            .map_err(|_| GatewayError::BatchProcessorClosed)?;
        reply_rx.await.map_err(|_| GatewayError::BatchProcessorClosed)?
    }

    /// Dispatch whatever is queued now
    pub async fn flush(&self) -> Result<(), GatewayError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .await
            .map_err(|_| GatewayError::BatchProcessorClosed)?;
        done_rx.await.map_err(|_| GatewayError::BatchProcessorClosed)
    }

    /// Most requests dispatched in one gateway call
    pub fn max_batch_size(&self) -> usize {
        self.settings.max_batch_size.max(1)
    }

    pub fn stats(&self) -> BatchStats {
        let total_batches = self.counters.total_batches.load(Ordering::Relaxed);
        let total_items = self.counters.total_items.load(Ordering::Relaxed);
        BatchStats {
            queue_size: self.counters.queue_size.load(Ordering::Relaxed),
            total_batches,
            total_items,
            avg_items_per_batch: if total_batches == 0 {
                0.0
            } else {
                total_items as f64 / total_batches as f64
            },
            api_calls_saved: total_items.saturating_sub(total_batches),
            max_batch_size: self.settings.max_batch_size,
            max_wait_ms: self.settings.max_wait_ms,
        }
    }

    /// Flush the queue and stop the collector
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Batch collector task failed");
            }
        }
    }
}

async fn run_collector(
    gateway: Arc<AiGateway>,
    settings: BatchSettings,
    mut rx: mpsc::Receiver<Command>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
) {
    let max_batch = settings.max_batch_size.max(1);
    let max_wait = Duration::from_millis(settings.max_wait_ms);
    let mut queue: Vec<(ClassificationRequest, Reply)> = Vec::with_capacity(max_batch);
    let mut deadline: Option<Instant> = None;

    loop {
        let wake_at = deadline;
        let timer = async move {
            match wake_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                dispatch(&gateway, &counters, &mut queue);
                break;
            }

            command = rx.recv() => match command {
                Some(Command::Submit(request, reply)) => {
                    if queue.is_empty() {
                        deadline = Some(Instant::now() + max_wait);
                    }
                    queue.push((request, reply));
                    counters.queue_size.fetch_add(1, Ordering::Relaxed);
                    if queue.len() >= max_batch {
                        dispatch(&gateway, &counters, &mut queue);
                        deadline = None;
                    }
                }
                Some(Command::Flush(done)) => {
                    dispatch(&gateway, &counters, &mut queue);
                    deadline = None;
                    let _ = done.send(());
                }
                None => {
                    dispatch(&gateway, &counters, &mut queue);
                    break;
                }
            },

            _ = timer => {
                dispatch(&gateway, &counters, &mut queue);
                deadline = None;
            }
        }
    }

    info!("Batch collector stopped");
}

/// Hand the queued requests to the gateway as one batch
fn dispatch(gateway: &Arc<AiGateway>, counters: &Arc<Counters>, queue: &mut Vec<(ClassificationRequest, Reply)>) {
    if queue.is_empty() {
        return;
    }
    let batch: Vec<(ClassificationRequest, Reply)> = std::mem::take(queue);
    let size = batch.len();
    counters.queue_size.fetch_sub(size, Ordering::Relaxed);
    counters.total_batches.fetch_add(1, Ordering::Relaxed);
    counters.total_items.fetch_add(size as u64, Ordering::Relaxed);
    debug!(size, "Dispatching batch");

    let gateway = gateway.clone();
    tokio::spawn(async move {
        let (requests, replies): (Vec<ClassificationRequest>, Vec<Reply>) = batch.into_iter().unzip();
        let ids: Vec<_> = requests.iter().map(|r| r.id).collect();
        let mut results = gateway.classify_batch(requests).await;
        for (id, reply) in ids.into_iter().zip(replies) {
            let result = results
                .remove(&id)
                .unwrap_or(Err(GatewayError::NoProviders));
            // Caller may have given up waiting
            let _ = reply.send(result);
        }
    });
}
