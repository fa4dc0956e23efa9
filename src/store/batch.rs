//! Coalescing write buffer in front of the columnar backend.
//!
//! Producers append rows under a short lock; a dedicated worker flushes
//! on size, on a timer, and on shutdown. The swap-under-lock /
//! insert-outside-lock pattern keeps the append path O(1): the worker
//! takes the whole slice and producers immediately start filling a fresh
//! one. Flush failures retry with backoff; rows that still cannot land
//! are spilled to a recovery file so producers never observe the error.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Saturation point: producers block on append once this many batches
/// are pending, until the worker drains.
const HIGH_WATER_BATCHES: usize = 8;

/// Destination of a flushed slice; one bulk insert per call.
#[async_trait]
pub trait BulkSink<T>: Send + Sync + 'static {
    async fn insert_batch(&self, rows: &[T]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Entity-class label, used for logs and recovery file names.
    pub label: &'static str,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Where exhausted-retry slices are serialized. None disables spill
    /// (rows are dropped with an error log after retries).
    pub recovery_dir: Option<PathBuf>,
}

impl BatchConfig {
    pub fn new(label: &'static str) -> Self {
        BatchConfig {
            label,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            recovery_dir: None,
        }
    }
}

struct Shared<T> {
    rows: std::sync::Mutex<Vec<T>>,
    wake_worker: Notify,
    wake_producers: Notify,
    closed: AtomicBool,
    failed_flushes: AtomicU64,
    spilled_rows: AtomicU64,
}

pub struct BatchBuffer<T> {
    shared: Arc<Shared<T>>,
    config: BatchConfig,
    shutdown_tx: watch::Sender<bool>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T> BatchBuffer<T>
where
    T: Serialize + Send + 'static,
{
    pub fn new(config: BatchConfig, sink: Arc<dyn BulkSink<T>>) -> Self {
        let shared = Arc::new(Shared {
            rows: std::sync::Mutex::new(Vec::new()),
            wake_worker: Notify::new(),
            wake_producers: Notify::new(),
            closed: AtomicBool::new(false),
            failed_flushes: AtomicU64::new(0),
            spilled_rows: AtomicU64::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run_worker(
            shared.clone(),
            config.clone(),
            sink,
            shutdown_rx,
        ));
        BatchBuffer {
            shared,
            config,
            shutdown_tx,
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    /// Append one row. O(1) under the lock; blocks only when the buffer
    /// is saturated, and then until the worker drains; rows are never
    /// silently dropped.
    pub async fn append(&self, row: T) -> Result<()> {
        let high_water = self.config.batch_size * HIGH_WATER_BATCHES;
        let mut row = Some(row);
        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(Error::Canceled);
            }
            let len = {
                let mut rows = self.shared.rows.lock().unwrap_or_else(|e| e.into_inner());
                if rows.len() >= high_water {
                    None
                } else {
                    rows.push(row.take().expect("row consumed twice"));
                    Some(rows.len())
                }
            };
            match len {
                Some(len) => {
                    if len >= self.config.batch_size {
                        self.shared.wake_worker.notify_one();
                    }
                    return Ok(());
                }
                None => {
                    self.shared.wake_worker.notify_one();
                    self.shared.wake_producers.notified().await;
                }
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.rows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn failed_flushes(&self) -> u64 {
        self.shared.failed_flushes.load(Ordering::Relaxed)
    }

    pub fn spilled_rows(&self) -> u64 {
        self.shared.spilled_rows.load(Ordering::Relaxed)
    }

    /// Ask the worker for an immediate flush without closing.
    pub fn trigger_flush(&self) {
        self.shared.wake_worker.notify_one();
    }

    /// Stop accepting appends, drain everything, and stop the worker.
    /// Bounded by [`SHUTDOWN_DEADLINE`]; a worker stuck in backend I/O
    /// past the deadline is abandoned with an error log.
    pub async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            match tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("{} flush worker panicked: {e}", self.config.label),
                Err(_) => {
                    tracing::error!(
                        "{} flush worker missed the {}s shutdown deadline",
                        self.config.label,
                        SHUTDOWN_DEADLINE.as_secs()
                    );
                    return Err(Error::Canceled);
                }
            }
        }
        Ok(())
    }
}

async fn run_worker<T>(
    shared: Arc<Shared<T>>,
    config: BatchConfig,
    sink: Arc<dyn BulkSink<T>>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    T: Serialize + Send + 'static,
{
    let mut interval = tokio::time::interval(config.flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                flush_once(&shared, &config, sink.as_ref()).await;
            }
            _ = shared.wake_worker.notified() => {
                flush_once(&shared, &config, sink.as_ref()).await;
            }
            _ = shutdown_rx.changed() => {
                // Drain whatever producers managed to append before the
                // closed flag went up.
                flush_once(&shared, &config, sink.as_ref()).await;
                return;
            }
        }
    }
}

async fn flush_once<T>(shared: &Shared<T>, config: &BatchConfig, sink: &dyn BulkSink<T>)
where
    T: Serialize + Send + 'static,
{
    let batch = {
        let mut rows = shared.rows.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *rows)
    };
    shared.wake_producers.notify_waiters();
    if batch.is_empty() {
        return;
    }

    let mut last_err = None;
    for (attempt, backoff) in std::iter::once(None)
        .chain(RETRY_BACKOFF.iter().map(Some))
        .enumerate()
    {
        if let Some(backoff) = backoff {
            tokio::time::sleep(*backoff).await;
        }
        match sink.insert_batch(&batch).await {
            Ok(()) => {
                if attempt > 0 {
                    tracing::info!(
                        "{} flush of {} rows succeeded on attempt {}",
                        config.label,
                        batch.len(),
                        attempt + 1
                    );
                } else {
                    tracing::debug!("{} flushed {} rows", config.label, batch.len());
                }
                return;
            }
            Err(e) => {
                tracing::warn!(
                    "{} flush attempt {} failed: {e}",
                    config.label,
                    attempt + 1
                );
                last_err = Some(e);
            }
        }
    }

    shared.failed_flushes.fetch_add(1, Ordering::Relaxed);
    let err = last_err.expect("retries exhausted without an error");
    match spill(config, &batch) {
        Ok(path) => {
            shared.spilled_rows.fetch_add(batch.len() as u64, Ordering::Relaxed);
            tracing::error!(
                "{} flush exhausted retries ({err}); {} rows spilled to {}",
                config.label,
                batch.len(),
                path.display()
            );
        }
        Err(spill_err) => {
            tracing::error!(
                "{} flush exhausted retries ({err}) and spill failed ({spill_err}); {} rows lost",
                config.label,
                batch.len()
            );
        }
    }
}

fn spill<T: Serialize>(config: &BatchConfig, batch: &[T]) -> std::io::Result<PathBuf> {
    let dir = config
        .recovery_dir
        .clone()
        .ok_or_else(|| std::io::Error::other("no recovery dir configured"))?;
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!(
        "{}-{}.recovery.json",
        config.label,
        chrono::Utc::now().timestamp_millis()
    ));
    let file = std::fs::File::create(&path)?;
    serde_json::to_writer(file, batch).map_err(std::io::Error::other)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<usize>>,
        fail_first: AtomicU64,
    }

    #[async_trait]
    impl BulkSink<u32> for RecordingSink {
        async fn insert_batch(&self, rows: &[u32]) -> Result<()> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Format("injected failure".into()));
            }
            self.batches.lock().unwrap().push(rows.len());
            Ok(())
        }
    }

    fn slow_config() -> BatchConfig {
        BatchConfig {
            label: "test",
            batch_size: 1000,
            flush_interval: Duration::from_secs(3600),
            recovery_dir: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_drains_pending_rows_in_one_insert() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = BatchBuffer::new(slow_config(), sink.clone());
        for i in 0..200 {
            buffer.append(i).await.unwrap();
        }
        buffer.close().await.unwrap();

        assert_eq!(*sink.batches.lock().unwrap(), vec![200]);
        assert!(buffer.append(1).await.is_err(), "closed buffer must refuse appends");
    }

    #[tokio::test(start_paused = true)]
    async fn size_trigger_flushes_without_timer() {
        let sink = Arc::new(RecordingSink::default());
        let config = BatchConfig {
            batch_size: 50,
            ..slow_config()
        };
        let buffer = BatchBuffer::new(config, sink.clone());
        for i in 0..50 {
            buffer.append(i).await.unwrap();
        }
        // The paused clock only advances once every task is idle, so the
        // worker is guaranteed to have drained by the time this resolves.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*sink.batches.lock().unwrap(), vec![50]);
        buffer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timer_trigger_flushes_partial_batches() {
        let sink = Arc::new(RecordingSink::default());
        let config = BatchConfig {
            batch_size: 1000,
            flush_interval: Duration::from_secs(5),
            ..slow_config()
        };
        let buffer = BatchBuffer::new(config, sink.clone());
        for i in 0..7 {
            buffer.append(i).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(*sink.batches.lock().unwrap(), vec![7]);
        buffer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_backoff() {
        let sink = Arc::new(RecordingSink {
            fail_first: AtomicU64::new(2),
            ..RecordingSink::default()
        });
        let buffer = BatchBuffer::new(slow_config(), sink.clone());
        buffer.append(1).await.unwrap();
        buffer.append(2).await.unwrap();
        buffer.close().await.unwrap();

        // Two injected failures, then the 1s and 2s backoffs land it.
        assert_eq!(*sink.batches.lock().unwrap(), vec![2]);
        assert_eq!(buffer.failed_flushes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_spill_to_recovery_file() {
        let dir = std::env::temp_dir().join(format!(
            "metascope-batch-test-{}",
            std::process::id()
        ));
        let sink = Arc::new(RecordingSink {
            fail_first: AtomicU64::new(100),
            ..RecordingSink::default()
        });
        let config = BatchConfig {
            recovery_dir: Some(dir.clone()),
            ..slow_config()
        };
        let buffer = BatchBuffer::new(config, sink.clone());
        for i in 0..3 {
            buffer.append(i).await.unwrap();
        }
        buffer.close().await.unwrap();

        assert_eq!(buffer.failed_flushes(), 1);
        assert_eq!(buffer.spilled_rows(), 3);
        let spilled: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(spilled.len(), 1);
        let contents =
            std::fs::read_to_string(spilled[0].as_ref().unwrap().path()).unwrap();
        let rows: Vec<u32> = serde_json::from_str(&contents).unwrap();
        assert_eq!(rows, vec![0, 1, 2]);
        std::fs::remove_dir_all(&dir).ok();
    }
}
