//! Asynchronous emitter for closed segment trees.
//!
//! The emitter turns a `Closed` tree into one or more framed datagrams
//! and hands them to a background transport worker through a bounded
//! queue, so the instrumented call path never blocks on network I/O. A
//! full queue drops the newest document and bumps a counter; transport
//! errors are logged at a bounded rate and never surface to callers.

mod document;
mod transport;

pub use document::{SegmentDocument, DAEMON_FRAMING};
pub use transport::{Transport, TransportBoxed, UdpTransport};

#[cfg(test)]
pub(crate) use transport::{FailingTransport, MemoryTransport, StuckTransport};

use crate::error::EmitError;
use crate::segment::Entity;
use document::split_into_frames;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Configuration for the emitter.
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Largest datagram the transport will carry. Documents above this
    /// are split into streamed subsegment messages.
    pub max_packet_bytes: usize,
    /// Capacity of the outbound queue between producers and the
    /// transport worker.
    pub queue_capacity: usize,
    /// Minimum spacing between logged transport errors.
    pub error_log_interval: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            // Safely below a 1500-byte path MTU.
            max_packet_bytes: 1200,
            queue_capacity: 256,
            error_log_interval: Duration::from_secs(1),
        }
    }
}

impl EmitterConfig {
    /// Sets the packet size limit.
    pub fn with_max_packet_bytes(mut self, bytes: usize) -> Self {
        self.max_packet_bytes = bytes;
        self
    }

    /// Sets the outbound queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// Thread-safe emitter counters (uses atomics).
#[derive(Debug, Default)]
pub struct EmitterMetrics {
    /// Datagrams handed to the transport successfully.
    pub sent: AtomicU64,
    /// Datagrams dropped because the outbound queue was full.
    pub dropped_full: AtomicU64,
    /// Documents dropped because a single entity exceeded the packet
    /// limit (or failed to serialize).
    pub dropped_oversized: AtomicU64,
    /// Transport send failures.
    pub transport_errors: AtomicU64,
}

impl EmitterMetrics {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped_full(&self) -> u64 {
        self.dropped_full.load(Ordering::Relaxed)
    }

    pub fn dropped_oversized(&self) -> u64 {
        self.dropped_oversized.load(Ordering::Relaxed)
    }

    pub fn transport_errors(&self) -> u64 {
        self.transport_errors.load(Ordering::Relaxed)
    }
}

/// Rate limiter for error logging: allows one log line per interval.
struct LogLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    fn allow(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Serializes closed trees and ships them to the collector without
/// blocking producers.
///
/// Construct one per process and share it by reference; there is no
/// ambient singleton.
pub struct Emitter {
    tx: mpsc::Sender<Vec<u8>>,
    metrics: Arc<EmitterMetrics>,
    max_packet_bytes: usize,
    limiter: Arc<LogLimiter>,
    shutdown_tx: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Emitter {
    /// Creates an emitter and spawns its transport worker on the current
    /// tokio runtime.
    pub fn new(config: EmitterConfig, transport: Arc<dyn TransportBoxed>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let metrics = Arc::new(EmitterMetrics::default());
        let limiter = Arc::new(LogLimiter::new(config.error_log_interval));
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let worker = spawn_worker(
            rx,
            shutdown_rx,
            transport,
            Arc::clone(&metrics),
            Arc::clone(&limiter),
        );
        Self {
            tx,
            metrics,
            max_packet_bytes: config.max_packet_bytes,
            limiter,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Emitter counters.
    pub fn metrics(&self) -> &Arc<EmitterMetrics> {
        &self.metrics
    }

    /// Serializes a closed local root and enqueues its datagrams.
    ///
    /// Never blocks and never fails from the caller's perspective:
    /// oversized entities and full-queue drops are counted and logged.
    pub(crate) fn emit_root(&self, root: &Entity) {
        let doc = root.snapshot();
        let trace_id = root.trace_id().to_string();
        self.emit_document(doc, &trace_id);
    }

    /// Splits and enqueues one standalone document.
    pub fn emit_document(&self, doc: SegmentDocument, trace_id: &str) {
        let mut frames = Vec::new();
        let mut dropped = Vec::new();
        split_into_frames(doc, trace_id, self.max_packet_bytes, &mut frames, &mut dropped);

        for err in dropped {
            self.metrics.dropped_oversized.fetch_add(1, Ordering::Relaxed);
            if self.limiter.allow() {
                match err {
                    EmitError::Oversized { .. } => tracing::warn!(error = %err, "dropping oversized segment"),
                    EmitError::Serialization(_) => tracing::warn!(error = %err, "dropping unserializable segment"),
                }
            }
        }

        for frame in frames {
            match self.tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // Drop-newest: the producer is never blocked.
                    self.metrics.dropped_full.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => {
                    // Worker already shut down; not a backpressure signal.
                    if self.limiter.allow() {
                        tracing::debug!("emit after shutdown; frame discarded");
                    }
                }
            }
        }
    }

    /// Gracefully shuts down the worker after draining queued datagrams.
    pub async fn shutdown(&self) {
        let shutdown_tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

fn spawn_worker(
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    transport: Arc<dyn TransportBoxed>,
    metrics: Arc<EmitterMetrics>,
    limiter: Arc<LogLimiter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(frame) => send_frame(&*transport, &frame, &metrics, &limiter).await,
                    None => break,
                },
                _ = &mut shutdown_rx => {
                    // Drain whatever is already queued, then stop.
                    while let Ok(frame) = rx.try_recv() {
                        send_frame(&*transport, &frame, &metrics, &limiter).await;
                    }
                    break;
                }
            }
        }
    })
}

async fn send_frame(
    transport: &dyn TransportBoxed,
    frame: &[u8],
    metrics: &EmitterMetrics,
    limiter: &LogLimiter,
) {
    match transport.send_boxed(frame).await {
        Ok(()) => {
            metrics.sent.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            metrics.transport_errors.fetch_add(1, Ordering::Relaxed);
            if limiter.allow() {
                tracing::warn!(
                    transport = transport.name(),
                    error = %e,
                    "collector send failed"
                );
            }
        }
    }
}
