use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::store::EntryStore;
use crate::transport::{TransactionKind, TransactionReceiver, TransactionSink};
use crate::types::{EntryHandle, EntrySnapshot};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_KEEP_ALIVE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_QUEUE_CAPACITY: usize = 500;

/// Configuration for the outbound flush loop.
#[derive(Debug, Clone)]
pub struct WriteManagerConfig {
    /// Period of the background flush.
    pub flush_interval: Duration,
    /// Idle time after which a keep-alive is sent.
    pub keep_alive_delay: Duration,
    /// Length at which a queue forces a flush on the producing thread.
    pub queue_capacity: usize,
}

impl WriteManagerConfig {
    pub fn new() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            keep_alive_delay: DEFAULT_KEEP_ALIVE_DELAY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_keep_alive_delay(mut self, delay: Duration) -> Self {
        self.keep_alive_delay = delay;
        self
    }

    /// Sets the queue capacity (at least 1).
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

impl Default for WriteManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct TransactionQueues {
    assignments: VecDeque<EntryHandle>,
    updates: VecDeque<EntryHandle>,
}

impl TransactionQueues {
    fn queue_mut(&mut self, kind: TransactionKind) -> &mut VecDeque<EntryHandle> {
        match kind {
            TransactionKind::Assignment => &mut self.assignments,
            TransactionKind::Update => &mut self.updates,
        }
    }

    fn clear(&mut self) {
        self.assignments.clear();
        self.updates.clear();
    }
}

/// Owned by whichever thread is flushing; serializes ticks.
struct FlushState {
    draining: TransactionQueues,
    last_flush: Instant,
}

struct Worker {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Buffers locally originated transactions and periodically hands them to
/// the transport in bulk.
///
/// Producers append to the pending queues; each tick swaps them with the
/// draining pair under the queue lock and drains without it. Marking entries
/// clean takes the store lock while no queue lock is held, so the two locks
/// are never nested.
pub struct WriteManager {
    config: WriteManagerConfig,
    store: Weak<EntryStore>,
    transport: Arc<dyn TransactionSink>,
    pending: Mutex<TransactionQueues>,
    flush: Mutex<FlushState>,
    /// Thread currently inside `flush_now`, if any.
    flushing: Mutex<Option<ThreadId>>,
    worker: Mutex<Option<Worker>>,
}

impl WriteManager {
    pub fn new(
        store: &Arc<EntryStore>,
        transport: Arc<dyn TransactionSink>,
        config: WriteManagerConfig,
    ) -> Self {
        Self {
            config,
            store: Arc::downgrade(store),
            transport,
            pending: Mutex::new(TransactionQueues::default()),
            flush: Mutex::new(FlushState {
                draining: TransactionQueues::default(),
                last_flush: Instant::now(),
            }),
            flushing: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WriteManagerConfig {
        &self.config
    }

    /// Starts the periodic flush thread. Does nothing if already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("Write manager already running");
            return Ok(());
        }

        let (stop, stopped) = mpsc::channel();
        let manager = Arc::downgrade(self);
        let interval = self.config.flush_interval;
        let thread = thread::Builder::new()
            .name("ntsync-write-manager".to_string())
            .spawn(move || run_flush_loop(manager, stopped, interval))
            .context("Failed to spawn write manager thread")?;

        *worker = Some(Worker { stop, thread });
        info!(?interval, "Write manager started");
        Ok(())
    }

    /// Stops the periodic flush. Transactions still queued are not flushed.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = worker.stop.send(());
        if worker.thread.thread().id() != thread::current().id() && worker.thread.join().is_err()
        {
            warn!("Write manager thread panicked");
        }
        info!("Write manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Number of transactions waiting for the next tick.
    pub fn queued(&self) -> usize {
        let pending = self.pending.lock();
        pending.assignments.len() + pending.updates.len()
    }

    pub fn offer_outgoing_assignment(&self, handle: EntryHandle) {
        self.enqueue(TransactionKind::Assignment, handle);
    }

    pub fn offer_outgoing_update(&self, handle: EntryHandle) {
        self.enqueue(TransactionKind::Update, handle);
    }

    fn enqueue(&self, kind: TransactionKind, handle: EntryHandle) {
        let overflowed = {
            let mut pending = self.pending.lock();
            let queue = pending.queue_mut(kind);
            queue.push_back(handle);
            queue.len() >= self.config.queue_capacity
        };
        if overflowed {
            if *self.flushing.lock() == Some(thread::current().id()) {
                // Reached from the transport during our own flush; the queue
                // is picked up by the next tick.
                debug!(?kind, "Write queue full during flush, deferring drain");
                return;
            }
            warn!(
                ?kind,
                capacity = self.config.queue_capacity,
                "Write queue full, flushing on the producing thread"
            );
            self.flush_now();
        }
    }

    /// Runs one tick: sends everything queued so far, or a keep-alive if the
    /// link has been idle too long. Returns the number of transactions sent.
    pub fn flush_now(&self) -> usize {
        let mut flush = self.flush.lock();
        *self.flushing.lock() = Some(thread::current().id());
        let sent = self.drain(&mut flush);
        *self.flushing.lock() = None;
        sent
    }

    fn drain(&self, flush: &mut FlushState) -> usize {
        std::mem::swap(&mut *self.pending.lock(), &mut flush.draining);

        let Some(store) = self.store.upgrade() else {
            flush.draining.clear();
            return 0;
        };

        let mut sent = 0;
        while let Some(handle) = flush.draining.assignments.pop_front() {
            let Some(entry) = store.mark_clean(handle) else {
                continue;
            };
            match self.transport.send_assignment(&entry) {
                Ok(()) => sent += 1,
                Err(err) => warn!(name = %entry.name, "Failed to send assignment: {err:?}"),
            }
        }
        while let Some(handle) = flush.draining.updates.pop_front() {
            let Some(entry) = store.mark_clean(handle) else {
                continue;
            };
            match self.transport.send_update(&entry, entry.sequence) {
                Ok(()) => sent += 1,
                Err(err) => warn!(name = %entry.name, "Failed to send update: {err:?}"),
            }
        }

        let now = Instant::now();
        if sent > 0 {
            if let Err(err) = self.transport.flush() {
                warn!("Failed to flush transport: {err:?}");
            }
            flush.last_flush = now;
            debug!(sent, "Flushed transactions");
        } else if now.duration_since(flush.last_flush) > self.config.keep_alive_delay {
            trace!("Link idle, sending keep-alive");
            if let Err(err) = self
                .transport
                .send_keep_alive()
                .and_then(|()| self.transport.flush())
            {
                warn!("Failed to send keep-alive: {err:?}");
            }
            flush.last_flush = now;
        }
        sent
    }
}

fn run_flush_loop(manager: Weak<WriteManager>, stopped: mpsc::Receiver<()>, interval: Duration) {
    loop {
        match stopped.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.flush_now();
    }
    debug!("Write manager thread exiting");
}

impl TransactionReceiver for WriteManager {
    fn offer_assignment(&self, entry: &EntrySnapshot) {
        self.offer_outgoing_assignment(entry.handle);
    }

    fn offer_update(&self, entry: &EntrySnapshot) {
        self.offer_outgoing_update(entry.handle);
    }
}

impl Drop for WriteManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.stop.send(());
        }
    }
}
