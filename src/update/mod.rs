//! Coalescing of container-change notifications.
//!
//! Content changes mark containers as changed; a dedicated thread batches
//! those marks, bumps the update generation of every marked container in
//! storage and hands the resulting `id,generation,...` string to an
//! `UpdateSink`. Storage or sink failures are fatal: they are logged and
//! reported to the injected fatal handler, and the thread stops.

use std::{
    collections::HashSet,
    io::Result as IoResult,
    sync::Arc,
    thread::{Builder, JoinHandle},
    time::{Duration, Instant},
};

use {
    parking_lot::{Condvar, Mutex, MutexGuard},
    tracing::{debug, error},
};

use crate::{
    error::domain::UpdateError,
    storage::{INVALID_OBJECT_ID, ObjectId, Storage},
};

pub mod sink;

pub use sink::{ChannelSink, LogSink, UpdateSink};

/// Default scheduled flush interval in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2000;

/// Shorter remaining sleeps flush immediately.
pub const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Pending set size that forces a flush.
pub const MAX_OBJECT_IDS: usize = 1000;

/// Bulk inserts exceeding the cap by this margin are sliced.
pub const MAX_OBJECT_IDS_OVERLOAD: usize = 30;

/// Called once when flushing fails; the process is expected to shut down.
pub type FatalHandler = Arc<dyn Fn(&UpdateError) + Send + Sync>;

/// How urgently pending changes should be flushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlushPolicy {
    /// Flush after the scheduled interval.
    #[default]
    Scheduled,
    /// Flush as soon as possible.
    Asap,
}

#[derive(Debug)]
struct CoalescerState {
    pending: HashSet<ObjectId>,
    last_changed: ObjectId,
    policy: FlushPolicy,
    running: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<CoalescerState>,
    wake: Condvar,
    flushed: Condvar,
    storage: Arc<dyn Storage>,
    sink: Arc<dyn UpdateSink>,
    interval: Duration,
    fatal: FatalHandler,
}

/// Batches "container changed" signals into periodic update strings.
pub struct UpdateCoalescer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateCoalescer {
    pub fn new(
        storage: Arc<dyn Storage>,
        sink: Arc<dyn UpdateSink>,
        interval: Duration,
        fatal: FatalHandler,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CoalescerState {
                    pending: HashSet::new(),
                    last_changed: INVALID_OBJECT_ID,
                    policy: FlushPolicy::Scheduled,
                    running: false,
                    shutdown: false,
                }),
                wake: Condvar::new(),
                flushed: Condvar::new(),
                storage,
                sink,
                interval,
                fatal,
            }),
            thread: Mutex::new(None),
        }
    }

    /// Starts the flush thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread cannot be spawned.
    pub fn start(&self) -> IoResult<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        self.shared.state.lock().running = true;
        let shared = self.shared.clone();
        *thread = Some(
            Builder::new()
                .name("update-coalescer".to_string())
                .spawn(move || shared.run())?,
        );
        Ok(())
    }

    /// Marks one container as changed.
    ///
    /// Repeating the last marked id is a no-op unless `policy` escalates the
    /// current flush policy.
    pub fn container_changed(&self, object_id: ObjectId, policy: FlushPolicy) {
        if object_id == INVALID_OBJECT_ID {
            return;
        }
        let mut state = self.shared.state.lock();
        if object_id == state.last_changed && policy <= state.policy {
            return;
        }

        let mut signal = state.pending.is_empty();
        state.pending.insert(object_id);
        state.last_changed = object_id;
        if state.pending.len() >= MAX_OBJECT_IDS {
            signal = true;
        }
        if policy > state.policy {
            state.policy = policy;
            signal = true;
        }
        if signal {
            debug!("Container {} changed, waking update thread", object_id);
            self.shared.wake.notify_one();
        }
    }

    /// Marks a batch of containers as changed.
    ///
    /// Batches that would overflow the pending cap are inserted in slices,
    /// waiting for a flush between slices.
    pub fn containers_changed(&self, object_ids: &[ObjectId], policy: FlushPolicy) {
        let mut state = self.shared.state.lock();
        let mut signal = state.pending.is_empty();
        if policy > state.policy {
            state.policy = policy;
            signal = true;
        }

        let split = state.pending.len() + object_ids.len() >= MAX_OBJECT_IDS + MAX_OBJECT_IDS_OVERLOAD;
        for &object_id in object_ids {
            if object_id == state.last_changed || object_id == INVALID_OBJECT_ID {
                continue;
            }
            state.pending.insert(object_id);
            if split {
                self.wait_for_room(&mut state);
            }
        }

        if state.pending.len() >= MAX_OBJECT_IDS {
            signal = true;
        }
        if signal && !state.pending.is_empty() {
            self.shared.wake.notify_one();
        }
    }

    fn wait_for_room(&self, state: &mut MutexGuard<'_, CoalescerState>) {
        while state.pending.len() > MAX_OBJECT_IDS && state.running && !state.shutdown {
            debug!("Pending updates overflow, flushing in between");
            self.shared.wake.notify_one();
            self.shared.flushed.wait(state);
        }
    }

    /// Number of containers waiting for the next flush.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Stops the flush thread; pending changes are dropped.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.wake.notify_one();
            self.shared.flushed.notify_all();
        }
        if let Some(thread) = self.thread.lock().take()
            && thread.join().is_err()
        {
            error!("Update thread panicked");
        }
    }
}

impl Drop for UpdateCoalescer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run(&self) {
        debug!("Update thread started");
        let mut last_update = Instant::now();
        let mut state = self.state.lock();

        while !state.shutdown {
            if state.pending.is_empty() {
                self.wake.wait(&mut state);
                continue;
            }

            let sleep = match state.policy {
                FlushPolicy::Scheduled => self.interval.saturating_sub(last_update.elapsed()),
                FlushPolicy::Asap => Duration::ZERO,
            };

            let mut send = true;
            if sleep >= MIN_SLEEP && state.pending.len() < MAX_OBJECT_IDS {
                debug!("Update thread sleeping for {:?}", sleep);
                let result = self.wake.wait_for(&mut state, sleep);
                if state.shutdown || result.timed_out() {
                    send = false;
                }
            }
            if !send {
                continue;
            }

            state.last_changed = INVALID_OBJECT_ID;
            state.policy = FlushPolicy::Scheduled;
            let update = match self.storage.increment_update_ids(&state.pending) {
                Ok(update) => update,
                Err(e) => {
                    self.fail(&mut state, &UpdateError::from(e));
                    return;
                }
            };
            state.pending.clear();
            self.flushed.notify_all();

            if update.is_empty() {
                debug!("No update string to send");
                continue;
            }

            let sent = MutexGuard::unlocked(&mut state, || {
                debug!("Sending updates: {}", update);
                self.sink.send_update(&update)
            });
            match sent {
                Ok(()) => last_update = Instant::now(),
                Err(e) => {
                    self.fail(&mut state, &e);
                    return;
                }
            }
        }

        state.running = false;
        debug!("Update thread stopped");
    }

    fn fail(&self, state: &mut MutexGuard<'_, CoalescerState>, e: &UpdateError) {
        error!("Fatal error when sending updates: {}", e);
        state.running = false;
        self.flushed.notify_all();
        MutexGuard::unlocked(state, || (self.fatal)(e));
    }
}
