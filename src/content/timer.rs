//! Rescan timer.
//!
//! One thread sleeps until the earliest subscription deadline and calls the
//! handler installed at `start` for every subscription that came due.
//! Timed autoscans use one-shot subscriptions and are re-armed after their
//! rescan finished; online services use periodic ones.

use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    io::Result as IoResult,
    sync::Arc,
    thread::{Builder, JoinHandle},
    time::{Duration, Instant},
};

use {
    parking_lot::{Condvar, Mutex, MutexGuard},
    tracing::{debug, error},
};

use crate::{autoscan::AutoscanHandle, error::domain::TimerError};

/// What a subscription is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Autoscan(AutoscanHandle),
    OnlineService(String),
    /// Periodic check of the inotify roots.
    WatchRecheck,
}

impl Display for TimerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Autoscan(handle) => write!(f, "autoscan {handle}"),
            Self::OnlineService(name) => write!(f, "online service {name}"),
            Self::WatchRecheck => write!(f, "watch recheck"),
        }
    }
}

pub type TimerHandler = Arc<dyn Fn(&TimerKey) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Subscription {
    deadline: Instant,
    interval: Duration,
    once: bool,
}

#[derive(Debug, Default)]
struct TimerState {
    subscriptions: HashMap<TimerKey, Subscription>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Deadline scheduler for rescans and online refreshes.
#[derive(Default)]
pub struct RescanTimer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RescanTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the timer thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(&self, handler: TimerHandler) -> IoResult<()> {
        let shared = self.shared.clone();
        let thread = Builder::new()
            .name("rescan-timer".to_string())
            .spawn(move || run(&shared, &handler))?;
        *self.thread.lock() = Some(thread);
        Ok(())
    }

    /// Subscribes `key` to fire after `interval`, then every `interval`
    /// unless `once` is set.
    ///
    /// # Errors
    ///
    /// Returns `TimerError::ZeroInterval` for an empty interval and
    /// `TimerError::AlreadyScheduled` if `key` is pending.
    pub fn schedule(&self, key: TimerKey, interval: Duration, once: bool) -> Result<(), TimerError> {
        if interval.is_zero() {
            return Err(TimerError::ZeroInterval {
                key: key.to_string(),
            });
        }

        let mut state = self.shared.state.lock();
        if state.subscriptions.contains_key(&key) {
            return Err(TimerError::AlreadyScheduled {
                key: key.to_string(),
            });
        }
        debug!("Scheduling {} in {:?}", key, interval);
        state.subscriptions.insert(
            key,
            Subscription {
                deadline: Instant::now() + interval,
                interval,
                once,
            },
        );
        drop(state);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Drops the subscription of `key`; returns `true` if one was pending.
    pub fn cancel(&self, key: &TimerKey) -> bool {
        let removed = self.shared.state.lock().subscriptions.remove(key).is_some();
        if removed {
            debug!("Cancelled {}", key);
            self.shared.wake.notify_one();
        }
        removed
    }

    pub fn is_scheduled(&self, key: &TimerKey) -> bool {
        self.shared.state.lock().subscriptions.contains_key(key)
    }

    /// Stops the thread; pending subscriptions are dropped.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.subscriptions.clear();
        }
        self.shared.wake.notify_all();

        if let Some(thread) = self.thread.lock().take()
            && thread.join().is_err()
        {
            error!("Rescan timer thread panicked");
        }
    }
}

impl Drop for RescanTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn take_due(state: &mut TimerState, now: Instant) -> Vec<TimerKey> {
    let due: Vec<TimerKey> = state
        .subscriptions
        .iter()
        .filter(|(_, subscription)| subscription.deadline <= now)
        .map(|(key, _)| key.clone())
        .collect();

    for key in &due {
        let rearm = match state.subscriptions.get_mut(key) {
            Some(subscription) if !subscription.once => {
                subscription.deadline = now + subscription.interval;
                true
            }
            _ => false,
        };
        if !rearm {
            state.subscriptions.remove(key);
        }
    }
    due
}

fn run(shared: &Shared, handler: &TimerHandler) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }

        let due = take_due(&mut state, Instant::now());
        if !due.is_empty() {
            MutexGuard::unlocked(&mut state, || {
                for key in &due {
                    debug!("Timer fired for {}", key);
                    handler(key);
                }
            });
            continue;
        }

        let next = state
            .subscriptions
            .values()
            .map(|subscription| subscription.deadline)
            .min();
        match next {
            Some(deadline) => {
                shared.wake.wait_until(&mut state, deadline);
            }
            None => shared.wake.wait(&mut state),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use {async_channel::unbounded, parking_lot::Mutex};

    use crate::{
        autoscan::{AutoscanDirectory, AutoscanList, ScanMode},
        content::timer::{RescanTimer, TimerKey},
        error::domain::TimerError,
    };

    fn autoscan_key() -> TimerKey {
        let list = AutoscanList::new();
        let handle = list
            .add(AutoscanDirectory::new("/media", ScanMode::Timed).with_interval(1))
            .unwrap();
        TimerKey::Autoscan(handle)
    }

    #[test]
    fn test_one_shot_fires_once() {
        let timer = RescanTimer::new();
        let (sender, receiver) = unbounded();
        timer
            .start(Arc::new(move |key: &TimerKey| {
                sender.send_blocking(key.clone()).unwrap();
            }))
            .unwrap();

        let key = autoscan_key();
        timer
            .schedule(key.clone(), Duration::from_millis(20), true)
            .unwrap();
        assert_eq!(receiver.recv_blocking().unwrap(), key);
        assert!(!timer.is_scheduled(&key));

        thread::sleep(Duration::from_millis(100));
        assert!(receiver.try_recv().is_err());
        timer.shutdown();
    }

    #[test]
    fn test_periodic_fires_until_cancelled() {
        let timer = RescanTimer::new();
        let fired = Arc::new(Mutex::new(0_u32));
        let counter = fired.clone();
        timer
            .start(Arc::new(move |_: &TimerKey| *counter.lock() += 1))
            .unwrap();

        let key = TimerKey::OnlineService("trailers".to_string());
        timer
            .schedule(key.clone(), Duration::from_millis(20), false)
            .unwrap();
        thread::sleep(Duration::from_millis(150));
        assert!(timer.cancel(&key));
        let count = *fired.lock();
        assert!(count >= 2, "fired {count} times");

        // A firing already in flight may still land.
        thread::sleep(Duration::from_millis(80));
        assert!(*fired.lock() <= count + 1);
        timer.shutdown();
    }

    #[test]
    fn test_schedule_rejects_bad_subscriptions() {
        let timer = RescanTimer::new();
        let key = autoscan_key();
        assert!(matches!(
            timer.schedule(key.clone(), Duration::ZERO, true),
            Err(TimerError::ZeroInterval { .. })
        ));
        timer
            .schedule(key.clone(), Duration::from_secs(60), true)
            .unwrap();
        assert!(matches!(
            timer.schedule(key.clone(), Duration::from_secs(60), true),
            Err(TimerError::AlreadyScheduled { .. })
        ));
        assert!(timer.cancel(&key));
        assert!(!timer.cancel(&key));
    }
}
