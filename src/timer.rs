//! Interval timers for sessions.
//!
//! Each timer runs as its own tokio task and only ever pushes a [`TimerFired`]
//! onto a channel. Whoever drains the channel (the node's timeout pump) hands
//! the tick to the registry, so no session code runs on a timer task.

use crate::session::SessionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(pub u64);

impl Display for TimerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// One tick of a scheduled timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub timer_id: TimerId,
    pub owner: SessionKey,
    pub interval_ms: u32,
    /// Time since the previous tick (or since scheduling, for the first one).
    pub elapsed_ms: u64,
    pub fired_at: DateTime<Utc>,
}

pub struct TimerService {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<TimerId, JoinHandle<()>>>,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
}

impl TimerService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let service = Self {
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
            fired_tx,
        };
        (service, fired_rx)
    }

    /// Starts a timer ticking every `interval` on behalf of `owner`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, interval: Duration, owner: SessionKey) -> TimerId {
        let timer_id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let interval = interval.max(MIN_INTERVAL);
        let interval_ms = u32::try_from(interval.as_millis()).unwrap_or(u32::MAX);
        let fired_tx = self.fired_tx.clone();

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval_at(started + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = started;

            loop {
                let now = ticker.tick().await;
                let elapsed_ms = now.duration_since(last).as_millis() as u64;
                last = now;

                let fired = TimerFired {
                    timer_id,
                    owner,
                    interval_ms,
                    elapsed_ms,
                    fired_at: Utc::now(),
                };
                if fired_tx.send(fired).is_err() {
                    tracing::debug!(timer_id = %timer_id, "Timer consumer gone, stopping timer");
                    break;
                }
            }
        });

        self.lock_tasks().insert(timer_id, task);
        tracing::debug!(timer_id = %timer_id, session = %owner, interval_ms, "Scheduled timer");
        timer_id
    }

    /// Stops a timer. Ticks already queued are still delivered.
    pub fn cancel(&self, timer_id: TimerId) -> bool {
        match self.lock_tasks().remove(&timer_id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, task) in self.lock_tasks().drain() {
            task.abort();
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock_tasks().len()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<TimerId, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
