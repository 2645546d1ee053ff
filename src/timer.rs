//! Timer facility: fire an event on an interval
//!
//! Expiries are delivered as [`TimerId`]s on a channel and handled by the
//! management loop, so a timer callback never runs concurrently with other
//! registry or protocol work.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{LimError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Periodic pre-auth registry sweep (AP only)
    PreAuthCleanup,
    /// Waiting for auth frame 3 from the peer in this auth node slot
    AuthResponse(u16),
    /// STA gave up waiting for the peer's auth response
    AuthFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    Periodic,
}

pub trait Timers {
    /// Start (or restart) `id`. The first expiry is one `period` from now.
    fn activate(&mut self, id: TimerId, period: Duration, mode: TimerMode) -> Result<()>;

    /// Stop `id`; a no-op if it is not running
    fn deactivate(&mut self, id: TimerId);
}

/// Timers backed by tokio tasks
pub struct TokioTimers {
    tx: mpsc::Sender<TimerId>,
    running: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioTimers {
    pub fn new(tx: mpsc::Sender<TimerId>) -> Self {
        Self {
            tx,
            running: HashMap::new(),
        }
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.running
            .get(&id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Timers for TokioTimers {
    fn activate(&mut self, id: TimerId, period: Duration, mode: TimerMode) -> Result<()> {
        if period.is_zero() {
            return Err(LimError::invalid(format!("timer {:?} needs a non-zero period", id)));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            warn!("Cannot create timer {:?}: {}", id, e);
            LimError::ResourcesUnavailable
        })?;

        self.deactivate(id);

        let tx = self.tx.clone();
        let handle = runtime.spawn(async move {
            match mode {
                TimerMode::OneShot => {
                    tokio::time::sleep(period).await;
                    let _ = tx.send(id).await;
                }
                TimerMode::Periodic => {
                    let start = tokio::time::Instant::now() + period;
                    let mut ticker = tokio::time::interval_at(start, period);
                    loop {
                        ticker.tick().await;
                        if tx.send(id).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        debug!("Timer {:?} activated ({:?}, {:?})", id, mode, period);
        self.running.insert(id, handle);
        Ok(())
    }

    fn deactivate(&mut self, id: TimerId) {
        if let Some(handle) = self.running.remove(&id) {
            handle.abort();
            debug!("Timer {:?} deactivated", id);
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        for (_, handle) in self.running.drain() {
            handle.abort();
        }
    }
}
