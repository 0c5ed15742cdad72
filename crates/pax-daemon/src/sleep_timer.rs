//! Single cancellable countdown.
//!
//! At most one countdown exists at a time; starting a new one discards the
//! previous one, and a discarded or cancelled countdown never fires.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pax_proto::protocol::SleepTimerStatus;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    deadline: Option<Instant>,
}

#[derive(Default)]
pub struct SleepTimer {
    slot: Arc<Mutex<Slot>>,
    task: Option<JoinHandle<()>>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

impl SleepTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the countdown.  `on_expire` runs exactly once when
    /// `duration` elapses, unless the timer is cancelled or restarted first.
    /// A zero duration only cancels.
    pub fn start<F>(&mut self, duration: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        if duration.is_zero() {
            return;
        }

        let deadline = Instant::now() + duration;
        let generation = {
            let mut slot = lock(&self.slot);
            slot.deadline = Some(deadline);
            slot.generation
        };
        debug!("sleep timer: armed for {:?}", duration);

        let slot = Arc::clone(&self.slot);
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut slot = lock(&slot);
                if slot.generation == generation && slot.deadline.is_some() {
                    slot.deadline = None;
                    true
                } else {
                    false
                }
            };
            if fire {
                debug!("sleep timer: expired");
                on_expire();
            }
        }));
    }

    /// Idempotent.
    pub fn cancel(&mut self) {
        {
            let mut slot = lock(&self.slot);
            slot.generation += 1;
            slot.deadline = None;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.slot).deadline.is_some()
    }

    pub fn remaining(&self) -> Duration {
        lock(&self.slot)
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn status(&self) -> SleepTimerStatus {
        let remaining = self.remaining();
        SleepTimerStatus {
            active: self.is_active(),
            remaining_ms: remaining.as_millis() as u64,
        }
    }
}

impl Drop for SleepTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
