//! Alarm primitive behind the wakeup timer
//!
//! The timer keeps its own queue and only ever needs one pending wake-up, so
//! the primitive is "fire this once at that instant" plus "never mind".

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One-shot wake trigger
pub trait WakeAlarm: Send + Sync {
    /// Replace any armed trigger with `fire` at `deadline`
    fn arm(&self, deadline: Instant, fire: Box<dyn FnOnce() + Send>);

    fn disarm(&self);
}

/// Alarm backed by a tokio sleep task
pub struct TokioAlarm {
    handle: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokioAlarm {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            task: Mutex::new(None),
        }
    }
}

impl WakeAlarm for TokioAlarm {
    fn arm(&self, deadline: Instant, fire: Box<dyn FnOnce() + Send>) {
        let task = self.handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire();
        });
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    fn disarm(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for TokioAlarm {
    fn drop(&mut self) {
        self.disarm();
    }
}
