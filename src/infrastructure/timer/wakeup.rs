//! Wakeup timer
//!
//! Ordered queue of `(trigger_at, seq, callback)` with a single armed alarm
//! that always targets the earliest entry. Due callbacks are handed, in
//! firing order, to one delivery task; they never run on the alarm path.

use super::alarm::{TokioAlarm, WakeAlarm};
use crate::domain::shared::{Result, UaError};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Something to run when its wake-up comes due
pub trait WakeupCallback: Send + Sync {
    fn on_wakeup(&self);
}

fn same_callback(a: &Arc<dyn WakeupCallback>, b: &Arc<dyn WakeupCallback>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct Entry {
    trigger_at: Instant,
    seq: u64,
    callback: Arc<dyn WakeupCallback>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.trigger_at == other.trigger_at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest entry
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .trigger_at
            .cmp(&self.trigger_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    queue: BinaryHeap<Entry>,
    next_seq: u64,
    armed_for: Option<Instant>,
    stopped: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    alarm: Box<dyn WakeAlarm>,
    delivery: mpsc::UnboundedSender<Arc<dyn WakeupCallback>>,
}

/// Sleep-safe scheduler for registration refresh, backoff and keepalive
#[derive(Clone)]
pub struct WakeupTimer {
    inner: Arc<TimerInner>,
}

impl WakeupTimer {
    /// Timer on the current tokio runtime
    pub fn new() -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| UaError::Runtime(e.to_string()))?;
        Ok(Self::with_alarm(Box::new(TokioAlarm::new(handle.clone())), &handle))
    }

    /// Timer driven by a custom alarm; the delivery task runs on `handle`
    pub fn with_alarm(alarm: Box<dyn WakeAlarm>, handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<dyn WakeupCallback>>();
        handle.spawn(async move {
            while let Some(callback) = rx.recv().await {
                callback.on_wakeup();
            }
            debug!("Wakeup delivery task finished");
        });

        Self {
            inner: Arc::new(TimerInner {
                state: Mutex::new(TimerState {
                    queue: BinaryHeap::new(),
                    next_seq: 0,
                    armed_for: None,
                    stopped: false,
                }),
                alarm,
                delivery: tx,
            }),
        }
    }

    /// Run `callback` once, `delay` from now
    pub fn set(&self, delay: Duration, callback: Arc<dyn WakeupCallback>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return Err(UaError::TimerStopped);
        }

        let trigger_at = Instant::now() + delay;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Entry {
            trigger_at,
            seq,
            callback,
        });
        debug!("Wakeup #{} set for {:?} from now", seq, delay);

        if state.armed_for.map_or(true, |armed| trigger_at < armed) {
            TimerInner::arm_for_head(&self.inner, &mut state);
        }
        Ok(())
    }

    /// Remove every pending entry for `callback`
    pub fn cancel(&self, callback: &Arc<dyn WakeupCallback>) {
        let mut state = self.inner.state.lock();
        let before = state.queue.len();
        state.queue.retain(|e| !same_callback(&e.callback, callback));
        let removed = before - state.queue.len();
        if removed == 0 {
            return;
        }
        debug!("Wakeup cancelled {} entr{}", removed, if removed == 1 { "y" } else { "ies" });

        let head = state.queue.peek().map(|e| e.trigger_at);
        if head != state.armed_for {
            TimerInner::arm_for_head(&self.inner, &mut state);
        }
    }

    /// Drop every pending entry and refuse new ones
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        state.queue.clear();
        state.armed_for = None;
        self.inner.alarm.disarm();
        info!("Wakeup timer stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    /// Entries still queued
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Deadline the alarm is currently armed for
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.state.lock().armed_for
    }
}

impl TimerInner {
    fn arm_for_head(this: &Arc<TimerInner>, state: &mut TimerState) {
        match state.queue.peek() {
            Some(head) => {
                let deadline = head.trigger_at;
                state.armed_for = Some(deadline);
                let weak: Weak<TimerInner> = Arc::downgrade(this);
                this.alarm.arm(
                    deadline,
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            TimerInner::on_alarm(&inner);
                        }
                    }),
                );
            }
            None => {
                state.armed_for = None;
                this.alarm.disarm();
            }
        }
    }

    fn on_alarm(this: &Arc<TimerInner>) {
        let mut state = this.state.lock();
        if state.stopped {
            return;
        }
        state.armed_for = None;

        let due = state
            .queue
            .peek()
            .is_some_and(|head| head.trigger_at <= Instant::now());
        if due {
            if let Some(entry) = state.queue.pop() {
                debug!("Wakeup #{} fired", entry.seq);
                // Receiver lives as long as the delivery task
                let _ = this.delivery.send(entry.callback);
            }
        } else {
            debug!("Stale wakeup alarm; re-arming");
        }
        TimerInner::arm_for_head(this, &mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct Recorder {
        label: u32,
        log: Arc<Mutex<Vec<u32>>>,
    }

    impl WakeupCallback for Recorder {
        fn on_wakeup(&self) {
            self.log.lock().push(self.label);
        }
    }

    fn recorder(label: u32, log: &Arc<Mutex<Vec<u32>>>) -> Arc<dyn WakeupCallback> {
        Arc::new(Recorder {
            label,
            log: log.clone(),
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let timer = WakeupTimer::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        timer.set(Duration::from_millis(50), recorder(50, &log)).unwrap();
        timer.set(Duration::from_millis(10), recorder(10, &log)).unwrap();
        timer.set(Duration::from_millis(30), recorder(30, &log)).unwrap();
        assert_eq!(timer.pending(), 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;

        assert_eq!(*log.lock(), vec![10, 30, 50]);
        assert_eq!(timer.pending(), 0);
        assert_eq!(timer.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_earliest_rearms_for_next() {
        let timer = WakeupTimer::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let earliest = recorder(10, &log);
        timer.set(Duration::from_millis(50), recorder(50, &log)).unwrap();
        timer.set(Duration::from_millis(10), earliest.clone()).unwrap();
        timer.set(Duration::from_millis(30), recorder(30, &log)).unwrap();
        assert_eq!(timer.next_deadline(), Some(start + Duration::from_millis(10)));

        timer.cancel(&earliest);
        assert_eq!(timer.next_deadline(), Some(start + Duration::from_millis(30)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(*log.lock(), vec![30, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_removes_every_entry_of_callback() {
        let timer = WakeupTimer::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let repeated = recorder(1, &log);
        timer.set(Duration::from_millis(10), repeated.clone()).unwrap();
        timer.set(Duration::from_millis(20), repeated.clone()).unwrap();
        timer.cancel(&repeated);

        assert_eq!(timer.pending(), 0);
        assert_eq!(timer.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_refuses_new_entries() {
        let timer = WakeupTimer::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        timer.set(Duration::from_millis(10), recorder(1, &log)).unwrap();
        timer.stop();
        assert!(timer.is_stopped());
        assert_eq!(timer.pending(), 0);
        assert_eq!(
            timer.set(Duration::from_millis(10), recorder(2, &log)),
            Err(UaError::TimerStopped)
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        settle().await;
        assert!(log.lock().is_empty());
    }

    /// Alarm that only fires when the test says so
    struct ManualAlarm {
        armed: Mutex<Option<Box<dyn FnOnce() + Send>>>,
        arms: AtomicUsize,
    }

    impl WakeAlarm for Arc<ManualAlarm> {
        fn arm(&self, _deadline: Instant, fire: Box<dyn FnOnce() + Send>) {
            self.arms.fetch_add(1, AtomicOrdering::SeqCst);
            *self.armed.lock() = Some(fire);
        }

        fn disarm(&self) {
            self.armed.lock().take();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_alarm_only_rearms() {
        let alarm = Arc::new(ManualAlarm {
            armed: Mutex::new(None),
            arms: AtomicUsize::new(0),
        });
        let timer = WakeupTimer::with_alarm(Box::new(alarm.clone()), &Handle::current());
        let log = Arc::new(Mutex::new(Vec::new()));

        timer.set(Duration::from_secs(60), recorder(1, &log)).unwrap();
        assert_eq!(alarm.arms.load(AtomicOrdering::SeqCst), 1);

        // Fire long before the deadline, as a suspended clock would
        let fire = alarm.armed.lock().take().unwrap();
        fire();
        settle().await;

        assert!(log.lock().is_empty());
        assert_eq!(timer.pending(), 1);
        assert_eq!(alarm.arms.load(AtomicOrdering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        let fire = alarm.armed.lock().take().unwrap();
        fire();
        settle().await;

        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(timer.pending(), 0);
    }
}
