//! Interval timer usable with [`Select`](crate::Select).

use parking_lot::Mutex;
use std::task::Waker;
use std::time::{Duration, Instant};
use sync_types::Result;

use crate::select::{Selectable, SelectableId, WakerSet};

#[derive(Debug)]
struct TimerState {
    interval: Duration,
    running: bool,
    // None while stopped, or when the interval reaches past what Instant can hold
    next_fire: Option<Instant>,
}

impl TimerState {
    fn arm(&mut self, now: Instant) {
        self.next_fire = now.checked_add(self.interval);
    }
}

/// A periodic timer.
///
/// Stopped on creation. Once started it becomes ready every `interval`;
/// a select that reports it consumes the firing and re-arms the timer.
#[derive(Debug)]
pub struct SelectableTimer {
    id: SelectableId,
    priority: i32,
    state: Mutex<TimerState>,
    wakers: WakerSet,
}

impl SelectableTimer {
    /// Create a stopped timer.
    pub fn new(interval: Duration) -> Self {
        Self::with_priority(interval, 0)
    }

    /// Create a stopped timer with a select priority.
    pub fn with_priority(interval: Duration, priority: i32) -> Self {
        Self {
            id: SelectableId::next(),
            priority,
            state: Mutex::new(TimerState {
                interval,
                running: false,
                next_fire: None,
            }),
            wakers: WakerSet::default(),
        }
    }

    /// Arm the timer to fire one interval from now.
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            state.running = true;
            state.arm(Instant::now());
        }
        self.wakers.wake_all();
    }

    /// Disarm the timer.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.running = false;
            state.next_fire = None;
        }
        self.wakers.wake_all();
    }

    /// Restart the countdown from now.
    pub fn reset(&self) {
        self.stop();
        self.start();
    }

    /// Change the interval. A running timer is re-armed with it.
    pub fn set_interval(&self, interval: Duration) {
        let running = {
            let mut state = self.state.lock();
            state.interval = interval;
            if state.running {
                state.arm(Instant::now());
            }
            state.running
        };
        if running {
            self.wakers.wake_all();
        }
    }

    /// Current interval.
    pub fn interval(&self) -> Duration {
        self.state.lock().interval
    }

    /// True while armed.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

impl Selectable for SelectableTimer {
    fn selectable_id(&self) -> SelectableId {
        self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn poll_ready(&self) -> Result<bool> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.next_fire {
            Some(at) if at <= now => {
                state.arm(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn register_waker(&self, waker: &Waker) {
        self.wakers.register(waker);
    }

    fn deregister_waker(&self, waker: &Waker) {
        self.wakers.deregister(waker);
    }

    fn deadline(&self) -> Option<Instant> {
        self.state.lock().next_fire
    }
}
