//! Readiness multiplexing over tables, timers and events.
//!
//! A [`Select`] keeps weak references to registered [`Selectable`]s and
//! blocks until one of them is ready, the timeout elapses or an
//! [`Interrupter`] fires.
//!
//! ## Wakeups
//!
//! Each round registers the select's waker with every selectable before
//! polling it, so a message arriving between the poll and the wait still
//! ends the wait. The doorbell counts rings; a wait only parks while the
//! count is unchanged since the round started.

use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Wake, Waker};
use std::time::{Duration, Instant};
use sync_types::{Result, SyncError};

static NEXT_SELECTABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a selectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SelectableId(u64);

impl SelectableId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_SELECTABLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SelectableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something a [`Select`] can wait on.
pub trait Selectable: Send + Sync {
    /// Stable identity, reported in [`SelectResult::Object`].
    fn selectable_id(&self) -> SelectableId;

    /// Higher priorities are polled first. Default 0.
    fn priority(&self) -> i32 {
        0
    }

    /// Check readiness without blocking.
    ///
    /// Tables report buffered data. Timers and events consume their pending
    /// firing when they report ready.
    fn poll_ready(&self) -> Result<bool>;

    /// Arrange for `waker` to be woken when readiness may have changed.
    fn register_waker(&self, waker: &Waker);

    /// Drop a waker passed to [`register_waker`](Self::register_waker).
    fn deregister_waker(&self, _waker: &Waker) {}

    /// Instant at which this selectable becomes ready on its own.
    fn deadline(&self) -> Option<Instant> {
        None
    }
}

/// Outcome of [`Select::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectResult {
    /// The identified selectable is ready.
    Object(SelectableId),
    /// Nothing became ready before the timeout.
    Timeout,
    /// An [`Interrupter`] fired.
    Signal,
}

/// Wakers interested in one selectable.
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
    wakers: Mutex<Vec<Waker>>,
}

impl WakerSet {
    pub(crate) fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub(crate) fn deregister(&self, waker: &Waker) {
        self.wakers.lock().retain(|w| !w.will_wake(waker));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.wakers.lock().len()
    }

    pub(crate) fn wake_all(&self) {
        let wakers = std::mem::take(&mut *self.wakers.lock());
        for waker in wakers {
            waker.wake();
        }
    }
}

#[derive(Debug, Default)]
struct DoorbellState {
    rings: u64,
    interrupted: bool,
}

#[derive(Debug, Default)]
struct Doorbell {
    state: Mutex<DoorbellState>,
    cond: Condvar,
}

impl Doorbell {
    fn ring(&self) {
        self.state.lock().rings += 1;
        self.cond.notify_all();
    }

    fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        state.rings += 1;
        drop(state);
        self.cond.notify_all();
    }

    fn rings(&self) -> u64 {
        self.state.lock().rings
    }

    fn take_interrupt(&self) -> bool {
        std::mem::take(&mut self.state.lock().interrupted)
    }

    /// Park until the ring count moves past `seen` or `until` passes.
    fn wait(&self, seen: u64, until: Option<Instant>) {
        let mut state = self.state.lock();
        while state.rings == seen {
            match until {
                Some(until) => {
                    if self.cond.wait_until(&mut state, until).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

impl Wake for Doorbell {
    fn wake(self: Arc<Self>) {
        self.ring();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ring();
    }
}

/// Handle that makes a blocked [`Select::select`] return
/// [`SelectResult::Signal`]. Cheap to clone and `Send`.
#[derive(Debug, Clone)]
pub struct Interrupter {
    doorbell: Arc<Doorbell>,
}

impl Interrupter {
    /// Interrupt the current or next select call.
    pub fn interrupt(&self) {
        self.doorbell.interrupt();
    }
}

struct Entry {
    id: SelectableId,
    handle: Weak<dyn Selectable>,
    last_used: u64,
}

/// Readiness multiplexer.
///
/// Registration never takes ownership: a selectable dropped by its owner is
/// silently forgotten on the next call. Dropping the select withdraws its
/// waker from every selectable still alive.
pub struct Select {
    entries: Vec<Entry>,
    doorbell: Arc<Doorbell>,
    waker: Waker,
    tick: u64,
}

impl fmt::Debug for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Select")
            .field("registered", &self.entries.len())
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

impl Default for Select {
    fn default() -> Self {
        Self::new()
    }
}

impl Select {
    /// Create an empty multiplexer.
    pub fn new() -> Self {
        let doorbell = Arc::new(Doorbell::default());
        Self {
            entries: Vec::new(),
            waker: Waker::from(Arc::clone(&doorbell)),
            doorbell,
            tick: 0,
        }
    }

    /// Register a selectable. Returns false if it was already registered.
    pub fn add_selectable<S: Selectable + 'static>(&mut self, selectable: &Arc<S>) -> bool {
        let id = selectable.selectable_id();
        if self.is_registered(id) {
            tracing::warn!("Selectable {} is already registered", id);
            return false;
        }
        let handle: Weak<dyn Selectable> = Arc::downgrade(selectable) as Weak<dyn Selectable>;
        self.entries.push(Entry {
            id,
            handle,
            last_used: 0,
        });
        true
    }

    /// Register several selectables of one kind.
    pub fn add_selectables<'a, S, I>(&mut self, selectables: I)
    where
        S: Selectable + 'static,
        I: IntoIterator<Item = &'a Arc<S>>,
    {
        for selectable in selectables {
            self.add_selectable(selectable);
        }
    }

    /// Unregister a selectable. Returns false if it was not registered.
    pub fn remove_selectable(&mut self, id: SelectableId) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = self.entries.remove(pos);
        if let Some(selectable) = entry.handle.upgrade() {
            selectable.deregister_waker(&self.waker);
        }
        true
    }

    /// Whether `id` is registered (and still alive).
    pub fn is_registered(&self, id: SelectableId) -> bool {
        self.entries
            .iter()
            .any(|e| e.id == id && e.handle.strong_count() > 0)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.handle.strong_count() > 0)
            .count()
    }

    /// True if nothing live is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle for interrupting this multiplexer from another thread.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            doorbell: Arc::clone(&self.doorbell),
        }
    }

    /// Wait for a registered selectable to become ready.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` polls once.
    /// Among ready selectables the highest priority wins, then the one
    /// selected least recently.
    ///
    /// # Errors
    ///
    /// [`SyncError::Select`] when a selectable fails to report readiness,
    /// for example because its store connection was closed.
    pub fn select(&mut self, timeout: Option<Duration>) -> Result<SelectResult> {
        // Durations too large to represent wait forever
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let waker = self.waker.clone();

        loop {
            if self.doorbell.take_interrupt() {
                return Ok(SelectResult::Signal);
            }
            let seen = self.doorbell.rings();

            self.entries.retain(|e| e.handle.strong_count() > 0);
            let mut order: Vec<usize> = (0..self.entries.len()).collect();
            let priorities: Vec<i32> = self
                .entries
                .iter()
                .map(|e| e.handle.upgrade().map_or(i32::MIN, |s| s.priority()))
                .collect();
            order.sort_by_key(|&i| (Reverse(priorities[i]), self.entries[i].last_used));

            let mut wake_at = deadline;
            for i in order {
                let Some(selectable) = self.entries[i].handle.upgrade() else {
                    continue;
                };
                selectable.register_waker(&waker);
                let ready = selectable.poll_ready().map_err(|err| {
                    tracing::error!("Selectable {} failed: {}", self.entries[i].id, err);
                    SyncError::Select(format!("selectable {}: {}", self.entries[i].id, err))
                })?;
                if ready {
                    self.tick += 1;
                    self.entries[i].last_used = self.tick;
                    return Ok(SelectResult::Object(self.entries[i].id));
                }
                if let Some(at) = selectable.deadline() {
                    wake_at = Some(wake_at.map_or(at, |w| w.min(at)));
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(SelectResult::Timeout);
            }
            self.doorbell.wait(seen, wake_at);
        }
    }
}

impl Drop for Select {
    fn drop(&mut self) {
        for entry in &self.entries {
            if let Some(selectable) = entry.handle.upgrade() {
                selectable.deregister_waker(&self.waker);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    /// Manually toggled selectable.
    struct Flag {
        id: SelectableId,
        priority: i32,
        ready: AtomicBool,
        fail: AtomicBool,
        wakers: WakerSet,
    }

    impl Flag {
        fn new(priority: i32) -> Arc<Self> {
            Arc::new(Self {
                id: SelectableId::next(),
                priority,
                ready: AtomicBool::new(false),
                fail: AtomicBool::new(false),
                wakers: WakerSet::default(),
            })
        }

        fn set(&self, ready: bool) {
            self.ready.store(ready, Ordering::SeqCst);
            self.wakers.wake_all();
        }
    }

    impl Selectable for Flag {
        fn selectable_id(&self) -> SelectableId {
            self.id
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn poll_ready(&self) -> Result<bool> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncError::StoreUnavailable("closed".into()));
            }
            Ok(self.ready.load(Ordering::SeqCst))
        }

        fn register_waker(&self, waker: &Waker) {
            self.wakers.register(waker);
        }

        fn deregister_waker(&self, waker: &Waker) {
            self.wakers.deregister(waker);
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    #[test]
    fn duplicate_add_is_ignored() {
        let flag = Flag::new(0);
        let mut select = Select::new();
        assert!(select.add_selectable(&flag));
        assert!(!select.add_selectable(&flag));
        assert_eq!(select.len(), 1);
    }

    #[test]
    fn dropped_selectable_is_forgotten() {
        let flag = Flag::new(0);
        let mut select = Select::new();
        select.add_selectable(&flag);
        drop(flag);
        assert!(select.is_empty());
        assert_eq!(
            select.select(Some(Duration::ZERO)).unwrap(),
            SelectResult::Timeout
        );
    }

    #[test]
    fn short_lived_selects_leave_no_wakers_behind() {
        let flag = Flag::new(0);
        for _ in 0..100 {
            let mut select = Select::new();
            select.add_selectable(&flag);
            assert_eq!(
                select.select(Some(Duration::ZERO)).unwrap(),
                SelectResult::Timeout
            );
            assert_eq!(flag.wakers.len(), 1);
        }
        assert_eq!(flag.wakers.len(), 0);

        let mut select = Select::new();
        select.add_selectable(&flag);
        select.select(Some(Duration::ZERO)).unwrap();
        select.remove_selectable(flag.selectable_id());
        assert_eq!(flag.wakers.len(), 0);
    }

    #[test]
    fn remove_selectable() {
        let flag = Flag::new(0);
        flag.set(true);
        let mut select = Select::new();
        select.add_selectable(&flag);
        assert!(select.remove_selectable(flag.selectable_id()));
        assert!(!select.remove_selectable(flag.selectable_id()));
        assert_eq!(
            select.select(Some(Duration::ZERO)).unwrap(),
            SelectResult::Timeout
        );
    }

    // =========================================================================
    // Select
    // =========================================================================

    #[test]
    fn returns_ready_object() {
        let idle = Flag::new(0);
        let ready = Flag::new(0);
        ready.set(true);

        let mut select = Select::new();
        select.add_selectables([&idle, &ready]);

        assert_eq!(
            select.select(Some(Duration::from_millis(10))).unwrap(),
            SelectResult::Object(ready.selectable_id())
        );
    }

    #[test]
    fn times_out_when_nothing_ready() {
        let idle = Flag::new(0);
        let mut select = Select::new();
        select.add_selectable(&idle);

        let start = Instant::now();
        assert_eq!(
            select.select(Some(Duration::from_millis(50))).unwrap(),
            SelectResult::Timeout
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wakes_when_object_becomes_ready() {
        let flag = Flag::new(0);
        let mut select = Select::new();
        select.add_selectable(&flag);

        let remote = Arc::clone(&flag);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.set(true);
        });

        assert_eq!(
            select.select(Some(Duration::from_secs(5))).unwrap(),
            SelectResult::Object(flag.selectable_id())
        );
        handle.join().unwrap();
    }

    #[test]
    fn higher_priority_wins() {
        let low = Flag::new(0);
        let high = Flag::new(10);
        low.set(true);
        high.set(true);

        let mut select = Select::new();
        select.add_selectable(&low);
        select.add_selectable(&high);

        for _ in 0..3 {
            assert_eq!(
                select.select(Some(Duration::ZERO)).unwrap(),
                SelectResult::Object(high.selectable_id())
            );
        }
    }

    #[test]
    fn equal_priority_rotates_least_recently_used() {
        let a = Flag::new(0);
        let b = Flag::new(0);
        a.set(true);
        b.set(true);

        let mut select = Select::new();
        select.add_selectables([&a, &b]);

        let first = select.select(Some(Duration::ZERO)).unwrap();
        let second = select.select(Some(Duration::ZERO)).unwrap();
        let third = select.select(Some(Duration::ZERO)).unwrap();

        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn interrupter_signals() {
        let flag = Flag::new(0);
        let mut select = Select::new();
        select.add_selectable(&flag);
        let interrupter = select.interrupter();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            interrupter.interrupt();
        });

        assert_eq!(select.select(None).unwrap(), SelectResult::Signal);
        handle.join().unwrap();

        // Interrupt is consumed
        assert_eq!(
            select.select(Some(Duration::ZERO)).unwrap(),
            SelectResult::Timeout
        );
    }

    #[test]
    fn failing_selectable_is_an_error() {
        let flag = Flag::new(0);
        flag.fail.store(true, Ordering::SeqCst);
        let mut select = Select::new();
        select.add_selectable(&flag);

        assert!(matches!(
            select.select(Some(Duration::ZERO)),
            Err(SyncError::Select(_))
        ));
    }
}
