use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use log::warn;

const SHUTDOWN_ROUND_LIMIT: usize = 100_000;

thread_local! {
    static CURRENT_TIME: Cell<u64> = const { Cell::new(0) };
    static NEXT_WAKE_TIME: Cell<Option<u64>> = const { Cell::new(None) };
    static PARKED_ON: Cell<Option<TriggerId>> = const { Cell::new(None) };
    static NEXT_TRIGGER_ID: Cell<u64> = const { Cell::new(0) };
    static NEXT_DRIVER_ID: Cell<u64> = const { Cell::new(0) };
    static NOTIFIED: RefCell<Vec<Notification>> = const { RefCell::new(Vec::new()) };
    // Parked task count per trigger and driver, across every live driver on this thread.
    static WAITING: RefCell<BTreeMap<TriggerId, BTreeMap<u64, usize>>> =
        const { RefCell::new(BTreeMap::new()) };
    static PENDING_EVENTS: RefCell<Vec<DriverEvent>> = const { RefCell::new(Vec::new()) };
}

/// Events that interrupt [`AsyncDriver::run_for`] before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    /// The slice ran up to its deadline.
    Deadline,
    /// A display finished streaming a frame to its backend.
    FramePresented,
    /// The rendering backend asked for the simulation to stop.
    Quit,
    User(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverRunResult {
    pub event: DriverEvent,
    pub elapsed_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct TriggerId(u64);

/// A pending wake-up and the drivers that still have to deliver it.
struct Notification {
    trigger: TriggerId,
    drivers: Vec<u64>,
}

/// Cooperative stop flag shared by every perpetual device loop.
#[derive(Clone, Default)]
pub struct ShutdownToken(Rc<Cell<bool>>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

impl fmt::Debug for ShutdownToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ShutdownToken").field(&self.0.get()).finish()
    }
}

/// Edge-triggered, payload-free notification.
///
/// Only tasks already parked in [`Trigger::wait`] when [`Trigger::notify`]
/// runs are resumed. A notification with no waiter is dropped, and several
/// notifications before the waiter runs again collapse into one wake-up.
///
/// Several drivers may live on one thread. A notification is addressed to
/// the drivers holding a waiter when it is raised, and each of them wakes
/// its own waiters the next time it runs.
#[derive(Clone)]
pub struct Trigger {
    id: TriggerId,
    name: Rc<str>,
}

impl Trigger {
    pub fn new(name: &str) -> Self {
        let id = NEXT_TRIGGER_ID.with(|cell| {
            let id = cell.get();
            cell.set(id + 1);
            id
        });
        Self {
            id: TriggerId(id),
            name: Rc::from(name),
        }
    }

    pub fn notify(&self) {
        let drivers: Vec<u64> = WAITING.with(|waiting| {
            waiting
                .borrow()
                .get(&self.id)
                .map(|per_driver| per_driver.keys().copied().collect())
                .unwrap_or_default()
        });
        if drivers.is_empty() {
            return;
        }
        NOTIFIED.with(|list| {
            list.borrow_mut().push(Notification {
                trigger: self.id,
                drivers,
            })
        });
    }

    pub fn wait(&self) -> TriggerWait {
        TriggerWait {
            id: self.id,
            parked: false,
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("id", &self.id.0)
            .field("name", &self.name)
            .finish()
    }
}

pub struct TriggerWait {
    id: TriggerId,
    parked: bool,
}

impl Future for TriggerWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.parked {
            PARKED_ON.with(|cell| cell.set(Some(this.id)));
            this.parked = true;
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

pub struct TimeSleep {
    ns: u64,
    initialized: bool,
}

impl Future for TimeSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let now = current_time();
        if !this.initialized {
            NEXT_WAKE_TIME.with(|cell| {
                cell.set(Some(now.saturating_add(this.ns)));
            });
            this.initialized = true;
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

pub fn sleep_ns(ns: u64) -> TimeSleep {
    TimeSleep {
        ns,
        initialized: false,
    }
}

pub fn sleep_us(us: u64) -> TimeSleep {
    sleep_ns(us.saturating_mul(1_000))
}

/// Simulated time in nanoseconds of the task currently being polled.
pub fn current_time() -> u64 {
    CURRENT_TIME.with(|cell| cell.get())
}

pub fn emit_event(event: DriverEvent) {
    PENDING_EVENTS.with(|events| events.borrow_mut().push(event));
}

type Task = Pin<Box<dyn Future<Output = ()>>>;

/// Single-threaded discrete-event scheduler.
///
/// Tasks sleeping until a point in time live in a time-ordered queue; tasks
/// waiting on a [`Trigger`] are parked per trigger and only move back to the
/// time queue (at the current time) when that trigger is notified.
pub struct AsyncDriver {
    id: u64,
    now: u64,
    timed: BTreeMap<u64, Vec<Task>>,
    parked: HashMap<TriggerId, Vec<Task>>,
    events_queue: VecDeque<DriverEvent>,
    token: ShutdownToken,
}

impl AsyncDriver {
    pub fn new() -> Self {
        let id = NEXT_DRIVER_ID.with(|cell| {
            let id = cell.get();
            cell.set(id + 1);
            id
        });
        Self {
            id,
            now: 0,
            timed: BTreeMap::new(),
            parked: HashMap::new(),
            events_queue: VecDeque::new(),
            token: ShutdownToken::new(),
        }
    }

    pub fn with_time(now: u64) -> Self {
        let mut driver = Self::new();
        driver.now = now;
        driver
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }

    pub fn task_count(&self) -> usize {
        self.timed.values().map(Vec::len).sum::<usize>()
            + self.parked.values().map(Vec::len).sum::<usize>()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.values().map(Vec::len).sum()
    }

    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.timed.entry(self.now).or_default().push(Box::pin(future));
    }

    /// Advance the timeline by at most `max_ns`, stopping early on the first
    /// [`DriverEvent`] raised by a task.
    pub fn run_for(&mut self, max_ns: u64) -> DriverRunResult {
        CURRENT_TIME.with(|cell| cell.set(self.now));
        self.collect_events();
        if let Some(event) = self.events_queue.pop_front() {
            return DriverRunResult {
                event,
                elapsed_ns: 0,
            };
        }

        let start = self.now;
        let target = start.saturating_add(max_ns);
        self.wake_notified();

        while let Some(&next) = self.timed.keys().next() {
            if next >= target {
                break;
            }

            self.now = next;
            CURRENT_TIME.with(|cell| cell.set(self.now));

            let tasks = self.timed.remove(&next).unwrap_or_default();
            for task in tasks {
                self.poll_task(task);
            }

            if let Some(event) = self.events_queue.pop_front() {
                return DriverRunResult {
                    event,
                    elapsed_ns: self.now - start,
                };
            }
        }

        self.now = self.now.max(target);
        CURRENT_TIME.with(|cell| cell.set(self.now));
        DriverRunResult {
            event: DriverEvent::Deadline,
            elapsed_ns: self.now - start,
        }
    }

    /// Cancel the shared token and resume every sleeping or parked task until
    /// all of them have returned. Returns the number of polls performed.
    pub fn shutdown(&mut self) -> usize {
        self.token.cancel();
        CURRENT_TIME.with(|cell| cell.set(self.now));
        let mut polls = 0;
        for _ in 0..SHUTDOWN_ROUND_LIMIT {
            let mut ready: Vec<Task> = std::mem::take(&mut self.timed)
                .into_values()
                .flatten()
                .collect();
            ready.extend(self.release_parked());
            if ready.is_empty() {
                break;
            }
            for task in ready {
                polls += 1;
                self.poll_task(task);
            }
        }
        let leftover = self.task_count();
        if leftover > 0 {
            warn!("shutdown dropped {leftover} task(s) that ignored the shutdown token");
            self.timed.clear();
            self.release_parked();
        }
        self.events_queue.clear();
        self.collect_events();
        self.events_queue.clear();
        polls
    }

    fn poll_task(&mut self, mut task: Task) {
        NEXT_WAKE_TIME.with(|cell| cell.set(None));
        PARKED_ON.with(|cell| cell.set(None));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let pending = task.as_mut().poll(&mut cx).is_pending();

        // Notifications raised during this poll only reach tasks that were
        // parked before it, never the task that is about to park now.
        self.wake_notified();

        if pending {
            if let Some(id) = PARKED_ON.with(|cell| cell.take()) {
                adjust_waiting(id, self.id, 1, 0);
                self.parked.entry(id).or_default().push(task);
            } else {
                let wake = NEXT_WAKE_TIME
                    .with(|cell| cell.get())
                    .unwrap_or(self.now.saturating_add(1));
                self.timed.entry(wake.max(self.now)).or_default().push(task);
            }
        }

        self.collect_events();
    }

    fn wake_notified(&mut self) {
        let mine: Vec<TriggerId> = NOTIFIED.with(|list| {
            let mut list = list.borrow_mut();
            let mut mine = Vec::new();
            list.retain_mut(|note| {
                if let Some(pos) = note.drivers.iter().position(|&d| d == self.id) {
                    note.drivers.swap_remove(pos);
                    mine.push(note.trigger);
                }
                !note.drivers.is_empty()
            });
            mine
        });
        for id in mine {
            if let Some(waiters) = self.parked.remove(&id) {
                adjust_waiting(id, self.id, 0, waiters.len());
                self.timed.entry(self.now).or_default().extend(waiters);
            }
        }
    }

    fn release_parked(&mut self) -> Vec<Task> {
        let parked = std::mem::take(&mut self.parked);
        let mut tasks = Vec::new();
        for (id, waiters) in parked {
            adjust_waiting(id, self.id, 0, waiters.len());
            tasks.extend(waiters);
        }
        tasks
    }

    fn collect_events(&mut self) {
        let events = PENDING_EVENTS.with(|events| std::mem::take(&mut *events.borrow_mut()));
        self.events_queue.extend(events);
    }
}

impl Drop for AsyncDriver {
    fn drop(&mut self) {
        self.release_parked();
        let id = self.id;
        let _ = NOTIFIED.try_with(|list| {
            list.borrow_mut().retain_mut(|note| {
                note.drivers.retain(|&d| d != id);
                !note.drivers.is_empty()
            })
        });
    }
}

fn adjust_waiting(id: TriggerId, driver: u64, add: usize, remove: usize) {
    // Thread-locals may already be torn down when a driver drops at thread exit.
    let _ = WAITING.try_with(|waiting| {
        let mut waiting = waiting.borrow_mut();
        let per_driver = waiting.entry(id).or_default();
        let count = per_driver.entry(driver).or_insert(0);
        *count = (*count + add).saturating_sub(remove);
        if *count == 0 {
            per_driver.remove(&driver);
        }
        if per_driver.is_empty() {
            waiting.remove(&id);
        }
    });
}

fn noop_waker() -> Waker {
    unsafe { Waker::from_raw(noop_raw_waker()) }
}

fn noop_raw_waker() -> RawWaker {
    RawWaker::new(std::ptr::null(), &NOOP_WAKER_VTABLE)
}

fn noop_clone(_: *const ()) -> RawWaker {
    noop_raw_waker()
}

fn noop(_: *const ()) {}

static NOOP_WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(noop_clone, noop, noop, noop);

impl Default for AsyncDriver {
    fn default() -> Self {
        Self::new()
    }
}
