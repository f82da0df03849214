//! Cooperative single-threaded task runtime
//!
//! Tasks are `async` blocks boxed into a slot table. A task suspends at an
//! explicit point and tells the runtime why, through the [`Handle`] it was
//! given: a timed sleep, a background sleep, a transport-readiness wait, or a
//! plain yield. Anything else that returns `Pending` (a mutex, a join handle)
//! parks the task until its waker fires.
//!
//! # Main loop
//!
//! Each iteration:
//! 1. promote one background task if it is past the grace period, or if the
//!    run queue is empty and the task is due (and no normal timer is due);
//! 2. move every expired timer entry onto the run queue;
//! 3. step each task on the run queue exactly once, interleaved with the
//!    tasks waiting on I/O;
//! 4. if nothing is runnable, idle the core until the next deadline.
//!
//! Cancellation is cooperative: the task is dropped at its next resumption,
//! which releases anything it held through its guards. A task that already
//! finished is unaffected.

mod join;
mod queue;
mod task;
mod time;
mod waker;

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::sync::Arc;
use core::cell::{Cell, RefCell};
use core::future::{poll_fn, Future};
use core::task::{Context, Poll};

use datalogger_hal::time::{Duration, Instant, Monotonic};
use embassy_futures::select::{select, Either};
use embedded_io::ReadReady;

use queue::{Entry, Queues, TimerEntry};
use task::{Completion, Task, TaskFuture, TaskState, TaskTable};
use waker::WakeList;

pub use join::{join_all, JoinAll};
pub use task::{Cancelled, JoinHandle, SpawnError, TaskId};
pub use time::{Sleep, TimedOut, YieldNow};

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum number of live tasks
    pub max_tasks: usize,
    /// Background tasks overdue by more than this run even when normal work
    /// is pending. `None` lets background work starve indefinitely.
    pub max_overdue: Option<Duration>,
    /// How often tasks waiting on transport readiness are re-checked
    pub io_poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_tasks: 16,
            max_overdue: None,
            io_poll_interval: Duration::millis(50),
        }
    }
}

/// Error from [`Runtime::run_until_complete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunError {
    /// The main task could not be spawned
    Spawn(SpawnError),
    /// The loop was stopped, or the main task cancelled, before it finished
    Incomplete,
}

impl core::fmt::Display for RunError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "Spawn failed: {}", e),
            Self::Incomplete => write!(f, "Main task did not complete"),
        }
    }
}

impl core::error::Error for RunError {}

/// What the task being polled asked to wait for
#[derive(Debug, Clone, Copy, Default)]
struct WaitRequest {
    deadline: Option<Instant>,
    background: bool,
    io: bool,
    yielded: bool,
}

enum Start {
    Now,
    At(Instant),
    Background(Instant),
}

pub(crate) struct Shared {
    clock: Box<dyn Monotonic>,
    config: RuntimeConfig,
    tasks: RefCell<TaskTable>,
    queues: RefCell<Queues>,
    wakes: Arc<WakeList>,
    current: Cell<Option<TaskId>>,
    wait: Cell<WaitRequest>,
    stopped: Cell<bool>,
}

impl Shared {
    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn request_wake_at(&self, at: Instant, background: bool) {
        let mut wait = self.wait.get();
        wait.background = match wait.deadline {
            None => background,
            Some(_) => wait.background && background,
        };
        wait.deadline = Some(wait.deadline.map_or(at, |d| d.min(at)));
        self.wait.set(wait);
    }

    fn request_io(&self) {
        let mut wait = self.wait.get();
        wait.io = true;
        self.wait.set(wait);
    }

    fn request_yield(&self) {
        let mut wait = self.wait.get();
        wait.yielded = true;
        self.wait.set(wait);
    }

    fn spawn<F>(&self, future: F, start: Start) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let completion = Rc::new(Completion::new());
        let future = task::wrap(future, completion.clone());
        let wakes = &self.wakes;
        let id = self.tasks.borrow_mut().insert(|id| Task {
            future: Some(future),
            state: match start {
                Start::Now => TaskState::Queued,
                _ => TaskState::Waiting,
            },
            epoch: 0,
            cancel_requested: false,
            waker: waker::task_waker(id, wakes),
        })?;

        let entry = Entry { task: id, epoch: 0 };
        let mut queues = self.queues.borrow_mut();
        match start {
            Start::Now => queues.run.push_back(entry),
            Start::At(at) => queues.timers.push(at, entry),
            Start::Background(at) => queues.background.push(at, entry),
        }
        trace!("Spawned {}", id);
        Ok(JoinHandle::new(id, completion))
    }

    fn cancel(&self, id: TaskId) -> bool {
        let mut tasks = self.tasks.borrow_mut();
        let Some(task) = tasks.get_mut(id) else {
            return false;
        };
        task.cancel_requested = true;
        if matches!(task.state, TaskState::Waiting | TaskState::Parked) {
            let mut queues = self.queues.borrow_mut();
            queues.io.retain(|e| e.task != id);
            make_ready(task, id, &mut queues);
        }
        debug!("Cancel requested for {}", id);
        true
    }

    /// Move tasks whose wakers fired onto the run queue
    fn collect_wakes(&self) {
        let woken = self.wakes.take();
        if woken.is_empty() {
            return;
        }
        let mut tasks = self.tasks.borrow_mut();
        let mut queues = self.queues.borrow_mut();
        for id in woken {
            if let Some(task) = tasks.get_mut(id) {
                if matches!(task.state, TaskState::Waiting | TaskState::Parked) {
                    make_ready(task, id, &mut queues);
                }
            }
        }
    }

    fn promote_background(&self, now: Instant) {
        let mut tasks = self.tasks.borrow_mut();
        let mut queues = self.queues.borrow_mut();
        let queues = &mut *queues;
        queues.background.prune(|e| is_waiting(&mut tasks, e));
        let Some(head) = queues.background.peek().copied() else {
            return;
        };

        let now = now.ticks();
        let mut promote = match self.config.max_overdue {
            Some(grace) => now.saturating_sub(head.deadline) > grace.ticks(),
            None => false,
        };
        if !promote && queues.run.is_empty() && head.deadline <= now {
            queues.timers.prune(|e| is_waiting(&mut tasks, e));
            promote = queues.timers.peek().is_none_or(|t| t.deadline > now);
        }

        if promote {
            queues.background.pop();
            if let Some(task) = tasks.get_mut(head.task) {
                trace!("Promoting background {}", head.task);
                make_ready(task, head.task, queues);
            }
        }
    }

    fn expire_timers(&self, now: Instant) {
        let mut tasks = self.tasks.borrow_mut();
        let mut queues = self.queues.borrow_mut();
        let queues = &mut *queues;
        while let Some(head) = queues.timers.peek().copied() {
            if head.deadline > now.ticks() {
                break;
            }
            queues.timers.pop();
            if is_waiting(&mut tasks, &head) {
                if let Some(task) = tasks.get_mut(head.task) {
                    make_ready(task, head.task, queues);
                }
            }
        }
    }

    /// Step every task queued at the start of the pass exactly once
    fn run_pass(&self) {
        let (mut run, mut io) = {
            let queues = self.queues.borrow();
            (queues.run.len(), queues.io.len())
        };
        while (run > 0 || io > 0) && !self.stopped.get() {
            if io > 0 {
                io -= 1;
                let entry = self.queues.borrow_mut().io.pop_front();
                if let Some(entry) = entry {
                    self.step(entry, TaskState::Waiting);
                }
            }
            if run > 0 && !self.stopped.get() {
                run -= 1;
                let entry = self.queues.borrow_mut().run.pop_front();
                if let Some(entry) = entry {
                    self.step(entry, TaskState::Queued);
                }
            }
        }
    }

    fn step(&self, entry: Entry, expected: TaskState) {
        let (mut future, waker, cancelled) = {
            let mut tasks = self.tasks.borrow_mut();
            let Some(task) = tasks.get_mut(entry.task) else {
                return;
            };
            if task.epoch != entry.epoch || task.state != expected {
                return;
            }
            let Some(future) = task.future.take() else {
                return;
            };
            task.state = TaskState::Running;
            task.epoch = task.epoch.wrapping_add(1);
            (future, task.waker.clone(), task.cancel_requested)
        };

        if cancelled {
            let removed = self.tasks.borrow_mut().remove(entry.task);
            debug!("Dropped cancelled {}", entry.task);
            // Drop outside the borrow: guards may call back into the runtime.
            drop(removed);
            drop(future);
            return;
        }

        self.current.set(Some(entry.task));
        self.wait.set(WaitRequest::default());
        let poll = future.as_mut().poll(&mut Context::from_waker(&waker));
        self.current.set(None);
        let wait = self.wait.take();

        match poll {
            Poll::Ready(()) => {
                let removed = self.tasks.borrow_mut().remove(entry.task);
                trace!("Finished {}", entry.task);
                drop(removed);
                drop(future);
            }
            Poll::Pending => self.suspend(entry.task, future, wait),
        }
    }

    fn suspend(&self, id: TaskId, future: TaskFuture, wait: WaitRequest) {
        let mut tasks = self.tasks.borrow_mut();
        let Some(task) = tasks.get_mut(id) else {
            return;
        };
        task.future = Some(future);
        let mut queues = self.queues.borrow_mut();
        let entry = Entry {
            task: id,
            epoch: task.epoch,
        };

        if task.cancel_requested || wait.yielded {
            task.state = TaskState::Queued;
            queues.run.push_back(entry);
        } else if wait.io {
            task.state = TaskState::Waiting;
            queues.io.push_back(entry);
            if let Some(deadline) = wait.deadline {
                queues.timers.push(deadline, entry);
            }
        } else if let Some(deadline) = wait.deadline {
            task.state = TaskState::Waiting;
            if wait.background {
                queues.background.push(deadline, entry);
            } else {
                queues.timers.push(deadline, entry);
            }
        } else {
            task.state = TaskState::Parked;
        }
    }

    /// Earliest instant at which something becomes runnable
    fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let mut tasks = self.tasks.borrow_mut();
        let mut queues = self.queues.borrow_mut();
        let queues = &mut *queues;
        queues.timers.prune(|e| is_waiting(&mut tasks, e));
        queues.background.prune(|e| is_waiting(&mut tasks, e));

        let io = (!queues.io.is_empty()).then(|| now.ticks() + self.config.io_poll_interval.ticks());
        [
            queues.timers.peek().map(|e| e.deadline),
            queues.background.peek().map(|e| e.deadline),
            io,
        ]
        .into_iter()
        .flatten()
        .min()
        .map(Instant::from_ticks)
    }
}

fn is_waiting(tasks: &mut TaskTable, entry: &TimerEntry) -> bool {
    tasks
        .get_mut(entry.task)
        .is_some_and(|t| t.epoch == entry.epoch && t.state == TaskState::Waiting)
}

fn make_ready(task: &mut Task, id: TaskId, queues: &mut Queues) {
    task.state = TaskState::Queued;
    task.epoch = task.epoch.wrapping_add(1);
    queues.run.push_back(Entry {
        task: id,
        epoch: task.epoch,
    });
}

/// The runtime: owns the task table and drives the main loop
///
/// Created at wake and dropped before deep sleep. Dropping it drops every
/// remaining task, which releases whatever those tasks held.
pub struct Runtime {
    shared: Rc<Shared>,
}

impl Runtime {
    pub fn new(clock: impl Monotonic + 'static, config: RuntimeConfig) -> Self {
        let tasks = TaskTable::new(config.max_tasks);
        Self {
            shared: Rc::new(Shared {
                clock: Box::new(clock),
                config,
                tasks: RefCell::new(tasks),
                queues: RefCell::new(Queues::default()),
                wakes: Arc::new(WakeList::new()),
                current: Cell::new(None),
                wait: Cell::new(WaitRequest::default()),
                stopped: Cell::new(false),
            }),
        }
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    /// Number of live tasks
    pub fn task_count(&self) -> usize {
        self.shared.tasks.borrow().len()
    }

    /// Run until [`Handle::stop`] is called or no tasks remain.
    pub fn run(&self) {
        let shared = &*self.shared;
        shared.stopped.set(false);
        loop {
            shared.collect_wakes();
            let now = shared.now();
            shared.promote_background(now);
            shared.expire_timers(now);
            shared.run_pass();
            if shared.stopped.get() {
                debug!("Runtime stopped");
                break;
            }
            shared.collect_wakes();
            if shared.tasks.borrow().is_empty() {
                debug!("No tasks left");
                break;
            }
            if shared.queues.borrow().run.is_empty() {
                let deadline = shared.next_deadline(shared.now());
                shared.clock.idle_until(deadline);
            }
        }
    }

    /// Spawn `future` as the main task and run until it finishes.
    ///
    /// Other tasks still live at that point stay in the table until the
    /// runtime is dropped.
    pub fn run_until_complete<F>(&self, future: F) -> Result<F::Output, RunError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let handle = self.handle();
        let stopper = handle.clone();
        let main = handle
            .spawn(async move {
                let output = future.await;
                stopper.stop();
                output
            })
            .map_err(RunError::Spawn)?;
        self.run();
        match main.try_take() {
            Some(Ok(output)) => Ok(output),
            Some(Err(Cancelled)) | None => Err(RunError::Incomplete),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let drained = self.shared.tasks.borrow_mut().drain();
        *self.shared.queues.borrow_mut() = Queues::default();
        drop(drained);
    }
}

/// Cloneable access to the runtime from inside tasks
#[derive(Clone)]
pub struct Handle {
    shared: Rc<Shared>,
}

impl Handle {
    pub fn now(&self) -> Instant {
        self.shared.now()
    }

    /// Task currently being stepped
    pub fn current(&self) -> Option<TaskId> {
        self.shared.current.get()
    }

    pub fn sleep(&self, duration: Duration) -> Sleep {
        self.sleep_until(self.now() + duration)
    }

    pub fn sleep_until(&self, deadline: Instant) -> Sleep {
        Sleep {
            shared: self.shared.clone(),
            deadline,
            background: false,
        }
    }

    /// Sleep on the background queue: resumes only when no normal work is
    /// due, or once the grace period is exceeded.
    pub fn sleep_background(&self, duration: Duration) -> Sleep {
        Sleep {
            shared: self.shared.clone(),
            deadline: self.now() + duration,
            background: true,
        }
    }

    /// Go to the back of the run queue
    pub fn yield_now(&self) -> YieldNow {
        YieldNow {
            shared: self.shared.clone(),
            yielded: false,
        }
    }

    /// Run `future` as a new task, starting on the next pass
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.shared.spawn(future, Start::Now)
    }

    /// Run `future` as a new task once `delay` has elapsed
    pub fn spawn_after<F>(
        &self,
        delay: Duration,
        future: F,
    ) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.shared.spawn(future, Start::At(self.now() + delay))
    }

    /// Run `future` as background work once `delay` has elapsed
    pub fn spawn_background<F>(
        &self,
        delay: Duration,
        future: F,
    ) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.shared
            .spawn(future, Start::Background(self.now() + delay))
    }

    /// Request cancellation. Returns `false` if the task already finished.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.shared.cancel(id)
    }

    /// Make [`Runtime::run`] return after the current step
    pub fn stop(&self) {
        self.shared.stopped.set(true);
    }

    /// Wait until `port` has bytes to read.
    pub async fn readable<P: ReadReady>(&self, port: &mut P) -> Result<(), P::Error> {
        poll_fn(|_cx| match port.read_ready() {
            Ok(true) => Poll::Ready(Ok(())),
            Ok(false) => {
                self.shared.request_io();
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        })
        .await
    }

    /// Race `future` against a timer within the calling task.
    ///
    /// The loser is dropped: the future on timeout, the timer on completion.
    pub async fn timeout<F: Future>(
        &self,
        limit: Duration,
        future: F,
    ) -> Result<F::Output, TimedOut> {
        match select(future, self.sleep(limit)).await {
            Either::First(output) => Ok(output),
            Either::Second(()) => Err(TimedOut),
        }
    }

    /// Start `future` and a watchdog timer as two tasks; whichever finishes
    /// first cancels the other.
    pub fn spawn_with_timeout<F>(
        &self,
        limit: Duration,
        future: F,
    ) -> Result<impl Future<Output = Result<F::Output, TimedOut>>, SpawnError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let watchdog_id = Rc::new(Cell::new(None::<TaskId>));

        let supervised = {
            let handle = self.clone();
            let watchdog_id = watchdog_id.clone();
            self.spawn(async move {
                let output = future.await;
                if let Some(watchdog) = watchdog_id.get() {
                    handle.cancel(watchdog);
                }
                output
            })?
        };

        let target = supervised.id();
        let handle = self.clone();
        let watchdog = self.spawn(async move {
            handle.sleep(limit).await;
            if handle.cancel(target) {
                warn!("{} timed out", target);
            }
        });
        match watchdog {
            Ok(watchdog) => watchdog_id.set(Some(watchdog.id())),
            Err(e) => {
                self.cancel(target);
                return Err(e);
            }
        }

        Ok(async move { supervised.await.map_err(|Cancelled| TimedOut) })
    }
}
