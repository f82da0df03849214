//! Task storage and completion handles

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

/// Identity of a spawned task
///
/// Slots are reused, so the generation tells a recycled slot apart from the
/// task that used to live there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "task {}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// On the run queue
    Queued,
    /// On a timer queue and/or the I/O queue
    Waiting,
    /// Only a waker can bring it back
    Parked,
    /// Being polled right now
    Running,
}

pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

pub(crate) struct Task {
    /// `None` while the task is being polled
    pub(crate) future: Option<TaskFuture>,
    pub(crate) state: TaskState,
    /// Bumped on every queue transition; queue entries carrying an older
    /// epoch are stale and skipped.
    pub(crate) epoch: u32,
    pub(crate) cancel_requested: bool,
    pub(crate) waker: Waker,
}

struct Slot {
    generation: u32,
    task: Option<Task>,
}

/// Error returned when the task table is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpawnError {
    /// All `max_tasks` slots are occupied
    Capacity,
}

impl core::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Capacity => write!(f, "Task table full"),
        }
    }
}

impl core::error::Error for SpawnError {}

pub(crate) struct TaskTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
    live: usize,
}

impl TaskTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            live: 0,
        }
    }

    pub(crate) fn insert(
        &mut self,
        make: impl FnOnce(TaskId) -> Task,
    ) -> Result<TaskId, SpawnError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    task: None,
                });
                (self.slots.len() - 1) as u32
            }
            None => return Err(SpawnError::Capacity),
        };
        let slot = &mut self.slots[index as usize];
        let id = TaskId {
            index,
            generation: slot.generation,
        };
        slot.task = Some(make(id));
        self.live += 1;
        Ok(id)
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.task.as_mut())
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.task.is_some())
    }

    pub(crate) fn remove(&mut self, id: TaskId) -> Option<Task> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let task = slot.task.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(task)
    }

    /// Empty the table, handing the tasks back so they are dropped outside
    /// any borrow of the runtime.
    pub(crate) fn drain(&mut self) -> Vec<Task> {
        let mut drained = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(task) = slot.task.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                drained.push(task);
            }
        }
        self.live = 0;
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live == 0
    }
}

/// The task was cancelled (or the runtime dropped) before it finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cancelled;

impl core::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Task cancelled")
    }
}

impl core::error::Error for Cancelled {}

pub(crate) struct Completion<T> {
    finished: Cell<bool>,
    output: Cell<Option<Result<T, Cancelled>>>,
    waiter: Cell<Option<Waker>>,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            finished: Cell::new(false),
            output: Cell::new(None),
            waiter: Cell::new(None),
        }
    }

    fn resolve(&self, output: Result<T, Cancelled>) {
        self.finished.set(true);
        self.output.set(Some(output));
        if let Some(waker) = self.waiter.take() {
            waker.wake();
        }
    }
}

/// Resolves the completion as cancelled if the task future is dropped before
/// it produced a value.
struct CompletionGuard<T> {
    completion: Rc<Completion<T>>,
}

impl<T> CompletionGuard<T> {
    fn finish(self, output: T) {
        self.completion.resolve(Ok(output));
    }
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if !self.completion.finished.get() {
            self.completion.resolve(Err(Cancelled));
        }
    }
}

/// Box a future for the task table, routing its output to `completion`.
pub(crate) fn wrap<F>(future: F, completion: Rc<Completion<F::Output>>) -> TaskFuture
where
    F: Future + 'static,
    F::Output: 'static,
{
    let guard = CompletionGuard { completion };
    Box::pin(async move {
        let output = future.await;
        guard.finish(output);
    })
}

/// Awaitable result of a spawned task
///
/// Dropping the handle detaches the task; it keeps running.
pub struct JoinHandle<T> {
    id: TaskId,
    completion: Rc<Completion<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(id: TaskId, completion: Rc<Completion<T>>) -> Self {
        Self { id, completion }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The task completed, was cancelled, or was dropped with the runtime
    pub fn is_finished(&self) -> bool {
        self.completion.finished.get()
    }

    /// Take the result without waiting. `None` if the task is still live or
    /// the result was already taken.
    pub fn try_take(&self) -> Option<Result<T, Cancelled>> {
        self.completion.output.take()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.completion.output.take() {
            Some(output) => Poll::Ready(output),
            None => {
                self.completion.waiter.set(Some(cx.waker().clone()));
                Poll::Pending
            }
        }
    }
}
