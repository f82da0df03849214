//! Wakers
//!
//! A wake only records the task id. The runtime collects the list between
//! steps, so wakers may fire from interrupt context.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::task::Wake;
use core::cell::RefCell;
use core::task::Waker;

use critical_section::Mutex;

use super::task::TaskId;

pub(crate) struct WakeList {
    pending: Mutex<RefCell<VecDeque<TaskId>>>,
}

impl WakeList {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(RefCell::new(VecDeque::new())),
        }
    }

    fn push(&self, id: TaskId) {
        critical_section::with(|cs| self.pending.borrow_ref_mut(cs).push_back(id));
    }

    pub(crate) fn take(&self) -> VecDeque<TaskId> {
        critical_section::with(|cs| core::mem::take(&mut *self.pending.borrow_ref_mut(cs)))
    }
}

struct TaskWaker {
    id: TaskId,
    list: Arc<WakeList>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.list.push(self.id);
    }
}

pub(crate) fn task_waker(id: TaskId, list: &Arc<WakeList>) -> Waker {
    Waker::from(Arc::new(TaskWaker {
        id,
        list: list.clone(),
    }))
}
