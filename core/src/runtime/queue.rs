//! Run, timer and I/O queues

use alloc::collections::{BinaryHeap, VecDeque};
use core::cmp::Reverse;

use datalogger_hal::time::Instant;

use super::task::TaskId;

/// Queue entry naming a task at a given epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) task: TaskId,
    pub(crate) epoch: u32,
}

/// Deadline-ordered entry. `seq` keeps equal deadlines in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerEntry {
    pub(crate) deadline: u64,
    pub(crate) seq: u64,
    pub(crate) task: TaskId,
    pub(crate) epoch: u32,
}

impl TimerEntry {
    pub(crate) fn entry(&self) -> Entry {
        Entry {
            task: self.task,
            epoch: self.epoch,
        }
    }
}

/// Min-heap of timer entries
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn push(&mut self, deadline: Instant, entry: Entry) {
        self.seq = self.seq.wrapping_add(1);
        self.heap.push(Reverse(TimerEntry {
            deadline: deadline.ticks(),
            seq: self.seq,
            task: entry.task,
            epoch: entry.epoch,
        }));
    }

    pub(crate) fn peek(&self) -> Option<&TimerEntry> {
        self.heap.peek().map(|Reverse(entry)| entry)
    }

    pub(crate) fn pop(&mut self) -> Option<TimerEntry> {
        self.heap.pop().map(|Reverse(entry)| entry)
    }

    /// Drop stale entries from the head so `peek` sees a live deadline
    pub(crate) fn prune(&mut self, mut live: impl FnMut(&TimerEntry) -> bool) {
        while let Some(head) = self.peek() {
            if live(head) {
                break;
            }
            self.pop();
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct Queues {
    /// Ready now, FIFO
    pub(crate) run: VecDeque<Entry>,
    /// Timed sleeps
    pub(crate) timers: TimerQueue,
    /// Background work, may starve while normal work is pending
    pub(crate) background: TimerQueue,
    /// Waiting on transport readiness
    pub(crate) io: VecDeque<Entry>,
}
