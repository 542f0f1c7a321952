//! Deterministic task runner
//!
//! Queued tasks carry a virtual deadline; pumping the runner advances the
//! shared [`FakeClock`] to each deadline in order. Tasks with equal
//! deadlines run in submission order.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::Duration;

use weave_core::provider::{Task, TaskRunner};
use weave_core::Timestamp;

use crate::clock::FakeClock;

struct QueuedTask {
    deadline: Timestamp,
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the earliest task first.
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

struct Inner {
    queue: BinaryHeap<QueuedTask>,
    next_seq: u64,
    break_requested: bool,
}

/// Single-threaded runner over virtual time. Clones share the queue.
#[derive(Clone)]
pub struct FakeTaskRunner {
    clock: FakeClock,
    inner: Rc<RefCell<Inner>>,
}

impl FakeTaskRunner {
    pub fn new(clock: FakeClock) -> Self {
        Self {
            clock,
            inner: Rc::new(RefCell::new(Inner {
                queue: BinaryHeap::new(),
                next_seq: 0,
                break_requested: false,
            })),
        }
    }

    pub fn clock(&self) -> &FakeClock {
        &self.clock
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Stop the current `run`/`run_for` after the in-flight task.
    pub fn request_break(&self) {
        self.inner.borrow_mut().break_requested = true;
    }

    /// Pump until the queue is empty (or a break is requested), advancing
    /// the clock to each task's deadline. Beware of self-rescheduling
    /// tasks; use [`run_for`](Self::run_for) to bound those.
    pub fn run(&self) {
        self.inner.borrow_mut().break_requested = false;
        while let Some(task) = self.pop_due(None) {
            task();
            if self.inner.borrow().break_requested {
                break;
            }
        }
    }

    /// Pump every task due within `duration` of the current virtual time,
    /// then advance the clock to the end of the window.
    pub fn run_for(&self, duration: Duration) {
        self.inner.borrow_mut().break_requested = false;
        let end = self.clock.now() + duration;
        while let Some(task) = self.pop_due(Some(end)) {
            task();
            if self.inner.borrow().break_requested {
                return;
            }
        }
        if self.clock.now() < end {
            self.clock.set(end);
        }
    }

    fn pop_due(&self, not_after: Option<Timestamp>) -> Option<Task> {
        let mut inner = self.inner.borrow_mut();
        let deadline = inner.queue.peek()?.deadline;
        if let Some(limit) = not_after {
            if deadline > limit {
                return None;
            }
        }
        let queued = inner.queue.pop().expect("peeked above");
        drop(inner);
        if deadline > self.clock.now() {
            self.clock.set(deadline);
        }
        Some(queued.task)
    }
}

impl TaskRunner for FakeTaskRunner {
    fn post_delayed(&self, delay: Duration, task: Task) {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.queue.push(QueuedTask {
            deadline: self.clock.now() + delay,
            seq,
            task,
        });
    }
}
