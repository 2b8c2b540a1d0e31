//! Deferred tasks for cache eviction
//!
//! The cache never touches wall-clock time directly. It asks a [`Scheduler`]
//! to run a task after a delay and may cancel it before it fires. The
//! provided [`TimerQueue`] keeps its own virtual clock which the host loop
//! advances, so the same type drives both real event loops and tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use log::debug;

/// Handle to a scheduled task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Deferred task
pub type Task = Box<dyn FnOnce()>;

pub trait Scheduler {
    /// Run `task` once `delay` has elapsed, unless cancelled first
    fn schedule_after(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a pending task. Unknown or already fired ids are ignored.
    fn cancel(&self, id: TimerId);
}

#[derive(Default)]
struct QueueState {
    now: Duration,
    next_id: u64,
    timers: BTreeMap<(Duration, u64), Task>,
    deadlines: HashMap<u64, Duration>,
}

/// Virtual-time timer queue advanced by its owner.
#[derive(Default)]
pub struct TimerQueue {
    state: RefCell<QueueState>,
}

impl TimerQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation
    #[must_use]
    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    /// Number of tasks waiting to fire
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.borrow().timers.len()
    }

    /// Deadline of the earliest pending task
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        self.state
            .borrow()
            .timers
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    /// Move the clock forward by `elapsed`, running every task that comes due
    /// in deadline order. Returns the number of tasks run.
    ///
    /// Tasks may schedule or cancel other tasks; newly scheduled tasks that
    /// fall due within the same window run too.
    pub fn advance(&self, elapsed: Duration) -> usize {
        let target = self.now() + elapsed;
        let mut fired = 0;

        loop {
            let task = {
                let mut state = self.state.borrow_mut();
                let due = state
                    .timers
                    .first_key_value()
                    .map(|(key, _)| *key)
                    .filter(|(deadline, _)| *deadline <= target);
                match due {
                    Some(key) => {
                        state.deadlines.remove(&key.1);
                        state.now = key.0;
                        state.timers.remove(&key)
                    }
                    None => None,
                }
            };

            match task {
                Some(task) => {
                    task();
                    fired += 1;
                }
                None => break,
            }
        }

        self.state.borrow_mut().now = target;
        fired
    }
}

impl Scheduler for TimerQueue {
    fn schedule_after(&self, delay: Duration, task: Task) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        let deadline = state.now + delay;
        state.timers.insert((deadline, id), task);
        state.deadlines.insert(id, deadline);
        debug!("timer {id} scheduled at {deadline:?}");
        TimerId(id)
    }

    fn cancel(&self, id: TimerId) {
        let mut state = self.state.borrow_mut();
        if let Some(deadline) = state.deadlines.remove(&id.0) {
            state.timers.remove(&(deadline, id.0));
            debug!("timer {} cancelled", id.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    fn flag() -> (Rc<Cell<bool>>, Task) {
        let fired = Rc::new(Cell::new(false));
        let sink = Rc::clone(&fired);
        (fired, Box::new(move || sink.set(true)))
    }

    #[test]
    fn fires_only_after_delay() {
        let queue = TimerQueue::new();
        let (fired, task) = flag();
        queue.schedule_after(Duration::from_secs(10), task);

        assert_eq!(queue.advance(Duration::from_millis(9_999)), 0);
        assert!(!fired.get());
        assert_eq!(queue.advance(Duration::from_millis(1)), 1);
        assert!(fired.get());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn cancelled_task_never_fires() {
        let queue = TimerQueue::new();
        let (fired, task) = flag();
        let id = queue.schedule_after(Duration::from_secs(1), task);
        queue.cancel(id);
        queue.cancel(id);

        queue.advance(Duration::from_secs(5));
        assert!(!fired.get());
    }

    #[test]
    fn tasks_run_in_deadline_order() {
        let queue = TimerQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (label, secs) in [("late", 3), ("early", 1), ("mid", 2)] {
            let order = Rc::clone(&order);
            queue.schedule_after(
                Duration::from_secs(secs),
                Box::new(move || order.borrow_mut().push(label)),
            );
        }

        queue.advance(Duration::from_secs(3));
        assert_eq!(*order.borrow(), vec!["early", "mid", "late"]);
    }

    #[test]
    fn task_may_schedule_follow_up() {
        let queue = Rc::new(TimerQueue::new());
        let (fired, follow_up) = flag();
        let inner = Rc::clone(&queue);
        queue.schedule_after(
            Duration::from_secs(1),
            Box::new(move || {
                inner.schedule_after(Duration::from_secs(1), follow_up);
            }),
        );

        assert_eq!(queue.advance(Duration::from_secs(2)), 2);
        assert!(fired.get());
        assert_eq!(queue.now(), Duration::from_secs(2));
    }
}
