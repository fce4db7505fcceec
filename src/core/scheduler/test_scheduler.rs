// SPDX-License-Identifier: MIT OR Apache-2.0

//! Virtual-time scheduler for deterministic tests of time-based operators.
//!
//! Time only moves when the test calls [`TestScheduler::advance_time_by`] or
//! [`TestScheduler::advance_time_to`]. Due tasks run on the calling thread,
//! in due-time order, with the clock set to each task's due time.

use super::{rejected, ScheduledTask, Scheduler, Task, Worker, WorkerRef};
use crate::core::disposable::{CompositeDisposable, Disposable, DisposableRef};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct TimedTask {
    at: Duration,
    seq: u64,
    task: Arc<ScheduledTask>,
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct Clock {
    now: Duration,
    seq: u64,
    queue: BinaryHeap<Reverse<TimedTask>>,
}

#[derive(Clone, Default)]
pub struct TestScheduler {
    clock: Arc<Mutex<Clock>>,
}

impl TestScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward, running every task due on the way
    pub fn advance_time_by(&self, delta: Duration) {
        let target = self.now() + delta;
        self.advance_time_to(target);
    }

    /// Move the clock to `target`, running every task due on the way
    pub fn advance_time_to(&self, target: Duration) {
        while let Some(task) = self.pop_due(target) {
            task.run();
        }
        if let Ok(mut clock) = self.clock.lock() {
            if clock.now < target {
                clock.now = target;
            }
        }
    }

    /// Run the tasks due at the current time
    pub fn trigger_actions(&self) {
        let now = self.now();
        self.advance_time_to(now);
    }

    /// Number of tasks waiting, including disposed ones not yet reached
    pub fn pending(&self) -> usize {
        self.clock.lock().map(|c| c.queue.len()).unwrap_or(0)
    }

    fn pop_due(&self, target: Duration) -> Option<Arc<ScheduledTask>> {
        let mut clock = self.clock.lock().ok()?;
        loop {
            let due = clock
                .queue
                .peek()
                .is_some_and(|Reverse(next)| next.at <= target);
            if !due {
                return None;
            }
            let Reverse(next) = clock.queue.pop()?;
            if next.task.is_disposed() {
                continue;
            }
            if next.at > clock.now {
                clock.now = next.at;
            }
            return Some(next.task);
        }
    }

    fn enqueue(&self, task: Arc<ScheduledTask>, delay: Duration) {
        if let Ok(mut clock) = self.clock.lock() {
            clock.seq += 1;
            let at = clock.now + delay;
            let seq = clock.seq;
            clock.queue.push(Reverse(TimedTask { at, seq, task }));
        }
    }
}

impl Scheduler for TestScheduler {
    fn create_worker(&self) -> WorkerRef {
        Arc::new(TestWorker {
            scheduler: self.clone(),
            tasks: Arc::new(CompositeDisposable::new()),
        })
    }

    fn now(&self) -> Duration {
        self.clock.lock().map(|c| c.now).unwrap_or_default()
    }

    fn name(&self) -> &str {
        "test"
    }
}

struct TestWorker {
    scheduler: TestScheduler,
    tasks: Arc<CompositeDisposable>,
}

impl Worker for TestWorker {
    fn schedule_after(&self, task: Task, delay: Duration) -> DisposableRef {
        let Some(scheduled) = ScheduledTask::register(task, &self.tasks) else {
            return rejected();
        };
        self.scheduler.enqueue(Arc::clone(&scheduled), delay);
        scheduled
    }

    fn now(&self) -> Duration {
        Scheduler::now(&self.scheduler)
    }
}

impl Disposable for TestWorker {
    fn dispose(&self) {
        self.tasks.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.tasks.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tasks_wait_for_virtual_time() {
        let scheduler = TestScheduler::new();
        let worker = scheduler.create_worker();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("b", 20u64), ("a", 10), ("c", 20)] {
            let s = Arc::clone(&seen);
            let sched = scheduler.clone();
            worker.schedule_after(
                Box::new(move || s.lock().unwrap().push((label, Scheduler::now(&sched)))),
                Duration::from_millis(delay),
            );
        }

        scheduler.advance_time_by(Duration::from_millis(15));
        assert_eq!(seen.lock().unwrap().len(), 1);
        scheduler.advance_time_to(Duration::from_millis(20));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("a", Duration::from_millis(10)),
                ("b", Duration::from_millis(20)),
                ("c", Duration::from_millis(20)),
            ]
        );
        assert_eq!(Scheduler::now(&scheduler), Duration::from_millis(20));
    }

    #[test]
    fn test_trigger_actions_runs_immediate_work() {
        let scheduler = TestScheduler::new();
        let worker = scheduler.create_worker();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        worker.schedule(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        scheduler.trigger_actions();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disposed_worker_drops_tasks() {
        let scheduler = TestScheduler::new();
        let worker = scheduler.create_worker();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        worker.schedule_after(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_secs(1),
        );
        worker.dispose();
        assert!(worker.schedule(Box::new(|| {})).is_disposed());
        scheduler.advance_time_by(Duration::from_secs(2));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
