// SPDX-License-Identifier: MIT OR Apache-2.0

//! Current-thread scheduler.
//!
//! The first `schedule` call on a worker drains its queue on the calling
//! thread; tasks scheduled from inside a running task are queued instead of
//! recursing. Delayed tasks sleep the draining thread.

use super::{rejected, wall_clock, ScheduledTask, Scheduler, Task, Worker, WorkerRef};
use crate::core::disposable::{CompositeDisposable, Disposable, DisposableRef};
use std::collections::BinaryHeap;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct TrampolineScheduler;

impl TrampolineScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for TrampolineScheduler {
    fn create_worker(&self) -> WorkerRef {
        Arc::new(TrampolineWorker::new())
    }

    fn now(&self) -> Duration {
        wall_clock()
    }

    fn name(&self) -> &str {
        "trampoline"
    }
}

struct Queued {
    at: Instant,
    seq: u64,
    task: Arc<ScheduledTask>,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

pub struct TrampolineWorker {
    queue: Mutex<BinaryHeap<Reverse<Queued>>>,
    wip: AtomicUsize,
    seq: AtomicU64,
    tasks: Arc<CompositeDisposable>,
}

impl TrampolineWorker {
    fn new() -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            wip: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            tasks: Arc::new(CompositeDisposable::new()),
        }
    }

    fn drain(&self) {
        let mut missed = 1;
        loop {
            loop {
                if self.tasks.is_disposed() {
                    if let Ok(mut q) = self.queue.lock() {
                        q.clear();
                    }
                    return;
                }
                let next = self.queue.lock().ok().and_then(|mut q| q.pop());
                let Some(Reverse(next)) = next else {
                    break;
                };
                let wait = next.at.saturating_duration_since(Instant::now());
                if !wait.is_zero() {
                    thread::sleep(wait);
                }
                next.task.run();
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }
}

impl Worker for TrampolineWorker {
    fn schedule_after(&self, task: Task, delay: Duration) -> DisposableRef {
        let Some(scheduled) = ScheduledTask::register(task, &self.tasks) else {
            return rejected();
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut q) = self.queue.lock() {
            q.push(Reverse(Queued {
                at: Instant::now() + delay,
                seq,
                task: Arc::clone(&scheduled),
            }));
        }
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.drain();
        }
        scheduled
    }

    fn now(&self) -> Duration {
        wall_clock()
    }
}

impl Disposable for TrampolineWorker {
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

    #[test]
    fn test_nested_schedule_is_queued_not_recursive() {
        let worker: WorkerRef = TrampolineScheduler::new().create_worker();
        let log = Arc::new(Mutex::new(Vec::new()));

        let w = Arc::clone(&worker);
        let l = Arc::clone(&log);
        worker.schedule(Box::new(move || {
            l.lock().unwrap().push("outer-start");
            let inner = Arc::clone(&l);
            w.schedule(Box::new(move || inner.lock().unwrap().push("inner")));
            l.lock().unwrap().push("outer-end");
        }));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer-start", "outer-end", "inner"]
        );
    }

    #[test]
    fn test_deep_reschedule_does_not_overflow() {
        let worker: WorkerRef = TrampolineScheduler::new().create_worker();
        let count = Arc::new(AtomicUsize::new(0));

        fn step(worker: WorkerRef, count: Arc<AtomicUsize>) {
            if count.fetch_add(1, Ordering::SeqCst) < 100_000 {
                let w = Arc::clone(&worker);
                worker.schedule(Box::new(move || step(w, count)));
            }
        }

        step(Arc::clone(&worker), Arc::clone(&count));
        assert_eq!(count.load(Ordering::SeqCst), 100_001);
    }
}
