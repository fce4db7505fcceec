// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Schedulers
//!
//! Execution contexts for time-based and thread-hopping operators.
//!
//! A [`Scheduler`] hands out [`Worker`]s. A worker runs its tasks one at a
//! time in submission order (delayed tasks by due time) and disposing it
//! drops every pending task and rejects new ones.
//!
//! | Scheduler | Backing |
//! |-----------|---------|
//! | [`schedulers::single`] | one shared event loop thread |
//! | [`schedulers::computation`] | fixed pool of event loops, round robin |
//! | [`schedulers::new_thread`] | one event loop thread per worker |
//! | [`schedulers::io`] | one event loop thread per worker, `io` thread names |
//! | [`schedulers::trampoline`] | the calling thread |
//! | [`TestScheduler`] | virtual time, advanced explicitly |

pub mod test_scheduler;
pub mod thread;
pub mod trampoline;

pub use test_scheduler::TestScheduler;
pub use thread::{EventLoop, EventLoopScheduler};
pub use trampoline::TrampolineScheduler;

use crate::core::disposable::{
    BooleanDisposable, CompositeDisposable, Disposable, DisposableRef, DisposableSlot,
};
use crate::core::error::{self, FlowError};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A unit of work submitted to a worker
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A repeating unit of work
pub type PeriodicTask = Box<dyn FnMut() + Send + 'static>;

pub type SchedulerRef = Arc<dyn Scheduler>;
pub type WorkerRef = Arc<dyn Worker>;

/// A sequential executor obtained from a [`Scheduler`]
pub trait Worker: Disposable {
    fn schedule(&self, task: Task) -> DisposableRef {
        self.schedule_after(task, Duration::ZERO)
    }

    fn schedule_after(&self, task: Task, delay: Duration) -> DisposableRef;

    /// Current time of this worker's clock
    fn now(&self) -> Duration;
}

pub trait Scheduler: Send + Sync {
    fn create_worker(&self) -> WorkerRef;

    /// Current time of this scheduler's clock
    fn now(&self) -> Duration;

    fn name(&self) -> &str;

    /// Run a task on a throwaway worker
    fn schedule_direct(&self, task: Task, delay: Duration) -> DisposableRef {
        let worker = self.create_worker();
        let w = Arc::clone(&worker);
        let handle = worker.schedule_after(
            Box::new(move || {
                task();
                w.dispose();
            }),
            delay,
        );
        if handle.is_disposed() {
            worker.dispose();
        }
        Arc::new(DirectHandle { worker, handle })
    }
}

struct DirectHandle {
    worker: WorkerRef,
    handle: DisposableRef,
}

impl Disposable for DirectHandle {
    fn dispose(&self) {
        self.handle.dispose();
        self.worker.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.handle.is_disposed()
    }
}

/// Wall clock as a duration since the Unix epoch
pub fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Run `task` after `initial`, then every `period`, until the handle or the
/// worker is disposed
pub fn schedule_periodic(
    worker: &WorkerRef,
    task: PeriodicTask,
    initial: Duration,
    period: Duration,
) -> DisposableRef {
    let slot = Arc::new(DisposableSlot::new());
    let periodic = Arc::new(Periodic {
        worker: Arc::downgrade(worker),
        task: Mutex::new(task),
        period,
        slot: Arc::downgrade(&slot),
    });
    let first = worker.schedule_after(Box::new(move || periodic.run()), initial);
    slot.replace(first);
    slot
}

struct Periodic {
    worker: Weak<dyn Worker>,
    task: Mutex<PeriodicTask>,
    period: Duration,
    slot: Weak<DisposableSlot>,
}

impl Periodic {
    fn run(self: Arc<Self>) {
        let Some(slot) = self.slot.upgrade() else {
            return;
        };
        if slot.is_disposed() {
            return;
        }
        if let Ok(mut task) = self.task.lock() {
            (*task)();
        }
        let Some(worker) = self.worker.upgrade() else {
            return;
        };
        let next = Arc::clone(&self);
        let handle = worker.schedule_after(Box::new(move || next.run()), self.period);
        slot.replace(handle);
    }
}

/// A task tracked by its worker, removed from the worker once it ran
pub struct ScheduledTask {
    task: Mutex<Option<Task>>,
    disposed: AtomicBool,
    parent: Weak<CompositeDisposable>,
}

impl ScheduledTask {
    /// Wrap `task` and register it with `parent`
    ///
    /// Returns the handle, or `None` when `parent` is already disposed.
    pub fn register(task: Task, parent: &Arc<CompositeDisposable>) -> Option<Arc<ScheduledTask>> {
        let scheduled = Arc::new(ScheduledTask {
            task: Mutex::new(Some(task)),
            disposed: AtomicBool::new(false),
            parent: Arc::downgrade(parent),
        });
        let handle: DisposableRef = scheduled.clone();
        if parent.add(handle) {
            Some(scheduled)
        } else {
            None
        }
    }

    /// Execute the task unless disposed; panics go to the error hook
    pub fn run(self: &Arc<Self>) {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = task {
            run_guarded(task);
        }
        if let Some(parent) = self.parent.upgrade() {
            let handle: DisposableRef = self.clone();
            parent.delete(&handle);
        }
    }
}

impl Disposable for ScheduledTask {
    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            if let Ok(mut task) = self.task.lock() {
                task.take();
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Run a task, routing a panic to the error hook
pub fn run_guarded(task: Task) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        let message = panic_message(payload.as_ref());
        log::error!("Scheduled task panicked: {}", message);
        error::on_error(FlowError::callback(format!(
            "Scheduled task panicked: {}",
            message
        )));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The handle returned for work rejected by a disposed worker
pub fn rejected() -> DisposableRef {
    BooleanDisposable::disposed()
}

/// Process-wide scheduler instances
pub mod schedulers {
    use super::{EventLoopScheduler, SchedulerRef, TrampolineScheduler};
    use crate::core::config::FlowConfig;
    use once_cell::sync::Lazy;
    use std::sync::Arc;

    static SINGLE: Lazy<SchedulerRef> = Lazy::new(|| {
        let config = FlowConfig::global();
        Arc::new(EventLoopScheduler::shared(
            "single",
            format!("{}-single", config.thread_name_prefix),
            1,
        ))
    });

    static COMPUTATION: Lazy<SchedulerRef> = Lazy::new(|| {
        let config = FlowConfig::global();
        Arc::new(EventLoopScheduler::shared(
            "computation",
            format!("{}-computation", config.thread_name_prefix),
            config.computation_threads,
        ))
    });

    static NEW_THREAD: Lazy<SchedulerRef> = Lazy::new(|| {
        let config = FlowConfig::global();
        Arc::new(EventLoopScheduler::dedicated(
            "new-thread",
            format!("{}-new-thread", config.thread_name_prefix),
        ))
    });

    static IO: Lazy<SchedulerRef> = Lazy::new(|| {
        let config = FlowConfig::global();
        Arc::new(EventLoopScheduler::dedicated(
            "io",
            format!("{}-io", config.thread_name_prefix),
        ))
    });

    static TRAMPOLINE: Lazy<SchedulerRef> = Lazy::new(|| Arc::new(TrampolineScheduler::new()));

    pub fn single() -> SchedulerRef {
        Arc::clone(&SINGLE)
    }

    pub fn computation() -> SchedulerRef {
        Arc::clone(&COMPUTATION)
    }

    pub fn new_thread() -> SchedulerRef {
        Arc::clone(&NEW_THREAD)
    }

    pub fn io() -> SchedulerRef {
        Arc::clone(&IO)
    }

    pub fn trampoline() -> SchedulerRef {
        Arc::clone(&TRAMPOLINE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::ErrorCapture;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_periodic_on_virtual_time() {
        let scheduler = TestScheduler::new();
        let worker = scheduler.create_worker();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = schedule_periodic(
            &worker,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_secs(1),
            Duration::from_secs(2),
        );

        scheduler.advance_time_by(Duration::from_millis(999));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        scheduler.advance_time_by(Duration::from_millis(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.advance_time_by(Duration::from_secs(4));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        handle.dispose();
        scheduler.advance_time_by(Duration::from_secs(10));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_schedule_direct_runs_once() {
        let scheduler = TestScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        scheduler.schedule_direct(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(5),
        );
        scheduler.advance_time_by(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn test_panicking_task_is_reported() {
        let capture = ErrorCapture::install();
        run_guarded(Box::new(|| panic!("task exploded")));
        capture.assert_error(0, "task exploded");
    }
}
