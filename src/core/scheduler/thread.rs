// SPDX-License-Identifier: MIT OR Apache-2.0

//! Thread-backed schedulers.
//!
//! Each [`EventLoop`] owns one OS thread fed through a crossbeam channel.
//! Delayed tasks wait in a due-time heap on that thread, so a worker never
//! blocks the caller and its tasks never overlap.

use super::{rejected, wall_clock, ScheduledTask, Scheduler, Task, Worker, WorkerRef};
use crate::core::disposable::{CompositeDisposable, Disposable, DisposableRef};
use crate::core::error::{self, FlowError, FlowResult};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

enum Command {
    Run(Arc<ScheduledTask>, Instant),
    Shutdown,
}

struct Delayed {
    at: Instant,
    seq: u64,
    task: Arc<ScheduledTask>,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

/// A single thread running submitted tasks in order
pub struct EventLoop {
    sender: Sender<Command>,
    name: String,
    running: Arc<AtomicBool>,
}

impl EventLoop {
    pub fn start(name: String) -> FlowResult<Arc<Self>> {
        let (sender, receiver) = unbounded::<Command>();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut delayed: BinaryHeap<Reverse<Delayed>> = BinaryHeap::new();
                let mut seq = 0u64;
                loop {
                    let now = Instant::now();
                    while delayed
                        .peek()
                        .is_some_and(|Reverse(next)| next.at <= now)
                    {
                        if let Some(Reverse(due)) = delayed.pop() {
                            due.task.run();
                        }
                    }

                    let command = match delayed.peek() {
                        Some(Reverse(next)) => {
                            receiver.recv_timeout(next.at.saturating_duration_since(now))
                        }
                        None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };

                    match command {
                        Ok(Command::Run(task, at)) => {
                            if at <= Instant::now() {
                                task.run();
                            } else {
                                seq += 1;
                                delayed.push(Reverse(Delayed { at, seq, task }));
                            }
                        }
                        Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }
                flag.store(false, Ordering::Release);
                log::debug!(
                    "Event loop '{}' stopped with {} delayed task(s) dropped",
                    thread::current().name().unwrap_or("?"),
                    delayed.len()
                );
            })
            .map_err(|e| {
                FlowError::other(format!("Failed to start event loop '{}': {}", name, e))
            })?;

        log::debug!("Event loop '{}' started", name);
        Ok(Arc::new(Self {
            sender,
            name,
            running,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn submit(&self, task: Arc<ScheduledTask>, delay: Duration) -> bool {
        let at = Instant::now() + delay;
        self.sender.send(Command::Run(task, at)).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

enum Pool {
    /// A fixed set of loops shared round robin by all workers
    Shared {
        loops: Vec<Arc<EventLoop>>,
        next: AtomicUsize,
    },
    /// A fresh loop per worker
    Dedicated { counter: AtomicUsize },
}

/// Scheduler whose workers run on [`EventLoop`] threads
pub struct EventLoopScheduler {
    name: String,
    thread_name: String,
    pool: Pool,
}

impl EventLoopScheduler {
    /// `threads` loops started up front and shared by every worker
    pub fn shared(name: impl Into<String>, thread_name: impl Into<String>, threads: usize) -> Self {
        let thread_name = thread_name.into();
        let loops = (0..threads.max(1))
            .filter_map(|i| match EventLoop::start(format!("{}-{}", thread_name, i)) {
                Ok(event_loop) => Some(event_loop),
                Err(e) => {
                    log::error!("{}", e);
                    None
                }
            })
            .collect();
        Self {
            name: name.into(),
            thread_name,
            pool: Pool::Shared {
                loops,
                next: AtomicUsize::new(0),
            },
        }
    }

    /// One new loop thread per worker, stopped when the worker is disposed
    pub fn dedicated(name: impl Into<String>, thread_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            thread_name: thread_name.into(),
            pool: Pool::Dedicated {
                counter: AtomicUsize::new(0),
            },
        }
    }
}

impl Scheduler for EventLoopScheduler {
    fn create_worker(&self) -> WorkerRef {
        match &self.pool {
            Pool::Shared { loops, next } => {
                if loops.is_empty() {
                    return Arc::new(EventLoopWorker::detached());
                }
                let index = next.fetch_add(1, Ordering::Relaxed) % loops.len();
                Arc::new(EventLoopWorker::new(Arc::clone(&loops[index]), false))
            }
            Pool::Dedicated { counter } => {
                let index = counter.fetch_add(1, Ordering::Relaxed);
                match EventLoop::start(format!("{}-{}", self.thread_name, index)) {
                    Ok(event_loop) => Arc::new(EventLoopWorker::new(event_loop, true)),
                    Err(e) => {
                        error::on_error(e);
                        Arc::new(EventLoopWorker::detached())
                    }
                }
            }
        }
    }

    fn now(&self) -> Duration {
        wall_clock()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct EventLoopWorker {
    event_loop: Option<Arc<EventLoop>>,
    tasks: Arc<CompositeDisposable>,
    owns_loop: bool,
}

impl EventLoopWorker {
    fn new(event_loop: Arc<EventLoop>, owns_loop: bool) -> Self {
        Self {
            event_loop: Some(event_loop),
            tasks: Arc::new(CompositeDisposable::new()),
            owns_loop,
        }
    }

    /// A worker without a thread; rejects everything
    fn detached() -> Self {
        let tasks = Arc::new(CompositeDisposable::new());
        tasks.dispose();
        Self {
            event_loop: None,
            tasks,
            owns_loop: false,
        }
    }
}

impl Worker for EventLoopWorker {
    fn schedule_after(&self, task: Task, delay: Duration) -> DisposableRef {
        let Some(event_loop) = &self.event_loop else {
            return rejected();
        };
        let Some(scheduled) = ScheduledTask::register(task, &self.tasks) else {
            return rejected();
        };
        if !event_loop.submit(Arc::clone(&scheduled), delay) {
            scheduled.dispose();
            return rejected();
        }
        scheduled
    }

    fn now(&self) -> Duration {
        wall_clock()
    }
}

impl Disposable for EventLoopWorker {
    fn dispose(&self) {
        if self.tasks.is_disposed() {
            return;
        }
        self.tasks.dispose();
        if self.owns_loop {
            if let Some(event_loop) = &self.event_loop {
                event_loop.shutdown();
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.tasks.is_disposed()
    }
}

impl Drop for EventLoopWorker {
    fn drop(&mut self) {
        if self.owns_loop {
            if let Some(event_loop) = &self.event_loop {
                event_loop.shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::Mutex;

    #[test]
    fn test_tasks_run_in_due_order() {
        let scheduler = EventLoopScheduler::dedicated("test", "backflow-test");
        let worker = scheduler.create_worker();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = bounded(1);

        let o = Arc::clone(&order);
        worker.schedule_after(
            Box::new(move || {
                o.lock().unwrap().push("late");
                tx.send(()).unwrap();
            }),
            Duration::from_millis(40),
        );
        let o = Arc::clone(&order);
        worker.schedule(Box::new(move || o.lock().unwrap().push("now")));

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["now", "late"]);
        worker.dispose();
    }

    #[test]
    fn test_disposed_worker_rejects_and_drops() {
        let scheduler = EventLoopScheduler::shared("test", "backflow-shared-test", 1);
        let worker = scheduler.create_worker();
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let pending = worker.schedule_after(
            Box::new(move || r.store(true, Ordering::SeqCst)),
            Duration::from_millis(50),
        );
        worker.dispose();
        assert!(pending.is_disposed());
        assert!(worker.schedule(Box::new(|| {})).is_disposed());
        thread::sleep(Duration::from_millis(120));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_thread_names_carry_prefix() {
        let scheduler = EventLoopScheduler::dedicated("io", "backflow-io-test");
        let worker = scheduler.create_worker();
        let (tx, rx) = bounded(1);
        worker.schedule(Box::new(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.starts_with("backflow-io-test-"));
        worker.dispose();
    }
}
