//! Cross-thread submission
//!
//! Other threads reach a manager only through two multi-producer,
//! single-consumer queues: one carries new tasks, the other carries fibers
//! that were suspended and should now continue. Producers never block. The
//! owning thread drains both queues from its run loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::controller::LoopController;
use crate::fiber::FiberId;
use crate::local::LocalData;

/// Lock-free MPSC queue that tells producers when the consumer needs a wakeup
///
/// `armed` is raised by the first push after a sweep and lowered by the
/// sweep itself, so only one producer per sweep asks for the loop to run.
pub(crate) struct RemoteQueue<T> {
    items: SegQueue<T>,
    armed: AtomicBool,
}

impl<T> RemoteQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: SegQueue::new(),
            armed: AtomicBool::new(false),
        }
    }

    /// Push an item; returns true when the consumer has to be scheduled
    pub(crate) fn push(&self, item: T) -> bool {
        self.items.push(item);
        !self.armed.swap(true, Ordering::AcqRel)
    }

    /// Pop the items queued when the sweep starts, in arrival order;
    /// returns whether any was found
    ///
    /// Items pushed while the sweep runs are left for the next one. Their
    /// producers see the queue disarmed and request another run.
    pub(crate) fn sweep(&self, mut f: impl FnMut(T)) -> bool {
        self.armed.swap(false, Ordering::AcqRel);
        let mut found = false;
        for _ in 0..self.items.len() {
            let Some(item) = self.items.pop() else { break };
            found = true;
            f(item);
        }
        found
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

/// A task submitted from another thread
pub(crate) struct RemoteTask {
    pub(crate) func: Box<dyn FnOnce() + Send>,
    /// Local storage of the submitting fiber, if the submitter was one
    pub(crate) local: Option<LocalData>,
}

/// Everything of a manager that other threads may touch
pub(crate) struct RemoteShared {
    pub(crate) ready: RemoteQueue<FiberId>,
    pub(crate) tasks: RemoteQueue<RemoteTask>,
    pub(crate) controller: Arc<dyn LoopController>,
}

impl RemoteShared {
    pub(crate) fn new(controller: Arc<dyn LoopController>) -> Self {
        Self {
            ready: RemoteQueue::new(),
            tasks: RemoteQueue::new(),
            controller,
        }
    }

    /// Queue a suspended fiber to continue on the owning thread
    pub(crate) fn ready_remote(&self, id: FiberId) {
        if self.ready.push(id) {
            self.controller.schedule_thread_safe();
        }
    }

    pub(crate) fn push_task(&self, task: RemoteTask) {
        if self.tasks.push(task) {
            self.controller.schedule_thread_safe();
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.ready.is_empty() || !self.tasks.is_empty()
    }
}

/// Thread-safe handle for submitting work to a [`FiberManager`](crate::FiberManager)
///
/// Obtained with [`FiberManager::remote_handle`](crate::FiberManager::remote_handle).
#[derive(Clone)]
pub struct RemoteHandle {
    shared: Arc<RemoteShared>,
}

impl RemoteHandle {
    pub(crate) fn new(shared: Arc<RemoteShared>) -> Self {
        Self { shared }
    }

    /// Submit a task from any thread
    ///
    /// If the calling thread is itself running a fiber, that fiber's local
    /// storage is copied into the new task. Submitted from inside a
    /// [`with_local`](crate::with_local) closure, the task is queued once the
    /// value is back with the fiber. Never blocks.
    pub fn add_task_remote<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task = RemoteTask {
            func: Box::new(func),
            local: None,
        };
        crate::manager::submit_remote(&self.shared, task);
    }

    /// Number of tasks waiting to be picked up by the owning thread
    pub fn pending_tasks(&self) -> usize {
        self.shared.tasks.len()
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("pending_tasks", &self.shared.tasks.len())
            .field("pending_ready", &self.shared.ready.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Default)]
    struct CountingController {
        remote: AtomicUsize,
    }

    impl LoopController for CountingController {
        fn schedule(&self) {}

        fn schedule_thread_safe(&self) {
            self.remote.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_push_arms_once() {
        let queue = RemoteQueue::new();
        assert!(queue.push(1));
        assert!(!queue.push(2));
        assert!(!queue.push(3));

        let mut seen = Vec::new();
        assert!(queue.sweep(|v| seen.push(v)));
        assert_eq!(seen, vec![1, 2, 3]);

        // Swept, so the next producer has to wake the consumer again
        assert!(queue.push(4));
    }

    #[test]
    fn test_sweep_leaves_items_pushed_during_sweep() {
        let queue = RemoteQueue::new();
        queue.push(1);
        queue.push(2);

        let mut seen = Vec::new();
        let mut wakeups = Vec::new();
        assert!(queue.sweep(|v| {
            seen.push(v);
            wakeups.push(queue.push(v + 10));
        }));
        assert_eq!(seen, vec![1, 2]);
        // The first push after the sweep started asks for another run
        assert_eq!(wakeups, vec![true, false]);
        assert_eq!(queue.len(), 2);

        let mut rest = Vec::new();
        queue.sweep(|v| rest.push(v));
        assert_eq!(rest, vec![11, 12]);
    }

    #[test]
    fn test_sweep_empty() {
        let queue: RemoteQueue<u32> = RemoteQueue::new();
        assert!(!queue.sweep(|_| panic!("nothing queued")));
    }

    #[test]
    fn test_schedule_thread_safe_once_per_sweep() {
        let controller = Arc::new(CountingController::default());
        let shared = RemoteShared::new(controller.clone());
        let handle = RemoteHandle::new(Arc::new(shared));

        handle.add_task_remote(|| {});
        handle.add_task_remote(|| {});
        assert_eq!(controller.remote.load(Ordering::SeqCst), 1);
        assert_eq!(handle.pending_tasks(), 2);
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(RemoteQueue::new());
        let wakeups = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                let wakeups = wakeups.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        if queue.push(p * 1000 + i) {
                            wakeups.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = Vec::new();
        queue.sweep(|v| seen.push(v));
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 1000);
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);
    }
}
