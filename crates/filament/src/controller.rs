//! Loop controllers
//!
//! A [`LoopController`] is how a [`FiberManager`] asks to be driven. An
//! event-loop integration implements it by arranging a call to
//! [`FiberManager::loop_until_no_ready`] on the owning thread.
//! [`SimpleLoopController`] does this with a blocking wait on a condition
//! variable, which is enough for tests, tools and dedicated worker threads.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::manager::FiberManager;

/// Integration point between a fiber manager and whatever drives it
pub trait LoopController: Send + Sync {
    /// Request a run of the loop. Only called on the manager's thread.
    fn schedule(&self);

    /// Request a run of the loop from any thread
    fn schedule_thread_safe(&self);
}

/// Drives a manager on the calling thread, sleeping while nothing is scheduled
#[derive(Debug, Default)]
pub struct SimpleLoopController {
    pending: Mutex<bool>,
    wakeup: Condvar,
    schedule_calls: AtomicUsize,
    remote_schedule_calls: AtomicUsize,
}

impl SimpleLoopController {
    /// Create a controller with nothing scheduled
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `schedule` requests received so far
    pub fn schedule_calls(&self) -> usize {
        self.schedule_calls.load(Ordering::Relaxed)
    }

    /// Number of `schedule_thread_safe` requests received so far
    pub fn remote_schedule_calls(&self) -> usize {
        self.remote_schedule_calls.load(Ordering::Relaxed)
    }

    /// Whether a run has been requested and not yet serviced
    pub fn is_scheduled(&self) -> bool {
        *self.pending.lock()
    }

    /// Run `manager` if a run was requested; returns whether it ran
    pub fn run_pending(&self, manager: &FiberManager) -> bool {
        if !std::mem::take(&mut *self.pending.lock()) {
            return false;
        }
        manager.loop_until_no_ready();
        true
    }

    /// Keep running `manager` until `stop` returns true
    ///
    /// `stop` is checked after every pass of the loop. Between passes the
    /// thread sleeps until a new run is requested.
    pub fn run_until(&self, manager: &FiberManager, mut stop: impl FnMut() -> bool) {
        loop {
            *self.pending.lock() = false;
            manager.loop_until_no_ready();
            if stop() {
                return;
            }

            let mut pending = self.pending.lock();
            while !*pending {
                self.wakeup.wait(&mut pending);
            }
        }
    }

    fn wake(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.wakeup.notify_one();
    }
}

impl LoopController for SimpleLoopController {
    fn schedule(&self) {
        self.schedule_calls.fetch_add(1, Ordering::Relaxed);
        self.wake();
    }

    fn schedule_thread_safe(&self) {
        self.remote_schedule_calls.fetch_add(1, Ordering::Relaxed);
        self.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counts_requests() {
        let controller = SimpleLoopController::new();
        assert!(!controller.is_scheduled());

        controller.schedule();
        controller.schedule_thread_safe();
        controller.schedule_thread_safe();
        assert!(controller.is_scheduled());
        assert_eq!(controller.schedule_calls(), 1);
        assert_eq!(controller.remote_schedule_calls(), 2);
    }

    #[test]
    fn test_run_pending() {
        let controller = Arc::new(SimpleLoopController::new());
        let manager = FiberManager::new(controller.clone());
        assert!(!controller.run_pending(&manager));

        manager.add_task(|| {});
        assert!(controller.run_pending(&manager));
        assert!(!controller.is_scheduled());
        assert_eq!(manager.stats().fibers_active, 0);
    }

    #[test]
    fn test_run_until_wakes_on_remote_work() {
        let controller = Arc::new(SimpleLoopController::new());
        let manager = FiberManager::new(controller.clone());
        let remote = manager.remote_handle();
        let (tx, rx) = std::sync::mpsc::channel();

        let producer = thread::spawn(move || {
            for i in 0..3 {
                let tx = tx.clone();
                remote.add_task_remote(move || tx.send(i).unwrap());
            }
        });

        let mut received = Vec::new();
        controller.run_until(&manager, || {
            received.extend(rx.try_iter());
            received.len() == 3
        });
        producer.join().unwrap();
        assert_eq!(received, vec![0, 1, 2]);
    }
}
