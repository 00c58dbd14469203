//! Baton: single-use wait/post synchronization
//!
//! A baton bridges one waiter and one poster. The waiter is either a fiber,
//! which parks and frees its thread, or a plain thread, which blocks. The
//! poster can be anything: the same fiber's setup closure, another fiber, a
//! main-context callback or another OS thread. Posting before the wait and
//! waiting before the post both work, and the waiter is released exactly
//! once.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

use crate::context;
use crate::error::{FiberError, FiberResult};
use crate::fiber::FiberId;
use crate::manager::{self, ManagerInner};
use crate::remote::RemoteShared;

const UNPOSTED: u8 = 0;
const FIBER_WAITING: u8 = 1;
const THREAD_WAITING: u8 = 2;
const POSTED: u8 = 3;

/// Handle to a parked fiber
///
/// Handed to await setup closures. Calling [`resume`](Self::resume) queues
/// the fiber to continue: directly on the owning thread, through the remote
/// ready queue from anywhere else. A fiber must be resumed exactly once per
/// suspension.
#[derive(Clone)]
pub struct SuspendedFiber {
    id: FiberId,
    manager_id: u64,
    owner: ThreadId,
    remote: Arc<RemoteShared>,
}

impl SuspendedFiber {
    pub(crate) fn new(id: FiberId, manager: &ManagerInner) -> Self {
        Self {
            id,
            manager_id: manager.id(),
            owner: manager.owner(),
            remote: manager.remote().clone(),
        }
    }

    /// Id of the parked fiber
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Queue the fiber to continue
    ///
    /// # Panics
    ///
    /// Resuming a fiber that is not parked (for instance, resuming it twice)
    /// panics on the manager's thread.
    pub fn resume(&self) {
        if thread::current().id() == self.owner {
            if let Some(manager) = manager::lookup(self.manager_id) {
                manager.ready_local(self.id);
                return;
            }
        }
        self.remote.ready_remote(self.id);
    }
}

impl fmt::Debug for SuspendedFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendedFiber")
            .field("id", &self.id)
            .field("manager", &self.manager_id)
            .finish()
    }
}

/// Park the current fiber and pass its resume handle to `setup`
///
/// `setup` runs on the main context once the fiber is parked. It must see to
/// it that [`SuspendedFiber::resume`] is eventually called, or the fiber never
/// continues.
///
/// Returns [`FiberError::NotOnFiber`] when called outside a fiber.
pub fn suspend_fiber(setup: impl FnOnce(SuspendedFiber)) -> FiberResult<()> {
    if !context::on_fiber() {
        return Err(FiberError::NotOnFiber);
    }
    context::await_with(setup);
    Ok(())
}

/// Move the current fiber to the back of the ready queue
pub fn yield_now() -> FiberResult<()> {
    if !context::on_fiber() {
        return Err(FiberError::NotOnFiber);
    }
    let baton = Baton::new();
    baton.wait_with(|| baton.post());
    Ok(())
}

/// Single-use wait/post synchronization primitive
pub struct Baton {
    state: AtomicU8,
    waiter: OnceCell<SuspendedFiber>,
    parked: Mutex<bool>,
    wakeup: Condvar,
}

impl Baton {
    /// A baton nobody has posted or waited on
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(UNPOSTED),
            waiter: OnceCell::new(),
            parked: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    /// Wait until the baton is posted
    ///
    /// On a fiber the fiber parks and its thread keeps running other fibers.
    /// Elsewhere the calling thread blocks.
    pub fn wait(&self) {
        self.wait_with(|| {});
    }

    /// Wait, running `setup` once the waiter is registered
    ///
    /// On a fiber, `setup` runs on the main context after the fiber has
    /// parked, which makes it the place to start the work that will post the
    /// baton. A panic in `setup` is reported with
    /// [`FailurePhase::AwaitSetup`](crate::FailurePhase::AwaitSetup); the
    /// fiber stays parked until the baton is posted.
    pub fn wait_with(&self, setup: impl FnOnce()) {
        if self.is_posted() {
            setup();
            return;
        }
        if context::on_fiber() {
            context::await_with(|fiber| {
                self.attach(fiber);
                setup();
            });
        } else {
            setup();
            self.wait_thread();
        }
    }

    /// Whether the baton has been posted, without waiting
    pub fn try_wait(&self) -> bool {
        self.is_posted()
    }

    /// Whether the baton has been posted
    pub fn is_posted(&self) -> bool {
        self.state.load(Ordering::Acquire) == POSTED
    }

    /// Release the waiter, now or as soon as it arrives
    ///
    /// # Panics
    ///
    /// Panics if the baton was already posted.
    pub fn post(&self) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state == POSTED {
                panic!("baton posted twice");
            }
            match self
                .state
                .compare_exchange_weak(state, POSTED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }

        match state {
            FIBER_WAITING => {
                // The waiter may free this baton as soon as it runs.
                if let Some(fiber) = self.waiter.get().cloned() {
                    fiber.resume();
                }
            }
            THREAD_WAITING => {
                let mut parked = self.parked.lock();
                *parked = true;
                self.wakeup.notify_one();
            }
            _ => {}
        }
    }

    fn attach(&self, fiber: SuspendedFiber) {
        if self.waiter.set(fiber).is_err() {
            panic!("baton waited on twice");
        }
        match self.state.compare_exchange(
            UNPOSTED,
            FIBER_WAITING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(POSTED) => {
                if let Some(fiber) = self.waiter.get() {
                    fiber.resume();
                }
            }
            Err(_) => panic!("baton waited on twice"),
        }
    }

    fn wait_thread(&self) {
        let mut parked = self.parked.lock();
        match self.state.compare_exchange(
            UNPOSTED,
            THREAD_WAITING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(POSTED) => return,
            Err(_) => panic!("baton waited on twice"),
        }
        while !*parked {
            self.wakeup.wait(&mut parked);
        }
    }
}

impl Default for Baton {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Baton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            UNPOSTED => "unposted",
            FIBER_WAITING => "fiber waiting",
            THREAD_WAITING => "thread waiting",
            _ => "posted",
        };
        f.debug_struct("Baton").field("state", &state).finish()
    }
}
