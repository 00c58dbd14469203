//! Fiber manager
//!
//! A [`FiberManager`] owns the fibers of one thread: the arena and its idle
//! pool, the local ready queue and the two remote queues other threads feed.
//! Its run loop, [`FiberManager::loop_until_no_ready`], switches into ready
//! fibers one at a time until nothing is left to run.
//!
//! Scheduling is cooperative. A fiber gives up its thread only when it
//! finishes, waits on a [`Baton`](crate::Baton) or promise, or escapes to the
//! main context with [`FiberManager::run_in_main_context`].

use std::any::{self, Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use crate::baton::SuspendedFiber;
use crate::context::{self, catch_failure, Suspend};
use crate::controller::LoopController;
use crate::error::{FailurePhase, TaskFailure};
use crate::fiber::{FiberArena, FiberId, FiberState, FinallyFn};
use crate::local::{self, LocalData};
use crate::options::FiberManagerOptions;
use crate::remote::{RemoteHandle, RemoteShared, RemoteTask};
use crate::task::{Task, TaskOutcome};

/// Receives every failure isolated at a fiber boundary
pub type ExceptionCallback = Rc<dyn Fn(&TaskFailure, FailurePhase)>;

/// Fiber counters of a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FiberManagerStats {
    /// Fibers currently owned by the manager, pooled or in use
    pub fibers_allocated: usize,
    /// Idle fibers in the pool
    pub fibers_pool_size: usize,
    /// Fibers with a task that has not finished yet
    pub fibers_active: usize,
}

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Managers created on this thread, for resuming fibers without a queue hop
    static THREAD_MANAGERS: RefCell<FxHashMap<u64, Weak<ManagerInner>>> =
        RefCell::new(FxHashMap::default());

    /// Manager whose loop is running on this thread
    static CURRENT_MANAGER: RefCell<Option<FiberManager>> = const { RefCell::new(None) };
}

/// Cooperative scheduler for the fibers of one thread
///
/// Cloning yields another handle to the same manager. The manager is tied
/// to the thread that created it; use [`RemoteHandle`] to submit work from
/// other threads.
#[derive(Clone)]
pub struct FiberManager {
    inner: Rc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    /// Process-unique manager id
    id: u64,

    /// Thread that created the manager and runs its loop
    owner: ThreadId,

    /// Configuration the manager was created with
    options: FiberManagerOptions,

    /// Every fiber of this manager, plus the idle pool
    fibers: RefCell<FiberArena>,

    /// Fibers waiting for their turn, in FIFO order
    ready: RefCell<VecDeque<FiberId>>,

    /// Queues and controller shared with other threads
    remote: Arc<RemoteShared>,

    /// Fiber whose local storage is in scope, kept while it escapes to the
    /// main context
    current_fiber: Cell<Option<FiberId>>,

    /// Fiber whose stack is executing
    active_fiber: Cell<Option<FiberId>>,

    /// Set once the controller has been asked to run the loop
    loop_scheduled: Cell<bool>,

    /// Tasks submitted and not finished yet
    fibers_active: Cell<usize>,

    /// Failure sink
    exception_callback: RefCell<ExceptionCallback>,

    /// Set while `loop_until_no_ready` runs
    in_loop: Cell<bool>,

    /// Fiber locals currently lent out by `with_local`
    loans: RefCell<Vec<Loan>>,
}

/// A fiber local detached from its fiber while a `with_local` closure runs
///
/// Tasks submitted by the fiber in the meantime inherit the value when it
/// comes back. Remote ones are held until then.
struct Loan {
    fiber: FiberId,
    key: TypeId,
    heirs: Vec<FiberId>,
    held: Vec<(Arc<RemoteShared>, RemoteTask)>,
}

impl FiberManager {
    /// Create a manager with default options
    pub fn new(controller: Arc<dyn LoopController>) -> Self {
        Self::with_options(controller, FiberManagerOptions::default())
    }

    /// Create a manager driven by `controller`
    ///
    /// # Panics
    ///
    /// Panics if the stacks requested by `initial_pool_size` cannot be
    /// allocated.
    pub fn with_options(controller: Arc<dyn LoopController>, options: FiberManagerOptions) -> Self {
        let mut fibers = FiberArena::new(options.stack_size, options.max_pool_size);
        let prefill = options.prefill_count();
        fibers
            .prefill(prefill)
            .expect("Failed to allocate fiber stacks");

        let id = NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed);
        if prefill > 0 {
            debug!(manager = id, count = prefill, "prefilled fiber pool");
        }

        let inner = Rc::new(ManagerInner {
            id,
            owner: thread::current().id(),
            options,
            fibers: RefCell::new(fibers),
            ready: RefCell::new(VecDeque::new()),
            remote: Arc::new(RemoteShared::new(controller)),
            current_fiber: Cell::new(None),
            active_fiber: Cell::new(None),
            loop_scheduled: Cell::new(false),
            fibers_active: Cell::new(0),
            exception_callback: RefCell::new(Rc::new(log_failure) as ExceptionCallback),
            in_loop: Cell::new(false),
            loans: RefCell::new(Vec::new()),
        });
        THREAD_MANAGERS.with(|managers| {
            managers.borrow_mut().insert(id, Rc::downgrade(&inner));
        });
        Self { inner }
    }

    /// The manager whose loop is running on this thread
    pub fn current() -> Option<FiberManager> {
        CURRENT_MANAGER
            .try_with(|current| current.borrow().clone())
            .ok()
            .flatten()
    }

    /// Like [`current`](Self::current), for code that only ever runs inside
    /// the loop
    ///
    /// # Panics
    ///
    /// Panics if no manager loop is running on this thread.
    pub fn get() -> FiberManager {
        match Self::current() {
            Some(manager) => manager,
            None => panic!("no fiber manager loop is running on this thread"),
        }
    }

    /// Options the manager was created with
    pub fn options(&self) -> &FiberManagerOptions {
        &self.inner.options
    }

    /// Handle for submitting tasks from other threads
    pub fn remote_handle(&self) -> RemoteHandle {
        RemoteHandle::new(self.inner.remote.clone())
    }

    /// Replace the failure callback
    ///
    /// The default callback logs the failure at error level.
    pub fn set_exception_callback<F>(&self, callback: F)
    where
        F: Fn(&TaskFailure, FailurePhase) + 'static,
    {
        *self.inner.exception_callback.borrow_mut() = Rc::new(callback);
    }

    /// Queue `func` to run on a fiber
    ///
    /// Submitted from a fiber, the new task starts with a copy of that
    /// fiber's local storage. Nothing runs until the loop does.
    pub fn add_task<F>(&self, func: F)
    where
        F: FnOnce() + 'static,
    {
        let task = Task::new(move || {
            func();
            Ok(())
        });
        self.inner.submit(task, None);
    }

    /// Queue `func` to run on a fiber and hand its result to `finally`
    ///
    /// `finally` runs exactly once on the main context after `func` returns,
    /// receiving the value, or the failure if `func` panicked. A failure is
    /// also reported to the failure callback.
    pub fn add_task_finally<F, G, T>(&self, func: F, finally: G)
    where
        F: FnOnce() -> T + 'static,
        G: FnOnce(Result<T, TaskFailure>) + 'static,
        T: 'static,
    {
        let slot: Rc<Cell<Option<Result<T, TaskFailure>>>> = Rc::new(Cell::new(None));

        let result = slot.clone();
        let task = Task::new(move || {
            let value = catch_failure(func);
            let outcome = match &value {
                Ok(_) => Ok(()),
                Err(failure) => Err(failure.clone()),
            };
            result.set(Some(value));
            outcome
        });

        let finally: FinallyFn = Box::new(move || {
            let value = slot
                .take()
                .unwrap_or_else(|| Err(TaskFailure::new("task finished without a result")));
            finally(value);
        });
        self.inner.submit(task, Some(finally));
    }

    /// Queue `func` through the remote task queue
    ///
    /// Equivalent to [`RemoteHandle::add_task_remote`] on this manager's handle.
    pub fn add_task_remote<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.remote_handle().add_task_remote(func);
    }

    /// Run fibers until no local or remote work is left
    ///
    /// Returns whether some fiber still has an unfinished task (it is
    /// suspended and waiting to be resumed).
    ///
    /// # Panics
    ///
    /// Panics if called from a fiber, or from a closure the loop itself runs
    /// on the main context (await setup, finally, main-context escape).
    pub fn loop_until_no_ready(&self) -> bool {
        assert!(
            !context::on_fiber(),
            "fiber manager loop entered from inside a fiber"
        );
        let _guard = LoopGuard::enter(self);
        let inner = &*self.inner;

        loop {
            while let Some(id) = inner.pop_ready() {
                inner.run_ready_fiber(id);
            }

            let resumed = inner.remote.ready.sweep(|id| {
                inner.fibers.borrow_mut().get_mut(id).mark_ready();
                trace!(fiber = %id, "fiber resumed remotely");
                inner.run_ready_fiber(id);
            });
            let started = inner
                .remote
                .tasks
                .sweep(|task| inner.run_remote_task(task));

            if !resumed && !started {
                break;
            }
        }
        inner.fibers_active.get() > 0
    }

    /// Run `func` on the main stack instead of the current fiber's
    ///
    /// From a fiber, the fiber parks while the manager runs `func`, then
    /// continues with its result. A panic in `func` is reported to the
    /// failure callback and returned as `Err`. Outside a fiber `func` is
    /// simply called.
    pub fn run_in_main_context<F, R>(&self, func: F) -> Result<R, TaskFailure>
    where
        F: FnOnce() -> R,
    {
        if !context::on_fiber() {
            return Ok(func());
        }

        let mut result = None;
        context::escape(|| {
            let value = catch_failure(func);
            if let Err(failure) = &value {
                self.inner.report(failure, FailurePhase::MainContext);
            }
            result = Some(value);
        });
        result.unwrap_or_else(|| Err(TaskFailure::new("main context closure did not run")))
    }

    /// Run `f` on the current fiber's `T`, or the thread's when no fiber is
    /// current
    ///
    /// The value is created with `Default` on first use. Tasks submitted from
    /// inside `f` inherit the value `f` leaves behind.
    ///
    /// # Panics
    ///
    /// Panics on a nested call for the same `T` on the same fiber.
    pub fn with_local<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Any + Send + Clone + Default,
    {
        let Some(id) = self.inner.current_fiber.get() else {
            return local::with_thread_local(f);
        };
        let mut lent = Lent {
            inner: &self.inner,
            fiber: id,
            value: self.inner.lend::<T>(id),
        };
        f(&mut lent.value)
    }

    /// Whether a fiber of this manager is executing right now
    pub fn has_active_fiber(&self) -> bool {
        self.inner.active_fiber.get().is_some()
    }

    /// Whether any task is unfinished or any remote work is queued
    pub fn has_tasks(&self) -> bool {
        self.inner.fibers_active.get() > 0
            || !self.inner.ready.borrow().is_empty()
            || self.inner.remote.has_pending()
    }

    /// Current fiber counters
    pub fn stats(&self) -> FiberManagerStats {
        let fibers = self.inner.fibers.borrow();
        FiberManagerStats {
            fibers_allocated: fibers.allocated(),
            fibers_pool_size: fibers.pool_size(),
            fibers_active: self.inner.fibers_active.get(),
        }
    }

    /// State of the fiber behind `id`, `None` once its task has finished
    pub fn fiber_state(&self, id: FiberId) -> Option<FiberState> {
        self.inner.fibers.borrow().state(id)
    }

    /// Fiber whose local storage is in scope
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.inner.current_fiber.get()
    }
}

impl fmt::Debug for FiberManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberManager")
            .field("id", &self.inner.id)
            .field("stats", &self.stats())
            .field("loop_scheduled", &self.inner.loop_scheduled.get())
            .finish()
    }
}

impl ManagerInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }

    pub(crate) fn remote(&self) -> &Arc<RemoteShared> {
        &self.remote
    }

    fn submit(&self, task: Task, finally: Option<FinallyFn>) {
        let local = self.local_snapshot().unwrap_or_default();
        let inline = task.is_inline();
        let id = self.assign(task, local, finally);
        self.record_heir(id);
        trace!(fiber = %id, inline, "task queued");
        self.ready.borrow_mut().push_back(id);
        self.ensure_loop_scheduled();
    }

    fn assign(&self, task: Task, local: LocalData, finally: Option<FinallyFn>) -> FiberId {
        let mut fibers = self.fibers.borrow_mut();
        let id = fibers.acquire().expect("Failed to allocate fiber stack");
        fibers.get_mut(id).assign(task, local, finally);
        self.fibers_active.set(self.fibers_active.get() + 1);
        id
    }

    fn local_snapshot(&self) -> Option<LocalData> {
        let id = self.current_fiber.get()?;
        Some(self.fibers.borrow().get(id).local.clone())
    }

    fn record_heir(&self, id: FiberId) {
        let Some(parent) = self.current_fiber.get() else {
            return;
        };
        for loan in self.loans.borrow_mut().iter_mut() {
            if loan.fiber == parent {
                loan.heirs.push(id);
            }
        }
    }

    /// Snapshot the current fiber's locals into `task`
    ///
    /// Returns the task when it can be pushed right away, `None` when it is
    /// held until a lent local comes back.
    fn prepare_remote(
        &self,
        shared: &Arc<RemoteShared>,
        mut task: RemoteTask,
    ) -> Option<RemoteTask> {
        let Some(id) = self.current_fiber.get() else {
            return Some(task);
        };
        task.local = self.local_snapshot();
        let mut loans = self.loans.borrow_mut();
        match loans.iter_mut().rev().find(|loan| loan.fiber == id) {
            Some(loan) => {
                loan.held.push((shared.clone(), task));
                None
            }
            None => Some(task),
        }
    }

    /// Detach the fiber's `T` for a `with_local` closure
    fn lend<T>(&self, id: FiberId) -> T
    where
        T: Any + Send + Clone + Default,
    {
        let key = TypeId::of::<T>();
        {
            let mut loans = self.loans.borrow_mut();
            assert!(
                !loans.iter().any(|loan| loan.fiber == id && loan.key == key),
                "fiber local `{}` is already borrowed",
                any::type_name::<T>()
            );
            loans.push(Loan {
                fiber: id,
                key,
                heirs: Vec::new(),
                held: Vec::new(),
            });
        }
        self.fibers.borrow_mut().get_mut(id).local.take::<T>()
    }

    /// Put a lent `T` back and hand copies to the tasks submitted meanwhile
    fn give_back<T>(&self, id: FiberId, value: T)
    where
        T: Any + Send + Clone + Default,
    {
        let key = TypeId::of::<T>();
        let loan = {
            let mut loans = self.loans.borrow_mut();
            loans
                .iter()
                .rposition(|loan| loan.fiber == id && loan.key == key)
                .map(|index| loans.remove(index))
        };
        let Some(Loan {
            heirs, mut held, ..
        }) = loan
        else {
            return;
        };

        for (_, task) in held.iter_mut() {
            let local = task.local.get_or_insert_with(LocalData::new);
            if local.get::<T>().is_none() {
                local.put(value.clone());
            }
        }
        {
            let mut fibers = self.fibers.borrow_mut();
            for heir in heirs {
                if let Some(fiber) = fibers.try_get_mut(heir) {
                    if fiber.local.get::<T>().is_none() {
                        fiber.local.put(value.clone());
                    }
                }
            }
            if let Some(fiber) = fibers.try_get_mut(id) {
                fiber.local.put(value);
            }
        }

        // Held remote tasks wait for every outstanding local of the fiber
        if let Some(outer) = self
            .loans
            .borrow_mut()
            .iter_mut()
            .rev()
            .find(|loan| loan.fiber == id)
        {
            outer.held.append(&mut held);
        }
        for (shared, task) in held {
            shared.push_task(task);
        }
    }

    fn ensure_loop_scheduled(&self) {
        if !self.loop_scheduled.replace(true) {
            self.remote.controller.schedule();
        }
    }

    /// Queue an awaiting fiber of this manager, from the owning thread
    pub(crate) fn ready_local(&self, id: FiberId) {
        self.fibers.borrow_mut().get_mut(id).mark_ready();
        trace!(fiber = %id, "fiber resumed");
        self.ready.borrow_mut().push_back(id);
        self.ensure_loop_scheduled();
    }

    fn pop_ready(&self) -> Option<FiberId> {
        self.ready.borrow_mut().pop_front()
    }

    fn set_state(&self, id: FiberId, state: FiberState) {
        self.fibers.borrow_mut().get_mut(id).set_state(state);
    }

    fn report(&self, failure: &TaskFailure, phase: FailurePhase) {
        let callback = self.exception_callback.borrow().clone();
        callback(failure, phase);
    }

    fn run_remote_task(&self, task: RemoteTask) {
        let RemoteTask { func, local } = task;
        let task = Task::new(move || {
            func();
            Ok(())
        });
        let id = self.assign(task, local.unwrap_or_default(), None);
        trace!(fiber = %id, "remote task started");
        self.run_ready_fiber(id);
    }

    /// Switch into the fiber once, keeping its context out of the arena
    /// while it runs
    fn resume_once(&self, id: FiberId) -> Suspend {
        let (mut context, input) = {
            let mut fibers = self.fibers.borrow_mut();
            let fiber = fibers.get_mut(id);
            let input = fiber.begin_resume();
            (fiber.take_context(), input)
        };

        self.active_fiber.set(Some(id));
        let out = context.resume(input);
        self.active_fiber.set(None);

        self.fibers.borrow_mut().get_mut(id).put_context(context);
        out
    }

    fn run_ready_fiber(&self, id: FiberId) {
        let previous = self.current_fiber.replace(Some(id));

        let mut out = self.resume_once(id);
        loop {
            match out {
                Suspend::MainContext(func) => {
                    self.set_state(id, FiberState::AwaitingImmediate);
                    if let Err(failure) = catch_failure(func) {
                        self.report(&failure, FailurePhase::MainContext);
                    }
                    self.set_state(id, FiberState::ReadyToRun);
                    out = self.resume_once(id);
                }
                Suspend::Await(setup) => {
                    self.set_state(id, FiberState::Awaiting);
                    trace!(fiber = %id, "fiber awaiting");
                    let fiber = SuspendedFiber::new(id, self);
                    if let Err(failure) = catch_failure(move || setup(fiber)) {
                        self.report(&failure, FailurePhase::AwaitSetup);
                    }
                    break;
                }
                Suspend::Finished(outcome) => {
                    self.finish(id, outcome);
                    break;
                }
            }
        }

        self.current_fiber.set(previous);
    }

    fn finish(&self, id: FiberId, outcome: TaskOutcome) {
        if let Err(failure) = &outcome {
            self.report(failure, FailurePhase::Task);
        }
        debug_assert!(self.fibers_active.get() > 0);
        self.fibers_active.set(self.fibers_active.get() - 1);

        let finally = {
            let mut fibers = self.fibers.borrow_mut();
            let fiber = fibers.get_mut(id);
            fiber.set_state(FiberState::Terminal);
            fiber.take_finally()
        };
        if let Some(finally) = finally {
            if let Err(failure) = catch_failure(finally) {
                self.report(&failure, FailurePhase::Finally);
            }
        }

        let (local, destroyed) = {
            let mut fibers = self.fibers.borrow_mut();
            let local = mem::take(&mut fibers.get_mut(id).local);
            (local, fibers.release(id))
        };
        drop(local);
        if let Some(fiber) = destroyed {
            debug!(fiber = %id, "fiber pool full, destroying fiber");
            drop(fiber);
        }
        trace!(fiber = %id, "fiber finished");
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let _ = THREAD_MANAGERS.try_with(|managers| managers.borrow_mut().remove(&self.id));
        let active = self.fibers_active.get();
        if active > 0 {
            warn!(
                manager = self.id,
                fibers_active = active,
                "fiber manager dropped with unfinished fibers"
            );
        }
    }
}

fn log_failure(failure: &TaskFailure, phase: FailurePhase) {
    error!(%phase, error = %failure, "fiber failure");
}

/// Marks a manager as current for the duration of its loop
struct LoopGuard<'a> {
    inner: &'a ManagerInner,
    previous: Option<FiberManager>,
}

impl<'a> LoopGuard<'a> {
    fn enter(manager: &'a FiberManager) -> Self {
        assert!(
            !manager.inner.in_loop.replace(true),
            "fiber manager loop is already running on this thread"
        );
        let previous = CURRENT_MANAGER.with(|current| current.replace(Some(manager.clone())));
        Self {
            inner: &manager.inner,
            previous,
        }
    }
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.inner.in_loop.set(false);
        self.inner.loop_scheduled.set(false);
        let ours = CURRENT_MANAGER.with(|current| current.replace(self.previous.take()));
        drop(ours);
    }
}

/// A fiber local out on loan, returned to its fiber on drop
struct Lent<'a, T: Any + Send + Clone + Default> {
    inner: &'a ManagerInner,
    fiber: FiberId,
    value: T,
}

impl<T: Any + Send + Clone + Default> Drop for Lent<'_, T> {
    fn drop(&mut self) {
        let value = mem::take(&mut self.value);
        self.inner.give_back(self.fiber, value);
    }
}

/// Look up a manager created on this thread
pub(crate) fn lookup(id: u64) -> Option<Rc<ManagerInner>> {
    THREAD_MANAGERS
        .try_with(|managers| managers.borrow().get(&id).and_then(Weak::upgrade))
        .ok()
        .flatten()
}

/// Queue a remote task, carrying the locals of the fiber current on this
/// thread
pub(crate) fn submit_remote(shared: &Arc<RemoteShared>, task: RemoteTask) {
    let task = match FiberManager::current() {
        Some(manager) => manager.inner.prepare_remote(shared, task),
        None => Some(task),
    };
    if let Some(task) = task {
        shared.push_task(task);
    }
}

/// Run `func` on the main stack if called from a fiber
///
/// See [`FiberManager::run_in_main_context`].
pub fn run_in_main_context<F, R>(func: F) -> Result<R, TaskFailure>
where
    F: FnOnce() -> R,
{
    match FiberManager::current() {
        Some(manager) => manager.run_in_main_context(func),
        None => Ok(func()),
    }
}

/// Run `f` on the current fiber's `T`, or the thread's outside a fiber
///
/// See [`FiberManager::with_local`].
pub fn with_local<T, R>(f: impl FnOnce(&mut T) -> R) -> R
where
    T: Any + Send + Clone + Default,
{
    match FiberManager::current() {
        Some(manager) => manager.with_local(f),
        None => local::with_thread_local(f),
    }
}
