//! Execution context switching
//!
//! Every fiber owns a corosensei coroutine running [`fiber_main`]. The
//! manager drives it with a [`Resume`] value and gets a [`Suspend`] value
//! back whenever the fiber finishes a task, waits for an external event or
//! asks for a closure to be run on the main stack.
//!
//! The body loops over tasks, so a pooled fiber keeps its stack and its
//! coroutine between tasks.

use std::cell::Cell;
use std::io;
use std::mem::{self, ManuallyDrop};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::thread;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::baton::SuspendedFiber;
use crate::error::TaskFailure;
use crate::task::{Task, TaskOutcome};

/// Closure run on the main context right after a fiber parks itself
pub(crate) type AwaitFn = Box<dyn FnOnce(SuspendedFiber)>;

/// Closure a fiber wants run on the main stack
pub(crate) type EscapeFn = Box<dyn FnOnce()>;

/// Manager to fiber handoff
pub(crate) enum Resume {
    /// Run a new task
    Start(Task),
    /// Continue from the last suspension point
    Continue,
    /// Leave the task loop so the coroutine can be dropped without unwinding
    Exit,
}

/// Fiber to manager handoff
pub(crate) enum Suspend {
    /// The task body returned (or failed); the fiber is idle again
    Finished(TaskOutcome),
    /// The fiber is waiting; run the closure with its resume handle
    Await(AwaitFn),
    /// Run the closure on the main stack, then continue the fiber
    MainContext(EscapeFn),
}

type FiberYielder = Yielder<Resume, Suspend>;

thread_local! {
    /// Yielder of the fiber executing on this thread, `None` on the main stack
    static CURRENT_YIELDER: Cell<Option<NonNull<FiberYielder>>> = const { Cell::new(None) };

    /// Set while a suspended fiber's stack is being force-unwound
    static FORCED_UNWIND: Cell<bool> = const { Cell::new(false) };
}

/// A fiber's stack and coroutine
pub(crate) struct FiberContext {
    coroutine: ManuallyDrop<Coroutine<Resume, Suspend, (), DefaultStack>>,
    idle: bool,
}

impl FiberContext {
    /// Allocate a stack of at least `stack_size` bytes and set up the fiber body
    pub(crate) fn new(stack_size: usize) -> io::Result<Self> {
        let stack = DefaultStack::new(stack_size)?;
        Ok(Self {
            coroutine: ManuallyDrop::new(Coroutine::with_stack(stack, fiber_main)),
            idle: true,
        })
    }

    /// Switch into the fiber until it suspends again
    pub(crate) fn resume(&mut self, input: Resume) -> Suspend {
        self.idle = false;
        match self.coroutine.resume(input) {
            CoroutineResult::Yield(out) => {
                self.idle = matches!(out, Suspend::Finished(_));
                out
            }
            CoroutineResult::Return(()) => panic!("fiber body returned while in use"),
        }
    }
}

impl Drop for FiberContext {
    fn drop(&mut self) {
        let suspended = self.coroutine.started() && !self.coroutine.done();
        if suspended && self.idle {
            if let CoroutineResult::Yield(_) = self.coroutine.resume(Resume::Exit) {
                panic!("fiber did not exit when asked to");
            }
        } else if suspended && thread::panicking() {
            // Unwinding a second stack during a panic aborts; leak it instead.
            return;
        }

        // SAFETY: `coroutine` is never touched again after this point.
        unsafe { ManuallyDrop::drop(&mut self.coroutine) };
        FORCED_UNWIND.with(|f| f.set(false));
    }
}

fn fiber_main(yielder: &FiberYielder, mut input: Resume) {
    CURRENT_YIELDER.with(|y| y.set(Some(NonNull::from(yielder))));
    loop {
        let task = match input {
            Resume::Start(task) => task,
            Resume::Exit => break,
            Resume::Continue => panic!("fiber continued without a task"),
        };
        let outcome = catch_failure(|| task.run()).and_then(|outcome| outcome);
        input = switch(Suspend::Finished(outcome));
    }
    CURRENT_YIELDER.with(|y| y.set(None));
}

/// Marks the unwind when a suspended fiber is dropped
struct UnwindGuard;

impl Drop for UnwindGuard {
    fn drop(&mut self) {
        FORCED_UNWIND.with(|f| f.set(true));
    }
}

fn switch(out: Suspend) -> Resume {
    let yielder = CURRENT_YIELDER
        .with(Cell::take)
        .unwrap_or_else(|| panic!("fiber suspension requested outside of a fiber"));

    let guard = UnwindGuard;
    // SAFETY: the pointer was installed by the coroutine currently executing
    // on this thread and its yielder lives on that coroutine's stack.
    let input = unsafe { yielder.as_ref() }.suspend(out);
    mem::forget(guard);

    CURRENT_YIELDER.with(|y| y.set(Some(yielder)));
    input
}

/// Yield to the manager and wait to be continued
fn suspend(out: Suspend) {
    match switch(out) {
        Resume::Continue => {}
        Resume::Start(_) | Resume::Exit => panic!("suspended fiber was handed a new task"),
    }
}

/// Whether the caller is executing on a fiber stack
pub fn on_fiber() -> bool {
    CURRENT_YIELDER.with(|y| y.get().is_some())
}

/// Park the current fiber and hand `setup` its resume handle on the main
/// context
pub(crate) fn await_with<'a>(setup: impl FnOnce(SuspendedFiber) + 'a) {
    let setup: Box<dyn FnOnce(SuspendedFiber) + 'a> = Box::new(setup);
    // SAFETY: the manager calls (and frees) the closure on the main context
    // before this fiber can run again, so nothing it borrows from this
    // stack frame is used after the frame is resumed.
    let setup: AwaitFn = unsafe { mem::transmute(setup) };
    suspend(Suspend::Await(setup));
}

/// Run `func` on the main stack and continue the current fiber afterwards
pub(crate) fn escape<'a>(func: impl FnOnce() + 'a) {
    let func: Box<dyn FnOnce() + 'a> = Box::new(func);
    // SAFETY: same contract as `await_with`; the closure is consumed before
    // the fiber is continued.
    let func: EscapeFn = unsafe { mem::transmute(func) };
    suspend(Suspend::MainContext(func));
}

/// Run `func`, turning a panic into a [`TaskFailure`]
///
/// The forced unwind of a dropped fiber is not a failure and keeps unwinding.
pub(crate) fn catch_failure<R>(func: impl FnOnce() -> R) -> Result<R, TaskFailure> {
    panic::catch_unwind(AssertUnwindSafe(func)).map_err(|payload| {
        if FORCED_UNWIND.with(Cell::get) {
            panic::resume_unwind(payload);
        }
        TaskFailure::from_panic(payload)
    })
}
