//! Type-erased task closures
//!
//! A fiber holds the closure it is about to run. Closures that fit in
//! [`INLINE_TASK_SIZE`] bytes (and whose alignment the buffer satisfies) are
//! written straight into an inline buffer, so submitting them does not touch
//! the allocator. Anything larger is boxed. Exactly one of the two
//! representations is live for a given task.

use std::mem::{self, ManuallyDrop, MaybeUninit};
use std::ptr;

use crate::error::TaskFailure;

/// Bytes available for a closure stored inline
pub const INLINE_TASK_SIZE: usize = 256;

/// What a task reports back to the manager when it finishes
pub(crate) type TaskOutcome = Result<(), TaskFailure>;

#[repr(C, align(16))]
struct InlineBuffer([MaybeUninit<u8>; INLINE_TASK_SIZE]);

impl InlineBuffer {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr().cast()
    }
}

/// Closure stored in the inline buffer, with its monomorphized call and
/// drop entry points
struct InlineTask {
    buf: InlineBuffer,
    call: unsafe fn(*mut u8) -> TaskOutcome,
    drop_in_place: unsafe fn(*mut u8),
}

impl Drop for InlineTask {
    fn drop(&mut self) {
        // SAFETY: the buffer holds a live closure of the type `drop_in_place`
        // was instantiated for; `Task::run` wraps the task in ManuallyDrop
        // before moving the closure out.
        unsafe { (self.drop_in_place)(self.buf.as_mut_ptr()) }
    }
}

enum Repr {
    Inline(InlineTask),
    Boxed(Box<dyn FnOnce() -> TaskOutcome>),
}

/// A task closure waiting to run on a fiber
pub(crate) struct Task {
    repr: Repr,
}

impl Task {
    /// Wrap a closure, storing it inline when it fits
    pub(crate) fn new<F>(func: F) -> Self
    where
        F: FnOnce() -> TaskOutcome + 'static,
    {
        if !fits_inline::<F>() {
            return Self {
                repr: Repr::Boxed(Box::new(func)),
            };
        }

        let mut buf = InlineBuffer([MaybeUninit::uninit(); INLINE_TASK_SIZE]);
        // SAFETY: fits_inline checked that F's size and alignment fit the buffer.
        unsafe { ptr::write(buf.as_mut_ptr().cast::<F>(), func) };
        Self {
            repr: Repr::Inline(InlineTask {
                buf,
                call: call_inline::<F>,
                drop_in_place: drop_inline::<F>,
            }),
        }
    }

    /// Whether the closure lives in the inline buffer
    pub(crate) fn is_inline(&self) -> bool {
        matches!(self.repr, Repr::Inline(_))
    }

    /// Run the closure, consuming the task
    pub(crate) fn run(self) -> TaskOutcome {
        match self.repr {
            Repr::Inline(inline) => {
                let mut inline = ManuallyDrop::new(inline);
                // SAFETY: the closure is moved out of the buffer exactly once
                // and ManuallyDrop keeps InlineTask::drop from touching it again.
                unsafe { (inline.call)(inline.buf.as_mut_ptr()) }
            }
            Repr::Boxed(func) => func(),
        }
    }
}

fn fits_inline<F>() -> bool {
    mem::size_of::<F>() <= INLINE_TASK_SIZE && mem::align_of::<F>() <= mem::align_of::<InlineBuffer>()
}

unsafe fn call_inline<F>(ptr: *mut u8) -> TaskOutcome
where
    F: FnOnce() -> TaskOutcome,
{
    let func = ptr::read(ptr.cast::<F>());
    func()
}

unsafe fn drop_inline<F>(ptr: *mut u8) {
    ptr::drop_in_place(ptr.cast::<F>());
}
