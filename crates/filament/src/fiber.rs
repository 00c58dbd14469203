//! Fibers and the fiber arena
//!
//! Fibers live in slots of a [`FiberArena`] and are addressed by [`FiberId`]
//! (slot index plus generation). The generation changes every time a fiber
//! finishes a task, so a handle kept past that point no longer resolves and
//! using it is caught as a protocol violation.
//!
//! Idle fibers are kept on a bounded free list, the pool. A fiber is either
//! in the pool, queued, or running its task, never more than one of these.

use std::fmt;
use std::io;

use crate::context::{FiberContext, Resume};
use crate::local::LocalData;
use crate::task::Task;

/// Continuation run on the main context after a task completes
pub(crate) type FinallyFn = Box<dyn FnOnce()>;

/// Stable handle to a fiber running a particular task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId {
    index: u32,
    generation: u32,
}

impl FiberId {
    /// Arena slot index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation this handle was issued for
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Fiber lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberState {
    /// Task assigned, never resumed
    NotStarted,
    /// Queued to continue after a suspension
    ReadyToRun,
    /// Executing on its own stack
    Running,
    /// Suspended until someone resumes it
    Awaiting,
    /// Suspended while a closure runs on the main context
    AwaitingImmediate,
    /// No task; the fiber is pooled or being recycled
    Terminal,
}

impl FiberState {
    /// Whether the manager may switch into a fiber in this state
    pub fn is_runnable(self) -> bool {
        matches!(self, FiberState::NotStarted | FiberState::ReadyToRun)
    }
}

pub(crate) struct Fiber {
    state: FiberState,
    context: Option<FiberContext>,
    task: Option<Task>,
    finally: Option<FinallyFn>,
    pub(crate) local: LocalData,
}

impl Fiber {
    fn new(stack_size: usize) -> io::Result<Self> {
        Ok(Self {
            state: FiberState::Terminal,
            context: Some(FiberContext::new(stack_size)?),
            task: None,
            finally: None,
            local: LocalData::new(),
        })
    }

    pub(crate) fn state(&self) -> FiberState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: FiberState) {
        self.state = state;
    }

    /// Give an idle fiber a task to run
    pub(crate) fn assign(&mut self, task: Task, local: LocalData, finally: Option<FinallyFn>) {
        assert_eq!(
            self.state,
            FiberState::Terminal,
            "task assigned to a fiber that is still in use"
        );
        self.state = FiberState::NotStarted;
        self.task = Some(task);
        self.finally = finally;
        self.local = local;
    }

    /// Move into `Running` and build the value to resume the context with
    pub(crate) fn begin_resume(&mut self) -> Resume {
        let input = match self.state {
            FiberState::NotStarted => match self.task.take() {
                Some(task) => Resume::Start(task),
                None => panic!("fiber started without a task"),
            },
            FiberState::ReadyToRun => Resume::Continue,
            state => panic!("cannot resume a fiber in state {:?}", state),
        };
        self.state = FiberState::Running;
        input
    }

    /// An awaiting fiber was resumed
    pub(crate) fn mark_ready(&mut self) {
        assert_eq!(
            self.state,
            FiberState::Awaiting,
            "fiber resumed while not suspended (resumed twice?)"
        );
        self.state = FiberState::ReadyToRun;
    }

    pub(crate) fn take_context(&mut self) -> FiberContext {
        match self.context.take() {
            Some(context) => context,
            None => panic!("fiber context is already in use"),
        }
    }

    pub(crate) fn put_context(&mut self, context: FiberContext) {
        self.context = Some(context);
    }

    pub(crate) fn take_finally(&mut self) -> Option<FinallyFn> {
        self.finally.take()
    }
}

struct Slot {
    generation: u32,
    fiber: Option<Fiber>,
}

/// Slot arena owning every fiber of one manager, plus the idle pool
pub(crate) struct FiberArena {
    slots: Vec<Slot>,
    pool: Vec<u32>,
    vacant: Vec<u32>,
    stack_size: usize,
    max_pool_size: usize,
    allocated: usize,
}

impl FiberArena {
    pub(crate) fn new(stack_size: usize, max_pool_size: usize) -> Self {
        Self {
            slots: Vec::new(),
            pool: Vec::new(),
            vacant: Vec::new(),
            stack_size,
            max_pool_size,
            allocated: 0,
        }
    }

    /// Number of live fibers (pooled or in use)
    pub(crate) fn allocated(&self) -> usize {
        self.allocated
    }

    /// Number of idle fibers in the pool
    pub(crate) fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Allocate `count` fibers straight into the pool
    pub(crate) fn prefill(&mut self, count: usize) -> io::Result<()> {
        for _ in 0..count {
            let index = self.allocate()?;
            self.pool.push(index);
        }
        Ok(())
    }

    /// Take an idle fiber from the pool or allocate a fresh one
    pub(crate) fn acquire(&mut self) -> io::Result<FiberId> {
        let index = match self.pool.pop() {
            Some(index) => index,
            None => self.allocate()?,
        };
        Ok(FiberId {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    fn allocate(&mut self) -> io::Result<u32> {
        let fiber = Fiber::new(self.stack_size)?;
        self.allocated += 1;
        if let Some(index) = self.vacant.pop() {
            self.slots[index as usize].fiber = Some(fiber);
            return Ok(index);
        }
        let index = u32::try_from(self.slots.len())
            .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "fiber arena is full"))?;
        self.slots.push(Slot {
            generation: 0,
            fiber: Some(fiber),
        });
        Ok(index)
    }

    /// Retire the handle of a finished fiber and pool the fiber
    ///
    /// When the pool is full the fiber is removed from the arena and returned
    /// so the caller can drop it outside any borrow.
    pub(crate) fn release(&mut self, id: FiberId) -> Option<Fiber> {
        let max_pool_size = self.max_pool_size;
        let slot = self.slot_mut(id);
        debug_assert!(slot.fiber.as_ref().map_or(false, |f| f.state == FiberState::Terminal));
        slot.generation = slot.generation.wrapping_add(1);

        if self.pool.len() < max_pool_size {
            self.pool.push(id.index);
            return None;
        }
        let fiber = self.slots[id.index as usize].fiber.take();
        self.vacant.push(id.index);
        self.allocated -= 1;
        fiber
    }

    /// State of the fiber behind `id`, `None` for a stale handle
    pub(crate) fn state(&self, id: FiberId) -> Option<FiberState> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.fiber.as_ref().map(Fiber::state)
    }

    /// Like [`get_mut`](Self::get_mut), `None` for a stale handle
    pub(crate) fn try_get_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.fiber.as_mut()
    }

    pub(crate) fn get(&self, id: FiberId) -> &Fiber {
        match self.slots.get(id.index as usize) {
            Some(Slot {
                generation,
                fiber: Some(fiber),
            }) if *generation == id.generation => fiber,
            _ => stale(id),
        }
    }

    pub(crate) fn get_mut(&mut self, id: FiberId) -> &mut Fiber {
        match self.slot_mut(id).fiber.as_mut() {
            Some(fiber) => fiber,
            None => stale(id),
        }
    }

    fn slot_mut(&mut self, id: FiberId) -> &mut Slot {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.fiber.is_some() => slot,
            _ => stale(id),
        }
    }
}

fn stale(id: FiberId) -> ! {
    panic!("fiber {} is no longer live (resuming a terminal fiber?)", id)
}
