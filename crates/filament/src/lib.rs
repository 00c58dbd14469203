//! Filament: cooperative fibers for blocking-style code on an event loop
//!
//! A [`FiberManager`] runs many lightweight fibers on one OS thread. Each
//! fiber has its own stack, so task code can wait for an asynchronous
//! result with ordinary control flow while the thread keeps running other
//! fibers. An external event loop drives the manager through the
//! [`LoopController`] trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use filament::{await_promise, FiberManager, Promise, SimpleLoopController};
//!
//! let controller = Arc::new(SimpleLoopController::new());
//! let manager = FiberManager::new(controller.clone());
//!
//! manager.add_task(|| {
//!     let value = await_promise(|promise: Promise<u32>| {
//!         std::thread::spawn(move || promise.set_value(42));
//!     });
//!     assert_eq!(value, Ok(42));
//! });
//!
//! controller.run_until(&manager, || !manager.has_tasks());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Baton wait/post primitive and fiber suspension
pub mod baton;

/// Loop controller trait and a blocking implementation
pub mod controller;

/// Failure and error types
pub mod error;

/// Fiber identity, states and the fiber arena
pub mod fiber;

/// Per-fiber local storage
pub mod local;

/// The fiber manager and its run loop
pub mod manager;

/// Manager configuration
pub mod options;

/// One-shot promises awaited by fibers
pub mod promise;

/// Cross-thread submission queues
pub mod remote;

mod context;
mod task;

pub use baton::{suspend_fiber, yield_now, Baton, SuspendedFiber};
pub use context::on_fiber;
pub use controller::{LoopController, SimpleLoopController};
pub use error::{FailurePhase, FiberError, FiberResult, TaskFailure};
pub use fiber::{FiberId, FiberState};
pub use local::LocalData;
pub use manager::{
    run_in_main_context, with_local, ExceptionCallback, FiberManager, FiberManagerStats,
};
pub use options::FiberManagerOptions;
pub use promise::{await_promise, Promise};
pub use remote::RemoteHandle;
pub use task::INLINE_TASK_SIZE;
