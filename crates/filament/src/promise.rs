//! One-shot result channel into a waiting fiber

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::baton::Baton;
use crate::context::catch_failure;
use crate::error::{FiberError, FiberResult, TaskFailure};

struct Shared<T> {
    value: Mutex<Option<FiberResult<T>>>,
    baton: Baton,
}

/// Producer side of [`await_promise`]
///
/// Fulfilled at most once. Dropping it unfulfilled delivers
/// [`FiberError::BrokenPromise`] to the waiter.
pub struct Promise<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Promise<T> {
    /// Deliver a value
    pub fn set_value(self, value: T) {
        self.fulfil(Ok(value));
    }

    /// Deliver a failure
    pub fn set_failure(self, failure: TaskFailure) {
        self.fulfil(Err(FiberError::Task(failure)));
    }

    /// Deliver a value or a failure
    pub fn set_result(self, result: Result<T, TaskFailure>) {
        self.fulfil(result.map_err(FiberError::Task));
    }

    /// Deliver the return value of `func`, or its panic as a failure
    pub fn set_with(self, func: impl FnOnce() -> T) {
        self.set_result(catch_failure(func));
    }

    fn fulfil(mut self, result: FiberResult<T>) {
        if let Some(shared) = self.shared.take() {
            deliver(&shared, result);
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            deliver(&shared, Err(FiberError::BrokenPromise));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("fulfilled", &self.shared.is_none())
            .finish()
    }
}

fn deliver<T>(shared: &Shared<T>, result: FiberResult<T>) {
    *shared.value.lock() = Some(result);
    shared.baton.post();
}

/// Wait for the value `start` arranges to deliver
///
/// `start` receives the [`Promise`] and should hand it to whatever produces
/// the value: another fiber, a callback, another thread. On a fiber it runs
/// on the main context after the fiber has parked; outside a fiber the
/// calling thread blocks until the promise is fulfilled.
pub fn await_promise<T, F>(start: F) -> FiberResult<T>
where
    F: FnOnce(Promise<T>),
{
    let shared = Arc::new(Shared {
        value: Mutex::new(None),
        baton: Baton::new(),
    });
    let promise = Promise {
        shared: Some(shared.clone()),
    };

    shared.baton.wait_with(move || start(promise));

    let value = shared.value.lock().take();
    value.unwrap_or(Err(FiberError::BrokenPromise))
}
