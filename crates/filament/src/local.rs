//! Per-fiber local storage
//!
//! Each fiber carries a small type-keyed map. Values are created on first
//! access with `Default`, copied into child tasks when they are submitted
//! (a snapshot, not a shared reference) and cleared when the fiber
//! finishes. Code running outside any fiber gets a per-thread map instead.

use std::any::{Any, TypeId};
use std::cell::RefCell;

use rustc_hash::FxHashMap;

trait LocalValue: Any + Send {
    fn clone_boxed(&self) -> Box<dyn LocalValue>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send + Clone> LocalValue for T {
    fn clone_boxed(&self) -> Box<dyn LocalValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Type-keyed storage attached to a fiber
#[derive(Default)]
pub struct LocalData {
    values: FxHashMap<TypeId, Box<dyn LocalValue>>,
}

impl LocalData {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the stored `T`, if any
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| (**v).as_any().downcast_ref())
    }

    /// Mutably borrow the stored `T`, if any
    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.values
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| (**v).as_any_mut().downcast_mut())
    }

    /// Store `value`, replacing any previous `T`
    pub fn put<T: Any + Send + Clone>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Remove the stored `T`, or produce a default one
    pub fn take<T: Any + Send + Clone + Default>(&mut self) -> T {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.into_any().downcast::<T>().ok())
            .map_or_else(T::default, |v| *v)
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drop every stored value
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl Clone for LocalData {
    fn clone(&self) -> Self {
        Self {
            values: self
                .values
                .iter()
                .map(|(key, value)| (*key, (**value).clone_boxed()))
                .collect(),
        }
    }
}

impl std::fmt::Debug for LocalData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalData").field("len", &self.len()).finish()
    }
}

thread_local! {
    static THREAD_LOCAL_DATA: RefCell<LocalData> = RefCell::new(LocalData::new());
}

/// Run `f` on the calling thread's `T`, creating it if missing
///
/// The value is detached from the thread's storage while `f` runs and put
/// back afterwards, also when `f` panics.
pub(crate) fn with_thread_local<T, R>(f: impl FnOnce(&mut T) -> R) -> R
where
    T: Any + Send + Clone + Default,
{
    let value = THREAD_LOCAL_DATA.with(|data| data.borrow_mut().take::<T>());
    let mut detached = Detached(value);
    f(&mut detached.0)
}

struct Detached<T: Any + Send + Clone + Default>(T);

impl<T: Any + Send + Clone + Default> Drop for Detached<T> {
    fn drop(&mut self) {
        let value = std::mem::take(&mut self.0);
        let _ = THREAD_LOCAL_DATA.try_with(|data| data.borrow_mut().put(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct RequestId(u64);

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Tags(Vec<String>);

    #[test]
    fn test_take_defaults_when_missing() {
        let mut data = LocalData::new();
        assert_eq!(data.take::<RequestId>(), RequestId(0));
        assert!(data.is_empty());
    }

    #[test]
    fn test_put_get() {
        let mut data = LocalData::new();
        data.put(RequestId(7));
        data.put(Tags(vec!["a".into()]));
        assert_eq!(data.len(), 2);
        assert_eq!(data.get::<RequestId>(), Some(&RequestId(7)));

        data.get_mut::<Tags>().unwrap().0.push("b".into());
        assert_eq!(data.get::<Tags>().unwrap().0, vec!["a", "b"]);
    }

    #[test]
    fn test_clone_is_a_snapshot() {
        let mut parent = LocalData::new();
        parent.put(RequestId(1));
        let child = parent.clone();

        parent.put(RequestId(2));
        assert_eq!(child.get::<RequestId>(), Some(&RequestId(1)));
        assert_eq!(parent.get::<RequestId>(), Some(&RequestId(2)));
    }

    #[test]
    fn test_clear() {
        let mut data = LocalData::new();
        data.put(RequestId(3));
        data.clear();
        assert!(data.get::<RequestId>().is_none());
    }

    #[test]
    fn test_thread_local_persists_per_thread() {
        with_thread_local(|id: &mut RequestId| id.0 = 11);
        assert_eq!(with_thread_local(|id: &mut RequestId| id.0), 11);

        let other = std::thread::spawn(|| with_thread_local(|id: &mut RequestId| id.0))
            .join()
            .unwrap();
        assert_eq!(other, 0);
    }

    #[test]
    fn test_thread_local_survives_panic() {
        with_thread_local(|id: &mut RequestId| id.0 = 4);
        let result = std::panic::catch_unwind(|| {
            with_thread_local(|id: &mut RequestId| {
                id.0 = 5;
                panic!("inside");
            })
        });
        assert!(result.is_err());
        assert_eq!(with_thread_local(|id: &mut RequestId| id.0), 5);
    }
}
