//! Fiber manager configuration

use serde::{Deserialize, Serialize};
use std::env;

/// Default coroutine stack size per fiber (128 KiB)
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Default number of idle fibers kept for reuse
pub const DEFAULT_MAX_POOL_SIZE: usize = 1000;

/// Configuration for a [`FiberManager`](crate::FiberManager)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberManagerOptions {
    /// Stack size in bytes for each fiber (rounded up to whole pages, plus a
    /// guard page)
    pub stack_size: usize,

    /// Maximum number of idle fibers retained in the pool. A fiber that
    /// finishes while the pool is full is destroyed.
    pub max_pool_size: usize,

    /// Number of fibers allocated into the pool when the manager is created
    pub initial_pool_size: usize,
}

impl Default for FiberManagerOptions {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            initial_pool_size: 0,
        }
    }
}

impl FiberManagerOptions {
    /// Options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Build options from `FILAMENT_STACK_SIZE`, `FILAMENT_MAX_POOL_SIZE` and
    /// `FILAMENT_INITIAL_POOL_SIZE`. Missing or unparsable values fall back
    /// to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stack_size: env_usize("FILAMENT_STACK_SIZE", defaults.stack_size),
            max_pool_size: env_usize("FILAMENT_MAX_POOL_SIZE", defaults.max_pool_size),
            initial_pool_size: env_usize("FILAMENT_INITIAL_POOL_SIZE", defaults.initial_pool_size),
        }
    }

    /// Set the per-fiber stack size
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Set the pool capacity
    pub fn with_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    /// Set how many fibers to allocate up front
    pub fn with_initial_pool_size(mut self, initial_pool_size: usize) -> Self {
        self.initial_pool_size = initial_pool_size;
        self
    }

    /// Number of fibers to prefill, never more than the pool can hold
    pub(crate) fn prefill_count(&self) -> usize {
        self.initial_pool_size.min(self.max_pool_size)
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = FiberManagerOptions::default();
        assert_eq!(options.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(options.max_pool_size, DEFAULT_MAX_POOL_SIZE);
        assert_eq!(options.initial_pool_size, 0);
        assert_eq!(options, FiberManagerOptions::new());
    }

    #[test]
    fn test_builder() {
        let options = FiberManagerOptions::new()
            .with_stack_size(64 * 1024)
            .with_max_pool_size(4)
            .with_initial_pool_size(2);
        assert_eq!(options.stack_size, 64 * 1024);
        assert_eq!(options.max_pool_size, 4);
        assert_eq!(options.initial_pool_size, 2);
    }

    #[test]
    fn test_prefill_clamped_to_pool_size() {
        let options = FiberManagerOptions::new()
            .with_max_pool_size(3)
            .with_initial_pool_size(10);
        assert_eq!(options.prefill_count(), 3);
    }

    #[test]
    fn test_deserialize_partial() {
        let options: FiberManagerOptions =
            serde_json::from_str(r#"{ "max_pool_size": 8 }"#).unwrap();
        assert_eq!(options.max_pool_size, 8);
        assert_eq!(options.stack_size, DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_from_env() {
        env::set_var("FILAMENT_MAX_POOL_SIZE", "12");
        env::set_var("FILAMENT_STACK_SIZE", "not a number");
        let options = FiberManagerOptions::from_env();
        env::remove_var("FILAMENT_MAX_POOL_SIZE");
        env::remove_var("FILAMENT_STACK_SIZE");

        assert_eq!(options.max_pool_size, 12);
        assert_eq!(options.stack_size, DEFAULT_STACK_SIZE);
    }
}
