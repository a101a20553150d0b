//! Owned opaque payloads with a release callback
//!
//! Groups carry driver data the framework cannot interpret. The payload owns
//! the value and an optional release closure; the closure runs exactly once,
//! when the payload is dropped, and receives the value back.

use alloc::boxed::Box;
use core::any::Any;
use core::fmt;

type ReleaseFn = Box<dyn FnOnce(Box<dyn Any + Send + Sync>) + Send + Sync>;

/// Type-erased value plus its destructor
pub struct Payload {
    value: Option<Box<dyn Any + Send + Sync>>,
    release: Option<ReleaseFn>,
}

impl Payload {
    /// Wrap a value that needs no special release.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Some(Box::new(value)),
            release: None,
        }
    }

    /// Wrap a value whose release hands it to `release`.
    pub fn with_release<T, F>(value: T, release: F) -> Self
    where
        T: Any + Send + Sync,
        F: FnOnce(T) + Send + Sync + 'static,
    {
        Self {
            value: Some(Box::new(value)),
            release: Some(Box::new(move |boxed: Box<dyn Any + Send + Sync>| {
                if let Ok(value) = boxed.downcast::<T>() {
                    release(*value);
                }
            })),
        }
    }

    /// Borrow the value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|v| v.downcast_ref::<T>())
    }

    pub fn has_release(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let (Some(value), Some(release)) = (self.value.take(), self.release.take()) {
            release(value);
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("has_release", &self.has_release())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_release_runs_once_on_drop() {
        let released = Arc::new(AtomicU32::new(0));
        let seen = released.clone();
        let payload = Payload::with_release(42u32, move |v| {
            assert_eq!(v, 42);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(payload.downcast_ref::<u32>(), Some(&42));
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(payload);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrong_type_downcast() {
        let payload = Payload::new(7u64);
        assert!(payload.downcast_ref::<u32>().is_none());
        assert!(!payload.has_release());
    }
}
