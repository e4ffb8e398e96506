//! Counted ownership references over releasable resources
//!
//! A [`CloseableRef`] is a shared handle to a value plus a release action.
//! Every clone bumps a shared atomic count; closing (or dropping) a handle
//! decrements it, and the release action runs exactly once, on the thread
//! that performs the final decrement. Closing a handle twice is a no-op.

use crate::error::{PipelineError, Result};
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// Release action run when the last handle to a value is closed
pub trait ResourceReleaser<T>: Send + Sync {
    fn release(&self, value: Arc<T>);
}

impl<T, F> ResourceReleaser<T> for F
where
    F: Fn(Arc<T>) + Send + Sync,
{
    fn release(&self, value: Arc<T>) {
        self(value)
    }
}

/// Shared state behind every clone of one reference.
///
/// The `Arc` strong count around this struct is the reference count.
struct SharedReference<T> {
    value: Option<Arc<T>>,
    releaser: Option<Box<dyn ResourceReleaser<T>>>,
}

impl<T> Drop for SharedReference<T> {
    fn drop(&mut self) {
        if let (Some(value), Some(releaser)) = (self.value.take(), self.releaser.take()) {
            releaser.release(value);
        }
    }
}

/// Shared, counted handle guaranteeing exactly-once release
pub struct CloseableRef<T> {
    shared: Option<Arc<SharedReference<T>>>,
}

impl<T: Send + Sync + 'static> CloseableRef<T> {
    /// Wrap a value whose release action is a plain drop
    pub fn of(value: T) -> Self {
        Self::with_releaser(value, |value: Arc<T>| drop(value))
    }

    /// Wrap a value with a custom release action
    pub fn with_releaser(value: T, releaser: impl ResourceReleaser<T> + 'static) -> Self {
        Self::from_arc(Arc::new(value), Box::new(releaser))
    }

    pub(crate) fn from_arc(value: Arc<T>, releaser: Box<dyn ResourceReleaser<T>>) -> Self {
        Self {
            shared: Some(Arc::new(SharedReference {
                value: Some(value),
                releaser: Some(releaser),
            })),
        }
    }

    /// Create an independent reference to the same value with its own
    /// count and release action.
    ///
    /// Used by the memory cache to hand out client references whose release
    /// updates cache bookkeeping instead of freeing the value.
    pub(crate) fn derive(&self, releaser: Box<dyn ResourceReleaser<T>>) -> Result<Self> {
        let value = self.value_arc()?;
        Ok(Self::from_arc(value, releaser))
    }

    fn value_arc(&self) -> Result<Arc<T>> {
        self.shared
            .as_ref()
            .and_then(|shared| shared.value.clone())
            .ok_or_else(|| use_after_release::<T>())
    }

    /// Clone the handle, failing if this handle was already released
    pub fn try_clone(&self) -> Result<Self> {
        match &self.shared {
            Some(shared) => Ok(Self {
                shared: Some(Arc::clone(shared)),
            }),
            None => Err(use_after_release::<T>()),
        }
    }

    /// Clone a handle if one is present and valid
    pub fn clone_or_none(reference: Option<&Self>) -> Option<Self> {
        reference.and_then(|r| r.try_clone().ok())
    }

    /// Release this handle; idempotent
    pub fn close(&mut self) {
        self.shared.take();
    }

    /// Release a handle if one is present
    pub fn close_safely(reference: Option<Self>) {
        if let Some(mut reference) = reference {
            reference.close();
        }
    }

    /// Whether this handle has not been released
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.shared.is_some()
    }

    /// Borrow the underlying value
    pub fn get(&self) -> Result<&T> {
        match self.shared.as_ref().and_then(|shared| shared.value.as_deref()) {
            Some(value) => Ok(value),
            None => {
                let err = use_after_release::<T>();
                error!("{}", err);
                Err(err)
            }
        }
    }

    /// Number of live handles sharing this reference's count
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.shared.as_ref().map_or(0, Arc::strong_count)
    }

    /// Whether both handles point at the same underlying value
    #[must_use]
    pub fn shares_value_with(&self, other: &Self) -> bool {
        match (self.value_arc(), other.value_arc()) {
            (Ok(a), Ok(b)) => Arc::ptr_eq(&a, &b),
            _ => false,
        }
    }
}

fn use_after_release<T>() -> PipelineError {
    PipelineError::UseAfterRelease(std::any::type_name::<T>().to_string())
}

impl<T> Clone for CloseableRef<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for CloseableRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseableRef")
            .field("type", &std::any::type_name::<T>())
            .field("valid", &self.shared.is_some())
            .field(
                "ref_count",
                &self.shared.as_ref().map_or(0, Arc::strong_count),
            )
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
