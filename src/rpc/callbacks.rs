//! Standing broadcast callbacks keyed by instance identity.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// A repeatable callback for inbound messages of type `T`.
///
/// Cloning shares the same instance; two callbacks are equal only when they
/// are clones of one another, regardless of what the closures do.
pub struct Callback<T>(Arc<dyn Fn(&T) + Send + Sync>);

impl<T> Callback<T> {
    pub fn new(f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, message: &T) {
        (self.0)(message);
    }
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> PartialEq for Callback<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Eq for Callback<T> {}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

/// Thread-safe, ordered set of [`Callback`]s.
///
/// Broadcasts invoke a snapshot of the list in registration order, outside
/// the lock, so a callback may add or remove callbacks without deadlocking.
pub struct CallbackRegistry<T> {
    callbacks: Mutex<Vec<Callback<T>>>,
}

impl<T> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CallbackRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> CallbackRegistry<T> {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Registers `callback`. Returns `false` if this instance is already
    /// registered.
    pub fn add(&self, callback: &Callback<T>) -> bool {
        let mut callbacks = self.callbacks.lock();
        if callbacks.contains(callback) {
            return false;
        }
        callbacks.push(callback.clone());
        true
    }

    /// Unregisters `callback`. Returns `false` if it was not registered.
    pub fn remove(&self, callback: &Callback<T>) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|c| c != callback);
        callbacks.len() != before
    }

    /// Invokes every registered callback with `message`. Returns how many
    /// were invoked.
    pub fn broadcast(&self, message: &T) -> usize {
        let snapshot = self.callbacks.lock().clone();
        for callback in &snapshot {
            callback.call(message);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }
}
