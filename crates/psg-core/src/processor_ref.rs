//! A detachable shared reference for callbacks that may outlive a processor.
//!
//! Background threads hold an `Arc<ProcessorRef<T>>` instead of the
//! processor itself. When the request is torn down the owner calls
//! [`ProcessorRef::detach`]; any callback arriving later finds the box empty
//! and does nothing.
//!
//! The lock is reentrant so a callback running under [`ProcessorRef::with`]
//! may itself detach the reference.

use parking_lot::ReentrantMutex;
use std::{cell::RefCell, sync::Arc};

pub struct ProcessorRef<T> {
    target: ReentrantMutex<RefCell<Option<Arc<T>>>>,
}

impl<T> ProcessorRef<T> {
    pub fn new(target: Arc<T>) -> Arc<Self> {
        Arc::new(Self {
            target: ReentrantMutex::new(RefCell::new(Some(target))),
        })
    }

    /// Runs `f` against the target if it is still attached.
    ///
    /// `detach` from another thread waits until `f` returns.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.target.lock();
        let target = guard.borrow().clone()?;
        Some(f(&target))
    }

    pub fn detach(&self) {
        let guard = self.target.lock();
        guard.borrow_mut().take();
    }

    pub fn is_attached(&self) -> bool {
        self.target.lock().borrow().is_some()
    }
}
