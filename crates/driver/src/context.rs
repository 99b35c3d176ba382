//! Execution-context identity
//!
//! The native imaging layer binds itself to the identity of the thread that
//! first calls it and rejects calls from anywhere else. This module models
//! that binding explicitly: a worker thread installs a [`ContextId`] with a
//! [`ContextGuard`] when it starts, and drivers read it back with
//! [`current`] to enforce affinity.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Identity of a dedicated execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Context identity installed on the calling thread, if any
pub fn current() -> Option<ContextId> {
    CURRENT.with(Cell::get)
}

/// Installs a fresh context identity on the current thread
///
/// The previous identity (normally none) is restored on drop. The guard is
/// deliberately `!Send`: an identity belongs to the thread that created it.
pub struct ContextGuard {
    id: ContextId,
    previous: Option<ContextId>,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ContextGuard {
    pub fn enter() -> Self {
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        let previous = CURRENT.with(|c| c.replace(Some(id)));
        Self {
            id,
            previous,
            _not_send: std::marker::PhantomData,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}
