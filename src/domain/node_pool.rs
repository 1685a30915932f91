//! Reference-counted node storage with at-most-once construction.
//!
//! [`NodePool`] maps node names to live [`NodeHandle`]s. The outer map is a
//! short-held [`std::sync::Mutex`] that is never locked across an `.await`;
//! each entry carries a [`tokio::sync::RwLock`] that the constructing caller
//! holds for writing while the node starts, so concurrent callers for the
//! same name wait on it instead of starting a second node.

use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use super::NodeHandle;
use crate::error::Error;
use crate::runtime::NodeRuntime;

/// Outcome of a construction; `None` while it is in flight or if it was
/// abandoned.
type Construction = Option<Result<Arc<NodeHandle>, Error>>;

#[derive(Debug)]
struct Slot {
    refs: usize,
    state: Arc<RwLock<Construction>>,
}

enum Claim {
    Construct(OwnedRwLockWriteGuard<Construction>),
    Wait(Arc<RwLock<Construction>>),
}

/// Registry of running nodes keyed by name.
///
/// # Concurrency
///
/// - `acquire` and `release` for one name are linearized by the map lock:
///   a handle is never returned once its last reference was released.
/// - Construction runs outside the map lock, so a slow start of one node
///   does not block other names.
/// - `for_each` visits a snapshot and never holds a lock while the visitor
///   runs.
/// - The last `release` removes the entry before the runtime is torn down.
///   An `acquire` arriving during that teardown constructs a fresh node for
///   the same name while the old one is still shutting down, so both may
///   briefly share a state directory.
#[derive(Debug, Default)]
pub struct NodePool {
    slots: Mutex<HashMap<String, Slot>>,
}

impl NodePool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node registered under `name`, constructing it with
    /// `construct` if there is none, and takes one reference on it.
    ///
    /// Only one `construct` runs per name at a time. Callers arriving while
    /// it runs wait and receive the same handle, or the same error. A
    /// failed construction leaves nothing behind; the next `acquire` starts
    /// over.
    ///
    /// # Errors
    ///
    /// Returns the construction error, or [`Error::Start`] if the caller
    /// that was constructing the node was cancelled.
    pub async fn acquire<F, Fut>(
        self: &Arc<Self>,
        name: &str,
        construct: F,
    ) -> Result<Arc<NodeHandle>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn NodeRuntime>, Error>>,
    {
        let state = Arc::new(RwLock::new(None));
        let guard = Arc::clone(&state).write_owned().await;

        let claim = {
            let mut slots = self.lock();
            if let Some(slot) = slots.get_mut(name) {
                slot.refs = slot.refs.saturating_add(1);
                tracing::trace!(node = name, refs = slot.refs, "node reference acquired");
                Claim::Wait(Arc::clone(&slot.state))
            } else {
                slots.insert(
                    name.to_string(),
                    Slot {
                        refs: 1,
                        state: Arc::clone(&state),
                    },
                );
                Claim::Construct(guard)
            }
        };

        let guard = match claim {
            Claim::Wait(existing) => {
                let waiter = Waiter {
                    pool: self,
                    name,
                    state: existing,
                    done: false,
                };
                return waiter.wait().await;
            }
            Claim::Construct(guard) => guard,
        };

        let pending = Pending {
            pool: self,
            name,
            state,
            guard: Some(guard),
        };

        let result = construct()
            .await
            .map(|runtime| Arc::new(NodeHandle::new(name.to_string(), runtime, Arc::downgrade(self))));
        match &result {
            Ok(_) => tracing::info!(node = name, "node started"),
            Err(err) => tracing::warn!(node = name, error = %err, "node failed to start"),
        }
        pending.finish(result)
    }

    /// Drops one reference on `name`. The last release removes the entry and
    /// tears the node down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotFound`] if `name` has no entry, or the
    /// teardown error. The entry is removed even when teardown fails.
    pub async fn release(&self, name: &str) -> Result<(), Error> {
        let state = {
            let mut slots = self.lock();
            let Some(slot) = slots.get_mut(name) else {
                return Err(Error::NodeNotFound(name.to_string()));
            };
            slot.refs = slot.refs.saturating_sub(1);
            tracing::trace!(node = name, refs = slot.refs, "node reference released");
            if slot.refs > 0 {
                return Ok(());
            }
            slots.remove(name).map(|slot| slot.state)
        };

        let Some(state) = state else {
            return Ok(());
        };
        let handle = match state.read().await.as_ref() {
            Some(Ok(handle)) => Arc::clone(handle),
            _ => return Ok(()),
        };

        let result = handle.teardown().await;
        match &result {
            Ok(()) => tracing::info!(node = name, "node shut down"),
            Err(err) => tracing::warn!(node = name, error = %err, "node shutdown failed"),
        }
        result
    }

    /// Constructed nodes at the time of the call. Nodes still starting are
    /// left out.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Arc<NodeHandle>)> {
        let slots = self.lock();
        slots
            .iter()
            .filter_map(|(name, slot)| {
                let state = slot.state.try_read().ok()?;
                match state.as_ref() {
                    Some(Ok(handle)) => Some((name.clone(), Arc::clone(handle))),
                    _ => None,
                }
            })
            .collect()
    }

    /// Calls `visit` for each constructed node until it breaks.
    ///
    /// Visits a [`Self::snapshot`]; a node released concurrently may still
    /// be visited.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &Arc<NodeHandle>) -> ControlFlow<()>,
    {
        for (name, handle) in self.snapshot() {
            if visit(&name, &handle).is_break() {
                break;
            }
        }
    }

    /// Current reference count of `name`, if it has an entry.
    #[must_use]
    pub fn refs(&self, name: &str) -> Option<usize> {
        self.lock().get(name).map(|slot| slot.refs)
    }

    /// Returns `true` if `name` has an entry (constructed or starting).
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if the pool has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    async fn wait(name: &str, state: &RwLock<Construction>) -> Result<Arc<NodeHandle>, Error> {
        match state.read().await.as_ref() {
            Some(result) => result.clone(),
            None => Err(Error::Start {
                node: name.to_string(),
                reason: "construction was cancelled".to_string(),
            }),
        }
    }

    /// Gives back the reference of a waiter that was cancelled.
    fn forget(&self, name: &str, state: &Arc<RwLock<Construction>>) {
        let removed = {
            let mut slots = self.lock();
            let Some(slot) = slots
                .get_mut(name)
                .filter(|slot| Arc::ptr_eq(&slot.state, state))
            else {
                return;
            };
            slot.refs = slot.refs.saturating_sub(1);
            tracing::trace!(node = name, refs = slot.refs, "cancelled waiter released its reference");
            if slot.refs > 0 {
                return;
            }
            slots.remove(name)
        };

        let handle = removed.and_then(|slot| {
            let state = slot.state.try_read().ok()?;
            match state.as_ref() {
                Some(Ok(handle)) => Some(Arc::clone(handle)),
                _ => None,
            }
        });
        let Some(handle) = handle else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let name = name.to_string();
                runtime.spawn(async move {
                    if let Err(err) = handle.teardown().await {
                        tracing::warn!(node = %name, error = %err, "node shutdown failed");
                    }
                });
            }
            Err(_) => tracing::warn!(node = name, "no runtime to shut down node"),
        }
    }

    fn remove_if_current(&self, name: &str, state: &Arc<RwLock<Construction>>) {
        let mut slots = self.lock();
        if slots
            .get(name)
            .is_some_and(|slot| Arc::ptr_eq(&slot.state, state))
        {
            slots.remove(name);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A caller waiting on another caller's construction. Dropping it before
/// the result arrives gives its reference back.
struct Waiter<'a> {
    pool: &'a NodePool,
    name: &'a str,
    state: Arc<RwLock<Construction>>,
    done: bool,
}

impl Waiter<'_> {
    async fn wait(mut self) -> Result<Arc<NodeHandle>, Error> {
        let result = NodePool::wait(self.name, &self.state).await;
        self.done = true;
        result
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.pool.forget(self.name, &self.state);
        }
    }
}

/// An in-flight construction. Dropping it unfinished (the constructing
/// caller was cancelled) removes the entry so the next caller starts over.
struct Pending<'a> {
    pool: &'a NodePool,
    name: &'a str,
    state: Arc<RwLock<Construction>>,
    guard: Option<OwnedRwLockWriteGuard<Construction>>,
}

impl Pending<'_> {
    fn finish(mut self, result: Result<Arc<NodeHandle>, Error>) -> Result<Arc<NodeHandle>, Error> {
        if let Some(mut guard) = self.guard.take() {
            *guard = Some(result.clone());
            if result.is_err() {
                self.pool.remove_if_current(self.name, &self.state);
            }
        }
        result
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            tracing::warn!(node = self.name, "node construction abandoned");
            self.pool.remove_if_current(self.name, &self.state);
            drop(guard);
        }
    }
}
