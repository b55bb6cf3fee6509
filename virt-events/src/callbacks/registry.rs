//! Callback registry
//!
//! The connection driver only carries an integer tag per watch. This table
//! maps that tag back to the callback, its filters and its caller state for as
//! long as the watch exists.

use crate::connect::Connection;
use crate::domain::Domain;
use crate::events::{DomainEvent, DomainEventId, EventAck};
use crate::types::{CallbackId, WatchHandle};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Type-erased callback: the caller's function with its state bound in
pub(crate) type ErasedCallback = Box<dyn Fn(&Connection, &Domain, &DomainEvent, EventAck) + Send + Sync>;

/// Everything needed to deliver events for one registration
pub struct CallbackContext {
    event_id: DomainEventId,
    /// Restrict delivery to one domain; `None` accepts all
    domain: Option<Uuid>,
    callback: ErasedCallback,
    /// Set once the driver accepted the watch
    watch: OnceLock<WatchHandle>,
}

impl CallbackContext {
    pub(crate) fn new(event_id: DomainEventId, domain: Option<Uuid>, callback: ErasedCallback) -> Self {
        Self {
            event_id,
            domain,
            callback,
            watch: OnceLock::new(),
        }
    }

    pub fn event_id(&self) -> DomainEventId {
        self.event_id
    }

    pub fn domain_filter(&self) -> Option<Uuid> {
        self.domain
    }

    /// Driver watch backing this registration, once established
    pub fn watch(&self) -> Option<WatchHandle> {
        self.watch.get().copied()
    }

    pub(crate) fn attach_watch(&self, watch: WatchHandle) {
        let _ = self.watch.set(watch);
    }

    /// Whether an event of `event_id` on `domain` passes this context's filters
    pub fn accepts(&self, event_id: DomainEventId, domain: Uuid) -> bool {
        self.event_id == event_id && self.domain.map_or(true, |d| d == domain)
    }

    pub(crate) fn invoke(&self, conn: &Connection, dom: &Domain, event: &DomainEvent, ack: EventAck) {
        (self.callback)(conn, dom, event, ack)
    }
}

impl fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackContext")
            .field("event_id", &self.event_id)
            .field("domain", &self.domain)
            .field("watch", &self.watch())
            .finish_non_exhaustive()
    }
}

/// Thread-safe table of active registrations.
///
/// Identifiers come from a 64-bit counter and are never handed out twice.
/// Lookups return a shared reference to the context, so a dispatch that
/// already resolved its context completes even if the entry is removed
/// meanwhile, while any later lookup misses.
pub struct CallbackRegistry {
    entries: RwLock<HashMap<CallbackId, Arc<CallbackContext>>>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocate a fresh identifier and insert the context under it
    pub(crate) fn insert(&self, context: CallbackContext) -> (CallbackId, Arc<CallbackContext>) {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let context = Arc::new(context);
        self.entries.write().insert(id, context.clone());
        (id, context)
    }

    pub(crate) fn remove(&self, id: CallbackId) -> Option<Arc<CallbackContext>> {
        self.entries.write().remove(&id)
    }

    /// Resolve a registration identifier
    pub fn lookup(&self, id: CallbackId) -> Option<Arc<CallbackContext>> {
        self.entries.read().get(&id).cloned()
    }

    /// Number of active registrations.
    ///
    /// A context still waiting for its driver watch is not active yet.
    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|c| c.watch().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers of all active registrations, ascending
    pub fn ids(&self) -> Vec<CallbackId> {
        let mut ids: Vec<_> = self
            .entries
            .read()
            .iter()
            .filter(|(_, c)| c.watch().is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Remove every entry, returning them
    pub(crate) fn drain(&self) -> Vec<(CallbackId, Arc<CallbackContext>)> {
        self.entries.write().drain().collect()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
