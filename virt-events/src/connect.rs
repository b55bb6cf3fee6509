//! Hypervisor connections
//!
//! A [`Connection`] owns a driver (the native side) and the callback registry
//! for every event subscription made through it. Registration and
//! deregistration live here because they must keep the driver's watches and
//! the registry in lockstep.

use crate::callbacks::dispatch::domain_event_trampoline;
use crate::callbacks::registry::{CallbackContext, CallbackRegistry, ErasedCallback};
use crate::domain::{Domain, DomainOp, DomainRef, DomainState};
use crate::drivers::{self, TestDriver};
use crate::event_loop::{registered_impl, EventImpl};
use crate::events::{DomainEvent, DomainEventId, EventAck, RawDomainEvent};
use crate::types::{
    CallbackId, ErrorCode, ErrorDomain, NativeError, NativeResult, Result, VirtError, WatchHandle,
};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Native delivery entry point handed to [`Driver::open_watch`].
///
/// Receives the connection, a transient domain handle, the raw payload, the
/// tag the watch was opened with and the acknowledgment continuation. Returns
/// a status code; `0` is success.
pub type RawEventCallback = fn(&Connection, &Domain, &RawDomainEvent, CallbackId, EventAck) -> i32;

/// The connection layer: everything this crate consumes from a hypervisor.
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once right after the owning connection is created
    fn attach(&self, conn: WeakConnection);

    /// Release driver resources: watches, queued events, event loop timers
    fn close(&self) -> NativeResult<()>;

    fn hostname(&self) -> NativeResult<String>;
    fn capabilities(&self) -> NativeResult<String>;
    fn list_domains(&self) -> NativeResult<Vec<u32>>;
    fn list_defined_domains(&self) -> NativeResult<Vec<String>>;

    fn lookup_domain_by_id(&self, id: u32) -> NativeResult<DomainRef>;
    fn lookup_domain_by_name(&self, name: &str) -> NativeResult<DomainRef>;
    fn lookup_domain_by_uuid(&self, uuid: Uuid) -> NativeResult<DomainRef>;
    fn define_domain(&self, name: &str) -> NativeResult<DomainRef>;

    fn domain_op(&self, uuid: Uuid, op: DomainOp) -> NativeResult<()>;
    fn domain_state(&self, uuid: Uuid) -> NativeResult<(DomainState, i32)>;
    fn domain_id(&self, uuid: Uuid) -> NativeResult<Option<u32>>;
    fn domain_autostart(&self, uuid: Uuid) -> NativeResult<bool>;
    fn set_domain_autostart(&self, uuid: Uuid, autostart: bool) -> NativeResult<()>;

    /// Start delivering `event_id` events (optionally for one domain only) to
    /// `callback`, passing `tag` along with every delivery
    fn open_watch(
        &self,
        domain: Option<Uuid>,
        event_id: DomainEventId,
        tag: CallbackId,
        callback: RawEventCallback,
    ) -> NativeResult<WatchHandle>;

    /// Stop a watch; no delivery for it starts after this returns
    fn close_watch(&self, watch: WatchHandle) -> NativeResult<()>;

    fn as_any(&self) -> &dyn Any;
}

struct ConnectionInner {
    uri: String,
    driver: Box<dyn Driver>,
    callbacks: CallbackRegistry,
    /// Serializes registration, deregistration and shutdown
    teardown: Mutex<()>,
    closed: AtomicBool,
}

impl ConnectionInner {
    fn shutdown(&self) -> NativeResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _teardown = self.teardown.lock();
        for (id, context) in self.callbacks.drain() {
            if let Some(watch) = context.watch() {
                if let Err(e) = self.driver.close_watch(watch) {
                    log::warn!("Failed to close watch for callback {} on {}: {}", id, self.uri, e);
                }
            }
        }
        self.driver.close()?;
        log::info!("Closed connection to {}", self.uri);
        Ok(())
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("Error closing connection to {}: {}", self.uri, e);
        }
    }
}

/// An open session with a hypervisor. Cheap to clone; all clones share the
/// same session and callback registry.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Non-owning reference to a connection, held by drivers
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    /// Upgrade to a live connection; `None` once it was dropped or closed
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner
            .upgrade()
            .map(|inner| Connection { inner })
            .filter(Connection::is_alive)
    }
}

impl Connection {
    /// Open `uri` using the process-wide event implementation, if one is
    /// registered.
    ///
    /// Without an event implementation the connection works but refuses event
    /// registrations.
    pub fn open(uri: &str) -> Result<Self> {
        Self::open_inner(uri, registered_impl())
    }

    /// Open `uri` delivering events through `events` instead of the
    /// process-wide implementation
    pub fn open_with_event_loop(uri: &str, events: Arc<dyn EventImpl>) -> Result<Self> {
        Self::open_inner(uri, Some(events))
    }

    fn open_inner(uri: &str, events: Option<Arc<dyn EventImpl>>) -> Result<Self> {
        let driver = drivers::open(uri, events)?;
        let conn = Connection {
            inner: Arc::new(ConnectionInner {
                uri: uri.to_string(),
                driver,
                callbacks: CallbackRegistry::new(),
                teardown: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        };
        conn.inner.driver.attach(conn.downgrade());
        log::info!("Opened connection to {} ({} driver)", uri, conn.inner.driver.name());
        Ok(conn)
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the connection, tearing down every remaining registration.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        Ok(self.inner.shutdown()?)
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Registry of this connection's event subscriptions
    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.inner.callbacks
    }

    /// The in-memory test driver behind this connection, for `test://` URIs
    pub fn test_driver(&self) -> Option<&TestDriver> {
        self.inner.driver.as_any().downcast_ref::<TestDriver>()
    }

    pub(crate) fn driver(&self) -> NativeResult<&dyn Driver> {
        if !self.is_alive() {
            return Err(NativeError::new(
                ErrorCode::OperationInvalid,
                ErrorDomain::Connect,
                "connection is closed",
            ));
        }
        Ok(self.inner.driver.as_ref())
    }

    /// Subscribe `callback` to `event_id` events.
    ///
    /// With `domain` set, only that domain's events are delivered. `state` is
    /// handed to the callback on every invocation and dropped when the
    /// registration goes away. The callback must call [`EventAck::done`] on the
    /// acknowledgment it receives.
    ///
    /// On failure nothing stays registered. Serialized against deregistration
    /// and [`close`](Self::close), so a registration never outlives the
    /// connection it was made on.
    pub fn domain_event_register<S, F>(
        &self,
        domain: Option<&Domain>,
        event_id: DomainEventId,
        callback: F,
        state: S,
    ) -> Result<CallbackId>
    where
        S: Send + Sync + 'static,
        F: Fn(&Connection, &Domain, &DomainEvent, &S, EventAck) + Send + Sync + 'static,
    {
        let _teardown = self.inner.teardown.lock();
        let driver = self.driver()?;
        if let Some(dom) = domain {
            if !dom.connection().same_as(self) {
                return Err(VirtError::RegistrationFailure {
                    event_id,
                    source: NativeError::new(
                        ErrorCode::InvalidArg,
                        ErrorDomain::Connect,
                        format!("domain '{}' belongs to another connection", dom.name()),
                    ),
                });
            }
        }
        let filter = domain.map(Domain::uuid);

        let erased: ErasedCallback = Box::new(
            move |conn: &Connection, dom: &Domain, event: &DomainEvent, ack: EventAck| {
                callback(conn, dom, event, &state, ack)
            },
        );
        let (id, context) = self
            .inner
            .callbacks
            .insert(CallbackContext::new(event_id, filter, erased));

        match driver.open_watch(filter, event_id, id, domain_event_trampoline) {
            Ok(watch) => {
                context.attach_watch(watch);
                log::debug!(
                    "Registered {} callback {} (domain filter: {:?}, watch {:?})",
                    event_id,
                    id,
                    filter,
                    watch
                );
                Ok(id)
            }
            Err(source) => {
                self.inner.callbacks.remove(id);
                log::debug!("Driver refused {} watch: {}", event_id, source);
                Err(VirtError::RegistrationFailure { event_id, source })
            }
        }
    }

    /// Remove a subscription: the driver watch first, then the context.
    ///
    /// Unknown or already removed ids fail with
    /// [`VirtError::UnknownRegistration`]. If the driver fails to close the
    /// watch the registration stays in place so the call can be retried.
    pub fn domain_event_deregister(&self, id: CallbackId) -> Result<()> {
        let _teardown = self.inner.teardown.lock();
        let driver = self.driver()?;

        let context = self
            .inner
            .callbacks
            .lookup(id)
            .ok_or(VirtError::UnknownRegistration(id))?;
        let watch = context.watch().ok_or(VirtError::UnknownRegistration(id))?;

        driver.close_watch(watch)?;
        self.inner.callbacks.remove(id);
        log::debug!("Deregistered {} callback {}", context.event_id(), id);
        Ok(())
    }

    pub fn get_hostname(&self) -> Result<String> {
        Ok(self.driver()?.hostname()?)
    }

    pub fn get_capabilities(&self) -> Result<String> {
        Ok(self.driver()?.capabilities()?)
    }

    /// Ids of running domains
    pub fn list_domains(&self) -> Result<Vec<u32>> {
        Ok(self.driver()?.list_domains()?)
    }

    /// Names of defined but inactive domains
    pub fn list_defined_domains(&self) -> Result<Vec<String>> {
        Ok(self.driver()?.list_defined_domains()?)
    }

    pub fn lookup_domain_by_id(&self, id: u32) -> Result<Domain> {
        let domain = self.driver()?.lookup_domain_by_id(id)?;
        Ok(self.domain_from_ref(domain))
    }

    pub fn lookup_domain_by_name(&self, name: &str) -> Result<Domain> {
        let domain = self.driver()?.lookup_domain_by_name(name)?;
        Ok(self.domain_from_ref(domain))
    }

    pub fn lookup_domain_by_uuid(&self, uuid: Uuid) -> Result<Domain> {
        let domain = self.driver()?.lookup_domain_by_uuid(uuid)?;
        Ok(self.domain_from_ref(domain))
    }

    /// Define a persistent, inactive domain
    pub fn domain_define(&self, name: &str) -> Result<Domain> {
        let domain = self.driver()?.define_domain(name)?;
        Ok(self.domain_from_ref(domain))
    }

    /// Define a domain and start it
    pub fn domain_create(&self, name: &str) -> Result<Domain> {
        let domain = self.domain_define(name)?;
        domain.create()?;
        Ok(domain)
    }

    pub(crate) fn domain_from_ref(&self, domain: DomainRef) -> Domain {
        Domain::new(self.clone(), domain)
    }

    pub(crate) fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("uri", &self.inner.uri)
            .field("alive", &self.is_alive())
            .field("callbacks", &self.inner.callbacks.len())
            .finish()
    }
}
