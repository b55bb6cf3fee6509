//! In-memory `test://` driver
//!
//! Simulates a hypervisor with a handful of domains. State transitions queue
//! the lifecycle events a real hypervisor would emit; queued events are
//! flushed through the trampoline from a zero-interval timer on the
//! connection's event loop, one event at a time.

use crate::connect::{Driver, RawEventCallback, WeakConnection};
use crate::domain::{reason, Domain, DomainOp, DomainRef, DomainState};
use crate::event_loop::EventImpl;
use crate::events::{detail, DomainEvent, DomainEventId, DomainEventType, EventAck, RawDomainEvent};
use crate::types::{
    CallbackId, ErrorCode, ErrorDomain, NativeError, NativeResult, Result, TimerId, WatchHandle,
};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_DOMAIN_NAME: &str = "test";
const DEFAULT_DOMAIN_UUID: Uuid = Uuid::from_u128(0x6695eb01_f6a4_8304_79aa_97f2502e193f);

const CAPABILITIES: &str = "<capabilities>\
<host><cpu><arch>x86_64</arch></cpu></host>\
<guest><os_type>hvm</os_type><arch name='x86_64'><domain type='test'/></arch></guest>\
</capabilities>";

/// Event kinds this driver cannot emit
const UNSUPPORTED_EVENTS: [DomainEventId; 2] = [DomainEventId::Graphics, DomainEventId::BlockJob];

/// Watch operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOp {
    Open,
    Close,
}

struct TestDomain {
    uuid: Uuid,
    name: String,
    id: Option<u32>,
    state: DomainState,
    reason: i32,
    autostart: bool,
}

impl TestDomain {
    fn to_ref(&self) -> DomainRef {
        DomainRef {
            uuid: self.uuid,
            name: self.name.clone(),
        }
    }

    fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

#[derive(Default)]
struct DomainTable {
    domains: Vec<TestDomain>,
    next_id: u32,
}

impl DomainTable {
    fn get_mut(&mut self, uuid: Uuid) -> NativeResult<&mut TestDomain> {
        self.domains
            .iter_mut()
            .find(|d| d.uuid == uuid)
            .ok_or_else(|| no_domain(format!("no domain with matching uuid '{}'", uuid)))
    }
}

struct Watch {
    domain: Option<Uuid>,
    event_id: DomainEventId,
    tag: CallbackId,
    callback: RawEventCallback,
}

struct QueuedEvent {
    domain: DomainRef,
    raw: RawDomainEvent,
}

#[derive(Default)]
struct EventQueue {
    watches: BTreeMap<WatchHandle, Watch>,
    pending: VecDeque<QueuedEvent>,
    timer: Option<TimerId>,
    next_watch: u32,
}

#[derive(Default)]
struct Faults {
    open_watch: bool,
    close_watch: bool,
}

/// Driver behind `test:///default` and `test:///empty` connections
pub struct TestDriver {
    domains: Mutex<DomainTable>,
    queue: Arc<Mutex<EventQueue>>,
    events: Option<Arc<dyn EventImpl>>,
    conn: OnceLock<WeakConnection>,
    faults: Mutex<Faults>,
}

impl TestDriver {
    /// A driver with no domains
    pub(crate) fn empty(events: Option<Arc<dyn EventImpl>>) -> Self {
        Self {
            domains: Mutex::new(DomainTable {
                domains: Vec::new(),
                next_id: 1,
            }),
            queue: Arc::new(Mutex::new(EventQueue::default())),
            events,
            conn: OnceLock::new(),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// A driver with one running domain named "test" with id 1
    pub(crate) fn with_default_domain(events: Option<Arc<dyn EventImpl>>) -> Self {
        let driver = Self::empty(events);
        {
            let mut table = driver.domains.lock();
            table.domains.push(TestDomain {
                uuid: DEFAULT_DOMAIN_UUID,
                name: DEFAULT_DOMAIN_NAME.to_string(),
                id: Some(1),
                state: DomainState::Running,
                reason: reason::running::BOOTED,
                autostart: false,
            });
            table.next_id = 2;
        }
        driver
    }

    /// Make the next `op` on a watch fail with an operation-failed error
    pub fn fail_next(&self, op: WatchOp) {
        let mut faults = self.faults.lock();
        match op {
            WatchOp::Open => faults.open_watch = true,
            WatchOp::Close => faults.close_watch = true,
        }
    }

    /// Queue an arbitrary event on `dom`, as if the hypervisor emitted it
    pub fn inject_event(&self, dom: &Domain, event: &DomainEvent) -> Result<()> {
        self.inject_raw(dom, event.to_raw())
    }

    /// Queue a raw payload on `dom` without checking that it decodes
    pub fn inject_raw(&self, dom: &Domain, raw: RawDomainEvent) -> Result<()> {
        let domain = self.lookup_domain_by_uuid(dom.uuid())?;
        self.queue_event(domain, raw);
        Ok(())
    }

    /// Number of events waiting to be flushed
    pub fn pending_events(&self) -> usize {
        self.queue.lock().pending.len()
    }

    /// Number of open watches
    pub fn watch_count(&self) -> usize {
        self.queue.lock().watches.len()
    }

    fn take_fault(&self, op: WatchOp) -> NativeResult<()> {
        let mut faults = self.faults.lock();
        let flag = match op {
            WatchOp::Open => &mut faults.open_watch,
            WatchOp::Close => &mut faults.close_watch,
        };
        if std::mem::take(flag) {
            return Err(NativeError::new(
                ErrorCode::OperationFailed,
                ErrorDomain::Test,
                format!("injected {:?} watch failure", op),
            ));
        }
        Ok(())
    }

    /// Queue an event and arm the flush timer. Dropped if nobody watches.
    fn queue_event(&self, domain: DomainRef, raw: RawDomainEvent) {
        let mut queue = self.queue.lock();
        if queue.watches.is_empty() {
            return;
        }
        log::trace!("Queueing event {} for domain '{}'", raw.event_id, domain.name);
        queue.pending.push_back(QueuedEvent { domain, raw });
        if let (Some(timer), Some(events)) = (queue.timer, &self.events) {
            events.update_timeout(timer, Some(Duration::ZERO));
        }
    }

    fn queue_lifecycle(&self, domain: DomainRef, event: DomainEventType, detail: i32) {
        self.queue_event(domain, DomainEvent::lifecycle(event, detail).to_raw());
    }

    /// Apply a state transition, returning the events it produces
    fn transition(
        &self,
        uuid: Uuid,
        op: DomainOp,
    ) -> NativeResult<(DomainRef, Vec<RawDomainEvent>)> {
        let mut table = self.domains.lock();
        let next_id = table.next_id;
        let dom = table.get_mut(uuid)?;

        let mut events = Vec::new();
        let lifecycle = |event, detail| DomainEvent::lifecycle(event, detail).to_raw();
        let mut assigned_id = false;

        match op {
            DomainOp::Create => {
                if dom.is_active() {
                    return Err(invalid("domain is already running"));
                }
                dom.id = Some(next_id);
                assigned_id = true;
                dom.state = DomainState::Running;
                dom.reason = reason::running::BOOTED;
                events.push(lifecycle(DomainEventType::Started, detail::started::BOOTED));
            }
            DomainOp::Destroy => {
                require_active(dom)?;
                dom.id = None;
                dom.state = DomainState::Shutoff;
                dom.reason = reason::shutoff::DESTROYED;
                events.push(lifecycle(DomainEventType::Stopped, detail::stopped::DESTROYED));
            }
            DomainOp::Shutdown => {
                require_active(dom)?;
                dom.id = None;
                dom.state = DomainState::Shutoff;
                dom.reason = reason::shutoff::SHUTDOWN;
                events.push(lifecycle(DomainEventType::Shutdown, detail::shutdown::FINISHED));
                events.push(lifecycle(DomainEventType::Stopped, detail::stopped::SHUTDOWN));
            }
            DomainOp::Reboot => {
                require_active(dom)?;
                events.push(DomainEvent::Reboot.to_raw());
            }
            DomainOp::Suspend => {
                if dom.state != DomainState::Running {
                    return Err(invalid("domain is not running"));
                }
                dom.state = DomainState::Paused;
                dom.reason = reason::paused::USER;
                events.push(lifecycle(DomainEventType::Suspended, detail::suspended::PAUSED));
            }
            DomainOp::Resume => {
                if dom.state != DomainState::Paused {
                    return Err(invalid("domain is not paused"));
                }
                dom.state = DomainState::Running;
                dom.reason = reason::running::UNPAUSED;
                events.push(lifecycle(DomainEventType::Resumed, detail::resumed::UNPAUSED));
            }
            DomainOp::Undefine => {
                if dom.is_active() {
                    return Err(invalid("cannot undefine a running domain"));
                }
                events.push(lifecycle(DomainEventType::Undefined, detail::undefined::REMOVED));
            }
        }

        let domain = dom.to_ref();
        if assigned_id {
            table.next_id += 1;
        }
        if op == DomainOp::Undefine {
            table.domains.retain(|d| d.uuid != uuid);
        }
        Ok((domain, events))
    }
}

impl Driver for TestDriver {
    fn name(&self) -> &'static str {
        "test"
    }

    fn attach(&self, conn: WeakConnection) {
        let _ = self.conn.set(conn);
    }

    fn close(&self) -> NativeResult<()> {
        let timer = {
            let mut queue = self.queue.lock();
            queue.watches.clear();
            queue.pending.clear();
            queue.timer.take()
        };
        if let (Some(timer), Some(events)) = (timer, &self.events) {
            events.remove_timeout(timer)?;
        }
        Ok(())
    }

    fn hostname(&self) -> NativeResult<String> {
        Ok("localhost".to_string())
    }

    fn capabilities(&self) -> NativeResult<String> {
        Ok(CAPABILITIES.to_string())
    }

    fn list_domains(&self) -> NativeResult<Vec<u32>> {
        let mut ids: Vec<u32> = self.domains.lock().domains.iter().filter_map(|d| d.id).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn list_defined_domains(&self) -> NativeResult<Vec<String>> {
        Ok(self
            .domains
            .lock()
            .domains
            .iter()
            .filter(|d| !d.is_active())
            .map(|d| d.name.clone())
            .collect())
    }

    fn lookup_domain_by_id(&self, id: u32) -> NativeResult<DomainRef> {
        self.domains
            .lock()
            .domains
            .iter()
            .find(|d| d.id == Some(id))
            .map(TestDomain::to_ref)
            .ok_or_else(|| no_domain(format!("no domain with matching id {}", id)))
    }

    fn lookup_domain_by_name(&self, name: &str) -> NativeResult<DomainRef> {
        self.domains
            .lock()
            .domains
            .iter()
            .find(|d| d.name == name)
            .map(TestDomain::to_ref)
            .ok_or_else(|| no_domain(format!("no domain with matching name '{}'", name)))
    }

    fn lookup_domain_by_uuid(&self, uuid: Uuid) -> NativeResult<DomainRef> {
        self.domains
            .lock()
            .domains
            .iter()
            .find(|d| d.uuid == uuid)
            .map(TestDomain::to_ref)
            .ok_or_else(|| no_domain(format!("no domain with matching uuid '{}'", uuid)))
    }

    fn define_domain(&self, name: &str) -> NativeResult<DomainRef> {
        if name.is_empty() {
            return Err(NativeError::new(
                ErrorCode::InvalidArg,
                ErrorDomain::Test,
                "domain name must not be empty",
            ));
        }
        let (domain, detail_code) = {
            let mut table = self.domains.lock();
            match table.domains.iter().find(|d| d.name == name) {
                Some(existing) => (existing.to_ref(), detail::defined::UPDATED),
                None => {
                    let dom = TestDomain {
                        uuid: Uuid::new_v4(),
                        name: name.to_string(),
                        id: None,
                        state: DomainState::Shutoff,
                        reason: 0,
                        autostart: false,
                    };
                    let domain = dom.to_ref();
                    table.domains.push(dom);
                    (domain, detail::defined::ADDED)
                }
            }
        };
        self.queue_lifecycle(domain.clone(), DomainEventType::Defined, detail_code);
        Ok(domain)
    }

    fn domain_op(&self, uuid: Uuid, op: DomainOp) -> NativeResult<()> {
        let (domain, events) = self.transition(uuid, op)?;
        for raw in events {
            self.queue_event(domain.clone(), raw);
        }
        Ok(())
    }

    fn domain_state(&self, uuid: Uuid) -> NativeResult<(DomainState, i32)> {
        let mut table = self.domains.lock();
        let dom = table.get_mut(uuid)?;
        Ok((dom.state, dom.reason))
    }

    fn domain_id(&self, uuid: Uuid) -> NativeResult<Option<u32>> {
        Ok(self.domains.lock().get_mut(uuid)?.id)
    }

    fn domain_autostart(&self, uuid: Uuid) -> NativeResult<bool> {
        Ok(self.domains.lock().get_mut(uuid)?.autostart)
    }

    fn set_domain_autostart(&self, uuid: Uuid, autostart: bool) -> NativeResult<()> {
        self.domains.lock().get_mut(uuid)?.autostart = autostart;
        Ok(())
    }

    fn open_watch(
        &self,
        domain: Option<Uuid>,
        event_id: DomainEventId,
        tag: CallbackId,
        callback: RawEventCallback,
    ) -> NativeResult<WatchHandle> {
        self.take_fault(WatchOp::Open)?;
        if UNSUPPORTED_EVENTS.contains(&event_id) {
            return Err(NativeError::new(
                ErrorCode::NoSupport,
                ErrorDomain::Test,
                format!("{} events are not supported by the test driver", event_id),
            ));
        }
        if let Some(uuid) = domain {
            self.lookup_domain_by_uuid(uuid)?;
        }
        let events = self.events.as_ref().ok_or_else(|| {
            NativeError::new(
                ErrorCode::OperationFailed,
                ErrorDomain::Event,
                "could not initialize domain event timer: no event loop registered",
            )
        })?;
        let conn = self.conn.get().cloned().ok_or_else(|| {
            NativeError::new(ErrorCode::InternalError, ErrorDomain::Test, "driver not attached")
        })?;

        let mut queue = self.queue.lock();
        if queue.timer.is_none() {
            let flush_queue = self.queue.clone();
            let flush_events = events.clone();
            let timer = events.add_timeout(
                None,
                Box::new(move |timer| flush(&flush_queue, flush_events.as_ref(), &conn, timer)),
            )?;
            queue.timer = Some(timer);
        }

        let handle = WatchHandle(queue.next_watch);
        queue.next_watch += 1;
        queue.watches.insert(
            handle,
            Watch {
                domain,
                event_id,
                tag,
                callback,
            },
        );
        log::debug!("Opened {} watch {:?} tagged {}", event_id, handle, tag);
        Ok(handle)
    }

    fn close_watch(&self, watch: WatchHandle) -> NativeResult<()> {
        self.take_fault(WatchOp::Close)?;
        let timer = {
            let mut queue = self.queue.lock();
            if queue.watches.remove(&watch).is_none() {
                return Err(NativeError::new(
                    ErrorCode::InvalidArg,
                    ErrorDomain::Test,
                    format!("callback watch {} not found", watch.0),
                ));
            }
            log::debug!("Closed watch {:?}", watch);
            if !queue.watches.is_empty() {
                return Ok(());
            }
            // Last watch gone: nothing left to deliver to.
            queue.pending.clear();
            queue.timer.take()
        };
        if let (Some(timer), Some(events)) = (timer, &self.events) {
            events.remove_timeout(timer)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Timer callback: deliver queued events one at a time.
///
/// Stops early, leaving the rest queued, when a callback does not acknowledge
/// its event; the next queued event re-arms the timer.
fn flush(queue: &Mutex<EventQueue>, events: &dyn EventImpl, conn: &WeakConnection, timer: TimerId) {
    let Some(conn) = conn.upgrade() else {
        events.update_timeout(timer, None);
        return;
    };

    loop {
        let (event, targets) = {
            let mut queue = queue.lock();
            let Some(event) = queue.pending.pop_front() else {
                events.update_timeout(timer, None);
                return;
            };
            let targets: Vec<(CallbackId, RawEventCallback)> = queue
                .watches
                .values()
                .filter(|w| {
                    w.event_id.as_raw() == event.raw.event_id
                        && w.domain.map_or(true, |d| d == event.domain.uuid)
                })
                .map(|w| (w.tag, w.callback))
                .collect();
            (event, targets)
        };

        let domain = conn.domain_from_ref(event.domain);
        let mut stalled = false;
        for (tag, callback) in targets {
            let (ack, status) = EventAck::pair();
            callback(&conn, &domain, &event.raw, tag, ack);
            stalled |= !status.is_acknowledged();
        }

        if stalled {
            let queue = queue.lock();
            log::warn!(
                "Event {} on '{}' was not acknowledged; holding {} queued events",
                event.raw.event_id,
                domain.name(),
                queue.pending.len()
            );
            events.update_timeout(timer, None);
            return;
        }
    }
}

fn require_active(dom: &TestDomain) -> NativeResult<()> {
    if dom.is_active() {
        Ok(())
    } else {
        Err(invalid("domain is not running"))
    }
}

fn invalid(message: &str) -> NativeError {
    NativeError::new(ErrorCode::OperationInvalid, ErrorDomain::Domain, message)
}

fn no_domain(message: String) -> NativeError {
    NativeError::new(ErrorCode::NoDomain, ErrorDomain::Test, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::Connection;
    use crate::event_loop::DefaultEventLoop;

    fn open() -> (Arc<DefaultEventLoop>, Connection) {
        let event_loop = Arc::new(DefaultEventLoop::new().unwrap());
        let conn = Connection::open_with_event_loop("test:///default", event_loop.clone()).unwrap();
        (event_loop, conn)
    }

    fn ack_only(_: &Connection, _: &Domain, _: &DomainEvent, _: &(), ack: EventAck) {
        ack.done();
    }

    #[test]
    fn test_empty_uri_has_no_domains() {
        let event_loop = Arc::new(DefaultEventLoop::new().unwrap());
        let conn = Connection::open_with_event_loop("test:///empty", event_loop).unwrap();
        assert!(conn.list_domains().unwrap().is_empty());
        assert!(conn.lookup_domain_by_name("test").is_err());
    }

    #[test]
    fn test_events_dropped_without_watches() {
        let (_event_loop, conn) = open();
        let dom = conn.lookup_domain_by_name("test").unwrap();
        dom.suspend().unwrap();
        assert_eq!(conn.test_driver().unwrap().pending_events(), 0);
    }

    #[test]
    fn test_flush_timer_lifecycle() {
        let (event_loop, conn) = open();
        let driver = conn.test_driver().unwrap();
        assert_eq!(event_loop.timeout_count(), 0);

        let a = conn
            .domain_event_register(None, DomainEventId::Lifecycle, ack_only, ())
            .unwrap();
        let b = conn
            .domain_event_register(None, DomainEventId::Reboot, ack_only, ())
            .unwrap();
        assert_eq!(event_loop.timeout_count(), 1);
        assert_eq!(driver.watch_count(), 2);

        conn.domain_event_deregister(a).unwrap();
        assert_eq!(event_loop.timeout_count(), 1);
        conn.domain_event_deregister(b).unwrap();
        assert_eq!(event_loop.timeout_count(), 0);
        assert_eq!(driver.watch_count(), 0);
    }

    #[test]
    fn test_shutdown_emits_two_lifecycle_events() {
        let (event_loop, conn) = open();
        let seen = Arc::new(Mutex::new(Vec::new()));
        conn.domain_event_register(
            None,
            DomainEventId::Lifecycle,
            |_: &Connection, _: &Domain, event: &DomainEvent, seen: &Arc<Mutex<Vec<DomainEventType>>>, ack: EventAck| {
                if let Some(lifecycle) = event.as_lifecycle() {
                    seen.lock().push(lifecycle.event);
                }
                ack.done();
            },
            seen.clone(),
        )
        .unwrap();

        conn.lookup_domain_by_name("test").unwrap().shutdown().unwrap();
        event_loop.run_once().unwrap();

        assert_eq!(*seen.lock(), vec![DomainEventType::Shutdown, DomainEventType::Stopped]);
    }

    #[test]
    fn test_injected_open_failure() {
        let (_event_loop, conn) = open();
        conn.test_driver().unwrap().fail_next(WatchOp::Open);
        assert!(conn
            .domain_event_register(None, DomainEventId::Lifecycle, ack_only, ())
            .is_err());
        assert!(conn.callbacks().is_empty());

        // The fault is one-shot.
        assert!(conn
            .domain_event_register(None, DomainEventId::Lifecycle, ack_only, ())
            .is_ok());
    }

    #[test]
    fn test_define_existing_name_updates() {
        let (_event_loop, conn) = open();
        let first = conn.domain_define("web").unwrap();
        let second = conn.domain_define("web").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_undefine_removes_domain() {
        let (_event_loop, conn) = open();
        let dom = conn.domain_define("scratch").unwrap();
        dom.undefine().unwrap();
        assert!(conn.lookup_domain_by_name("scratch").is_err());
    }

    #[test]
    fn test_close_removes_timer() {
        let (event_loop, conn) = open();
        conn.domain_event_register(None, DomainEventId::Lifecycle, ack_only, ())
            .unwrap();
        assert_eq!(event_loop.timeout_count(), 1);

        conn.close().unwrap();
        assert_eq!(event_loop.timeout_count(), 0);
    }
}
