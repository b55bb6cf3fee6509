//! Domain Event Notification Library
//!
//! Lets an application subscribe to hypervisor domain events (lifecycle
//! transitions, reboots, watchdog firings, I/O errors, ...) on a connection
//! and have them delivered to its own callbacks.
//!
//! # Architecture
//!
//! - A connection driver emits raw events through a plain function pointer,
//!   the trampoline, tagged with the registration id
//! - Each connection keeps a registry mapping ids to callback contexts; the
//!   trampoline resolves the tag and calls the user callback with its state
//! - Delivery happens on whichever thread pumps the event loop, either the
//!   bundled poll loop or a caller-supplied [`EventImpl`]
//!
//! The library does NOT:
//! - Start a background thread for the event loop
//! - Persist registrations across connections or processes
//! - Talk to a real hypervisor; only the in-memory `test://` driver ships
//!
//! # Example Usage
//!
//! ```no_run
//! use virt_events::{
//!     event_register_default_impl, event_run_default_impl, Connection, DomainEventId,
//! };
//!
//! event_register_default_impl().unwrap();
//! let conn = Connection::open("test:///default").unwrap();
//!
//! let id = conn
//!     .domain_event_register(
//!         None,
//!         DomainEventId::Lifecycle,
//!         |_conn, dom, event, _state: &(), ack| {
//!             println!("{}: {:?}", dom.name(), event);
//!             ack.done();
//!         },
//!         (),
//!     )
//!     .unwrap();
//!
//! conn.domain_create("scratch").unwrap();
//! event_run_default_impl().unwrap();
//!
//! conn.domain_event_deregister(id).unwrap();
//! ```

pub mod callbacks;
pub mod connect;
pub mod domain;
pub mod drivers;
pub mod event_loop;
pub mod events;
pub mod types;

// Re-export main types for convenience
pub use callbacks::{CallbackContext, CallbackRegistry};
pub use connect::{Connection, Driver, RawEventCallback, WeakConnection};
pub use domain::{Domain, DomainOp, DomainRef, DomainState};
pub use drivers::{TestDriver, WatchOp};
pub use event_loop::{
    event_register_default_impl, event_register_impl, event_run_default_impl, DefaultEventLoop,
    EventImpl, HandleEvents,
};
pub use events::{
    AckStatus, DomainEvent, DomainEventId, DomainEventType, DomainLifecycleEvent, EventAck,
    IoErrorAction, RawDomainEvent, WatchdogAction,
};
pub use types::{
    CallbackId, ErrorCode, ErrorDomain, HandleWatchId, NativeError, Result, TimerId, VirtError,
    WatchHandle,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
