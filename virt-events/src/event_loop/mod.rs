//! Event loop integration
//!
//! A connection asks its event implementation for wake-ups: descriptor
//! watches ("watch ready") and timers ("fire now" with a zero interval, "fire
//! at deadline" with a positive one). Callers either install the bundled
//! [`DefaultEventLoop`] process-wide and pump it with
//! [`event_run_default_impl`], or supply their own [`EventImpl`].

mod poll;

pub use poll::DefaultEventLoop;

use crate::types::{HandleWatchId, NativeResult, Result, TimerId, VirtError};
use parking_lot::Mutex;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Invoked when a watched descriptor becomes ready
pub type HandleCallback = Box<dyn FnMut(HandleWatchId, RawFd, HandleEvents) + Send>;

/// Invoked when a timer expires
pub type TimeoutCallback = Box<dyn FnMut(TimerId) + Send>;

/// Readiness conditions of a descriptor watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleEvents(u8);

impl HandleEvents {
    pub const READABLE: HandleEvents = HandleEvents(1 << 0);
    pub const WRITABLE: HandleEvents = HandleEvents(1 << 1);
    pub const ERROR: HandleEvents = HandleEvents(1 << 2);
    pub const HANGUP: HandleEvents = HandleEvents(1 << 3);

    pub const fn empty() -> Self {
        HandleEvents(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: HandleEvents) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HandleEvents {
    type Output = HandleEvents;

    fn bitor(self, rhs: HandleEvents) -> HandleEvents {
        HandleEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for HandleEvents {
    fn bitor_assign(&mut self, rhs: HandleEvents) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for HandleEvents {
    type Output = HandleEvents;

    fn bitand(self, rhs: HandleEvents) -> HandleEvents {
        HandleEvents(self.0 & rhs.0)
    }
}

/// Wake-up primitives a connection uses to get its events delivered.
///
/// Timer intervals: `None` disables the timer, `Some(Duration::ZERO)` fires on
/// every loop iteration, anything else fires periodically.
pub trait EventImpl: Send + Sync {
    /// Watch `fd` for `events`
    fn add_handle(
        &self,
        fd: RawFd,
        events: HandleEvents,
        callback: HandleCallback,
    ) -> NativeResult<HandleWatchId>;

    /// Change the conditions of a descriptor watch; empty disables it
    fn update_handle(&self, watch: HandleWatchId, events: HandleEvents);

    fn remove_handle(&self, watch: HandleWatchId) -> NativeResult<()>;

    /// Register a timer
    fn add_timeout(
        &self,
        interval: Option<Duration>,
        callback: TimeoutCallback,
    ) -> NativeResult<TimerId>;

    /// Re-arm or disable a timer
    fn update_timeout(&self, timer: TimerId, interval: Option<Duration>);

    fn remove_timeout(&self, timer: TimerId) -> NativeResult<()>;
}

static EVENT_IMPL: OnceLock<Arc<dyn EventImpl>> = OnceLock::new();
/// Set only once `EVENT_IMPL` holds this very loop
static DEFAULT_LOOP: OnceLock<Arc<DefaultEventLoop>> = OnceLock::new();
/// Serializes installs so the two statics change together
static INSTALL: Mutex<()> = parking_lot::const_mutex(());

/// Install a caller-supplied event implementation for the whole process.
///
/// Only connections opened afterwards use it. Fails if any implementation,
/// including the default one, is already installed.
pub fn event_register_impl(event_impl: Arc<dyn EventImpl>) -> Result<()> {
    let _install = INSTALL.lock();
    EVENT_IMPL
        .set(event_impl)
        .map_err(|_| VirtError::EventLoop("an event implementation is already registered".to_string()))?;
    log::debug!("Registered custom event implementation");
    Ok(())
}

/// Install the bundled poll loop as the process-wide event implementation.
///
/// Must run before opening connections that should deliver events. Repeated
/// calls are no-ops; it fails only if a custom implementation got there first,
/// in which case nothing is installed.
pub fn event_register_default_impl() -> Result<()> {
    let _install = INSTALL.lock();
    if DEFAULT_LOOP.get().is_some() {
        return Ok(());
    }
    if EVENT_IMPL.get().is_some() {
        return Err(VirtError::EventLoop(
            "a custom event implementation is already registered".to_string(),
        ));
    }

    let event_loop = Arc::new(DefaultEventLoop::new()?);
    EVENT_IMPL
        .set(Arc::clone(&event_loop) as Arc<dyn EventImpl>)
        .map_err(|_| VirtError::EventLoop("an event implementation is already registered".to_string()))?;
    let _ = DEFAULT_LOOP.set(event_loop);
    log::debug!("Default event loop registered");
    Ok(())
}

/// Run one iteration of the default event loop.
///
/// Blocks until at least one timer or descriptor watch is ready, services every
/// ready watch, then returns. Call it repeatedly to keep events flowing.
pub fn event_run_default_impl() -> Result<()> {
    default_loop()?.run_once()
}

/// Event implementation installed for this process, if any
pub fn registered_impl() -> Option<Arc<dyn EventImpl>> {
    EVENT_IMPL.get().cloned()
}

fn default_loop() -> Result<&'static Arc<DefaultEventLoop>> {
    DEFAULT_LOOP.get().ok_or_else(|| {
        VirtError::EventLoop(
            "default event loop not registered; call event_register_default_impl() first".to_string(),
        )
    })
}
