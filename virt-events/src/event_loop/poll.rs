//! Single-threaded poll(2) event loop
//!
//! Timers and descriptor watches live in one table guarded by a mutex.
//! Callbacks are taken out of the table while they run, so they may add,
//! update or remove watches (including their own) without deadlocking. A
//! self-pipe wakes a blocked `poll` whenever the table changes.

use super::{EventImpl, HandleCallback, HandleEvents, TimeoutCallback};
use crate::types::{ErrorCode, ErrorDomain, HandleWatchId, NativeError, NativeResult, Result, TimerId};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

struct HandleEntry {
    id: HandleWatchId,
    fd: RawFd,
    events: HandleEvents,
    /// `None` while the callback is running
    callback: Option<HandleCallback>,
    deleted: bool,
}

struct TimeoutEntry {
    id: TimerId,
    interval: Option<Duration>,
    deadline: Option<Instant>,
    callback: Option<TimeoutCallback>,
    deleted: bool,
}

#[derive(Default)]
struct LoopState {
    handles: Vec<HandleEntry>,
    timeouts: Vec<TimeoutEntry>,
    next_handle: u32,
    next_timer: u32,
}

impl LoopState {
    fn handle_mut(&mut self, id: HandleWatchId) -> Option<&mut HandleEntry> {
        self.handles.iter_mut().find(|h| h.id == id && !h.deleted)
    }

    fn timeout_mut(&mut self, id: TimerId) -> Option<&mut TimeoutEntry> {
        self.timeouts.iter_mut().find(|t| t.id == id && !t.deleted)
    }
}

/// The bundled event loop.
///
/// One pass ([`run_once`](Self::run_once)) services timers first, then
/// descriptors, each in registration order. Passes are serialized: a second
/// thread calling `run_once` waits for the first to return. Calling `run_once`
/// from inside one of the loop's own callbacks deadlocks.
pub struct DefaultEventLoop {
    state: Mutex<LoopState>,
    run_lock: Mutex<()>,
    wakeup_tx: UnixStream,
    wakeup_rx: UnixStream,
}

impl DefaultEventLoop {
    pub fn new() -> Result<Self> {
        let (wakeup_tx, wakeup_rx) = UnixStream::pair()?;
        wakeup_tx.set_nonblocking(true)?;
        wakeup_rx.set_nonblocking(true)?;
        Ok(Self {
            state: Mutex::new(LoopState::default()),
            run_lock: Mutex::new(()),
            wakeup_tx,
            wakeup_rx,
        })
    }

    /// Block until at least one watch is ready and service all ready watches
    pub fn run_once(&self) -> Result<()> {
        self.run(None).map(|_| ())
    }

    /// Like [`run_once`](Self::run_once) but gives up after `timeout`.
    ///
    /// Returns whether any watch was serviced.
    pub fn run_once_timeout(&self, timeout: Duration) -> Result<bool> {
        self.run(Some(Instant::now() + timeout))
    }

    /// Number of registered descriptor watches
    pub fn handle_count(&self) -> usize {
        self.state.lock().handles.iter().filter(|h| !h.deleted).count()
    }

    /// Number of registered timers, enabled or not
    pub fn timeout_count(&self) -> usize {
        self.state.lock().timeouts.iter().filter(|t| !t.deleted).count()
    }

    fn run(&self, give_up_at: Option<Instant>) -> Result<bool> {
        let _running = self.run_lock.lock();

        loop {
            let (mut fds, watches, mut timeout) = self.prepare();
            if let Some(limit) = give_up_at {
                let remaining = limit.saturating_duration_since(Instant::now());
                timeout = Some(timeout.map_or(remaining, |t| t.min(remaining)));
            }

            log::trace!("Polling {} handles, timeout {:?}", watches.len(), timeout);
            poll_fds(&mut fds, timeout)?;

            if fds[0].revents != 0 {
                self.drain_wakeup();
            }
            let dispatched = self.dispatch_timeouts() + self.dispatch_handles(&fds[1..], &watches);
            if dispatched > 0 {
                return Ok(true);
            }
            if give_up_at.is_some_and(|limit| Instant::now() >= limit) {
                return Ok(false);
            }
        }
    }

    /// Drop deleted entries and build the poll set and timeout for one pass
    fn prepare(&self) -> (Vec<libc::pollfd>, Vec<HandleWatchId>, Option<Duration>) {
        let mut state = self.state.lock();
        state.handles.retain(|h| !h.deleted);
        state.timeouts.retain(|t| !t.deleted);

        let mut fds = vec![libc::pollfd {
            fd: self.wakeup_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let mut watches = Vec::new();
        for handle in state.handles.iter().filter(|h| !h.events.is_empty()) {
            fds.push(libc::pollfd {
                fd: handle.fd,
                events: to_poll_events(handle.events),
                revents: 0,
            });
            watches.push(handle.id);
        }

        let now = Instant::now();
        let timeout = state
            .timeouts
            .iter()
            .filter_map(|t| t.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now));

        (fds, watches, timeout)
    }

    fn dispatch_timeouts(&self) -> usize {
        let now = Instant::now();
        let due: Vec<TimerId> = self
            .state
            .lock()
            .timeouts
            .iter()
            .filter(|t| !t.deleted && t.deadline.is_some_and(|d| d <= now))
            .map(|t| t.id)
            .collect();

        let mut fired = 0;
        for id in due {
            let callback = {
                let mut state = self.state.lock();
                let Some(entry) = state.timeout_mut(id) else {
                    continue;
                };
                // Re-arm before the call so the callback may disable itself.
                entry.deadline = entry.interval.map(|interval| now + interval);
                entry.callback.take()
            };
            let Some(mut callback) = callback else {
                continue;
            };

            log::trace!("Firing timer {:?}", id);
            callback(id);
            fired += 1;

            if let Some(entry) = self.state.lock().timeout_mut(id) {
                entry.callback.get_or_insert(callback);
            }
        }
        fired
    }

    fn dispatch_handles(&self, fds: &[libc::pollfd], watches: &[HandleWatchId]) -> usize {
        let mut fired = 0;
        for (pfd, &id) in fds.iter().zip(watches) {
            if pfd.revents == 0 {
                continue;
            }
            let callback = {
                let mut state = self.state.lock();
                state.handle_mut(id).and_then(|entry| entry.callback.take())
            };
            let Some(mut callback) = callback else {
                continue;
            };

            let events = from_poll_events(pfd.revents);
            log::trace!("Handle {:?} (fd {}) ready: {:?}", id, pfd.fd, events);
            callback(id, pfd.fd, events);
            fired += 1;

            if let Some(entry) = self.state.lock().handle_mut(id) {
                entry.callback.get_or_insert(callback);
            }
        }
        fired
    }

    fn wake(&self) {
        // A full pipe already guarantees a pending wake-up.
        let _ = (&self.wakeup_tx).write(&[1]);
    }

    fn drain_wakeup(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wakeup_rx).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }
    }
}

impl EventImpl for DefaultEventLoop {
    fn add_handle(
        &self,
        fd: RawFd,
        events: HandleEvents,
        callback: HandleCallback,
    ) -> NativeResult<HandleWatchId> {
        if fd < 0 {
            return Err(NativeError::new(
                ErrorCode::InvalidArg,
                ErrorDomain::Event,
                format!("invalid file descriptor {}", fd),
            ));
        }
        let id = {
            let mut state = self.state.lock();
            let id = HandleWatchId(state.next_handle);
            state.next_handle += 1;
            state.handles.push(HandleEntry {
                id,
                fd,
                events,
                callback: Some(callback),
                deleted: false,
            });
            id
        };
        log::debug!("Added handle watch {:?} on fd {} for {:?}", id, fd, events);
        self.wake();
        Ok(id)
    }

    fn update_handle(&self, watch: HandleWatchId, events: HandleEvents) {
        if let Some(entry) = self.state.lock().handle_mut(watch) {
            entry.events = events;
        }
        self.wake();
    }

    fn remove_handle(&self, watch: HandleWatchId) -> NativeResult<()> {
        {
            let mut state = self.state.lock();
            let entry = state.handle_mut(watch).ok_or_else(|| {
                NativeError::new(
                    ErrorCode::InvalidArg,
                    ErrorDomain::Event,
                    format!("no handle watch {}", watch.0),
                )
            })?;
            entry.deleted = true;
        }
        log::debug!("Removed handle watch {:?}", watch);
        self.wake();
        Ok(())
    }

    fn add_timeout(
        &self,
        interval: Option<Duration>,
        callback: TimeoutCallback,
    ) -> NativeResult<TimerId> {
        let id = {
            let mut state = self.state.lock();
            let id = TimerId(state.next_timer);
            state.next_timer += 1;
            state.timeouts.push(TimeoutEntry {
                id,
                interval,
                deadline: interval.map(|i| Instant::now() + i),
                callback: Some(callback),
                deleted: false,
            });
            id
        };
        log::debug!("Added timer {:?} with interval {:?}", id, interval);
        self.wake();
        Ok(id)
    }

    fn update_timeout(&self, timer: TimerId, interval: Option<Duration>) {
        if let Some(entry) = self.state.lock().timeout_mut(timer) {
            entry.interval = interval;
            entry.deadline = interval.map(|i| Instant::now() + i);
        }
        self.wake();
    }

    fn remove_timeout(&self, timer: TimerId) -> NativeResult<()> {
        {
            let mut state = self.state.lock();
            let entry = state.timeout_mut(timer).ok_or_else(|| {
                NativeError::new(
                    ErrorCode::InvalidArg,
                    ErrorDomain::Event,
                    format!("no timer {}", timer.0),
                )
            })?;
            entry.deleted = true;
        }
        log::debug!("Removed timer {:?}", timer);
        self.wake();
        Ok(())
    }
}

fn poll_fds(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<()> {
    let timeout_ms = match timeout {
        None => -1,
        // Round up so a timer is due by the time poll returns.
        Some(t) => {
            let ms = t.as_millis() + u128::from(t.subsec_nanos() % 1_000_000 != 0);
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    };

    // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd for the
    // whole call and its length is passed alongside.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
        // Interrupted: report nothing ready, the caller recomputes and polls again.
        for pfd in fds.iter_mut() {
            pfd.revents = 0;
        }
    }
    Ok(())
}

fn to_poll_events(events: HandleEvents) -> libc::c_short {
    let mut out = 0;
    if events.contains(HandleEvents::READABLE) {
        out |= libc::POLLIN;
    }
    if events.contains(HandleEvents::WRITABLE) {
        out |= libc::POLLOUT;
    }
    out
}

fn from_poll_events(revents: libc::c_short) -> HandleEvents {
    let mut out = HandleEvents::empty();
    if revents & libc::POLLIN != 0 {
        out |= HandleEvents::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        out |= HandleEvents::WRITABLE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        out |= HandleEvents::ERROR;
    }
    if revents & libc::POLLHUP != 0 {
        out |= HandleEvents::HANGUP;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_zero_interval_timer_fires_immediately() {
        let event_loop = DefaultEventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        event_loop
            .add_timeout(
                Some(Duration::ZERO),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        event_loop.run_once().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disabled_timer_never_fires() {
        let event_loop = DefaultEventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        event_loop
            .add_timeout(
                None,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let serviced = event_loop.run_once_timeout(Duration::from_millis(30)).unwrap();
        assert!(!serviced);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timer_can_disable_itself() {
        let event_loop = Arc::new(DefaultEventLoop::new().unwrap());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let weak = Arc::downgrade(&event_loop);
        event_loop
            .add_timeout(
                Some(Duration::ZERO),
                Box::new(move |id| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if let Some(event_loop) = weak.upgrade() {
                        event_loop.update_timeout(id, None);
                    }
                }),
            )
            .unwrap();

        event_loop.run_once().unwrap();
        assert!(!event_loop.run_once_timeout(Duration::from_millis(30)).unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_timer_is_dropped() {
        let event_loop = DefaultEventLoop::new().unwrap();
        let timer = event_loop.add_timeout(Some(Duration::ZERO), Box::new(|_| {})).unwrap();
        assert_eq!(event_loop.timeout_count(), 1);

        event_loop.remove_timeout(timer).unwrap();
        assert_eq!(event_loop.timeout_count(), 0);
        assert!(event_loop.remove_timeout(timer).is_err());
        assert!(!event_loop.run_once_timeout(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn test_readable_handle_dispatch() {
        let event_loop = DefaultEventLoop::new().unwrap();
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let watch = event_loop
            .add_handle(
                reader.as_raw_fd(),
                HandleEvents::READABLE,
                Box::new(move |_, fd, events| {
                    sink.lock().push((fd, events));
                }),
            )
            .unwrap();

        assert!(!event_loop.run_once_timeout(Duration::from_millis(20)).unwrap());
        writer.write_all(b"x").unwrap();
        event_loop.run_once().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, reader.as_raw_fd());
        assert!(seen[0].1.contains(HandleEvents::READABLE));
        drop(seen);

        event_loop.remove_handle(watch).unwrap();
        assert_eq!(event_loop.handle_count(), 0);
    }

    #[test]
    fn test_add_timeout_wakes_blocked_loop() {
        let event_loop = Arc::new(DefaultEventLoop::new().unwrap());
        let fired = Arc::new(AtomicUsize::new(0));

        let runner = {
            let event_loop = event_loop.clone();
            std::thread::spawn(move || event_loop.run_once())
        };

        std::thread::sleep(Duration::from_millis(20));
        let counter = fired.clone();
        event_loop
            .add_timeout(
                Some(Duration::ZERO),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        runner.join().unwrap().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_fd_rejected() {
        let event_loop = DefaultEventLoop::new().unwrap();
        let err = event_loop
            .add_handle(-1, HandleEvents::READABLE, Box::new(|_, _, _| {}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArg);
    }
}
