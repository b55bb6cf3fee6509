//! `--demo`: drive the test domain through its lifecycle from a worker thread
//! so a watcher on `test:///default` has something to report.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use virt_events::event_loop::registered_impl;
use virt_events::{Connection, Domain, TimerId};

const STEP_DELAY: Duration = Duration::from_millis(250);

/// Wakes the pump while the demo runs so a dead worker is noticed
const HEARTBEAT: Duration = Duration::from_millis(100);

type Step = (&'static str, fn(&Domain) -> virt_events::Result<()>);

/// Each pass leaves the domain running, so the script can loop
const SCRIPT: [Step; 5] = [
    ("suspend", Domain::suspend),
    ("resume", Domain::resume),
    ("reboot", Domain::reboot),
    ("destroy", Domain::destroy),
    ("create", Domain::create),
];

/// A running demo worker
pub struct Demo {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<()>>>,
    heartbeat: Option<TimerId>,
}

impl Demo {
    /// Look up `domain_name` and start cycling it.
    ///
    /// Fails before any thread is spawned if the domain does not exist.
    pub fn start(conn: &Connection, domain_name: &str) -> Result<Self> {
        let dom = conn
            .lookup_domain_by_name(domain_name)
            .with_context(|| format!("Demo domain '{}' not found on {}", domain_name, conn.uri()))?;
        log::info!("Demo: cycling domain '{}'", domain_name);

        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = stop.clone();
            thread::spawn(move || run_script(&dom, &stop))
        };

        let mut demo = Self::from_worker(worker, stop);
        demo.heartbeat = registered_impl().and_then(|events| {
            events
                .add_timeout(Some(HEARTBEAT), Box::new(|_| {}))
                .map_err(|e| log::warn!("Demo heartbeat unavailable: {}", e))
                .ok()
        });
        Ok(demo)
    }

    fn from_worker(worker: JoinHandle<Result<()>>, stop: Arc<AtomicBool>) -> Self {
        Self {
            stop,
            worker: Some(worker),
            heartbeat: None,
        }
    }

    /// Surface the worker's error if it has already stopped
    pub fn check(&mut self) -> Result<()> {
        match &self.worker {
            Some(worker) if worker.is_finished() => self.join(),
            _ => Ok(()),
        }
    }

    /// Stop the worker and wait for it
    pub fn finish(mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        if let (Some(timer), Some(events)) = (self.heartbeat.take(), registered_impl()) {
            if let Err(e) = events.remove_timeout(timer) {
                log::debug!("Demo heartbeat already gone: {}", e);
            }
        }
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| anyhow!("Demo thread panicked"))?,
            None => Ok(()),
        }
    }
}

fn run_script(dom: &Domain, stop: &AtomicBool) -> Result<()> {
    while !stop.load(Ordering::Relaxed) {
        for (name, step) in SCRIPT {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(STEP_DELAY);
            log::debug!("Demo: {} '{}'", name, dom.name());
            step(dom).with_context(|| format!("Demo step '{}' failed", name))?;
        }
    }
    Ok(())
}
