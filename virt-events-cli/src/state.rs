//! Per-watch state threaded through the event callback

use crate::config::OutputFormat;
use std::sync::atomic::{AtomicU64, Ordering};

/// Caller state bound to one registration
#[derive(Debug)]
pub struct WatchState {
    pub label: String,
    pub format: OutputFormat,
    delivered: AtomicU64,
}

impl WatchState {
    pub fn new(label: String, format: OutputFormat) -> Self {
        Self {
            label,
            format,
            delivered: AtomicU64::new(0),
        }
    }

    /// Count one delivery, returning its 1-based sequence number
    pub fn record(&self) -> u64 {
        self.delivered.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}
