//! Output formatting
//!
//! One line per delivered event, as text or JSON, plus an end-of-run summary.

use crate::config::OutputFormat;
use crate::state::WatchState;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt::Write;
use virt_events::DomainEvent;

/// A delivered event, ready to print
#[derive(Debug, Serialize)]
pub struct EventLine<'a> {
    pub timestamp: String,
    pub watch: &'a str,
    pub seq: u64,
    pub domain: &'a str,
    pub event: &'a DomainEvent,
}

impl<'a> EventLine<'a> {
    pub fn new(
        at: DateTime<Utc>,
        watch: &'a str,
        seq: u64,
        domain: &'a str,
        event: &'a DomainEvent,
    ) -> Self {
        Self {
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            watch,
            seq,
            domain,
            event,
        }
    }

    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => format!(
                "{} [{} #{}] {}: {}",
                self.timestamp,
                self.watch,
                self.seq,
                self.domain,
                describe(self.event)
            ),
            OutputFormat::Json => serde_json::to_string(self)
                .unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e)),
        }
    }
}

/// Human-readable description of an event payload
pub fn describe(event: &DomainEvent) -> String {
    match event {
        DomainEvent::Lifecycle(lifecycle) => {
            format!("lifecycle {:?} (detail {})", lifecycle.event, lifecycle.detail).to_lowercase()
        }
        DomainEvent::Reboot => "reboot".to_string(),
        DomainEvent::RtcChange { utc_offset } => format!("rtc change, utc offset {}s", utc_offset),
        DomainEvent::Watchdog { action } => format!("watchdog fired, action {:?}", action).to_lowercase(),
        DomainEvent::IoError {
            src_path,
            dev_alias,
            action,
        } => format!("i/o error on {} ({}), action {:?}", dev_alias, src_path, action),
        DomainEvent::ControlError => "control error".to_string(),
        DomainEvent::PmWakeup { reason } => format!("pm wakeup (reason {})", reason),
        DomainEvent::PmSuspend { reason } => format!("pm suspend (reason {})", reason),
        DomainEvent::BalloonChange { actual } => format!("balloon now {} KiB", actual),
        DomainEvent::DeviceRemoved { dev_alias } => format!("device {} removed", dev_alias),
    }
}

/// End-of-run delivery counts per watch
pub fn summary(states: &[&WatchState]) -> String {
    let mut out = String::from("Delivered events:\n");
    let width = states.iter().map(|s| s.label.len()).max().unwrap_or(0);
    for state in states {
        let _ = writeln!(out, "  {:<width$}  {}", state.label, state.delivered(), width = width);
    }
    let total: u64 = states.iter().map(|s| s.delivered()).sum();
    let _ = write!(out, "  total: {}", total);
    out
}
