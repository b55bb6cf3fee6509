//! Event callbacks registered by the CLI

use crate::report::EventLine;
use crate::state::WatchState;
use chrono::Utc;
use std::sync::Arc;
use virt_events::{Connection, Domain, DomainEvent, EventAck};

/// Print every delivered event and count it against its watch
pub fn print_event(
    _conn: &Connection,
    dom: &Domain,
    event: &DomainEvent,
    state: &Arc<WatchState>,
    ack: EventAck,
) {
    println!("{}", format_event(dom.name(), event, state));
    ack.done();
}

fn format_event(domain: &str, event: &DomainEvent, state: &WatchState) -> String {
    let seq = state.record();
    EventLine::new(Utc::now(), &state.label, seq, domain, event).render(state.format)
}
