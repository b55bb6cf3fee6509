//! Dispatch trampoline
//!
//! Drivers deliver every event through [`domain_event_trampoline`], a plain
//! function pointer carrying only the registration tag. The trampoline
//! resolves the tag in the connection's registry and calls the subscriber.

use crate::connect::Connection;
use crate::domain::Domain;
use crate::events::{DomainEvent, EventAck, RawDomainEvent};
use crate::types::CallbackId;

/// Status returned to the driver for every delivery
pub const DISPATCH_OK: i32 = 0;

/// Route one raw event to the callback registered under `tag`.
///
/// Never fails. Deliveries for a tag that is no longer registered (the
/// subscription was removed while the event was queued), payloads that do not
/// decode, and payloads outside the registration's filters are dropped and
/// acknowledged on the callback's behalf.
pub fn domain_event_trampoline(
    conn: &Connection,
    dom: &Domain,
    raw: &RawDomainEvent,
    tag: CallbackId,
    ack: EventAck,
) -> i32 {
    let Some(context) = conn.callbacks().lookup(tag) else {
        log::trace!("Dropping event {} for callback {}: no longer registered", raw.event_id, tag);
        ack.done();
        return DISPATCH_OK;
    };

    let Some(event) = DomainEvent::decode(raw) else {
        log::trace!(
            "Dropping undecodable event {} for callback {} ({} ints, {} strings)",
            raw.event_id,
            tag,
            raw.ints.len(),
            raw.strs.len()
        );
        ack.done();
        return DISPATCH_OK;
    };

    if !context.accepts(event.event_id(), dom.uuid()) {
        log::trace!(
            "Dropping {} event on '{}' for callback {}: filtered out",
            event.event_id(),
            dom.name(),
            tag
        );
        ack.done();
        return DISPATCH_OK;
    }

    log::trace!("Dispatching {} event on '{}' to callback {}", event.event_id(), dom.name(), tag);
    context.invoke(conn, dom, &event, ack);
    DISPATCH_OK
}
