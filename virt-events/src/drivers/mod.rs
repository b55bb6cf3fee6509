//! Connection drivers
//!
//! Only the in-memory test driver ships with this crate.

mod test;

pub use test::{TestDriver, WatchOp};

use crate::connect::Driver;
use crate::event_loop::EventImpl;
use crate::types::{Result, VirtError};
use std::sync::Arc;

/// Pick a driver for `uri`
pub(crate) fn open(uri: &str, events: Option<Arc<dyn EventImpl>>) -> Result<Box<dyn Driver>> {
    match uri {
        "test:///default" => Ok(Box::new(TestDriver::with_default_domain(events))),
        "test:///empty" => Ok(Box::new(TestDriver::empty(events))),
        _ => Err(VirtError::NoConnect(uri.to_string())),
    }
}
