//! Event subscriptions: the registry of callback contexts and the trampoline
//! drivers deliver through.

pub mod dispatch;
pub mod registry;

pub use dispatch::{domain_event_trampoline, DISPATCH_OK};
pub use registry::{CallbackContext, CallbackRegistry};
