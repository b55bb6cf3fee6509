//! Core types for the virt-events library
//!
//! Identifiers handed across the native seam, the error taxonomy, and the
//! `Result` alias used by every public operation.

use crate::events::DomainEventId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for library operations
pub type Result<T> = std::result::Result<T, VirtError>;

/// Result type for calls into the connection driver and event loop primitives
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Registration identifier returned by `Connection::domain_event_register`.
///
/// Assigned monotonically per connection and never reused while the
/// connection is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackId(pub u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Driver-side handle of an active domain event watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub u32);

/// Event loop handle of a registered descriptor watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleWatchId(pub u32);

/// Event loop handle of a registered timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u32);

/// Error classes reported by the connection layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InternalError,
    NoSupport,
    InvalidArg,
    NoDomain,
    OperationInvalid,
    OperationFailed,
    NoConnect,
}

/// Subsystem that raised a native error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    Test,
    Domain,
    Event,
    Connect,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDomain::Test => write!(f, "test"),
            ErrorDomain::Domain => write!(f, "domain"),
            ErrorDomain::Event => write!(f, "event"),
            ErrorDomain::Connect => write!(f, "connect"),
        }
    }
}

/// Error raised by the connection driver or an event loop primitive
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[Code-{code:?}] [Domain-{domain}] {message}")]
pub struct NativeError {
    pub code: ErrorCode,
    pub domain: ErrorDomain,
    pub message: String,
}

impl NativeError {
    pub fn new(code: ErrorCode, domain: ErrorDomain, message: impl Into<String>) -> Self {
        Self {
            code,
            domain,
            message: message.into(),
        }
    }
}

/// Errors surfaced to callers
#[derive(Debug, thiserror::Error)]
pub enum VirtError {
    #[error("Failed to register {event_id:?} callback: {source}")]
    RegistrationFailure {
        event_id: DomainEventId,
        #[source]
        source: NativeError,
    },

    #[error("Unknown domain event callback id: {0}")]
    UnknownRegistration(CallbackId),

    #[error("Native call failed: {0}")]
    Native(#[from] NativeError),

    #[error("No connection driver for URI: {0}")]
    NoConnect(String),

    #[error("Event loop error: {0}")]
    EventLoop(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VirtError {
    /// Native error carried by this failure, if any
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            VirtError::RegistrationFailure { source, .. } => Some(source),
            VirtError::Native(e) => Some(e),
            _ => None,
        }
    }
}
