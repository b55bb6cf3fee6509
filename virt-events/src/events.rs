//! Domain event kinds and payload decoding
//!
//! The connection layer delivers events as a [`RawDomainEvent`]: a numeric
//! event id plus positional integer and string fields, the way the native
//! callback ABI hands them over. [`DomainEvent::decode`] turns that into the
//! typed payload passed to callbacks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Event kinds a connection can watch for, with their native ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventId {
    Lifecycle,
    Reboot,
    RtcChange,
    Watchdog,
    IoError,
    Graphics,
    ControlError,
    BlockJob,
    PmWakeup,
    PmSuspend,
    BalloonChange,
    DeviceRemoved,
}

impl DomainEventId {
    /// All known kinds, in native id order
    pub const ALL: [DomainEventId; 12] = [
        DomainEventId::Lifecycle,
        DomainEventId::Reboot,
        DomainEventId::RtcChange,
        DomainEventId::Watchdog,
        DomainEventId::IoError,
        DomainEventId::Graphics,
        DomainEventId::ControlError,
        DomainEventId::BlockJob,
        DomainEventId::PmWakeup,
        DomainEventId::PmSuspend,
        DomainEventId::BalloonChange,
        DomainEventId::DeviceRemoved,
    ];

    /// Native numeric id
    pub fn as_raw(self) -> i32 {
        match self {
            DomainEventId::Lifecycle => 0,
            DomainEventId::Reboot => 1,
            DomainEventId::RtcChange => 2,
            DomainEventId::Watchdog => 3,
            DomainEventId::IoError => 4,
            DomainEventId::Graphics => 5,
            DomainEventId::ControlError => 7,
            DomainEventId::BlockJob => 8,
            DomainEventId::PmWakeup => 11,
            DomainEventId::PmSuspend => 12,
            DomainEventId::BalloonChange => 13,
            DomainEventId::DeviceRemoved => 15,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.as_raw() == raw)
    }

    /// Parse a kind from its snake_case name ("lifecycle", "rtc_change", ...)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            DomainEventId::Lifecycle => "lifecycle",
            DomainEventId::Reboot => "reboot",
            DomainEventId::RtcChange => "rtc_change",
            DomainEventId::Watchdog => "watchdog",
            DomainEventId::IoError => "io_error",
            DomainEventId::Graphics => "graphics",
            DomainEventId::ControlError => "control_error",
            DomainEventId::BlockJob => "block_job",
            DomainEventId::PmWakeup => "pm_wakeup",
            DomainEventId::PmSuspend => "pm_suspend",
            DomainEventId::BalloonChange => "balloon_change",
            DomainEventId::DeviceRemoved => "device_removed",
        }
    }
}

impl fmt::Display for DomainEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle transition reported by a lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventType {
    Defined,
    Undefined,
    Started,
    Suspended,
    Resumed,
    Stopped,
    Shutdown,
    PmSuspended,
    Crashed,
}

impl DomainEventType {
    pub fn as_raw(self) -> i64 {
        match self {
            DomainEventType::Defined => 0,
            DomainEventType::Undefined => 1,
            DomainEventType::Started => 2,
            DomainEventType::Suspended => 3,
            DomainEventType::Resumed => 4,
            DomainEventType::Stopped => 5,
            DomainEventType::Shutdown => 6,
            DomainEventType::PmSuspended => 7,
            DomainEventType::Crashed => 8,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        Some(match raw {
            0 => DomainEventType::Defined,
            1 => DomainEventType::Undefined,
            2 => DomainEventType::Started,
            3 => DomainEventType::Suspended,
            4 => DomainEventType::Resumed,
            5 => DomainEventType::Stopped,
            6 => DomainEventType::Shutdown,
            7 => DomainEventType::PmSuspended,
            8 => DomainEventType::Crashed,
            _ => return None,
        })
    }
}

/// Detail sub-codes refining a lifecycle event.
///
/// The meaning of a detail depends on the event it accompanies, so these are
/// plain integers grouped per event type.
pub mod detail {
    pub mod defined {
        pub const ADDED: i32 = 0;
        pub const UPDATED: i32 = 1;
    }
    pub mod undefined {
        pub const REMOVED: i32 = 0;
    }
    pub mod started {
        pub const BOOTED: i32 = 0;
        pub const MIGRATED: i32 = 1;
        pub const RESTORED: i32 = 2;
    }
    pub mod suspended {
        pub const PAUSED: i32 = 0;
    }
    pub mod resumed {
        pub const UNPAUSED: i32 = 0;
    }
    pub mod stopped {
        pub const SHUTDOWN: i32 = 0;
        pub const DESTROYED: i32 = 1;
        pub const CRASHED: i32 = 2;
    }
    pub mod shutdown {
        pub const FINISHED: i32 = 0;
    }
}

/// Payload of a lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainLifecycleEvent {
    pub event: DomainEventType,
    pub detail: i32,
}

/// Watchdog action taken by the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogAction {
    None,
    Pause,
    Reset,
    Poweroff,
    Shutdown,
    Debug,
    InjectNmi,
}

impl WatchdogAction {
    const TABLE: [WatchdogAction; 7] = [
        WatchdogAction::None,
        WatchdogAction::Pause,
        WatchdogAction::Reset,
        WatchdogAction::Poweroff,
        WatchdogAction::Shutdown,
        WatchdogAction::Debug,
        WatchdogAction::InjectNmi,
    ];

    fn from_raw(raw: i64) -> Option<Self> {
        usize::try_from(raw).ok().and_then(|i| Self::TABLE.get(i).copied())
    }

    fn as_raw(self) -> i64 {
        Self::TABLE.iter().position(|a| *a == self).unwrap_or(0) as i64
    }
}

/// Action taken after a guest I/O error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoErrorAction {
    None,
    Pause,
    Report,
}

impl IoErrorAction {
    fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(IoErrorAction::None),
            1 => Some(IoErrorAction::Pause),
            2 => Some(IoErrorAction::Report),
            _ => None,
        }
    }

    fn as_raw(self) -> i64 {
        match self {
            IoErrorAction::None => 0,
            IoErrorAction::Pause => 1,
            IoErrorAction::Report => 2,
        }
    }
}

/// Decoded domain event handed to callbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    Lifecycle(DomainLifecycleEvent),
    Reboot,
    RtcChange { utc_offset: i64 },
    Watchdog { action: WatchdogAction },
    IoError {
        src_path: String,
        dev_alias: String,
        action: IoErrorAction,
    },
    ControlError,
    PmWakeup { reason: i32 },
    PmSuspend { reason: i32 },
    /// Current balloon size in KiB
    BalloonChange { actual: u64 },
    DeviceRemoved { dev_alias: String },
}

impl DomainEvent {
    pub fn lifecycle(event: DomainEventType, detail: i32) -> Self {
        DomainEvent::Lifecycle(DomainLifecycleEvent { event, detail })
    }

    /// Kind this payload belongs to
    pub fn event_id(&self) -> DomainEventId {
        match self {
            DomainEvent::Lifecycle(_) => DomainEventId::Lifecycle,
            DomainEvent::Reboot => DomainEventId::Reboot,
            DomainEvent::RtcChange { .. } => DomainEventId::RtcChange,
            DomainEvent::Watchdog { .. } => DomainEventId::Watchdog,
            DomainEvent::IoError { .. } => DomainEventId::IoError,
            DomainEvent::ControlError => DomainEventId::ControlError,
            DomainEvent::PmWakeup { .. } => DomainEventId::PmWakeup,
            DomainEvent::PmSuspend { .. } => DomainEventId::PmSuspend,
            DomainEvent::BalloonChange { .. } => DomainEventId::BalloonChange,
            DomainEvent::DeviceRemoved { .. } => DomainEventId::DeviceRemoved,
        }
    }

    /// Lifecycle payload, if this is a lifecycle event
    pub fn as_lifecycle(&self) -> Option<&DomainLifecycleEvent> {
        match self {
            DomainEvent::Lifecycle(ev) => Some(ev),
            _ => None,
        }
    }

    /// Decode the positional fields of a raw delivery.
    ///
    /// Returns `None` for kinds without a typed payload and for payloads with
    /// missing or out-of-range fields.
    pub fn decode(raw: &RawDomainEvent) -> Option<Self> {
        let kind = DomainEventId::from_raw(raw.event_id)?;
        let event = match kind {
            DomainEventId::Lifecycle => {
                let event = DomainEventType::from_raw(raw.int(0)?)?;
                let detail = i32::try_from(raw.int(1)?).ok()?;
                DomainEvent::lifecycle(event, detail)
            }
            DomainEventId::Reboot => DomainEvent::Reboot,
            DomainEventId::RtcChange => DomainEvent::RtcChange {
                utc_offset: raw.int(0)?,
            },
            DomainEventId::Watchdog => DomainEvent::Watchdog {
                action: WatchdogAction::from_raw(raw.int(0)?)?,
            },
            DomainEventId::IoError => DomainEvent::IoError {
                src_path: raw.str(0)?.to_string(),
                dev_alias: raw.str(1)?.to_string(),
                action: IoErrorAction::from_raw(raw.int(0)?)?,
            },
            DomainEventId::ControlError => DomainEvent::ControlError,
            DomainEventId::PmWakeup => DomainEvent::PmWakeup {
                reason: i32::try_from(raw.int(0)?).ok()?,
            },
            DomainEventId::PmSuspend => DomainEvent::PmSuspend {
                reason: i32::try_from(raw.int(0)?).ok()?,
            },
            DomainEventId::BalloonChange => DomainEvent::BalloonChange {
                actual: u64::try_from(raw.int(0)?).ok()?,
            },
            DomainEventId::DeviceRemoved => DomainEvent::DeviceRemoved {
                dev_alias: raw.str(0)?.to_string(),
            },
            DomainEventId::Graphics | DomainEventId::BlockJob => return None,
        };
        Some(event)
    }

    /// Encode into the positional form a driver delivers
    pub fn to_raw(&self) -> RawDomainEvent {
        let id = self.event_id().as_raw();
        match self {
            DomainEvent::Lifecycle(ev) => {
                RawDomainEvent::new(id, vec![ev.event.as_raw(), ev.detail as i64], vec![])
            }
            DomainEvent::Reboot | DomainEvent::ControlError => RawDomainEvent::new(id, vec![], vec![]),
            DomainEvent::RtcChange { utc_offset } => RawDomainEvent::new(id, vec![*utc_offset], vec![]),
            DomainEvent::Watchdog { action } => RawDomainEvent::new(id, vec![action.as_raw()], vec![]),
            DomainEvent::IoError {
                src_path,
                dev_alias,
                action,
            } => RawDomainEvent::new(id, vec![action.as_raw()], vec![src_path.clone(), dev_alias.clone()]),
            DomainEvent::PmWakeup { reason } | DomainEvent::PmSuspend { reason } => {
                RawDomainEvent::new(id, vec![*reason as i64], vec![])
            }
            DomainEvent::BalloonChange { actual } => {
                RawDomainEvent::new(id, vec![i64::try_from(*actual).unwrap_or(i64::MAX)], vec![])
            }
            DomainEvent::DeviceRemoved { dev_alias } => RawDomainEvent::new(id, vec![], vec![dev_alias.clone()]),
        }
    }
}

/// Event as delivered by the connection layer, before decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDomainEvent {
    /// Native event id (see [`DomainEventId::as_raw`])
    pub event_id: i32,
    pub ints: Vec<i64>,
    pub strs: Vec<String>,
}

impl RawDomainEvent {
    pub fn new(event_id: i32, ints: Vec<i64>, strs: Vec<String>) -> Self {
        Self { event_id, ints, strs }
    }

    fn int(&self, index: usize) -> Option<i64> {
        self.ints.get(index).copied()
    }

    fn str(&self, index: usize) -> Option<&str> {
        self.strs.get(index).map(String::as_str)
    }
}

/// Acknowledgment continuation passed to every callback invocation.
///
/// The callback must call [`EventAck::done`] once it has finished with the
/// event. An acknowledgment dropped without `done` holds back the events still
/// queued behind this one until the connection queues new ones.
#[derive(Debug)]
#[must_use = "call done() once the event has been processed"]
pub struct EventAck {
    flag: Arc<AtomicBool>,
}

impl EventAck {
    /// Create an unacknowledged continuation and the status used to observe it
    pub fn pair() -> (EventAck, AckStatus) {
        let flag = Arc::new(AtomicBool::new(false));
        (EventAck { flag: flag.clone() }, AckStatus { flag })
    }

    /// Signal that processing of the event is complete
    pub fn done(self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// Delivery-side view of an [`EventAck`]
#[derive(Debug, Clone)]
pub struct AckStatus {
    flag: Arc<AtomicBool>,
}

impl AckStatus {
    pub fn is_acknowledged(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
