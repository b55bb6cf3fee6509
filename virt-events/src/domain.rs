//! Domain handles
//!
//! Thin forwarding wrappers over the connection driver. The event core only
//! needs identity (uuid, name) and the state transitions that make the
//! driver emit events.

use crate::connect::Connection;
use crate::types::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Raw domain reference as the driver hands it over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRef {
    pub uuid: Uuid,
    pub name: String,
}

/// Run state of a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    pub fn as_raw(self) -> i32 {
        match self {
            DomainState::NoState => 0,
            DomainState::Running => 1,
            DomainState::Blocked => 2,
            DomainState::Paused => 3,
            DomainState::Shutdown => 4,
            DomainState::Shutoff => 5,
            DomainState::Crashed => 6,
            DomainState::PmSuspended => 7,
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, DomainState::Shutoff | DomainState::NoState)
    }
}

/// Reasons accompanying a domain state
pub mod reason {
    pub mod running {
        pub const BOOTED: i32 = 1;
        pub const UNPAUSED: i32 = 3;
    }
    pub mod paused {
        pub const USER: i32 = 1;
    }
    pub mod shutoff {
        pub const SHUTDOWN: i32 = 1;
        pub const DESTROYED: i32 = 2;
    }
}

/// State-changing operations forwarded to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainOp {
    Create,
    Destroy,
    Shutdown,
    Reboot,
    Suspend,
    Resume,
    Undefine,
}

/// A domain on an open connection
#[derive(Clone)]
pub struct Domain {
    conn: Connection,
    uuid: Uuid,
    name: String,
}

impl Domain {
    pub(crate) fn new(conn: Connection, domain: DomainRef) -> Self {
        Self {
            conn,
            uuid: domain.uuid,
            name: domain.name,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    pub fn get_uuid(&self) -> Result<Uuid> {
        Ok(self.uuid)
    }

    pub fn get_uuid_string(&self) -> String {
        self.uuid.hyphenated().to_string()
    }

    /// Runtime id; `None` while the domain is inactive
    pub fn get_id(&self) -> Result<Option<u32>> {
        Ok(self.conn.driver()?.domain_id(self.uuid)?)
    }

    /// Current state and the reason code that accompanies it
    pub fn get_state(&self) -> Result<(DomainState, i32)> {
        Ok(self.conn.driver()?.domain_state(self.uuid)?)
    }

    pub fn is_active(&self) -> Result<bool> {
        Ok(self.get_state()?.0.is_active())
    }

    /// Start a defined domain
    pub fn create(&self) -> Result<()> {
        self.op(DomainOp::Create)
    }

    pub fn destroy(&self) -> Result<()> {
        self.op(DomainOp::Destroy)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.op(DomainOp::Shutdown)
    }

    pub fn reboot(&self) -> Result<()> {
        self.op(DomainOp::Reboot)
    }

    pub fn suspend(&self) -> Result<()> {
        self.op(DomainOp::Suspend)
    }

    pub fn resume(&self) -> Result<()> {
        self.op(DomainOp::Resume)
    }

    pub fn undefine(&self) -> Result<()> {
        self.op(DomainOp::Undefine)
    }

    pub fn get_autostart(&self) -> Result<bool> {
        Ok(self.conn.driver()?.domain_autostart(self.uuid)?)
    }

    pub fn set_autostart(&self, autostart: bool) -> Result<()> {
        Ok(self.conn.driver()?.set_domain_autostart(self.uuid, autostart)?)
    }

    fn op(&self, op: DomainOp) -> Result<()> {
        log::debug!("{:?} domain '{}'", op, self.name);
        Ok(self.conn.driver()?.domain_op(self.uuid, op)?)
    }
}

impl PartialEq for Domain {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid && self.conn == other.conn
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .finish()
    }
}
