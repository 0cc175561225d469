//! Events broadcast through connection and resource buses.
//!
//! Every event belongs to exactly one of nine categories: connection-generic,
//! or one of {domain, network, pool, secret} x {lifecycle, generic}.
//!
//! - **Lifecycle** kinds are backend-native (started, stopped, defined, ...)
//!   and carry the backend's refinement `detail` code.
//! - **Generic** kinds are produced locally after a mutation that the backend
//!   does not report as a lifecycle transition (autostart, snapshots, volumes).
//!
//! Each category is its own variant of [`EventKind`], so a consumer never has
//! to guess whether a kind is native or local.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource families managed under a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Domain,
    Network,
    Pool,
    Secret,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Domain => "domain",
            ResourceType::Network => "network",
            ResourceType::Pool => "pool",
            ResourceType::Secret => "secret",
        }
    }

    pub fn lifecycle_category(self) -> EventCategory {
        match self {
            ResourceType::Domain => EventCategory::DomainLifecycle,
            ResourceType::Network => EventCategory::NetworkLifecycle,
            ResourceType::Pool => EventCategory::PoolLifecycle,
            ResourceType::Secret => EventCategory::SecretLifecycle,
        }
    }

    pub fn generic_category(self) -> EventCategory {
        match self {
            ResourceType::Domain => EventCategory::DomainGeneric,
            ResourceType::Network => EventCategory::NetworkGeneric,
            ResourceType::Pool => EventCategory::PoolGeneric,
            ResourceType::Secret => EventCategory::SecretGeneric,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The nine event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    ConnectionGeneric,
    DomainLifecycle,
    DomainGeneric,
    NetworkLifecycle,
    NetworkGeneric,
    PoolLifecycle,
    PoolGeneric,
    SecretLifecycle,
    SecretGeneric,
}

impl EventCategory {
    pub const ALL: [EventCategory; 9] = [
        EventCategory::ConnectionGeneric,
        EventCategory::DomainLifecycle,
        EventCategory::DomainGeneric,
        EventCategory::NetworkLifecycle,
        EventCategory::NetworkGeneric,
        EventCategory::PoolLifecycle,
        EventCategory::PoolGeneric,
        EventCategory::SecretLifecycle,
        EventCategory::SecretGeneric,
    ];

    /// `None` for connection-generic events.
    pub fn resource_type(self) -> Option<ResourceType> {
        match self {
            EventCategory::ConnectionGeneric => None,
            EventCategory::DomainLifecycle | EventCategory::DomainGeneric => {
                Some(ResourceType::Domain)
            }
            EventCategory::NetworkLifecycle | EventCategory::NetworkGeneric => {
                Some(ResourceType::Network)
            }
            EventCategory::PoolLifecycle | EventCategory::PoolGeneric => Some(ResourceType::Pool),
            EventCategory::SecretLifecycle | EventCategory::SecretGeneric => {
                Some(ResourceType::Secret)
            }
        }
    }

    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            EventCategory::DomainLifecycle
                | EventCategory::NetworkLifecycle
                | EventCategory::PoolLifecycle
                | EventCategory::SecretLifecycle
        )
    }
}

// ========================================
// Connection-generic kinds
// ========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionChange {
    Attempting,
    Established,
    Failed { reason: String },
    Disconnected,
    Deleted,
    SettingsChanged,
}

// ========================================
// Backend-native lifecycle kinds
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainLifecycle {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkLifecycle {
    Defined,
    Undefined,
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolLifecycle {
    Defined,
    Undefined,
    Started,
    Stopped,
    Created,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretLifecycle {
    Defined,
    Undefined,
}

// ========================================
// Locally-defined generic kinds
// ========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainChange {
    Added,
    Deleted,
    SettingsChanged,
    AutostartChanged { enabled: bool },
    SnapshotTaken { name: String },
    SnapshotDeleted { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkChange {
    Added,
    Deleted,
    AutostartChanged { enabled: bool },
}

/// Volume kinds use the volume name as the event subject and name the
/// parent pool explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolChange {
    Added,
    Deleted,
    AutostartChanged { enabled: bool },
    Refreshed,
    VolumeAdded { pool: String },
    VolumeDeleted { pool: String },
}

impl PoolChange {
    /// Volume events concern child objects, not the pool that is the bus owner.
    pub fn concerns_volume(&self) -> bool {
        matches!(
            self,
            PoolChange::VolumeAdded { .. } | PoolChange::VolumeDeleted { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecretChange {
    Added,
    Deleted,
    ValueChanged,
}

// ========================================
// Event
// ========================================

/// Category-tagged payload. Resource variants carry the subject identity
/// (`uuid`) plus only the fields meaningful to that category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum EventKind {
    Connection(ConnectionChange),
    DomainLifecycle {
        uuid: String,
        event: DomainLifecycle,
        detail: i32,
    },
    DomainGeneric {
        uuid: String,
        change: DomainChange,
    },
    NetworkLifecycle {
        uuid: String,
        event: NetworkLifecycle,
        detail: i32,
    },
    NetworkGeneric {
        uuid: String,
        change: NetworkChange,
    },
    PoolLifecycle {
        uuid: String,
        event: PoolLifecycle,
        detail: i32,
    },
    PoolGeneric {
        uuid: String,
        change: PoolChange,
    },
    SecretLifecycle {
        uuid: String,
        event: SecretLifecycle,
        detail: i32,
    },
    SecretGeneric {
        uuid: String,
        change: SecretChange,
    },
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::Connection(_) => EventCategory::ConnectionGeneric,
            EventKind::DomainLifecycle { .. } => EventCategory::DomainLifecycle,
            EventKind::DomainGeneric { .. } => EventCategory::DomainGeneric,
            EventKind::NetworkLifecycle { .. } => EventCategory::NetworkLifecycle,
            EventKind::NetworkGeneric { .. } => EventCategory::NetworkGeneric,
            EventKind::PoolLifecycle { .. } => EventCategory::PoolLifecycle,
            EventKind::PoolGeneric { .. } => EventCategory::PoolGeneric,
            EventKind::SecretLifecycle { .. } => EventCategory::SecretLifecycle,
            EventKind::SecretGeneric { .. } => EventCategory::SecretGeneric,
        }
    }

    /// Subject identity; `None` for connection-generic events.
    pub fn subject(&self) -> Option<&str> {
        match self {
            EventKind::Connection(_) => None,
            EventKind::DomainLifecycle { uuid, .. }
            | EventKind::DomainGeneric { uuid, .. }
            | EventKind::NetworkLifecycle { uuid, .. }
            | EventKind::NetworkGeneric { uuid, .. }
            | EventKind::PoolLifecycle { uuid, .. }
            | EventKind::PoolGeneric { uuid, .. }
            | EventKind::SecretLifecycle { uuid, .. }
            | EventKind::SecretGeneric { uuid, .. } => Some(uuid),
        }
    }
}

/// Immutable event value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Endpoint URL of the originating connection.
    pub connection: String,
    #[serde(flatten)]
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(connection: impl Into<String>, kind: EventKind) -> Self {
        Self {
            connection: connection.into(),
            kind,
            at: Utc::now(),
        }
    }

    pub fn category(&self) -> EventCategory {
        self.kind.category()
    }

    pub fn subject(&self) -> Option<&str> {
        self.kind.subject()
    }

    pub fn connection_change(&self) -> Option<&ConnectionChange> {
        match &self.kind {
            EventKind::Connection(change) => Some(change),
            _ => None,
        }
    }

    /// Disconnected or Deleted: resource wrappers drop their subscription
    /// to the connection when they see one of these.
    pub fn ends_connection_session(&self) -> bool {
        matches!(
            self.connection_change(),
            Some(ConnectionChange::Disconnected | ConnectionChange::Deleted)
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::Connection(change) => write!(f, "[{}] {:?}", self.connection, change),
            EventKind::DomainLifecycle { uuid, event, detail } => {
                write!(f, "[{}] domain {uuid} {event:?} ({detail})", self.connection)
            }
            EventKind::NetworkLifecycle { uuid, event, detail } => {
                write!(f, "[{}] network {uuid} {event:?} ({detail})", self.connection)
            }
            EventKind::PoolLifecycle { uuid, event, detail } => {
                write!(f, "[{}] pool {uuid} {event:?} ({detail})", self.connection)
            }
            EventKind::SecretLifecycle { uuid, event, detail } => {
                write!(f, "[{}] secret {uuid} {event:?} ({detail})", self.connection)
            }
            EventKind::DomainGeneric { uuid, change } => {
                write!(f, "[{}] domain {uuid} {change:?}", self.connection)
            }
            EventKind::NetworkGeneric { uuid, change } => {
                write!(f, "[{}] network {uuid} {change:?}", self.connection)
            }
            EventKind::PoolGeneric { uuid, change } => {
                write!(f, "[{}] pool {uuid} {change:?}", self.connection)
            }
            EventKind::SecretGeneric { uuid, change } => {
                write!(f, "[{}] secret {uuid} {change:?}", self.connection)
            }
        }
    }
}
