//! Backend port - the hypervisor management library.
//!
//! Every method here may block and may fail, so the core only calls them from
//! worker threads via the job runner. The one exception is
//! [`BackendHandle::is_alive`], which must be a local, non-blocking check
//! because the liveness barrier runs on the dispatch context.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::BackendError;
use crate::model::{DomainLifecycle, NetworkLifecycle, PoolLifecycle, ResourceType, SecretLifecycle};

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Backend-side event source categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    DomainLifecycle,
    NetworkLifecycle,
    PoolLifecycle,
    SecretLifecycle,
    Close,
}

impl EventSource {
    /// Registration order used when a connection opens.
    pub const ALL: [EventSource; 5] = [
        EventSource::DomainLifecycle,
        EventSource::NetworkLifecycle,
        EventSource::PoolLifecycle,
        EventSource::SecretLifecycle,
        EventSource::Close,
    ];

    /// Sources whose registration failure does not abort the connect.
    pub fn is_optional(self) -> bool {
        matches!(self, EventSource::SecretLifecycle)
    }
}

/// Why the backend closed a connection on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Error,
    Eof,
    Keepalive,
    Client,
}

/// Notification raised by the backend, on a thread the core does not own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSignal {
    Domain {
        uuid: String,
        event: DomainLifecycle,
        detail: i32,
    },
    Network {
        uuid: String,
        event: NetworkLifecycle,
        detail: i32,
    },
    Pool {
        uuid: String,
        event: PoolLifecycle,
        detail: i32,
    },
    Secret {
        uuid: String,
        event: SecretLifecycle,
        detail: i32,
    },
    Closed {
        reason: CloseReason,
    },
}

/// Where a handle delivers backend signals. Must not block.
pub type SignalSink = Arc<dyn Fn(BackendSignal) + Send + Sync>;

/// Capability snapshot. Contents are the backend's own documents; the core
/// caches them without interpreting them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub host: String,
    pub domain: String,
}

/// Summary of a managed object as enumerated by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub uuid: String,
    pub name: String,
    pub active: bool,
    pub autostart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub capacity: u64,
}

/// Domain operations that are not plain start/stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainAction {
    Shutdown,
    Reboot,
    Suspend,
    Resume,
}

/// Chunked byte source for volume downloads.
pub trait VolumeStream: Send {
    /// Reads the next chunk; `Ok(0)` means end of stream.
    fn read_chunk(&mut self, buf: &mut [u8]) -> BackendResult<usize>;

    /// Ends the transfer early, releasing backend resources.
    fn abort(self: Box<Self>);
}

/// Opens backend connections.
pub trait Backend: Send + Sync {
    fn open(&self, url: &str) -> BackendResult<Arc<dyn BackendHandle>>;
}

/// An open backend connection.
pub trait BackendHandle: Send + Sync {
    fn uri(&self) -> String;

    /// Local liveness check. Non-blocking.
    fn is_alive(&self) -> bool;

    fn close(&self) -> BackendResult<()>;

    fn capabilities(&self) -> BackendResult<Capabilities>;

    fn register_event_source(&self, source: EventSource, sink: SignalSink) -> BackendResult<()>;

    fn deregister_event_sources(&self) -> BackendResult<()>;

    fn list(&self, kind: ResourceType) -> BackendResult<Vec<ObjectInfo>>;

    fn info(&self, kind: ResourceType, uuid: &str) -> BackendResult<ObjectInfo>;

    /// Defines a new object from its XML description.
    fn define(&self, kind: ResourceType, xml: &str) -> BackendResult<ObjectInfo>;

    /// Replaces the definition of an existing object.
    fn redefine(&self, kind: ResourceType, uuid: &str, xml: &str) -> BackendResult<()>;

    fn undefine(&self, kind: ResourceType, uuid: &str) -> BackendResult<()>;

    fn start(&self, kind: ResourceType, uuid: &str) -> BackendResult<()>;

    /// Hard stop (destroy).
    fn stop(&self, kind: ResourceType, uuid: &str) -> BackendResult<()>;

    fn set_autostart(&self, kind: ResourceType, uuid: &str, enabled: bool) -> BackendResult<()>;

    fn domain_action(&self, uuid: &str, action: DomainAction) -> BackendResult<()>;

    fn create_snapshot(&self, domain: &str, name: &str) -> BackendResult<()>;

    fn delete_snapshot(&self, domain: &str, name: &str) -> BackendResult<()>;

    fn refresh_pool(&self, pool: &str) -> BackendResult<()>;

    fn list_volumes(&self, pool: &str) -> BackendResult<Vec<VolumeInfo>>;

    fn create_volume(&self, pool: &str, xml: &str) -> BackendResult<VolumeInfo>;

    fn delete_volume(&self, pool: &str, name: &str) -> BackendResult<()>;

    fn open_volume_stream(&self, pool: &str, name: &str) -> BackendResult<Box<dyn VolumeStream>>;

    fn set_secret_value(&self, uuid: &str, value: &[u8]) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_secret_events_are_optional() {
        let optional: Vec<_> = EventSource::ALL
            .iter()
            .copied()
            .filter(|s| s.is_optional())
            .collect();
        assert_eq!(optional, vec![EventSource::SecretLifecycle]);
    }
}
