//! Ports - external collaborators.
//!
//! The core consumes two collaborators through these traits:
//! - **Backend**: the hypervisor management library (blocking, fallible)
//! - **SettingsStore**: persisted configuration
//!
//! Development implementations live in `impls`.

pub mod backend;
pub mod settings_store;

pub use self::backend::{
    Backend, BackendHandle, BackendResult, BackendSignal, Capabilities, CloseReason, DomainAction,
    EventSource, ObjectInfo, SignalSink, VolumeInfo, VolumeStream,
};
pub use self::settings_store::SettingsStore;
