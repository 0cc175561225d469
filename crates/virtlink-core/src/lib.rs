//! virtlink-core
//!
//! Connection and event core of a virtualization management client.
//!
//! # Modules
//! - **model**: value types (ids, connection state, events, settings)
//! - **ports**: external collaborators (Backend, SettingsStore)
//! - **app**: dispatch context, job runner, repeating job, event bus
//! - **connection**: per-endpoint state machine and bus
//! - **resources**: Domain / Network / Pool / Secret wrappers
//! - **impls**: development implementations (MemorySettingsStore, SimulatedBackend)
//!
//! # Threading
//! All core state lives on one dispatch context ([`app::Dispatcher`]). Blocking
//! backend calls run on workers and report back through it; nothing in the
//! core is `Send` except what crosses to a worker.

pub mod app;
pub mod connection;
pub mod error;
pub mod impls;
pub mod model;
pub mod ports;
pub mod resources;

pub use app::{Dispatcher, EventBus, JobResult, RepeatingJob};
pub use connection::Connection;
pub use error::{BackendError, Error, Result};
pub use model::{ConnectionState, Event, EventKind};
pub use resources::{Domain, Network, Pool, Secret};
