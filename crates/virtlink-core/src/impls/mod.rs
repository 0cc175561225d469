//! Impls - development and test implementations of the ports.
//!
//! - **MemorySettingsStore**: in-process settings store
//! - **SimulatedBackend**: scriptable in-process hypervisor
//!
//! Production backends bind a real management library and live outside the core.

pub mod memory_store;
pub mod sim_backend;

pub use self::memory_store::MemorySettingsStore;
pub use self::sim_backend::SimulatedBackend;
