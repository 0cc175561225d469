//! SettingsStore port - persisted configuration.
//!
//! Injected into every `Connection` instead of being read from process-wide
//! state. Values are JSON documents; the storage format behind them belongs
//! to the implementation.

use crate::error::Result;

/// Key/value configuration store.
///
/// Single-writer: only the dispatch context writes, so implementations need
/// no cross-writer coordination beyond what `&self` methods require.
pub trait SettingsStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;
}
