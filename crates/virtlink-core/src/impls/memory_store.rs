//! MemorySettingsStore - in-process settings store for development and tests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::error::Result;
use crate::model::ConnectionRecord;
use crate::ports::SettingsStore;

/// Settings kept in a `HashMap`; lost when dropped.
///
/// Lives on the dispatch context, so interior mutability is a `RefCell`.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: RefCell<HashMap<String, serde_json::Value>>,
    writes: Cell<u64>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a connection list, e.g. from `ClientConfig`.
    pub fn with_connections(records: &[ConnectionRecord]) -> Result<Self> {
        let store = Self::new();
        let value = serde_json::to_value(records)
            .map_err(|e| crate::error::Error::Settings(e.to_string()))?;
        store.put(crate::connection::CONNECTIONS_KEY, value)?;
        store.writes.set(0);
        Ok(store)
    }

    /// Number of `put` calls since construction.
    pub fn writes(&self) -> u64 {
        self.writes.get()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.values.borrow().get(key).cloned())
    }

    fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.values.borrow_mut().insert(key.to_string(), value);
        self.writes.set(self.writes.get() + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionSettings;
    use serde_json::json;

    #[test]
    fn put_then_get() {
        let store = MemorySettingsStore::new();
        assert_eq!(store.get("k").unwrap(), None);

        store.put("k", json!([1, 2])).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!([1, 2])));
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn seeded_connections_are_readable() {
        let record = ConnectionRecord::new("test://h/system", ConnectionSettings::default());
        let store = MemorySettingsStore::with_connections(std::slice::from_ref(&record)).unwrap();

        let doc = store.get(crate::connection::CONNECTIONS_KEY).unwrap().unwrap();
        assert_eq!(doc[0]["url"], "test://h/system");
        assert_eq!(store.writes(), 0);
    }
}
