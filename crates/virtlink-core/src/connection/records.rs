//! Persisted connection list.
//!
//! Stored under one key as a JSON array of `ConnectionRecord`, keyed by URL.

use crate::error::{Error, Result};
use crate::model::{ConnectionRecord, ConnectionSettings};
use crate::ports::SettingsStore;

pub const CONNECTIONS_KEY: &str = "connections";

pub(crate) fn load(store: &dyn SettingsStore) -> Result<Vec<ConnectionRecord>> {
    match store.get(CONNECTIONS_KEY)? {
        None => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value)
            .map_err(|e| Error::Settings(format!("malformed {CONNECTIONS_KEY}: {e}"))),
    }
}

fn save(store: &dyn SettingsStore, records: &[ConnectionRecord]) -> Result<()> {
    let value = serde_json::to_value(records)
        .map_err(|e| Error::Settings(format!("encode {CONNECTIONS_KEY}: {e}")))?;
    store.put(CONNECTIONS_KEY, value)
}

/// Appends `record`; the URL must not be present yet.
pub(crate) fn insert(store: &dyn SettingsStore, record: &ConnectionRecord) -> Result<()> {
    let mut records = load(store)?;
    if records.iter().any(|r| r.url == record.url) {
        return Err(Error::Settings(format!("connection {} already exists", record.url)));
    }
    records.push(record.clone());
    save(store, &records)
}

/// Replaces the settings of `url`, adding the record if it is missing.
pub(crate) fn update(store: &dyn SettingsStore, url: &str, settings: &ConnectionSettings) -> Result<()> {
    let mut records = load(store)?;
    match records.iter_mut().find(|r| r.url == url) {
        Some(record) => record.settings = settings.clone(),
        None => records.push(ConnectionRecord::new(url, settings.clone())),
    }
    save(store, &records)
}

/// Removes `url`. Missing records are not an error.
pub(crate) fn remove(store: &dyn SettingsStore, url: &str) -> Result<()> {
    let mut records = load(store)?;
    let before = records.len();
    records.retain(|r| r.url != url);
    if records.len() == before {
        return Ok(());
    }
    save(store, &records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemorySettingsStore;

    fn record(url: &str, name: &str) -> ConnectionRecord {
        ConnectionRecord::new(
            url,
            ConnectionSettings {
                name: name.into(),
                ..ConnectionSettings::default()
            },
        )
    }

    #[test]
    fn insert_update_remove() {
        let store = MemorySettingsStore::new();
        insert(&store, &record("test://a/system", "a")).unwrap();
        insert(&store, &record("test://b/system", "b")).unwrap();

        let mut renamed = load(&store).unwrap()[0].settings.clone();
        renamed.name = "alpha".into();
        update(&store, "test://a/system", &renamed).unwrap();

        let records = load(&store).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].settings.name, "alpha");

        remove(&store, "test://a/system").unwrap();
        let records = load(&store).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "test://b/system");
    }

    #[test]
    fn duplicate_url_is_rejected() {
        let store = MemorySettingsStore::new();
        insert(&store, &record("test://a/system", "a")).unwrap();
        let err = insert(&store, &record("test://a/system", "again")).unwrap_err();
        assert!(matches!(err, Error::Settings(_)));
    }

    #[test]
    fn malformed_document_is_a_settings_error() {
        let store = MemorySettingsStore::new();
        store
            .put(CONNECTIONS_KEY, serde_json::json!({"not": "a list"}))
            .unwrap();
        assert!(matches!(load(&store), Err(Error::Settings(_))));
    }
}
