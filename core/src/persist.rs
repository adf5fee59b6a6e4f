//! Persistence interfaces: the storage backend trait and the envelope format.
//!
//! The store never talks to a concrete backend. It consumes the narrow
//! [`PersistStorage`] trait (string values under string keys) and encodes the
//! allowlisted slices into an [`Envelope`]:
//!
//! ```json
//! { "version": 3, "Profile": { "id": 1, "name": "init" } }
//! ```
//!
//! # Implementations
//!
//! - [`MemoryStorage`]: process-local map; clones share the same map
//! - [`FileStorage`]: one JSON file per key inside a directory
//!
//! # Dyn Compatibility
//!
//! Like the event store traits this crate started from, the storage trait
//! returns `Pin<Box<dyn Future>>` so it can be used as `Arc<dyn PersistStorage>`.

use crate::error::PersistError;
use crate::operation::SliceName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Boxed future returned by storage backends
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PersistError>> + Send + 'a>>;

/// Key/value backend used by the persistence coordinator.
pub trait PersistStorage: Send + Sync {
    /// Load the value stored under `key`, `None` if absent
    fn load<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    fn save<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, ()>;

    /// Delete the value stored under `key`; absent keys are not an error
    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()>;
}

/// Envelope schema version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PersistVersion {
    /// Numeric version
    Number(i64),
    /// Free-form version label
    Text(String),
}

impl fmt::Display for PersistVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for PersistVersion {
    fn from(version: i64) -> Self {
        Self::Number(version)
    }
}

impl From<i32> for PersistVersion {
    fn from(version: i32) -> Self {
        Self::Number(i64::from(version))
    }
}

impl From<&str> for PersistVersion {
    fn from(version: &str) -> Self {
        Self::Text(version.to_string())
    }
}

impl From<String> for PersistVersion {
    fn from(version: String) -> Self {
        Self::Text(version)
    }
}

/// Persisted data of several slices, keyed by slice name.
///
/// Also the payload of the internal rehydrate action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    slices: BTreeMap<SliceName, Value>,
}

impl Snapshot {
    /// Create an empty snapshot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the data of one slice
    pub fn insert(&mut self, name: SliceName, data: Value) {
        self.slices.insert(name, data);
    }

    /// Builder form of [`Snapshot::insert`]
    #[must_use]
    pub fn with(mut self, name: impl Into<SliceName>, data: Value) -> Self {
        self.insert(name.into(), data);
        self
    }

    /// Data stored for `name`
    #[must_use]
    pub fn get(&self, name: &SliceName) -> Option<&Value> {
        self.slices.get(name)
    }

    /// Remove and return the data stored for `name`
    pub fn take(&mut self, name: &SliceName) -> Option<Value> {
        self.slices.remove(name)
    }

    /// Whether the snapshot names `name`
    #[must_use]
    pub fn contains(&self, name: &SliceName) -> bool {
        self.slices.contains_key(name)
    }

    /// Number of slices in the snapshot
    #[must_use]
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Whether the snapshot is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Iterate slices in name order
    pub fn iter(&self) -> impl Iterator<Item = (&SliceName, &Value)> {
        self.slices.iter()
    }
}

/// The persisted document: a version plus allowlisted slice data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Schema version the envelope was written with
    pub version: PersistVersion,
    /// Slice data keyed by slice name
    #[serde(flatten)]
    pub slices: BTreeMap<String, Value>,
}

impl Envelope {
    /// Create an envelope from a snapshot
    #[must_use]
    pub fn new(version: PersistVersion, snapshot: Snapshot) -> Self {
        Self {
            version,
            slices: snapshot
                .slices
                .into_iter()
                .map(|(name, data)| (name.as_str().to_string(), data))
                .collect(),
        }
    }

    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Serialization`] if a value cannot be encoded.
    pub fn to_json(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Serialization`] if `json` is not an envelope.
    pub fn from_json(json: &str) -> Result<Self, PersistError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Convert the slice part into a [`Snapshot`]
    #[must_use]
    pub fn into_snapshot(self) -> Snapshot {
        Snapshot {
            slices: self
                .slices
                .into_iter()
                .map(|(name, data)| (SliceName::from(name), data))
                .collect(),
        }
    }
}

/// In-memory storage. Clones share one underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    /// Create an empty storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous read, mostly for tests
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Synchronous write, mostly for seeding tests
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.into(), value.into());
    }
}

impl PersistStorage for MemoryStorage {
    fn load<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        let value = self.get(key);
        Box::pin(async move { Ok(value) })
    }

    fn save<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, ()> {
        self.set(key, value);
        Box::pin(async { Ok(()) })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
        Box::pin(async { Ok(()) })
    }
}

/// File-backed storage: `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Store files inside `dir` (created on first save)
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PersistError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');

        if valid {
            Ok(self.dir.join(format!("{key}.json")))
        } else {
            Err(PersistError::InvalidKey(key.to_string()))
        }
    }
}

impl PersistStorage for FileStorage {
    fn load<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => Ok(Some(content)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(PersistError::Io(e)),
            }
        })
    }

    fn save<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&path, value).await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(PersistError::Io(e)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_flattens_slices_next_to_version() {
        let snapshot = Snapshot::new().with("Profile", json!({ "id": 1 }));
        let envelope = Envelope::new(PersistVersion::from(3), snapshot);

        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({ "version": 3, "Profile": { "id": 1 } }));
    }

    #[test]
    fn envelope_accepts_text_versions() {
        let envelope = Envelope::from_json(r#"{"version":"v2","Todo":[1,2]}"#).unwrap();

        assert_eq!(envelope.version, PersistVersion::from("v2"));
        let snapshot = envelope.into_snapshot();
        assert_eq!(snapshot.get(&SliceName::new("Todo")), Some(&json!([1, 2])));
    }

    #[test]
    fn envelope_without_version_is_rejected() {
        assert!(Envelope::from_json(r#"{"Profile":{}}"#).is_err());
    }

    #[tokio::test]
    async fn memory_storage_clones_share_entries() {
        let storage = MemoryStorage::new();
        let other = storage.clone();

        storage.save("root", "{}".to_string()).await.unwrap();
        assert_eq!(other.load("root").await.unwrap().as_deref(), Some("{}"));

        other.remove("root").await.unwrap();
        assert_eq!(storage.load("root").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_storage_round_trip() {
        let dir = std::env::temp_dir().join(format!("modelstore-fs-{}", std::process::id()));
        let storage = FileStorage::new(&dir);

        assert_eq!(storage.load("app").await.unwrap(), None);
        storage.save("app", r#"{"version":1}"#.to_string()).await.unwrap();
        assert_eq!(storage.load("app").await.unwrap().as_deref(), Some(r#"{"version":1}"#));

        storage.remove("app").await.unwrap();
        storage.remove("app").await.unwrap();
        assert_eq!(storage.load("app").await.unwrap(), None);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn file_storage_rejects_path_like_keys() {
        let storage = FileStorage::new("/tmp");
        tokio_test::assert_err!(storage.path_for("../etc/passwd"));
        tokio_test::assert_err!(storage.path_for(""));
        tokio_test::assert_ok!(storage.path_for("app-state_v1"));
    }
}
