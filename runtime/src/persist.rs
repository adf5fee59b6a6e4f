//! Persistence coordinator.
//!
//! Watches committed root states and writes the data of allowlisted slices to
//! a [`PersistStorage`] backend, and rehydrates those slices once when the
//! store starts.
//!
//! # Lifecycle
//!
//! 1. [`PersistenceCoordinator::set_config`] on every `create`
//! 2. [`PersistenceCoordinator::load`] reads the envelope once per config. A
//!    version mismatch removes the stored key and starts cold.
//! 3. [`PersistenceCoordinator::take_seeds`] hands out persisted data for
//!    slices that were not rehydrated yet, marking them as done
//! 4. [`PersistenceCoordinator::mark_ready`] records the baseline and fires the
//!    ready notification (once per store lifetime)
//! 5. [`PersistenceCoordinator::update`] schedules one debounced write per
//!    burst of changes; [`PersistenceCoordinator::flush`] writes right away
//!
//! Writes never overlap: each one holds the write lock while it builds and
//! saves the envelope, and takes the newest pending root once it has the lock.
//! A write also loads the envelope first when a new config has not been read
//! yet, so data of slices that are not registered is carried over.
//!
//! Storage failures are logged and counted. None of them fail a dispatch.

use crate::metrics::PersistMetrics;
use modelstore_core::{
    Envelope, Model, PersistError, PersistStorage, PersistVersion, RootState, SliceData,
    SliceName, SliceRef, Snapshot,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// Storage key used when none is configured
pub const DEFAULT_KEY: &str = "modelstore";

/// Delay between the first change of a burst and the write
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Persistence settings.
///
/// # Example
///
/// ```ignore
/// let persist = PersistConfig::new("app", 3, Arc::new(FileStorage::new(".state")))
///     .allow(&profile)
///     .allow(&settings)
///     .with_debounce(Duration::from_millis(250));
/// ```
#[derive(Clone)]
pub struct PersistConfig {
    /// Envelope schema version; a stored envelope with another version is discarded
    pub version: PersistVersion,
    /// Storage key of the envelope
    pub key: String,
    /// Slices whose data is persisted
    pub allowlist: Vec<SliceName>,
    /// Write delay after a change
    pub debounce: Duration,
    /// Backend
    pub storage: Arc<dyn PersistStorage>,
}

impl PersistConfig {
    /// Create a config with an empty allowlist
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        version: impl Into<PersistVersion>,
        storage: Arc<dyn PersistStorage>,
    ) -> Self {
        Self {
            version: version.into(),
            key: key.into(),
            allowlist: Vec::new(),
            debounce: DEFAULT_DEBOUNCE,
            storage,
        }
    }

    /// Read key, version and debounce from the environment.
    ///
    /// - `MODELSTORE_PERSIST_KEY` (default `modelstore`)
    /// - `MODELSTORE_PERSIST_VERSION`, numeric or text (default `1`)
    /// - `MODELSTORE_PERSIST_DEBOUNCE_MS` (default 100)
    #[must_use]
    pub fn from_env(storage: Arc<dyn PersistStorage>) -> Self {
        let key = std::env::var("MODELSTORE_PERSIST_KEY").unwrap_or_else(|_| DEFAULT_KEY.to_string());
        let version = std::env::var("MODELSTORE_PERSIST_VERSION")
            .map_or(PersistVersion::Number(1), |raw| {
                raw.parse::<i64>()
                    .map_or_else(|_| PersistVersion::Text(raw), PersistVersion::Number)
            });
        let debounce = std::env::var("MODELSTORE_PERSIST_DEBOUNCE_MS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map_or(DEFAULT_DEBOUNCE, Duration::from_millis);

        Self::new(key, version, storage).with_debounce(debounce)
    }

    /// Persist the data of `model`
    #[must_use]
    pub fn allow<D: SliceData>(self, model: &Model<D>) -> Self {
        self.allow_name(model.name().clone())
    }

    /// Persist the data of the slice named `name`
    #[must_use]
    pub fn allow_name(mut self, name: impl Into<SliceName>) -> Self {
        let name = name.into();
        if !self.allowlist.contains(&name) {
            self.allowlist.push(name);
        }
        self
    }

    /// Set the write delay
    #[must_use]
    pub const fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    fn allows(&self, name: &SliceName) -> bool {
        self.allowlist.contains(name)
    }
}

impl fmt::Debug for PersistConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistConfig")
            .field("version", &self.version)
            .field("key", &self.key)
            .field("allowlist", &self.allowlist)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

type ReadyCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CoordinatorState {
    config: Option<PersistConfig>,
    loaded: bool,
    persisted: Snapshot,
    rehydrated: HashSet<SliceName>,
    baseline: Vec<(SliceName, SliceRef)>,
    pending: Option<Arc<RootState>>,
    scheduled: bool,
    ready: bool,
    next_callback: u64,
    callbacks: Vec<(u64, ReadyCallback)>,
}

struct Shared {
    state: Mutex<CoordinatorState>,
    load_lock: tokio::sync::Mutex<()>,
    write_lock: tokio::sync::Mutex<()>,
    ready_tx: watch::Sender<bool>,
}

/// Coordinates rehydration and debounced writes. Clones share state.
#[derive(Clone)]
pub struct PersistenceCoordinator {
    shared: Arc<Shared>,
}

impl Default for PersistenceCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PersistenceCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("PersistenceCoordinator")
            .field("config", &state.config)
            .field("loaded", &state.loaded)
            .field("ready", &state.ready)
            .field("rehydrated", &state.rehydrated)
            .finish_non_exhaustive()
    }
}

impl PersistenceCoordinator {
    /// Create an unconfigured coordinator
    #[must_use]
    pub fn new() -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CoordinatorState::default()),
                load_lock: tokio::sync::Mutex::new(()),
                write_lock: tokio::sync::Mutex::new(()),
                ready_tx,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the configuration; the envelope is loaded again on next `load`
    pub fn set_config(&self, config: Option<PersistConfig>) {
        let mut state = self.lock();
        state.config = config;
        state.loaded = false;
        state.persisted = Snapshot::new();
    }

    /// Whether allowlisted slices are persisted at all
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.lock().config.is_some()
    }

    /// Whether the initial rehydration finished
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Load the envelope for the current config (no-op once loaded).
    ///
    /// Load failures and unreadable envelopes count as "nothing persisted".
    pub async fn load(&self) {
        let _loading = self.shared.load_lock.lock().await;

        let config = {
            let mut state = self.lock();
            if state.loaded {
                return;
            }
            let Some(config) = state.config.clone() else {
                state.loaded = true;
                return;
            };
            config
        };

        let persisted = read_envelope(&config).await;

        let mut state = self.lock();
        state.loaded = true;
        state.persisted = Snapshot::new();
        for (name, data) in persisted.iter() {
            if config.allows(name) {
                state.persisted.insert(name.clone(), data.clone());
            }
        }
        tracing::debug!(
            key = %config.key,
            slices = state.persisted.len(),
            "Loaded persisted envelope"
        );
    }

    /// Persisted data for the given slices that were not rehydrated yet.
    ///
    /// Every slice returned is marked as rehydrated and never returned again.
    /// Empty until [`load`](Self::load) finished.
    pub fn take_seeds<'a>(&self, names: impl IntoIterator<Item = &'a SliceName>) -> Snapshot {
        let mut state = self.lock();
        let mut seeds = Snapshot::new();
        if !state.loaded {
            return seeds;
        }

        for name in names {
            if state.rehydrated.contains(name) {
                continue;
            }
            if let Some(data) = state.persisted.get(name).cloned() {
                state.rehydrated.insert(name.clone());
                seeds.insert(name.clone(), data);
            }
        }

        if !seeds.is_empty() {
            PersistMetrics::record_rehydrated(seeds.len());
        }
        seeds
    }

    /// Finish the initial rehydration.
    ///
    /// `current` becomes the baseline that later updates are compared with.
    /// Ready callbacks run on the first call only.
    pub fn mark_ready(&self, current: Option<&RootState>) {
        let callbacks = {
            let mut state = self.lock();
            let baseline = current
                .map(|root| allowed_slices(&state, root))
                .unwrap_or_default();
            state.baseline = baseline;
            if state.ready {
                return;
            }
            state.ready = true;
            std::mem::take(&mut state.callbacks)
        };

        self.shared.ready_tx.send_replace(true);
        tracing::debug!(callbacks = callbacks.len(), "Store is ready");
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Run `callback` once the store is ready (immediately if it already is)
    pub fn on_ready(&self, callback: impl FnOnce() + Send + 'static) -> ReadySubscription {
        let mut state = self.lock();
        if state.ready {
            drop(state);
            callback();
            return ReadySubscription {
                id: None,
                shared: Weak::new(),
            };
        }

        state.next_callback += 1;
        let id = state.next_callback;
        state.callbacks.push((id, Box::new(callback)));
        ReadySubscription {
            id: Some(id),
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Wait until the store is ready
    pub async fn ready(&self) {
        let mut ready = self.shared.ready_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Observe a committed root state.
    ///
    /// Ignored before ready, for internal actions, and when no allowlisted
    /// slice changed since the last scheduled write.
    pub fn update(&self, next: &Arc<RootState>, is_internal: bool) {
        if is_internal {
            return;
        }

        let mut state = self.lock();
        if !state.ready {
            tracing::trace!("Store not ready; persistence update ignored");
            return;
        }
        let Some(debounce) = state.config.as_ref().map(|config| config.debounce) else {
            return;
        };

        let current = allowed_slices(&state, next);
        let unchanged = current.len() == state.baseline.len()
            && current
                .iter()
                .zip(&state.baseline)
                .all(|((a, x), (b, y))| a == b && Arc::ptr_eq(x, y));
        if unchanged {
            return;
        }

        state.baseline = current;
        state.pending = Some(Arc::clone(next));
        if state.scheduled {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                state.scheduled = true;
                let coordinator = self.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(debounce).await;
                    if let Err(error) = coordinator.flush().await {
                        tracing::warn!(%error, "Debounced persistence write failed");
                    }
                });
            },
            Err(_) => {
                tracing::warn!("No tokio runtime; persistence write deferred until flush()");
            },
        }
    }

    /// Write the pending snapshot now.
    ///
    /// Waits for a write already in progress, then writes whatever is pending
    /// at that point.
    ///
    /// # Errors
    ///
    /// Returns the [`PersistError`] of the encoder or the backend. The
    /// pending snapshot is dropped either way.
    pub async fn flush(&self) -> Result<(), PersistError> {
        let _writing = self.shared.write_lock.lock().await;
        self.load().await;

        let (root, config, unclaimed) = {
            let mut state = self.lock();
            state.scheduled = false;
            let Some(root) = state.pending.take() else {
                return Ok(());
            };
            let Some(config) = state.config.clone() else {
                return Ok(());
            };
            // Persisted data of slices that have not registered yet survives the write.
            let unclaimed: Vec<_> = state
                .persisted
                .iter()
                .filter(|(name, _)| !state.rehydrated.contains(*name))
                .map(|(name, data)| (name.clone(), data.clone()))
                .collect();
            (root, config, unclaimed)
        };

        let mut snapshot = Snapshot::new();
        for (name, data) in unclaimed {
            if root.get(&name).is_none() {
                snapshot.insert(name, data);
            }
        }
        for name in &config.allowlist {
            if let Some(data) = root.get(name).map(|slice| slice.data_json()).transpose()?.flatten() {
                snapshot.insert(name.clone(), data);
            }
        }

        let json = Envelope::new(config.version.clone(), snapshot).to_json()?;
        match config.storage.save(&config.key, json).await {
            Ok(()) => {
                PersistMetrics::record_write();
                tracing::debug!(key = %config.key, "Persisted envelope");
                Ok(())
            },
            Err(error) => {
                PersistMetrics::record_write_failure();
                tracing::warn!(key = %config.key, %error, "Failed to persist envelope");
                Err(error)
            },
        }
    }
}

fn allowed_slices(state: &CoordinatorState, root: &RootState) -> Vec<(SliceName, SliceRef)> {
    let Some(config) = state.config.as_ref() else {
        return Vec::new();
    };
    root.iter()
        .filter(|(name, _)| config.allows(name))
        .map(|(name, slice)| (name.clone(), Arc::clone(slice)))
        .collect()
}

async fn read_envelope(config: &PersistConfig) -> Snapshot {
    let raw = match config.storage.load(&config.key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Snapshot::new(),
        Err(error) => {
            tracing::warn!(key = %config.key, %error, "Failed to load persisted envelope");
            return Snapshot::new();
        },
    };

    let envelope = match Envelope::from_json(&raw) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::warn!(key = %config.key, %error, "Ignoring unreadable persisted envelope");
            return Snapshot::new();
        },
    };

    if envelope.version != config.version {
        tracing::info!(
            key = %config.key,
            stored = %envelope.version,
            expected = %config.version,
            "Persisted envelope has another version; starting cold"
        );
        if let Err(error) = config.storage.remove(&config.key).await {
            tracing::warn!(key = %config.key, %error, "Failed to remove outdated envelope");
        }
        return Snapshot::new();
    }

    envelope.into_snapshot()
}

/// Handle of a pending ready callback.
#[derive(Debug)]
pub struct ReadySubscription {
    id: Option<u64>,
    shared: Weak<Shared>,
}

impl ReadySubscription {
    /// Drop the callback if it has not run yet
    pub fn unsubscribe(self) {
        let (Some(id), Some(shared)) = (self.id, self.shared.upgrade()) else {
            return;
        };
        shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .retain(|(existing, _)| *existing != id);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use modelstore_core::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(storage: &MemoryStorage) -> PersistConfig {
        PersistConfig::new("app", 2, Arc::new(storage.clone())).allow_name("Profile")
    }

    #[tokio::test]
    async fn version_mismatch_removes_the_key() {
        let storage = MemoryStorage::new();
        storage.set("app", r#"{"version":1,"Profile":{"id":9}}"#);

        let coordinator = PersistenceCoordinator::new();
        coordinator.set_config(Some(config(&storage)));
        coordinator.load().await;

        assert!(coordinator.take_seeds([&SliceName::new("Profile")]).is_empty());
        assert_eq!(storage.get("app"), None);
    }

    #[tokio::test]
    async fn seeds_are_handed_out_once_and_only_for_allowlisted_slices() {
        let storage = MemoryStorage::new();
        storage.set("app", r#"{"version":2,"Profile":{"id":9},"Secret":{"token":"x"}}"#);

        let coordinator = PersistenceCoordinator::new();
        coordinator.set_config(Some(config(&storage)));
        let profile = SliceName::new("Profile");
        let secret = SliceName::new("Secret");

        assert!(coordinator.take_seeds([&profile]).is_empty());
        coordinator.load().await;

        let seeds = coordinator.take_seeds([&profile, &secret]);
        assert_eq!(seeds.get(&profile), Some(&json!({ "id": 9 })));
        assert!(!seeds.contains(&secret));
        assert!(coordinator.take_seeds([&profile]).is_empty());
    }

    #[tokio::test]
    async fn unreadable_envelope_counts_as_empty() {
        let storage = MemoryStorage::new();
        storage.set("app", "not json");

        let coordinator = PersistenceCoordinator::new();
        coordinator.set_config(Some(config(&storage)));
        coordinator.load().await;

        assert!(coordinator.take_seeds([&SliceName::new("Profile")]).is_empty());
        assert_eq!(storage.get("app").as_deref(), Some("not json"));
    }

    #[test]
    fn ready_callbacks_fire_once_and_can_unsubscribe() {
        let coordinator = PersistenceCoordinator::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let _kept = coordinator.on_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&fired);
        coordinator
            .on_ready(move || {
                counter.fetch_add(10, Ordering::SeqCst);
            })
            .unsubscribe();

        coordinator.mark_ready(None);
        coordinator.mark_ready(None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&fired);
        let _late = coordinator.on_ready(move || {
            counter.fetch_add(100, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 101);
    }

    #[tokio::test]
    async fn ready_future_resolves_after_mark_ready() {
        let coordinator = PersistenceCoordinator::new();
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ready().await })
        };

        coordinator.mark_ready(None);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(coordinator.is_ready());
    }

    #[test]
    fn from_env_falls_back_to_defaults() {
        let config = PersistConfig::from_env(Arc::new(MemoryStorage::new()));

        // The variables are not set in the test environment.
        if std::env::var_os("MODELSTORE_PERSIST_KEY").is_none() {
            assert_eq!(config.key, DEFAULT_KEY);
        }
        if std::env::var_os("MODELSTORE_PERSIST_DEBOUNCE_MS").is_none() {
            assert_eq!(config.debounce, DEFAULT_DEBOUNCE);
        }
        assert!(config.allowlist.is_empty());
    }
}
