//! The store: root composition engine and dispatch surface.
//!
//! A [`Store`] owns the list of registered slice reducers, their combination,
//! the committed [`RootState`] and the [`PersistenceCoordinator`]. Dispatches
//! are serialized; reducers run synchronously inside `dispatch`.
//!
//! # Lifecycle
//!
//! ```ignore
//! let store = Store::new();
//! store.register(&profile)?;              // before or after create
//! store.create(StoreConfig::default()).await?;
//! store.dispatch(rename.action("Ada".to_string()))?;
//! ```

use crate::StoreConfig;
use crate::error::StoreError;
use crate::metrics::DispatchMetrics;
use crate::persist::{PersistenceCoordinator, ReadySubscription};
use modelstore_core::{
    Action, CombinedReducer, Model, ReduceOptions, RootState, SliceData, SliceName,
    SliceReducer, SliceRef, SliceState, StateObserver, combine,
};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, ThreadId};
use std::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Engine {
    reducers: Vec<Arc<dyn SliceReducer>>,
    combined: Arc<CombinedReducer>,
    options: ReduceOptions,
}

#[derive(Default)]
struct Inner {
    engine: Mutex<Engine>,
    state: RwLock<Option<Arc<RootState>>>,
    dispatch_lock: Mutex<()>,
    dispatching_on: Mutex<Option<ThreadId>>,
    /// Root being built by the running dispatch
    frame: Mutex<Option<RootState>>,
    persistence: PersistenceCoordinator,
}

/// Exposes the in-progress root and forwards commits to persistence.
struct Commit<'a> {
    frame: &'a Mutex<Option<RootState>>,
    persistence: &'a PersistenceCoordinator,
}

impl StateObserver for Commit<'_> {
    fn on_slice_reduced(&self, name: &SliceName, slice: &SliceRef) {
        if let Some(frame) = lock(self.frame).as_mut() {
            frame.set(name, Arc::clone(slice));
        }
    }

    fn on_state_change(&self, next: &Arc<RootState>, is_internal: bool) {
        self.persistence.update(next, is_internal);
    }
}

/// Held for the duration of one dispatch.
struct DispatchGuard<'a> {
    inner: &'a Inner,
    _serial: MutexGuard<'a, ()>,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.inner.frame) = None;
        *lock(&self.inner.dispatching_on) = None;
    }
}

/// The state container. Clones share the same store.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Inner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("slices", &self.slice_names())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create an empty, uninitialized store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self) -> Result<DispatchGuard<'_>, StoreError> {
        let current = thread::current().id();
        if *lock(&self.inner.dispatching_on) == Some(current) {
            tracing::error!("Dispatch called from inside a transition");
            return Err(StoreError::ReentrantDispatch);
        }

        let serial = lock(&self.inner.dispatch_lock);
        *lock(&self.inner.dispatching_on) = Some(current);
        Ok(DispatchGuard {
            inner: &self.inner,
            _serial: serial,
        })
    }

    fn is_dispatching_here(&self) -> bool {
        *lock(&self.inner.dispatching_on) == Some(thread::current().id())
    }

    fn committed(&self) -> Option<Arc<RootState>> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reduce and commit. Caller holds the dispatch guard.
    fn reduce_locked(
        &self,
        prior: Option<&Arc<RootState>>,
        action: &Action,
    ) -> Result<Arc<RootState>, StoreError> {
        let (combined, options) = {
            let engine = lock(&self.inner.engine);
            (Arc::clone(&engine.combined), engine.options)
        };

        *lock(&self.inner.frame) = Some(prior.map(|root| (**root).clone()).unwrap_or_default());
        let observer = Commit {
            frame: &self.inner.frame,
            persistence: &self.inner.persistence,
        };

        let started = Instant::now();
        let result = combined.reduce(prior, action, options, &observer);
        *lock(&self.inner.frame) = None;
        let next = result?;

        let changed = prior.is_none_or(|prior| !Arc::ptr_eq(prior, &next));
        DispatchMetrics::record(changed, started.elapsed());
        tracing::debug!(changed, slices = next.len(), "Reduced action");

        *self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&next));
        Ok(next)
    }

    /// Register a model's slice.
    ///
    /// Before `create`, the slice is materialized by the init action. After
    /// `create`, the root is recombined and the new slice receives a rehydrate
    /// pass holding only its own persisted data. Registering a name again
    /// swaps the reducer and keeps the current slice.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ReentrantDispatch`] when called from a transition.
    #[tracing::instrument(skip(self, model), fields(model = %model.name()), name = "store_register")]
    pub fn register<D: SliceData>(&self, model: &Model<D>) -> Result<(), StoreError> {
        let Some(reducer) = model.register() else {
            tracing::debug!("Model owns no slice; nothing to register");
            return Ok(());
        };

        let _guard = self.enter()?;
        let name = reducer.name().clone();
        let added = {
            let mut engine = lock(&self.inner.engine);
            let position = engine.reducers.iter().position(|r| r.name() == &name);
            let added = if let Some(index) = position {
                engine.reducers[index] = reducer;
                false
            } else {
                engine.reducers.push(reducer);
                true
            };
            let combined = Arc::new(combine(&engine.reducers));
            engine.combined = combined;
            added
        };

        if !added {
            tracing::debug!("Replaced slice reducer");
            return Ok(());
        }
        let Some(prior) = self.committed() else {
            return Ok(());
        };

        let seeds = self.inner.persistence.take_seeds([&name]);
        tracing::debug!(seeded = !seeds.is_empty(), "Late registration");
        self.reduce_locked(Some(&prior), &Action::rehydrate(seeds))?;
        Ok(())
    }

    /// Apply `config` and materialize every registered slice.
    ///
    /// Does not touch storage; follow with [`rehydrate`](Self::rehydrate), or use
    /// [`create`](Self::create) which does both. Calling it again replaces the
    /// configuration and keeps existing slices.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ReentrantDispatch`] when called from a transition
    /// and [`StoreError::ImpureTransition`] from purity verification.
    #[tracing::instrument(skip(self, config), name = "store_init")]
    pub fn init(&self, config: StoreConfig) -> Result<Arc<RootState>, StoreError> {
        let _guard = self.enter()?;
        lock(&self.inner.engine).options = ReduceOptions {
            verify_purity: config.verify_purity,
        };
        self.inner.persistence.set_config(config.persist);

        let prior = self.committed();
        let next = self.reduce_locked(prior.as_ref(), &Action::init())?;
        tracing::info!(slices = next.len(), "Store initialized");
        Ok(next)
    }

    /// Initialize and rehydrate; resolves once the store is ready.
    ///
    /// # Errors
    ///
    /// Same as [`init`](Self::init) and [`rehydrate`](Self::rehydrate).
    #[tracing::instrument(skip(self, config), name = "store_create")]
    pub async fn create(&self, config: StoreConfig) -> Result<Arc<RootState>, StoreError> {
        self.init(config)?;
        self.rehydrate().await?;
        self.state()
    }

    /// Load persisted data and apply it to slices not rehydrated yet, then
    /// fire the ready notification.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotInitialized`] before `init`/`create`.
    #[tracing::instrument(skip(self), name = "store_rehydrate")]
    pub async fn rehydrate(&self) -> Result<(), StoreError> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }

        let persistence = &self.inner.persistence;
        persistence.load().await;

        let names = self.slice_names();
        let seeds = persistence.take_seeds(&names);
        if !seeds.is_empty() {
            tracing::info!(slices = seeds.len(), "Rehydrating persisted slices");
            self.dispatch(Action::rehydrate(seeds))?;
        }

        persistence.mark_ready(self.committed().as_deref());
        Ok(())
    }

    /// Run `action` through every slice reducer and commit the result.
    ///
    /// Returns the action for chaining.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotInitialized`] before `create`
    /// - [`StoreError::ReentrantDispatch`] from inside a transition
    /// - [`StoreError::ImpureTransition`] from purity verification; the state
    ///   is left as it was
    #[tracing::instrument(skip(self, action), fields(action = %action.kind()), name = "store_dispatch")]
    pub fn dispatch(&self, action: Action) -> Result<Action, StoreError> {
        let _guard = self.enter()?;
        let prior = self.committed().ok_or(StoreError::NotInitialized)?;
        self.reduce_locked(Some(&prior), &action)?;
        Ok(action)
    }

    /// The current root state.
    ///
    /// Read from inside a transition, this is the root being built: slices
    /// already reduced for the running action show their new value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotInitialized`] before `create`.
    pub fn state(&self) -> Result<Arc<RootState>, StoreError> {
        if self.is_dispatching_here() {
            if let Some(frame) = lock(&self.inner.frame).as_ref() {
                return Ok(Arc::new(frame.clone()));
            }
        }
        self.committed().ok_or(StoreError::NotInitialized)
    }

    /// Typed data of a model
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotInitialized`] before `create`, or
    /// [`StoreError::Slice`] if the model has no data or is not registered.
    pub fn data<D: SliceData>(&self, model: &Model<D>) -> Result<Arc<D>, StoreError> {
        Ok(model.connect(&*self.state()?)?)
    }

    /// Typed slice (data plus bookkeeping) of a model
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotInitialized`] before `create`, or
    /// [`StoreError::Slice`] if the model is not registered.
    pub fn slice<D: SliceData>(&self, model: &Model<D>) -> Result<Arc<SliceState<D>>, StoreError> {
        Ok(model.slice(&*self.state()?)?)
    }

    /// Whether `init`/`create` ran
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.committed().is_some()
    }

    /// Registered slice names in registration order
    #[must_use]
    pub fn slice_names(&self) -> Vec<SliceName> {
        lock(&self.inner.engine)
            .reducers
            .iter()
            .map(|reducer| reducer.name().clone())
            .collect()
    }

    /// Run `callback` once after the initial rehydration
    pub fn on_ready(&self, callback: impl FnOnce() + Send + 'static) -> ReadySubscription {
        self.inner.persistence.on_ready(callback)
    }

    /// Wait for the initial rehydration
    pub async fn ready(&self) {
        self.inner.persistence.ready().await;
    }

    /// Write pending persistence changes now
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persist`] if encoding or the backend fails.
    pub async fn flush(&self) -> Result<(), StoreError> {
        Ok(self.inner.persistence.flush().await?)
    }

    /// The persistence coordinator
    #[must_use]
    pub fn persistence(&self) -> &PersistenceCoordinator {
        &self.inner.persistence
    }
}
