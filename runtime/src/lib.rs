//! # Modelstore Runtime
//!
//! The [`Store`] context object that owns the composed root reducer and the
//! dispatch surface.
//!
//! ## Core Components
//!
//! - **Store**: registers models, combines their slice reducers, serializes
//!   dispatches and hands out immutable root snapshots
//! - **Executor**: drives an async operation through prepare, then success or
//!   fail
//! - **Persistence coordinator**: one-time rehydration and debounced writes of
//!   allowlisted slices
//!
//! ## Example
//!
//! ```ignore
//! use modelstore_runtime::{PersistConfig, Store, StoreConfig};
//! use modelstore_core::MemoryStorage;
//!
//! let store = Store::new();
//! store.register(&profile)?;
//!
//! let persist = PersistConfig::new("app", 1, Arc::new(MemoryStorage::new())).allow(&profile);
//! store.create(StoreConfig::default().with_persist(persist)).await?;
//!
//! store.invoke(&get_profile, ()).await?;
//! let data = store.data(&profile)?;
//! ```

/// Async operation executor
pub mod executor;

/// Metric names and recorders
pub mod metrics;

/// Persistence configuration and coordinator
pub mod persist;

/// The store
pub mod store;

pub use executor::Invocation;
pub use persist::{PersistConfig, PersistenceCoordinator, ReadySubscription};
pub use store::Store;

/// Error types for the Store runtime
pub mod error {
    use modelstore_core::{OperationError, PersistError, ReduceError, SliceError};
    use thiserror::Error;

    /// Errors that can occur during Store operations
    #[derive(Error, Debug)]
    pub enum StoreError {
        /// The store was used before `create`/`init`
        #[error("Store is not initialized; call create() first")]
        NotInitialized,

        /// `dispatch` was called from inside a transition
        #[error("Dispatch called while a dispatch is in progress on this thread")]
        ReentrantDispatch,

        /// A typed slice read failed
        #[error(transparent)]
        Slice(#[from] SliceError),

        /// A transition is not deterministic (purity verification only)
        #[error("Transition for {operation} is not deterministic")]
        ImpureTransition {
            /// The offending action type
            operation: String,
        },

        /// A persistence operation returned an error to the caller
        #[error(transparent)]
        Persist(#[from] PersistError),
    }

    impl From<ReduceError> for StoreError {
        fn from(error: ReduceError) -> Self {
            match error {
                ReduceError::ImpureTransition { operation } => Self::ImpureTransition { operation },
            }
        }
    }

    impl From<StoreError> for OperationError {
        fn from(error: StoreError) -> Self {
            Self::new(error.to_string()).with_code("store")
        }
    }
}

/// Store configuration
///
/// # Example
///
/// ```ignore
/// let config = StoreConfig::default()
///     .with_persist(PersistConfig::new("app", 2, storage).allow(&profile))
///     .with_purity_check(cfg!(debug_assertions));
/// ```
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Persistence settings, `None` disables persistence
    pub persist: Option<PersistConfig>,
    /// Apply every transition twice and reject non-deterministic ones
    pub verify_purity: bool,
}

impl StoreConfig {
    /// Enable persistence
    #[must_use]
    pub fn with_persist(mut self, persist: PersistConfig) -> Self {
        self.persist = Some(persist);
        self
    }

    /// Toggle purity verification
    #[must_use]
    pub const fn with_purity_check(mut self, enabled: bool) -> Self {
        self.verify_purity = enabled;
        self
    }
}
