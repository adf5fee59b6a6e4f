//! # Modelstore Core
//!
//! Core types for a composable state container.
//!
//! Independent feature modules (models) each own a private slice of one shared
//! state tree and declare how that slice reacts to dispatched operations. This
//! crate holds everything that is pure and synchronous; the runtime crate adds
//! the store, the async executor and persistence.
//!
//! ## Core Concepts
//!
//! - **Model**: a named feature module owning one slice
//! - **Operation**: a declared sync transition, or an async call with
//!   prepare/success/fail phases
//! - **Case table**: per-model lookup from action type to transition
//! - **Slice reducer**: turns a model's case table into a reducer with loading
//!   and error bookkeeping, fanning out over meta keys
//! - **Root state**: the ordered, immutable map of slices; unchanged slices
//!   keep their `Arc`
//!
//! ## Example
//!
//! ```ignore
//! use modelstore_core::*;
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Profile {
//!     id: u32,
//!     name: String,
//! }
//!
//! let mut model = Model::new("Profile", || Profile { id: 1, name: "init".into() });
//!
//! let get_profile = model
//!     .async_operation("getProfile", |_: &()| api.fetch_profile())
//!     .on_success(|data: &mut Profile, _: &(), response: &Profile| *data = response.clone())
//!     .build();
//!
//! let root = combine(&[model.register().unwrap()])
//!     .reduce(None, &Action::init(), ReduceOptions::default(), &())?;
//! assert_eq!(model.connect(&root)?.name, "init");
//! ```

pub use serde::{Deserialize, Serialize};

/// Dispatched actions and their type-erased payloads
pub mod action;

/// Per-model case tables
pub mod case;

/// Root state and slice reducer composition
pub mod composition;

/// Error types
pub mod error;

/// Models and typed operation handles
pub mod model;

/// Operation identifiers and action discriminators
pub mod operation;

/// Persistence storage interface, engines and envelope format
pub mod persist;

/// Slice state and the slice builder
pub mod slice;

pub use action::{Action, Payload};
pub use composition::{CombinedReducer, RootState, StateObserver, combine};
pub use error::{OperationError, PersistError, ReduceError, SliceError};
pub use model::{
    AsyncOperation, AsyncOperationBuilder, Call, FetchHandle, MetaPolicy, Model, SyncOperation,
    is_any_loading,
};
pub use operation::{ActionType, MetaKey, Operation, OperationId, Phase, SliceName};
pub use persist::{
    Envelope, FileStorage, MemoryStorage, PersistStorage, PersistVersion, Snapshot, StorageFuture,
};
pub use slice::{
    AnySlice, Lifecycle, MetaState, ReduceOptions, SliceData, SliceReducer, SliceRef, SliceState,
};
