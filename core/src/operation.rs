//! Operation identifiers and action discriminators.
//!
//! Every operation a [`Model`](crate::model::Model) declares receives an
//! [`OperationId`]. Ids are namespaced by the model's slice name, carry the
//! model's per-instance sequence number, and a process-wide serial that makes
//! two declarations with identical names distinct.
//!
//! Dispatched actions are discriminated by [`ActionType`], a closed enum that
//! the slice builder matches exhaustively instead of comparing strings.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide operation serial counter.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Name of a slice in the root state (also the owning model's name).
///
/// Serialized as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceName(Arc<str>);

impl SliceName {
    /// Create a slice name
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Borrow the name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SliceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SliceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for SliceName {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl AsRef<str> for SliceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for SliceName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SliceName {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// Globally unique identifier of a declared operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId {
    model: SliceName,
    name: Arc<str>,
    sequence: u32,
    serial: u64,
}

impl OperationId {
    /// Allocate a new id for operation `name` declared by `model`.
    ///
    /// `sequence` is the model's per-instance declaration counter.
    #[must_use]
    pub fn allocate(model: &SliceName, name: &str, sequence: u32) -> Self {
        Self {
            model: model.clone(),
            name: Arc::from(name),
            sequence,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The declaring model's slice name
    #[must_use]
    pub const fn model(&self) -> &SliceName {
        &self.model
    }

    /// The operation's declared name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position of this declaration within its model (1-based)
    #[must_use]
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.model, self.name, self.sequence)
    }
}

/// Lifecycle phase of an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// The call was issued and is pending
    Prepare,
    /// The call settled with a response
    Success,
    /// The call settled with an error
    Fail,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Success => write!(f, "success"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Discriminator of a dispatched [`Action`](crate::action::Action).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionType {
    /// Store creation. Every slice is materialized from its initial state.
    Init,
    /// Internal persistence write-back of previously saved slices.
    Rehydrate,
    /// A synchronous operation
    Sync(OperationId),
    /// One phase of an asynchronous operation
    Async(OperationId, Phase),
}

impl ActionType {
    /// The operation this action belongs to, if any
    #[must_use]
    pub const fn operation(&self) -> Option<&OperationId> {
        match self {
            Self::Init | Self::Rehydrate => None,
            Self::Sync(id) | Self::Async(id, _) => Some(id),
        }
    }

    /// Whether this action is produced by the store itself
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Init | Self::Rehydrate)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "@@modelstore/init"),
            Self::Rehydrate => write!(f, "@@modelstore/rehydrate"),
            Self::Sync(id) => write!(f, "{id}"),
            Self::Async(id, phase) => write!(f, "{id} {phase}"),
        }
    }
}

/// Key of one keyed sub-instance of an asynchronous operation.
///
/// Implicit tokens and explicit payload field values are both rendered to
/// their string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaKey(String);

impl MetaKey {
    /// Create a key from any displayable value
    #[must_use]
    pub fn new(value: impl fmt::Display) -> Self {
        Self(value.to_string())
    }

    /// Borrow the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MetaKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MetaKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

macro_rules! meta_key_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for MetaKey {
                fn from(value: $ty) -> Self {
                    Self(value.to_string())
                }
            }
        )*
    };
}

meta_key_from_int!(u32, u64, i32, i64, usize);

/// Anything that identifies a declared operation.
///
/// Implemented by the typed operation handles so state accessors can take
/// either a handle or a bare id.
pub trait Operation {
    /// The operation's identifier
    fn id(&self) -> &OperationId;
}

impl Operation for OperationId {
    fn id(&self) -> &OperationId {
        self
    }
}
