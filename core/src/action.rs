//! Dispatched actions.
//!
//! An [`Action`] is the single input type of every slice reducer. It carries
//! its [`ActionType`] discriminator plus type-erased payload and, for
//! asynchronous phases, the meta key and the response or error.
//!
//! Typed operation handles build actions for you; reducers read the typed
//! values back with [`Action::payload`] and [`Action::response`].

use crate::error::OperationError;
use crate::operation::{ActionType, MetaKey};
use crate::persist::Snapshot;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Type-erased, shareable action value
pub type Payload = Arc<dyn Any + Send + Sync>;

/// A dispatched action.
#[derive(Clone)]
pub struct Action {
    kind: ActionType,
    payload: Option<Payload>,
    meta: Option<MetaKey>,
    response: Option<Payload>,
    error: Option<OperationError>,
}

impl Action {
    /// Create an action with no payload
    #[must_use]
    pub const fn new(kind: ActionType) -> Self {
        Self {
            kind,
            payload: None,
            meta: None,
            response: None,
            error: None,
        }
    }

    /// The store-creation action
    #[must_use]
    pub const fn init() -> Self {
        Self::new(ActionType::Init)
    }

    /// The internal rehydrate action carrying persisted slice data
    #[must_use]
    pub fn rehydrate(snapshot: Snapshot) -> Self {
        Self::new(ActionType::Rehydrate).with_payload(snapshot)
    }

    /// Attach a payload value
    #[must_use]
    pub fn with_payload<P: Any + Send + Sync>(self, payload: P) -> Self {
        self.with_shared_payload(Arc::new(payload))
    }

    /// Attach an already shared payload (used to reuse one payload across phases)
    #[must_use]
    pub fn with_shared_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach the meta key of a keyed invocation
    #[must_use]
    pub fn with_meta(mut self, key: MetaKey) -> Self {
        self.meta = Some(key);
        self
    }

    /// Attach the response of a settled call
    #[must_use]
    pub fn with_response<R: Any + Send + Sync>(mut self, response: R) -> Self {
        self.response = Some(Arc::new(response));
        self
    }

    /// Attach the error of a failed call
    #[must_use]
    pub fn with_error(mut self, error: OperationError) -> Self {
        self.error = Some(error);
        self
    }

    /// The discriminator
    #[must_use]
    pub const fn kind(&self) -> &ActionType {
        &self.kind
    }

    /// The payload, if present and of type `P`
    #[must_use]
    pub fn payload<P: Any>(&self) -> Option<&P> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<P>())
    }

    /// The response, if present and of type `R`
    #[must_use]
    pub fn response<R: Any>(&self) -> Option<&R> {
        self.response.as_deref().and_then(|r| r.downcast_ref::<R>())
    }

    /// The error of a fail phase
    #[must_use]
    pub const fn error(&self) -> Option<&OperationError> {
        self.error.as_ref()
    }

    /// The meta key of a keyed invocation
    #[must_use]
    pub const fn meta(&self) -> Option<&MetaKey> {
        self.meta.as_ref()
    }

    /// Whether the store produced this action itself
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        self.kind.is_internal()
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.kind)
            .field("payload", &self.payload.as_ref().map(|_| "<payload>"))
            .field("meta", &self.meta)
            .field("response", &self.response.as_ref().map(|_| "<response>"))
            .field("error", &self.error)
            .finish()
    }
}
