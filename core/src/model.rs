//! Models: named feature modules that own one slice of the root state.
//!
//! A [`Model`] declares its operations up front. Each declaration allocates an
//! [`OperationId`] and returns a typed handle ([`SyncOperation`] or
//! [`AsyncOperation`]) used to build actions and read bookkeeping.
//!
//! ```ignore
//! let mut model = Model::new("Profile", || Profile { id: 0, name: String::new() });
//!
//! let rename = model.sync_operation("rename", |data: &mut Profile, name: &String| {
//!     data.name.clone_from(name);
//! });
//!
//! let fetch = model
//!     .async_operation("getProfile", |_: &()| api.profile())
//!     .on_success(|data: &mut Profile, _: &(), response: &Profile| *data = response.clone())
//!     .build();
//! ```
//!
//! [`Model::register`] materializes the declarations into a fresh
//! [`CaseTable`] each time it is called.

use crate::action::{Action, Payload};
use crate::case::{AsyncCase, Case, CaseTable, MetaKind, Transition};
use crate::composition::RootState;
use crate::error::{OperationError, SliceError};
use crate::operation::{ActionType, MetaKey, Operation, OperationId, Phase, SliceName};
use crate::slice::{Initializer, ModelReducer, SliceData, SliceReducer, SliceState};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pending transport call of an asynchronous operation
pub type FetchHandle<R> = BoxFuture<'static, Result<R, OperationError>>;

type Fetch<P, R> = Arc<dyn Fn(&P) -> FetchHandle<R> + Send + Sync>;
type KeyExtractor<P> = Arc<dyn Fn(&P) -> MetaKey + Send + Sync>;

/// Whether any of the given loading flags is set.
#[must_use]
pub fn is_any_loading(flags: &[bool]) -> bool {
    flags.iter().any(|loading| *loading)
}

/// A feature module owning one named slice.
pub struct Model<D: SliceData> {
    name: SliceName,
    initial: Option<Initializer<D>>,
    sequence: u32,
    declarations: Vec<(OperationId, Case<D>)>,
    listeners: Vec<(ActionType, Transition<D>)>,
}

impl<D: SliceData> Model<D> {
    /// Create a model with a data reducer seeded by `initial`
    pub fn new(name: impl Into<SliceName>, initial: impl Fn() -> D + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            initial: Some(Arc::new(initial)),
            sequence: 0,
            declarations: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Create a model that keeps only operation bookkeeping
    pub fn without_data(name: impl Into<SliceName>) -> Self {
        Self {
            name: name.into(),
            initial: None,
            sequence: 0,
            declarations: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// The model's slice name
    #[must_use]
    pub const fn name(&self) -> &SliceName {
        &self.name
    }

    /// Whether the model declares data
    #[must_use]
    pub const fn has_data(&self) -> bool {
        self.initial.is_some()
    }

    /// Ids of every declared operation, in declaration order
    pub fn operations(&self) -> impl Iterator<Item = &OperationId> {
        self.declarations.iter().map(|(id, _)| id)
    }

    fn next_id(&mut self, name: &str) -> OperationId {
        self.sequence += 1;
        OperationId::allocate(&self.name, name, self.sequence)
    }

    /// Declare a synchronous operation
    pub fn sync_operation<P, F>(&mut self, name: &str, transition: F) -> SyncOperation<P>
    where
        P: Any + Send + Sync,
        F: Fn(&mut D, &P) + Send + Sync + 'static,
    {
        let id = self.next_id(name);
        let op = id.clone();
        let erased: Transition<D> = Arc::new(move |data: &mut D, action: &Action| {
            if let Some(payload) = action.payload::<P>() {
                transition(data, payload);
            } else {
                tracing::warn!(operation = %op, "Sync action carries no payload of the declared type");
            }
        });
        self.declarations.push((id.clone(), Case::Sync(erased)));

        SyncOperation {
            id,
            _payload: PhantomData,
        }
    }

    /// Start declaring an asynchronous operation around a transport call
    pub fn async_operation<P, R, F, Fut>(
        &mut self,
        name: &str,
        fetch: F,
    ) -> AsyncOperationBuilder<'_, D, P, R>
    where
        P: Any + Send + Sync,
        R: Any + Send + Sync,
        F: Fn(&P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, OperationError>> + Send + 'static,
    {
        let fetch: Fetch<P, R> = Arc::new(move |payload: &P| fetch(payload).boxed());
        AsyncOperationBuilder {
            name: name.to_string(),
            model: self,
            fetch,
            policy: MetaPolicy::None,
            case: AsyncCase {
                kind: MetaKind::None,
                on_prepare: None,
                on_success: None,
                on_fail: None,
            },
        }
    }

    /// React to any action type with a data-only transition.
    ///
    /// Listeners run after the model's own case for the same action.
    pub fn on<F>(&mut self, kind: ActionType, listener: F) -> &mut Self
    where
        F: Fn(&mut D, &Action) + Send + Sync + 'static,
    {
        self.listeners.push((kind, Arc::new(listener)));
        self
    }

    /// Build this model's slice reducer.
    ///
    /// Returns `None` when the model has no data and no asynchronous
    /// operations, since it would own an empty slice.
    #[must_use]
    pub fn register(&self) -> Option<Arc<dyn SliceReducer>> {
        let has_async = self
            .declarations
            .iter()
            .any(|(_, case)| matches!(case, Case::Async(_)));
        if self.initial.is_none() && !has_async {
            return None;
        }

        let mut table = CaseTable::new();
        for (id, case) in &self.declarations {
            table.add_case(id.clone(), case.clone());
        }
        for (kind, listener) in &self.listeners {
            table.add_listener(kind.clone(), Arc::clone(listener));
        }

        Some(Arc::new(ModelReducer::new(
            self.name.clone(),
            self.initial.clone(),
            table,
        )))
    }

    /// Read this model's data out of a root state
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::NoData`] for models without data, or
    /// [`SliceError::NotRegistered`] if the slice is missing.
    pub fn connect(&self, root: &RootState) -> Result<Arc<D>, SliceError> {
        if self.initial.is_none() {
            return Err(SliceError::NoData(self.name.to_string()));
        }
        root.data::<D>(&self.name)
    }

    /// Read this model's full slice (data plus bookkeeping)
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::NotRegistered`] if the slice is missing.
    pub fn slice(&self, root: &RootState) -> Result<Arc<SliceState<D>>, SliceError> {
        root.slice::<D>(&self.name)
    }
}

impl<D: SliceData> fmt::Debug for Model<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("has_data", &self.initial.is_some())
            .field("operations", &self.declarations.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Handle of a declared synchronous operation.
pub struct SyncOperation<P> {
    id: OperationId,
    _payload: PhantomData<fn(P)>,
}

impl<P> Clone for SyncOperation<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P> fmt::Debug for SyncOperation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SyncOperation").field(&self.id).finish()
    }
}

impl<P: Any + Send + Sync> SyncOperation<P> {
    /// The action type of this operation
    #[must_use]
    pub fn kind(&self) -> ActionType {
        ActionType::Sync(self.id.clone())
    }

    /// Build the action for `payload`
    #[must_use]
    pub fn action(&self, payload: P) -> Action {
        Action::new(self.kind()).with_payload(payload)
    }
}

impl<P> Operation for SyncOperation<P> {
    fn id(&self) -> &OperationId {
        &self.id
    }
}

/// How an asynchronous operation derives the key of an invocation.
pub enum MetaPolicy<P> {
    /// No fan-out: one scalar lifecycle
    None,
    /// A fresh token per invocation
    Implicit,
    /// The value of a payload field
    Field {
        /// Field name, for diagnostics
        name: String,
        /// Reads the field value out of a payload
        extract: KeyExtractor<P>,
    },
}

impl<P> MetaPolicy<P> {
    /// Key invocations by a payload field
    pub fn field<K, F>(name: impl Into<String>, extract: F) -> Self
    where
        K: Into<MetaKey>,
        F: Fn(&P) -> K + Send + Sync + 'static,
    {
        Self::Field {
            name: name.into(),
            extract: Arc::new(move |payload: &P| extract(payload).into()),
        }
    }

    /// The fan-out kind of this policy
    #[must_use]
    pub const fn kind(&self) -> MetaKind {
        match self {
            Self::None => MetaKind::None,
            Self::Implicit => MetaKind::Implicit,
            Self::Field { .. } => MetaKind::Field,
        }
    }
}

impl<P> Clone for MetaPolicy<P> {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Implicit => Self::Implicit,
            Self::Field { name, extract } => Self::Field {
                name: name.clone(),
                extract: Arc::clone(extract),
            },
        }
    }
}

impl<P> fmt::Debug for MetaPolicy<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Implicit => f.write_str("Implicit"),
            Self::Field { name, .. } => f.debug_struct("Field").field("name", name).finish(),
        }
    }
}

/// Builder returned by [`Model::async_operation`].
#[must_use = "call build() to declare the operation"]
pub struct AsyncOperationBuilder<'m, D: SliceData, P, R> {
    name: String,
    model: &'m mut Model<D>,
    fetch: Fetch<P, R>,
    policy: MetaPolicy<P>,
    case: AsyncCase<D>,
}

impl<D, P, R> AsyncOperationBuilder<'_, D, P, R>
where
    D: SliceData,
    P: Any + Send + Sync,
    R: Any + Send + Sync,
{
    /// Set the fan-out policy (defaults to [`MetaPolicy::None`])
    pub fn meta(mut self, policy: MetaPolicy<P>) -> Self {
        self.case.kind = policy.kind();
        self.policy = policy;
        self
    }

    /// Shape data when the call is issued
    pub fn on_prepare<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut D, &P) + Send + Sync + 'static,
    {
        self.case.on_prepare = Some(Arc::new(move |data: &mut D, action: &Action| {
            if let Some(payload) = action.payload::<P>() {
                hook(data, payload);
            }
        }));
        self
    }

    /// Shape data with the response of a successful call
    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut D, &P, &R) + Send + Sync + 'static,
    {
        self.case.on_success = Some(Arc::new(move |data: &mut D, action: &Action| {
            if let (Some(payload), Some(response)) = (action.payload::<P>(), action.response::<R>())
            {
                hook(data, payload, response);
            }
        }));
        self
    }

    /// Shape data after a failed call
    pub fn on_fail<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut D, &P, &OperationError) + Send + Sync + 'static,
    {
        self.case.on_fail = Some(Arc::new(move |data: &mut D, action: &Action| {
            let Some(payload) = action.payload::<P>() else {
                return;
            };
            match action.error() {
                Some(error) => hook(data, payload, error),
                None => hook(data, payload, &OperationError::unspecified()),
            }
        }));
        self
    }

    /// Finish the declaration
    pub fn build(self) -> AsyncOperation<P, R> {
        let id = self.model.next_id(&self.name);
        self.model
            .declarations
            .push((id.clone(), Case::Async(self.case)));

        AsyncOperation {
            inner: Arc::new(AsyncInner {
                id,
                fetch: self.fetch,
                policy: self.policy,
                tokens: AtomicU64::new(0),
            }),
        }
    }
}

struct AsyncInner<P, R> {
    id: OperationId,
    fetch: Fetch<P, R>,
    policy: MetaPolicy<P>,
    tokens: AtomicU64,
}

/// Handle of a declared asynchronous operation.
pub struct AsyncOperation<P, R> {
    inner: Arc<AsyncInner<P, R>>,
}

impl<P, R> Clone for AsyncOperation<P, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, R> fmt::Debug for AsyncOperation<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("id", &self.inner.id)
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl<P, R> Operation for AsyncOperation<P, R> {
    fn id(&self) -> &OperationId {
        &self.inner.id
    }
}

impl<P, R> AsyncOperation<P, R>
where
    P: Any + Send + Sync,
    R: Any + Send + Sync,
{
    /// The action type of one phase
    #[must_use]
    pub fn phase(&self, phase: Phase) -> ActionType {
        ActionType::Async(self.inner.id.clone(), phase)
    }

    /// The fan-out policy
    #[must_use]
    pub fn policy(&self) -> &MetaPolicy<P> {
        &self.inner.policy
    }

    /// Prepare one invocation: derive its key and wrap the payload.
    ///
    /// Implicit tokens are taken here, so every call gets a fresh key even if
    /// it never settles.
    #[must_use]
    pub fn call(&self, payload: P) -> Call<P, R> {
        let key = match &self.inner.policy {
            MetaPolicy::None => None,
            MetaPolicy::Implicit => {
                let token = self.inner.tokens.fetch_add(1, Ordering::Relaxed) + 1;
                Some(MetaKey::from(token))
            },
            MetaPolicy::Field { extract, .. } => Some(extract(&payload)),
        };

        Call {
            operation: self.clone(),
            payload: Arc::new(payload),
            key,
        }
    }
}

/// One invocation of an asynchronous operation.
///
/// Builds the three phase actions sharing one payload and key, and starts the
/// transport call. The executor in the runtime drives these for you; tests
/// can dispatch them by hand.
pub struct Call<P, R> {
    operation: AsyncOperation<P, R>,
    payload: Arc<P>,
    key: Option<MetaKey>,
}

impl<P, R> fmt::Debug for Call<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("operation", &self.operation.inner.id)
            .field("key", &self.key)
            .finish()
    }
}

impl<P, R> Call<P, R>
where
    P: Any + Send + Sync,
    R: Any + Send + Sync,
{
    /// The invocation's meta key (`None` for scalar operations)
    #[must_use]
    pub const fn key(&self) -> Option<&MetaKey> {
        self.key.as_ref()
    }

    /// The invocation's payload
    #[must_use]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// The operation this call belongs to
    #[must_use]
    pub const fn operation(&self) -> &AsyncOperation<P, R> {
        &self.operation
    }

    fn phase_action(&self, phase: Phase) -> Action {
        let payload: Payload = Arc::clone(&self.payload) as Payload;
        let action = Action::new(self.operation.phase(phase)).with_shared_payload(payload);
        match &self.key {
            Some(key) => action.with_meta(key.clone()),
            None => action,
        }
    }

    /// The prepare-phase action
    #[must_use]
    pub fn prepare_action(&self) -> Action {
        self.phase_action(Phase::Prepare)
    }

    /// The success-phase action carrying `response`
    #[must_use]
    pub fn success_action(&self, response: R) -> Action {
        self.phase_action(Phase::Success).with_response(response)
    }

    /// The fail-phase action carrying `error`
    #[must_use]
    pub fn fail_action(&self, error: OperationError) -> Action {
        self.phase_action(Phase::Fail).with_error(error)
    }

    /// Start the transport call
    #[must_use]
    pub fn fetch(&self) -> FetchHandle<R> {
        (self.operation.inner.fetch)(&self.payload)
    }
}
