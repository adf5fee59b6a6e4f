//! Slice state and the slice builder.
//!
//! Each model owns one slice of the root state: its `data` plus one
//! [`MetaState`] per asynchronous operation holding the `loading`/`error`
//! bookkeeping. A [`ModelReducer`] turns the model's [`CaseTable`] into a
//! reducer for that slice.
//!
//! # Change detection
//!
//! Reducers never mutate the prior slice. A transition runs on a clone of the
//! prior data (a draft); if the draft ends up equal to the prior data and the
//! bookkeeping did not move, the reducer hands back the very same `Arc`. The
//! root composition relies on `Arc::ptr_eq` to notice that nothing changed.

use crate::action::Action;
use crate::case::{AsyncCase, CaseTable, MetaKind, Matched, Transition};
use crate::error::{OperationError, PersistError, ReduceError};
use crate::operation::{ActionType, MetaKey, Operation, OperationId, Phase, SliceName};
use crate::persist::Snapshot;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Requirements on a model's data type.
///
/// `PartialEq` drives "did anything change" detection, serde drives
/// persistence.
pub trait SliceData:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> SliceData for T where
    T: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Factory for a model's cold-start data
pub type Initializer<D> = Arc<dyn Fn() -> D + Send + Sync>;

/// Loading/error bookkeeping of one (operation, key) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lifecycle {
    /// A call is in flight
    pub loading: bool,
    /// The last settled call failed with this error
    pub error: Option<OperationError>,
}

impl Lifecycle {
    /// State after the prepare phase
    #[must_use]
    pub const fn pending() -> Self {
        Self {
            loading: true,
            error: None,
        }
    }

    /// State after a success (`None`) or failure (`Some`)
    #[must_use]
    pub const fn settled(error: Option<OperationError>) -> Self {
        Self {
            loading: false,
            error,
        }
    }
}

/// Bookkeeping of one asynchronous operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaState {
    /// Policy `None`: a single shared lifecycle
    Scalar(Lifecycle),
    /// Keyed policies: one lifecycle per key; absent keys were never invoked.
    ///
    /// Entries are shared between successive states, so a phase on one key
    /// copies pointers for the others.
    Keyed(BTreeMap<MetaKey, Arc<Lifecycle>>),
}

impl MetaState {
    /// Empty bookkeeping for a fan-out policy
    #[must_use]
    pub fn for_kind(kind: MetaKind) -> Self {
        if kind.is_keyed() {
            Self::Keyed(BTreeMap::new())
        } else {
            Self::Scalar(Lifecycle::default())
        }
    }

    /// Whether any call of this operation is in flight
    #[must_use]
    pub fn is_loading(&self) -> bool {
        match self {
            Self::Scalar(lifecycle) => lifecycle.loading,
            Self::Keyed(keys) => keys.values().any(|l| l.loading),
        }
    }

    /// Lifecycle for a key; scalar bookkeeping ignores the key
    #[must_use]
    pub fn lifecycle(&self, key: &MetaKey) -> Option<&Lifecycle> {
        match self {
            Self::Scalar(lifecycle) => Some(lifecycle),
            Self::Keyed(keys) => keys.get(key).map(AsRef::as_ref),
        }
    }

    /// Keys seen so far (empty for scalar bookkeeping)
    pub fn keys(&self) -> impl Iterator<Item = &MetaKey> {
        let keys = match self {
            Self::Scalar(_) => None,
            Self::Keyed(keys) => Some(keys.keys()),
        };
        keys.into_iter().flatten()
    }

    fn with(&self, key: Option<&MetaKey>, next: Lifecycle) -> Option<Self> {
        match self {
            Self::Scalar(current) => (*current != next).then_some(Self::Scalar(next)),
            Self::Keyed(keys) => {
                let key = key?;
                if keys.get(key).is_some_and(|current| **current == next) {
                    return None;
                }
                let mut keys = keys.clone();
                keys.insert(key.clone(), Arc::new(next));
                Some(Self::Keyed(keys))
            },
        }
    }
}

/// State of one model's slice.
#[derive(Debug)]
pub struct SliceState<D> {
    name: SliceName,
    data: Option<Arc<D>>,
    meta: HashMap<OperationId, Arc<MetaState>>,
}

impl<D> Clone for SliceState<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            data: self.data.clone(),
            meta: self.meta.clone(),
        }
    }
}

impl<D> SliceState<D> {
    /// The slice's name
    #[must_use]
    pub const fn name(&self) -> &SliceName {
        &self.name
    }

    /// The model's data, `None` for models without a data reducer
    #[must_use]
    pub fn data(&self) -> Option<&D> {
        self.data.as_deref()
    }

    /// The shared data snapshot
    #[must_use]
    pub const fn data_arc(&self) -> Option<&Arc<D>> {
        self.data.as_ref()
    }

    /// Replace the data, keeping bookkeeping
    #[must_use]
    pub fn with_data(mut self, data: D) -> Self {
        self.data = Some(Arc::new(data));
        self
    }

    /// Bookkeeping of an asynchronous operation
    #[must_use]
    pub fn meta(&self, operation: &impl Operation) -> Option<&MetaState> {
        self.meta.get(operation.id()).map(AsRef::as_ref)
    }

    /// Whether any call of the operation is in flight
    #[must_use]
    pub fn loading(&self, operation: &impl Operation) -> bool {
        self.meta(operation).is_some_and(MetaState::is_loading)
    }

    /// Whether the call keyed by `key` is in flight
    #[must_use]
    pub fn loading_for(&self, operation: &impl Operation, key: impl Into<MetaKey>) -> bool {
        let key = key.into();
        self.meta(operation)
            .and_then(|m| m.lifecycle(&key))
            .is_some_and(|l| l.loading)
    }

    /// Error of the last scalar call (always `None` for keyed operations)
    #[must_use]
    pub fn error(&self, operation: &impl Operation) -> Option<&OperationError> {
        match self.meta(operation) {
            Some(MetaState::Scalar(lifecycle)) => lifecycle.error.as_ref(),
            Some(MetaState::Keyed(_)) | None => None,
        }
    }

    /// Error of the last call keyed by `key`
    #[must_use]
    pub fn error_for(
        &self,
        operation: &impl Operation,
        key: impl Into<MetaKey>,
    ) -> Option<&OperationError> {
        let key = key.into();
        self.meta(operation)
            .and_then(|m| m.lifecycle(&key))
            .and_then(|l| l.error.as_ref())
    }
}

/// Type-erased slice stored in the root state.
pub trait AnySlice: Send + Sync + fmt::Debug {
    /// The slice's name
    fn name(&self) -> &SliceName;

    /// Borrow as `Any` for typed reads
    fn as_any(&self) -> &dyn Any;

    /// Convert into a shareable `Any` for typed `Arc` reads
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Whether the slice carries model data
    fn has_data(&self) -> bool;

    /// The data part encoded as JSON, `None` for models without data
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Serialization`] if the data cannot be encoded.
    fn data_json(&self) -> Result<Option<Value>, PersistError>;
}

impl<D: SliceData> AnySlice for SliceState<D> {
    fn name(&self) -> &SliceName {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn has_data(&self) -> bool {
        self.data.is_some()
    }

    fn data_json(&self) -> Result<Option<Value>, PersistError> {
        self.data
            .as_deref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(PersistError::from)
    }
}

/// Shared handle to a slice in the root state
pub type SliceRef = Arc<dyn AnySlice>;

/// Knobs applied while reducing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReduceOptions {
    /// Run every matched transition twice and compare the results
    pub verify_purity: bool,
}

/// Reducer for one named slice.
pub trait SliceReducer: Send + Sync {
    /// The slice this reducer owns
    fn name(&self) -> &SliceName;

    /// Compute the next slice.
    ///
    /// `prior` is `None` when the slice does not exist yet; the reducer then
    /// starts from its initial state. Returning a clone of `prior` (same
    /// pointer) means "unchanged".
    ///
    /// # Errors
    ///
    /// Returns [`ReduceError::ImpureTransition`] when purity verification is
    /// enabled and a transition is not deterministic.
    fn reduce(
        &self,
        prior: Option<&SliceRef>,
        action: &Action,
        options: ReduceOptions,
    ) -> Result<SliceRef, ReduceError>;
}

/// Slice builder output: the reducer of one model.
pub struct ModelReducer<D: SliceData> {
    name: SliceName,
    initial: Option<Initializer<D>>,
    table: CaseTable<D>,
}

impl<D: SliceData> ModelReducer<D> {
    /// Build a reducer from a case table
    #[must_use]
    pub const fn new(name: SliceName, initial: Option<Initializer<D>>, table: CaseTable<D>) -> Self {
        Self {
            name,
            initial,
            table,
        }
    }

    /// The slice as it exists before any action
    #[must_use]
    pub fn initial_state(&self) -> SliceState<D> {
        SliceState {
            name: self.name.clone(),
            data: self.initial.as_ref().map(|init| Arc::new(init())),
            meta: self
                .table
                .async_operations()
                .map(|(id, kind)| (id.clone(), Arc::new(MetaState::for_kind(kind))))
                .collect(),
        }
    }

    /// The case table backing this reducer
    #[must_use]
    pub const fn table(&self) -> &CaseTable<D> {
        &self.table
    }

    fn transition(
        &self,
        state: &SliceState<D>,
        action: &Action,
        options: ReduceOptions,
    ) -> Result<Option<SliceState<D>>, ReduceError> {
        if matches!(action.kind(), ActionType::Rehydrate) {
            return Ok(self.rehydrate(state, action));
        }

        let matched = self.table.lookup(action.kind());
        let listeners = self.table.listeners(action.kind());
        if matched.is_none() && listeners.is_empty() {
            return Ok(None);
        }

        let mut draft = Draft::new(state.data(), action, options.verify_purity);
        let mut bookkeeping = None;

        match matched {
            Some(Matched::Sync(transition)) => draft.apply(transition)?,
            Some(Matched::Async { case, phase }) => {
                if let Some(hook) = case.hook(phase) {
                    draft.apply(hook)?;
                }
                bookkeeping = self.bookkeeping(state, case, phase, action);
            },
            None => {},
        }
        for listener in listeners {
            draft.apply(listener)?;
        }

        let data = draft.finish();
        if data.is_none() && bookkeeping.is_none() {
            return Ok(None);
        }

        let mut next = state.clone();
        if let Some(data) = data {
            next.data = Some(Arc::new(data));
        }
        if let Some((id, meta)) = bookkeeping {
            next.meta.insert(id, Arc::new(meta));
        }
        Ok(Some(next))
    }

    fn bookkeeping(
        &self,
        state: &SliceState<D>,
        case: &AsyncCase<D>,
        phase: Phase,
        action: &Action,
    ) -> Option<(OperationId, MetaState)> {
        let id = action.kind().operation()?;
        let next = match phase {
            Phase::Prepare => Lifecycle::pending(),
            Phase::Success => Lifecycle::settled(None),
            Phase::Fail => Lifecycle::settled(Some(
                action.error().cloned().unwrap_or_else(OperationError::unspecified),
            )),
        };

        let key = action.meta();
        if case.kind.is_keyed() && key.is_none() {
            tracing::warn!(
                slice = %self.name,
                operation = %id,
                "Keyed operation dispatched without a meta key; bookkeeping skipped"
            );
            return None;
        }

        let fresh;
        let current = if let Some(meta) = state.meta.get(id) {
            meta.as_ref()
        } else {
            fresh = MetaState::for_kind(case.kind);
            &fresh
        };

        current.with(key, next).map(|meta| (id.clone(), meta))
    }

    fn rehydrate(&self, state: &SliceState<D>, action: &Action) -> Option<SliceState<D>> {
        let value = action.payload::<Snapshot>()?.get(&self.name)?;
        let current = state.data()?;

        match serde_json::from_value::<D>(value.clone()) {
            Ok(data) if data != *current => {
                tracing::debug!(slice = %self.name, "Rehydrated slice from persisted data");
                Some(state.clone().with_data(data))
            },
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(
                    slice = %self.name,
                    %error,
                    "Ignoring persisted data that does not match the slice type"
                );
                None
            },
        }
    }
}

impl<D: SliceData> SliceReducer for ModelReducer<D> {
    fn name(&self) -> &SliceName {
        &self.name
    }

    fn reduce(
        &self,
        prior: Option<&SliceRef>,
        action: &Action,
        options: ReduceOptions,
    ) -> Result<SliceRef, ReduceError> {
        let existing = prior.and_then(|slice| {
            let typed = slice.as_any().downcast_ref::<SliceState<D>>();
            if typed.is_none() {
                tracing::warn!(
                    slice = %self.name,
                    "Slice holds a different data type; starting from initial state"
                );
            }
            typed.map(|state| (slice, state))
        });

        let next: SliceRef = match existing {
            Some((slice, state)) => match self.transition(state, action, options)? {
                Some(next) => Arc::new(next),
                None => Arc::clone(slice),
            },
            None => {
                let initial = self.initial_state();
                let next = self.transition(&initial, action, options)?;
                Arc::new(next.unwrap_or(initial))
            },
        };
        Ok(next)
    }
}

/// Copy-on-write working data for one reduction.
struct Draft<'a, D> {
    original: Option<&'a D>,
    working: Option<D>,
    action: &'a Action,
    verify: bool,
}

impl<'a, D: SliceData> Draft<'a, D> {
    const fn new(original: Option<&'a D>, action: &'a Action, verify: bool) -> Self {
        Self {
            original,
            working: None,
            action,
            verify,
        }
    }

    fn apply(&mut self, transition: &Transition<D>) -> Result<(), ReduceError> {
        // Models without data have nothing for hooks to shape.
        let Some(original) = self.original else {
            return Ok(());
        };
        let working = self.working.get_or_insert_with(|| original.clone());

        if self.verify {
            let mut replay = working.clone();
            transition(working, self.action);
            transition(&mut replay, self.action);
            if *working != replay {
                tracing::error!(action = %self.action.kind(), "Transition is not deterministic");
                return Err(ReduceError::ImpureTransition {
                    operation: self.action.kind().to_string(),
                });
            }
        } else {
            transition(working, self.action);
        }
        Ok(())
    }

    fn finish(self) -> Option<D> {
        match (self.original, self.working) {
            (Some(original), Some(working)) if *original != working => Some(working),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use crate::case::Case;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    fn table_with(id: &OperationId, case: Case<Counter>) -> CaseTable<Counter> {
        let mut table = CaseTable::new();
        table.add_case(id.clone(), case);
        table
    }

    fn reducer(table: CaseTable<Counter>) -> ModelReducer<Counter> {
        let init: Initializer<Counter> = Arc::new(|| Counter { value: 0 });
        ModelReducer::new(SliceName::new("Counter"), Some(init), table)
    }

    fn typed(slice: &SliceRef) -> &SliceState<Counter> {
        slice.as_any().downcast_ref::<SliceState<Counter>>().unwrap()
    }

    #[test]
    fn unmatched_action_returns_same_pointer() {
        let id = OperationId::allocate(&SliceName::new("Counter"), "add", 1);
        let add: Transition<Counter> = Arc::new(|c: &mut Counter, _: &Action| c.value += 1);
        let reducer = reducer(table_with(&id, Case::Sync(add)));

        let first = reducer.reduce(None, &Action::init(), ReduceOptions::default()).unwrap();
        let second = reducer.reduce(Some(&first), &Action::init(), ReduceOptions::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let third = reducer
            .reduce(Some(&second), &Action::new(ActionType::Sync(id)), ReduceOptions::default())
            .unwrap();
        assert!(!Arc::ptr_eq(&second, &third));
        assert_eq!(typed(&third).data(), Some(&Counter { value: 1 }));
    }

    #[test]
    fn transition_that_leaves_data_equal_is_unchanged() {
        let id = OperationId::allocate(&SliceName::new("Counter"), "noop", 1);
        let same: Transition<Counter> = Arc::new(|c: &mut Counter, _: &Action| c.value += 0);
        let reducer = reducer(table_with(&id, Case::Sync(same)));

        let first = reducer.reduce(None, &Action::init(), ReduceOptions::default()).unwrap();
        let next = reducer
            .reduce(Some(&first), &Action::new(ActionType::Sync(id)), ReduceOptions::default())
            .unwrap();
        assert!(Arc::ptr_eq(&first, &next));
    }

    #[test]
    fn keyed_bookkeeping_tracks_each_key() {
        let id = OperationId::allocate(&SliceName::new("Counter"), "load", 1);
        let case = Case::Async(AsyncCase {
            kind: MetaKind::Field,
            on_prepare: None,
            on_success: None,
            on_fail: None,
        });
        let reducer = reducer(table_with(&id, case));
        let opts = ReduceOptions::default();

        let slice = reducer.reduce(None, &Action::init(), opts).unwrap();
        let prepare = |key: u32| {
            Action::new(ActionType::Async(id.clone(), Phase::Prepare)).with_meta(MetaKey::from(key))
        };
        let slice = reducer.reduce(Some(&slice), &prepare(1), opts).unwrap();
        let slice = reducer.reduce(Some(&slice), &prepare(2), opts).unwrap();
        let fail = Action::new(ActionType::Async(id.clone(), Phase::Fail))
            .with_meta(MetaKey::from(2_u32))
            .with_error(OperationError::new("boom"));
        let slice = reducer.reduce(Some(&slice), &fail, opts).unwrap();

        let state = typed(&slice);
        assert!(state.loading_for(&id, 1_u32));
        assert!(!state.loading_for(&id, 2_u32));
        assert_eq!(state.error_for(&id, 2_u32), Some(&OperationError::new("boom")));
        assert!(state.loading(&id));
        assert_eq!(state.meta(&id).unwrap().keys().count(), 2);
    }

    #[test]
    fn keyed_phase_shares_the_other_entries() {
        let id = OperationId::allocate(&SliceName::new("Counter"), "load", 1);
        let case = Case::Async(AsyncCase {
            kind: MetaKind::Implicit,
            on_prepare: None,
            on_success: None,
            on_fail: None,
        });
        let reducer = reducer(table_with(&id, case));
        let opts = ReduceOptions::default();
        let phase = |phase: Phase, token: u64| {
            Action::new(ActionType::Async(id.clone(), phase)).with_meta(MetaKey::from(token))
        };

        let mut slice = reducer.reduce(None, &Action::init(), opts).unwrap();
        for token in 1..=3 {
            slice = reducer.reduce(Some(&slice), &phase(Phase::Prepare, token), opts).unwrap();
        }
        let before = slice.clone();
        let after = reducer.reduce(Some(&slice), &phase(Phase::Success, 3), opts).unwrap();

        let (Some(MetaState::Keyed(old)), Some(MetaState::Keyed(new))) =
            (typed(&before).meta(&id), typed(&after).meta(&id))
        else {
            panic!("expected keyed bookkeeping");
        };
        let first = MetaKey::from(1_u64);
        assert!(Arc::ptr_eq(&old[&first], &new[&first]));
        assert!(!new[&MetaKey::from(3_u64)].loading);
        assert!(old[&MetaKey::from(3_u64)].loading);
    }

    #[test]
    fn keyed_phase_without_meta_key_is_ignored() {
        let id = OperationId::allocate(&SliceName::new("Counter"), "load", 1);
        let case = Case::Async(AsyncCase {
            kind: MetaKind::Implicit,
            on_prepare: None,
            on_success: None,
            on_fail: None,
        });
        let reducer = reducer(table_with(&id, case));
        let opts = ReduceOptions::default();

        let slice = reducer.reduce(None, &Action::init(), opts).unwrap();
        let next = reducer
            .reduce(Some(&slice), &Action::new(ActionType::Async(id, Phase::Prepare)), opts)
            .unwrap();
        assert!(Arc::ptr_eq(&slice, &next));
    }

    #[test]
    fn rehydrate_replaces_data_and_ignores_bad_payloads() {
        let reducer = reducer(CaseTable::new());
        let opts = ReduceOptions::default();
        let slice = reducer.reduce(None, &Action::init(), opts).unwrap();

        let good = Action::rehydrate(Snapshot::new().with("Counter", json!({ "value": 9 })));
        let next = reducer.reduce(Some(&slice), &good, opts).unwrap();
        assert_eq!(typed(&next).data(), Some(&Counter { value: 9 }));

        let bad = Action::rehydrate(Snapshot::new().with("Counter", json!("not a counter")));
        let after = reducer.reduce(Some(&next), &bad, opts).unwrap();
        assert!(Arc::ptr_eq(&next, &after));

        let other = Action::rehydrate(Snapshot::new().with("Other", json!({ "value": 1 })));
        let still = reducer.reduce(Some(&after), &other, opts).unwrap();
        assert!(Arc::ptr_eq(&after, &still));
    }

    #[test]
    fn purity_check_rejects_nondeterministic_transitions() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let id = OperationId::allocate(&SliceName::new("Counter"), "tick", 1);
        let calls = Arc::new(AtomicI64::new(0));
        let counter = Arc::clone(&calls);
        let impure: Transition<Counter> = Arc::new(move |c: &mut Counter, _: &Action| {
            c.value = counter.fetch_add(1, Ordering::SeqCst);
        });
        let reducer = reducer(table_with(&id, Case::Sync(impure)));
        let checked = ReduceOptions { verify_purity: true };

        let slice = reducer.reduce(None, &Action::init(), checked).unwrap();
        let result = reducer.reduce(Some(&slice), &Action::new(ActionType::Sync(id)), checked);
        assert!(matches!(result, Err(ReduceError::ImpureTransition { .. })));
    }

    #[test]
    fn data_json_serializes_only_data() {
        let reducer = reducer(CaseTable::new());
        let slice = reducer.reduce(None, &Action::init(), ReduceOptions::default()).unwrap();

        assert!(slice.has_data());
        assert_eq!(slice.data_json().unwrap(), Some(json!({ "value": 0 })));
    }
}
