//! Root composition: combine slice reducers into one reducer over [`RootState`].
//!
//! - **[`combine`]**: run every slice reducer, in registration order, on the
//!   same action
//! - **[`RootState`]**: the immutable, ordered map of slice name to slice
//!
//! # Change detection
//!
//! The combined reducer compares each slice's next value with its prior value
//! by pointer. If every slice came back untouched and the set of slice names
//! did not change, the prior `Arc<RootState>` itself is returned, so callers
//! can check "did anything change" with `Arc::ptr_eq` in O(k).
//!
//! ```ignore
//! let engine = combine(&[profile.register().unwrap(), todo.register().unwrap()]);
//! let root = engine.reduce(None, &Action::init(), ReduceOptions::default(), &())?;
//! let same = engine.reduce(Some(&root), &unrelated, ReduceOptions::default(), &())?;
//! assert!(Arc::ptr_eq(&root, &same));
//! ```

use crate::action::Action;
use crate::error::{ReduceError, SliceError};
use crate::operation::SliceName;
use crate::slice::{ReduceOptions, SliceData, SliceReducer, SliceRef, SliceState};
use std::sync::Arc;

/// The whole state tree: one slice per registered model, in registration order.
#[derive(Debug, Clone, Default)]
pub struct RootState {
    slices: Vec<(SliceName, SliceRef)>,
}

impl RootState {
    /// The slice named `name`
    #[must_use]
    pub fn get(&self, name: &SliceName) -> Option<&SliceRef> {
        self.slices
            .iter()
            .find(|(slice, _)| slice == name)
            .map(|(_, state)| state)
    }

    /// Number of slices
    #[must_use]
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Whether no slice is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Slice names in registration order
    pub fn names(&self) -> impl Iterator<Item = &SliceName> {
        self.slices.iter().map(|(name, _)| name)
    }

    /// Slices in registration order
    pub fn iter(&self) -> impl Iterator<Item = (&SliceName, &SliceRef)> {
        self.slices.iter().map(|(name, slice)| (name, slice))
    }

    /// Typed read of the slice named `name`
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::NotRegistered`] if the slice is missing, or
    /// [`SliceError::TypeMismatch`] if it holds another data type.
    pub fn slice<D: SliceData>(&self, name: &SliceName) -> Result<Arc<SliceState<D>>, SliceError> {
        let slice = self
            .get(name)
            .ok_or_else(|| SliceError::NotRegistered(name.to_string()))?;
        Arc::clone(slice)
            .into_any()
            .downcast::<SliceState<D>>()
            .map_err(|_| SliceError::TypeMismatch(name.to_string()))
    }

    /// Typed read of the data of the slice named `name`
    ///
    /// # Errors
    ///
    /// Same as [`RootState::slice`], plus [`SliceError::NoData`] when the
    /// slice only holds bookkeeping.
    pub fn data<D: SliceData>(&self, name: &SliceName) -> Result<Arc<D>, SliceError> {
        self.slice::<D>(name)?
            .data_arc()
            .cloned()
            .ok_or_else(|| SliceError::NoData(name.to_string()))
    }

    /// Replace (or append) one slice; used to expose partially reduced state
    pub fn set(&mut self, name: &SliceName, slice: SliceRef) {
        match self.slices.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, current)) => *current = slice,
            None => self.slices.push((name.clone(), slice)),
        }
    }
}

/// Hooks called by [`CombinedReducer::reduce`].
pub trait StateObserver {
    /// A slice finished reducing; the rest of the root is still in progress
    fn on_slice_reduced(&self, _name: &SliceName, _slice: &SliceRef) {}

    /// A new root state was produced. Not called when nothing changed.
    fn on_state_change(&self, _next: &Arc<RootState>, _is_internal: bool) {}
}

impl StateObserver for () {}

/// Several slice reducers behaving as one reducer over [`RootState`].
#[derive(Clone, Default)]
pub struct CombinedReducer {
    reducers: Vec<Arc<dyn SliceReducer>>,
}

/// Combine slice reducers; slices are reduced in the given order.
#[must_use]
pub fn combine(reducers: &[Arc<dyn SliceReducer>]) -> CombinedReducer {
    CombinedReducer {
        reducers: reducers.to_vec(),
    }
}

impl CombinedReducer {
    /// Slice names in reduction order
    pub fn names(&self) -> impl Iterator<Item = &SliceName> {
        self.reducers.iter().map(|reducer| reducer.name())
    }

    /// Number of combined slices
    #[must_use]
    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    /// Whether nothing is combined
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }

    /// Reduce `action` over `state` (absent state counts as empty).
    ///
    /// # Errors
    ///
    /// Propagates the first [`ReduceError`] raised by a slice reducer; the
    /// prior state is left as it was.
    pub fn reduce(
        &self,
        state: Option<&Arc<RootState>>,
        action: &Action,
        options: ReduceOptions,
        observer: &dyn StateObserver,
    ) -> Result<Arc<RootState>, ReduceError> {
        let empty = RootState::default();
        let prior = state.map_or(&empty, |state| &**state);

        let mut changed = prior.len() != self.reducers.len();
        let mut slices = Vec::with_capacity(self.reducers.len());

        for (index, reducer) in self.reducers.iter().enumerate() {
            let name = reducer.name();
            // Slices keep their index across dispatches; scan only if it moved.
            let before = prior
                .slices
                .get(index)
                .filter(|(existing, _)| existing == name)
                .map(|(_, slice)| slice)
                .or_else(|| prior.get(name));

            let next = reducer.reduce(before, action, options)?;
            changed |= before.is_none_or(|before| !Arc::ptr_eq(before, &next));
            observer.on_slice_reduced(name, &next);
            slices.push((name.clone(), next));
        }

        match state {
            Some(state) if !changed => Ok(Arc::clone(state)),
            _ => {
                let next = Arc::new(RootState { slices });
                observer.on_state_change(&next, action.is_internal());
                Ok(next)
            },
        }
    }
}
