//! Reducer case table: per-model lookup from [`ActionType`] to transitions.
//!
//! A model's declarations are materialized into one [`CaseTable`] when the
//! model registers. The table is matched exhaustively on the action type, so
//! an action that is not listed returns no case and the slice stays untouched.

use crate::action::Action;
use crate::operation::{ActionType, OperationId, Phase};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// An erased transition over a model's data.
///
/// Typed closures are wrapped so they downcast the payload/response out of the
/// [`Action`]. Transitions only shape data; lifecycle bookkeeping is written by
/// the slice builder.
pub type Transition<D> = Arc<dyn Fn(&mut D, &Action) + Send + Sync>;

/// How an asynchronous operation fans out into sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    /// One shared scalar lifecycle
    None,
    /// One lifecycle per invocation token
    Implicit,
    /// One lifecycle per value of a payload field
    Field,
}

impl MetaKind {
    /// Whether lifecycles are stored per key
    #[must_use]
    pub const fn is_keyed(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Transitions of one asynchronous operation.
pub struct AsyncCase<D> {
    /// Fan-out policy
    pub kind: MetaKind,
    /// Hook run when the call is issued
    pub on_prepare: Option<Transition<D>>,
    /// Hook run when the call succeeds
    pub on_success: Option<Transition<D>>,
    /// Hook run when the call fails
    pub on_fail: Option<Transition<D>>,
}

impl<D> AsyncCase<D> {
    /// The hook for a phase, if declared
    #[must_use]
    pub const fn hook(&self, phase: Phase) -> Option<&Transition<D>> {
        match phase {
            Phase::Prepare => self.on_prepare.as_ref(),
            Phase::Success => self.on_success.as_ref(),
            Phase::Fail => self.on_fail.as_ref(),
        }
    }
}

impl<D> Clone for AsyncCase<D> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            on_prepare: self.on_prepare.clone(),
            on_success: self.on_success.clone(),
            on_fail: self.on_fail.clone(),
        }
    }
}

/// A case registered for one operation.
pub enum Case<D> {
    /// Synchronous operation
    Sync(Transition<D>),
    /// Asynchronous operation
    Async(AsyncCase<D>),
}

impl<D> Clone for Case<D> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(t) => Self::Sync(Arc::clone(t)),
            Self::Async(c) => Self::Async(c.clone()),
        }
    }
}

/// Result of looking an action up in a [`CaseTable`].
pub enum Matched<'a, D> {
    /// A synchronous operation of this model
    Sync(&'a Transition<D>),
    /// One phase of an asynchronous operation of this model
    Async {
        /// The operation's case
        case: &'a AsyncCase<D>,
        /// Which phase was dispatched
        phase: Phase,
    },
}

/// Per-model mapping from action types to transitions.
pub struct CaseTable<D> {
    cases: HashMap<OperationId, Case<D>>,
    order: Vec<OperationId>,
    listeners: HashMap<ActionType, SmallVec<[Transition<D>; 2]>>,
}

impl<D> Default for CaseTable<D> {
    fn default() -> Self {
        Self {
            cases: HashMap::new(),
            order: Vec::new(),
            listeners: HashMap::new(),
        }
    }
}

impl<D> CaseTable<D> {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the case for an operation, replacing any previous one
    pub fn add_case(&mut self, id: OperationId, case: Case<D>) {
        if self.cases.insert(id.clone(), case).is_none() {
            self.order.push(id);
        }
    }

    /// Register a listener transition for any action type
    pub fn add_listener(&mut self, kind: ActionType, transition: Transition<D>) {
        self.listeners.entry(kind).or_default().push(transition);
    }

    /// Look up this model's own case for an action
    #[must_use]
    pub fn lookup(&self, kind: &ActionType) -> Option<Matched<'_, D>> {
        match kind {
            ActionType::Init | ActionType::Rehydrate => None,
            ActionType::Sync(id) => match self.cases.get(id) {
                Some(Case::Sync(transition)) => Some(Matched::Sync(transition)),
                Some(Case::Async(_)) | None => None,
            },
            ActionType::Async(id, phase) => match self.cases.get(id) {
                Some(Case::Async(case)) => Some(Matched::Async {
                    case,
                    phase: *phase,
                }),
                Some(Case::Sync(_)) | None => None,
            },
        }
    }

    /// Listener transitions registered for an action type
    #[must_use]
    pub fn listeners(&self, kind: &ActionType) -> &[Transition<D>] {
        self.listeners
            .get(kind)
            .map(SmallVec::as_slice)
            .unwrap_or_default()
    }

    /// Whether the action reaches this table at all
    #[must_use]
    pub fn handles(&self, kind: &ActionType) -> bool {
        self.lookup(kind).is_some() || self.listeners.contains_key(kind)
    }

    /// Asynchronous operations in declaration order
    pub fn async_operations(&self) -> impl Iterator<Item = (&OperationId, MetaKind)> {
        self.order.iter().filter_map(|id| match self.cases.get(id) {
            Some(Case::Async(case)) => Some((id, case.kind)),
            Some(Case::Sync(_)) | None => None,
        })
    }

    /// Number of operations with a case
    #[must_use]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// Whether the table has no cases and no listeners
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty() && self.listeners.is_empty()
    }
}
