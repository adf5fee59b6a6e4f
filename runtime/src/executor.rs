//! Async operation executor.
//!
//! Drives one invocation of an [`AsyncOperation`]:
//!
//! 1. derive the meta key and dispatch the prepare action
//! 2. start the transport call and await it outside the reducer pipeline
//! 3. dispatch success (with the response) or fail (with the error)
//!
//! Transport failures end up in the slice's bookkeeping and are also returned
//! to the caller. They are never a [`StoreError`].

use crate::error::StoreError;
use crate::metrics::OperationMetrics;
use crate::store::Store;
use modelstore_core::{AsyncOperation, Call, FetchHandle, MetaKey, Operation, OperationError, Phase};
use std::any::Any;
use tokio::task::JoinHandle;

enum Progress<R> {
    Done(Result<R, OperationError>),
    Running(JoinHandle<Result<R, OperationError>>),
}

/// A started invocation.
///
/// Dropping it does not cancel the call; the settle action is dispatched
/// either way.
pub struct Invocation<R> {
    key: Option<MetaKey>,
    progress: Progress<R>,
}

impl<R> Invocation<R> {
    /// The invocation's meta key: the implicit token or the payload field
    /// value, `None` for scalar operations
    #[must_use]
    pub const fn key(&self) -> Option<&MetaKey> {
        self.key.as_ref()
    }

    /// Wait for the call to settle
    ///
    /// # Errors
    ///
    /// Returns the transport error, or an error describing why the phase
    /// actions could not be dispatched.
    pub async fn wait(self) -> Result<R, OperationError> {
        match self.progress {
            Progress::Done(result) => result,
            Progress::Running(handle) => match handle.await {
                Ok(result) => result,
                Err(join) => Err(OperationError::new(join.to_string()).with_code("join")),
            },
        }
    }
}

impl<R> std::fmt::Debug for Invocation<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("key", &self.key)
            .field("settled", &matches!(self.progress, Progress::Done(_)))
            .finish()
    }
}

impl Store {
    /// Run an async operation and wait for it to settle.
    ///
    /// # Errors
    ///
    /// Returns the transport error (after the fail phase was dispatched), or
    /// the store error that prevented a phase from being dispatched.
    #[tracing::instrument(skip(self, operation, payload), fields(operation = %operation.id()), name = "store_invoke")]
    pub async fn invoke<P, R>(&self, operation: &AsyncOperation<P, R>, payload: P) -> Result<R, OperationError>
    where
        P: Any + Send + Sync,
        R: Any + Send + Sync + Clone,
    {
        let call = operation.call(payload);
        let fetch = self.prepare(&call)?;
        settle(self, call, fetch).await
    }

    /// Start an async operation on the tokio runtime.
    ///
    /// The prepare action is dispatched and the transport call started before
    /// this returns.
    #[tracing::instrument(skip(self, operation, payload), fields(operation = %operation.id()), name = "store_start")]
    pub fn start<P, R>(&self, operation: &AsyncOperation<P, R>, payload: P) -> Invocation<R>
    where
        P: Any + Send + Sync,
        R: Any + Send + Sync + Clone,
    {
        let call = operation.call(payload);
        let key = call.key().cloned();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime; operation not started");
            return Invocation {
                key,
                progress: Progress::Done(Err(
                    OperationError::new("no tokio runtime").with_code("runtime")
                )),
            };
        };

        let fetch = match self.prepare(&call) {
            Ok(fetch) => fetch,
            Err(error) => {
                return Invocation {
                    key,
                    progress: Progress::Done(Err(error)),
                };
            },
        };

        let store = self.clone();
        let handle = runtime.spawn(async move { settle(&store, call, fetch).await });
        Invocation {
            key,
            progress: Progress::Running(handle),
        }
    }

    fn prepare<P, R>(&self, call: &Call<P, R>) -> Result<FetchHandle<R>, OperationError>
    where
        P: Any + Send + Sync,
        R: Any + Send + Sync,
    {
        self.dispatch(call.prepare_action()).map_err(OperationError::from)?;
        OperationMetrics::record_phase(Phase::Prepare);
        tracing::debug!(key = ?call.key(), "Operation prepared");
        Ok(call.fetch())
    }
}

async fn settle<P, R>(store: &Store, call: Call<P, R>, fetch: FetchHandle<R>) -> Result<R, OperationError>
where
    P: Any + Send + Sync,
    R: Any + Send + Sync + Clone,
{
    let result = fetch.await;
    let (action, phase) = match &result {
        Ok(response) => (call.success_action(response.clone()), Phase::Success),
        Err(error) => (call.fail_action(error.clone()), Phase::Fail),
    };

    store.dispatch(action).map_err(|error: StoreError| {
        tracing::warn!(%error, key = ?call.key(), "Could not dispatch settle action");
        OperationError::from(error)
    })?;
    OperationMetrics::record_phase(phase);
    tracing::debug!(key = ?call.key(), %phase, "Operation settled");

    result
}
