//! # Modelstore Testing
//!
//! Testing utilities for modelstore.
//!
//! This crate provides:
//! - [`DeferredTransport`]: async operation transport settled by the test
//! - [`RecordingStorage`]: persistence backend that counts writes and fails
//!   on demand
//! - [`SliceTest`]: Given-When-Then tests for one model
//! - proptest strategies for meta keys and invocation orders
//!
//! ## Example
//!
//! ```ignore
//! use modelstore_testing::{DeferredTransport, init_test_tracing};
//!
//! #[tokio::test]
//! async fn test_profile_flow() {
//!     init_test_tracing();
//!     let transport = DeferredTransport::new();
//!     let (model, get_profile) = profile_model(transport.clone());
//!
//!     let store = Store::new();
//!     store.register(&model)?;
//!     store.create(StoreConfig::default()).await?;
//!
//!     let call = store.start(&get_profile, ());
//!     assert!(store.slice(&model)?.loading(&get_profile));
//!     transport.resolve(0, Profile::default());
//!     call.wait().await?;
//! }
//! ```

/// Mock transports and storage backends
pub mod mocks;


/// Property-based testing utilities using proptest.
pub mod properties {
    use modelstore_core::MetaKey;
    use proptest::prelude::*;

    /// Meta keys as produced by numeric payload fields
    pub fn meta_key() -> impl Strategy<Value = MetaKey> {
        (0_u32..1000).prop_map(MetaKey::from)
    }

    /// A set of distinct ids plus a settlement order over them
    pub fn ids_and_settle_order(max: usize) -> impl Strategy<Value = (Vec<u32>, Vec<usize>)> {
        proptest::collection::hash_set(0_u32..1000, 1..=max)
            .prop_map(|ids| ids.into_iter().collect::<Vec<_>>())
            .prop_flat_map(|ids| {
                let order: Vec<usize> = (0..ids.len()).collect();
                (Just(ids), Just(order).prop_shuffle())
            })
    }
}

/// Install a test subscriber honoring `RUST_LOG` (safe to call repeatedly)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{DeferredTransport, RecordingStorage};
pub use slice_test::{SliceTest, assertions};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn settle_order_is_a_permutation((ids, order) in properties::ids_and_settle_order(6)) {
            let mut sorted = order.clone();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..ids.len()).collect::<Vec<_>>());
        }

        #[test]
        fn meta_keys_are_numeric(key in properties::meta_key()) {
            prop_assert!(key.as_str().parse::<u32>().is_ok());
        }
    }

    #[test]
    fn tracing_init_is_idempotent() {
        init_test_tracing();
        init_test_tracing();
    }
}
