//! Integration tests for async operations driven through the store.
//!
//! Transport calls go through a [`DeferredTransport`], so every test decides
//! when (and in which order) calls settle.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use modelstore_core::{
    Action, AsyncOperation, Deserialize, MetaKey, MetaPolicy, Model, OperationError, Phase, Serialize,
};
use modelstore_runtime::error::StoreError;
use modelstore_runtime::{Store, StoreConfig};
use modelstore_testing::{DeferredTransport, assertions, init_test_tracing, properties};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Catalog {
    names: BTreeMap<u32, String>,
    failures: u32,
}

struct Fixture {
    model: Model<Catalog>,
    by_id: AsyncOperation<u32, String>,
    transport: DeferredTransport<String>,
}

fn catalog(policy: MetaPolicy<u32>) -> Fixture {
    let transport = DeferredTransport::new();
    let api = transport.clone();
    let mut model = Model::new("Catalog", Catalog::default);
    let by_id = model
        .async_operation("getById", move |id: &u32| api.request(format!("item/{id}")))
        .meta(policy)
        .on_success(|catalog: &mut Catalog, id: &u32, name: &String| {
            catalog.names.insert(*id, name.clone());
        })
        .on_fail(|catalog: &mut Catalog, _: &u32, _: &OperationError| catalog.failures += 1)
        .build();

    Fixture {
        model,
        by_id,
        transport,
    }
}

async fn store_for(fixture: &Fixture) -> Store {
    init_test_tracing();
    let store = Store::new();
    store.register(&fixture.model).unwrap();
    store.create(StoreConfig::default()).await.unwrap();
    store
}

fn by_field() -> MetaPolicy<u32> {
    MetaPolicy::field("id", |id: &u32| *id)
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn invoke_runs_prepare_then_success() {
    let fixture = catalog(MetaPolicy::None);
    let store = store_for(&fixture).await;

    let running = store.start(&fixture.by_id, 7);
    assert!(store.slice(&fixture.model).unwrap().loading(&fixture.by_id));
    assert_eq!(fixture.transport.labels(), ["item/7"]);

    fixture.transport.resolve(0, "seven".to_string());
    assert_eq!(running.wait().await.unwrap(), "seven");

    let slice = store.slice(&fixture.model).unwrap();
    assert!(!slice.loading(&fixture.by_id));
    assert_eq!(slice.error(&fixture.by_id), None);
    assert_eq!(slice.data().unwrap().names.get(&7).map(String::as_str), Some("seven"));
}

#[tokio::test]
async fn transport_failure_is_recorded_and_returned() {
    let fixture = catalog(MetaPolicy::None);
    let store = store_for(&fixture).await;

    let running = store.start(&fixture.by_id, 1);
    fixture.transport.reject(0, OperationError::new("not found").with_code("404"));

    let error = running.wait().await.unwrap_err();
    assert_eq!(error.code.as_deref(), Some("404"));

    let slice = store.slice(&fixture.model).unwrap();
    assert!(!slice.loading(&fixture.by_id));
    assert_eq!(slice.error(&fixture.by_id).map(|e| e.message.as_str()), Some("not found"));
    assert_eq!(slice.data().unwrap().failures, 1);
}

#[tokio::test]
async fn invoking_before_create_fails_without_calling_the_transport() {
    let fixture = catalog(MetaPolicy::None);
    let store = Store::new();
    store.register(&fixture.model).unwrap();

    let error = store.invoke(&fixture.by_id, 1).await.unwrap_err();
    assert_eq!(error.code.as_deref(), Some("store"));
    assert_eq!(fixture.transport.calls(), 0);
}

#[test]
fn starting_without_a_runtime_reports_it() {
    let fixture = catalog(MetaPolicy::None);
    let store = Store::new();
    store.register(&fixture.model).unwrap();
    store.init(StoreConfig::default()).unwrap();

    let running = store.start(&fixture.by_id, 1);
    let error = futures::executor::block_on(running.wait()).unwrap_err();
    assert_eq!(error.code.as_deref(), Some("runtime"));
    assert_eq!(fixture.transport.calls(), 0);
}

// ============================================================================
// Meta fan-out
// ============================================================================

#[tokio::test]
async fn scalar_bookkeeping_follows_the_last_phase() {
    let fixture = catalog(MetaPolicy::None);
    let store = store_for(&fixture).await;

    let first = store.start(&fixture.by_id, 1);
    let second = store.start(&fixture.by_id, 2);
    assert!(first.key().is_none());

    fixture.transport.reject(0, OperationError::new("boom"));
    first.wait().await.unwrap_err();

    // The second call is still in flight, but the shared lifecycle settled.
    let slice = store.slice(&fixture.model).unwrap();
    assert!(!slice.loading(&fixture.by_id));
    assert!(slice.error(&fixture.by_id).is_some());

    fixture.transport.resolve(1, "two".to_string());
    second.wait().await.unwrap();
    assert_eq!(store.slice(&fixture.model).unwrap().error(&fixture.by_id), None);
}

#[tokio::test]
async fn implicit_tokens_keep_calls_apart() {
    let fixture = catalog(MetaPolicy::Implicit);
    let store = store_for(&fixture).await;

    let first = store.start(&fixture.by_id, 5);
    let second = store.start(&fixture.by_id, 5);
    let first_key = first.key().cloned().unwrap();
    let second_key = second.key().cloned().unwrap();
    assert_eq!(first_key, MetaKey::from(1_u64));
    assert_eq!(second_key, MetaKey::from(2_u64));

    fixture.transport.resolve(1, "later".to_string());
    second.wait().await.unwrap();

    let slice = store.slice(&fixture.model).unwrap();
    assertions::assert_loading(&slice, &fixture.by_id, first_key.clone());
    assertions::assert_settled(&slice, &fixture.by_id, second_key);
    assert!(slice.loading(&fixture.by_id));

    fixture.transport.resolve(0, "earlier".to_string());
    first.wait().await.unwrap();
    assertions::assert_settled(&store.slice(&fixture.model).unwrap(), &fixture.by_id, first_key);
}

#[tokio::test]
async fn field_keys_settle_independently() {
    let fixture = catalog(by_field());
    let store = store_for(&fixture).await;

    let one = store.start(&fixture.by_id, 1);
    let two = store.start(&fixture.by_id, 2);
    assert_eq!(one.key(), Some(&MetaKey::from(1_u32)));

    fixture.transport.resolve(1, "two".to_string());
    two.wait().await.unwrap();

    let slice = store.slice(&fixture.model).unwrap();
    assertions::assert_loading(&slice, &fixture.by_id, 1_u32);
    assertions::assert_settled(&slice, &fixture.by_id, 2_u32);

    fixture.transport.reject(0, OperationError::new("gone"));
    one.wait().await.unwrap_err();

    let slice = store.slice(&fixture.model).unwrap();
    assertions::assert_failed(&slice, &fixture.by_id, 1_u32, "gone");
    assertions::assert_settled(&slice, &fixture.by_id, 2_u32);
    assert!(!slice.loading(&fixture.by_id));
}

// Documented behavior: overlapping calls on one key are not ordered, the call
// that settles last wins.
#[tokio::test]
async fn calls_sharing_a_key_keep_the_last_settled_result() {
    let fixture = catalog(by_field());
    let store = store_for(&fixture).await;

    let stale = store.start(&fixture.by_id, 3);
    let fresh = store.start(&fixture.by_id, 3);

    fixture.transport.resolve(1, "fresh".to_string());
    fresh.wait().await.unwrap();
    fixture.transport.resolve(0, "stale".to_string());
    stale.wait().await.unwrap();

    let data = store.data(&fixture.model).unwrap();
    assert_eq!(data.names.get(&3).map(String::as_str), Some("stale"));
    assertions::assert_settled(&store.slice(&fixture.model).unwrap(), &fixture.by_id, 3_u32);
}

#[tokio::test]
async fn keyed_phase_without_a_key_leaves_bookkeeping_alone() {
    let fixture = catalog(by_field());
    let store = store_for(&fixture).await;
    let before = store.state().unwrap();

    let unkeyed = Action::new(fixture.by_id.phase(Phase::Prepare)).with_payload(1_u32);
    store.dispatch(unkeyed).unwrap();

    assert!(Arc::ptr_eq(&before, &store.state().unwrap()));
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #[test]
    fn every_key_settles_whatever_the_order((ids, order) in properties::ids_and_settle_order(8)) {
        let fixture = catalog(by_field());
        let store = Store::new();
        store.register(&fixture.model).unwrap();
        store.init(StoreConfig::default()).unwrap();

        let calls: Vec<_> = ids.iter().map(|id| fixture.by_id.call(*id)).collect();
        for call in &calls {
            store.dispatch(call.prepare_action()).unwrap();
        }
        for index in order {
            let call = &calls[index];
            store.dispatch(call.success_action(format!("name-{}", call.payload()))).unwrap();
        }

        let slice = store.slice(&fixture.model).unwrap();
        prop_assert!(!slice.loading(&fixture.by_id));
        for id in &ids {
            prop_assert!(!slice.loading_for(&fixture.by_id, *id));
            prop_assert_eq!(slice.data().unwrap().names.get(id), Some(&format!("name-{id}")));
        }
    }
}

#[test]
fn store_errors_convert_to_operation_errors() {
    let error = OperationError::from(StoreError::NotInitialized);
    assert_eq!(error.code.as_deref(), Some("store"));
}
