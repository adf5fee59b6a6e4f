//! End-to-end tests for the profile demo with a real store.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use futures::future::BoxFuture;
use modelstore_core::{OperationError, PersistStorage};
use modelstore_runtime::{PersistConfig, Store, StoreConfig};
use modelstore_testing::{DeferredTransport, RecordingStorage, assertions, init_test_tracing};
use profile_demo::{DirectoryModel, Profile, ProfileApi, ProfileModel, StaticProfileApi};
use serde_json::json;
use std::sync::Arc;

/// API whose calls stay pending until the test settles them
#[derive(Clone, Default)]
struct DeferredApi {
    transport: DeferredTransport<Profile>,
}

impl ProfileApi for DeferredApi {
    fn current(&self) -> BoxFuture<'static, Result<Profile, OperationError>> {
        self.transport.request("current")
    }

    fn by_id(&self, id: u32) -> BoxFuture<'static, Result<Profile, OperationError>> {
        self.transport.request(format!("profile/{id}"))
    }
}

async fn store_with(profile: &ProfileModel, directory: &DirectoryModel, config: StoreConfig) -> Store {
    init_test_tracing();
    let store = Store::new();
    store.register(&profile.model).unwrap();
    store.register(&directory.model).unwrap();
    tokio_test::assert_ok!(store.create(config).await);
    store
}

#[tokio::test]
async fn get_profile_lifecycle() {
    let api = DeferredApi::default();
    let profile = ProfileModel::new(Arc::new(api.clone()));
    let directory = DirectoryModel::new(Arc::new(api.clone()), &profile);
    let store = store_with(&profile, &directory, StoreConfig::default()).await;

    assert_eq!(*store.data(&profile.model).unwrap(), Profile::new(1, "init"));

    let running = store.start(&profile.get_profile, ());
    let slice = store.slice(&profile.model).unwrap();
    assert_eq!(slice.data(), Some(&Profile::placeholder()));
    assert!(slice.loading(&profile.get_profile));

    api.transport.resolve(0, Profile::new(42, "X"));
    running.wait().await.unwrap();

    let slice = store.slice(&profile.model).unwrap();
    assert_eq!(slice.data(), Some(&Profile::new(42, "X")));
    assert!(!slice.loading(&profile.get_profile));
    assert_eq!(slice.error(&profile.get_profile), None);

    // The directory caches the signed-in profile too.
    let cached = store.data(&directory.model).unwrap();
    assert_eq!(cached.records.get(&42), Some(&Profile::new(42, "X")));
}

#[tokio::test]
async fn lookups_by_id_load_independently() {
    let api = DeferredApi::default();
    let profile = ProfileModel::new(Arc::new(api.clone()));
    let directory = DirectoryModel::new(Arc::new(api.clone()), &profile);
    let store = store_with(&profile, &directory, StoreConfig::default()).await;

    let first = store.start(&directory.get_profile_by_id, 1);
    let second = store.start(&directory.get_profile_by_id, 2);
    assert_eq!(api.transport.labels(), ["profile/1", "profile/2"]);

    api.transport.resolve(1, Profile::new(2, "Two"));
    second.wait().await.unwrap();

    let slice = store.slice(&directory.model).unwrap();
    assertions::assert_loading(&slice, &directory.get_profile_by_id, 1_u32);
    assertions::assert_settled(&slice, &directory.get_profile_by_id, 2_u32);
    let records = &slice.data().unwrap().records;
    assert!(records.contains_key(&2));
    assert!(!records.contains_key(&1));

    api.transport.reject(0, OperationError::new("no profile 1"));
    first.wait().await.unwrap_err();

    let slice = store.slice(&directory.model).unwrap();
    assertions::assert_failed(&slice, &directory.get_profile_by_id, 1_u32, "no profile 1");
    assert_eq!(slice.data().unwrap().missing, [1]);
}

#[tokio::test]
async fn renamed_profile_is_restored_by_the_next_store() {
    let storage = RecordingStorage::new();
    let api: Arc<dyn ProfileApi> = Arc::new(StaticProfileApi::new(Profile::new(42, "Ada"), []));

    let config = |profile: &ProfileModel| {
        let backend: Arc<dyn PersistStorage> = Arc::new(storage.clone());
        StoreConfig::default()
            .with_persist(PersistConfig::new("profile", 1, backend).allow(&profile.model))
            .with_purity_check(true)
    };

    let profile = ProfileModel::new(Arc::clone(&api));
    let directory = DirectoryModel::new(Arc::clone(&api), &profile);
    let store = store_with(&profile, &directory, config(&profile)).await;
    store.invoke(&profile.get_profile, ()).await.unwrap();
    store.dispatch(profile.rename.action("Ada L.".to_string())).unwrap();
    store.flush().await.unwrap();

    assert_eq!(
        storage.json("profile"),
        Some(json!({ "version": 1, "Profile": { "id": 42, "name": "Ada L." } }))
    );

    let profile = ProfileModel::new(Arc::clone(&api));
    let directory = DirectoryModel::new(api, &profile);
    let restored = store_with(&profile, &directory, config(&profile)).await;

    assert_eq!(*restored.data(&profile.model).unwrap(), Profile::new(42, "Ada L."));
    assert!(restored.data(&directory.model).unwrap().records.is_empty());
}
