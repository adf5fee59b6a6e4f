//! Profile demo binary
//!
//! Loads the signed-in profile, looks up a few profiles concurrently, renames
//! the signed-in one and persists it. Run it twice: the second run starts from
//! the persisted name.
//!
//! ```bash
//! RUST_LOG=debug cargo run -p profile-demo
//! ```

use anyhow::Context;
use modelstore_core::FileStorage;
use modelstore_runtime::metrics::MetricsExporter;
use modelstore_runtime::{PersistConfig, Store, StoreConfig};
use profile_demo::{DirectoryModel, Profile, ProfileApi, ProfileModel, StaticProfileApi};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "profile_demo=info,modelstore_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let exporter = MetricsExporter::install().context("installing metrics recorder")?;

    let api: Arc<dyn ProfileApi> = Arc::new(
        StaticProfileApi::new(
            Profile::new(42, "Ada"),
            [Profile::new(7, "Grace"), Profile::new(8, "Barbara")],
        )
        .with_latency(Duration::from_millis(50)),
    );
    let profile = ProfileModel::new(Arc::clone(&api));
    let directory = DirectoryModel::new(api, &profile);

    let storage = FileStorage::new(std::env::temp_dir().join("modelstore-profile-demo"));
    let persist = PersistConfig::from_env(Arc::new(storage)).allow(&profile.model);

    let store = Store::new();
    store.register(&profile.model)?;
    store.register(&directory.model)?;
    store
        .create(
            StoreConfig::default()
                .with_persist(persist)
                .with_purity_check(cfg!(debug_assertions)),
        )
        .await?;
    tracing::info!(slices = store.slice_names().len(), "Store ready");

    println!("=== Profile demo ===\n");
    println!("Restored profile: {:?}", store.data(&profile.model)?);

    let running = store.start(&profile.get_profile, ());
    println!("Loading: {:?}", store.data(&profile.model)?);
    let current = running.wait().await?;
    println!("Loaded:  {current:?}");

    let lookups: Vec<_> = [7, 8, 9]
        .into_iter()
        .map(|id| store.start(&directory.get_profile_by_id, id))
        .collect();
    {
        let slice = store.slice(&directory.model)?;
        for id in [7_u32, 8, 9] {
            println!(
                "Lookup {id} loading: {}",
                slice.loading_for(&directory.get_profile_by_id, id)
            );
        }
    }
    for lookup in lookups {
        let key = lookup.key().cloned();
        if let Err(error) = lookup.wait().await {
            println!("Lookup {key:?} failed: {error}");
        }
    }

    let directory_data = store.data(&directory.model)?;
    println!("\nDirectory:");
    for record in directory_data.records.values() {
        println!("  {} -> {}", record.id, record.name);
    }
    println!("Missing: {:?}", directory_data.missing);

    let name = format!("{} (edited)", current.name);
    store.dispatch(profile.rename.action(name))?;
    store.flush().await?;
    println!("\nPersisted: {:?}", store.data(&profile.model)?);

    if let Some(text) = exporter.render() {
        println!("\n=== Metrics ===\n{text}");
    }
    Ok(())
}
