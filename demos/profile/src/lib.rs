//! Profile demo for modelstore.
//!
//! Two models share one store:
//!
//! - `Profile` holds the signed-in profile. `getProfile` is scalar: it shows a
//!   placeholder while loading and replaces it with the response.
//! - `Directory` caches profiles by id. `getProfileById` is keyed by the `id`
//!   field, so lookups for different ids load independently. It also listens
//!   to `getProfile` successes to cache the signed-in profile.
//!
//! Transport calls go through a [`ProfileApi`], injected when the models are
//! built.

use futures::future::BoxFuture;
use modelstore_core::{
    Action, AsyncOperation, MetaPolicy, Model, OperationError, Phase, SyncOperation,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// A user profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Profile id
    pub id: u32,
    /// Display name
    pub name: String,
}

impl Profile {
    /// Create a profile
    #[must_use]
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Shown while the signed-in profile loads
    #[must_use]
    pub fn placeholder() -> Self {
        Self::new(666, "iPhone")
    }
}

/// Cached profiles by id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    /// Profiles fetched so far
    pub records: BTreeMap<u32, Profile>,
    /// Ids whose last lookup failed
    pub missing: Vec<u32>,
}

/// Backend for profile lookups.
pub trait ProfileApi: Send + Sync {
    /// The signed-in profile
    fn current(&self) -> BoxFuture<'static, Result<Profile, OperationError>>;

    /// The profile with `id`
    fn by_id(&self, id: u32) -> BoxFuture<'static, Result<Profile, OperationError>>;
}

/// In-memory [`ProfileApi`] with a fixed latency.
#[derive(Debug, Clone)]
pub struct StaticProfileApi {
    current: Profile,
    profiles: Arc<HashMap<u32, Profile>>,
    latency: Duration,
}

impl StaticProfileApi {
    /// Serve `profiles`, with `current` as the signed-in one
    #[must_use]
    pub fn new(current: Profile, profiles: impl IntoIterator<Item = Profile>) -> Self {
        Self {
            current,
            profiles: Arc::new(profiles.into_iter().map(|p| (p.id, p)).collect()),
            latency: Duration::ZERO,
        }
    }

    /// Delay every response by `latency`
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl ProfileApi for StaticProfileApi {
    fn current(&self) -> BoxFuture<'static, Result<Profile, OperationError>> {
        let profile = self.current.clone();
        let latency = self.latency;
        Box::pin(async move {
            tokio::time::sleep(latency).await;
            Ok(profile)
        })
    }

    fn by_id(&self, id: u32) -> BoxFuture<'static, Result<Profile, OperationError>> {
        let profile = self.profiles.get(&id).cloned();
        let latency = self.latency;
        Box::pin(async move {
            tokio::time::sleep(latency).await;
            profile.ok_or_else(|| OperationError::new(format!("no profile {id}")).with_code("404"))
        })
    }
}

/// The `Profile` model and its operations
pub struct ProfileModel {
    /// The model
    pub model: Model<Profile>,
    /// Fetch the signed-in profile
    pub get_profile: AsyncOperation<(), Profile>,
    /// Change the display name locally
    pub rename: SyncOperation<String>,
}

impl ProfileModel {
    /// Declare the model against `api`
    #[must_use]
    pub fn new(api: Arc<dyn ProfileApi>) -> Self {
        let mut model = Model::new("Profile", || Profile::new(1, "init"));

        let get_profile = model
            .async_operation("getProfile", move |_: &()| api.current())
            .on_prepare(|data: &mut Profile, _: &()| *data = Profile::placeholder())
            .on_success(|data: &mut Profile, _: &(), response: &Profile| {
                data.clone_from(response);
            })
            .build();

        let rename = model.sync_operation("rename", |data: &mut Profile, name: &String| {
            data.name.clone_from(name);
        });

        Self {
            model,
            get_profile,
            rename,
        }
    }
}

/// The `Directory` model and its operations
pub struct DirectoryModel {
    /// The model
    pub model: Model<Directory>,
    /// Fetch one profile, keyed by id
    pub get_profile_by_id: AsyncOperation<u32, Profile>,
}

impl DirectoryModel {
    /// Declare the model against `api`; caches successes of `profile.get_profile`
    #[must_use]
    pub fn new(api: Arc<dyn ProfileApi>, profile: &ProfileModel) -> Self {
        let mut model = Model::new("Directory", Directory::default);

        let get_profile_by_id = model
            .async_operation("getProfileById", move |id: &u32| api.by_id(*id))
            .meta(MetaPolicy::field("id", |id: &u32| *id))
            .on_success(|directory: &mut Directory, id: &u32, response: &Profile| {
                directory.missing.retain(|missing| missing != id);
                directory.records.insert(*id, response.clone());
            })
            .on_fail(|directory: &mut Directory, id: &u32, _: &OperationError| {
                if !directory.missing.contains(id) {
                    directory.missing.push(*id);
                }
            })
            .build();

        model.on(
            profile.get_profile.phase(Phase::Success),
            |directory: &mut Directory, action: &Action| {
                if let Some(current) = action.response::<Profile>() {
                    directory.records.insert(current.id, current.clone());
                }
            },
        );

        Self {
            model,
            get_profile_by_id,
        }
    }
}
