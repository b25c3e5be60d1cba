//! The persistent store.
//!
//! Entities live in a key-value backend (DynamoDB in production, in-memory
//! in tests) behind the [`StoreBackend`] trait. Single-item reads go through
//! TTL caches held by [`Store`]; every write invalidates the affected cache
//! entries before returning. Listings are never cached and must be treated
//! as eventually consistent.
//!
//! Each entity kind has its own module following the same shape: the entity
//! struct, a module error enum, and free functions taking the [`Store`].

pub mod access;
pub mod backend;
pub mod cache;
pub mod clusters;
pub mod groups;
pub mod instances;
pub mod secrets;
pub mod users;

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tempfile::NamedTempFile;
use utoipa::ToSchema;

pub use backend::{BackendError, DynamoBackend, StoreBackend};

use crate::config::CacheSettings;
use crate::db::cache::TtlCache;
use crate::db::clusters::Cluster;
use crate::db::groups::Group;
use crate::db::instances::ApplicationInstance;
use crate::db::secrets::Secret;
use crate::db::users::User;

pub(crate) const TABLE_USERS: &str = "users";
pub(crate) const TABLE_GROUPS: &str = "groups";
pub(crate) const TABLE_CLUSTERS: &str = "clusters";
pub(crate) const TABLE_INSTANCES: &str = "instances";
pub(crate) const TABLE_SECRETS: &str = "secrets";
pub(crate) const TABLE_MEMBERS: &str = "group_members";
pub(crate) const TABLE_ACCESS: &str = "cluster_access";
pub(crate) const TABLE_APP_ALLOWLIST: &str = "application_allowlist";

/// Every table the backend must provide.
pub(crate) const ALL_TABLES: &[&str] = &[
    TABLE_USERS,
    TABLE_GROUPS,
    TABLE_CLUSTERS,
    TABLE_INSTANCES,
    TABLE_SECRETS,
    TABLE_MEMBERS,
    TABLE_ACCESS,
    TABLE_APP_ALLOWLIST,
];

/// Sentinel granting cluster access to every group.
pub const WILDCARD: &str = "*";

/// Display name of the wildcard pseudo-group.
pub const WILDCARD_NAME: &str = "<all>";

/// A materialized kubeconfig scratch file.
///
/// Handles are shared between concurrent readers of the same cluster; the
/// file is removed when the last handle drops.
pub struct ClusterConfigFile {
    file: NamedTempFile,
}

impl ClusterConfigFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Hit/miss counters of a single cache.
#[derive(Debug, Serialize, ToSchema)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
}

/// Snapshot of all store cache counters, served by the statistics endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct StoreStatistics {
    pub users: CacheStatistics,
    pub groups: CacheStatistics,
    pub clusters: CacheStatistics,
    pub instances: CacheStatistics,
    pub secrets: CacheStatistics,
    pub reachability: CacheStatistics,
}

struct StoreInner {
    backend: Arc<dyn StoreBackend>,
    users: TtlCache<User>,
    users_by_token: TtlCache<User>,
    groups: TtlCache<Group>,
    groups_by_name: TtlCache<Group>,
    clusters: TtlCache<Cluster>,
    clusters_by_name: TtlCache<Cluster>,
    instances: TtlCache<ApplicationInstance>,
    secrets: TtlCache<Secret>,
    reachability: TtlCache<bool>,
    config_files: Mutex<HashMap<String, Weak<ClusterConfigFile>>>,
}

/// The store: a key-value backend plus per-entity TTL caches, the cluster
/// reachability cache, and the reference-counted kubeconfig scratch files.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(backend: Arc<dyn StoreBackend>, cache: &CacheSettings) -> Self {
        let entity_ttl = Duration::from_secs(cache.entity_ttl_secs);
        let reachability_ttl = Duration::from_secs(cache.reachability_ttl_secs);

        Self {
            inner: Arc::new(StoreInner {
                backend,
                users: TtlCache::new(entity_ttl),
                users_by_token: TtlCache::new(entity_ttl),
                groups: TtlCache::new(entity_ttl),
                groups_by_name: TtlCache::new(entity_ttl),
                clusters: TtlCache::new(entity_ttl),
                clusters_by_name: TtlCache::new(entity_ttl),
                instances: TtlCache::new(entity_ttl),
                secrets: TtlCache::new(entity_ttl),
                reachability: TtlCache::new(reachability_ttl),
                config_files: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn backend(&self) -> &dyn StoreBackend {
        self.inner.backend.as_ref()
    }

    pub(crate) fn user_cache(&self) -> &TtlCache<User> {
        &self.inner.users
    }

    pub(crate) fn user_token_cache(&self) -> &TtlCache<User> {
        &self.inner.users_by_token
    }

    pub(crate) fn group_cache(&self) -> &TtlCache<Group> {
        &self.inner.groups
    }

    pub(crate) fn group_name_cache(&self) -> &TtlCache<Group> {
        &self.inner.groups_by_name
    }

    pub(crate) fn cluster_cache(&self) -> &TtlCache<Cluster> {
        &self.inner.clusters
    }

    pub(crate) fn cluster_name_cache(&self) -> &TtlCache<Cluster> {
        &self.inner.clusters_by_name
    }

    pub(crate) fn instance_cache(&self) -> &TtlCache<ApplicationInstance> {
        &self.inner.instances
    }

    pub(crate) fn secret_cache(&self) -> &TtlCache<Secret> {
        &self.inner.secrets
    }

    /// Returns the cached reachability of a cluster, if still within TTL.
    pub fn cached_reachability(&self, cluster_id: &str) -> Option<bool> {
        self.inner.reachability.get(cluster_id)
    }

    /// Records the result of a reachability probe.
    pub fn cache_reachability(&self, cluster_id: &str, reachable: bool) {
        self.inner.reachability.insert(cluster_id, reachable);
    }

    /// Materializes the cluster's kubeconfig into a scratch file and returns
    /// a shared handle to it.
    ///
    /// Concurrent callers for the same cluster share one file; the file is
    /// deleted when the last handle drops.
    pub fn config_path_for_cluster(
        &self,
        cluster: &Cluster,
    ) -> Result<Arc<ClusterConfigFile>, std::io::Error> {
        let mut files = self.inner.config_files.lock().unwrap();
        files.retain(|_, weak| weak.strong_count() > 0);

        if let Some(existing) = files.get(&cluster.id).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let mut file = tempfile::Builder::new()
            .prefix("slate-kubeconfig-")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(cluster.kubeconfig.as_bytes())?;
        file.flush()?;

        let handle = Arc::new(ClusterConfigFile { file });
        files.insert(cluster.id.clone(), Arc::downgrade(&handle));

        Ok(handle)
    }

    /// Forgets the scratch file for a cluster so the next fetch
    /// re-materializes it. Existing handles keep their file alive.
    pub fn invalidate_cluster_config(&self, cluster_id: &str) {
        let mut files = self.inner.config_files.lock().unwrap();
        files.remove(cluster_id);
    }

    /// Snapshot of the cache hit/miss counters.
    pub fn statistics(&self) -> StoreStatistics {
        fn stats<V>(cache: &TtlCache<V>) -> CacheStatistics
        where
            V: Clone,
        {
            CacheStatistics {
                hits: cache.hits(),
                misses: cache.misses(),
            }
        }

        StoreStatistics {
            users: stats(&self.inner.users),
            groups: stats(&self.inner.groups),
            clusters: stats(&self.inner.clusters),
            instances: stats(&self.inner.instances),
            secrets: stats(&self.inner.secrets),
            reachability: stats(&self.inner.reachability),
        }
    }
}
