use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::{BackendError, Store, TABLE_CLUSTERS};

#[derive(Debug, Error)]
pub enum ClustersDbError {
    #[error("Error while interacting with the store for clusters: {0}")]
    Backend(#[from] BackendError),

    #[error("Stored cluster record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A geographic coordinate advertised for a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
}

/// A registered Kubernetes cluster.
///
/// The kubeconfig is embedded verbatim; `system_namespace` is the namespace
/// of the kubeconfig's default context and is where Tiller lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub owning_group: String,
    pub owning_organization: String,
    pub kubeconfig: String,
    pub system_namespace: String,
    pub locations: Vec<GeoLocation>,
    pub valid: bool,
}

pub async fn create_cluster(store: &Store, cluster: &Cluster) -> Result<(), ClustersDbError> {
    let doc = serde_json::to_string(cluster)?;
    store
        .backend()
        .put(
            TABLE_CLUSTERS,
            &cluster.id,
            &[
                ("name", cluster.name.clone()),
                ("owning_group", cluster.owning_group.clone()),
            ],
            doc,
        )
        .await?;

    store.cluster_cache().invalidate(&cluster.id);
    store.cluster_name_cache().invalidate(&cluster.name);
    store.invalidate_cluster_config(&cluster.id);

    Ok(())
}

pub async fn update_cluster(store: &Store, cluster: &Cluster) -> Result<(), ClustersDbError> {
    create_cluster(store, cluster).await
}

pub async fn get_cluster(
    store: &Store,
    cluster_id: &str,
) -> Result<Option<Cluster>, ClustersDbError> {
    if let Some(cluster) = store.cluster_cache().get(cluster_id) {
        return Ok(Some(cluster));
    }

    let Some(doc) = store.backend().get(TABLE_CLUSTERS, cluster_id).await? else {
        return Ok(None);
    };
    let cluster: Cluster = serde_json::from_str(&doc)?;
    store.cluster_cache().insert(&cluster.id, cluster.clone());

    Ok(Some(cluster))
}

pub async fn find_cluster_by_name(
    store: &Store,
    name: &str,
) -> Result<Option<Cluster>, ClustersDbError> {
    if let Some(cluster) = store.cluster_name_cache().get(name) {
        return Ok(Some(cluster));
    }

    let docs = store
        .backend()
        .find(TABLE_CLUSTERS, &[("name", name.to_string())])
        .await?;
    let Some(doc) = docs.first() else {
        return Ok(None);
    };
    let cluster: Cluster = serde_json::from_str(doc)?;
    store.cluster_name_cache().insert(name, cluster.clone());
    store.cluster_cache().insert(&cluster.id, cluster.clone());

    Ok(Some(cluster))
}

pub async fn delete_cluster(store: &Store, cluster: &Cluster) -> Result<(), ClustersDbError> {
    store.backend().delete(TABLE_CLUSTERS, &cluster.id).await?;

    store.cluster_cache().invalidate(&cluster.id);
    store.cluster_name_cache().invalidate(&cluster.name);
    store.invalidate_cluster_config(&cluster.id);

    Ok(())
}

pub async fn list_clusters(store: &Store) -> Result<Vec<Cluster>, ClustersDbError> {
    let docs = store.backend().find(TABLE_CLUSTERS, &[]).await?;

    docs.iter()
        .map(|doc| serde_json::from_str(doc).map_err(ClustersDbError::from))
        .collect()
}

pub async fn list_clusters_by_group(
    store: &Store,
    group_id: &str,
) -> Result<Vec<Cluster>, ClustersDbError> {
    let docs = store
        .backend()
        .find(TABLE_CLUSTERS, &[("owning_group", group_id.to_string())])
        .await?;

    docs.iter()
        .map(|doc| serde_json::from_str(doc).map_err(ClustersDbError::from))
        .collect()
}

/// Replaces the advertised locations of a cluster.
///
/// Returns `None` if the cluster does not exist.
pub async fn set_locations(
    store: &Store,
    cluster_id: &str,
    locations: Vec<GeoLocation>,
) -> Result<Option<()>, ClustersDbError> {
    let Some(mut cluster) = get_cluster(store, cluster_id).await? else {
        return Ok(None);
    };
    cluster.locations = locations;
    update_cluster(store, &cluster).await?;

    Ok(Some(()))
}
