use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{BackendError, Store, TABLE_INSTANCES};

#[derive(Debug, Error)]
pub enum InstancesDbError {
    #[error("Error while interacting with the store for application instances: {0}")]
    Backend(#[from] BackendError),

    #[error("Stored application instance record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A managed Helm release pinned to a group and a cluster.
///
/// The name is tenant-qualified (`<group-name>-<release>`) and matches the
/// Helm release name on the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationInstance {
    pub id: String,
    pub name: String,
    pub application: String,
    pub group: String,
    pub cluster: String,
    pub created: DateTime<Utc>,
    pub configuration: String,
}

pub async fn create_instance(
    store: &Store,
    instance: &ApplicationInstance,
) -> Result<(), InstancesDbError> {
    let doc = serde_json::to_string(instance)?;
    store
        .backend()
        .put(
            TABLE_INSTANCES,
            &instance.id,
            &[
                ("name", instance.name.clone()),
                ("group_id", instance.group.clone()),
                ("cluster_id", instance.cluster.clone()),
            ],
            doc,
        )
        .await?;

    store.instance_cache().invalidate(&instance.id);

    Ok(())
}

pub async fn get_instance(
    store: &Store,
    instance_id: &str,
) -> Result<Option<ApplicationInstance>, InstancesDbError> {
    if let Some(instance) = store.instance_cache().get(instance_id) {
        return Ok(Some(instance));
    }

    let Some(doc) = store.backend().get(TABLE_INSTANCES, instance_id).await? else {
        return Ok(None);
    };
    let instance: ApplicationInstance = serde_json::from_str(&doc)?;
    store.instance_cache().insert(&instance.id, instance.clone());

    Ok(Some(instance))
}

pub async fn delete_instance(store: &Store, instance_id: &str) -> Result<(), InstancesDbError> {
    store.backend().delete(TABLE_INSTANCES, instance_id).await?;

    store.instance_cache().invalidate(instance_id);

    Ok(())
}

/// Lists instances, optionally narrowed by group and/or cluster.
pub async fn list_instances(
    store: &Store,
    group_id: Option<&str>,
    cluster_id: Option<&str>,
) -> Result<Vec<ApplicationInstance>, InstancesDbError> {
    let mut filters = Vec::new();
    if let Some(group_id) = group_id {
        filters.push(("group_id", group_id.to_string()));
    }
    if let Some(cluster_id) = cluster_id {
        filters.push(("cluster_id", cluster_id.to_string()));
    }

    let docs = store.backend().find(TABLE_INSTANCES, &filters).await?;

    docs.iter()
        .map(|doc| serde_json::from_str(doc).map_err(InstancesDbError::from))
        .collect()
}

/// Finds the instance with the given tenant-qualified name on a cluster.
pub async fn find_instance_by_name(
    store: &Store,
    cluster_id: &str,
    name: &str,
) -> Result<Option<ApplicationInstance>, InstancesDbError> {
    let docs = store
        .backend()
        .find(
            TABLE_INSTANCES,
            &[
                ("cluster_id", cluster_id.to_string()),
                ("name", name.to_string()),
            ],
        )
        .await?;
    let Some(doc) = docs.first() else {
        return Ok(None);
    };

    Ok(Some(serde_json::from_str(doc)?))
}
