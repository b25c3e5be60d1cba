use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{BackendError, Store, TABLE_ACCESS, TABLE_APP_ALLOWLIST, WILDCARD};
use crate::db::clusters::Cluster;

#[derive(Debug, Error)]
pub enum AccessDbError {
    #[error("Error while interacting with the store for access records: {0}")]
    Backend(#[from] BackendError),

    #[error("Stored access record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// An access grant of a cluster to a group.
///
/// `group` may be the wildcard sentinel, granting access to every group. The
/// owning group never has a record; its access is implicit and cannot be
/// revoked.
#[derive(Debug, Serialize, Deserialize)]
struct AccessGrant {
    group: String,
    cluster: String,
}

/// An allow-list entry permitting a group to install an application on a
/// cluster. Meaningful only while the matching access grant exists.
#[derive(Debug, Serialize, Deserialize)]
struct ApplicationGrant {
    group: String,
    cluster: String,
    application: String,
}

fn access_key(group_id: &str, cluster_id: &str) -> String {
    format!("{group_id}:{cluster_id}")
}

fn application_key(group_id: &str, cluster_id: &str, application: &str) -> String {
    format!("{group_id}:{cluster_id}:{application}")
}

pub async fn grant_group_access(
    store: &Store,
    group_id: &str,
    cluster_id: &str,
) -> Result<(), AccessDbError> {
    let grant = AccessGrant {
        group: group_id.to_string(),
        cluster: cluster_id.to_string(),
    };
    let doc = serde_json::to_string(&grant)?;
    store
        .backend()
        .put(
            TABLE_ACCESS,
            &access_key(group_id, cluster_id),
            &[
                ("group_id", group_id.to_string()),
                ("cluster_id", cluster_id.to_string()),
            ],
            doc,
        )
        .await?;

    Ok(())
}

pub async fn revoke_group_access(
    store: &Store,
    group_id: &str,
    cluster_id: &str,
) -> Result<(), AccessDbError> {
    store
        .backend()
        .delete(TABLE_ACCESS, &access_key(group_id, cluster_id))
        .await?;

    Ok(())
}

/// Lists the group ids holding explicit access grants on a cluster.
///
/// May contain the wildcard sentinel. Does not include the owning group,
/// whose access is implicit.
pub async fn list_groups_allowed_on_cluster(
    store: &Store,
    cluster_id: &str,
) -> Result<Vec<String>, AccessDbError> {
    let docs = store
        .backend()
        .find(TABLE_ACCESS, &[("cluster_id", cluster_id.to_string())])
        .await?;

    let mut groups = Vec::new();
    for doc in docs {
        let grant: AccessGrant = serde_json::from_str(&doc)?;
        groups.push(grant.group);
    }

    Ok(groups)
}

/// Whether the group may use the cluster: owning group, wildcard grant, or
/// explicit grant.
pub async fn group_may_access_cluster(
    store: &Store,
    group_id: &str,
    cluster: &Cluster,
) -> Result<bool, AccessDbError> {
    if group_id == cluster.owning_group {
        return Ok(true);
    }
    if store
        .backend()
        .get(TABLE_ACCESS, &access_key(WILDCARD, &cluster.id))
        .await?
        .is_some()
    {
        return Ok(true);
    }

    Ok(store
        .backend()
        .get(TABLE_ACCESS, &access_key(group_id, &cluster.id))
        .await?
        .is_some())
}

pub async fn allow_group_application(
    store: &Store,
    group_id: &str,
    cluster_id: &str,
    application: &str,
) -> Result<(), AccessDbError> {
    let grant = ApplicationGrant {
        group: group_id.to_string(),
        cluster: cluster_id.to_string(),
        application: application.to_string(),
    };
    let doc = serde_json::to_string(&grant)?;
    store
        .backend()
        .put(
            TABLE_APP_ALLOWLIST,
            &application_key(group_id, cluster_id, application),
            &[
                ("group_id", group_id.to_string()),
                ("cluster_id", cluster_id.to_string()),
                ("application", application.to_string()),
            ],
            doc,
        )
        .await?;

    Ok(())
}

pub async fn deny_group_application(
    store: &Store,
    group_id: &str,
    cluster_id: &str,
    application: &str,
) -> Result<(), AccessDbError> {
    store
        .backend()
        .delete(
            TABLE_APP_ALLOWLIST,
            &application_key(group_id, cluster_id, application),
        )
        .await?;

    Ok(())
}

/// Lists the applications a group has been allowed to install on a cluster.
///
/// May contain the wildcard sentinel, which permits every application.
pub async fn list_allowed_applications(
    store: &Store,
    group_id: &str,
    cluster_id: &str,
) -> Result<Vec<String>, AccessDbError> {
    let docs = store
        .backend()
        .find(
            TABLE_APP_ALLOWLIST,
            &[
                ("group_id", group_id.to_string()),
                ("cluster_id", cluster_id.to_string()),
            ],
        )
        .await?;

    let mut applications = Vec::new();
    for doc in docs {
        let grant: ApplicationGrant = serde_json::from_str(&doc)?;
        applications.push(grant.application);
    }

    Ok(applications)
}

/// Whether the group may install the application on the cluster.
///
/// The owning group may install anything; other groups need an allow-list
/// entry for the application or the wildcard.
pub async fn group_may_use_application(
    store: &Store,
    group_id: &str,
    cluster: &Cluster,
    application: &str,
) -> Result<bool, AccessDbError> {
    if group_id == cluster.owning_group {
        return Ok(true);
    }

    let allowed = list_allowed_applications(store, group_id, &cluster.id).await?;

    Ok(allowed
        .iter()
        .any(|entry| entry == application || entry == WILDCARD))
}

/// Removes every access and allow-list record referencing a cluster.
pub async fn remove_all_records_for_cluster(
    store: &Store,
    cluster_id: &str,
) -> Result<(), AccessDbError> {
    let grants = store
        .backend()
        .find(TABLE_ACCESS, &[("cluster_id", cluster_id.to_string())])
        .await?;
    for doc in grants {
        let grant: AccessGrant = serde_json::from_str(&doc)?;
        store
            .backend()
            .delete(TABLE_ACCESS, &access_key(&grant.group, &grant.cluster))
            .await?;
    }

    let applications = store
        .backend()
        .find(TABLE_APP_ALLOWLIST, &[("cluster_id", cluster_id.to_string())])
        .await?;
    for doc in applications {
        let grant: ApplicationGrant = serde_json::from_str(&doc)?;
        store
            .backend()
            .delete(
                TABLE_APP_ALLOWLIST,
                &application_key(&grant.group, &grant.cluster, &grant.application),
            )
            .await?;
    }

    Ok(())
}

/// Removes every access and allow-list record referencing a group.
pub async fn remove_all_records_for_group(
    store: &Store,
    group_id: &str,
) -> Result<(), AccessDbError> {
    let grants = store
        .backend()
        .find(TABLE_ACCESS, &[("group_id", group_id.to_string())])
        .await?;
    for doc in grants {
        let grant: AccessGrant = serde_json::from_str(&doc)?;
        store
            .backend()
            .delete(TABLE_ACCESS, &access_key(&grant.group, &grant.cluster))
            .await?;
    }

    let applications = store
        .backend()
        .find(TABLE_APP_ALLOWLIST, &[("group_id", group_id.to_string())])
        .await?;
    for doc in applications {
        let grant: ApplicationGrant = serde_json::from_str(&doc)?;
        store
            .backend()
            .delete(
                TABLE_APP_ALLOWLIST,
                &application_key(&grant.group, &grant.cluster, &grant.application),
            )
            .await?;
    }

    Ok(())
}
