use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{BackendError, Store, TABLE_SECRETS};
use crate::encryption::EncryptedValue;

#[derive(Debug, Error)]
pub enum SecretsDbError {
    #[error("Error while interacting with the store for secrets: {0}")]
    Backend(#[from] BackendError),

    #[error("Stored secret record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// An opaque key/value bundle materialized as a Kubernetes Secret in a
/// group's namespace on a cluster.
///
/// Contents are sealed with the service encryption key before they reach the
/// backend; the plaintext never leaves the request that carries it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub id: String,
    pub name: String,
    pub group: String,
    pub cluster: String,
    pub created: DateTime<Utc>,
    pub contents: EncryptedValue,
}

pub async fn create_secret(store: &Store, secret: &Secret) -> Result<(), SecretsDbError> {
    let doc = serde_json::to_string(secret)?;
    store
        .backend()
        .put(
            TABLE_SECRETS,
            &secret.id,
            &[
                ("name", secret.name.clone()),
                ("group_id", secret.group.clone()),
                ("cluster_id", secret.cluster.clone()),
            ],
            doc,
        )
        .await?;

    store.secret_cache().invalidate(&secret.id);

    Ok(())
}

pub async fn get_secret(store: &Store, secret_id: &str) -> Result<Option<Secret>, SecretsDbError> {
    if let Some(secret) = store.secret_cache().get(secret_id) {
        return Ok(Some(secret));
    }

    let Some(doc) = store.backend().get(TABLE_SECRETS, secret_id).await? else {
        return Ok(None);
    };
    let secret: Secret = serde_json::from_str(&doc)?;
    store.secret_cache().insert(&secret.id, secret.clone());

    Ok(Some(secret))
}

pub async fn delete_secret(store: &Store, secret_id: &str) -> Result<(), SecretsDbError> {
    store.backend().delete(TABLE_SECRETS, secret_id).await?;

    store.secret_cache().invalidate(secret_id);

    Ok(())
}

/// Lists secrets, optionally narrowed by group and/or cluster.
pub async fn list_secrets(
    store: &Store,
    group_id: Option<&str>,
    cluster_id: Option<&str>,
) -> Result<Vec<Secret>, SecretsDbError> {
    let mut filters = Vec::new();
    if let Some(group_id) = group_id {
        filters.push(("group_id", group_id.to_string()));
    }
    if let Some(cluster_id) = cluster_id {
        filters.push(("cluster_id", cluster_id.to_string()));
    }

    let docs = store.backend().find(TABLE_SECRETS, &filters).await?;

    docs.iter()
        .map(|doc| serde_json::from_str(doc).map_err(SecretsDbError::from))
        .collect()
}

/// Finds the secret with the given name for a group on a cluster.
pub async fn find_secret_by_name(
    store: &Store,
    group_id: &str,
    cluster_id: &str,
    name: &str,
) -> Result<Option<Secret>, SecretsDbError> {
    let docs = store
        .backend()
        .find(
            TABLE_SECRETS,
            &[
                ("group_id", group_id.to_string()),
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
