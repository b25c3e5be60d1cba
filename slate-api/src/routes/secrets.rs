use std::collections::HashMap;
use std::io::Write;

use actix_web::{
    HttpResponse, Responder, ResponseError, delete, get,
    http::{StatusCode, header::ContentType},
    post,
    web::{Data, Json, Path, Query},
};
use base64::{Engine, prelude::BASE64_STANDARD};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::authentication::{AuthError, authenticate, require_group_member};
use crate::db::access::AccessDbError;
use crate::db::clusters::ClustersDbError;
use crate::db::groups::GroupsDbError;
use crate::db::secrets::{Secret, SecretsDbError};
use crate::db::{
    ClusterConfigFile, Store, access, clusters as clusters_db, groups, secrets as secrets_db,
};
use crate::encryption::{self, DecryptionError, EncryptionError, EncryptionKey};
use crate::ids::IdGenerator;
use crate::kube::{DriverError, KubeDriver, ensure_namespace};
use crate::routes::{
    API_VERSION, ErrorMessage, cluster_by_name_or_id, flag_set, group_by_name_or_id,
};

#[derive(Debug, Error)]
pub enum SecretError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Secret not found")]
    SecretNotFound,

    #[error("Group not found")]
    GroupNotFound,

    #[error("Cluster not found")]
    ClusterNotFound,

    #[error("Secret names must consist of lowercase letters, digits, `-`, and `.`")]
    InvalidName,

    #[error("Secret value for key {0} is not valid base64")]
    InvalidContents(String),

    #[error("Exactly one of contents or copy source must be given")]
    ContentsMissing,

    #[error("A secret with this name already exists for this group on this cluster")]
    NameInUse,

    #[error("Failed to push secret to cluster: {0}")]
    KubectlFailed(String),

    #[error("A kube driver error occurred: {0}")]
    Driver(#[from] DriverError),

    #[error("Failed to write scratch file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error(transparent)]
    SecretsDb(#[from] SecretsDbError),

    #[error(transparent)]
    GroupsDb(#[from] GroupsDbError),

    #[error(transparent)]
    ClustersDb(#[from] ClustersDbError),

    #[error(transparent)]
    AccessDb(#[from] AccessDbError),
}

impl SecretError {
    fn to_message(&self) -> String {
        match self {
            // Do not expose store, driver, or crypto details in error messages
            SecretError::Driver(_)
            | SecretError::Io(_)
            | SecretError::Encryption(_)
            | SecretError::Decryption(_)
            | SecretError::SecretsDb(_)
            | SecretError::GroupsDb(_)
            | SecretError::ClustersDb(_)
            | SecretError::AccessDb(_)
            | SecretError::Auth(AuthError::UsersDb(_))
            | SecretError::Auth(AuthError::GroupsDb(_)) => "internal server error".to_string(),
            e => e.to_string(),
        }
    }
}

impl ResponseError for SecretError {
    fn status_code(&self) -> StatusCode {
        match self {
            SecretError::Auth(AuthError::NotAuthorized) => StatusCode::FORBIDDEN,
            SecretError::SecretNotFound
            | SecretError::GroupNotFound
            | SecretError::ClusterNotFound => StatusCode::NOT_FOUND,
            SecretError::InvalidName
            | SecretError::InvalidContents(_)
            | SecretError::ContentsMissing => StatusCode::BAD_REQUEST,
            SecretError::NameInUse => StatusCode::CONFLICT,
            SecretError::Auth(_)
            | SecretError::KubectlFailed(_)
            | SecretError::Driver(_)
            | SecretError::Io(_)
            | SecretError::Encryption(_)
            | SecretError::Decryption(_)
            | SecretError::SecretsDb(_)
            | SecretError::GroupsDb(_)
            | SecretError::ClustersDb(_)
            | SecretError::AccessDb(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let error_message = ErrorMessage::new(self.to_message());
        let body =
            serde_json::to_string(&error_message).expect("failed to serialize error message");
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .body(body)
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SecretListQuery {
    pub token: Option<String>,
    /// Restrict the listing to secrets owned by this group (name or id).
    pub group: Option<String>,
    /// Restrict the listing to secrets on this cluster (name or id).
    pub cluster: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SecretDeleteQuery {
    pub token: Option<String>,
    /// When present, the store record is removed even if kubectl fails.
    pub force: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateSecretRequest {
    pub metadata: CreateSecretMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSecretMetadata {
    #[schema(example = "db-credentials")]
    pub name: String,
    /// Name or id of the owning group.
    pub group: String,
    /// Name or id of the target cluster.
    pub cluster: String,
    /// Key to base64-encoded value mapping. Mutually exclusive with `copyFrom`.
    pub contents: Option<HashMap<String, String>>,
    /// Id of an existing secret whose contents are copied byte-exact.
    pub copy_from: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretCreatedResponse {
    pub api_version: String,
    pub kind: String,
    pub metadata: SecretCreatedMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SecretCreatedMetadata {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretResponse {
    pub api_version: String,
    pub kind: String,
    pub metadata: SecretMetadata,
    /// Key to base64-encoded value mapping; only present on single reads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretMetadata {
    pub id: String,
    pub name: String,
    /// Name of the owning group.
    pub group: String,
    /// Name of the cluster the secret lives on.
    pub cluster: String,
    pub created: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretListResponse {
    pub api_version: String,
    pub items: Vec<SecretResponse>,
}

fn valid_secret_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
}

async fn secret_response(
    store: &Store,
    secret: Secret,
    contents: Option<HashMap<String, String>>,
) -> Result<SecretResponse, SecretError> {
    let group = groups::get_group(store, &secret.group)
        .await?
        .map(|group| group.name)
        .unwrap_or(secret.group);
    let cluster = clusters_db::get_cluster(store, &secret.cluster)
        .await?
        .map(|cluster| cluster.name)
        .unwrap_or(secret.cluster);

    Ok(SecretResponse {
        api_version: API_VERSION.to_string(),
        kind: "Secret".to_string(),
        metadata: SecretMetadata {
            id: secret.id,
            name: secret.name,
            group,
            cluster,
            created: secret.created.to_rfc3339(),
        },
        contents,
    })
}

#[utoipa::path(
    summary = "List secrets",
    description = "Returns secrets, narrowed by group and/or cluster. Non-admins must narrow \
        to a group they belong to.",
    params(SecretListQuery),
    responses(
        (status = 200, description = "Secrets listed successfully", body = SecretListResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Secrets",
)]
#[get("/secrets")]
pub async fn list_secrets(
    store: Data<Store>,
    query: Query<SecretListQuery>,
) -> Result<impl Responder, SecretError> {
    let user = authenticate(&store, query.token.as_deref()).await?;

    let group_id = match &query.group {
        Some(group_ref) => {
            let group = group_by_name_or_id(&store, group_ref)
                .await?
                .ok_or(SecretError::GroupNotFound)?;
            require_group_member(&store, &user, &group.id).await?;
            Some(group.id)
        }
        None => {
            // Listing across all groups reveals tenant inventory.
            if !user.admin {
                return Err(AuthError::NotAuthorized.into());
            }
            None
        }
    };
    let cluster_id = match &query.cluster {
        Some(cluster_ref) => Some(
            cluster_by_name_or_id(&store, cluster_ref)
                .await?
                .ok_or(SecretError::ClusterNotFound)?
                .id,
        ),
        None => None,
    };

    let secrets =
        secrets_db::list_secrets(&store, group_id.as_deref(), cluster_id.as_deref()).await?;
    let mut items = Vec::with_capacity(secrets.len());
    for secret in secrets {
        items.push(secret_response(&store, secret, None).await?);
    }

    Ok(Json(SecretListResponse {
        api_version: API_VERSION.to_string(),
        items,
    }))
}

#[utoipa::path(
    summary = "Create a secret",
    description = "Pushes an Opaque Kubernetes Secret into the group's namespace on the target \
        cluster and records it. Contents may be copied byte-exact from an existing secret.",
    params(crate::routes::TokenQuery),
    request_body = CreateSecretRequest,
    responses(
        (status = 200, description = "Secret created", body = SecretCreatedResponse),
        (status = 400, description = "Bad request", body = ErrorMessage),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Group or cluster not found", body = ErrorMessage),
        (status = 409, description = "Secret name already in use", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Secrets",
)]
#[post("/secrets")]
pub async fn create_secret(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    encryption_key: Data<EncryptionKey>,
    query: Query<crate::routes::TokenQuery>,
    body: Json<CreateSecretRequest>,
) -> Result<impl Responder, SecretError> {
    let user = authenticate(&store, query.token.as_deref()).await?;
    let metadata = body.into_inner().metadata;

    let group = group_by_name_or_id(&store, &metadata.group)
        .await?
        .ok_or(SecretError::GroupNotFound)?;
    require_group_member(&store, &user, &group.id).await?;

    let cluster = cluster_by_name_or_id(&store, &metadata.cluster)
        .await?
        .ok_or(SecretError::ClusterNotFound)?;
    if !access::group_may_access_cluster(&store, &group.id, &cluster).await? {
        return Err(AuthError::NotAuthorized.into());
    }

    if !valid_secret_name(&metadata.name) {
        return Err(SecretError::InvalidName);
    }
    if secrets_db::find_secret_by_name(&store, &group.id, &cluster.id, &metadata.name)
        .await?
        .is_some()
    {
        return Err(SecretError::NameInUse);
    }

    let contents = match (metadata.contents, metadata.copy_from) {
        (Some(contents), None) => contents,
        (None, Some(source_id)) => {
            let source = secrets_db::get_secret(&store, &source_id)
                .await?
                .ok_or(SecretError::SecretNotFound)?;
            require_group_member(&store, &user, &source.group).await?;
            encryption::decrypt_contents(&source.contents, &encryption_key)?
        }
        _ => return Err(SecretError::ContentsMissing),
    };

    for (key, value) in &contents {
        if BASE64_STANDARD.decode(value).is_err() {
            return Err(SecretError::InvalidContents(key.clone()));
        }
    }

    let config_path = store.config_path_for_cluster(&cluster)?;
    push_secret_manifest(
        driver.get_ref(),
        &config_path,
        &group.namespace_name(),
        &metadata.name,
        &contents,
    )
    .await?;

    let secret = Secret {
        id: IdGenerator::instance().secret_id(),
        name: metadata.name,
        group: group.id.clone(),
        cluster: cluster.id.clone(),
        created: Utc::now(),
        contents: encryption::encrypt_contents(&contents, &encryption_key)?,
    };
    secrets_db::create_secret(&store, &secret).await?;

    info!(secret = %secret.id, name = %secret.name, cluster = %cluster.id, group = %group.id,
        by = %user.id, "secret created");

    Ok(Json(SecretCreatedResponse {
        api_version: API_VERSION.to_string(),
        kind: "Secret".to_string(),
        metadata: SecretCreatedMetadata {
            id: secret.id,
            name: secret.name,
        },
    }))
}

#[utoipa::path(
    summary = "Retrieve a secret",
    description = "Returns a secret with its decrypted, base64-encoded contents.",
    params(("secret_id" = String, Path, description = "Id of the secret"), crate::routes::TokenQuery),
    responses(
        (status = 200, description = "Secret retrieved successfully", body = SecretResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Secret not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Secrets",
)]
#[get("/secrets/{secret_id}")]
pub async fn get_secret(
    store: Data<Store>,
    encryption_key: Data<EncryptionKey>,
    query: Query<crate::routes::TokenQuery>,
    secret_id: Path<String>,
) -> Result<impl Responder, SecretError> {
    let user = authenticate(&store, query.token.as_deref()).await?;

    let secret = secrets_db::get_secret(&store, &secret_id.into_inner())
        .await?
        .ok_or(SecretError::SecretNotFound)?;
    require_group_member(&store, &user, &secret.group).await?;

    let contents = encryption::decrypt_contents(&secret.contents, &encryption_key)?;

    Ok(Json(secret_response(&store, secret, Some(contents)).await?))
}

#[utoipa::path(
    summary = "Delete a secret",
    description = "Removes the Kubernetes Secret from the cluster, then the store record. With \
        `force`, the record is removed regardless of the kubectl outcome.",
    params(("secret_id" = String, Path, description = "Id of the secret"), SecretDeleteQuery),
    responses(
        (status = 200, description = "Secret deleted successfully"),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Secret not found", body = ErrorMessage),
        (status = 500, description = "Deletion failed", body = ErrorMessage),
    ),
    tag = "Secrets",
)]
#[delete("/secrets/{secret_id}")]
pub async fn delete_secret(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    query: Query<SecretDeleteQuery>,
    secret_id: Path<String>,
) -> Result<impl Responder, SecretError> {
    let user = authenticate(&store, query.token.as_deref()).await?;

    let secret = secrets_db::get_secret(&store, &secret_id.into_inner())
        .await?
        .ok_or(SecretError::SecretNotFound)?;
    require_group_member(&store, &user, &secret.group).await?;

    let cluster = clusters_db::get_cluster(&store, &secret.cluster)
        .await?
        .ok_or(SecretError::ClusterNotFound)?;
    let config_path = store.config_path_for_cluster(&cluster)?;

    let force = flag_set(&query.force);
    delete_secret_resources(&store, driver.get_ref(), &config_path, &secret, force).await?;

    info!(secret = %secret.id, by = %user.id, force, "secret deleted");

    Ok(HttpResponse::Ok().finish())
}

/// Writes the Opaque Secret manifest to a scratch file and applies it.
///
/// `kubectl apply` keeps the push idempotent, which repair relies on.
pub(crate) async fn push_secret_manifest(
    driver: &dyn KubeDriver,
    config_path: &ClusterConfigFile,
    namespace: &str,
    name: &str,
    contents: &HashMap<String, String>,
) -> Result<(), SecretError> {
    let prepared = ensure_namespace(driver, config_path.path(), namespace).await?;
    if !prepared.success() {
        return Err(SecretError::KubectlFailed(prepared.stderr));
    }

    let manifest = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {
            "name": name,
            "namespace": namespace,
        },
        "data": contents,
    });
    let mut manifest_file = tempfile::Builder::new()
        .prefix("slate-secret-")
        .suffix(".json")
        .tempfile()?;
    manifest_file.write_all(manifest.to_string().as_bytes())?;
    manifest_file.flush()?;
    let manifest_path = manifest_file.path().to_string_lossy().into_owned();

    let applied = driver
        .kubectl(config_path.path(), &["apply", "-f", &manifest_path])
        .await?;
    if !applied.success() {
        return Err(SecretError::KubectlFailed(applied.stderr));
    }

    Ok(())
}

/// Deletes a secret's Kubernetes object and store record.
///
/// With `force`, a kubectl failure is logged and the record still removed.
pub(crate) async fn delete_secret_resources(
    store: &Store,
    driver: &dyn KubeDriver,
    config_path: &ClusterConfigFile,
    secret: &Secret,
    force: bool,
) -> Result<(), SecretError> {
    // The group may already be mid-deletion; fall back to the record's id,
    // which cannot name a live namespace, and let kubectl fail benignly.
    let namespace = groups::get_group(store, &secret.group)
        .await?
        .map(|group| group.namespace_name())
        .unwrap_or_else(|| secret.group.clone());

    let result = driver
        .kubectl(
            config_path.path(),
            &["delete", "secret", &secret.name, "--namespace", &namespace],
        )
        .await;
    match result {
        Ok(output) if output.success() => {}
        Ok(output) if output.stderr.contains("NotFound") => {}
        Ok(output) => {
            if !force {
                return Err(SecretError::KubectlFailed(output.stderr));
            }
            warn!(secret = %secret.name, stderr = %output.stderr,
                "kubectl delete failed; removing record anyway");
        }
        Err(error) => {
            if !force {
                return Err(error.into());
            }
            warn!(secret = %secret.name, %error,
                "kubectl delete failed; removing record anyway");
        }
    }

    secrets_db::delete_secret(store, &secret.id).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::valid_secret_name;

    #[test]
    fn dns_like_names_are_accepted() {
        assert!(valid_secret_name("db-credentials"));
        assert!(valid_secret_name("a.b.c"));
        assert!(valid_secret_name("x1"));
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(!valid_secret_name(""));
        assert!(!valid_secret_name("Uppercase"));
        assert!(!valid_secret_name("spa ce"));
        assert!(!valid_secret_name("under_score"));
    }
}
