use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use actix_web::{
    HttpResponse, Responder, ResponseError, delete, get,
    http::{StatusCode, header::ContentType},
    post, put,
    web::{Data, Json, Path, Query},
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::authentication::{AuthError, authenticate, authenticate_admin, require_group_member};
use crate::config::{ApiConfig, BootstrapSettings};
use crate::db::access::AccessDbError;
use crate::db::clusters::{Cluster, ClustersDbError, GeoLocation};
use crate::db::groups::{GroupsDbError, NAMESPACE_PREFIX};
use crate::db::instances::{ApplicationInstance, InstancesDbError};
use crate::db::secrets::{Secret, SecretsDbError};
use crate::db::{
    ClusterConfigFile, Store, WILDCARD, WILDCARD_NAME, access, clusters as clusters_db, groups,
    instances as instances_db, secrets as secrets_db,
};
use crate::encryption::{self, EncryptionKey};
use crate::ids::{CLUSTER_ID_PREFIX, IdGenerator};
use crate::kube::{DriverError, KubeDriver};
use crate::kubeconfig::{self, KubeconfigError};
use crate::routes::{
    API_VERSION, ErrorMessage, TokenQuery, cluster_by_name_or_id, flag_set, group_by_name_or_id,
};
use crate::utils::{split_columns, split_lines, unescape};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Cluster not found")]
    ClusterNotFound,

    #[error("Group not found")]
    GroupNotFound,

    #[error("Cluster names may not contain slashes")]
    NameContainsSlash,

    #[error("Cluster names may not begin with {CLUSTER_ID_PREFIX}")]
    NameHasReservedPrefix,

    #[error("Cluster name is already in use")]
    NameInUse,

    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),

    #[error("Cannot deny cluster access to owning Group")]
    CannotDenyOwningGroup,

    #[error("Unknown repair strategy; use `reinstall` or `wipe`")]
    UnknownRepairStrategy,

    #[error("Cluster registration failed: {0}")]
    BootstrapFailed(String),

    #[error("Failed to delete cluster: {0}")]
    CascadeFailed(String),

    #[error("Unable to contact cluster with kubectl after configuration update")]
    UpdateProbeFailed,

    #[error("A kube driver error occurred: {0}")]
    Driver(#[from] DriverError),

    #[error("Failed to materialize cluster configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    ClustersDb(#[from] ClustersDbError),

    #[error(transparent)]
    GroupsDb(#[from] GroupsDbError),

    #[error(transparent)]
    AccessDb(#[from] AccessDbError),

    #[error(transparent)]
    InstancesDb(#[from] InstancesDbError),

    #[error(transparent)]
    SecretsDb(#[from] SecretsDbError),
}

impl ClusterError {
    fn to_message(&self) -> String {
        match self {
            // Do not expose store or driver details in error messages
            ClusterError::Driver(_)
            | ClusterError::Io(_)
            | ClusterError::ClustersDb(_)
            | ClusterError::GroupsDb(_)
            | ClusterError::AccessDb(_)
            | ClusterError::InstancesDb(_)
            | ClusterError::SecretsDb(_)
            | ClusterError::Auth(AuthError::UsersDb(_))
            | ClusterError::Auth(AuthError::GroupsDb(_)) => "internal server error".to_string(),
            e => e.to_string(),
        }
    }
}

impl ResponseError for ClusterError {
    fn status_code(&self) -> StatusCode {
        match self {
            ClusterError::Auth(AuthError::NotAuthorized) => StatusCode::FORBIDDEN,
            ClusterError::ClusterNotFound | ClusterError::GroupNotFound => StatusCode::NOT_FOUND,
            ClusterError::NameContainsSlash
            | ClusterError::NameHasReservedPrefix
            | ClusterError::NameInUse
            | ClusterError::Kubeconfig(_)
            | ClusterError::CannotDenyOwningGroup
            | ClusterError::UnknownRepairStrategy
            | ClusterError::UpdateProbeFailed => StatusCode::BAD_REQUEST,
            ClusterError::Auth(_)
            | ClusterError::BootstrapFailed(_)
            | ClusterError::CascadeFailed(_)
            | ClusterError::Driver(_)
            | ClusterError::Io(_)
            | ClusterError::ClustersDb(_)
            | ClusterError::GroupsDb(_)
            | ClusterError::AccessDb(_)
            | ClusterError::InstancesDb(_)
            | ClusterError::SecretsDb(_) => StatusCode::INTERNAL_SERVER_ERROR,
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

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateClusterRequest {
    pub metadata: CreateClusterMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterMetadata {
    #[schema(example = "uchicago-prod")]
    pub name: String,
    /// Name or id of the owning group.
    #[schema(example = "atlas")]
    pub group: String,
    #[schema(example = "University of Chicago")]
    pub owning_organization: String,
    /// Kubeconfig text, possibly with escaped newlines.
    pub kubeconfig: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateClusterRequest {
    pub metadata: UpdateClusterMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClusterMetadata {
    pub owning_organization: Option<String>,
    pub kubeconfig: Option<String>,
    pub location: Option<Vec<GeoLocation>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCreatedResponse {
    pub api_version: String,
    pub kind: String,
    pub metadata: ClusterCreatedMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ClusterCreatedMetadata {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResponse {
    pub api_version: String,
    pub kind: String,
    pub metadata: ClusterMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetadata {
    pub id: String,
    pub name: String,
    /// Name of the owning group.
    pub owning_group: String,
    pub owning_organization: String,
    pub location: Vec<GeoLocation>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterListResponse {
    pub api_version: String,
    pub items: Vec<ClusterResponse>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub api_version: String,
    pub reachable: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllowedGroupsResponse {
    pub api_version: String,
    pub items: Vec<AllowedGroupEntry>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllowedGroupEntry {
    pub api_version: String,
    pub kind: String,
    pub metadata: AllowedGroupMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AllowedGroupMetadata {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllowedApplicationsResponse {
    pub api_version: String,
    pub items: Vec<String>,
}

/// Outcome of comparing a cluster's live state against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum ConsistencyStatus {
    Unreachable,
    HelmFailure,
    Inconsistent,
    Consistent,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyResponse {
    pub api_version: String,
    pub status: ConsistencyStatus,
    pub missing_instances: Vec<MissingInstanceEntry>,
    pub unexpected_instances: Vec<String>,
    pub missing_secrets: usize,
    pub unexpected_secrets: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MissingInstanceEntry {
    pub api_version: String,
    pub kind: String,
    pub metadata: MissingInstanceMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MissingInstanceMetadata {
    pub id: String,
    pub name: String,
    pub application: String,
    pub group: String,
    pub cluster: String,
    pub created: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepairResponse {
    pub api_version: String,
    pub status: ConsistencyStatus,
    pub reinstalled_instances: usize,
    pub reinstalled_secrets: usize,
    pub wiped_instances: usize,
    pub wiped_secrets: usize,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ClusterListQuery {
    pub token: Option<String>,
    /// Restrict the listing to clusters owned by this group (name or id).
    pub group: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PingQuery {
    pub token: Option<String>,
    /// When present, a cached probe result within TTL is returned instead of
    /// contacting the cluster.
    pub cache: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ForceQuery {
    pub token: Option<String>,
    /// When present, per-resource failures do not abort the cascade.
    pub force: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RepairQuery {
    pub token: Option<String>,
    /// `reinstall` re-materializes missing artifacts; `wipe` removes store
    /// records with no observed counterpart.
    pub strategy: Option<String>,
}

async fn cluster_response(store: &Store, cluster: Cluster) -> Result<ClusterResponse, ClusterError> {
    let owning_group = groups::get_group(store, &cluster.owning_group)
        .await?
        .map(|group| group.name)
        .unwrap_or(cluster.owning_group);

    Ok(ClusterResponse {
        api_version: API_VERSION.to_string(),
        kind: "Cluster".to_string(),
        metadata: ClusterMetadata {
            id: cluster.id,
            name: cluster.name,
            owning_group,
            owning_organization: cluster.owning_organization,
            location: cluster.locations,
        },
    })
}

#[utoipa::path(
    summary = "List clusters",
    description = "Returns all registered clusters, optionally narrowed to one owning group.",
    params(ClusterListQuery),
    responses(
        (status = 200, description = "Clusters listed successfully", body = ClusterListResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[get("/clusters")]
pub async fn list_clusters(
    store: Data<Store>,
    query: Query<ClusterListQuery>,
) -> Result<impl Responder, ClusterError> {
    authenticate(&store, query.token.as_deref()).await?;

    let clusters = match &query.group {
        Some(group_ref) => {
            let group = group_by_name_or_id(&store, group_ref)
                .await?
                .ok_or(ClusterError::GroupNotFound)?;
            clusters_db::list_clusters_by_group(&store, &group.id).await?
        }
        None => clusters_db::list_clusters(&store).await?,
    };

    let mut items = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        items.push(cluster_response(&store, cluster).await?);
    }

    Ok(Json(ClusterListResponse {
        api_version: API_VERSION.to_string(),
        items,
    }))
}

#[utoipa::path(
    summary = "Register a cluster",
    description = "Registers a Kubernetes cluster, validates it with kubectl, and initializes Helm on it.",
    params(TokenQuery),
    request_body = CreateClusterRequest,
    responses(
        (status = 200, description = "Cluster registered successfully", body = ClusterCreatedResponse),
        (status = 400, description = "Bad request", body = ErrorMessage),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 500, description = "Cluster bootstrap failed", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[post("/clusters")]
pub async fn create_cluster(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    config: Data<ApiConfig>,
    query: Query<TokenQuery>,
    body: Json<CreateClusterRequest>,
) -> Result<impl Responder, ClusterError> {
    let user = authenticate(&store, query.token.as_deref()).await?;
    let metadata = body.into_inner().metadata;
    info!(user = %user.id, cluster = %metadata.name, "cluster registration requested");

    // Reverse any escaping applied to the kubeconfig in transit.
    let kubeconfig_text = unescape(&metadata.kubeconfig);
    let system_namespace = kubeconfig::system_namespace(&kubeconfig_text)?;

    let owning_group = group_by_name_or_id(&store, &metadata.group)
        .await?
        .ok_or(AuthError::NotAuthorized)?;
    require_group_member(&store, &user, &owning_group.id).await?;

    if metadata.name.contains('/') {
        return Err(ClusterError::NameContainsSlash);
    }
    if metadata.name.starts_with(CLUSTER_ID_PREFIX) {
        return Err(ClusterError::NameHasReservedPrefix);
    }
    if clusters_db::find_cluster_by_name(&store, &metadata.name)
        .await?
        .is_some()
    {
        return Err(ClusterError::NameInUse);
    }

    let cluster = Cluster {
        id: IdGenerator::instance().cluster_id(),
        name: metadata.name,
        owning_group: owning_group.id,
        owning_organization: metadata.owning_organization,
        kubeconfig: kubeconfig_text,
        system_namespace,
        locations: Vec::new(),
        valid: true,
    };
    clusters_db::create_cluster(&store, &cluster).await?;

    if let Err(failure) =
        bootstrap_cluster(&store, driver.get_ref(), &config.bootstrap, &cluster).await
    {
        warn!(cluster = %cluster.id, error = %failure, "cluster bootstrap failed; removing record");
        clusters_db::delete_cluster(&store, &cluster).await?;
        return Err(failure);
    }

    info!(cluster = %cluster.id, group = %cluster.owning_group, by = %user.id, "cluster registered");

    Ok(Json(ClusterCreatedResponse {
        api_version: API_VERSION.to_string(),
        kind: "Cluster".to_string(),
        metadata: ClusterCreatedMetadata {
            id: cluster.id,
            name: cluster.name,
        },
    }))
}

#[utoipa::path(
    summary = "Retrieve a cluster",
    description = "Returns a cluster by id.",
    params(("cluster_id" = String, Path, description = "Id of the cluster"), TokenQuery),
    responses(
        (status = 200, description = "Cluster retrieved successfully", body = ClusterResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Cluster not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[get("/clusters/{cluster_id}")]
pub async fn get_cluster(
    store: Data<Store>,
    query: Query<TokenQuery>,
    cluster_id: Path<String>,
) -> Result<impl Responder, ClusterError> {
    authenticate(&store, query.token.as_deref()).await?;

    let cluster = cluster_by_name_or_id(&store, &cluster_id.into_inner())
        .await?
        .ok_or(ClusterError::ClusterNotFound)?;

    Ok(Json(cluster_response(&store, cluster).await?))
}

#[utoipa::path(
    summary = "Update a cluster",
    description = "Updates a cluster's organization, kubeconfig, or locations. \
        A kubeconfig change is probed afterwards; a failed probe is reported but not rolled back.",
    params(("cluster_id" = String, Path, description = "Id of the cluster"), TokenQuery),
    request_body = UpdateClusterRequest,
    responses(
        (status = 200, description = "Cluster updated successfully"),
        (status = 400, description = "Bad request or failed post-update probe", body = ErrorMessage),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Cluster not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[put("/clusters/{cluster_id}")]
pub async fn update_cluster(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    query: Query<TokenQuery>,
    cluster_id: Path<String>,
    body: Json<UpdateClusterRequest>,
) -> Result<impl Responder, ClusterError> {
    let user = authenticate(&store, query.token.as_deref()).await?;

    let mut cluster = cluster_by_name_or_id(&store, &cluster_id.into_inner())
        .await?
        .ok_or(ClusterError::ClusterNotFound)?;
    require_group_member(&store, &user, &cluster.owning_group).await?;

    let metadata = body.into_inner().metadata;
    let mut update_main = false;
    let mut update_config = false;
    if let Some(kubeconfig_text) = metadata.kubeconfig {
        cluster.kubeconfig = unescape(&kubeconfig_text);
        cluster.system_namespace = kubeconfig::system_namespace(&cluster.kubeconfig)?;
        update_main = true;
        update_config = true;
    }
    if let Some(owning_organization) = metadata.owning_organization {
        cluster.owning_organization = owning_organization;
        update_main = true;
    }
    let update_location = metadata.location.is_some();

    if !update_main && !update_location {
        info!(cluster = %cluster.id, "requested cluster update is trivial");
        return Ok(HttpResponse::Ok().finish());
    }

    if update_main {
        clusters_db::update_cluster(&store, &cluster).await?;
    }
    if let Some(locations) = metadata.location {
        clusters_db::set_locations(&store, &cluster.id, locations)
            .await?
            .ok_or(ClusterError::ClusterNotFound)?;
    }

    if update_config {
        // The new kubeconfig is already persisted; a failing probe is
        // surfaced to the caller but deliberately not rolled back.
        let config_path = store.config_path_for_cluster(&cluster)?;
        if !probe_cluster(driver.get_ref(), &config_path).await? {
            return Err(ClusterError::UpdateProbeFailed);
        }
    }

    Ok(HttpResponse::Ok().finish())
}

#[utoipa::path(
    summary = "Delete a cluster",
    description = "Cascades over the cluster: helm releases serially, secrets in parallel, \
        tenant namespaces in parallel, then the record. With `force`, per-resource failures \
        are logged instead of aborting.",
    params(("cluster_id" = String, Path, description = "Id of the cluster"), ForceQuery),
    responses(
        (status = 200, description = "Cluster deleted successfully"),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Cluster not found", body = ErrorMessage),
        (status = 500, description = "Cascade aborted", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[delete("/clusters/{cluster_id}")]
pub async fn delete_cluster(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    query: Query<ForceQuery>,
    cluster_id: Path<String>,
) -> Result<impl Responder, ClusterError> {
    let user = authenticate(&store, query.token.as_deref()).await?;

    let cluster = cluster_by_name_or_id(&store, &cluster_id.into_inner())
        .await?
        .ok_or(ClusterError::ClusterNotFound)?;
    require_group_member(&store, &user, &cluster.owning_group).await?;

    let force = flag_set(&query.force);
    delete_cluster_resources(&store, driver.get_ref(), &cluster, force).await?;

    info!(cluster = %cluster.id, by = %user.id, force, "cluster deleted");

    Ok(HttpResponse::Ok().finish())
}

#[utoipa::path(
    summary = "Ping a cluster",
    description = "Probes the cluster's API server. With `cache`, a previous result within TTL is reused.",
    params(("cluster_id" = String, Path, description = "Id of the cluster"), PingQuery),
    responses(
        (status = 200, description = "Probe result", body = PingResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Cluster not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[get("/clusters/{cluster_id}/ping")]
pub async fn ping_cluster(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    query: Query<PingQuery>,
    cluster_id: Path<String>,
) -> Result<impl Responder, ClusterError> {
    authenticate(&store, query.token.as_deref()).await?;

    let cluster = cluster_by_name_or_id(&store, &cluster_id.into_inner())
        .await?
        .ok_or(ClusterError::ClusterNotFound)?;

    let cached = if flag_set(&query.cache) {
        store.cached_reachability(&cluster.id)
    } else {
        None
    };

    let reachable = match cached {
        Some(reachable) => reachable,
        None => {
            let config_path = store.config_path_for_cluster(&cluster)?;
            let reachable = probe_cluster(driver.get_ref(), &config_path).await?;
            store.cache_reachability(&cluster.id, reachable);
            reachable
        }
    };

    Ok(Json(PingResponse {
        api_version: API_VERSION.to_string(),
        reachable,
    }))
}

#[utoipa::path(
    summary = "Verify a cluster",
    description = "Compares the cluster's live helm releases and secrets against the store.",
    params(("cluster_id" = String, Path, description = "Id of the cluster"), TokenQuery),
    responses(
        (status = 200, description = "Consistency result", body = ConsistencyResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Cluster not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[get("/clusters/{cluster_id}/verify")]
pub async fn verify_cluster(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    query: Query<TokenQuery>,
    cluster_id: Path<String>,
) -> Result<impl Responder, ClusterError> {
    authenticate(&store, query.token.as_deref()).await?;

    let cluster = cluster_by_name_or_id(&store, &cluster_id.into_inner())
        .await?
        .ok_or(ClusterError::ClusterNotFound)?;

    let consistency = check_cluster_consistency(&store, driver.get_ref(), &cluster).await?;

    let missing_instances = consistency
        .missing_instances
        .iter()
        .filter_map(|name| consistency.expected_instances.get(name))
        .map(|instance| MissingInstanceEntry {
            api_version: API_VERSION.to_string(),
            kind: "ApplicationInstance".to_string(),
            metadata: MissingInstanceMetadata {
                id: instance.id.clone(),
                name: instance.name.clone(),
                application: instance.application.clone(),
                group: instance.group.clone(),
                cluster: instance.cluster.clone(),
                created: instance.created.to_rfc3339(),
            },
        })
        .collect();

    Ok(Json(ConsistencyResponse {
        api_version: API_VERSION.to_string(),
        status: consistency.status,
        missing_instances,
        unexpected_instances: consistency.unexpected_instances.into_iter().collect(),
        missing_secrets: consistency.missing_secrets.len(),
        unexpected_secrets: consistency.unexpected_secrets.len(),
    }))
}

#[utoipa::path(
    summary = "Repair a cluster",
    description = "Consumes a fresh consistency result. `reinstall` re-materializes missing \
        artifacts; `wipe` removes store records with no observed counterpart. Admin only.",
    params(("cluster_id" = String, Path, description = "Id of the cluster"), RepairQuery),
    responses(
        (status = 200, description = "Repair summary", body = RepairResponse),
        (status = 400, description = "Unknown strategy", body = ErrorMessage),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Cluster not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[post("/clusters/{cluster_id}/repair")]
pub async fn repair_cluster(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    config: Data<ApiConfig>,
    encryption_key: Data<EncryptionKey>,
    query: Query<RepairQuery>,
    cluster_id: Path<String>,
) -> Result<impl Responder, ClusterError> {
    authenticate_admin(&store, query.token.as_deref()).await?;

    let cluster = cluster_by_name_or_id(&store, &cluster_id.into_inner())
        .await?
        .ok_or(ClusterError::ClusterNotFound)?;

    let strategy = match query.strategy.as_deref() {
        Some("reinstall") | None => RepairStrategy::Reinstall,
        Some("wipe") => RepairStrategy::Wipe,
        Some(_) => return Err(ClusterError::UnknownRepairStrategy),
    };

    let consistency = check_cluster_consistency(&store, driver.get_ref(), &cluster).await?;
    let mut response = RepairResponse {
        api_version: API_VERSION.to_string(),
        status: consistency.status,
        reinstalled_instances: 0,
        reinstalled_secrets: 0,
        wiped_instances: 0,
        wiped_secrets: 0,
    };

    if consistency.status != ConsistencyStatus::Inconsistent {
        return Ok(Json(response));
    }

    match strategy {
        RepairStrategy::Reinstall => {
            for name in &consistency.missing_instances {
                let Some(instance) = consistency.expected_instances.get(name) else {
                    continue;
                };
                match super::apps::reinstall_instance(
                    &store,
                    driver.get_ref(),
                    &config.helm,
                    &cluster,
                    instance,
                )
                .await
                {
                    Ok(()) => response.reinstalled_instances += 1,
                    Err(error) => {
                        warn!(instance = %instance.name, %error, "failed to reinstall instance")
                    }
                }
            }
            for (key, secret) in &consistency.expected_secrets {
                if !consistency.missing_secrets.contains(key) {
                    continue;
                }
                match repush_secret(&store, driver.get_ref(), &cluster, &encryption_key, secret)
                    .await
                {
                    Ok(()) => response.reinstalled_secrets += 1,
                    Err(error) => warn!(secret = %secret.name, %error, "failed to re-push secret"),
                }
            }
        }
        RepairStrategy::Wipe => {
            for name in &consistency.missing_instances {
                if let Some(instance) = consistency.expected_instances.get(name) {
                    instances_db::delete_instance(&store, &instance.id).await?;
                    response.wiped_instances += 1;
                }
            }
            for (key, secret) in &consistency.expected_secrets {
                if consistency.missing_secrets.contains(key) {
                    secrets_db::delete_secret(&store, &secret.id).await?;
                    response.wiped_secrets += 1;
                }
            }
        }
    }

    Ok(Json(response))
}

#[utoipa::path(
    summary = "List groups allowed on a cluster",
    description = "Returns the groups granted access to the cluster. A universal grant is \
        rendered as the single wildcard pseudo-group.",
    params(("cluster_id" = String, Path, description = "Id of the cluster"), TokenQuery),
    responses(
        (status = 200, description = "Allowed groups", body = AllowedGroupsResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Cluster not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[get("/clusters/{cluster_id}/allowed_groups")]
pub async fn list_allowed_groups(
    store: Data<Store>,
    query: Query<TokenQuery>,
    cluster_id: Path<String>,
) -> Result<impl Responder, ClusterError> {
    authenticate(&store, query.token.as_deref()).await?;

    let cluster = cluster_by_name_or_id(&store, &cluster_id.into_inner())
        .await?
        .ok_or(ClusterError::ClusterNotFound)?;

    let mut grants = access::list_groups_allowed_on_cluster(&store, &cluster.id).await?;

    let mut items = Vec::new();
    if grants.len() == 1 && grants[0] == WILDCARD {
        items.push(AllowedGroupEntry {
            api_version: API_VERSION.to_string(),
            kind: "Group".to_string(),
            metadata: AllowedGroupMetadata {
                id: WILDCARD.to_string(),
                name: WILDCARD_NAME.to_string(),
            },
        });
    } else {
        // The owning group always has implicit access and never appears twice.
        if !grants.iter().any(|grant| grant == &cluster.owning_group) {
            grants.push(cluster.owning_group.clone());
        }
        for group_id in grants {
            if group_id == WILDCARD {
                items.push(AllowedGroupEntry {
                    api_version: API_VERSION.to_string(),
                    kind: "Group".to_string(),
                    metadata: AllowedGroupMetadata {
                        id: WILDCARD.to_string(),
                        name: WILDCARD_NAME.to_string(),
                    },
                });
                continue;
            }
            match groups::get_group(&store, &group_id).await? {
                Some(group) => items.push(AllowedGroupEntry {
                    api_version: API_VERSION.to_string(),
                    kind: "Group".to_string(),
                    metadata: AllowedGroupMetadata {
                        id: group.id,
                        name: group.name,
                    },
                }),
                None => {
                    warn!(group = %group_id, cluster = %cluster.id, "dangling access grant")
                }
            }
        }
    }

    Ok(Json(AllowedGroupsResponse {
        api_version: API_VERSION.to_string(),
        items,
    }))
}

#[utoipa::path(
    summary = "Grant a group access to a cluster",
    description = "Grants the named group (or `*` for every group) access to the cluster.",
    params(
        ("cluster_id" = String, Path, description = "Id of the cluster"),
        ("group" = String, Path, description = "Name or id of the group, or `*`"),
        TokenQuery,
    ),
    responses(
        (status = 200, description = "Access granted"),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Cluster or group not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[put("/clusters/{cluster_id}/allowed_groups/{group}")]
pub async fn grant_group_access(
    store: Data<Store>,
    query: Query<TokenQuery>,
    path: Path<(String, String)>,
) -> Result<impl Responder, ClusterError> {
    let user = authenticate(&store, query.token.as_deref()).await?;
    let (cluster_ref, group_ref) = path.into_inner();

    let cluster = cluster_by_name_or_id(&store, &cluster_ref)
        .await?
        .ok_or(ClusterError::ClusterNotFound)?;
    require_group_member(&store, &user, &cluster.owning_group).await?;

    if group_ref == WILDCARD || group_ref == WILDCARD_NAME {
        info!(cluster = %cluster.id, by = %user.id, "granting all groups access");
        access::grant_group_access(&store, WILDCARD, &cluster.id).await?;
        return Ok(HttpResponse::Ok().finish());
    }

    let group = group_by_name_or_id(&store, &group_ref)
        .await?
        .ok_or(ClusterError::GroupNotFound)?;
    if group.id == cluster.owning_group {
        // The owning group always implicitly has access; avoid a pointless
        // record.
        return Ok(HttpResponse::Ok().finish());
    }

    info!(cluster = %cluster.id, group = %group.id, by = %user.id, "granting group access");
    access::grant_group_access(&store, &group.id, &cluster.id).await?;

    Ok(HttpResponse::Ok().finish())
}

#[utoipa::path(
    summary = "Revoke a group's access to a cluster",
    description = "Revokes the named group's (or the wildcard's) access. Existing instances \
        survive, but further installs are refused. The owning group cannot be denied.",
    params(
        ("cluster_id" = String, Path, description = "Id of the cluster"),
        ("group" = String, Path, description = "Name or id of the group, or `*`"),
        TokenQuery,
    ),
    responses(
        (status = 200, description = "Access revoked"),
        (status = 400, description = "Owning group cannot be denied", body = ErrorMessage),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Cluster or group not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[delete("/clusters/{cluster_id}/allowed_groups/{group}")]
pub async fn revoke_group_access(
    store: Data<Store>,
    query: Query<TokenQuery>,
    path: Path<(String, String)>,
) -> Result<impl Responder, ClusterError> {
    let user = authenticate(&store, query.token.as_deref()).await?;
    let (cluster_ref, group_ref) = path.into_inner();

    let cluster = cluster_by_name_or_id(&store, &cluster_ref)
        .await?
        .ok_or(ClusterError::ClusterNotFound)?;
    require_group_member(&store, &user, &cluster.owning_group).await?;

    if group_ref == WILDCARD || group_ref == WILDCARD_NAME {
        info!(cluster = %cluster.id, by = %user.id, "revoking universal access");
        access::revoke_group_access(&store, WILDCARD, &cluster.id).await?;
        return Ok(HttpResponse::Ok().finish());
    }

    let group = group_by_name_or_id(&store, &group_ref)
        .await?
        .ok_or(ClusterError::GroupNotFound)?;
    if group.id == cluster.owning_group {
        return Err(ClusterError::CannotDenyOwningGroup);
    }

    info!(cluster = %cluster.id, group = %group.id, by = %user.id, "revoking group access");
    access::revoke_group_access(&store, &group.id, &cluster.id).await?;

    Ok(HttpResponse::Ok().finish())
}

#[utoipa::path(
    summary = "List a group's allowed applications on a cluster",
    description = "Returns the application allow-list for the group on the cluster. The owning \
        group may install anything, rendered as the wildcard.",
    params(
        ("cluster_id" = String, Path, description = "Id of the cluster"),
        ("group" = String, Path, description = "Name or id of the group"),
        TokenQuery,
    ),
    responses(
        (status = 200, description = "Allowed applications", body = AllowedApplicationsResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Cluster or group not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[get("/clusters/{cluster_id}/allowed_groups/{group}/applications")]
pub async fn list_group_allowed_applications(
    store: Data<Store>,
    query: Query<TokenQuery>,
    path: Path<(String, String)>,
) -> Result<impl Responder, ClusterError> {
    let user = authenticate(&store, query.token.as_deref()).await?;
    let (cluster_ref, group_ref) = path.into_inner();

    let cluster = cluster_by_name_or_id(&store, &cluster_ref)
        .await?
        .ok_or(ClusterError::ClusterNotFound)?;
    let group = group_by_name_or_id(&store, &group_ref)
        .await?
        .ok_or(ClusterError::GroupNotFound)?;

    // Admins, members of the owning group, and members of the group itself
    // may inspect the allow-list.
    let allowed = user.admin
        || groups::user_in_group(&store, &user.id, &cluster.owning_group).await?
        || groups::user_in_group(&store, &user.id, &group.id).await?;
    if !allowed {
        return Err(AuthError::NotAuthorized.into());
    }

    let items = if group.id == cluster.owning_group {
        vec![WILDCARD.to_string()]
    } else {
        access::list_allowed_applications(&store, &group.id, &cluster.id).await?
    };

    Ok(Json(AllowedApplicationsResponse {
        api_version: API_VERSION.to_string(),
        items,
    }))
}

#[utoipa::path(
    summary = "Allow a group to use an application",
    description = "Adds an application (or `*`) to the group's allow-list on the cluster.",
    params(
        ("cluster_id" = String, Path, description = "Id of the cluster"),
        ("group" = String, Path, description = "Name or id of the group"),
        ("application" = String, Path, description = "Application name or `*`"),
        TokenQuery,
    ),
    responses(
        (status = 200, description = "Application allowed"),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Cluster or group not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[put("/clusters/{cluster_id}/allowed_groups/{group}/applications/{application}")]
pub async fn allow_group_application(
    store: Data<Store>,
    query: Query<TokenQuery>,
    path: Path<(String, String, String)>,
) -> Result<impl Responder, ClusterError> {
    let user = authenticate(&store, query.token.as_deref()).await?;
    let (cluster_ref, group_ref, application) = path.into_inner();

    let cluster = cluster_by_name_or_id(&store, &cluster_ref)
        .await?
        .ok_or(ClusterError::ClusterNotFound)?;
    let group = group_by_name_or_id(&store, &group_ref)
        .await?
        .ok_or(ClusterError::GroupNotFound)?;
    require_group_member(&store, &user, &cluster.owning_group).await?;

    info!(cluster = %cluster.id, group = %group.id, application = %application, by = %user.id,
        "allowing application use");
    access::allow_group_application(&store, &group.id, &cluster.id, &application).await?;

    Ok(HttpResponse::Ok().finish())
}

#[utoipa::path(
    summary = "Deny a group use of an application",
    description = "Removes an application (or `*`) from the group's allow-list on the cluster.",
    params(
        ("cluster_id" = String, Path, description = "Id of the cluster"),
        ("group" = String, Path, description = "Name or id of the group"),
        ("application" = String, Path, description = "Application name or `*`"),
        TokenQuery,
    ),
    responses(
        (status = 200, description = "Application denied"),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Cluster or group not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Clusters",
)]
#[delete("/clusters/{cluster_id}/allowed_groups/{group}/applications/{application}")]
pub async fn deny_group_application(
    store: Data<Store>,
    query: Query<TokenQuery>,
    path: Path<(String, String, String)>,
) -> Result<impl Responder, ClusterError> {
    let user = authenticate(&store, query.token.as_deref()).await?;
    let (cluster_ref, group_ref, application) = path.into_inner();

    let cluster = cluster_by_name_or_id(&store, &cluster_ref)
        .await?
        .ok_or(ClusterError::ClusterNotFound)?;
    let group = group_by_name_or_id(&store, &group_ref)
        .await?
        .ok_or(ClusterError::GroupNotFound)?;
    require_group_member(&store, &user, &cluster.owning_group).await?;

    info!(cluster = %cluster.id, group = %group.id, application = %application, by = %user.id,
        "denying application use");
    access::deny_group_application(&store, &group.id, &cluster.id, &application).await?;

    Ok(HttpResponse::Ok().finish())
}

enum RepairStrategy {
    Reinstall,
    Wipe,
}

/// Probes the default namespace's ServiceAccounts; the probe used both for
/// registration step validation and for reachability pings.
pub(crate) async fn probe_cluster(
    driver: &dyn KubeDriver,
    config_path: &ClusterConfigFile,
) -> Result<bool, DriverError> {
    let accounts = driver
        .kubectl(
            config_path.path(),
            &[
                "get",
                "serviceaccounts",
                "-o=jsonpath={.items[*].metadata.name}",
            ],
        )
        .await?;

    Ok(accounts.success() && accounts.stdout.contains("default"))
}

/// Validates a freshly registered cluster and initializes Helm on it.
///
/// Any failure surfaces as `BootstrapFailed`; the caller removes the
/// tentatively created record.
async fn bootstrap_cluster(
    store: &Store,
    driver: &dyn KubeDriver,
    settings: &BootstrapSettings,
    cluster: &Cluster,
) -> Result<(), ClusterError> {
    let config_path = store.config_path_for_cluster(cluster)?;

    let accounts = driver
        .kubectl(
            config_path.path(),
            &[
                "get",
                "serviceaccounts",
                "-o=jsonpath={.items[*].metadata.name}",
            ],
        )
        .await?;
    if !accounts.success() || !accounts.stdout.contains("default") {
        warn!(cluster = %cluster.id, stderr = %accounts.stderr, "unable to contact cluster");
        return Err(ClusterError::BootstrapFailed(
            "Unable to contact cluster with kubectl".to_string(),
        ));
    }

    let account_names = split_columns(&accounts.stdout, ' ');
    if account_names.is_empty() {
        return Err(ClusterError::BootstrapFailed(
            "Found no ServiceAccounts in the default namespace".to_string(),
        ));
    }
    if !account_names.contains(&cluster.system_namespace.as_str()) {
        return Err(ClusterError::BootstrapFailed(
            "Unable to find matching service account in default namespace".to_string(),
        ));
    }

    let described = driver
        .kubectl(
            config_path.path(),
            &["describe", "serviceaccount", &cluster.system_namespace],
        )
        .await?;
    if !described.success() {
        return Err(ClusterError::BootstrapFailed(
            "Checking default namespace name failed".to_string(),
        ));
    }
    let mut confirmed = false;
    for line in split_lines(&described.stdout) {
        let items = split_columns(line, ' ');
        if items.len() == 2 && items[0] == "Namespace:" {
            if items[1] == cluster.system_namespace {
                confirmed = true;
            } else {
                warn!(cluster = %cluster.id, line, "service account namespace mismatch");
            }
        }
    }
    if !confirmed {
        return Err(ClusterError::BootstrapFailed(format!(
            "ServiceAccount namespace does not match {}",
            cluster.system_namespace
        )));
    }

    let init = driver
        .helm(
            config_path.path(),
            &cluster.system_namespace,
            &["init", "--service-account", &cluster.system_namespace],
        )
        .await?;
    let installed = init.stdout.contains("has been installed");
    let already_installed = init.stdout.contains("is already installed");
    if !init.success() || (!installed && !already_installed) {
        warn!(cluster = %cluster.id, stderr = %init.stderr, "helm init failed");
        return Err(ClusterError::BootstrapFailed(
            "Unable to initialize helm".to_string(),
        ));
    }
    if init.stdout.contains("Warning: Tiller is already installed") {
        // Tiller may already live in some other namespace, in which case helm
        // claims success but our namespace stays empty.
        let deployments = driver
            .kubectl(
                config_path.path(),
                &[
                    "get",
                    "deployments",
                    "--namespace",
                    &cluster.system_namespace,
                    "-o=jsonpath={.items[*].metadata.name}",
                ],
            )
            .await?;
        let has_tiller = deployments.success()
            && split_columns(&deployments.stdout, ' ')
                .iter()
                .any(|deployment| *deployment == "tiller-deploy");
        if !has_tiller {
            return Err(ClusterError::BootstrapFailed(
                "Unable to initialize helm: Tiller is installed in another namespace".to_string(),
            ));
        }
    }

    wait_for_tiller(driver, settings, &config_path, &cluster.system_namespace).await
}

/// Polls until a `tiller-deploy` pod reports all containers ready.
///
/// Must not hold any store locks; only the driver and the scratch file handle
/// are borrowed across the sleeps.
async fn wait_for_tiller(
    driver: &dyn KubeDriver,
    settings: &BootstrapSettings,
    config_path: &ClusterConfigFile,
    namespace: &str,
) -> Result<(), ClusterError> {
    let poll = Duration::from_millis(settings.tiller_poll_ms);
    let deadline = Duration::from_millis(settings.tiller_deadline_ms);
    let mut waited = Duration::ZERO;

    loop {
        let pods = driver
            .kubectl(
                config_path.path(),
                &["get", "pods", "--namespace", namespace],
            )
            .await?;
        if !pods.success() {
            return Err(ClusterError::BootstrapFailed(
                "Checking Tiller status failed".to_string(),
            ));
        }
        if tiller_ready(&pods.stdout) {
            info!(namespace, "Tiller ready");
            return Ok(());
        }

        if waited >= deadline {
            return Err(ClusterError::BootstrapFailed(format!(
                "Tiller was not ready after {}s",
                deadline.as_secs()
            )));
        }
        tokio::time::sleep(poll).await;
        waited += poll;
    }
}

/// Parses `kubectl get pods` output looking for a ready `tiller-deploy` pod.
fn tiller_ready(output: &str) -> bool {
    for line in split_lines(output) {
        let tokens = split_columns(line, ' ');
        if tokens.len() < 3 || !tokens[0].starts_with("tiller-deploy") {
            continue;
        }
        let Some((ready, total)) = tokens[1].split_once('/') else {
            continue;
        };
        if let (Ok(ready), Ok(total)) = (ready.parse::<u32>(), total.parse::<u32>())
            && ready > 0
            && ready == total
        {
            return true;
        }
    }
    false
}

/// Deletes everything on and about a cluster, in dependency order.
///
/// Helm releases reference secrets and namespaces, so instances go first
/// (serially, since Tiller cannot take concurrent release mutations), then
/// secrets (concurrently), then tenant namespaces (concurrently, failures
/// only logged), then the cluster record and its policy records.
pub(crate) async fn delete_cluster_resources(
    store: &Store,
    driver: &dyn KubeDriver,
    cluster: &Cluster,
    force: bool,
) -> Result<(), ClusterError> {
    let config_path = store.config_path_for_cluster(cluster)?;

    let instances = instances_db::list_instances(store, None, Some(&cluster.id)).await?;
    for instance in &instances {
        if let Err(error) = super::instances::delete_instance_resources(
            store,
            driver,
            cluster,
            &config_path,
            instance,
            force,
        )
        .await
        {
            if !force {
                return Err(ClusterError::CascadeFailed(format!(
                    "Failed to delete instance {}: {error}",
                    instance.name
                )));
            }
            warn!(instance = %instance.name, %error, "instance deletion failed during forced cascade");
        }
    }

    let secrets = secrets_db::list_secrets(store, None, Some(&cluster.id)).await?;
    let deletions = secrets.iter().map(|secret| {
        super::secrets::delete_secret_resources(store, driver, &config_path, secret, force)
    });
    let results = join_all(deletions).await;
    for (secret, result) in secrets.iter().zip(results) {
        if let Err(error) = result {
            if !force {
                return Err(ClusterError::CascadeFailed(format!(
                    "Failed to delete secret {}: {error}",
                    secret.name
                )));
            }
            warn!(secret = %secret.name, %error, "secret deletion failed during forced cascade");
        }
    }

    let groups = groups::list_groups(store).await?;
    let namespace_deletions = groups.iter().map(|group| {
        let namespace = group.namespace_name();
        let config_path = &config_path;
        async move {
            match driver.delete_namespace(config_path.path(), &namespace).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    warn!(%namespace, stderr = %output.stderr, "failed to delete tenant namespace")
                }
                Err(error) => warn!(%namespace, %error, "failed to delete tenant namespace"),
            }
        }
    });
    join_all(namespace_deletions).await;

    access::remove_all_records_for_cluster(store, &cluster.id).await?;
    clusters_db::delete_cluster(store, cluster).await?;

    Ok(())
}

/// Comparison of a cluster's observed helm releases and secrets against the
/// store's expectations.
pub(crate) struct ClusterConsistency {
    pub status: ConsistencyStatus,
    /// Expected instances keyed by release name.
    pub expected_instances: BTreeMap<String, ApplicationInstance>,
    pub missing_instances: BTreeSet<String>,
    pub unexpected_instances: BTreeSet<String>,
    /// Expected secrets keyed as `<group-name>:<secret-name>`.
    pub expected_secrets: BTreeMap<String, Secret>,
    pub missing_secrets: BTreeSet<String>,
    pub unexpected_secrets: BTreeSet<String>,
}

impl ClusterConsistency {
    fn terminal(status: ConsistencyStatus) -> Self {
        Self {
            status,
            expected_instances: BTreeMap::new(),
            missing_instances: BTreeSet::new(),
            unexpected_instances: BTreeSet::new(),
            expected_secrets: BTreeMap::new(),
            missing_secrets: BTreeSet::new(),
            unexpected_secrets: BTreeSet::new(),
        }
    }
}

pub(crate) async fn check_cluster_consistency(
    store: &Store,
    driver: &dyn KubeDriver,
    cluster: &Cluster,
) -> Result<ClusterConsistency, ClusterError> {
    let config_path = store.config_path_for_cluster(cluster)?;

    if !probe_cluster(driver, &config_path).await? {
        return Ok(ClusterConsistency::terminal(ConsistencyStatus::Unreachable));
    }

    let releases = driver
        .helm(config_path.path(), &cluster.system_namespace, &["list"])
        .await?;
    if !releases.success() {
        warn!(cluster = %cluster.id, stderr = %releases.stderr, "unable to list helm releases");
        return Ok(ClusterConsistency::terminal(ConsistencyStatus::HelmFailure));
    }
    let mut observed_instances = BTreeSet::new();
    for (index, line) in split_lines(&releases.stdout).iter().enumerate() {
        if index == 0 {
            // helm's header line
            continue;
        }
        if let Some(name) = split_columns(line, '\t').first() {
            observed_instances.insert(name.to_string());
        }
    }

    let mut expected_instances = BTreeMap::new();
    for instance in instances_db::list_instances(store, None, Some(&cluster.id)).await? {
        expected_instances.insert(instance.name.clone(), instance);
    }
    let expected_names: BTreeSet<String> = expected_instances.keys().cloned().collect();
    let missing_instances: BTreeSet<String> = expected_names
        .difference(&observed_instances)
        .cloned()
        .collect();
    let unexpected_instances: BTreeSet<String> = observed_instances
        .difference(&expected_names)
        .cloned()
        .collect();

    info!(
        cluster = %cluster.id,
        missing = missing_instances.len(),
        unexpected = unexpected_instances.len(),
        "instance comparison complete"
    );

    let namespaces = driver
        .kubectl(
            config_path.path(),
            &["get", "namespaces", "-o=jsonpath={.items[*].metadata.name}"],
        )
        .await?;
    let mut observed_secrets = BTreeSet::new();
    for namespace in split_columns(&namespaces.stdout, ' ') {
        let Some(group_name) = namespace.strip_prefix(NAMESPACE_PREFIX) else {
            continue;
        };
        let secrets_output = driver
            .kubectl(
                config_path.path(),
                &[
                    "get",
                    "secrets",
                    "-n",
                    namespace,
                    "-o=jsonpath={.items[*].metadata.name}",
                ],
            )
            .await?;
        for secret_name in split_columns(&secrets_output.stdout, ' ') {
            // kubernetes infrastructure, not ours
            if secret_name.starts_with("default-token-") {
                continue;
            }
            observed_secrets.insert(format!("{group_name}:{secret_name}"));
        }
    }

    let mut expected_secrets = BTreeMap::new();
    for secret in secrets_db::list_secrets(store, None, Some(&cluster.id)).await? {
        let group_name = groups::get_group(store, &secret.group)
            .await?
            .map(|group| group.name)
            .unwrap_or_else(|| secret.group.clone());
        expected_secrets.insert(format!("{group_name}:{}", secret.name), secret);
    }
    let expected_secret_keys: BTreeSet<String> = expected_secrets.keys().cloned().collect();
    let missing_secrets: BTreeSet<String> = expected_secret_keys
        .difference(&observed_secrets)
        .cloned()
        .collect();
    let unexpected_secrets: BTreeSet<String> = observed_secrets
        .difference(&expected_secret_keys)
        .cloned()
        .collect();

    info!(
        cluster = %cluster.id,
        missing = missing_secrets.len(),
        unexpected = unexpected_secrets.len(),
        "secret comparison complete"
    );

    let consistent = missing_instances.is_empty()
        && unexpected_instances.is_empty()
        && missing_secrets.is_empty()
        && unexpected_secrets.is_empty();

    Ok(ClusterConsistency {
        status: if consistent {
            ConsistencyStatus::Consistent
        } else {
            ConsistencyStatus::Inconsistent
        },
        expected_instances,
        missing_instances,
        unexpected_instances,
        expected_secrets,
        missing_secrets,
        unexpected_secrets,
    })
}

/// Re-materializes a missing secret on the cluster during repair.
async fn repush_secret(
    store: &Store,
    driver: &dyn KubeDriver,
    cluster: &Cluster,
    encryption_key: &EncryptionKey,
    secret: &Secret,
) -> Result<(), ClusterError> {
    let group = groups::get_group(store, &secret.group)
        .await?
        .ok_or(ClusterError::GroupNotFound)?;
    let contents = encryption::decrypt_contents(&secret.contents, encryption_key)
        .map_err(|error| ClusterError::CascadeFailed(error.to_string()))?;

    let config_path = store.config_path_for_cluster(cluster)?;
    super::secrets::push_secret_manifest(
        driver,
        &config_path,
        &group.namespace_name(),
        &secret.name,
        &contents,
    )
    .await
    .map_err(|error| ClusterError::CascadeFailed(error.to_string()))
}
