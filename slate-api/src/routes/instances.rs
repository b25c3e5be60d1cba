use actix_web::{
    HttpResponse, Responder, ResponseError, delete, get,
    http::{StatusCode, header::ContentType},
    put,
    web::{Data, Json, Path, Query},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::authentication::{AuthError, authenticate, require_group_member};
use crate::config::ApiConfig;
use crate::db::clusters::{Cluster, ClustersDbError};
use crate::db::groups::GroupsDbError;
use crate::db::instances::{ApplicationInstance, InstancesDbError};
use crate::db::{ClusterConfigFile, Store, clusters as clusters_db, groups, instances as instances_db};
use crate::kube::{DriverError, KubeDriver};
use crate::routes::{
    API_VERSION, ErrorMessage, cluster_by_name_or_id, flag_set, group_by_name_or_id,
};
use crate::utils::split_columns;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Instance not found")]
    InstanceNotFound,

    #[error("Cluster not found")]
    ClusterNotFound,

    #[error("Group not found")]
    GroupNotFound,

    #[error("Helm operation failed: {0}")]
    HelmFailed(String),

    #[error("kubectl operation failed: {0}")]
    KubectlFailed(String),

    #[error("A kube driver error occurred: {0}")]
    Driver(#[from] DriverError),

    #[error("Failed to materialize cluster configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    InstancesDb(#[from] InstancesDbError),

    #[error(transparent)]
    ClustersDb(#[from] ClustersDbError),

    #[error(transparent)]
    GroupsDb(#[from] GroupsDbError),

    #[error(transparent)]
    Install(#[from] Box<super::apps::AppError>),
}

impl InstanceError {
    fn to_message(&self) -> String {
        match self {
            // Do not expose store or driver details in error messages
            InstanceError::Driver(_)
            | InstanceError::Io(_)
            | InstanceError::InstancesDb(_)
            | InstanceError::ClustersDb(_)
            | InstanceError::GroupsDb(_)
            | InstanceError::Auth(AuthError::UsersDb(_))
            | InstanceError::Auth(AuthError::GroupsDb(_)) => "internal server error".to_string(),
            e => e.to_string(),
        }
    }
}

impl ResponseError for InstanceError {
    fn status_code(&self) -> StatusCode {
        match self {
            InstanceError::Auth(AuthError::NotAuthorized) => StatusCode::FORBIDDEN,
            InstanceError::InstanceNotFound
            | InstanceError::ClusterNotFound
            | InstanceError::GroupNotFound => StatusCode::NOT_FOUND,
            InstanceError::Install(inner) => inner.status_code(),
            InstanceError::Auth(_)
            | InstanceError::HelmFailed(_)
            | InstanceError::KubectlFailed(_)
            | InstanceError::Driver(_)
            | InstanceError::Io(_)
            | InstanceError::InstancesDb(_)
            | InstanceError::ClustersDb(_)
            | InstanceError::GroupsDb(_) => StatusCode::INTERNAL_SERVER_ERROR,
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
pub struct InstanceListQuery {
    pub token: Option<String>,
    /// Restrict the listing to instances owned by this group (name or id).
    pub group: Option<String>,
    /// Restrict the listing to instances on this cluster (name or id).
    pub cluster: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct InstanceDetailQuery {
    pub token: Option<String>,
    /// When present, live release status and pod listings are attached.
    pub detailed: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct InstanceDeleteQuery {
    pub token: Option<String>,
    /// When present, the store record is removed even if helm fails.
    pub force: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct InstanceLogsQuery {
    pub token: Option<String>,
    /// Maximum number of log lines per container.
    pub max_lines: Option<u64>,
    /// Restrict logs to this container.
    pub container: Option<String>,
    /// When present, fetch logs of the previous container incarnation.
    pub previous: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResponse {
    pub api_version: String,
    pub kind: String,
    pub metadata: InstanceMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<InstanceDetails>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetadata {
    pub id: String,
    pub name: String,
    pub application: String,
    /// Name of the owning group.
    pub group: String,
    /// Name of the cluster the instance runs on.
    pub cluster: String,
    pub created: String,
    pub configuration: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDetails {
    /// Raw `helm status` output for the release.
    pub status: String,
    /// Names of the release's pods.
    pub pods: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceListResponse {
    pub api_version: String,
    pub items: Vec<InstanceResponse>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceLogsResponse {
    pub api_version: String,
    pub kind: String,
    pub metadata: InstanceLogsMetadata,
    pub logs: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InstanceLogsMetadata {
    pub id: String,
    pub name: String,
}

async fn instance_response(
    store: &Store,
    instance: ApplicationInstance,
) -> Result<InstanceResponse, InstanceError> {
    let group = groups::get_group(store, &instance.group)
        .await?
        .map(|group| group.name)
        .unwrap_or(instance.group);
    let cluster = clusters_db::get_cluster(store, &instance.cluster)
        .await?
        .map(|cluster| cluster.name)
        .unwrap_or(instance.cluster);

    Ok(InstanceResponse {
        api_version: API_VERSION.to_string(),
        kind: "ApplicationInstance".to_string(),
        metadata: InstanceMetadata {
            id: instance.id,
            name: instance.name,
            application: instance.application,
            group,
            cluster,
            created: instance.created.to_rfc3339(),
            configuration: instance.configuration,
        },
        details: None,
    })
}

#[utoipa::path(
    summary = "List application instances",
    description = "Returns instances, optionally narrowed by group and/or cluster.",
    params(InstanceListQuery),
    responses(
        (status = 200, description = "Instances listed successfully", body = InstanceListResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Instances",
)]
#[get("/instances")]
pub async fn list_instances(
    store: Data<Store>,
    query: Query<InstanceListQuery>,
) -> Result<impl Responder, InstanceError> {
    authenticate(&store, query.token.as_deref()).await?;

    let group_id = match &query.group {
        Some(group_ref) => Some(
            group_by_name_or_id(&store, group_ref)
                .await?
                .ok_or(InstanceError::GroupNotFound)?
                .id,
        ),
        None => None,
    };
    let cluster_id = match &query.cluster {
        Some(cluster_ref) => Some(
            cluster_by_name_or_id(&store, cluster_ref)
                .await?
                .ok_or(InstanceError::ClusterNotFound)?
                .id,
        ),
        None => None,
    };

    let instances =
        instances_db::list_instances(&store, group_id.as_deref(), cluster_id.as_deref()).await?;
    let mut items = Vec::with_capacity(instances.len());
    for instance in instances {
        items.push(instance_response(&store, instance).await?);
    }

    Ok(Json(InstanceListResponse {
        api_version: API_VERSION.to_string(),
        items,
    }))
}

#[utoipa::path(
    summary = "Retrieve an application instance",
    description = "Returns an instance by id. With `detailed`, live helm status and pods are attached.",
    params(("instance_id" = String, Path, description = "Id of the instance"), InstanceDetailQuery),
    responses(
        (status = 200, description = "Instance retrieved successfully", body = InstanceResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Instance not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Instances",
)]
#[get("/instances/{instance_id}")]
pub async fn get_instance(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    query: Query<InstanceDetailQuery>,
    instance_id: Path<String>,
) -> Result<impl Responder, InstanceError> {
    let user = authenticate(&store, query.token.as_deref()).await?;

    let instance = instances_db::get_instance(&store, &instance_id.into_inner())
        .await?
        .ok_or(InstanceError::InstanceNotFound)?;
    require_group_member(&store, &user, &instance.group).await?;

    let mut details = None;
    if flag_set(&query.detailed) {
        let cluster = clusters_db::get_cluster(&store, &instance.cluster)
            .await?
            .ok_or(InstanceError::ClusterNotFound)?;
        let group = groups::get_group(&store, &instance.group)
            .await?
            .ok_or(InstanceError::GroupNotFound)?;
        let config_path = store.config_path_for_cluster(&cluster)?;

        let status = driver
            .helm(
                config_path.path(),
                &cluster.system_namespace,
                &["status", &instance.name],
            )
            .await?;
        let pods = release_pods(driver.get_ref(), &config_path, &group.namespace_name(), &instance.name)
            .await?;

        details = Some(InstanceDetails {
            status: status.stdout,
            pods,
        });
    }

    let mut response = instance_response(&store, instance).await?;
    response.details = details;

    Ok(Json(response))
}

#[utoipa::path(
    summary = "Delete an application instance",
    description = "Deletes the helm release, then the store record. With `force`, the record is \
        removed even if helm fails.",
    params(("instance_id" = String, Path, description = "Id of the instance"), InstanceDeleteQuery),
    responses(
        (status = 200, description = "Instance deleted successfully"),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Instance not found", body = ErrorMessage),
        (status = 500, description = "Helm deletion failed", body = ErrorMessage),
    ),
    tag = "Instances",
)]
#[delete("/instances/{instance_id}")]
pub async fn delete_instance(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    query: Query<InstanceDeleteQuery>,
    instance_id: Path<String>,
) -> Result<impl Responder, InstanceError> {
    let user = authenticate(&store, query.token.as_deref()).await?;

    let instance = instances_db::get_instance(&store, &instance_id.into_inner())
        .await?
        .ok_or(InstanceError::InstanceNotFound)?;
    require_group_member(&store, &user, &instance.group).await?;

    let cluster = clusters_db::get_cluster(&store, &instance.cluster)
        .await?
        .ok_or(InstanceError::ClusterNotFound)?;
    let config_path = store.config_path_for_cluster(&cluster)?;

    let force = flag_set(&query.force);
    delete_instance_resources(&store, driver.get_ref(), &cluster, &config_path, &instance, force)
        .await?;

    info!(instance = %instance.id, by = %user.id, force, "instance deleted");

    Ok(HttpResponse::Ok().finish())
}

#[utoipa::path(
    summary = "Restart an application instance",
    description = "Deletes the helm release and reinstalls it with the stored configuration, \
        keeping id and name stable.",
    params(("instance_id" = String, Path, description = "Id of the instance"), crate::routes::TokenQuery),
    responses(
        (status = 200, description = "Instance restarted successfully"),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Instance not found", body = ErrorMessage),
        (status = 500, description = "Restart failed", body = ErrorMessage),
    ),
    tag = "Instances",
)]
#[put("/instances/{instance_id}/restart")]
pub async fn restart_instance(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    config: Data<ApiConfig>,
    query: Query<crate::routes::TokenQuery>,
    instance_id: Path<String>,
) -> Result<impl Responder, InstanceError> {
    let user = authenticate(&store, query.token.as_deref()).await?;

    let instance = instances_db::get_instance(&store, &instance_id.into_inner())
        .await?
        .ok_or(InstanceError::InstanceNotFound)?;
    require_group_member(&store, &user, &instance.group).await?;

    let cluster = clusters_db::get_cluster(&store, &instance.cluster)
        .await?
        .ok_or(InstanceError::ClusterNotFound)?;
    let config_path = store.config_path_for_cluster(&cluster)?;

    let deleted = driver
        .helm(
            config_path.path(),
            &cluster.system_namespace,
            &["delete", "--purge", &instance.name],
        )
        .await?;
    if !deleted.success() {
        return Err(InstanceError::HelmFailed(deleted.stderr));
    }

    super::apps::reinstall_instance(&store, driver.get_ref(), &config.helm, &cluster, &instance)
        .await
        .map_err(Box::new)?;

    info!(instance = %instance.id, by = %user.id, "instance restarted");

    Ok(HttpResponse::Ok().finish())
}

#[utoipa::path(
    summary = "Fetch instance logs",
    description = "Returns logs of the release's pods, optionally bounded, for one container, \
        or from the previous container incarnation.",
    params(("instance_id" = String, Path, description = "Id of the instance"), InstanceLogsQuery),
    responses(
        (status = 200, description = "Logs fetched", body = InstanceLogsResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Instance not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Instances",
)]
#[get("/instances/{instance_id}/logs")]
pub async fn get_instance_logs(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    query: Query<InstanceLogsQuery>,
    instance_id: Path<String>,
) -> Result<impl Responder, InstanceError> {
    let user = authenticate(&store, query.token.as_deref()).await?;

    let instance = instances_db::get_instance(&store, &instance_id.into_inner())
        .await?
        .ok_or(InstanceError::InstanceNotFound)?;
    require_group_member(&store, &user, &instance.group).await?;

    let cluster = clusters_db::get_cluster(&store, &instance.cluster)
        .await?
        .ok_or(InstanceError::ClusterNotFound)?;
    let group = groups::get_group(&store, &instance.group)
        .await?
        .ok_or(InstanceError::GroupNotFound)?;
    let config_path = store.config_path_for_cluster(&cluster)?;
    let namespace = group.namespace_name();

    let pods = release_pods(driver.get_ref(), &config_path, &namespace, &instance.name).await?;

    let mut logs = String::new();
    for pod in &pods {
        let mut args = vec![
            "logs".to_string(),
            pod.clone(),
            "--namespace".to_string(),
            namespace.clone(),
        ];
        if let Some(max_lines) = query.max_lines {
            args.push(format!("--tail={max_lines}"));
        }
        if let Some(container) = &query.container {
            args.push("-c".to_string());
            args.push(container.clone());
        }
        if flag_set(&query.previous) {
            args.push("--previous".to_string());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = driver.kubectl(config_path.path(), &arg_refs).await?;

        logs.push_str(&format!("========================================\npod: {pod}\n"));
        if output.success() {
            logs.push_str(&output.stdout);
        } else {
            logs.push_str(&output.stderr);
        }
    }

    Ok(Json(InstanceLogsResponse {
        api_version: API_VERSION.to_string(),
        kind: "InstanceLogs".to_string(),
        metadata: InstanceLogsMetadata {
            id: instance.id,
            name: instance.name,
        },
        logs,
    }))
}

/// Lists the pods belonging to a release in the tenant namespace.
async fn release_pods(
    driver: &dyn KubeDriver,
    config_path: &ClusterConfigFile,
    namespace: &str,
    release: &str,
) -> Result<Vec<String>, InstanceError> {
    let selector = format!("-l=release={release}");
    let output = driver
        .kubectl(
            config_path.path(),
            &[
                "get",
                "pods",
                "--namespace",
                namespace,
                &selector,
                "-o=jsonpath={.items[*].metadata.name}",
            ],
        )
        .await?;
    if !output.success() {
        return Err(InstanceError::KubectlFailed(output.stderr));
    }

    Ok(split_columns(&output.stdout, ' ')
        .into_iter()
        .map(str::to_owned)
        .collect())
}

/// Deletes an instance's helm release and store record.
///
/// With `force`, a helm failure is logged and the record still removed; this
/// is what lets a cluster cascade clean residuals out of the store.
pub(crate) async fn delete_instance_resources(
    store: &Store,
    driver: &dyn KubeDriver,
    cluster: &Cluster,
    config_path: &ClusterConfigFile,
    instance: &ApplicationInstance,
    force: bool,
) -> Result<(), InstanceError> {
    let result = driver
        .helm(
            config_path.path(),
            &cluster.system_namespace,
            &["delete", "--purge", &instance.name],
        )
        .await;
    match result {
        Ok(output) if output.success() => {}
        Ok(output) => {
            if !force {
                return Err(InstanceError::HelmFailed(output.stderr));
            }
            warn!(instance = %instance.name, stderr = %output.stderr,
                "helm delete failed; removing record anyway");
        }
        Err(error) => {
            if !force {
                return Err(error.into());
            }
            warn!(instance = %instance.name, %error,
                "helm delete failed; removing record anyway");
        }
    }

    instances_db::delete_instance(store, &instance.id).await?;

    Ok(())
}
