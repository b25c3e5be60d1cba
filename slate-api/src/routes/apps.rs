use std::io::Write;

use actix_web::{
    HttpResponse, Responder, ResponseError, get,
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
use crate::config::{ApiConfig, HelmSettings};
use crate::db::access::AccessDbError;
use crate::db::clusters::{Cluster, ClustersDbError};
use crate::db::groups::GroupsDbError;
use crate::db::instances::{ApplicationInstance, InstancesDbError};
use crate::db::{Store, access, groups, instances as instances_db};
use crate::ids::IdGenerator;
use crate::kube::{DriverError, KubeDriver, ensure_namespace};
use crate::routes::{
    API_VERSION, ErrorMessage, cluster_by_name_or_id, flag_set, group_by_name_or_id,
};
use crate::utils::{split_columns, split_lines};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Group not found")]
    GroupNotFound,

    #[error("Cluster not found")]
    ClusterNotFound,

    #[error("Application {0} not found")]
    ApplicationNotFound(String),

    #[error("An instance with this name already exists on the cluster")]
    InstanceNameInUse,

    #[error("Unable to decode attached chart")]
    InvalidChart,

    #[error("Application installation failed: {0}")]
    HelmFailed(String),

    #[error("Unable to prepare tenant namespace: {0}")]
    KubectlFailed(String),

    #[error("A kube driver error occurred: {0}")]
    Driver(#[from] DriverError),

    #[error("Failed to write scratch file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    GroupsDb(#[from] GroupsDbError),

    #[error(transparent)]
    ClustersDb(#[from] ClustersDbError),

    #[error(transparent)]
    InstancesDb(#[from] InstancesDbError),

    #[error(transparent)]
    AccessDb(#[from] AccessDbError),
}

impl AppError {
    fn to_message(&self) -> String {
        match self {
            // Do not expose store or driver details in error messages
            AppError::Driver(_)
            | AppError::Io(_)
            | AppError::GroupsDb(_)
            | AppError::ClustersDb(_)
            | AppError::InstancesDb(_)
            | AppError::AccessDb(_)
            | AppError::Auth(AuthError::UsersDb(_))
            | AppError::Auth(AuthError::GroupsDb(_)) => "internal server error".to_string(),
            e => e.to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Auth(AuthError::NotAuthorized) => StatusCode::FORBIDDEN,
            AppError::GroupNotFound
            | AppError::ClusterNotFound
            | AppError::ApplicationNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InstanceNameInUse => StatusCode::CONFLICT,
            AppError::InvalidChart => StatusCode::BAD_REQUEST,
            AppError::Auth(_)
            | AppError::HelmFailed(_)
            | AppError::KubectlFailed(_)
            | AppError::Driver(_)
            | AppError::Io(_)
            | AppError::GroupsDb(_)
            | AppError::ClustersDb(_)
            | AppError::InstancesDb(_)
            | AppError::AccessDb(_) => StatusCode::INTERNAL_SERVER_ERROR,
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
pub struct CatalogQuery {
    pub token: Option<String>,
    /// When present, list the development repository instead of stable.
    pub dev: Option<String>,
    /// When present, list the test repository instead of stable.
    pub test: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationListResponse {
    pub api_version: String,
    pub items: Vec<ApplicationResponse>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationResponse {
    pub api_version: String,
    pub kind: String,
    pub metadata: ApplicationMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMetadata {
    pub name: String,
    pub app_version: String,
    pub chart_version: String,
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfigResponse {
    pub api_version: String,
    pub kind: String,
    pub metadata: ApplicationConfigMetadata,
    /// Default configuration of the chart, as YAML text.
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApplicationConfigMetadata {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InstallApplicationRequest {
    pub metadata: InstallApplicationMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallApplicationMetadata {
    /// Name or id of the group installing the application.
    pub group: String,
    /// Name or id of the target cluster.
    pub cluster: String,
    /// User configuration for the release, as YAML text.
    #[serde(default)]
    pub configuration: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AdHocInstallRequest {
    pub metadata: AdHocInstallMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdHocInstallMetadata {
    /// Application name recorded for the instance.
    pub name: String,
    pub group: String,
    pub cluster: String,
    #[serde(default)]
    pub configuration: String,
    /// Base64-encoded gzipped chart tarball.
    pub chart: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCreatedResponse {
    pub api_version: String,
    pub kind: String,
    pub metadata: InstanceCreatedMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InstanceCreatedMetadata {
    pub id: String,
    pub name: String,
}

fn repo_for<'a>(settings: &'a HelmSettings, query: &CatalogQuery) -> &'a str {
    if flag_set(&query.test) {
        &settings.test_repo
    } else if flag_set(&query.dev) {
        &settings.dev_repo
    } else {
        &settings.stable_repo
    }
}

#[utoipa::path(
    summary = "List applications",
    description = "Lists the application catalog from the stable repository, or the dev/test \
        repository when the matching flag is given.",
    params(CatalogQuery),
    responses(
        (status = 200, description = "Applications listed successfully", body = ApplicationListResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Applications",
)]
#[get("/apps")]
pub async fn list_applications(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    config: Data<ApiConfig>,
    query: Query<CatalogQuery>,
) -> Result<impl Responder, AppError> {
    authenticate(&store, query.token.as_deref()).await?;

    let repo = repo_for(&config.helm, &query);
    let search = driver
        .helm_host(&["search", &format!("{repo}/")])
        .await?;
    if !search.success() {
        return Err(AppError::HelmFailed(search.stderr));
    }

    let mut items = Vec::new();
    for line in split_lines(&search.stdout) {
        if line.starts_with("NAME") || line.starts_with("No results") {
            continue;
        }
        let columns = split_columns(line, '\t');
        if columns.is_empty() {
            continue;
        }
        let name = columns[0]
            .strip_prefix(&format!("{repo}/"))
            .unwrap_or(columns[0]);
        items.push(ApplicationResponse {
            api_version: API_VERSION.to_string(),
            kind: "Application".to_string(),
            metadata: ApplicationMetadata {
                name: name.to_string(),
                chart_version: columns.get(1).unwrap_or(&"").to_string(),
                app_version: columns.get(2).unwrap_or(&"").to_string(),
                description: columns.get(3).unwrap_or(&"").to_string(),
            },
        });
    }

    Ok(Json(ApplicationListResponse {
        api_version: API_VERSION.to_string(),
        items,
    }))
}

#[utoipa::path(
    summary = "Fetch an application's configuration",
    description = "Returns the default configuration (values) of a catalog application.",
    params(("app_name" = String, Path, description = "Name of the application"), CatalogQuery),
    responses(
        (status = 200, description = "Configuration fetched", body = ApplicationConfigResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Application not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Applications",
)]
#[get("/apps/{app_name}")]
pub async fn get_application(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    config: Data<ApiConfig>,
    query: Query<CatalogQuery>,
    app_name: Path<String>,
) -> Result<impl Responder, AppError> {
    authenticate(&store, query.token.as_deref()).await?;
    let app_name = app_name.into_inner();

    let repo = repo_for(&config.helm, &query);
    let chart = format!("{repo}/{app_name}");
    let values = driver.helm_host(&["inspect", "values", &chart]).await?;
    if !values.success() {
        return Err(AppError::ApplicationNotFound(app_name));
    }

    Ok(Json(ApplicationConfigResponse {
        api_version: API_VERSION.to_string(),
        kind: "Configuration".to_string(),
        metadata: ApplicationConfigMetadata { name: app_name },
        body: values.stdout,
    }))
}

#[utoipa::path(
    summary = "Install an application",
    description = "Installs a catalog application as a Helm release for a group on a cluster.",
    params(("app_name" = String, Path, description = "Name of the application"), CatalogQuery),
    request_body = InstallApplicationRequest,
    responses(
        (status = 200, description = "Instance created", body = InstanceCreatedResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Group, cluster, or application not found", body = ErrorMessage),
        (status = 409, description = "Instance name already in use", body = ErrorMessage),
        (status = 500, description = "Installation failed", body = ErrorMessage),
    ),
    tag = "Applications",
)]
#[post("/apps/{app_name}")]
pub async fn install_application(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    config: Data<ApiConfig>,
    query: Query<CatalogQuery>,
    app_name: Path<String>,
    body: Json<InstallApplicationRequest>,
) -> Result<impl Responder, AppError> {
    let user = authenticate(&store, query.token.as_deref()).await?;
    let app_name = app_name.into_inner();
    let metadata = body.into_inner().metadata;

    let repo = repo_for(&config.helm, &query);
    let chart = format!("{repo}/{app_name}");

    install(&store, driver.get_ref(), &user, &app_name, &chart, metadata).await
}

#[utoipa::path(
    summary = "Install an ad-hoc chart",
    description = "Installs a caller-supplied chart tarball instead of a catalog application. \
        Subject to the same access and allow-list policy, keyed by the given name.",
    params(crate::routes::TokenQuery),
    request_body = AdHocInstallRequest,
    responses(
        (status = 200, description = "Instance created", body = InstanceCreatedResponse),
        (status = 400, description = "Undecodable chart", body = ErrorMessage),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Group or cluster not found", body = ErrorMessage),
        (status = 409, description = "Instance name already in use", body = ErrorMessage),
        (status = 500, description = "Installation failed", body = ErrorMessage),
    ),
    tag = "Applications",
)]
#[post("/apps/ad-hoc")]
pub async fn install_ad_hoc(
    store: Data<Store>,
    driver: Data<dyn KubeDriver>,
    query: Query<crate::routes::TokenQuery>,
    body: Json<AdHocInstallRequest>,
) -> Result<impl Responder, AppError> {
    let user = authenticate(&store, query.token.as_deref()).await?;
    let metadata = body.into_inner().metadata;

    let chart_bytes = BASE64_STANDARD
        .decode(&metadata.chart)
        .map_err(|_| AppError::InvalidChart)?;
    let mut chart_file = tempfile::Builder::new()
        .prefix("slate-chart-")
        .suffix(".tgz")
        .tempfile()?;
    chart_file.write_all(&chart_bytes)?;
    chart_file.flush()?;
    let chart_path = chart_file.path().to_string_lossy().into_owned();

    let install_metadata = InstallApplicationMetadata {
        group: metadata.group,
        cluster: metadata.cluster,
        configuration: metadata.configuration,
    };

    install(
        &store,
        driver.get_ref(),
        &user,
        &metadata.name,
        &chart_path,
        install_metadata,
    )
    .await
}

/// Shared install path for catalog and ad-hoc charts.
///
/// Policy checks come first; the instance record is written before Helm runs
/// and removed again if Helm fails.
async fn install(
    store: &Store,
    driver: &dyn KubeDriver,
    user: &crate::db::users::User,
    app_name: &str,
    chart: &str,
    metadata: InstallApplicationMetadata,
) -> Result<Json<InstanceCreatedResponse>, AppError> {
    let group = group_by_name_or_id(store, &metadata.group)
        .await?
        .ok_or(AppError::GroupNotFound)?;
    require_group_member(store, user, &group.id).await?;

    let cluster = cluster_by_name_or_id(store, &metadata.cluster)
        .await?
        .ok_or(AppError::ClusterNotFound)?;

    if !access::group_may_access_cluster(store, &group.id, &cluster).await? {
        return Err(AuthError::NotAuthorized.into());
    }
    if !access::group_may_use_application(store, &group.id, &cluster, app_name).await? {
        return Err(AuthError::NotAuthorized.into());
    }

    let release_name = format!("{}-{}", group.name, app_name);
    if instances_db::find_instance_by_name(store, &cluster.id, &release_name)
        .await?
        .is_some()
    {
        return Err(AppError::InstanceNameInUse);
    }

    let instance = ApplicationInstance {
        id: IdGenerator::instance().instance_id(),
        name: release_name,
        application: app_name.to_string(),
        group: group.id.clone(),
        cluster: cluster.id.clone(),
        created: Utc::now(),
        configuration: metadata.configuration,
    };
    instances_db::create_instance(store, &instance).await?;

    if let Err(error) =
        helm_install_instance(store, driver, &cluster, &group.namespace_name(), chart, &instance)
            .await
    {
        warn!(instance = %instance.name, %error, "helm install failed; removing record");
        instances_db::delete_instance(store, &instance.id).await?;
        return Err(error);
    }

    info!(instance = %instance.id, release = %instance.name, cluster = %cluster.id,
        group = %group.id, by = %user.id, "application installed");

    Ok(Json(InstanceCreatedResponse {
        api_version: API_VERSION.to_string(),
        kind: "ApplicationInstance".to_string(),
        metadata: InstanceCreatedMetadata {
            id: instance.id,
            name: instance.name,
        },
    }))
}

/// Drives `helm install` for an instance, materializing its values file and
/// making sure the tenant namespace exists first.
pub(crate) async fn helm_install_instance(
    store: &Store,
    driver: &dyn KubeDriver,
    cluster: &Cluster,
    namespace: &str,
    chart: &str,
    instance: &ApplicationInstance,
) -> Result<(), AppError> {
    let config_path = store.config_path_for_cluster(cluster)?;

    let prepared = ensure_namespace(driver, config_path.path(), namespace).await?;
    if !prepared.success() {
        return Err(AppError::KubectlFailed(prepared.stderr));
    }

    // The values file must outlive the helm invocation.
    let mut values_file = None;
    let mut args = vec![
        "install".to_string(),
        chart.to_string(),
        "--name".to_string(),
        instance.name.clone(),
        "--namespace".to_string(),
        namespace.to_string(),
    ];
    if !instance.configuration.trim().is_empty() {
        let mut file = tempfile::Builder::new()
            .prefix("slate-values-")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(instance.configuration.as_bytes())?;
        file.flush()?;
        args.push("--values".to_string());
        args.push(file.path().to_string_lossy().into_owned());
        values_file = Some(file);
    }

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = driver
        .helm(config_path.path(), &cluster.system_namespace, &arg_refs)
        .await?;
    drop(values_file);
    if !output.success() {
        return Err(AppError::HelmFailed(output.stderr));
    }

    Ok(())
}

/// Re-installs a missing instance from its stored record, used by cluster
/// repair. Ad-hoc charts cannot be recovered and resolve against the stable
/// repository like catalog applications.
pub(crate) async fn reinstall_instance(
    store: &Store,
    driver: &dyn KubeDriver,
    helm: &HelmSettings,
    cluster: &Cluster,
    instance: &ApplicationInstance,
) -> Result<(), AppError> {
    let group = groups::get_group(store, &instance.group)
        .await?
        .ok_or(AppError::GroupNotFound)?;
    let chart = format!("{}/{}", helm.stable_repo, instance.application);

    helm_install_instance(
        store,
        driver,
        cluster,
        &group.namespace_name(),
        &chart,
        instance,
    )
    .await
}
