use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::net::TcpListener;
use std::sync::Arc;

use actix_web::{App, HttpResponse, HttpServer, dev::Server, web};
use anyhow::{anyhow, bail};
use aws_lc_rs::aead::{AES_256_GCM, RandomizedNonceKey};
use base64::{Engine, prelude::BASE64_STANDARD};
use tracing::info;
use tracing_actix_web::TracingLogger;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{ApiConfig, HelmSettings};
use crate::db::{DynamoBackend, Store, StoreStatistics};
use crate::encryption::EncryptionKey;
use crate::kube::{KubeDriver, process::ProcessKubeDriver};
use crate::routes::{
    API_VERSION, ErrorMessage,
    apps::{get_application, install_ad_hoc, install_application, list_applications},
    clusters::{
        allow_group_application, create_cluster, delete_cluster, deny_group_application,
        get_cluster, grant_group_access, list_allowed_groups, list_clusters,
        list_group_allowed_applications, ping_cluster, repair_cluster, revoke_group_access,
        update_cluster, verify_cluster,
    },
    groups::{create_group, delete_group, get_group, list_groups, update_group},
    health_check::health_check,
    instances::{
        delete_instance, get_instance, get_instance_logs, list_instances, restart_instance,
    },
    secrets::{create_secret, delete_secret, get_secret, list_secrets},
    statistics::store_statistics,
    users::{
        add_user_to_group, create_user, delete_user, find_user, get_user, list_user_groups,
        list_users, remove_user_from_group, update_user,
    },
};
use crate::utils::{split_columns, split_lines};

pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(config: ApiConfig) -> Result<Self, anyhow::Error> {
        let backend = DynamoBackend::new(&config.aws).await;
        backend.ensure_tables().await?;
        let store = Store::new(Arc::new(backend), &config.cache);

        let driver: Arc<dyn KubeDriver> = Arc::new(ProcessKubeDriver::new());
        ensure_catalog_repos(driver.as_ref(), &config.helm).await?;

        let encryption_key = build_encryption_key(&config)?;

        let address = format!("{}:{}", config.application.host, config.application.port);
        let listener = TcpListener::bind(address)?;
        let port = listener.local_addr()?.port();

        let server = run(config, listener, store, driver, encryption_key).await?;

        Ok(Self { port, server })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server.await
    }
}

fn build_encryption_key(config: &ApiConfig) -> Result<EncryptionKey, anyhow::Error> {
    let key_bytes = BASE64_STANDARD.decode(&config.encryption_key.key)?;
    let key = RandomizedNonceKey::new(&AES_256_GCM, &key_bytes)
        .map_err(|_| anyhow!("encryption key is not valid AES-256-GCM key material"))?;

    Ok(EncryptionKey {
        id: config.encryption_key.id,
        key,
    })
}

/// Makes sure the helm binary works and the catalog repositories are
/// registered and current. Fatal at boot when they are not.
pub async fn ensure_catalog_repos(
    driver: &dyn KubeDriver,
    helm: &HelmSettings,
) -> Result<(), anyhow::Error> {
    let repos = driver.helm_host(&["repo", "list"]).await?;
    if !repos.success() {
        bail!("helm repo list failed: {}", repos.stderr);
    }

    let mut present = HashSet::new();
    for line in split_lines(&repos.stdout).iter().skip(1) {
        if let Some(name) = split_columns(line, '\t').first() {
            present.insert(name.to_string());
        }
    }

    for (repo, path) in [
        (helm.stable_repo.as_str(), "stable-repo"),
        (helm.dev_repo.as_str(), "incubator-repo"),
        (helm.test_repo.as_str(), "test-repo"),
    ] {
        if present.contains(repo) {
            continue;
        }
        info!(repo, "catalog repository not registered; adding");
        let url = format!("{}/{}/", helm.repo_base_url, path);
        let added = driver.helm_host(&["repo", "add", repo, &url]).await?;
        if !added.success() {
            bail!("unable to add catalog repository {repo}: {}", added.stderr);
        }
    }

    let updated = driver.helm_host(&["repo", "update"]).await?;
    if !updated.success() {
        bail!("helm repo update failed: {}", updated.stderr);
    }

    Ok(())
}

fn load_tls_config(
    certificate_path: &str,
    key_path: &str,
) -> Result<rustls::ServerConfig, anyhow::Error> {
    let certificates = rustls_pemfile::certs(&mut BufReader::new(File::open(certificate_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| anyhow!("no private key found in {key_path}"))?;

    Ok(rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, key)?)
}

async fn api_route_not_found() -> HttpResponse {
    HttpResponse::NotFound().json(ErrorMessage::new("Not found"))
}

/// Any path outside the supported version scope gets a structured rejection
/// the client recognizes and uses to trigger version negotiation.
async fn unsupported_api_version() -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorMessage::new("Unsupported API version"))
}

pub async fn run(
    config: ApiConfig,
    listener: TcpListener,
    store: Store,
    driver: Arc<dyn KubeDriver>,
    encryption_key: EncryptionKey,
) -> Result<Server, anyhow::Error> {
    let tls = match (
        &config.application.ssl_certificate,
        &config.application.ssl_key,
    ) {
        (Some(certificate), Some(key)) => Some(load_tls_config(certificate, key)?),
        (None, None) => None,
        _ => bail!("ssl_certificate and ssl_key must be specified together"),
    };

    let config = web::Data::new(config);
    let store = web::Data::new(store);
    let encryption_key = web::Data::new(encryption_key);
    let driver: web::Data<dyn KubeDriver> = web::Data::from(driver);

    #[derive(OpenApi)]
    #[openapi(
        paths(
            crate::routes::health_check::health_check,
            crate::routes::statistics::store_statistics,
            crate::routes::users::list_users,
            crate::routes::users::create_user,
            crate::routes::users::get_user,
            crate::routes::users::update_user,
            crate::routes::users::delete_user,
            crate::routes::users::list_user_groups,
            crate::routes::users::add_user_to_group,
            crate::routes::users::remove_user_from_group,
            crate::routes::users::find_user,
            crate::routes::groups::list_groups,
            crate::routes::groups::create_group,
            crate::routes::groups::get_group,
            crate::routes::groups::update_group,
            crate::routes::groups::delete_group,
            crate::routes::clusters::list_clusters,
            crate::routes::clusters::create_cluster,
            crate::routes::clusters::get_cluster,
            crate::routes::clusters::update_cluster,
            crate::routes::clusters::delete_cluster,
            crate::routes::clusters::ping_cluster,
            crate::routes::clusters::verify_cluster,
            crate::routes::clusters::repair_cluster,
            crate::routes::clusters::list_allowed_groups,
            crate::routes::clusters::grant_group_access,
            crate::routes::clusters::revoke_group_access,
            crate::routes::clusters::list_group_allowed_applications,
            crate::routes::clusters::allow_group_application,
            crate::routes::clusters::deny_group_application,
            crate::routes::apps::list_applications,
            crate::routes::apps::get_application,
            crate::routes::apps::install_application,
            crate::routes::apps::install_ad_hoc,
            crate::routes::instances::list_instances,
            crate::routes::instances::get_instance,
            crate::routes::instances::delete_instance,
            crate::routes::instances::restart_instance,
            crate::routes::instances::get_instance_logs,
            crate::routes::secrets::list_secrets,
            crate::routes::secrets::create_secret,
            crate::routes::secrets::get_secret,
            crate::routes::secrets::delete_secret,
        ),
        components(schemas(
            ErrorMessage,
            StoreStatistics,
            crate::routes::users::CreateUserRequest,
            crate::routes::users::UpdateUserRequest,
            crate::routes::users::UserResponse,
            crate::routes::users::UserListResponse,
            crate::routes::users::GroupMembershipResponse,
            crate::routes::groups::CreateGroupRequest,
            crate::routes::groups::UpdateGroupRequest,
            crate::routes::groups::GroupResponse,
            crate::routes::groups::GroupListResponse,
            crate::routes::clusters::CreateClusterRequest,
            crate::routes::clusters::UpdateClusterRequest,
            crate::routes::clusters::ClusterCreatedResponse,
            crate::routes::clusters::ClusterResponse,
            crate::routes::clusters::ClusterListResponse,
            crate::routes::clusters::PingResponse,
            crate::routes::clusters::AllowedGroupsResponse,
            crate::routes::clusters::AllowedApplicationsResponse,
            crate::routes::clusters::ConsistencyResponse,
            crate::routes::clusters::RepairResponse,
            crate::routes::apps::ApplicationListResponse,
            crate::routes::apps::ApplicationConfigResponse,
            crate::routes::apps::InstallApplicationRequest,
            crate::routes::apps::AdHocInstallRequest,
            crate::routes::apps::InstanceCreatedResponse,
            crate::routes::instances::InstanceResponse,
            crate::routes::instances::InstanceListResponse,
            crate::routes::instances::InstanceLogsResponse,
            crate::routes::secrets::CreateSecretRequest,
            crate::routes::secrets::SecretCreatedResponse,
            crate::routes::secrets::SecretResponse,
            crate::routes::secrets::SecretListResponse,
        ))
    )]
    struct ApiDoc;

    let openapi = ApiDoc::openapi();

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .service(health_check)
            .service(store_statistics)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi.clone()),
            )
            .service(
                web::scope(API_VERSION)
                    // users
                    .service(list_users)
                    .service(create_user)
                    .service(find_user)
                    .service(list_user_groups)
                    .service(add_user_to_group)
                    .service(remove_user_from_group)
                    .service(get_user)
                    .service(update_user)
                    .service(delete_user)
                    // groups
                    .service(list_groups)
                    .service(create_group)
                    .service(get_group)
                    .service(update_group)
                    .service(delete_group)
                    // clusters
                    .service(list_clusters)
                    .service(create_cluster)
                    .service(ping_cluster)
                    .service(verify_cluster)
                    .service(repair_cluster)
                    .service(list_allowed_groups)
                    .service(list_group_allowed_applications)
                    .service(allow_group_application)
                    .service(deny_group_application)
                    .service(grant_group_access)
                    .service(revoke_group_access)
                    .service(get_cluster)
                    .service(update_cluster)
                    .service(delete_cluster)
                    // applications
                    .service(list_applications)
                    .service(install_ad_hoc)
                    .service(get_application)
                    .service(install_application)
                    // instances
                    .service(list_instances)
                    .service(restart_instance)
                    .service(get_instance_logs)
                    .service(get_instance)
                    .service(delete_instance)
                    // secrets
                    .service(list_secrets)
                    .service(create_secret)
                    .service(get_secret)
                    .service(delete_secret)
                    .default_service(web::route().to(api_route_not_found)),
            )
            .default_service(web::route().to(unsupported_api_version))
            .app_data(config.clone())
            .app_data(store.clone())
            .app_data(encryption_key.clone())
            .app_data(driver.clone())
    });

    let server = match tls {
        Some(tls) => server.listen_rustls_0_23(listener, tls)?,
        None => server.listen(listener)?,
    };

    Ok(server.run())
}
