#![allow(dead_code)]

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;

use slate_api::config::{
    ApiConfig, ApplicationSettings, AwsSettings, BootstrapSettings, CacheSettings,
    EncryptionKeySettings, HelmSettings,
};
use slate_api::db::users::User;
use slate_api::db::{Store, users};
use slate_api::encryption::{EncryptionKey, generate_random_key};
use slate_api::ids::IdGenerator;
use slate_api::kube::KubeDriver;
use slate_api::routes::clusters::{CreateClusterMetadata, CreateClusterRequest};
use slate_api::routes::groups::{CreateGroupMetadata, CreateGroupRequest};
use slate_api::routes::secrets::{CreateSecretMetadata, CreateSecretRequest};
use slate_api::startup::run;
use slate_config::Environment;
use slate_telemetry::init_test_tracing;

use crate::support::kube::MockKubeDriver;
use crate::support::memory_store::MemoryBackend;

/// Kubeconfig whose default context names `kube-system`.
pub const KUBECONFIG: &str = "\
apiVersion: v1
kind: Config
contexts:
- context:
    cluster: test-cluster
    namespace: kube-system
    user: admin
  name: test-context
current-context: test-context
";

pub struct SeededUser {
    pub id: String,
    pub token: String,
}

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub store: Store,
    pub kube: Arc<MockKubeDriver>,
    pub admin: SeededUser,
    server_handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

fn test_config() -> ApiConfig {
    ApiConfig {
        application: ApplicationSettings {
            host: "127.0.0.1".to_string(),
            port: 0,
            ssl_certificate: None,
            ssl_key: None,
        },
        aws: AwsSettings {
            access_key_id: "test".to_string(),
            secret_access_key: "test".to_string().into(),
            region: "us-east-1".to_string(),
            url_scheme: "http".to_string(),
            endpoint: None,
            table_prefix: "slate_".to_string(),
        },
        // Compressed timings so the stuck-Tiller path completes quickly.
        bootstrap: BootstrapSettings {
            tiller_poll_ms: 10,
            tiller_deadline_ms: 200,
        },
        cache: CacheSettings {
            entity_ttl_secs: 300,
            reachability_ttl_secs: 1,
        },
        helm: HelmSettings::default(),
        encryption_key: EncryptionKeySettings {
            id: 0,
            key: String::new(),
        },
    }
}

pub async fn spawn_test_app() -> TestApp {
    Environment::Dev.install();
    init_test_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind random port");
    let port = listener.local_addr().unwrap().port();

    let config = test_config();
    let store = Store::new(Arc::new(MemoryBackend::new()), &config.cache);
    let kube = Arc::new(MockKubeDriver::new());
    let encryption_key = EncryptionKey {
        id: 0,
        key: generate_random_key::<32>().expect("failed to generate random key"),
    };

    let admin = seed_user_in(&store, true).await;

    let server = run(
        config,
        listener,
        store.clone(),
        kube.clone() as Arc<dyn KubeDriver>,
        encryption_key,
    )
    .await
    .expect("failed to build server");
    let server_handle = tokio::spawn(server);

    TestApp {
        address: format!("http://127.0.0.1:{port}"),
        client: reqwest::Client::new(),
        store,
        kube,
        admin,
        server_handle,
    }
}

async fn seed_user_in(store: &Store, admin: bool) -> SeededUser {
    let generator = IdGenerator::instance();
    let user = User {
        id: generator.user_id(),
        name: if admin { "Admin" } else { "Member" }.to_string(),
        email: "someone@example.edu".to_string(),
        phone: "555-0100".to_string(),
        institution: "Example University".to_string(),
        admin,
        globus_id: generator.user_id(),
        token: generator.user_token(),
        valid: true,
    };
    users::create_user(store, &user)
        .await
        .expect("failed to seed user");

    SeededUser {
        id: user.id,
        token: user.token,
    }
}

impl TestApp {
    /// Seeds a user directly in the store, bypassing the API.
    pub async fn seed_user(&self, admin: bool) -> SeededUser {
        seed_user_in(&self.store, admin).await
    }

    pub async fn health_check(&self) -> reqwest::Response {
        self.client
            .get(format!("{}/health_check", self.address))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn create_user(&self, token: &str, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}/v1alpha3/users?token={token}", self.address))
            .json(body)
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn get_user(&self, token: &str, user_id: &str) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/v1alpha3/users/{user_id}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn update_user(
        &self,
        token: &str,
        user_id: &str,
        body: &serde_json::Value,
    ) -> reqwest::Response {
        self.client
            .put(format!(
                "{}/v1alpha3/users/{user_id}?token={token}",
                self.address
            ))
            .json(body)
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn delete_user(&self, token: &str, user_id: &str) -> reqwest::Response {
        self.client
            .delete(format!(
                "{}/v1alpha3/users/{user_id}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn list_users(&self, token: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/v1alpha3/users?token={token}", self.address))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn add_user_to_group(
        &self,
        token: &str,
        user_id: &str,
        group: &str,
    ) -> reqwest::Response {
        self.client
            .put(format!(
                "{}/v1alpha3/users/{user_id}/groups/{group}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn remove_user_from_group(
        &self,
        token: &str,
        user_id: &str,
        group: &str,
    ) -> reqwest::Response {
        self.client
            .delete(format!(
                "{}/v1alpha3/users/{user_id}/groups/{group}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn list_user_groups(&self, token: &str, user_id: &str) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/v1alpha3/users/{user_id}/groups?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn create_group(&self, token: &str, name: &str) -> reqwest::Response {
        let body = CreateGroupRequest {
            metadata: CreateGroupMetadata {
                name: name.to_string(),
                science_field: "Physics".to_string(),
                email: "ops@example.edu".to_string(),
                phone: "555-0101".to_string(),
                description: "A test group".to_string(),
            },
        };
        self.client
            .post(format!("{}/v1alpha3/groups?token={token}", self.address))
            .json(&body)
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn list_groups(&self, token: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/v1alpha3/groups?token={token}", self.address))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn get_group(&self, token: &str, group: &str) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/v1alpha3/groups/{group}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn delete_group(&self, token: &str, group: &str) -> reqwest::Response {
        self.client
            .delete(format!(
                "{}/v1alpha3/groups/{group}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn create_cluster(&self, token: &str, name: &str, group: &str) -> reqwest::Response {
        self.create_cluster_with_kubeconfig(token, name, group, KUBECONFIG)
            .await
    }

    pub async fn create_cluster_with_kubeconfig(
        &self,
        token: &str,
        name: &str,
        group: &str,
        kubeconfig: &str,
    ) -> reqwest::Response {
        let body = CreateClusterRequest {
            metadata: CreateClusterMetadata {
                name: name.to_string(),
                group: group.to_string(),
                owning_organization: "Example University".to_string(),
                kubeconfig: kubeconfig.to_string(),
            },
        };
        self.client
            .post(format!("{}/v1alpha3/clusters?token={token}", self.address))
            .json(&body)
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn list_clusters(&self, token: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/v1alpha3/clusters?token={token}", self.address))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn get_cluster(&self, token: &str, cluster_id: &str) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/v1alpha3/clusters/{cluster_id}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn update_cluster(
        &self,
        token: &str,
        cluster_id: &str,
        body: &serde_json::Value,
    ) -> reqwest::Response {
        self.client
            .put(format!(
                "{}/v1alpha3/clusters/{cluster_id}?token={token}",
                self.address
            ))
            .json(body)
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn delete_cluster(
        &self,
        token: &str,
        cluster_id: &str,
        force: bool,
    ) -> reqwest::Response {
        let force = if force { "&force" } else { "" };
        self.client
            .delete(format!(
                "{}/v1alpha3/clusters/{cluster_id}?token={token}{force}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn ping_cluster(
        &self,
        token: &str,
        cluster_id: &str,
        use_cache: bool,
    ) -> reqwest::Response {
        let cache = if use_cache { "&cache=1" } else { "" };
        self.client
            .get(format!(
                "{}/v1alpha3/clusters/{cluster_id}/ping?token={token}{cache}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn verify_cluster(&self, token: &str, cluster_id: &str) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/v1alpha3/clusters/{cluster_id}/verify?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn repair_cluster(
        &self,
        token: &str,
        cluster_id: &str,
        strategy: &str,
    ) -> reqwest::Response {
        self.client
            .post(format!(
                "{}/v1alpha3/clusters/{cluster_id}/repair?token={token}&strategy={strategy}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn list_allowed_groups(&self, token: &str, cluster_id: &str) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/v1alpha3/clusters/{cluster_id}/allowed_groups?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn grant_access(
        &self,
        token: &str,
        cluster_id: &str,
        group: &str,
    ) -> reqwest::Response {
        self.client
            .put(format!(
                "{}/v1alpha3/clusters/{cluster_id}/allowed_groups/{group}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn revoke_access(
        &self,
        token: &str,
        cluster_id: &str,
        group: &str,
    ) -> reqwest::Response {
        self.client
            .delete(format!(
                "{}/v1alpha3/clusters/{cluster_id}/allowed_groups/{group}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn list_allowed_apps(
        &self,
        token: &str,
        cluster_id: &str,
        group: &str,
    ) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/v1alpha3/clusters/{cluster_id}/allowed_groups/{group}/applications?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn allow_app(
        &self,
        token: &str,
        cluster_id: &str,
        group: &str,
        application: &str,
    ) -> reqwest::Response {
        self.client
            .put(format!(
                "{}/v1alpha3/clusters/{cluster_id}/allowed_groups/{group}/applications/{application}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn deny_app(
        &self,
        token: &str,
        cluster_id: &str,
        group: &str,
        application: &str,
    ) -> reqwest::Response {
        self.client
            .delete(format!(
                "{}/v1alpha3/clusters/{cluster_id}/allowed_groups/{group}/applications/{application}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn list_apps(&self, token: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/v1alpha3/apps?token={token}", self.address))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn get_app(&self, token: &str, app: &str) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/v1alpha3/apps/{app}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn install_app(
        &self,
        token: &str,
        app: &str,
        group: &str,
        cluster: &str,
    ) -> reqwest::Response {
        let body = serde_json::json!({
            "metadata": {
                "group": group,
                "cluster": cluster,
                "configuration": "",
            }
        });
        self.client
            .post(format!(
                "{}/v1alpha3/apps/{app}?token={token}",
                self.address
            ))
            .json(&body)
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn list_instances(&self, token: &str) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/v1alpha3/instances?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn get_instance(
        &self,
        token: &str,
        instance_id: &str,
        detailed: bool,
    ) -> reqwest::Response {
        let detailed = if detailed { "&detailed" } else { "" };
        self.client
            .get(format!(
                "{}/v1alpha3/instances/{instance_id}?token={token}{detailed}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn delete_instance(
        &self,
        token: &str,
        instance_id: &str,
        force: bool,
    ) -> reqwest::Response {
        let force = if force { "&force" } else { "" };
        self.client
            .delete(format!(
                "{}/v1alpha3/instances/{instance_id}?token={token}{force}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn restart_instance(&self, token: &str, instance_id: &str) -> reqwest::Response {
        self.client
            .put(format!(
                "{}/v1alpha3/instances/{instance_id}/restart?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn instance_logs(&self, token: &str, instance_id: &str) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/v1alpha3/instances/{instance_id}/logs?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn create_secret(
        &self,
        token: &str,
        name: &str,
        group: &str,
        cluster: &str,
        contents: HashMap<String, String>,
    ) -> reqwest::Response {
        let body = CreateSecretRequest {
            metadata: CreateSecretMetadata {
                name: name.to_string(),
                group: group.to_string(),
                cluster: cluster.to_string(),
                contents: Some(contents),
                copy_from: None,
            },
        };
        self.client
            .post(format!("{}/v1alpha3/secrets?token={token}", self.address))
            .json(&body)
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn copy_secret(
        &self,
        token: &str,
        name: &str,
        group: &str,
        cluster: &str,
        source_id: &str,
    ) -> reqwest::Response {
        let body = CreateSecretRequest {
            metadata: CreateSecretMetadata {
                name: name.to_string(),
                group: group.to_string(),
                cluster: cluster.to_string(),
                contents: None,
                copy_from: Some(source_id.to_string()),
            },
        };
        self.client
            .post(format!("{}/v1alpha3/secrets?token={token}", self.address))
            .json(&body)
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn get_secret(&self, token: &str, secret_id: &str) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/v1alpha3/secrets/{secret_id}?token={token}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn list_secrets(&self, token: &str, group: Option<&str>) -> reqwest::Response {
        let group = group
            .map(|group| format!("&group={group}"))
            .unwrap_or_default();
        self.client
            .get(format!(
                "{}/v1alpha3/secrets?token={token}{group}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn delete_secret(
        &self,
        token: &str,
        secret_id: &str,
        force: bool,
    ) -> reqwest::Response {
        let force = if force { "&force" } else { "" };
        self.client
            .delete(format!(
                "{}/v1alpha3/secrets/{secret_id}?token={token}{force}",
                self.address
            ))
            .send()
            .await
            .expect("failed to execute request")
    }
}
