use serde::Deserialize;
use slate_config::SecretValue;

/// Complete configuration for the SLATE API service.
///
/// Contains the HTTP server settings, the key-value store connection, the
/// cluster bootstrap and cache tuning knobs, the helm catalog repositories,
/// and the secret-encryption key.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Application server settings.
    pub application: ApplicationSettings,
    /// Key-value store connection settings.
    pub aws: AwsSettings,
    /// Cluster bootstrap timing.
    #[serde(default)]
    pub bootstrap: BootstrapSettings,
    /// Store cache TTLs.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Helm catalog repositories.
    #[serde(default)]
    pub helm: HelmSettings,
    /// Encryption key for secret contents at rest.
    pub encryption_key: EncryptionKeySettings,
}

/// HTTP server configuration settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSettings {
    /// Host address the API listens on.
    pub host: String,
    /// Port number the API listens on.
    pub port: u16,
    /// PEM certificate chain path; enables TLS together with `ssl_key`.
    pub ssl_certificate: Option<String>,
    /// PEM private key path; enables TLS together with `ssl_certificate`.
    pub ssl_key: Option<String>,
}

/// Connection settings for the DynamoDB-compatible key-value store.
#[derive(Debug, Clone, Deserialize)]
pub struct AwsSettings {
    /// Access key id presented to the store.
    pub access_key_id: String,
    /// Secret access key presented to the store.
    pub secret_access_key: SecretValue,
    /// AWS region name.
    pub region: String,
    /// URL scheme for a custom endpoint, `http` or `https`.
    #[serde(default = "default_url_scheme")]
    pub url_scheme: String,
    /// Custom endpoint (`host:port`), e.g. a local DynamoDB instance.
    pub endpoint: Option<String>,
    /// Prefix applied to every table name.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
}

impl AwsSettings {
    /// Returns the full endpoint URL override, if a custom endpoint is set.
    pub fn endpoint_url(&self) -> Option<String> {
        self.endpoint
            .as_ref()
            .map(|endpoint| format!("{}://{}", self.url_scheme, endpoint))
    }
}

fn default_url_scheme() -> String {
    "https".to_string()
}

fn default_table_prefix() -> String {
    "slate_".to_string()
}

/// Timing for the Tiller readiness poll during cluster registration.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapSettings {
    /// Poll period in milliseconds.
    #[serde(default = "default_tiller_poll_ms")]
    pub tiller_poll_ms: u64,
    /// Poll deadline in milliseconds.
    #[serde(default = "default_tiller_deadline_ms")]
    pub tiller_deadline_ms: u64,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            tiller_poll_ms: default_tiller_poll_ms(),
            tiller_deadline_ms: default_tiller_deadline_ms(),
        }
    }
}

fn default_tiller_poll_ms() -> u64 {
    500
}

fn default_tiller_deadline_ms() -> u64 {
    120_000
}

/// TTLs for the store's read caches.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// TTL for entity caches, in seconds.
    #[serde(default = "default_entity_ttl_secs")]
    pub entity_ttl_secs: u64,
    /// TTL for the cluster reachability cache, in seconds.
    #[serde(default = "default_reachability_ttl_secs")]
    pub reachability_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            entity_ttl_secs: default_entity_ttl_secs(),
            reachability_ttl_secs: default_reachability_ttl_secs(),
        }
    }
}

fn default_entity_ttl_secs() -> u64 {
    300
}

fn default_reachability_ttl_secs() -> u64 {
    60
}

/// Names of the helm repositories backing the application catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct HelmSettings {
    /// Repository holding released charts.
    #[serde(default = "default_stable_repo")]
    pub stable_repo: String,
    /// Repository holding charts under development.
    #[serde(default = "default_dev_repo")]
    pub dev_repo: String,
    /// Repository holding charts used only by tests.
    #[serde(default = "default_test_repo")]
    pub test_repo: String,
    /// Base URL the repositories are registered from at startup.
    #[serde(default = "default_repo_base_url")]
    pub repo_base_url: String,
}

impl Default for HelmSettings {
    fn default() -> Self {
        Self {
            stable_repo: default_stable_repo(),
            dev_repo: default_dev_repo(),
            test_repo: default_test_repo(),
            repo_base_url: default_repo_base_url(),
        }
    }
}

fn default_stable_repo() -> String {
    "slate".to_string()
}

fn default_dev_repo() -> String {
    "slate-dev".to_string()
}

fn default_test_repo() -> String {
    "slate-test".to_string()
}

fn default_repo_base_url() -> String {
    "https://raw.githubusercontent.com/slateci/slate-catalog/master".to_string()
}

/// Encryption key configuration with identifier and base64 key material.
#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionKeySettings {
    /// Unique identifier for the key.
    pub id: u32,
    /// Base64-encoded 32-byte key material.
    pub key: String,
}
