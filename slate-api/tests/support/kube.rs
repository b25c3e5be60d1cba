#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use slate_api::kube::{CommandOutput, DriverError, KubeDriver};

/// Scriptable cluster state backing [`MockKubeDriver`].
///
/// Tests tweak these fields to simulate unreachable clusters, stuck Tiller
/// pods, failing helm operations, and drifted live state.
pub struct MockState {
    pub reachable: bool,
    pub service_accounts: Vec<String>,
    /// Namespace reported by `describe serviceaccount`; defaults to the
    /// account's own name.
    pub described_namespace: Option<String>,
    pub helm_init_stdout: String,
    pub deployments: Vec<String>,
    /// Line reported for the Tiller pod by `get pods`.
    pub tiller_pod_line: String,
    pub helm_releases: Vec<String>,
    pub namespaces: Vec<String>,
    /// Secret names per namespace.
    pub secrets: HashMap<String, Vec<String>>,
    /// Pod names reported for release selectors.
    pub release_pods: Vec<String>,
    pub fail_helm_install: bool,
    pub fail_helm_delete: bool,
    pub fail_kubectl_delete_secret: bool,
    /// Catalog rows: name, chart version, app version, description.
    pub catalog: Vec<(String, String, String, String)>,
    pub values_output: String,
    pub helm_status_output: String,
    pub logs_output: String,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            reachable: true,
            service_accounts: vec!["default".to_string(), "kube-system".to_string()],
            described_namespace: None,
            helm_init_stdout:
                "Tiller (the Helm server-side component) has been installed into your Kubernetes Cluster."
                    .to_string(),
            deployments: vec!["tiller-deploy".to_string()],
            tiller_pod_line: "tiller-deploy-5d4c6d79d6-abcde   1/1   Running   0   10s".to_string(),
            helm_releases: Vec::new(),
            namespaces: vec!["default".to_string(), "kube-system".to_string()],
            secrets: HashMap::new(),
            release_pods: vec!["pod-0".to_string()],
            fail_helm_install: false,
            fail_helm_delete: false,
            fail_kubectl_delete_secret: false,
            catalog: vec![(
                "nginx".to_string(),
                "0.2.0".to_string(),
                "1.15".to_string(),
                "A basic NGINX HTTP server".to_string(),
            )],
            values_output: "replicaCount: 1\n".to_string(),
            helm_status_output: "LAST DEPLOYED: now\nSTATUS: DEPLOYED\n".to_string(),
            logs_output: "starting up\nready\n".to_string(),
        }
    }
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        status: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn failed(stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        status: 1,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// Driver whose responses come from a [`MockState`] instead of real
/// subprocesses.
pub struct MockKubeDriver {
    state: Mutex<MockState>,
}

impl MockKubeDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl KubeDriver for MockKubeDriver {
    async fn kubectl(
        &self,
        _config_path: &Path,
        args: &[&str],
    ) -> Result<CommandOutput, DriverError> {
        let mut state = self.state.lock().unwrap();

        match args {
            ["get", "serviceaccounts", ..] => {
                if !state.reachable {
                    return Ok(failed("Unable to connect to the server"));
                }
                Ok(ok(state.service_accounts.join(" ")))
            }
            ["describe", "serviceaccount", account, ..] => {
                if !state.reachable {
                    return Ok(failed("Unable to connect to the server"));
                }
                let namespace = state
                    .described_namespace
                    .clone()
                    .unwrap_or_else(|| account.to_string());
                Ok(ok(format!("Name: {account}\nNamespace: {namespace}\n")))
            }
            ["get", "deployments", ..] => Ok(ok(state.deployments.join(" "))),
            ["get", "pods", "--namespace", _, rest @ ..] => {
                if rest.iter().any(|arg| arg.starts_with("-l=")) {
                    return Ok(ok(state.release_pods.join(" ")));
                }
                let mut output =
                    "NAME   READY   STATUS   RESTARTS   AGE\n".to_string();
                output.push_str(&state.tiller_pod_line);
                output.push('\n');
                Ok(ok(output))
            }
            ["get", "namespaces", ..] => Ok(ok(state.namespaces.join(" "))),
            ["get", "namespace", namespace, ..] => {
                if state.namespaces.iter().any(|n| n.as_str() == *namespace) {
                    Ok(ok(""))
                } else {
                    Ok(failed(format!(
                        "Error from server (NotFound): namespaces \"{namespace}\" not found"
                    )))
                }
            }
            ["create", "namespace", namespace, ..] => {
                state.namespaces.push(namespace.to_string());
                Ok(ok(format!("namespace/{namespace} created")))
            }
            ["delete", "namespace", namespace, ..] => {
                state.namespaces.retain(|n| n.as_str() != *namespace);
                state.secrets.remove(*namespace);
                Ok(ok(format!("namespace \"{namespace}\" deleted")))
            }
            ["get", "secrets", "-n", namespace, ..] => Ok(ok(state
                .secrets
                .get(*namespace)
                .map(|names| names.join(" "))
                .unwrap_or_default())),
            ["apply", "-f", manifest_path, ..] => {
                // The manifest is materialized to a scratch file; read it back
                // so consistency checks observe the pushed secret.
                let manifest = std::fs::read_to_string(*manifest_path).unwrap_or_default();
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&manifest) {
                    let name = value["metadata"]["name"].as_str().unwrap_or_default();
                    let namespace = value["metadata"]["namespace"].as_str().unwrap_or_default();
                    let entries = state.secrets.entry(namespace.to_string()).or_default();
                    if !entries.iter().any(|n| n == name) {
                        entries.push(name.to_string());
                    }
                }
                Ok(ok("secret configured"))
            }
            ["delete", "secret", name, "--namespace", namespace, ..] => {
                if state.fail_kubectl_delete_secret {
                    return Ok(failed("simulated kubectl failure"));
                }
                if let Some(entries) = state.secrets.get_mut(*namespace) {
                    entries.retain(|n| n.as_str() != *name);
                }
                Ok(ok(format!("secret \"{name}\" deleted")))
            }
            ["logs", ..] => Ok(ok(state.logs_output.clone())),
            _ => Ok(ok("")),
        }
    }

    async fn helm(
        &self,
        _config_path: &Path,
        _tiller_namespace: &str,
        args: &[&str],
    ) -> Result<CommandOutput, DriverError> {
        let mut state = self.state.lock().unwrap();

        match args {
            ["init", ..] => Ok(ok(state.helm_init_stdout.clone())),
            ["list", ..] => {
                let mut output =
                    "NAME\tREVISION\tUPDATED\tSTATUS\tCHART\tNAMESPACE\n".to_string();
                for release in &state.helm_releases {
                    output.push_str(&format!("{release}\t1\tnow\tDEPLOYED\tchart-0.1.0\tns\n"));
                }
                Ok(ok(output))
            }
            ["install", _, "--name", name, ..] => {
                if state.fail_helm_install {
                    return Ok(failed("simulated helm install failure"));
                }
                let name = name.to_string();
                if !state.helm_releases.iter().any(|r| r == &name) {
                    state.helm_releases.push(name.clone());
                }
                Ok(ok(format!("NAME: {name}\nSTATUS: DEPLOYED\n")))
            }
            ["delete", "--purge", name, ..] => {
                if state.fail_helm_delete {
                    return Ok(failed("simulated helm delete failure"));
                }
                state.helm_releases.retain(|r| r.as_str() != *name);
                Ok(ok(format!("release \"{name}\" deleted")))
            }
            ["status", ..] => Ok(ok(state.helm_status_output.clone())),
            _ => Ok(ok("")),
        }
    }

    async fn helm_host(&self, args: &[&str]) -> Result<CommandOutput, DriverError> {
        let state = self.state.lock().unwrap();

        match args {
            ["search", repo, ..] => {
                let repo = repo.trim_end_matches('/');
                let mut output =
                    "NAME\tCHART VERSION\tAPP VERSION\tDESCRIPTION\n".to_string();
                for (name, chart_version, app_version, description) in &state.catalog {
                    output.push_str(&format!(
                        "{repo}/{name}\t{chart_version}\t{app_version}\t{description}\n"
                    ));
                }
                Ok(ok(output))
            }
            ["inspect", "values", chart, ..] => {
                let name = chart.rsplit('/').next().unwrap_or_default();
                if state.catalog.iter().any(|(n, ..)| n == name) {
                    Ok(ok(state.values_output.clone()))
                } else {
                    Ok(failed(format!("Error: failed to download \"{chart}\"")))
                }
            }
            ["repo", ..] => Ok(ok("")),
            _ => Ok(ok("")),
        }
    }
}
