use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

/// Errors raised while interpreting caller-supplied kubeconfig text.
#[derive(Debug, Error)]
pub enum KubeconfigError {
    #[error("Unable to parse kubeconfig as YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Unable to determine kubernetes namespace from kubeconfig")]
    MissingNamespace,
}

/// Extracts the system namespace from a kubeconfig.
///
/// The kubeconfig may be a sequence of YAML documents; the namespace of the
/// first context of the first document that defines one wins. Clusters
/// without a context namespace cannot be registered, since that namespace is
/// where Tiller lives and where the federation service account is expected.
pub fn system_namespace(config: &str) -> Result<String, KubeconfigError> {
    for document in serde_yaml::Deserializer::from_str(config) {
        let value = Value::deserialize(document)?;
        if let Some(namespace) = context_namespace(&value) {
            return Ok(namespace);
        }
    }
    Err(KubeconfigError::MissingNamespace)
}

fn context_namespace(document: &Value) -> Option<String> {
    document
        .get("contexts")?
        .as_sequence()?
        .first()?
        .get("context")?
        .get("namespace")?
        .as_str()
        .map(str::to_owned)
}
