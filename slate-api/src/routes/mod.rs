use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::db::Store;
use crate::db::clusters::{Cluster, ClustersDbError};
use crate::db::groups::{Group, GroupsDbError};
use crate::ids::{CLUSTER_ID_PREFIX, GROUP_ID_PREFIX};

pub mod apps;
pub mod clusters;
pub mod groups;
pub mod health_check;
pub mod instances;
pub mod secrets;
pub mod statistics;
pub mod users;

/// The API version every document carries and every route is served under.
pub const API_VERSION: &str = "v1alpha3";

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorMessage {
    #[schema(example = "Error")]
    pub kind: String,
    #[schema(example = "Not authorized")]
    pub message: String,
}

impl ErrorMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: "Error".to_string(),
            message: message.into(),
        }
    }
}

/// Bearer token carried by every request as a query parameter.
#[derive(Debug, Deserialize, IntoParams)]
pub struct TokenQuery {
    /// Opaque API token identifying the caller.
    pub token: Option<String>,
}

/// Resolves a group reference that may be either an id or a unique name.
pub(crate) async fn group_by_name_or_id(
    store: &Store,
    reference: &str,
) -> Result<Option<Group>, GroupsDbError> {
    if reference.starts_with(GROUP_ID_PREFIX) {
        crate::db::groups::get_group(store, reference).await
    } else {
        crate::db::groups::find_group_by_name(store, reference).await
    }
}

/// Resolves a cluster reference that may be either an id or a unique name.
pub(crate) async fn cluster_by_name_or_id(
    store: &Store,
    reference: &str,
) -> Result<Option<Cluster>, ClustersDbError> {
    if reference.starts_with(CLUSTER_ID_PREFIX) {
        crate::db::clusters::get_cluster(store, reference).await
    } else {
        crate::db::clusters::find_cluster_by_name(store, reference).await
    }
}

/// Whether a presence-style query flag (e.g. `?force`, `?cache`) was given.
pub(crate) fn flag_set(value: &Option<String>) -> bool {
    value.is_some()
}
