use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{BackendError, Store, TABLE_GROUPS, TABLE_MEMBERS};

/// Prefix of the Kubernetes namespace derived from a group's name.
pub const NAMESPACE_PREFIX: &str = "slate-group-";

#[derive(Debug, Error)]
pub enum GroupsDbError {
    #[error("Error while interacting with the store for groups: {0}")]
    Backend(#[from] BackendError),

    #[error("Stored group record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A tenant: a set of users sharing ownership of clusters, instances, and
/// secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub science_field: String,
    pub email: String,
    pub phone: String,
    pub description: String,
}

impl Group {
    /// The Kubernetes namespace this group occupies on every cluster it has
    /// access to. A pure function of the group name; never changes for the
    /// lifetime of the group.
    pub fn namespace_name(&self) -> String {
        format!("{NAMESPACE_PREFIX}{}", self.name)
    }
}

/// A user's membership in a group.
#[derive(Debug, Serialize, Deserialize)]
struct Membership {
    user: String,
    group: String,
}

fn membership_key(user_id: &str, group_id: &str) -> String {
    format!("{user_id}:{group_id}")
}

pub async fn create_group(store: &Store, group: &Group) -> Result<(), GroupsDbError> {
    let doc = serde_json::to_string(group)?;
    store
        .backend()
        .put(TABLE_GROUPS, &group.id, &[("name", group.name.clone())], doc)
        .await?;

    store.group_cache().invalidate(&group.id);
    store.group_name_cache().invalidate(&group.name);

    Ok(())
}

pub async fn update_group(store: &Store, group: &Group) -> Result<(), GroupsDbError> {
    create_group(store, group).await
}

pub async fn get_group(store: &Store, group_id: &str) -> Result<Option<Group>, GroupsDbError> {
    if let Some(group) = store.group_cache().get(group_id) {
        return Ok(Some(group));
    }

    let Some(doc) = store.backend().get(TABLE_GROUPS, group_id).await? else {
        return Ok(None);
    };
    let group: Group = serde_json::from_str(&doc)?;
    store.group_cache().insert(&group.id, group.clone());

    Ok(Some(group))
}

pub async fn find_group_by_name(store: &Store, name: &str) -> Result<Option<Group>, GroupsDbError> {
    if let Some(group) = store.group_name_cache().get(name) {
        return Ok(Some(group));
    }

    let docs = store
        .backend()
        .find(TABLE_GROUPS, &[("name", name.to_string())])
        .await?;
    let Some(doc) = docs.first() else {
        return Ok(None);
    };
    let group: Group = serde_json::from_str(doc)?;
    store.group_name_cache().insert(name, group.clone());
    store.group_cache().insert(&group.id, group.clone());

    Ok(Some(group))
}

pub async fn delete_group(store: &Store, group: &Group) -> Result<(), GroupsDbError> {
    store.backend().delete(TABLE_GROUPS, &group.id).await?;

    store.group_cache().invalidate(&group.id);
    store.group_name_cache().invalidate(&group.name);

    Ok(())
}

pub async fn list_groups(store: &Store) -> Result<Vec<Group>, GroupsDbError> {
    let docs = store.backend().find(TABLE_GROUPS, &[]).await?;

    docs.iter()
        .map(|doc| serde_json::from_str(doc).map_err(GroupsDbError::from))
        .collect()
}

pub async fn add_user_to_group(
    store: &Store,
    user_id: &str,
    group_id: &str,
) -> Result<(), GroupsDbError> {
    let membership = Membership {
        user: user_id.to_string(),
        group: group_id.to_string(),
    };
    let doc = serde_json::to_string(&membership)?;
    store
        .backend()
        .put(
            TABLE_MEMBERS,
            &membership_key(user_id, group_id),
            &[
                ("user_id", user_id.to_string()),
                ("group_id", group_id.to_string()),
            ],
            doc,
        )
        .await?;

    Ok(())
}

pub async fn remove_user_from_group(
    store: &Store,
    user_id: &str,
    group_id: &str,
) -> Result<(), GroupsDbError> {
    store
        .backend()
        .delete(TABLE_MEMBERS, &membership_key(user_id, group_id))
        .await?;

    Ok(())
}

/// Whether the user belongs to the group. Backs every group-scoped
/// authorization decision.
pub async fn user_in_group(
    store: &Store,
    user_id: &str,
    group_id: &str,
) -> Result<bool, GroupsDbError> {
    let record = store
        .backend()
        .get(TABLE_MEMBERS, &membership_key(user_id, group_id))
        .await?;

    Ok(record.is_some())
}

pub async fn list_groups_for_user(
    store: &Store,
    user_id: &str,
) -> Result<Vec<Group>, GroupsDbError> {
    let docs = store
        .backend()
        .find(TABLE_MEMBERS, &[("user_id", user_id.to_string())])
        .await?;

    let mut groups = Vec::new();
    for doc in docs {
        let membership: Membership = serde_json::from_str(&doc)?;
        // Memberships can outlive their group briefly during deletion.
        if let Some(group) = get_group(store, &membership.group).await? {
            groups.push(group);
        }
    }

    Ok(groups)
}

pub async fn remove_all_memberships_for_user(
    store: &Store,
    user_id: &str,
) -> Result<(), GroupsDbError> {
    let docs = store
        .backend()
        .find(TABLE_MEMBERS, &[("user_id", user_id.to_string())])
        .await?;
    for doc in docs {
        let membership: Membership = serde_json::from_str(&doc)?;
        store
            .backend()
            .delete(
                TABLE_MEMBERS,
                &membership_key(&membership.user, &membership.group),
            )
            .await?;
    }

    Ok(())
}

pub async fn remove_all_memberships_for_group(
    store: &Store,
    group_id: &str,
) -> Result<(), GroupsDbError> {
    let docs = store
        .backend()
        .find(TABLE_MEMBERS, &[("group_id", group_id.to_string())])
        .await?;
    for doc in docs {
        let membership: Membership = serde_json::from_str(&doc)?;
        store
            .backend()
            .delete(
                TABLE_MEMBERS,
                &membership_key(&membership.user, &membership.group),
            )
            .await?;
    }

    Ok(())
}
