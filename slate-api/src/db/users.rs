use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{BackendError, Store, TABLE_USERS};

#[derive(Debug, Error)]
pub enum UsersDbError {
    #[error("Error while interacting with the store for users: {0}")]
    Backend(#[from] BackendError),

    #[error("Stored user record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A registered user of the federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub institution: String,
    pub admin: bool,
    pub globus_id: String,
    pub token: String,
    pub valid: bool,
}

pub async fn create_user(store: &Store, user: &User) -> Result<(), UsersDbError> {
    let doc = serde_json::to_string(user)?;
    store
        .backend()
        .put(
            TABLE_USERS,
            &user.id,
            &[
                ("token", user.token.clone()),
                ("globus_id", user.globus_id.clone()),
            ],
            doc,
        )
        .await?;

    store.user_cache().invalidate(&user.id);
    store.user_token_cache().invalidate(&user.token);

    Ok(())
}

pub async fn update_user(store: &Store, user: &User) -> Result<(), UsersDbError> {
    create_user(store, user).await
}

pub async fn get_user(store: &Store, user_id: &str) -> Result<Option<User>, UsersDbError> {
    if let Some(user) = store.user_cache().get(user_id) {
        return Ok(Some(user));
    }

    let Some(doc) = store.backend().get(TABLE_USERS, user_id).await? else {
        return Ok(None);
    };
    let user: User = serde_json::from_str(&doc)?;
    store.user_cache().insert(&user.id, user.clone());

    Ok(Some(user))
}

/// Resolves an API token to its user, if any.
pub async fn find_user_by_token(store: &Store, token: &str) -> Result<Option<User>, UsersDbError> {
    if let Some(user) = store.user_token_cache().get(token) {
        return Ok(Some(user));
    }

    let docs = store
        .backend()
        .find(TABLE_USERS, &[("token", token.to_string())])
        .await?;
    let Some(doc) = docs.first() else {
        return Ok(None);
    };
    let user: User = serde_json::from_str(doc)?;
    store.user_token_cache().insert(token, user.clone());
    store.user_cache().insert(&user.id, user.clone());

    Ok(Some(user))
}

pub async fn find_user_by_globus_id(
    store: &Store,
    globus_id: &str,
) -> Result<Option<User>, UsersDbError> {
    let docs = store
        .backend()
        .find(TABLE_USERS, &[("globus_id", globus_id.to_string())])
        .await?;
    let Some(doc) = docs.first() else {
        return Ok(None);
    };

    Ok(Some(serde_json::from_str(doc)?))
}

pub async fn delete_user(store: &Store, user: &User) -> Result<(), UsersDbError> {
    store.backend().delete(TABLE_USERS, &user.id).await?;

    store.user_cache().invalidate(&user.id);
    store.user_token_cache().invalidate(&user.token);

    Ok(())
}

pub async fn list_users(store: &Store) -> Result<Vec<User>, UsersDbError> {
    let docs = store.backend().find(TABLE_USERS, &[]).await?;

    docs.iter()
        .map(|doc| serde_json::from_str(doc).map_err(UsersDbError::from))
        .collect()
}
