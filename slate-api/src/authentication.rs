use thiserror::Error;

use crate::db::users::{User, UsersDbError, find_user_by_token};
use crate::db::{Store, groups};

/// Errors raised while resolving a request's identity.
///
/// A missing, unknown, or invalidated token is indistinguishable to the
/// caller; all three surface as `NotAuthorized`.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Not authorized")]
    NotAuthorized,

    #[error(transparent)]
    UsersDb(#[from] UsersDbError),

    #[error(transparent)]
    GroupsDb(#[from] groups::GroupsDbError),
}

/// Resolves a bearer token to its user.
///
/// Authorization decisions are always taken before any side-effecting work,
/// so every handler calls this first.
pub async fn authenticate(store: &Store, token: Option<&str>) -> Result<User, AuthError> {
    let token = token.ok_or(AuthError::NotAuthorized)?;
    let user = find_user_by_token(store, token)
        .await?
        .ok_or(AuthError::NotAuthorized)?;
    if !user.valid {
        return Err(AuthError::NotAuthorized);
    }

    Ok(user)
}

/// Resolves a bearer token and requires the admin flag.
pub async fn authenticate_admin(store: &Store, token: Option<&str>) -> Result<User, AuthError> {
    let user = authenticate(store, token).await?;
    if !user.admin {
        return Err(AuthError::NotAuthorized);
    }

    Ok(user)
}

/// Requires the user to be an admin or a member of the given group.
pub async fn require_group_member(
    store: &Store,
    user: &User,
    group_id: &str,
) -> Result<(), AuthError> {
    if user.admin {
        return Ok(());
    }
    if groups::user_in_group(store, &user.id, group_id).await? {
        return Ok(());
    }

    Err(AuthError::NotAuthorized)
}
