use actix_web::{
    HttpResponse, Responder, ResponseError, delete, get,
    http::{StatusCode, header::ContentType},
    post, put,
    web::{Data, Json, Path, Query},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::authentication::{AuthError, authenticate, authenticate_admin};
use crate::db::users::{User, UsersDbError};
use crate::db::{Store, groups, users};
use crate::ids::IdGenerator;
use crate::routes::{API_VERSION, ErrorMessage, TokenQuery, group_by_name_or_id};

#[derive(Debug, Error)]
pub enum UserError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("User not found")]
    UserNotFound,

    #[error("Group not found")]
    GroupNotFound,

    #[error("Missing globus id in request")]
    MissingGlobusId,

    #[error(transparent)]
    UsersDb(#[from] UsersDbError),

    #[error(transparent)]
    GroupsDb(#[from] groups::GroupsDbError),
}

impl UserError {
    fn to_message(&self) -> String {
        match self {
            // Do not expose store details in error messages
            UserError::UsersDb(_)
            | UserError::GroupsDb(_)
            | UserError::Auth(AuthError::UsersDb(_))
            | UserError::Auth(AuthError::GroupsDb(_)) => "internal server error".to_string(),
            e => e.to_string(),
        }
    }
}

impl ResponseError for UserError {
    fn status_code(&self) -> StatusCode {
        match self {
            UserError::Auth(AuthError::NotAuthorized) => StatusCode::FORBIDDEN,
            UserError::Auth(_) | UserError::UsersDb(_) | UserError::GroupsDb(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            UserError::UserNotFound | UserError::GroupNotFound => StatusCode::NOT_FOUND,
            UserError::MissingGlobusId => StatusCode::BAD_REQUEST,
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

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateUserRequest {
    pub metadata: CreateUserMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserMetadata {
    #[schema(example = "Jane Doe")]
    pub name: String,
    #[schema(example = "jane@example.edu")]
    pub email: String,
    #[schema(example = "555-0100")]
    pub phone: String,
    #[schema(example = "Example University")]
    pub institution: String,
    #[serde(default)]
    pub admin: bool,
    #[schema(example = "5c1a3f2e-0b97-4a8a-a870-000000000000")]
    pub globus_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateUserRequest {
    pub metadata: UpdateUserMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserMetadata {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub institution: Option<String>,
    pub admin: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub api_version: String,
    pub kind: String,
    pub metadata: UserMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserMetadata {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub institution: String,
    pub admin: bool,
    pub globus_id: String,
    /// Only present when the caller is entitled to see the token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserListResponse {
    pub api_version: String,
    pub items: Vec<UserResponse>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupMembershipResponse {
    pub api_version: String,
    pub items: Vec<GroupSummary>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub api_version: String,
    pub kind: String,
    pub metadata: GroupSummaryMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct GroupSummaryMetadata {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct FindUserQuery {
    pub token: Option<String>,
    pub globus_id: Option<String>,
}

fn user_response(user: User, include_token: bool) -> UserResponse {
    UserResponse {
        api_version: API_VERSION.to_string(),
        kind: "User".to_string(),
        metadata: UserMetadata {
            id: user.id,
            name: user.name,
            email: user.email,
            phone: user.phone,
            institution: user.institution,
            admin: user.admin,
            globus_id: user.globus_id,
            token: include_token.then_some(user.token),
        },
    }
}

#[utoipa::path(
    summary = "List users",
    description = "Returns all registered users. Admin only.",
    params(TokenQuery),
    responses(
        (status = 200, description = "Users listed successfully", body = UserListResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Users",
)]
#[get("/users")]
pub async fn list_users(
    store: Data<Store>,
    query: Query<TokenQuery>,
) -> Result<impl Responder, UserError> {
    authenticate_admin(&store, query.token.as_deref()).await?;

    let items = users::list_users(&store)
        .await?
        .into_iter()
        .map(|user| user_response(user, false))
        .collect();

    Ok(Json(UserListResponse {
        api_version: API_VERSION.to_string(),
        items,
    }))
}

#[utoipa::path(
    summary = "Create a user",
    description = "Registers a user and issues their API token. Admin only.",
    params(TokenQuery),
    request_body = CreateUserRequest,
    responses(
        (status = 200, description = "User created successfully", body = UserResponse),
        (status = 400, description = "Bad request", body = ErrorMessage),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Users",
)]
#[post("/users")]
pub async fn create_user(
    store: Data<Store>,
    query: Query<TokenQuery>,
    body: Json<CreateUserRequest>,
) -> Result<impl Responder, UserError> {
    let requester = authenticate_admin(&store, query.token.as_deref()).await?;
    let metadata = body.into_inner().metadata;

    if metadata.globus_id.is_empty() {
        return Err(UserError::MissingGlobusId);
    }

    let generator = IdGenerator::instance();
    let user = User {
        id: generator.user_id(),
        name: metadata.name,
        email: metadata.email,
        phone: metadata.phone,
        institution: metadata.institution,
        admin: metadata.admin,
        globus_id: metadata.globus_id,
        token: generator.user_token(),
        valid: true,
    };
    users::create_user(&store, &user).await?;

    info!(user = %user.id, by = %requester.id, "user created");

    Ok(Json(user_response(user, true)))
}

#[utoipa::path(
    summary = "Retrieve a user",
    description = "Returns a user by id. Available to the user themselves and admins.",
    params(("user_id" = String, Path, description = "Id of the user"), TokenQuery),
    responses(
        (status = 200, description = "User retrieved successfully", body = UserResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "User not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Users",
)]
#[get("/users/{user_id}")]
pub async fn get_user(
    store: Data<Store>,
    query: Query<TokenQuery>,
    user_id: Path<String>,
) -> Result<impl Responder, UserError> {
    let requester = authenticate(&store, query.token.as_deref()).await?;
    let user_id = user_id.into_inner();

    if !requester.admin && requester.id != user_id {
        return Err(AuthError::NotAuthorized.into());
    }

    let user = users::get_user(&store, &user_id)
        .await?
        .ok_or(UserError::UserNotFound)?;

    Ok(Json(user_response(user, true)))
}

#[utoipa::path(
    summary = "Update a user",
    description = "Updates a user's contact information. The admin flag can only be changed by admins.",
    params(("user_id" = String, Path, description = "Id of the user"), TokenQuery),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, description = "User updated successfully"),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "User not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Users",
)]
#[put("/users/{user_id}")]
pub async fn update_user(
    store: Data<Store>,
    query: Query<TokenQuery>,
    user_id: Path<String>,
    body: Json<UpdateUserRequest>,
) -> Result<impl Responder, UserError> {
    let requester = authenticate(&store, query.token.as_deref()).await?;
    let user_id = user_id.into_inner();

    if !requester.admin && requester.id != user_id {
        return Err(AuthError::NotAuthorized.into());
    }

    let mut user = users::get_user(&store, &user_id)
        .await?
        .ok_or(UserError::UserNotFound)?;

    let metadata = body.into_inner().metadata;
    if let Some(name) = metadata.name {
        user.name = name;
    }
    if let Some(email) = metadata.email {
        user.email = email;
    }
    if let Some(phone) = metadata.phone {
        user.phone = phone;
    }
    if let Some(institution) = metadata.institution {
        user.institution = institution;
    }
    if let Some(admin) = metadata.admin {
        // Only admins may grant or revoke the admin flag.
        if requester.admin {
            user.admin = admin;
        }
    }
    users::update_user(&store, &user).await?;

    Ok(HttpResponse::Ok().finish())
}

#[utoipa::path(
    summary = "Delete a user",
    description = "Removes a user and their group memberships.",
    params(("user_id" = String, Path, description = "Id of the user"), TokenQuery),
    responses(
        (status = 200, description = "User deleted successfully"),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "User not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Users",
)]
#[delete("/users/{user_id}")]
pub async fn delete_user(
    store: Data<Store>,
    query: Query<TokenQuery>,
    user_id: Path<String>,
) -> Result<impl Responder, UserError> {
    let requester = authenticate(&store, query.token.as_deref()).await?;
    let user_id = user_id.into_inner();

    if !requester.admin && requester.id != user_id {
        return Err(AuthError::NotAuthorized.into());
    }

    let user = users::get_user(&store, &user_id)
        .await?
        .ok_or(UserError::UserNotFound)?;

    groups::remove_all_memberships_for_user(&store, &user.id).await?;
    users::delete_user(&store, &user).await?;

    info!(user = %user.id, by = %requester.id, "user deleted");

    Ok(HttpResponse::Ok().finish())
}

#[utoipa::path(
    summary = "List a user's groups",
    description = "Returns the groups the user belongs to.",
    params(("user_id" = String, Path, description = "Id of the user"), TokenQuery),
    responses(
        (status = 200, description = "Groups listed successfully", body = GroupMembershipResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Users",
)]
#[get("/users/{user_id}/groups")]
pub async fn list_user_groups(
    store: Data<Store>,
    query: Query<TokenQuery>,
    user_id: Path<String>,
) -> Result<impl Responder, UserError> {
    let requester = authenticate(&store, query.token.as_deref()).await?;
    let user_id = user_id.into_inner();

    if !requester.admin && requester.id != user_id {
        return Err(AuthError::NotAuthorized.into());
    }

    let items = groups::list_groups_for_user(&store, &user_id)
        .await?
        .into_iter()
        .map(|group| GroupSummary {
            api_version: API_VERSION.to_string(),
            kind: "Group".to_string(),
            metadata: GroupSummaryMetadata {
                id: group.id,
                name: group.name,
            },
        })
        .collect();

    Ok(Json(GroupMembershipResponse {
        api_version: API_VERSION.to_string(),
        items,
    }))
}

#[utoipa::path(
    summary = "Add a user to a group",
    description = "Records group membership. Allowed for admins and existing members of the group.",
    params(
        ("user_id" = String, Path, description = "Id of the user"),
        ("group" = String, Path, description = "Name or id of the group"),
        TokenQuery,
    ),
    responses(
        (status = 200, description = "Membership added"),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "User or group not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Users",
)]
#[put("/users/{user_id}/groups/{group}")]
pub async fn add_user_to_group(
    store: Data<Store>,
    query: Query<TokenQuery>,
    path: Path<(String, String)>,
) -> Result<impl Responder, UserError> {
    let requester = authenticate(&store, query.token.as_deref()).await?;
    let (user_id, group_ref) = path.into_inner();

    let user = users::get_user(&store, &user_id)
        .await?
        .ok_or(UserError::UserNotFound)?;
    let group = group_by_name_or_id(&store, &group_ref)
        .await?
        .ok_or(UserError::GroupNotFound)?;

    if !requester.admin && !groups::user_in_group(&store, &requester.id, &group.id).await? {
        return Err(AuthError::NotAuthorized.into());
    }

    groups::add_user_to_group(&store, &user.id, &group.id).await?;

    info!(user = %user.id, group = %group.id, by = %requester.id, "membership added");

    Ok(HttpResponse::Ok().finish())
}

#[utoipa::path(
    summary = "Remove a user from a group",
    description = "Removes group membership. Allowed for admins, the user themselves, and members of the group.",
    params(
        ("user_id" = String, Path, description = "Id of the user"),
        ("group" = String, Path, description = "Name or id of the group"),
        TokenQuery,
    ),
    responses(
        (status = 200, description = "Membership removed"),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "User or group not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Users",
)]
#[delete("/users/{user_id}/groups/{group}")]
pub async fn remove_user_from_group(
    store: Data<Store>,
    query: Query<TokenQuery>,
    path: Path<(String, String)>,
) -> Result<impl Responder, UserError> {
    let requester = authenticate(&store, query.token.as_deref()).await?;
    let (user_id, group_ref) = path.into_inner();

    let user = users::get_user(&store, &user_id)
        .await?
        .ok_or(UserError::UserNotFound)?;
    let group = group_by_name_or_id(&store, &group_ref)
        .await?
        .ok_or(UserError::GroupNotFound)?;

    let allowed = requester.admin
        || requester.id == user.id
        || groups::user_in_group(&store, &requester.id, &group.id).await?;
    if !allowed {
        return Err(AuthError::NotAuthorized.into());
    }

    groups::remove_user_from_group(&store, &user.id, &group.id).await?;

    Ok(HttpResponse::Ok().finish())
}

#[utoipa::path(
    summary = "Find a user by globus id",
    description = "Looks a user up by their globus id. Admin only.",
    params(FindUserQuery),
    responses(
        (status = 200, description = "User found", body = UserResponse),
        (status = 400, description = "Missing globus id", body = ErrorMessage),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "User not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Users",
)]
#[get("/find_user")]
pub async fn find_user(
    store: Data<Store>,
    query: Query<FindUserQuery>,
) -> Result<impl Responder, UserError> {
    authenticate_admin(&store, query.token.as_deref()).await?;

    let globus_id = query
        .globus_id
        .as_deref()
        .ok_or(UserError::MissingGlobusId)?;
    let user = users::find_user_by_globus_id(&store, globus_id)
        .await?
        .ok_or(UserError::UserNotFound)?;

    Ok(Json(user_response(user, true)))
}
