use actix_web::{
    HttpResponse, Responder, ResponseError, delete, get,
    http::{StatusCode, header::ContentType},
    post, put,
    web::{Data, Json, Path, Query},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use utoipa::ToSchema;

use crate::authentication::{AuthError, authenticate, require_group_member};
use crate::db::groups::{Group, GroupsDbError};
use crate::db::instances::InstancesDbError;
use crate::db::secrets::SecretsDbError;
use crate::db::{Store, access, clusters, groups, instances, secrets};
use crate::ids::{GROUP_ID_PREFIX, IdGenerator};
use crate::routes::{API_VERSION, ErrorMessage, TokenQuery, group_by_name_or_id};

#[derive(Debug, Error)]
pub enum GroupError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Group not found")]
    GroupNotFound,

    #[error("Group names may not contain slashes")]
    NameContainsSlash,

    #[error("Group names may not begin with {GROUP_ID_PREFIX}")]
    NameHasReservedPrefix,

    #[error("Group name is already in use")]
    NameInUse,

    #[error("Group still owns clusters; delete them first")]
    ClustersRemain,

    #[error("Group still owns application instances; delete them first")]
    InstancesRemain,

    #[error("Group still owns secrets; delete them first")]
    SecretsRemain,

    #[error(transparent)]
    GroupsDb(#[from] GroupsDbError),

    #[error(transparent)]
    ClustersDb(#[from] clusters::ClustersDbError),

    #[error(transparent)]
    InstancesDb(#[from] InstancesDbError),

    #[error(transparent)]
    SecretsDb(#[from] SecretsDbError),

    #[error(transparent)]
    AccessDb(#[from] access::AccessDbError),
}

impl GroupError {
    fn to_message(&self) -> String {
        match self {
            // Do not expose store details in error messages
            GroupError::GroupsDb(_)
            | GroupError::ClustersDb(_)
            | GroupError::InstancesDb(_)
            | GroupError::SecretsDb(_)
            | GroupError::AccessDb(_)
            | GroupError::Auth(AuthError::UsersDb(_))
            | GroupError::Auth(AuthError::GroupsDb(_)) => "internal server error".to_string(),
            e => e.to_string(),
        }
    }
}

impl ResponseError for GroupError {
    fn status_code(&self) -> StatusCode {
        match self {
            GroupError::Auth(AuthError::NotAuthorized) => StatusCode::FORBIDDEN,
            GroupError::Auth(_)
            | GroupError::GroupsDb(_)
            | GroupError::ClustersDb(_)
            | GroupError::InstancesDb(_)
            | GroupError::SecretsDb(_)
            | GroupError::AccessDb(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GroupError::GroupNotFound => StatusCode::NOT_FOUND,
            GroupError::NameInUse => StatusCode::CONFLICT,
            GroupError::NameContainsSlash
            | GroupError::NameHasReservedPrefix
            | GroupError::ClustersRemain
            | GroupError::InstancesRemain
            | GroupError::SecretsRemain => StatusCode::BAD_REQUEST,
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
pub struct CreateGroupRequest {
    pub metadata: CreateGroupMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupMetadata {
    #[schema(example = "atlas")]
    pub name: String,
    #[serde(default)]
    #[schema(example = "High energy physics")]
    pub science_field: String,
    #[schema(example = "ops@atlas.example")]
    pub email: String,
    #[schema(example = "555-0101")]
    pub phone: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateGroupRequest {
    pub metadata: UpdateGroupMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGroupMetadata {
    pub science_field: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupResponse {
    pub api_version: String,
    pub kind: String,
    pub metadata: GroupMetadata,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadata {
    pub id: String,
    pub name: String,
    pub science_field: String,
    pub email: String,
    pub phone: String,
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupListResponse {
    pub api_version: String,
    pub items: Vec<GroupResponse>,
}

impl From<Group> for GroupResponse {
    fn from(group: Group) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: "Group".to_string(),
            metadata: GroupMetadata {
                id: group.id,
                name: group.name,
                science_field: group.science_field,
                email: group.email,
                phone: group.phone,
                description: group.description,
            },
        }
    }
}

#[utoipa::path(
    summary = "List groups",
    description = "Returns all groups. Available to every authenticated user.",
    params(TokenQuery),
    responses(
        (status = 200, description = "Groups listed successfully", body = GroupListResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Groups",
)]
#[get("/groups")]
pub async fn list_groups(
    store: Data<Store>,
    query: Query<TokenQuery>,
) -> Result<impl Responder, GroupError> {
    authenticate(&store, query.token.as_deref()).await?;

    let items = groups::list_groups(&store)
        .await?
        .into_iter()
        .map(GroupResponse::from)
        .collect();

    Ok(Json(GroupListResponse {
        api_version: API_VERSION.to_string(),
        items,
    }))
}

#[utoipa::path(
    summary = "Create a group",
    description = "Creates a group; the requester becomes its first member.",
    params(TokenQuery),
    request_body = CreateGroupRequest,
    responses(
        (status = 200, description = "Group created successfully", body = GroupResponse),
        (status = 400, description = "Bad request", body = ErrorMessage),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 409, description = "Group name already in use", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Groups",
)]
#[post("/groups")]
pub async fn create_group(
    store: Data<Store>,
    query: Query<TokenQuery>,
    body: Json<CreateGroupRequest>,
) -> Result<impl Responder, GroupError> {
    let user = authenticate(&store, query.token.as_deref()).await?;
    let metadata = body.into_inner().metadata;

    if metadata.name.contains('/') {
        return Err(GroupError::NameContainsSlash);
    }
    if metadata.name.starts_with(GROUP_ID_PREFIX) {
        return Err(GroupError::NameHasReservedPrefix);
    }
    if groups::find_group_by_name(&store, &metadata.name)
        .await?
        .is_some()
    {
        return Err(GroupError::NameInUse);
    }

    let group = Group {
        id: IdGenerator::instance().group_id(),
        name: metadata.name,
        science_field: metadata.science_field,
        email: metadata.email,
        phone: metadata.phone,
        description: metadata.description,
    };
    groups::create_group(&store, &group).await?;
    groups::add_user_to_group(&store, &user.id, &group.id).await?;

    info!(group = %group.id, name = %group.name, by = %user.id, "group created");

    Ok(Json(GroupResponse::from(group)))
}

#[utoipa::path(
    summary = "Retrieve a group",
    description = "Returns a group by name or id.",
    params(("group" = String, Path, description = "Name or id of the group"), TokenQuery),
    responses(
        (status = 200, description = "Group retrieved successfully", body = GroupResponse),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Group not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Groups",
)]
#[get("/groups/{group}")]
pub async fn get_group(
    store: Data<Store>,
    query: Query<TokenQuery>,
    group: Path<String>,
) -> Result<impl Responder, GroupError> {
    authenticate(&store, query.token.as_deref()).await?;

    let group = group_by_name_or_id(&store, &group.into_inner())
        .await?
        .ok_or(GroupError::GroupNotFound)?;

    Ok(Json(GroupResponse::from(group)))
}

#[utoipa::path(
    summary = "Update a group",
    description = "Updates a group's contact fields. The name and the derived namespace never change.",
    params(("group" = String, Path, description = "Name or id of the group"), TokenQuery),
    request_body = UpdateGroupRequest,
    responses(
        (status = 200, description = "Group updated successfully"),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Group not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Groups",
)]
#[put("/groups/{group}")]
pub async fn update_group(
    store: Data<Store>,
    query: Query<TokenQuery>,
    group: Path<String>,
    body: Json<UpdateGroupRequest>,
) -> Result<impl Responder, GroupError> {
    let user = authenticate(&store, query.token.as_deref()).await?;

    let mut group = group_by_name_or_id(&store, &group.into_inner())
        .await?
        .ok_or(GroupError::GroupNotFound)?;
    require_group_member(&store, &user, &group.id).await?;

    let metadata = body.into_inner().metadata;
    if let Some(science_field) = metadata.science_field {
        group.science_field = science_field;
    }
    if let Some(email) = metadata.email {
        group.email = email;
    }
    if let Some(phone) = metadata.phone {
        group.phone = phone;
    }
    if let Some(description) = metadata.description {
        group.description = description;
    }
    groups::update_group(&store, &group).await?;

    Ok(HttpResponse::Ok().finish())
}

#[utoipa::path(
    summary = "Delete a group",
    description = "Removes a group. All instances and secrets the group owns must be deleted first.",
    params(("group" = String, Path, description = "Name or id of the group"), TokenQuery),
    responses(
        (status = 200, description = "Group deleted successfully"),
        (status = 400, description = "Group still owns resources", body = ErrorMessage),
        (status = 403, description = "Not authorized", body = ErrorMessage),
        (status = 404, description = "Group not found", body = ErrorMessage),
        (status = 500, description = "Internal server error", body = ErrorMessage),
    ),
    tag = "Groups",
)]
#[delete("/groups/{group}")]
pub async fn delete_group(
    store: Data<Store>,
    query: Query<TokenQuery>,
    group: Path<String>,
) -> Result<impl Responder, GroupError> {
    let user = authenticate(&store, query.token.as_deref()).await?;

    let group = group_by_name_or_id(&store, &group.into_inner())
        .await?
        .ok_or(GroupError::GroupNotFound)?;
    require_group_member(&store, &user, &group.id).await?;

    // A group cannot disappear while resources still reference it.
    if !clusters::list_clusters_by_group(&store, &group.id)
        .await?
        .is_empty()
    {
        return Err(GroupError::ClustersRemain);
    }
    if !instances::list_instances(&store, Some(&group.id), None)
        .await?
        .is_empty()
    {
        return Err(GroupError::InstancesRemain);
    }
    if !secrets::list_secrets(&store, Some(&group.id), None)
        .await?
        .is_empty()
    {
        return Err(GroupError::SecretsRemain);
    }

    groups::remove_all_memberships_for_group(&store, &group.id).await?;
    access::remove_all_records_for_group(&store, &group.id).await?;
    groups::delete_group(&store, &group).await?;

    info!(group = %group.id, by = %user.id, "group deleted");

    Ok(HttpResponse::Ok().finish())
}
