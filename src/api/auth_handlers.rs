use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiResult;
use crate::api::handlers::AppState;
use crate::model::{
    ApiKey, CreatedApiKey, ListResponse, NewApiKey, PackageMember, Permission, Principal, Role, RoleAction,
};
use crate::store::traits::Store;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRoleRequest {
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePermissionsRequest {
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleOrderRequest {
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMembersRequest {
    pub emails: Vec<String>,
    pub role_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRoleRequest {
    pub role_id: String,
    pub action: RoleAction,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPermissionsResponse {
    pub package_id: String,
    pub permissions: Vec<String>,
}

// ---- roles ----

pub async fn list_roles<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    _principal: Principal,
) -> ApiResult<Json<ListResponse<Role>>> {
    Ok(Json(ListResponse::new(catalog.auth.list_roles().await?)))
}

pub async fn create_role<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Json(request): Json<NewRoleRequest>,
) -> ApiResult<(StatusCode, Json<Role>)> {
    let role = catalog
        .auth
        .create_role(&principal, &request.role, request.permissions)
        .await?;
    Ok((StatusCode::CREATED, Json(role)))
}

pub async fn update_role_permissions<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(role_id): Path<String>,
    Json(request): Json<RolePermissionsRequest>,
) -> ApiResult<Json<Role>> {
    Ok(Json(
        catalog
            .auth
            .update_role_permissions(&principal, &role_id, request.permissions)
            .await?,
    ))
}

pub async fn delete_role<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(role_id): Path<String>,
) -> ApiResult<StatusCode> {
    catalog.auth.delete_role(&principal, &role_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_role_order<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Json(request): Json<RoleOrderRequest>,
) -> ApiResult<StatusCode> {
    catalog.auth.set_role_order(&principal, request.roles).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn available_roles<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
) -> ApiResult<Json<ListResponse<Role>>> {
    Ok(Json(ListResponse::new(
        catalog.auth.available_roles(&principal, &package_id).await?,
    )))
}

pub async fn user_permissions<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
) -> ApiResult<Json<UserPermissionsResponse>> {
    let permissions = catalog.auth.user_permissions(&principal, &package_id).await?;
    Ok(Json(UserPermissionsResponse {
        package_id,
        permissions,
    }))
}

// ---- members ----

pub async fn list_members<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
) -> ApiResult<Json<ListResponse<PackageMember>>> {
    Ok(Json(ListResponse::new(
        catalog.auth.list_members(&principal, &package_id).await?,
    )))
}

pub async fn add_members<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
    Json(request): Json<AddMembersRequest>,
) -> ApiResult<Json<ListResponse<PackageMember>>> {
    let members = catalog
        .auth
        .add_members(&principal, &package_id, &request.emails, &request.role_ids)
        .await?;
    Ok(Json(ListResponse::new(members)))
}

pub async fn update_member_role<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, user_id)): Path<(String, String)>,
    Json(request): Json<MemberRoleRequest>,
) -> ApiResult<StatusCode> {
    catalog
        .auth
        .update_member_role(&principal, &package_id, &user_id, &request.role_id, request.action)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_member<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, user_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    catalog.auth.delete_member(&principal, &package_id, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- api keys ----

pub async fn create_api_key<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
    Json(request): Json<NewApiKey>,
) -> ApiResult<(StatusCode, Json<CreatedApiKey>)> {
    let created = catalog.auth.create_api_key(&principal, &package_id, request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_api_keys<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
) -> ApiResult<Json<ListResponse<ApiKey>>> {
    Ok(Json(ListResponse::new(
        catalog.auth.list_api_keys(&principal, &package_id).await?,
    )))
}

pub async fn revoke_api_key<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, key_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    catalog.auth.revoke_api_key(&principal, &package_id, &key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
