use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiResult;
use crate::api::handlers::AppState;
use crate::logic::comparison::{ComparisonExists, ComparisonSummary};
use crate::model::{
    ChangelogFilter, GroupPublish, GroupPublishRequest, GroupTemplate, ListResponse, NewOperationGroup, Operation,
    OperationChangeView, OperationGroup, OperationGroupHistory, OperationGroupPatch, OperationKey,
    OperationListFilter, Paging, Principal,
};
use crate::store::traits::Store;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationQuery {
    pub api_type: Option<String>,
    pub kind: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub empty_tag: bool,
    pub group: Option<String>,
    #[serde(default)]
    pub empty_group: bool,
    pub api_audience: Option<String>,
    pub text_filter: Option<String>,
    pub deprecated: Option<bool>,
    pub document_slug: Option<String>,
    /// Comma separated operation ids.
    pub ids: Option<String>,
    #[serde(default)]
    pub skip_refs: bool,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

impl OperationQuery {
    fn filter(self, api_type: Option<String>) -> OperationListFilter {
        let ids = self
            .ids
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        OperationListFilter {
            api_type: api_type.or(self.api_type),
            kind: self.kind,
            tag: self.tag,
            empty_tag: self.empty_tag,
            group: self.group,
            empty_group: self.empty_group,
            api_audience: self.api_audience,
            text_filter: self.text_filter,
            deprecated: self.deprecated,
            document_slug: self.document_slug,
            ids,
            skip_refs: self.skip_refs,
            paging: Paging::new(self.page, self.limit),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagQuery {
    pub text_filter: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousVersionQuery {
    pub previous_version: Option<String>,
    pub previous_version_package_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogQuery {
    pub api_type: Option<String>,
    /// Comma separated severities.
    pub severity: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub empty_tag: bool,
    pub group: Option<String>,
    #[serde(default)]
    pub empty_group: bool,
    pub api_kind: Option<String>,
    pub text_filter: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

impl ChangelogQuery {
    fn filter(self) -> ChangelogFilter {
        ChangelogFilter {
            api_type: self.api_type,
            severities: self
                .severity
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            tag: self.tag,
            empty_tag: self.empty_tag,
            group: self.group,
            empty_group: self.empty_group,
            api_kind: self.api_kind,
            text_filter: self.text_filter,
            paging: Paging::new(self.page, self.limit),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupListQuery {
    pub api_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsagesResponse {
    pub model_name: String,
    pub usages: Vec<OperationKey>,
}

type VersionPath = (String, String);
type ApiTypePath = (String, String, String);
type GroupPath = (String, String, String, String);

// ---- operations ----

pub async fn list_operations<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version)): Path<VersionPath>,
    Query(query): Query<OperationQuery>,
) -> ApiResult<Json<ListResponse<Operation>>> {
    let operations = catalog
        .operations
        .list_operations(&principal, &package_id, &version, &query.filter(None))
        .await?;
    Ok(Json(ListResponse::new(operations)))
}

pub async fn list_api_type_operations<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type)): Path<ApiTypePath>,
    Query(query): Query<OperationQuery>,
) -> ApiResult<Json<ListResponse<Operation>>> {
    let operations = catalog
        .operations
        .list_operations(&principal, &package_id, &version, &query.filter(Some(api_type)))
        .await?;
    Ok(Json(ListResponse::new(operations)))
}

pub async fn get_operation<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type, operation_id)): Path<(String, String, String, String)>,
) -> ApiResult<Json<Operation>> {
    Ok(Json(
        catalog
            .operations
            .get_operation(&principal, &package_id, &version, &api_type, &operation_id)
            .await?,
    ))
}

pub async fn model_usages<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type, operation_id, model_name)): Path<(String, String, String, String, String)>,
) -> ApiResult<Json<ModelUsagesResponse>> {
    let usages = catalog
        .operations
        .model_usages(&principal, &package_id, &version, &api_type, &operation_id, &model_name)
        .await?;
    Ok(Json(ModelUsagesResponse { model_name, usages }))
}

pub async fn list_tags<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type)): Path<ApiTypePath>,
    Query(query): Query<TagQuery>,
) -> ApiResult<Json<ListResponse<String>>> {
    let tags = catalog
        .operations
        .list_tags(
            &principal,
            &package_id,
            &version,
            Some(&api_type),
            query.text_filter.as_deref(),
            Paging::new(query.page, query.limit),
        )
        .await?;
    Ok(Json(ListResponse::new(tags)))
}

pub async fn deprecated_operations<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type)): Path<ApiTypePath>,
    Query(query): Query<OperationQuery>,
) -> ApiResult<Json<ListResponse<Operation>>> {
    let operations = catalog
        .operations
        .deprecated_operations(&principal, &package_id, &version, &query.filter(Some(api_type)))
        .await?;
    Ok(Json(ListResponse::new(operations)))
}

// ---- comparisons ----

pub async fn comparison_exists<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version)): Path<VersionPath>,
    Query(query): Query<PreviousVersionQuery>,
) -> ApiResult<Json<ComparisonExists>> {
    Ok(Json(
        catalog
            .comparisons
            .compare_exists(
                &principal,
                &package_id,
                &version,
                query.previous_version_package_id.as_deref(),
                query.previous_version.as_deref(),
            )
            .await?,
    ))
}

pub async fn comparison_summary<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version)): Path<VersionPath>,
    Query(query): Query<PreviousVersionQuery>,
) -> ApiResult<Json<ComparisonSummary>> {
    Ok(Json(
        catalog
            .comparisons
            .summary(
                &principal,
                &package_id,
                &version,
                query.previous_version_package_id.as_deref(),
                query.previous_version.as_deref(),
            )
            .await?,
    ))
}

pub async fn changelog<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(comparison_id): Path<String>,
    Query(query): Query<ChangelogQuery>,
) -> ApiResult<Json<ListResponse<OperationChangeView>>> {
    let changes = catalog
        .comparisons
        .changelog(&principal, &comparison_id, &query.filter())
        .await?;
    Ok(Json(ListResponse::new(changes)))
}

// ---- operation groups ----

pub async fn list_groups<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version)): Path<VersionPath>,
    Query(query): Query<GroupListQuery>,
) -> ApiResult<Json<ListResponse<OperationGroup>>> {
    let groups = catalog
        .groups
        .list_groups(&principal, &package_id, &version, query.api_type.as_deref())
        .await?;
    Ok(Json(ListResponse::new(groups)))
}

pub async fn list_api_type_groups<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type)): Path<ApiTypePath>,
) -> ApiResult<Json<ListResponse<OperationGroup>>> {
    let groups = catalog
        .groups
        .list_groups(&principal, &package_id, &version, Some(&api_type))
        .await?;
    Ok(Json(ListResponse::new(groups)))
}

pub async fn create_group<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type)): Path<ApiTypePath>,
    Json(request): Json<NewOperationGroup>,
) -> ApiResult<(StatusCode, Json<OperationGroup>)> {
    let group = catalog
        .groups
        .create_group(&principal, &package_id, &version, &api_type, request)
        .await?;
    Ok((StatusCode::CREATED, Json(group)))
}

pub async fn get_group<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type, group_name)): Path<GroupPath>,
) -> ApiResult<Json<OperationGroup>> {
    Ok(Json(
        catalog
            .groups
            .get_group(&principal, &package_id, &version, &api_type, &group_name)
            .await?,
    ))
}

pub async fn update_group<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type, group_name)): Path<GroupPath>,
    Json(patch): Json<OperationGroupPatch>,
) -> ApiResult<Json<OperationGroup>> {
    Ok(Json(
        catalog
            .groups
            .update_group(&principal, &package_id, &version, &api_type, &group_name, patch)
            .await?,
    ))
}

pub async fn replace_group<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type, group_name)): Path<GroupPath>,
    Json(request): Json<NewOperationGroup>,
) -> ApiResult<Json<OperationGroup>> {
    Ok(Json(
        catalog
            .groups
            .replace_group(&principal, &package_id, &version, &api_type, &group_name, request)
            .await?,
    ))
}

pub async fn delete_group<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type, group_name)): Path<GroupPath>,
) -> ApiResult<StatusCode> {
    catalog
        .groups
        .delete_group(&principal, &package_id, &version, &api_type, &group_name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_group_operations<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type, group_name)): Path<GroupPath>,
    Query(query): Query<OperationQuery>,
) -> ApiResult<Json<ListResponse<Operation>>> {
    let filter = query.filter(Some(api_type.clone()));
    let operations = catalog
        .groups
        .list_group_operations(&principal, &package_id, &version, &api_type, &group_name, &filter)
        .await?;
    Ok(Json(ListResponse::new(operations)))
}

pub async fn get_group_template<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type, group_name)): Path<GroupPath>,
) -> ApiResult<Json<GroupTemplate>> {
    Ok(Json(
        catalog
            .groups
            .get_group_template(&principal, &package_id, &version, &api_type, &group_name)
            .await?,
    ))
}

pub async fn get_group_history<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type, group_name)): Path<GroupPath>,
) -> ApiResult<Json<ListResponse<OperationGroupHistory>>> {
    Ok(Json(ListResponse::new(
        catalog
            .groups
            .get_group_history(&principal, &package_id, &version, &api_type, &group_name)
            .await?,
    )))
}

pub async fn publish_group<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, api_type, group_name)): Path<GroupPath>,
    Json(request): Json<GroupPublishRequest>,
) -> ApiResult<(StatusCode, Json<GroupPublish>)> {
    let publish = catalog
        .groups
        .publish_group(&principal, &package_id, &version, &api_type, &group_name, request)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(publish)))
}

pub async fn get_publish_status<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((_package_id, _version, _api_type, _group_name, publish_id)): Path<(String, String, String, String, String)>,
) -> ApiResult<Json<GroupPublish>> {
    Ok(Json(catalog.groups.get_publish_status(&principal, &publish_id).await?))
}
