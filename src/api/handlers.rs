use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};
use crate::error::{codes, CatalogError, CatalogResult};
use crate::logic::Catalog;
use crate::model::{
    ActivityEventView, ActivityEventViewLegacy, ActivityFilter, DocumentSummary, EventType, ListResponse,
    NewPackage, Package, PackageKind, PackageListFilter, PackageLookup, PackagePatch, PackageTransition,
    PackageView, PackageViewLegacy, Paging, Principal, PublishRequest, PublishedDocument, Revision,
    VersionListFilter, VersionPatch, VersionReference, VersionStatus, VersionView, VersionViewLegacy,
};
use crate::store::traits::Store;

pub type AppState<S> = Arc<Catalog<S>>;

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Comma separated query value into typed items.
pub(crate) fn parse_list<T: FromStr<Err = String>>(name: &str, raw: Option<&str>) -> CatalogResult<Vec<T>> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<T>().map_err(|e| {
                CatalogError::validation(codes::INVALID_PARAMETER, e).with_param("param", name)
            })
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageListQuery {
    pub parent_id: Option<String>,
    pub kind: Option<String>,
    pub text_filter: Option<String>,
    #[serde(default)]
    pub show_all_descendants: bool,
    #[serde(default)]
    pub only_favorite: bool,
    #[serde(default)]
    pub only_shared: bool,
    pub service_name: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

impl PackageListQuery {
    fn filter(self) -> CatalogResult<PackageListFilter> {
        Ok(PackageListFilter {
            kinds: parse_list::<PackageKind>("kind", self.kind.as_deref())?,
            parent_id: self.parent_id,
            text_filter: self.text_filter,
            show_all_descendants: self.show_all_descendants,
            only_favorite: self.only_favorite,
            only_shared: self.only_shared,
            service_name: self.service_name,
            paging: Paging::new(self.page, self.limit),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageQuery {
    #[serde(default)]
    pub show_parents: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePackageRequest {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub overwrite_history: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedPackages {
    pub deleted: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultVersionResponse {
    pub default_version: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MovedPackageResponse {
    pub from_id: String,
    pub to_id: String,
}

/// A lookup that hit a moved id answers with a permanent redirect carrying
/// the new id.
fn found_or_moved<T: Serialize>(lookup: PackageLookup<T>, location: impl FnOnce(&str) -> String) -> Response {
    match lookup {
        PackageLookup::Found(view) => Json(view).into_response(),
        PackageLookup::Moved { from_id, to_id } => (
            StatusCode::MOVED_PERMANENTLY,
            [(header::LOCATION, location(&to_id))],
            Json(MovedPackageResponse { from_id, to_id }),
        )
            .into_response(),
    }
}

// ---- packages ----

pub async fn list_packages<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Query(query): Query<PackageListQuery>,
) -> ApiResult<Json<ListResponse<PackageView>>> {
    let packages = catalog.packages.list_packages(&principal, &query.filter()?).await?;
    Ok(Json(ListResponse::new(packages)))
}

pub async fn create_package<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Json(request): Json<NewPackage>,
) -> ApiResult<(StatusCode, Json<Package>)> {
    let package = catalog.packages.create_package(&principal, request).await?;
    Ok((StatusCode::CREATED, Json(package)))
}

pub async fn get_package<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
    Query(query): Query<PackageQuery>,
) -> ApiResult<Response> {
    let lookup = catalog
        .packages
        .get_package(&principal, &package_id, query.show_parents)
        .await?;
    let base_path = catalog.config.server.base_path.trim_end_matches('/');
    Ok(found_or_moved(lookup, |to| format!("{}/api/v2/packages/{}", base_path, to)))
}

pub async fn update_package<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
    Json(patch): Json<PackagePatch>,
) -> ApiResult<Json<Package>> {
    Ok(Json(catalog.packages.update_package(&principal, &package_id, patch).await?))
}

pub async fn delete_package<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
) -> ApiResult<Json<DeletedPackages>> {
    let deleted = catalog.packages.delete_package(&principal, &package_id).await?;
    Ok(Json(DeletedPackages { deleted }))
}

pub async fn move_package<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Json(request): Json<MovePackageRequest>,
) -> ApiResult<(StatusCode, Json<PackageTransition>)> {
    let transition = catalog
        .packages
        .move_package(&principal, &request.from, &request.to, request.overwrite_history)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(transition)))
}

pub async fn get_move_status<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    _principal: Principal,
    Path(move_id): Path<String>,
) -> ApiResult<Json<PackageTransition>> {
    Ok(Json(catalog.packages.get_move_status(&move_id).await?))
}

pub async fn list_transitions<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
) -> ApiResult<Json<ListResponse<PackageTransition>>> {
    catalog.auth.require_sysadmin(&principal).await?;
    Ok(Json(ListResponse::new(catalog.packages.list_transitions(&package_id).await?)))
}

pub async fn favor_package<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
) -> ApiResult<StatusCode> {
    catalog.packages.favor(&principal, &package_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn disfavor_package<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
) -> ApiResult<StatusCode> {
    catalog.packages.disfavor(&principal, &package_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_private_workspace<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
) -> ApiResult<Json<Package>> {
    Ok(Json(catalog.packages.create_private_workspace(&principal).await?))
}

pub async fn get_default_version<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
) -> ApiResult<Json<DefaultVersionResponse>> {
    let default_version = catalog.versions.get_default_version(&principal, &package_id).await?;
    Ok(Json(DefaultVersionResponse { default_version }))
}

// ---- versions ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionListQuery {
    pub status: Option<String>,
    pub text_filter: Option<String>,
    pub label: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

impl VersionListQuery {
    fn filter(self) -> CatalogResult<VersionListFilter> {
        let status = self
            .status
            .as_deref()
            .map(VersionStatus::from_str)
            .transpose()
            .map_err(|e| CatalogError::validation(codes::INVALID_PARAMETER, e).with_param("param", "status"))?;
        Ok(VersionListFilter {
            status,
            text_filter: self.text_filter,
            label: self.label,
            paging: Paging::new(self.page, self.limit),
        })
    }
}

pub async fn publish_version<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
    Json(mut request): Json<PublishRequest>,
) -> ApiResult<(StatusCode, Json<Revision>)> {
    request.package_id = package_id;
    let revision = catalog.versions.publish(&principal, request).await?;
    Ok((StatusCode::CREATED, Json(revision)))
}

pub async fn list_versions<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
    Query(query): Query<VersionListQuery>,
) -> ApiResult<Json<ListResponse<VersionView>>> {
    let versions = catalog
        .versions
        .list_versions(&principal, &package_id, &query.filter()?)
        .await?;
    Ok(Json(ListResponse::new(versions)))
}

pub async fn list_labels<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
) -> ApiResult<Json<ListResponse<String>>> {
    Ok(Json(ListResponse::new(catalog.versions.list_labels(&principal, &package_id).await?)))
}

pub async fn get_version<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version)): Path<(String, String)>,
) -> ApiResult<Json<VersionView>> {
    Ok(Json(catalog.versions.get_version(&principal, &package_id, &version).await?))
}

pub async fn patch_version<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version)): Path<(String, String)>,
    Json(patch): Json<VersionPatch>,
) -> ApiResult<Json<VersionView>> {
    Ok(Json(
        catalog
            .versions
            .patch_version(&principal, &package_id, &version, patch)
            .await?,
    ))
}

pub async fn delete_version<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    catalog.versions.delete_version(&principal, &package_id, &version).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_revisions<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version)): Path<(String, String)>,
) -> ApiResult<Json<ListResponse<Revision>>> {
    Ok(Json(ListResponse::new(
        catalog.versions.list_revisions(&principal, &package_id, &version).await?,
    )))
}

pub async fn list_documents<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version)): Path<(String, String)>,
) -> ApiResult<Json<ListResponse<DocumentSummary>>> {
    Ok(Json(ListResponse::new(
        catalog.versions.list_documents(&principal, &package_id, &version).await?,
    )))
}

pub async fn get_document<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version, slug)): Path<(String, String, String)>,
) -> ApiResult<Json<PublishedDocument>> {
    Ok(Json(
        catalog
            .versions
            .get_document(&principal, &package_id, &version, &slug)
            .await?,
    ))
}

pub async fn list_references<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version)): Path<(String, String)>,
) -> ApiResult<Json<ListResponse<VersionReference>>> {
    Ok(Json(ListResponse::new(
        catalog.versions.list_references(&principal, &package_id, &version).await?,
    )))
}

pub async fn get_sources<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path((package_id, version)): Path<(String, String)>,
) -> ApiResult<Response> {
    let data = catalog.versions.get_sources(&principal, &package_id, &version).await?;
    let filename = format!("{}_{}.tar.gz", package_id.replace('.', "_"), version);
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", filename)),
        ],
        data,
    )
        .into_response())
}

// ---- activity ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityQuery {
    #[serde(default)]
    pub include_refs: bool,
    #[serde(default)]
    pub only_favorite: bool,
    #[serde(default)]
    pub only_shared: bool,
    pub kind: Option<String>,
    pub text_filter: Option<String>,
    pub types: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

impl ActivityQuery {
    fn filter(self) -> CatalogResult<ActivityFilter> {
        Ok(ActivityFilter {
            include_refs: self.include_refs,
            only_favorite: self.only_favorite,
            only_shared: self.only_shared,
            kinds: parse_list::<PackageKind>("kind", self.kind.as_deref())?,
            text_filter: self.text_filter,
            types: parse_list::<EventType>("types", self.types.as_deref())?,
            paging: Paging::new(self.page, self.limit),
        })
    }
}

pub async fn package_activity<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<ListResponse<ActivityEventView>>> {
    let events = catalog
        .feed
        .package_events(&principal, &package_id, &query.filter()?)
        .await?;
    Ok(Json(ListResponse::new(events)))
}

pub async fn all_activity<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<ListResponse<ActivityEventView>>> {
    let events = catalog.feed.all_events(&principal, &query.filter()?).await?;
    Ok(Json(ListResponse::new(events)))
}

// ---- legacy projections ----

pub async fn list_packages_legacy<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Query(query): Query<PackageListQuery>,
) -> ApiResult<Json<ListResponse<PackageViewLegacy>>> {
    let packages = catalog.packages.list_packages(&principal, &query.filter()?).await?;
    Ok(Json(ListResponse::new(packages.iter().map(PackageViewLegacy::from).collect())))
}

pub async fn get_package_legacy<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
) -> ApiResult<Response> {
    let lookup = match catalog.packages.get_package(&principal, &package_id, false).await? {
        PackageLookup::Found(view) => PackageLookup::Found(PackageViewLegacy::from(&view)),
        PackageLookup::Moved { from_id, to_id } => PackageLookup::Moved { from_id, to_id },
    };
    let base_path = catalog.config.server.base_path.trim_end_matches('/');
    Ok(found_or_moved(lookup, |to| format!("{}/api/v1/packages/{}", base_path, to)))
}

pub async fn list_versions_legacy<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
    Query(query): Query<VersionListQuery>,
) -> ApiResult<Json<ListResponse<VersionViewLegacy>>> {
    let versions = catalog
        .versions
        .list_versions(&principal, &package_id, &query.filter()?)
        .await?;
    Ok(Json(ListResponse::new(versions.iter().map(VersionViewLegacy::from).collect())))
}

pub async fn package_activity_legacy<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(package_id): Path<String>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<ListResponse<ActivityEventViewLegacy>>> {
    let events = catalog
        .feed
        .package_events(&principal, &package_id, &query.filter()?)
        .await?;
    Ok(Json(ListResponse::new(events.iter().map(ActivityEventViewLegacy::from).collect())))
}

/// Rejection for unknown routes, in the common error envelope.
pub async fn not_found() -> ApiError {
    CatalogError::not_found(codes::INVALID_PARAMETER, "No such endpoint").into()
}
