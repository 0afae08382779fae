use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::api::error::ApiResult;
use crate::api::handlers::AppState;
use crate::error::{codes, CatalogError};
use crate::model::{
    Build, ExportRequest, ExportStarted, ExportStatusView, MigrationCleanupJob, Permission, Principal,
    StorageMigrationReport,
};
use crate::storage::{BUILD_RESULT_TABLE, PUBLISHED_SOURCES_TABLE};
use crate::store::traits::Store;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatusQuery {
    #[serde(default, rename = "await")]
    pub wait: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMigrationQuery {
    pub table: Option<String>,
}

// ---- exports ----

pub async fn start_export<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Json(request): Json<ExportRequest>,
) -> ApiResult<(StatusCode, Json<ExportStarted>)> {
    let started = catalog.exports.start_export(&principal, request).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

pub async fn export_status<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(export_id): Path<String>,
) -> ApiResult<Json<ExportStatusView>> {
    Ok(Json(catalog.exports.status(&principal, &export_id).await?))
}

pub async fn export_result<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(export_id): Path<String>,
) -> ApiResult<Response> {
    let result = catalog.exports.result(&principal, &export_id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, result.mime_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", result.filename),
            ),
        ],
        result.data,
    )
        .into_response())
}

// ---- builds ----

/// Build status; with `await=true` the request blocks until the build is
/// terminal or the configured wait elapses.
pub async fn build_status<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(build_id): Path<String>,
    Query(query): Query<BuildStatusQuery>,
) -> ApiResult<Json<Build>> {
    let build = catalog.builds.get_build(&build_id).await?;
    catalog
        .auth
        .check_package(&principal, &build.config.package_id, Permission::Read)
        .await?;
    if !query.wait {
        return Ok(Json(build));
    }
    let timeout = catalog.config.await_timeout();
    let cancel = catalog.cancellation();
    Ok(Json(catalog.builds.await_completion(&build_id, timeout, &cancel).await?))
}

// ---- admin ----

pub async fn start_migration_cleanup<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
) -> ApiResult<(StatusCode, Json<MigrationCleanupJob>)> {
    catalog.auth.require_sysadmin(&principal).await?;
    let job = catalog.cleanup.start_migration_cleanup().await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn get_migration_cleanup<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Path(job_id): Path<String>,
) -> ApiResult<Json<MigrationCleanupJob>> {
    catalog.auth.require_sysadmin(&principal).await?;
    Ok(Json(catalog.cleanup.get_migration_cleanup(&job_id).await?))
}

/// Move row-stored blobs into the bucket, one table or both.
pub async fn migrate_storage<S: Store + 'static>(
    State(catalog): State<AppState<S>>,
    principal: Principal,
    Query(query): Query<StorageMigrationQuery>,
) -> ApiResult<Json<Vec<StorageMigrationReport>>> {
    catalog.auth.require_sysadmin(&principal).await?;
    let tables = match query.table.as_deref() {
        None => vec![BUILD_RESULT_TABLE, PUBLISHED_SOURCES_TABLE],
        Some(BUILD_RESULT_TABLE) => vec![BUILD_RESULT_TABLE],
        Some(PUBLISHED_SOURCES_TABLE) => vec![PUBLISHED_SOURCES_TABLE],
        Some(other) => {
            return Err(CatalogError::validation(
                codes::INVALID_PARAMETER,
                format!("Unknown storage table '{}'", other),
            )
            .with_param("table", other)
            .into())
        }
    };
    let mut reports = Vec::with_capacity(tables.len());
    for table in tables {
        reports.push(catalog.storage.upload_files_to_bucket(table).await?);
    }
    Ok(Json(reports))
}
