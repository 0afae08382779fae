use std::sync::Arc;

use crate::error::{codes, CatalogError, CatalogResult};
use crate::logic::authorization::Authorization;
use crate::logic::builds::BuildController;
use crate::logic::versions::resolve_revision;
use crate::model::{
    BuildConfig, BuildFormat, BuildStatus, BuildType, ExportRequest, ExportResult, ExportStarted,
    ExportStatusView, Permission, Principal, Transformation, API_TYPE_REST,
};
use crate::store::traits::Store;

fn result_unavailable(export_id: &str) -> CatalogError {
    CatalogError::not_found(
        codes::EXPORT_RESULT_UNAVAILABLE,
        format!("Result of export '{}' is no longer available, start the export again", export_id),
    )
    .with_param("exportId", export_id)
}

/// Starts exports as builds and serves their status and artifacts.
pub struct ExportService<S: Store> {
    store: Arc<S>,
    auth: Authorization<S>,
    builds: BuildController<S>,
}

impl<S: Store> Clone for ExportService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            auth: self.auth.clone(),
            builds: self.builds.clone(),
        }
    }
}

impl<S: Store + 'static> ExportService<S> {
    pub fn new(store: Arc<S>, auth: Authorization<S>, builds: BuildController<S>) -> Self {
        Self { store, auth, builds }
    }

    pub async fn start_export(&self, principal: &Principal, request: ExportRequest) -> CatalogResult<ExportStarted> {
        let format = BuildFormat::parse(&request.format)?;
        self.auth
            .check_package(principal, &request.package_id, Permission::Read)
            .await?;
        let revision = resolve_revision(self.store.as_ref(), &request.package_id, &request.version).await?;

        let build_type = match (&request.group_name, &request.document_id) {
            (Some(_), _) => BuildType::ExportRestOperationsGroup,
            (None, Some(_)) => BuildType::ExportRestDocument,
            (None, None) => BuildType::ExportVersion,
        };
        let mut config = BuildConfig::new(&request.package_id, &revision.key(), build_type, format);
        config.created_by = principal.actor_id().to_string();
        match build_type {
            BuildType::ExportRestOperationsGroup => {
                let raw = request.transformation.as_deref().unwrap_or_default();
                config.transformation = Some(Transformation::parse(raw)?);
                config.group_name = request.group_name;
                config.api_type = Some(request.api_type.unwrap_or_else(|| API_TYPE_REST.to_string()));
            }
            BuildType::ExportRestDocument => config.document_id = request.document_id,
            _ => {}
        }

        let export_id = self.builds.create_build(config).await?;
        log::info!(
            "Export {} of '{}' {} requested by {}",
            export_id,
            request.package_id,
            revision.key(),
            principal.actor_id()
        );
        Ok(ExportStarted { export_id })
    }

    pub async fn status(&self, principal: &Principal, export_id: &str) -> CatalogResult<ExportStatusView> {
        let build = self.builds.get_build(export_id).await?;
        self.auth
            .check_package(principal, &build.config.package_id, Permission::Read)
            .await?;
        if build.result_deleted {
            return Err(result_unavailable(export_id));
        }
        Ok(ExportStatusView {
            export_id: build.build_id,
            status: build.status,
            message: build.details,
            package_id: build.config.package_id,
        })
    }

    /// The artifact of a finished export. A terminal export without a stored
    /// result has expired and must be started again.
    pub async fn result(&self, principal: &Principal, export_id: &str) -> CatalogResult<ExportResult> {
        let (build, result) = self.builds.get_export_result(export_id).await?;
        self.auth
            .check_package(principal, &build.config.package_id, Permission::Read)
            .await?;
        match (build.status, result) {
            (BuildStatus::Error, _) => Err(CatalogError::dependency(
                codes::BUILD_FAILED,
                format!("Export '{}' failed: {}", export_id, build.details),
            )
            .with_param("exportId", export_id)),
            (BuildStatus::Complete, Some(result)) => Ok(result),
            (BuildStatus::Complete, None) => Err(result_unavailable(export_id)),
            (status, _) => Err(CatalogError::conflict(
                codes::EXPORT_NOT_READY,
                format!("Export '{}' is {}", export_id, status.as_str()),
            )
            .with_param("exportId", export_id)
            .with_param("status", status.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::logic::activity::ActivityTracker;
    use crate::logic::background::BackgroundExecutor;
    use crate::model::{Package, PackageKind, Revision, VersionStatus, ROLE_VIEWER};
    use crate::storage::{ObjectStorage, BUILD_RESULT_TABLE};
    use crate::store::traits::NewRevision;
    use crate::store::MemoryStore;
    use crate::store::traits::*;
    use chrono::Utc;

    fn package(id: &str, kind: PackageKind) -> Package {
        Package {
            id: id.to_string(),
            kind,
            parent_id: crate::model::parent_of(id).to_string(),
            alias: crate::model::alias_of(id).to_string(),
            name: id.to_string(),
            description: String::new(),
            default_role: if kind == PackageKind::Workspace {
                ROLE_VIEWER.to_string()
            } else {
                String::new()
            },
            default_release_version: String::new(),
            release_version_pattern: String::new(),
            service_name: String::new(),
            rest_grouping_prefix: String::new(),
            exclude_from_search: false,
            image_url: String::new(),
            created_at: Utc::now(),
            created_by: "root".to_string(),
            deleted_at: None,
            deleted_by: None,
        }
    }

    async fn service() -> (Arc<MemoryStore>, BuildController<MemoryStore>, ExportService<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_package(package("acme", PackageKind::Workspace)).await.unwrap();
        store.insert_package(package("acme.gw", PackageKind::Package)).await.unwrap();
        store
            .insert_revision(NewRevision {
                revision: Revision {
                    package_id: "acme.gw".to_string(),
                    version: "2025.1".to_string(),
                    revision: 0,
                    status: VersionStatus::Release,
                    previous_version: None,
                    previous_version_package_id: None,
                    labels: vec![],
                    published_at: Utc::now(),
                    created_by: "root".to_string(),
                    publish_id: None,
                    deleted_at: None,
                    deleted_by: None,
                },
                documents: vec![],
                operations: vec![],
                references: vec![],
            })
            .await
            .unwrap();
        let config = Arc::new(AppConfig::default());
        let activity = ActivityTracker::new(store.clone(), BackgroundExecutor::new(1));
        let auth = Authorization::new(store.clone(), activity);
        let builds = BuildController::new(store.clone(), Arc::new(ObjectStorage::new(store.clone())), config);
        let exports = ExportService::new(store.clone(), auth, builds.clone());
        (store, builds, exports)
    }

    fn request(format: &str) -> ExportRequest {
        ExportRequest {
            package_id: "acme.gw".to_string(),
            version: "2025.1".to_string(),
            format: format.to_string(),
            document_id: None,
            group_name: None,
            api_type: None,
            transformation: None,
        }
    }

    #[tokio::test]
    async fn test_export_validation() {
        let (_, _, exports) = service().await;
        let viewer = Principal::user("viewer");
        let err = exports.start_export(&viewer, request("xml")).await.unwrap_err();
        assert_eq!(err.code(), codes::UNKNOWN_BUILD_FORMAT);

        let group = ExportRequest {
            group_name: Some("users".to_string()),
            transformation: Some("flattened".to_string()),
            ..request("yaml")
        };
        let err = exports.start_export(&viewer, group).await.unwrap_err();
        assert_eq!(err.code(), codes::UNKNOWN_TRANSFORMATION);

        let document = ExportRequest {
            document_id: Some("openapi".to_string()),
            transformation: Some("flattened".to_string()),
            ..request("html")
        };
        assert!(exports.start_export(&viewer, document).await.is_ok());
    }

    #[tokio::test]
    async fn test_export_lifecycle() {
        let (store, builds, exports) = service().await;
        let viewer = Principal::user("viewer");
        let started = exports.start_export(&viewer, request("json")).await.unwrap();
        let build = builds.get_build(&started.export_id).await.unwrap();
        assert_eq!(build.config.version, "2025.1@1");
        assert_eq!(build.config.build_type, BuildType::ExportVersion);

        let err = exports.result(&viewer, &started.export_id).await.unwrap_err();
        assert_eq!(err.code(), codes::EXPORT_NOT_READY);

        builds
            .store_export_result("viewer", &started.export_id, b"archive", "acme_gw_2025.1@1.tar.gz", &build.config)
            .await
            .unwrap();
        builds.complete(&started.export_id).await.unwrap();
        let status = exports.status(&viewer, &started.export_id).await.unwrap();
        assert_eq!(status.status, BuildStatus::Complete);
        let result = exports.result(&viewer, &started.export_id).await.unwrap();
        assert_eq!(result.data, b"archive".to_vec());

        store.delete_blobs(BUILD_RESULT_TABLE, &[started.export_id.clone()]).await.unwrap();
        store.mark_results_deleted(&[started.export_id.clone()]).await.unwrap();
        let err = exports.result(&viewer, &started.export_id).await.unwrap_err();
        assert_eq!(err.code(), codes::EXPORT_RESULT_UNAVAILABLE);
        assert_eq!(err.status(), 410);
        let err = exports.status(&viewer, &started.export_id).await.unwrap_err();
        assert_eq!(err.code(), codes::EXPORT_RESULT_UNAVAILABLE);

        let err = exports.status(&viewer, "missing").await.unwrap_err();
        assert_eq!(err.code(), codes::BUILD_NOT_FOUND);
    }
}
