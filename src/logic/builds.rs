use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::{codes, CatalogError, CatalogResult};
use crate::model::{
    generate_id, Build, BuildConfig, BuildStatus, BuildType, ExportResult, ExportResultRecord, Id,
};
use crate::storage::{ObjectStorage, BUILD_RESULT_TABLE};
use crate::store::traits::Store;

const AWAIT_INITIAL_DELAY: Duration = Duration::from_millis(50);

/// Check that a build config carries what its build type needs.
pub fn validate_build_config(config: &BuildConfig) -> CatalogResult<()> {
    if config.package_id.is_empty() {
        return Err(CatalogError::empty_param("packageId"));
    }
    if config.version.is_empty() {
        return Err(CatalogError::empty_param("version"));
    }
    match config.build_type {
        BuildType::ExportRestOperationsGroup => {
            if config.group_name.as_deref().unwrap_or_default().is_empty() {
                return Err(CatalogError::empty_param("groupName"));
            }
            if config.transformation.is_none() {
                return Err(CatalogError::validation(
                    codes::UNKNOWN_TRANSFORMATION,
                    "Transformation is required for operation group export, expected reduced-source or merged",
                )
                .with_param("transformation", ""));
            }
        }
        BuildType::ReducedSourceSpecifications => {
            if config.group_name.as_deref().unwrap_or_default().is_empty() {
                return Err(CatalogError::empty_param("groupName"));
            }
        }
        BuildType::ExportRestDocument => {
            if config.document_id.as_deref().unwrap_or_default().is_empty() {
                return Err(CatalogError::empty_param("documentId"));
            }
        }
        BuildType::Build => {
            if config.publish_target.is_none() {
                return Err(CatalogError::empty_param("publishTarget"));
            }
        }
        BuildType::ExportVersion | BuildType::MergedSpecification => {}
    }
    Ok(())
}

/// Build lifecycle: creation with de-duplication, forward-only status
/// changes, awaiting and export results.
pub struct BuildController<S: Store> {
    store: Arc<S>,
    storage: Arc<ObjectStorage<S>>,
    config: Arc<AppConfig>,
}

impl<S: Store> Clone for BuildController<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            storage: self.storage.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Store + 'static> BuildController<S> {
    pub fn new(store: Arc<S>, storage: Arc<ObjectStorage<S>>, config: Arc<AppConfig>) -> Self {
        Self {
            store,
            storage,
            config,
        }
    }

    /// Persist a build and return its id. A live build with the same config
    /// checksum is reused instead.
    pub async fn create_build(&self, config: BuildConfig) -> CatalogResult<Id> {
        validate_build_config(&config)?;
        let checksum = config.checksum();
        let results_after = Utc::now() - self.config.export_result_ttl();
        if let Some(existing) = self.store.find_reusable_build(&checksum, results_after).await? {
            log::debug!(
                "Reusing build {} ({}) for '{}'",
                existing.build_id,
                existing.status.as_str(),
                config.package_id
            );
            return Ok(existing.build_id);
        }
        let build = Build::new(generate_id(), config);
        let build_id = build.build_id.clone();
        log::info!(
            "Created {} build {} for {}@{}",
            build.config.build_type.as_str(),
            build_id,
            build.config.package_id,
            build.config.version
        );
        self.store.insert_build(build).await?;
        Ok(build_id)
    }

    pub async fn get_build(&self, build_id: &str) -> CatalogResult<Build> {
        self.store
            .get_build(build_id)
            .await?
            .ok_or_else(|| CatalogError::build_not_found(build_id))
    }

    pub async fn complete(&self, build_id: &str) -> CatalogResult<bool> {
        Ok(self
            .store
            .transition_build(
                build_id,
                &[BuildStatus::NotStarted, BuildStatus::Running],
                BuildStatus::Complete,
                "",
            )
            .await?)
    }

    pub async fn fail(&self, build_id: &str, details: &str) -> CatalogResult<bool> {
        Ok(self
            .store
            .transition_build(
                build_id,
                &[BuildStatus::NotStarted, BuildStatus::Running],
                BuildStatus::Error,
                details,
            )
            .await?)
    }

    /// Poll until the build is terminal, doubling the delay up to the
    /// configured ceiling. Gives up at `timeout` or when `cancel` fires.
    pub async fn await_completion(
        &self,
        build_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CatalogResult<Build> {
        let deadline = Instant::now() + timeout;
        let ceiling = Duration::from_millis(self.config.builds.await_ceiling_ms.max(1));
        let mut delay = AWAIT_INITIAL_DELAY.min(ceiling);
        loop {
            let build = self.get_build(build_id).await?;
            match build.status {
                BuildStatus::Complete => return Ok(build),
                BuildStatus::Error => {
                    return Err(CatalogError::dependency(
                        codes::BUILD_FAILED,
                        format!("Build {} failed: {}", build_id, build.details),
                    )
                    .with_param("buildId", build_id)
                    .with_param("details", &build.details))
                }
                BuildStatus::NotStarted | BuildStatus::Running => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CatalogError::dependency(
                    codes::BUILD_AWAIT_TIMEOUT,
                    format!("Build {} did not finish within {:?}", build_id, timeout),
                )
                .with_param("buildId", build_id));
            }
            let sleep = delay.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CatalogError::dependency(
                        codes::BUILD_AWAIT_CANCELLED,
                        format!("Waiting for build {} was cancelled", build_id),
                    )
                    .with_param("buildId", build_id));
                }
                _ = tokio::time::sleep(sleep) => {}
            }
            delay = (delay * 2).min(ceiling);
        }
    }

    /// Store the artifact of a build once; repeated calls are no-ops.
    pub async fn store_export_result(
        &self,
        user_id: &str,
        build_id: &str,
        data: &[u8],
        filename: &str,
        config: &BuildConfig,
    ) -> CatalogResult<()> {
        if self.store.get_export_result(build_id).await?.is_some() {
            log::debug!("Export result of build {} already stored", build_id);
            return Ok(());
        }
        self.storage.put_file(BUILD_RESULT_TABLE, build_id, data).await?;
        let inserted = self
            .store
            .insert_export_result(ExportResultRecord {
                build_id: build_id.to_string(),
                filename: filename.to_string(),
                created_at: Utc::now(),
                created_by: user_id.to_string(),
                config: config.clone(),
            })
            .await?;
        if inserted {
            log::info!("Stored export result '{}' of build {} ({} bytes)", filename, build_id, data.len());
        }
        Ok(())
    }

    /// Build and its result, `None` when nothing is stored (yet or anymore).
    pub async fn get_export_result(&self, build_id: &str) -> CatalogResult<(Build, Option<ExportResult>)> {
        let build = self.get_build(build_id).await?;
        let Some(record) = self.store.get_export_result(build_id).await? else {
            return Ok((build, None));
        };
        let data = self.storage.get_file(BUILD_RESULT_TABLE, build_id).await?;
        Ok((build, data.map(|data| ExportResult::from_record(record, data))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildFormat, PublishTarget, Transformation, VersionStatus};
    use crate::store::MemoryStore;

    fn controller() -> (Arc<MemoryStore>, BuildController<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut config = AppConfig::default();
        config.builds.await_ceiling_ms = 20;
        let controller = BuildController::new(
            store.clone(),
            Arc::new(ObjectStorage::new(store.clone())),
            Arc::new(config),
        );
        (store, controller)
    }

    fn export_config() -> BuildConfig {
        BuildConfig::new("acme.pay.gw", "2025.1@1", BuildType::ExportVersion, BuildFormat::Json)
    }

    #[test]
    fn test_group_export_requires_transformation() {
        let mut config = BuildConfig::new(
            "acme.pay.gw",
            "2025.1@1",
            BuildType::ExportRestOperationsGroup,
            BuildFormat::Yaml,
        );
        config.group_name = Some("users".to_string());
        assert_eq!(
            validate_build_config(&config).unwrap_err().code(),
            codes::UNKNOWN_TRANSFORMATION
        );
        config.transformation = Some(Transformation::ReducedSource);
        assert!(validate_build_config(&config).is_ok());

        let document = BuildConfig::new("acme.pay.gw", "2025.1@1", BuildType::ExportRestDocument, BuildFormat::Html);
        assert!(validate_build_config(&document).is_err());

        let mut publish = BuildConfig::new("acme.pay.gw", "2025.1@1", BuildType::Build, BuildFormat::Json);
        assert!(validate_build_config(&publish).is_err());
        publish.publish_target = Some(PublishTarget {
            package_id: "acme.pay.gw".to_string(),
            version: "2025.2".to_string(),
            status: VersionStatus::Draft,
            previous_version: None,
            previous_version_package_id: None,
            labels: vec![],
        });
        assert!(validate_build_config(&publish).is_ok());
    }

    #[tokio::test]
    async fn test_identical_configs_share_a_build() {
        let (_, builds) = controller();
        let mut first = export_config();
        first.created_by = "alice".to_string();
        let mut second = export_config();
        second.created_by = "bob".to_string();
        let a = builds.create_build(first).await.unwrap();
        let b = builds.create_build(second).await.unwrap();
        assert_eq!(a, b);

        builds.fail(&a, "boom").await.unwrap();
        let c = builds.create_build(export_config()).await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_await_completion_outcomes() {
        let (_, builds) = controller();
        let cancel = CancellationToken::new();

        let done = builds.create_build(export_config()).await.unwrap();
        builds.complete(&done).await.unwrap();
        let build = builds
            .await_completion(&done, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(build.status, BuildStatus::Complete);

        let mut other = export_config();
        other.format = BuildFormat::Yaml;
        let failed = builds.create_build(other).await.unwrap();
        builds.fail(&failed, "transformation failed").await.unwrap();
        let err = builds
            .await_completion(&failed, Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::BUILD_FAILED);

        let mut pending = export_config();
        pending.format = BuildFormat::Html;
        let pending = builds.create_build(pending).await.unwrap();
        let err = builds
            .await_completion(&pending, Duration::from_millis(60), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::BUILD_AWAIT_TIMEOUT);

        cancel.cancel();
        let err = builds
            .await_completion(&pending, Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::BUILD_AWAIT_CANCELLED);
    }

    #[tokio::test]
    async fn test_export_result_is_stored_once() {
        let (_, builds) = controller();
        let config = export_config();
        let id = builds.create_build(config.clone()).await.unwrap();
        builds
            .store_export_result("alice", &id, b"first", "acme_pay_gw_2025.1@1.tar.gz", &config)
            .await
            .unwrap();
        builds
            .store_export_result("bob", &id, b"second", "other.tar.gz", &config)
            .await
            .unwrap();
        let (_, result) = builds.get_export_result(&id).await.unwrap();
        let result = result.unwrap();
        assert_eq!(result.data, b"first".to_vec());
        assert_eq!(result.created_by, "alice");
        assert_eq!(result.mime_type(), "application/gzip");
    }
}
