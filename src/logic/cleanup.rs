use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::{codes, CatalogError, CatalogResult};
use crate::logic::background::BackgroundExecutor;
use crate::model::{generate_id, CleanupRun, JobStatus, MigrationCleanupJob};
use crate::storage::{ObjectStorage, BUILD_RESULT_TABLE, PUBLISHED_SOURCES_TABLE};
use crate::store::traits::Store;
use crate::store::TransformedDocumentCache;

const SCHEDULE_SLACK_DIVISOR: i32 = 10;

/// Cron-driven removal of expired build results, transformed documents and
/// source archives of deleted versions.
pub struct CleanupScheduler<S: Store> {
    store: Arc<S>,
    storage: Arc<ObjectStorage<S>>,
    cache: Arc<TransformedDocumentCache>,
    config: Arc<AppConfig>,
    background: BackgroundExecutor,
}

impl<S: Store> Clone for CleanupScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            storage: self.storage.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
            background: self.background.clone(),
        }
    }
}

impl<S: Store + 'static> CleanupScheduler<S> {
    pub fn new(
        store: Arc<S>,
        storage: Arc<ObjectStorage<S>>,
        cache: Arc<TransformedDocumentCache>,
        config: Arc<AppConfig>,
        background: BackgroundExecutor,
    ) -> Self {
        Self {
            store,
            storage,
            cache,
            config,
            background,
        }
    }

    fn schedule(&self) -> CatalogResult<Schedule> {
        Schedule::from_str(&self.config.cleanup.schedule).map_err(|e| {
            CatalogError::validation(
                codes::INVALID_PARAMETER,
                format!("Cleanup schedule '{}' is not valid: {}", self.config.cleanup.schedule, e),
            )
        })
    }

    /// Gap between the next two ticks of the schedule.
    fn interval(schedule: &Schedule) -> chrono::Duration {
        let mut upcoming = schedule.upcoming(Utc);
        match (upcoming.next(), upcoming.next()) {
            (Some(first), Some(second)) => second - first,
            _ => chrono::Duration::days(1),
        }
    }

    /// Smallest accepted gap since the last successful run: one interval
    /// less a tenth, absorbing wake-up jitter and clock drift between ticks.
    fn min_gap(schedule: &Schedule) -> chrono::Duration {
        let interval = Self::interval(schedule);
        interval - interval / SCHEDULE_SLACK_DIVISOR
    }

    pub fn start(&self, cancel: CancellationToken) -> CatalogResult<JoinHandle<()>> {
        let schedule = self.schedule()?;
        let scheduler = self.clone();
        Ok(tokio::spawn(async move {
            log::info!("Cleanup scheduler started ({})", scheduler.config.cleanup.schedule);
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    log::warn!("Cleanup schedule has no upcoming ticks");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        match scheduler.run_once(next).await {
                            Ok(Some(run)) => log::info!(
                                "Cleanup run {} removed {} build results, {} transformed documents, {} source archives",
                                run.run_id,
                                run.deleted_builds,
                                run.deleted_transformed_documents,
                                run.deleted_sources
                            ),
                            Ok(None) => {}
                            Err(e) => log::error!("Cleanup run failed: {}", e),
                        }
                    }
                }
            }
            log::info!("Cleanup scheduler stopped");
        }))
    }

    /// One scheduled tick at `now`. Returns `None` when skipped: a storage
    /// migration is running or the last successful run is less than one
    /// interval old.
    pub async fn run_once(&self, now: DateTime<Utc>) -> CatalogResult<Option<CleanupRun>> {
        if self.storage.is_migration_in_progress() {
            log::info!("Skipping cleanup while storage migration is in progress");
            return Ok(None);
        }
        let min_gap = Self::min_gap(&self.schedule()?);
        let Some(mut run) = self.store.begin_cleanup_run(min_gap, now).await? else {
            log::debug!("Skipping cleanup, last successful run is recent");
            return Ok(None);
        };
        log::info!("Cleanup run {} started", run.run_id);
        if let Err(e) = self.perform(&mut run, now).await {
            log::error!("Cleanup run {} failed: {}", run.run_id, e);
            run.error = Some(e.to_string());
        }
        run.finished_at = Some(Utc::now());
        self.store.finish_cleanup_run(run.clone()).await?;
        Ok(Some(run))
    }

    async fn perform(&self, run: &mut CleanupRun, now: DateTime<Utc>) -> CatalogResult<()> {
        let before = now - chrono::Duration::days(self.config.cleanup.build_result_ttl_days);
        let batch = self.config.cleanup.batch_size.max(1);

        loop {
            let ids = self.store.list_expired_results(before, batch).await?;
            if ids.is_empty() {
                break;
            }
            self.storage.remove_files(BUILD_RESULT_TABLE, &ids).await?;
            self.store.mark_results_deleted(&ids).await?;
            run.deleted_builds += ids.len();
            if (ids.len() as i64) < batch {
                break;
            }
        }

        run.deleted_transformed_documents = self.store.delete_transformed_documents_before(before).await?;
        self.cache.clear_expired().await;

        loop {
            let ids = self.store.list_unpurged_deleted_sources(before, batch).await?;
            if ids.is_empty() {
                break;
            }
            self.storage.remove_files(PUBLISHED_SOURCES_TABLE, &ids).await?;
            self.store.mark_sources_purged(&ids).await?;
            run.deleted_sources += ids.len();
            if (ids.len() as i64) < batch {
                break;
            }
        }
        Ok(())
    }

    /// Start removing build data produced by migrations. Progress is kept on
    /// the returned job; only the last error is reported.
    pub async fn start_migration_cleanup(&self) -> CatalogResult<MigrationCleanupJob> {
        let job = MigrationCleanupJob {
            job_id: generate_id(),
            status: JobStatus::Running,
            deleted_items: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store.put_migration_job(job.clone()).await?;
        log::info!("Migration build data cleanup {} started", job.job_id);

        let scheduler = self.clone();
        let mut progress = job.clone();
        self.background.spawn("migration-cleanup", async move {
            let batch = scheduler.config.cleanup.batch_size.max(1);
            loop {
                let ids = match scheduler.store.list_migration_builds(batch).await {
                    Ok(ids) if ids.is_empty() => break,
                    Ok(ids) => ids,
                    Err(e) => {
                        progress.error = Some(e.to_string());
                        break;
                    }
                };
                if let Err(e) = scheduler.storage.remove_files(BUILD_RESULT_TABLE, &ids).await {
                    log::warn!("Migration cleanup {}: {}", progress.job_id, e);
                    progress.error = Some(e.to_string());
                }
                if let Err(e) = scheduler.store.mark_results_deleted(&ids).await {
                    log::error!("Migration cleanup {} stopped: {:#}", progress.job_id, e);
                    progress.error = Some(e.to_string());
                    break;
                }
                progress.deleted_items += ids.len();
                if let Err(e) = scheduler.store.put_migration_job(progress.clone()).await {
                    log::warn!("Migration cleanup {}: failed to save progress: {:#}", progress.job_id, e);
                }
            }
            progress.status = if progress.error.is_some() {
                JobStatus::Error
            } else {
                JobStatus::Complete
            };
            progress.finished_at = Some(Utc::now());
            log::info!(
                "Migration build data cleanup {} finished: {} items, status {}",
                progress.job_id,
                progress.deleted_items,
                progress.status.as_str()
            );
            scheduler.store.put_migration_job(progress).await
        });
        Ok(job)
    }

    pub async fn get_migration_cleanup(&self, job_id: &str) -> CatalogResult<MigrationCleanupJob> {
        self.store.get_migration_job(job_id).await?.ok_or_else(|| {
            CatalogError::not_found(codes::JOB_NOT_FOUND, format!("Cleanup job '{}' not found", job_id))
                .with_param("jobId", job_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::builds::BuildController;
    use crate::model::{BuildConfig, BuildFormat, BuildType, MIGRATION_BUILD_AUTHOR};
    use crate::store::MemoryStore;
    use crate::store::traits::*;

    fn scheduler(store: Arc<MemoryStore>) -> (CleanupScheduler<MemoryStore>, BuildController<MemoryStore>, BackgroundExecutor) {
        let mut config = AppConfig::default();
        config.cleanup.build_result_ttl_days = 0;
        config.cleanup.batch_size = 1;
        let config = Arc::new(config);
        let storage = Arc::new(ObjectStorage::new(store.clone()));
        let background = BackgroundExecutor::new(1);
        let builds = BuildController::new(store.clone(), storage.clone(), config.clone());
        let cleanup = CleanupScheduler::new(
            store,
            storage,
            Arc::new(TransformedDocumentCache::new()),
            config,
            background.clone(),
        );
        (cleanup, builds, background)
    }

    async fn finished_build(builds: &BuildController<MemoryStore>, version: &str, author: &str) -> String {
        let mut config = BuildConfig::new("acme.gw", version, BuildType::ExportVersion, BuildFormat::Json);
        config.created_by = author.to_string();
        let id = builds.create_build(config.clone()).await.unwrap();
        builds
            .store_export_result(author, &id, b"archive", "export.tar.gz", &config)
            .await
            .unwrap();
        builds.complete(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_run_removes_expired_results_once_per_interval() {
        let store = Arc::new(MemoryStore::new());
        let (cleanup, builds, _) = scheduler(store.clone());
        let first = finished_build(&builds, "2025.1@1", "alice").await;
        let second = finished_build(&builds, "2025.2@1", "alice").await;

        let now = Utc::now() + chrono::Duration::seconds(1);
        let run = cleanup.run_once(now).await.unwrap().unwrap();
        assert!(run.succeeded());
        assert_eq!(run.deleted_builds, 2);
        for id in [&first, &second] {
            let (build, result) = builds.get_export_result(id).await.unwrap();
            assert!(build.result_deleted);
            assert!(result.is_none());
        }

        assert!(cleanup.run_once(now).await.unwrap().is_none());
        assert_eq!(store.last_cleanup_run().await.unwrap().unwrap().run_id, 1);
    }

    #[tokio::test]
    async fn test_next_tick_runs_despite_early_wake_up() {
        let store = Arc::new(MemoryStore::new());
        let (cleanup, builds, _) = scheduler(store.clone());
        finished_build(&builds, "2025.1@1", "alice").await;
        let interval = CleanupScheduler::<MemoryStore>::interval(&cleanup.schedule().unwrap());

        let t0 = Utc::now() + chrono::Duration::seconds(1);
        assert!(cleanup.run_once(t0).await.unwrap().is_some());
        let early = t0 + interval - chrono::Duration::milliseconds(1);
        let run = cleanup.run_once(early).await.unwrap().unwrap();
        assert!(run.succeeded());
        assert_eq!(store.last_cleanup_run().await.unwrap().unwrap().run_id, 2);
    }

    #[tokio::test]
    async fn test_migration_cleanup_job() {
        let store = Arc::new(MemoryStore::new());
        let (cleanup, builds, background) = scheduler(store.clone());
        let migrated = finished_build(&builds, "2025.1@1", MIGRATION_BUILD_AUTHOR).await;
        let regular = finished_build(&builds, "2025.2@1", "alice").await;

        let job = cleanup.start_migration_cleanup().await.unwrap();
        background.wait_idle().await;
        let job = cleanup.get_migration_cleanup(&job.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.deleted_items, 1);
        assert!(job.error.is_none());
        assert!(builds.get_build(&migrated).await.unwrap().result_deleted);
        assert!(!builds.get_build(&regular).await.unwrap().result_deleted);

        let err = cleanup.get_migration_cleanup("missing").await.unwrap_err();
        assert_eq!(err.code(), codes::JOB_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_migration_cleanup_job_ends_in_error_when_marking_fails() {
        let store = Arc::new(MemoryStore::new());
        let (cleanup, builds, background) = scheduler(store.clone());
        let migrated = finished_build(&builds, "2025.1@1", MIGRATION_BUILD_AUTHOR).await;
        store.fail_on("mark_results_deleted").await;

        let job = cleanup.start_migration_cleanup().await.unwrap();
        background.wait_idle().await;
        let job = cleanup.get_migration_cleanup(&job.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.finished_at.is_some());
        assert!(job.error.unwrap().contains("mark_results_deleted"));
        assert_eq!(job.deleted_items, 0);
        assert!(!builds.get_build(&migrated).await.unwrap().result_deleted);
    }
}
