use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{codes, CatalogError, CatalogResult};
use crate::logic::archive::pack_tar_gz;
use crate::logic::builds::BuildController;
use crate::logic::transform::{convert_document, merged_document, reduced_documents};
use crate::logic::versions::{resolve_revision, VersionService};
use crate::model::{
    make_group_id, Build, BuildConfig, BuildType, NewOperation, Operation, OperationGroup,
    PublishFile, PublishRequest, Revision, Transformation, TransformedDocument,
    TransformedDocumentKey, TransformedFile, API_TYPE_REST,
};
use crate::store::traits::Store;
use crate::store::TransformedDocumentCache;

/// Executes claimed builds of every type.
pub struct BuildProcessor<S: Store> {
    store: Arc<S>,
    builds: BuildController<S>,
    versions: VersionService<S>,
    cache: Arc<TransformedDocumentCache>,
}

impl<S: Store> Clone for BuildProcessor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            builds: self.builds.clone(),
            versions: self.versions.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<S: Store + 'static> BuildProcessor<S> {
    pub fn new(
        store: Arc<S>,
        builds: BuildController<S>,
        versions: VersionService<S>,
        cache: Arc<TransformedDocumentCache>,
    ) -> Self {
        Self {
            store,
            builds,
            versions,
            cache,
        }
    }

    /// Run the build and record its terminal status.
    pub async fn process(&self, build: &Build) -> CatalogResult<()> {
        let started = std::time::Instant::now();
        match self.execute(build).await {
            Ok(()) => {
                self.builds.complete(&build.build_id).await?;
                log::info!(
                    "Build {} ({}) complete in {:?}",
                    build.build_id,
                    build.config.build_type.as_str(),
                    started.elapsed()
                );
            }
            Err(e) => {
                log::warn!("Build {} failed: {}", build.build_id, e);
                self.builds.fail(&build.build_id, &e.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn execute(&self, build: &Build) -> CatalogResult<()> {
        let config = &build.config;
        match config.build_type {
            BuildType::ReducedSourceSpecifications | BuildType::MergedSpecification => {
                self.materialize(build).await.map(|_| ())
            }
            BuildType::ExportRestOperationsGroup => {
                let (_, group, operations) = self.group_operations(config).await?;
                let files = match config.transformation {
                    Some(Transformation::Merged) => vec![merged_document(
                        &group.group_name,
                        &group.api_type,
                        &config.version,
                        &operations,
                        config.format,
                    )?],
                    _ => reduced_documents(&config.version, &operations, config.format)?,
                };
                let entries: Vec<(String, Vec<u8>)> = files.into_iter().map(|f| (f.file_id, f.data)).collect();
                self.store_result(build, &pack_tar_gz(&entries)?).await
            }
            BuildType::ExportVersion => {
                let revision = resolve_revision(self.store.as_ref(), &config.package_id, &config.version).await?;
                let documents = self
                    .store
                    .list_documents(&config.package_id, &revision.version, revision.revision)
                    .await?;
                let mut entries = Vec::with_capacity(documents.len());
                for document in documents {
                    let name = format!("{}.{}", document.slug, config.format.as_str());
                    entries.push((name, convert_document(&document.data, config.format)?));
                }
                self.store_result(build, &pack_tar_gz(&entries)?).await
            }
            BuildType::ExportRestDocument => {
                let revision = resolve_revision(self.store.as_ref(), &config.package_id, &config.version).await?;
                let document_id = config.document_id.as_deref().unwrap_or_default();
                let document = self
                    .store
                    .list_documents(&config.package_id, &revision.version, revision.revision)
                    .await?
                    .into_iter()
                    .find(|d| d.slug == document_id || d.file_id == document_id)
                    .ok_or_else(|| {
                        CatalogError::not_found(
                            codes::DOCUMENT_NOT_FOUND,
                            format!("Document '{}' not found in {}", document_id, revision.key()),
                        )
                        .with_param("documentId", document_id)
                    })?;
                self.store_result(build, &convert_document(&document.data, config.format)?)
                    .await
            }
            BuildType::Build => self.publish(build).await,
        }
    }

    async fn store_result(&self, build: &Build, data: &[u8]) -> CatalogResult<()> {
        self.builds
            .store_export_result(
                &build.created_by,
                &build.build_id,
                data,
                &build.config.export_filename(),
                &build.config,
            )
            .await
    }

    async fn group_operations(&self, config: &BuildConfig) -> CatalogResult<(Revision, OperationGroup, Vec<Operation>)> {
        let revision = resolve_revision(self.store.as_ref(), &config.package_id, &config.version).await?;
        let api_type = config.api_type.as_deref().unwrap_or(API_TYPE_REST);
        let group_name = config.group_name.as_deref().unwrap_or_default();
        let group_id = make_group_id(&config.package_id, &revision.version, revision.revision, api_type, group_name);
        let group = self
            .store
            .get_group(&group_id)
            .await?
            .ok_or_else(|| CatalogError::group_not_found(group_name))?;
        let mut operations = Vec::new();
        for member in self.store.list_grouped_operations(&group_id).await? {
            if let Some(op) = self
                .store
                .get_operation(&member.package_id, &member.version, member.revision, api_type, &member.operation_id)
                .await?
            {
                operations.push(op);
            }
        }
        operations.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok((revision, group, operations))
    }

    /// Produce, persist and cache the transformed documents of a group.
    async fn materialize(&self, build: &Build) -> CatalogResult<TransformedDocument> {
        let config = &build.config;
        let (_, group, operations) = self.group_operations(config).await?;
        let documents = match config.build_type {
            BuildType::MergedSpecification => vec![merged_document(
                &group.group_name,
                &group.api_type,
                &group.version_key(),
                &operations,
                config.format,
            )?],
            _ => reduced_documents(&group.version_key(), &operations, config.format)?,
        };
        let document = TransformedDocument {
            key: TransformedDocumentKey {
                package_id: group.package_id.clone(),
                version: group.version_key(),
                api_type: group.api_type.clone(),
                group_id: group.group_id.clone(),
                build_type: config.build_type,
                format: config.format,
            },
            build_id: build.build_id.clone(),
            documents,
            created_at: Utc::now(),
        };
        self.store.put_transformed_document(document.clone()).await?;
        self.cache.put(document.clone()).await;
        log::debug!(
            "Materialized {} transformed documents of group {}",
            document.documents.len(),
            group.group_id
        );
        Ok(document)
    }

    /// Publish the build sources as a new revision of the target package.
    async fn publish(&self, build: &Build) -> CatalogResult<()> {
        let config = &build.config;
        let target = config
            .publish_target
            .as_ref()
            .ok_or_else(|| CatalogError::empty_param("publishTarget"))?;
        let package = self
            .store
            .get_package(&target.package_id)
            .await?
            .filter(|p| p.deleted_at.is_none())
            .ok_or_else(|| CatalogError::package_not_found(&target.package_id))?;

        let (files, operations) = match config.group_name.as_deref() {
            Some(_) => self.group_sources(build).await?,
            None => self.revision_sources(config).await?,
        };
        let request = PublishRequest {
            package_id: target.package_id.clone(),
            version: target.version.clone(),
            status: target.status,
            previous_version: target.previous_version.clone(),
            previous_version_package_id: target.previous_version_package_id.clone(),
            labels: target.labels.clone(),
            files,
            operations,
            refs: Vec::new(),
            changes: None,
            publish_id: config.publish_id.clone(),
        };
        let author = if config.created_by.is_empty() {
            build.created_by.as_str()
        } else {
            config.created_by.as_str()
        };
        self.versions.publish_as(&package, request, author).await?;
        Ok(())
    }

    async fn group_sources(&self, build: &Build) -> CatalogResult<(Vec<PublishFile>, Vec<NewOperation>)> {
        let config = &build.config;
        let (_, group, operations) = self.group_operations(config).await?;
        let key = TransformedDocumentKey {
            package_id: group.package_id.clone(),
            version: group.version_key(),
            api_type: group.api_type.clone(),
            group_id: group.group_id.clone(),
            build_type: BuildType::ReducedSourceSpecifications,
            format: config.format,
        };
        let document = match self.cache.get(&key).await {
            Some(document) => document,
            None => match self.store.get_transformed_document(&key).await? {
                Some(document) => document,
                None => {
                    let mut reduced = build.clone();
                    reduced.config.build_type = BuildType::ReducedSourceSpecifications;
                    self.materialize(&reduced).await?
                }
            },
        };

        let is_selected = |file: &TransformedFile| {
            config.files.is_empty()
                || config
                    .files
                    .iter()
                    .any(|f| f.publish && f.file_id == file.file_id)
        };
        // Each operation belongs to exactly one file, even when ids repeat across packages.
        let mut placed = vec![false; operations.len()];
        let mut new_operations = Vec::new();
        for file in &document.documents {
            for operation_id in &file.operation_ids {
                let Some(index) = (0..operations.len())
                    .find(|&i| !placed[i] && &operations[i].operation_id == operation_id)
                else {
                    continue;
                };
                placed[index] = true;
                if is_selected(file) {
                    let mut new_op = NewOperation::from(&operations[index]);
                    new_op.document_slug = file.slug.clone();
                    new_operations.push(new_op);
                }
            }
        }
        let selected: Vec<&TransformedFile> = document.documents.iter().filter(|file| is_selected(file)).collect();
        let files = selected
            .into_iter()
            .map(|file| PublishFile {
                file_id: file.file_id.clone(),
                slug: file.slug.clone(),
                title: file.title.clone(),
                api_type: group.api_type.clone(),
                format: file.format.clone(),
                content: String::from_utf8_lossy(&file.data).into_owned(),
            })
            .collect();
        Ok((files, new_operations))
    }

    async fn revision_sources(&self, config: &BuildConfig) -> CatalogResult<(Vec<PublishFile>, Vec<NewOperation>)> {
        let revision = resolve_revision(self.store.as_ref(), &config.package_id, &config.version).await?;
        let documents = self
            .store
            .list_documents(&config.package_id, &revision.version, revision.revision)
            .await?;
        let files = documents
            .into_iter()
            .filter(|d| {
                config.files.is_empty()
                    || config.files.iter().any(|f| f.publish && f.file_id == d.file_id)
            })
            .map(|d| PublishFile {
                content: String::from_utf8_lossy(&d.data).into_owned(),
                file_id: d.file_id,
                slug: d.slug,
                title: d.title,
                api_type: d.api_type,
                format: d.format,
            })
            .collect::<Vec<_>>();
        let operations = self
            .store
            .list_operations(&config.package_id, &revision.version, revision.revision)
            .await?
            .iter()
            .filter(|op| files.iter().any(|f| f.slug == op.document_slug))
            .map(NewOperation::from)
            .collect();
        Ok((files, operations))
    }
}

/// Polling workers that claim queued builds and run them.
pub struct BuildWorkerPool<S: Store> {
    store: Arc<S>,
    processor: BuildProcessor<S>,
    workers: usize,
    poll_interval: Duration,
    lease: Duration,
}

impl<S: Store> Clone for BuildWorkerPool<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            processor: self.processor.clone(),
            workers: self.workers,
            poll_interval: self.poll_interval,
            lease: self.lease,
        }
    }
}

impl<S: Store + 'static> BuildWorkerPool<S> {
    pub fn new(
        store: Arc<S>,
        processor: BuildProcessor<S>,
        workers: usize,
        poll_interval: Duration,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            processor,
            workers: workers.max(1),
            poll_interval,
            lease,
        }
    }

    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|n| {
                let pool = self.clone();
                let cancel = cancel.clone();
                let worker_id = format!("worker-{}-{}", std::process::id(), n);
                tokio::spawn(async move {
                    log::info!("Build worker {} started", worker_id);
                    let mut ticker = tokio::time::interval(pool.poll_interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                pool.run_pending(&worker_id).await;
                            }
                        }
                    }
                    log::info!("Build worker {} stopped", worker_id);
                })
            })
            .collect()
    }

    /// Queue again the running builds whose worker stopped sending heartbeats.
    pub async fn requeue_stale(&self) -> usize {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::zero());
        match self.store.requeue_stale_builds(Utc::now() - lease).await {
            Ok(ids) => {
                for id in &ids {
                    log::warn!("Build {} lost its worker, queued again", id);
                }
                ids.len()
            }
            Err(e) => {
                log::error!("Failed to requeue stale builds: {:#}", e);
                0
            }
        }
    }

    /// Run one build while extending its lease every third of the lease period.
    async fn process_leased(&self, worker_id: &str, build: &Build) -> CatalogResult<()> {
        let work = self.processor.process(build);
        tokio::pin!(work);
        let mut heartbeat = tokio::time::interval((self.lease / 3).max(Duration::from_millis(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.store.heartbeat_build(&build.build_id, worker_id).await {
                        log::warn!("Worker {} failed to extend lease of build {}: {:#}", worker_id, build.build_id, e);
                    }
                }
            }
        }
    }

    /// Claim and run builds until the queue is empty. Returns the number run.
    pub async fn run_pending(&self, worker_id: &str) -> usize {
        self.requeue_stale().await;
        let mut processed = 0;
        loop {
            let build = match self.store.claim_next_build(worker_id).await {
                Ok(Some(build)) => build,
                Ok(None) => break,
                Err(e) => {
                    log::error!("Worker {} failed to claim a build: {:#}", worker_id, e);
                    break;
                }
            };
            log::debug!("Worker {} claimed build {}", worker_id, build.build_id);
            if let Err(e) = self.process_leased(worker_id, &build).await {
                log::error!("Worker {} could not record build {}: {}", worker_id, build.build_id, e);
            }
            processed += 1;
        }
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::logic::activity::ActivityTracker;
    use crate::logic::archive::unpack_tar_gz;
    use crate::logic::authorization::Authorization;
    use crate::logic::background::BackgroundExecutor;
    use crate::model::{
        BuildFormat, BuildStatus, GroupWrite, GroupedOperation, Package, PackageKind, PublishTarget,
        VersionStatus, ROLE_VIEWER,
    };
    use crate::storage::ObjectStorage;
    use crate::store::MemoryStore;
    use crate::store::traits::*;

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

    struct Fixture {
        store: Arc<MemoryStore>,
        builds: BuildController<MemoryStore>,
        pool: BuildWorkerPool<MemoryStore>,
        cache: Arc<TransformedDocumentCache>,
        versions: VersionService<MemoryStore>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.insert_package(package("acme", PackageKind::Workspace)).await.unwrap();
        store.insert_package(package("acme.gw", PackageKind::Package)).await.unwrap();
        store.insert_package(package("acme.users", PackageKind::Package)).await.unwrap();
        let config = Arc::new(AppConfig::default());
        let background = BackgroundExecutor::new(2);
        let activity = ActivityTracker::new(store.clone(), background);
        let auth = Authorization::new(store.clone(), activity.clone());
        let cache = Arc::new(TransformedDocumentCache::new());
        let storage = Arc::new(ObjectStorage::new(store.clone()));
        let builds = BuildController::new(store.clone(), storage.clone(), config.clone());
        let versions = VersionService::new(store.clone(), storage, config, auth, activity, cache.clone());
        let processor = BuildProcessor::new(store.clone(), builds.clone(), versions.clone(), cache.clone());
        let pool = BuildWorkerPool::new(store.clone(), processor, 1, Duration::from_millis(10), Duration::from_secs(60));

        let operations = ["get-users", "post-users", "get-orders"]
            .iter()
            .map(|id| {
                serde_json::from_value::<NewOperation>(serde_json::json!({
                    "operationId": id,
                    "title": id,
                    "method": if id.starts_with("post") { "post" } else { "get" },
                    "path": format!("/{}", id.split('-').nth(1).unwrap_or_default()),
                    "documentSlug": "openapi",
                }))
                .unwrap()
            })
            .collect();
        let request = PublishRequest {
            package_id: "acme.gw".to_string(),
            version: "2025.1".to_string(),
            status: VersionStatus::Draft,
            previous_version: None,
            previous_version_package_id: None,
            labels: vec![],
            files: vec![PublishFile {
                file_id: "openapi.json".to_string(),
                slug: "openapi".to_string(),
                title: "Gateway".to_string(),
                api_type: "rest".to_string(),
                format: "json".to_string(),
                content: r#"{"openapi":"3.0.0","info":{"title":"Gateway"}}"#.to_string(),
            }],
            operations,
            refs: vec![],
            changes: None,
            publish_id: None,
        };
        let gw = store.get_package("acme.gw").await.unwrap().unwrap();
        versions.publish_as(&gw, request, "root").await.unwrap();

        write_group(
            &store,
            "users",
            &[("acme.gw", "2025.1", "get-users"), ("acme.gw", "2025.1", "post-users")],
        )
        .await;
        Fixture {
            store,
            builds,
            pool,
            cache,
            versions,
        }
    }

    /// Group `name` on acme.gw 2025.1@1 holding the given (package, version, operation) members.
    async fn write_group(store: &MemoryStore, name: &str, members: &[(&str, &str, &str)]) {
        let mut group = OperationGroup::new("acme.gw", "2025.1", 1, "rest", name, false);
        group.operations_count = members.len();
        let group_id = group.group_id.clone();
        let operations = members
            .iter()
            .map(|(package_id, version, operation_id)| GroupedOperation {
                group_id: group_id.clone(),
                package_id: package_id.to_string(),
                version: version.to_string(),
                revision: 1,
                operation_id: operation_id.to_string(),
            })
            .collect();
        store
            .write_group(
                GroupWrite {
                    group,
                    template: None,
                    operations: Some(operations),
                    history: vec![],
                },
                None,
            )
            .await
            .unwrap();
    }

    /// acme.users 1.0 carrying its own `get-users`.
    async fn publish_users_release(f: &Fixture) {
        let request: PublishRequest = serde_json::from_value(serde_json::json!({
            "packageId": "acme.users",
            "version": "1.0",
            "status": "draft",
            "files": [{
                "fileId": "users.json",
                "slug": "users",
                "title": "Users",
                "content": "{\"openapi\":\"3.0.0\"}"
            }],
            "operations": [
                {"operationId": "get-users", "title": "List members", "method": "get", "path": "/members", "documentSlug": "users"}
            ]
        }))
        .unwrap();
        let users = f.store.get_package("acme.users").await.unwrap().unwrap();
        f.versions.publish_as(&users, request, "root").await.unwrap();
    }

    #[tokio::test]
    async fn test_group_export_reduced_and_merged() {
        let f = fixture().await;
        let mut reduced = BuildConfig::new("acme.gw", "2025.1@1", BuildType::ExportRestOperationsGroup, BuildFormat::Yaml);
        reduced.group_name = Some("users".to_string());
        reduced.transformation = Some(Transformation::ReducedSource);
        let mut merged = reduced.clone();
        merged.transformation = Some(Transformation::Merged);
        let reduced_id = f.builds.create_build(reduced).await.unwrap();
        let merged_id = f.builds.create_build(merged).await.unwrap();

        assert_eq!(f.pool.run_pending("w1").await, 2);

        let (build, result) = f.builds.get_export_result(&reduced_id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Complete);
        let result = result.unwrap();
        assert_eq!(result.filename, "acme_gw_2025.1@1_users.tar.gz");
        let names: Vec<String> = unpack_tar_gz(&result.data).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["get-users.yaml", "post-users.yaml"]);

        let (_, merged) = f.builds.get_export_result(&merged_id).await.unwrap();
        let files = unpack_tar_gz(&merged.unwrap().data).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "users.yaml");
    }

    #[tokio::test]
    async fn test_dashboard_group_export_keeps_shared_operation_ids_apart() {
        let f = fixture().await;
        publish_users_release(&f).await;
        write_group(
            &f.store,
            "dashboard",
            &[("acme.gw", "2025.1", "get-users"), ("acme.users", "1.0", "get-users")],
        )
        .await;
        let mut config = BuildConfig::new("acme.gw", "2025.1@1", BuildType::ExportRestOperationsGroup, BuildFormat::Json);
        config.group_name = Some("dashboard".to_string());
        config.transformation = Some(Transformation::ReducedSource);
        let id = f.builds.create_build(config).await.unwrap();
        f.pool.run_pending("w1").await;

        let (build, result) = f.builds.get_export_result(&id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Complete);
        let files = unpack_tar_gz(&result.unwrap().data).unwrap();
        let names: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["get-users-acme-gw.json", "get-users-acme-users.json"]);
        let members: serde_json::Value = serde_json::from_slice(&files[1].1).unwrap();
        assert!(members["paths"].get("/members").is_some());
    }

    #[tokio::test]
    async fn test_version_and_document_export() {
        let f = fixture().await;
        let version = f
            .builds
            .create_build(BuildConfig::new("acme.gw", "2025.1", BuildType::ExportVersion, BuildFormat::Yaml))
            .await
            .unwrap();
        let mut document = BuildConfig::new("acme.gw", "2025.1@1", BuildType::ExportRestDocument, BuildFormat::Json);
        document.document_id = Some("missing".to_string());
        let missing = f.builds.create_build(document).await.unwrap();
        f.pool.run_pending("w1").await;

        let (_, result) = f.builds.get_export_result(&version).await.unwrap();
        let files = unpack_tar_gz(&result.unwrap().data).unwrap();
        assert_eq!(files[0].0, "openapi.yaml");
        assert!(String::from_utf8(files[0].1.clone()).unwrap().contains("openapi:"));

        let failed = f.builds.get_build(&missing).await.unwrap();
        assert_eq!(failed.status, BuildStatus::Error);
        assert!(failed.details.contains("missing"));
    }

    #[tokio::test]
    async fn test_group_build_publishes_and_caches() {
        let f = fixture().await;
        let mut config = BuildConfig::new("acme.gw", "2025.1@1", BuildType::Build, BuildFormat::Json);
        config.api_type = Some("rest".to_string());
        config.group_name = Some("users".to_string());
        config.created_by = "alice".to_string();
        config.publish_target = Some(PublishTarget {
            package_id: "acme.users".to_string(),
            version: "1.0".to_string(),
            status: VersionStatus::Draft,
            previous_version: None,
            previous_version_package_id: None,
            labels: vec!["from-group".to_string()],
        });
        let id = f.builds.create_build(config).await.unwrap();
        f.pool.run_pending("w1").await;
        assert_eq!(f.builds.get_build(&id).await.unwrap().status, BuildStatus::Complete);

        let revision = f.store.get_latest_revision("acme.users", "1.0").await.unwrap().unwrap();
        assert_eq!(revision.created_by, "alice");
        assert_eq!(revision.labels, vec!["from-group"]);
        let operations = f.store.list_operations("acme.users", "1.0", 1).await.unwrap();
        let ids: Vec<&str> = operations.iter().map(|o| o.operation_id.as_str()).collect();
        assert_eq!(ids, vec!["get-users", "post-users"]);
        assert!(operations.iter().all(|o| o.document_slug == o.operation_id));
        assert_eq!(f.cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_running_build_is_reclaimed() {
        let f = fixture().await;
        let id = f
            .builds
            .create_build(BuildConfig::new("acme.gw", "2025.1", BuildType::ExportVersion, BuildFormat::Json))
            .await
            .unwrap();
        let orphan = f.store.claim_next_build("worker-gone").await.unwrap().unwrap();
        assert_eq!(orphan.build_id, id);

        assert_eq!(f.pool.run_pending("w1").await, 0);
        assert_eq!(f.builds.get_build(&id).await.unwrap().status, BuildStatus::Running);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let short_lease = BuildWorkerPool {
            lease: Duration::from_millis(1),
            ..f.pool.clone()
        };
        assert_eq!(short_lease.run_pending("w1").await, 1);
        let build = f.builds.get_build(&id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Complete);
        assert_eq!(build.worker_id.as_deref(), Some("w1"));
        assert!(!f.store.heartbeat_build(&id, "worker-gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_workers_stop_on_cancel() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let handles = f.pool.start(cancel.clone());
        let id = f
            .builds
            .create_build(BuildConfig::new("acme.gw", "2025.1", BuildType::ExportVersion, BuildFormat::Json))
            .await
            .unwrap();
        let build = f
            .builds
            .await_completion(&id, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(build.status, BuildStatus::Complete);
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
