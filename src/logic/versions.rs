use chrono::Utc;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::config::AppConfig;
use crate::error::{codes, CatalogError, CatalogResult};
use crate::logic::activity::ActivityTracker;
use crate::logic::archive::pack_tar_gz;
use crate::logic::authorization::Authorization;
use crate::logic::comparison::{compare_operations, previous_revision_of};
use crate::logic::groups::recalculate_autogenerated_groups;
use crate::model::{
    comparison_id, format_version_key, generate_id, sha256_hex, ActivityEvent, DocumentSummary,
    EventType, Id, Operation, Package, Permission, Principal, PublishRequest, PublishedDocument,
    Revision, VersionComparison, VersionListFilter, VersionPatch, VersionRef, VersionReference,
    VersionStatus, VersionView,
};
use crate::storage::{ObjectStorage, PUBLISHED_SOURCES_TABLE};
use crate::store::traits::{NewRevision, Store};
use crate::store::TransformedDocumentCache;

/// Resolve `name` or `name@N` to a live revision.
pub async fn resolve_revision<S: Store>(store: &S, package_id: &str, raw: &str) -> CatalogResult<Revision> {
    let reference = VersionRef::parse(raw)?;
    match reference.revision {
        None => store
            .get_latest_revision(package_id, &reference.name)
            .await?
            .ok_or_else(|| CatalogError::version_not_found(package_id, raw)),
        Some(revision) => {
            let found = store
                .get_revision(package_id, &reference.name, revision)
                .await?
                .filter(|r| !r.is_deleted());
            match found {
                Some(found) => Ok(found),
                None if store.get_latest_revision(package_id, &reference.name).await?.is_none() => {
                    Err(CatalogError::version_not_found(package_id, raw))
                }
                None => Err(CatalogError::not_found(
                    codes::REVISION_NOT_FOUND,
                    format!("Revision {} of version '{}' not found", revision, reference.name),
                )
                .with_param("packageId", package_id)
                .with_param("version", raw)),
            }
        }
    }
}

/// `defaultReleaseVersion@latest` when set, else the newest release, else the
/// newest draft.
pub async fn resolve_default_version<S: Store>(store: &S, package: &Package) -> CatalogResult<Option<String>> {
    if !package.default_release_version.is_empty() {
        if let Some(latest) = store
            .get_latest_revision(&package.id, &package.default_release_version)
            .await?
        {
            return Ok(Some(latest.key()));
        }
    }
    let versions = store.list_versions(&package.id).await?;
    let newest = |status: VersionStatus| {
        versions
            .iter()
            .filter(|r| r.status == status)
            .max_by_key(|r| r.published_at)
            .map(|r| r.key())
    };
    Ok(newest(VersionStatus::Release).or_else(|| newest(VersionStatus::Draft)))
}

fn validate_version_name(name: &str) -> CatalogResult<()> {
    if name.trim().is_empty() {
        return Err(CatalogError::empty_param("version"));
    }
    if name.contains('@') {
        return Err(CatalogError::validation(
            codes::INVALID_VERSION_NAME,
            format!("Version name '{}' must not contain '@'", name),
        )
        .with_param("version", name));
    }
    Ok(())
}

/// Compiled release-version patterns keyed by their source text.
#[derive(Default)]
struct PatternCache {
    compiled: RwLock<HashMap<String, Regex>>,
}

impl PatternCache {
    fn get(&self, pattern: &str) -> Result<Regex, regex::Error> {
        if let Some(re) = self.compiled.read().ok().and_then(|c| c.get(pattern).cloned()) {
            return Ok(re);
        }
        let re = Regex::new(pattern)?;
        if let Ok(mut compiled) = self.compiled.write() {
            compiled.insert(pattern.to_string(), re.clone());
        }
        Ok(re)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.compiled.read().map(|c| c.len()).unwrap_or_default()
    }
}

/// Version/revision store: publication and read models of revisions.
pub struct VersionService<S: Store> {
    store: Arc<S>,
    storage: Arc<ObjectStorage<S>>,
    config: Arc<AppConfig>,
    auth: Authorization<S>,
    activity: ActivityTracker<S>,
    cache: Arc<TransformedDocumentCache>,
    patterns: Arc<PatternCache>,
}

impl<S: Store> Clone for VersionService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            storage: self.storage.clone(),
            config: self.config.clone(),
            auth: self.auth.clone(),
            activity: self.activity.clone(),
            cache: self.cache.clone(),
            patterns: self.patterns.clone(),
        }
    }
}

impl<S: Store + 'static> VersionService<S> {
    pub fn new(
        store: Arc<S>,
        storage: Arc<ObjectStorage<S>>,
        config: Arc<AppConfig>,
        auth: Authorization<S>,
        activity: ActivityTracker<S>,
        cache: Arc<TransformedDocumentCache>,
    ) -> Self {
        Self {
            store,
            storage,
            config,
            auth,
            activity,
            cache,
            patterns: Arc::new(PatternCache::default()),
        }
    }

    fn check_release_pattern(&self, package: &Package, version: &str) -> CatalogResult<()> {
        let pattern = if package.release_version_pattern.is_empty() {
            self.config.catalog.release_version_pattern.as_str()
        } else {
            package.release_version_pattern.as_str()
        };
        if pattern.is_empty() {
            return Ok(());
        }
        let re = self.patterns.get(pattern).map_err(|e| {
            CatalogError::validation(codes::INVALID_RELEASE_VERSION_PATTERN, e.to_string())
                .with_param("pattern", pattern)
        })?;
        if !re.is_match(version) {
            return Err(CatalogError::validation(
                codes::RELEASE_VERSION_DOESNT_MATCH_PATTERN,
                format!(
                    "Release version '{}' does not match pattern '{}'",
                    version, pattern
                ),
            )
            .with_param("version", version)
            .with_param("pattern", pattern));
        }
        Ok(())
    }

    /// Publish a new revision after checking the caller may manage versions
    /// of the requested status.
    pub async fn publish(&self, principal: &Principal, request: PublishRequest) -> CatalogResult<Revision> {
        let package = self
            .auth
            .check_package(
                principal,
                &request.package_id,
                Permission::for_version_status(request.status),
            )
            .await?;
        for reference in &request.refs {
            let target = self
                .store
                .get_package(&reference.package_id)
                .await?
                .filter(|p| !p.is_deleted())
                .ok_or_else(|| CatalogError::package_not_found(&reference.package_id))?;
            self.auth.check(principal, &target, Permission::Read).await?;
        }
        self.publish_as(&package, request, principal.actor_id()).await
    }

    /// Publication without permission checks, for builds already authorized
    /// when they were requested.
    pub async fn publish_as(
        &self,
        package: &Package,
        request: PublishRequest,
        author: &str,
    ) -> CatalogResult<Revision> {
        if !package.kind.holds_versions() {
            return Err(CatalogError::validation(
                codes::INVALID_PACKAGE_KIND,
                format!("Package '{}' is a {} and cannot hold versions", package.id, package.kind),
            )
            .with_param("packageId", &package.id));
        }
        validate_version_name(&request.version)?;
        if request.status == VersionStatus::Release {
            self.check_release_pattern(package, &request.version)?;
        }

        let file_limit = self.config.publish_file_size_limit();
        for file in &request.files {
            if file.content.len() as u64 > file_limit {
                return Err(CatalogError::validation(
                    codes::PUBLISH_FILE_SIZE_EXCEEDED,
                    format!(
                        "File '{}' exceeds the publish file size limit of {} bytes",
                        file.file_id, file_limit
                    ),
                )
                .with_param("fileId", &file.file_id)
                .with_param("limit", file_limit));
            }
        }

        let references = self.resolve_references(package, &request).await?;
        let previous = self.resolve_previous(package, &request).await?;

        let entries: Vec<(String, Vec<u8>)> = request
            .files
            .iter()
            .map(|f| (f.file_id.clone(), f.content.as_bytes().to_vec()))
            .collect();
        let archive = pack_tar_gz(&entries)?;
        let archive_limit = self.config.publish_archive_size_limit();
        if archive.len() as u64 > archive_limit {
            return Err(CatalogError::validation(
                codes::PUBLISH_ARCHIVE_SIZE_EXCEEDED,
                format!("Publish archive exceeds the limit of {} bytes", archive_limit),
            )
            .with_param("limit", archive_limit));
        }
        let publish_id = request.publish_id.clone().unwrap_or_else(generate_id);
        self.storage
            .put_file(PUBLISHED_SOURCES_TABLE, &publish_id, &archive)
            .await?;

        // later entries win on duplicate (apiType, operationId)
        let mut operations: BTreeMap<(String, String), Operation> = BTreeMap::new();
        for op in request.operations {
            let operation = op.into_operation(&package.id, &request.version, 0);
            operations.insert(
                (operation.api_type.clone(), operation.operation_id.clone()),
                operation,
            );
        }
        let operations: Vec<Operation> = operations.into_values().collect();

        let documents = request
            .files
            .iter()
            .map(|file| {
                let slug = if file.slug.is_empty() {
                    slugify_file(&file.file_id)
                } else {
                    file.slug.clone()
                };
                PublishedDocument {
                    package_id: package.id.clone(),
                    version: request.version.clone(),
                    revision: 0,
                    file_id: file.file_id.clone(),
                    title: if file.title.is_empty() {
                        file.file_id.clone()
                    } else {
                        file.title.clone()
                    },
                    api_type: file.api_type.clone(),
                    format: file.format.clone(),
                    checksum: sha256_hex(file.content.as_bytes()),
                    operation_ids: operations
                        .iter()
                        .filter(|op| op.document_slug == slug)
                        .map(|op| op.operation_id.clone())
                        .collect(),
                    slug,
                    data: file.content.as_bytes().to_vec(),
                }
            })
            .collect();

        let revision = self
            .store
            .insert_revision(NewRevision {
                revision: Revision {
                    package_id: package.id.clone(),
                    version: request.version.clone(),
                    revision: 0,
                    status: request.status,
                    previous_version: request.previous_version.clone(),
                    previous_version_package_id: request.previous_version_package_id.clone(),
                    labels: request.labels.clone(),
                    published_at: Utc::now(),
                    created_by: author.to_string(),
                    publish_id: Some(publish_id.clone()),
                    deleted_at: None,
                    deleted_by: None,
                },
                documents,
                operations: operations.clone(),
                references,
            })
            .await?;
        log::info!(
            "Published {} of '{}' (publish {}, {} operations)",
            revision.key(),
            package.id,
            publish_id,
            operations.len()
        );

        let previous = match previous {
            Some(previous) => Some(previous),
            None => previous_revision_of(self.store.as_ref(), &revision).await?,
        };
        if let Some(previous) = previous {
            let changes = match request.changes {
                Some(changes) => changes,
                None => {
                    let before = self
                        .store
                        .list_operations(&previous.package_id, &previous.version, previous.revision)
                        .await?;
                    compare_operations(&before, &operations)
                }
            };
            self.store
                .put_comparison(VersionComparison {
                    comparison_id: comparison_id(
                        &revision.package_id,
                        &revision.version,
                        revision.revision,
                        &previous.package_id,
                        &previous.version,
                        previous.revision,
                    ),
                    package_id: revision.package_id.clone(),
                    version: revision.version.clone(),
                    revision: revision.revision,
                    previous_package_id: previous.package_id.clone(),
                    previous_version: previous.version.clone(),
                    previous_revision: previous.revision,
                    no_content: changes.is_empty(),
                    changes,
                    created_at: Utc::now(),
                })
                .await?;
        }

        if let Err(e) = recalculate_autogenerated_groups(
            self.store.as_ref(),
            &self.cache,
            package,
            &revision,
            self.config.limits.operation_group_operations_limit,
        )
        .await
        {
            log::warn!(
                "Autogenerated groups of {} in '{}' not calculated: {}",
                revision.key(),
                package.id,
                e
            );
        }

        let event_type = if revision.revision == 1 {
            EventType::PublishNewVersion
        } else {
            EventType::PublishNewRevision
        };
        self.activity.track(ActivityEvent::for_version(
            event_type,
            &package.id,
            author,
            &revision.version,
            revision.revision,
            serde_json::json!({ "status": revision.status.as_str(), "publishId": publish_id }),
        ));
        Ok(revision)
    }

    async fn resolve_references(
        &self,
        package: &Package,
        request: &PublishRequest,
    ) -> CatalogResult<Vec<VersionReference>> {
        let mut references = Vec::with_capacity(request.refs.len());
        for reference in &request.refs {
            if reference.package_id == package.id {
                return Err(reference_cycle(&package.id, &reference.package_id));
            }
            let target = resolve_revision(self.store.as_ref(), &reference.package_id, &reference.version).await?;
            self.ensure_acyclic(&package.id, &target).await?;
            references.push(VersionReference {
                package_id: package.id.clone(),
                version: request.version.clone(),
                revision: 0,
                ref_package_id: target.package_id,
                ref_version: target.version,
                ref_revision: target.revision,
                excluded: reference.excluded,
            });
        }
        Ok(references)
    }

    /// Walk the references reachable from `start`; reaching `owner` again
    /// would close a cycle.
    async fn ensure_acyclic(&self, owner: &str, start: &Revision) -> CatalogResult<()> {
        let mut visited: HashSet<(Id, String, i32)> = HashSet::new();
        let mut stack = vec![(start.package_id.clone(), start.version.clone(), start.revision)];
        while let Some((package_id, version, revision)) = stack.pop() {
            if !visited.insert((package_id.clone(), version.clone(), revision)) {
                continue;
            }
            for next in self.store.list_references(&package_id, &version, revision).await? {
                if next.ref_package_id == owner {
                    return Err(reference_cycle(owner, &start.package_id));
                }
                stack.push((next.ref_package_id, next.ref_version, next.ref_revision));
            }
        }
        Ok(())
    }

    async fn resolve_previous(
        &self,
        package: &Package,
        request: &PublishRequest,
    ) -> CatalogResult<Option<Revision>> {
        let Some(previous_version) = request.previous_version.as_deref().filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let previous_package = request
            .previous_version_package_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&package.id);
        resolve_revision(self.store.as_ref(), previous_package, previous_version)
            .await
            .map(Some)
    }

    async fn view(&self, revision: Revision) -> CatalogResult<VersionView> {
        let latest = self
            .store
            .get_latest_revision(&revision.package_id, &revision.version)
            .await?
            .map(|r| r.revision)
            .unwrap_or(revision.revision);
        let operations = self
            .store
            .list_operations(&revision.package_id, &revision.version, revision.revision)
            .await?;
        let mut operation_types: BTreeMap<String, usize> = BTreeMap::new();
        for op in &operations {
            *operation_types.entry(op.api_type.clone()).or_insert(0) += 1;
        }
        let documents = self
            .store
            .list_documents(&revision.package_id, &revision.version, revision.revision)
            .await?
            .iter()
            .map(summarize)
            .collect();
        Ok(VersionView {
            package_id: revision.package_id,
            version: revision.version,
            revision: revision.revision,
            status: revision.status,
            latest_revision: latest,
            not_latest_revision: revision.revision != latest,
            previous_version: revision.previous_version,
            previous_version_package_id: revision.previous_version_package_id,
            labels: revision.labels,
            published_at: revision.published_at,
            created_by: revision.created_by,
            documents,
            operation_types,
        })
    }

    pub async fn get_version(&self, principal: &Principal, package_id: &str, raw: &str) -> CatalogResult<VersionView> {
        self.auth.check_package(principal, package_id, Permission::Read).await?;
        let revision = resolve_revision(self.store.as_ref(), package_id, raw).await?;
        self.view(revision).await
    }

    pub async fn get_default_version(&self, principal: &Principal, package_id: &str) -> CatalogResult<Option<String>> {
        let package = self
            .auth
            .check_package(principal, package_id, Permission::Read)
            .await?;
        resolve_default_version(self.store.as_ref(), &package).await
    }

    /// Status and labels apply to the latest revision. Both the old and the
    /// new status must be manageable by the caller.
    pub async fn patch_version(
        &self,
        principal: &Principal,
        package_id: &str,
        raw: &str,
        patch: VersionPatch,
    ) -> CatalogResult<VersionView> {
        let mut package = self
            .auth
            .check_package(principal, package_id, Permission::Read)
            .await?;
        let reference = VersionRef::parse(raw)?;
        let latest = resolve_revision(self.store.as_ref(), package_id, &reference.name).await?;
        self.auth
            .check(principal, &package, Permission::for_version_status(latest.status))
            .await?;

        let status = patch.status.unwrap_or(latest.status);
        if status != latest.status {
            self.auth
                .check(principal, &package, Permission::for_version_status(status))
                .await?;
            if status == VersionStatus::Release {
                self.check_release_pattern(&package, &latest.version)?;
            }
        }
        let labels = patch.labels.clone().unwrap_or_else(|| latest.labels.clone());
        self.store
            .update_revision_meta(package_id, &latest.version, latest.revision, status, labels)
            .await?;

        if status != VersionStatus::Release && package.default_release_version == latest.version {
            package.default_release_version = String::new();
            self.store.update_package(package).await?;
            log::info!(
                "Default release of '{}' cleared after {} became {}",
                package_id,
                latest.version,
                status
            );
        }
        self.activity.track(ActivityEvent::for_version(
            EventType::PatchVersionMeta,
            package_id,
            principal.actor_id(),
            &latest.version,
            latest.revision,
            serde_json::json!({
                "versionMeta": {
                    "status": patch.status.map(|s| s.as_str()),
                    "labels": patch.labels,
                }
            }),
        ));
        let updated = resolve_revision(self.store.as_ref(), package_id, &latest.key()).await?;
        self.view(updated).await
    }

    pub async fn delete_version(&self, principal: &Principal, package_id: &str, version: &str) -> CatalogResult<()> {
        let mut package = self
            .auth
            .check_package(principal, package_id, Permission::Read)
            .await?;
        let reference = VersionRef::parse(version)?;
        let latest = resolve_revision(self.store.as_ref(), package_id, &reference.name).await?;
        self.auth
            .check(principal, &package, Permission::for_version_status(latest.status))
            .await?;
        self.store
            .delete_version(package_id, &latest.version, principal.actor_id(), Utc::now())
            .await?;
        if package.default_release_version == latest.version {
            package.default_release_version = String::new();
            self.store.update_package(package).await?;
        }
        log::info!("Version '{}' of '{}' deleted", latest.version, package_id);
        self.activity.track(ActivityEvent::for_version(
            EventType::DeleteVersion,
            package_id,
            principal.actor_id(),
            &latest.version,
            latest.revision,
            serde_json::json!({}),
        ));
        Ok(())
    }

    /// Latest revision of every version, newest publication first.
    pub async fn list_versions(
        &self,
        principal: &Principal,
        package_id: &str,
        filter: &VersionListFilter,
    ) -> CatalogResult<Vec<VersionView>> {
        self.auth.check_package(principal, package_id, Permission::Read).await?;
        let text = filter.text_filter.as_deref().map(str::to_lowercase);
        let mut versions: Vec<Revision> = self
            .store
            .list_versions(package_id)
            .await?
            .into_iter()
            .filter(|r| filter.status.map(|s| s == r.status).unwrap_or(true))
            .filter(|r| {
                filter
                    .label
                    .as_ref()
                    .map(|l| r.labels.contains(l))
                    .unwrap_or(true)
            })
            .filter(|r| {
                text.as_ref()
                    .map(|t| r.version.to_lowercase().contains(t))
                    .unwrap_or(true)
            })
            .collect();
        versions.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        let mut views = Vec::new();
        for revision in filter.paging.apply(versions) {
            views.push(self.view(revision).await?);
        }
        Ok(views)
    }

    pub async fn list_revisions(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
    ) -> CatalogResult<Vec<Revision>> {
        self.auth.check_package(principal, package_id, Permission::Read).await?;
        let revisions = self.store.list_revisions(package_id, version).await?;
        if revisions.is_empty() {
            return Err(CatalogError::version_not_found(package_id, version));
        }
        Ok(revisions.into_iter().rev().collect())
    }

    pub async fn list_documents(
        &self,
        principal: &Principal,
        package_id: &str,
        raw: &str,
    ) -> CatalogResult<Vec<DocumentSummary>> {
        self.auth.check_package(principal, package_id, Permission::Read).await?;
        let revision = resolve_revision(self.store.as_ref(), package_id, raw).await?;
        Ok(self
            .store
            .list_documents(package_id, &revision.version, revision.revision)
            .await?
            .iter()
            .map(summarize)
            .collect())
    }

    pub async fn get_document(
        &self,
        principal: &Principal,
        package_id: &str,
        raw: &str,
        slug: &str,
    ) -> CatalogResult<PublishedDocument> {
        self.auth.check_package(principal, package_id, Permission::Read).await?;
        let revision = resolve_revision(self.store.as_ref(), package_id, raw).await?;
        self.store
            .list_documents(package_id, &revision.version, revision.revision)
            .await?
            .into_iter()
            .find(|d| d.slug == slug)
            .ok_or_else(|| {
                CatalogError::not_found(
                    codes::DOCUMENT_NOT_FOUND,
                    format!("Document '{}' not found in {}", slug, revision.key()),
                )
                .with_param("slug", slug)
                .with_param("version", revision.key())
            })
    }

    pub async fn list_references(
        &self,
        principal: &Principal,
        package_id: &str,
        raw: &str,
    ) -> CatalogResult<Vec<VersionReference>> {
        self.auth.check_package(principal, package_id, Permission::Read).await?;
        let revision = resolve_revision(self.store.as_ref(), package_id, raw).await?;
        Ok(self
            .store
            .list_references(package_id, &revision.version, revision.revision)
            .await?)
    }

    /// Source archive the revision was published from.
    pub async fn get_sources(&self, principal: &Principal, package_id: &str, raw: &str) -> CatalogResult<Vec<u8>> {
        self.auth.check_package(principal, package_id, Permission::Read).await?;
        let revision = resolve_revision(self.store.as_ref(), package_id, raw).await?;
        let publish_id = revision.publish_id.clone().unwrap_or_default();
        self.storage
            .get_file(PUBLISHED_SOURCES_TABLE, &publish_id)
            .await?
            .ok_or_else(|| {
                CatalogError::not_found(
                    codes::PUBLISH_NOT_FOUND,
                    format!("Sources of {} are not available", revision.key()),
                )
                .with_param("version", format_version_key(&revision.version, revision.revision))
            })
    }

    /// Distinct labels across the versions of a package.
    pub async fn list_labels(&self, principal: &Principal, package_id: &str) -> CatalogResult<Vec<String>> {
        self.auth.check_package(principal, package_id, Permission::Read).await?;
        let labels: BTreeSet<String> = self
            .store
            .list_versions(package_id)
            .await?
            .into_iter()
            .flat_map(|r| r.labels)
            .collect();
        Ok(labels.into_iter().collect())
    }
}

fn summarize(document: &PublishedDocument) -> DocumentSummary {
    DocumentSummary {
        file_id: document.file_id.clone(),
        slug: document.slug.clone(),
        title: document.title.clone(),
        api_type: document.api_type.clone(),
        format: document.format.clone(),
        operation_count: document.operation_ids.len(),
    }
}

fn slugify_file(file_id: &str) -> String {
    let stem = file_id.rsplit('/').next().unwrap_or(file_id);
    let stem = stem.split('.').next().unwrap_or(stem);
    stem.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

fn reference_cycle(owner: &str, target: &str) -> CatalogError {
    CatalogError::validation(
        codes::REFERENCE_CYCLE,
        format!("Reference from '{}' to '{}' would create a cycle", owner, target),
    )
    .with_param("packageId", owner)
    .with_param("refPackageId", target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::background::BackgroundExecutor;
    use crate::model::{NewOperation, PackageKind, PublishFile, PublishRef, ROLE_VIEWER};
    use crate::store::MemoryStore;
    use crate::store::traits::*;

    struct Fixture {
        store: Arc<MemoryStore>,
        versions: VersionService<MemoryStore>,
        root: Principal,
    }

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

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.add_sysadmin("root").await.unwrap();
        store.insert_package(package("acme", PackageKind::Workspace)).await.unwrap();
        store.insert_package(package("acme.pay", PackageKind::Group)).await.unwrap();
        store.insert_package(package("acme.pay.gw", PackageKind::Package)).await.unwrap();
        store.insert_package(package("acme.dash", PackageKind::Dashboard)).await.unwrap();
        let background = BackgroundExecutor::new(2);
        let activity = ActivityTracker::new(store.clone(), background);
        let auth = Authorization::new(store.clone(), activity.clone());
        let versions = VersionService::new(
            store.clone(),
            Arc::new(ObjectStorage::new(store.clone())),
            Arc::new(AppConfig::default()),
            auth,
            activity,
            Arc::new(TransformedDocumentCache::new()),
        );
        Fixture {
            store,
            versions,
            root: Principal::user("root"),
        }
    }

    fn operation(id: &str, path: &str) -> NewOperation {
        serde_json::from_value(serde_json::json!({
            "operationId": id,
            "documentSlug": "users",
            "title": id,
            "method": "get",
            "path": path,
        }))
        .unwrap()
    }

    fn request(package_id: &str, version: &str, status: VersionStatus) -> PublishRequest {
        PublishRequest {
            package_id: package_id.to_string(),
            version: version.to_string(),
            status,
            previous_version: None,
            previous_version_package_id: None,
            labels: vec![],
            files: vec![PublishFile {
                file_id: "users.json".to_string(),
                slug: "users".to_string(),
                title: "Users".to_string(),
                api_type: "rest".to_string(),
                format: "json".to_string(),
                content: "{\"openapi\":\"3.0.0\"}".to_string(),
            }],
            operations: vec![
                operation("get-users", "/api/v1/users"),
                operation("get-user", "/api/v1/users/{id}"),
            ],
            refs: vec![],
            changes: None,
            publish_id: None,
        }
    }

    #[tokio::test]
    async fn test_publish_release_and_default_version() {
        let f = fixture().await;
        let first = f
            .versions
            .publish(&f.root, request("acme.pay.gw", "2025.1", VersionStatus::Draft))
            .await
            .unwrap();
        assert_eq!(first.revision, 1);
        let view = f
            .versions
            .patch_version(
                &f.root,
                "acme.pay.gw",
                "2025.1",
                VersionPatch {
                    status: Some(VersionStatus::Release),
                    labels: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(view.status, VersionStatus::Release);
        assert_eq!(
            f.versions.get_default_version(&f.root, "acme.pay.gw").await.unwrap(),
            Some("2025.1@1".to_string())
        );
        let docs = f.versions.list_documents(&f.root, "acme.pay.gw", "2025.1").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].operation_count, 2);
        assert!(!f.versions.get_sources(&f.root, "acme.pay.gw", "2025.1@1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_name_must_match_pattern() {
        let f = fixture().await;
        let err = f
            .versions
            .publish(&f.root, request("acme.pay.gw", "v1", VersionStatus::Release))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::RELEASE_VERSION_DOESNT_MATCH_PATTERN);
        let err = f
            .versions
            .publish(&f.root, request("acme.pay.gw", "2025.1@2", VersionStatus::Draft))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_VERSION_NAME);
        let err = f
            .versions
            .publish(&f.root, request("acme.pay", "2025.1", VersionStatus::Draft))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_PACKAGE_KIND);
    }

    #[tokio::test]
    async fn test_revisions_and_comparison() {
        let f = fixture().await;
        f.versions
            .publish(&f.root, request("acme.pay.gw", "2025.1", VersionStatus::Draft))
            .await
            .unwrap();
        let mut second = request("acme.pay.gw", "2025.1", VersionStatus::Draft);
        second.operations.pop();
        let second = f.versions.publish(&f.root, second).await.unwrap();
        assert_eq!(second.revision, 2);

        let id = comparison_id("acme.pay.gw", "2025.1", 2, "acme.pay.gw", "2025.1", 1);
        let comparison = f.store.get_comparison(&id).await.unwrap().unwrap();
        assert_eq!(comparison.changes.len(), 1);
        assert!(!comparison.no_content);

        let revisions = f.versions.list_revisions(&f.root, "acme.pay.gw", "2025.1").await.unwrap();
        assert_eq!(revisions.iter().map(|r| r.revision).collect::<Vec<_>>(), vec![2, 1]);
        let old = f.versions.get_version(&f.root, "acme.pay.gw", "2025.1@1").await.unwrap();
        assert!(old.not_latest_revision);
        let err = f
            .versions
            .get_version(&f.root, "acme.pay.gw", "2025.1@7")
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::REVISION_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_revision_numbers_continue_after_delete() {
        let f = fixture().await;
        f.versions
            .publish(&f.root, request("acme.pay.gw", "2025.1", VersionStatus::Draft))
            .await
            .unwrap();
        f.versions.delete_version(&f.root, "acme.pay.gw", "2025.1").await.unwrap();
        let err = f
            .versions
            .get_version(&f.root, "acme.pay.gw", "2025.1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::VERSION_NOT_FOUND);

        let republished = f
            .versions
            .publish(&f.root, request("acme.pay.gw", "2025.1", VersionStatus::Draft))
            .await
            .unwrap();
        assert_eq!(republished.revision, 2);
        let err = f
            .versions
            .get_version(&f.root, "acme.pay.gw", "2025.1@1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::REVISION_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_release_patterns_are_compiled_once() {
        let f = fixture().await;
        for version in ["2025.1", "2025.2", "2025.3"] {
            f.versions
                .publish(&f.root, request("acme.pay.gw", version, VersionStatus::Release))
                .await
                .unwrap();
        }
        assert_eq!(f.versions.patterns.len(), 1);

        let mut package = f.store.get_package("acme.pay.gw").await.unwrap().unwrap();
        package.release_version_pattern = "^v[0-9]+$".to_string();
        f.store.update_package(package).await.unwrap();
        f.versions
            .publish(&f.root, request("acme.pay.gw", "v4", VersionStatus::Release))
            .await
            .unwrap();
        let err = f
            .versions
            .publish(&f.root, request("acme.pay.gw", "2025.4", VersionStatus::Release))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::RELEASE_VERSION_DOESNT_MATCH_PATTERN);
        assert_eq!(f.versions.patterns.len(), 2);
    }

    #[tokio::test]
    async fn test_demoting_default_release_clears_it() {
        let f = fixture().await;
        f.versions
            .publish(&f.root, request("acme.pay.gw", "2025.1", VersionStatus::Release))
            .await
            .unwrap();
        let mut package = f.store.get_package("acme.pay.gw").await.unwrap().unwrap();
        package.default_release_version = "2025.1".to_string();
        f.store.update_package(package).await.unwrap();

        f.versions
            .patch_version(
                &f.root,
                "acme.pay.gw",
                "2025.1",
                VersionPatch {
                    status: Some(VersionStatus::Archived),
                    labels: Some(vec!["old".to_string()]),
                },
            )
            .await
            .unwrap();
        let package = f.store.get_package("acme.pay.gw").await.unwrap().unwrap();
        assert_eq!(package.default_release_version, "");
        assert_eq!(
            f.versions.list_labels(&f.root, "acme.pay.gw").await.unwrap(),
            vec!["old".to_string()]
        );
    }

    #[tokio::test]
    async fn test_references_reject_cycles() {
        let f = fixture().await;
        f.versions
            .publish(&f.root, request("acme.pay.gw", "2025.1", VersionStatus::Draft))
            .await
            .unwrap();
        let mut dashboard = request("acme.dash", "2025.1", VersionStatus::Draft);
        dashboard.refs = vec![PublishRef {
            package_id: "acme.pay.gw".to_string(),
            version: "2025.1".to_string(),
            excluded: false,
        }];
        f.versions.publish(&f.root, dashboard).await.unwrap();
        let refs = f.versions.list_references(&f.root, "acme.dash", "2025.1").await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].ref_revision, 1);

        let mut back = request("acme.pay.gw", "2025.2", VersionStatus::Draft);
        back.refs = vec![PublishRef {
            package_id: "acme.dash".to_string(),
            version: "2025.1".to_string(),
            excluded: false,
        }];
        let err = f.versions.publish(&f.root, back).await.unwrap_err();
        assert_eq!(err.code(), codes::REFERENCE_CYCLE);
    }

    #[tokio::test]
    async fn test_file_size_limit() {
        let f = fixture().await;
        let mut config = AppConfig::default();
        config.limits.publish_file_size_limit_mb = 0;
        let versions = VersionService {
            config: Arc::new(config),
            ..f.versions.clone()
        };
        let err = versions
            .publish(&f.root, request("acme.pay.gw", "2025.1", VersionStatus::Draft))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::PUBLISH_FILE_SIZE_EXCEEDED);
    }
}
