use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

use crate::model::{
    builtin_roles, comparison_id, is_descendant_of, parent_of, alias_of, ActivityEvent, ApiKey,
    Build, BuildStatus, CleanupRun, ExportResultRecord, GroupPublish, GroupTemplate, GroupWrite,
    GroupedOperation, Id, MigrationCleanupJob, Operation, OperationGroup, OperationGroupHistory,
    Package, PackageMemberRole, PackageTransition, PublishedDocument, Revision, Role,
    TransformedDocument, TransformedDocumentKey, TransitionStatus, User, VersionComparison,
    VersionReference, VersionStatus, MIGRATION_BUILD_AUTHOR,
};
use crate::store::traits::{
    ActivityStore, AuthStore, BlobStore, BuildStore, CleanupStore, EventQuery, GroupStore,
    NewRevision, OperationStore, PackageMove, PackageStore, Store, VersionStore,
};

type RevisionKey = (Id, String, i32);

#[derive(Debug, Default)]
struct MemoryState {
    packages: BTreeMap<Id, Package>,
    transitions: Vec<PackageTransition>,
    transition_seq: i64,
    favorites: BTreeSet<(String, Id)>,

    revisions: BTreeMap<RevisionKey, Revision>,
    documents: BTreeMap<RevisionKey, Vec<PublishedDocument>>,
    operations: BTreeMap<RevisionKey, Vec<Operation>>,
    references: BTreeMap<RevisionKey, Vec<VersionReference>>,
    purged_sources: BTreeSet<Id>,
    comparisons: HashMap<String, VersionComparison>,

    groups: BTreeMap<String, OperationGroup>,
    grouped: BTreeMap<String, Vec<GroupedOperation>>,
    templates: HashMap<String, GroupTemplate>,
    history: Vec<OperationGroupHistory>,
    transformed: BTreeMap<TransformedDocumentKey, TransformedDocument>,
    group_publishes: HashMap<Id, GroupPublish>,

    builds: BTreeMap<Id, Build>,
    export_results: HashMap<Id, ExportResultRecord>,
    blobs: BTreeMap<(String, Id), Vec<u8>>,

    roles: BTreeMap<String, Role>,
    members: BTreeMap<(Id, String), PackageMemberRole>,
    users: BTreeMap<String, User>,
    sysadmins: BTreeSet<String>,
    api_keys: BTreeMap<String, ApiKey>,

    events: Vec<ActivityEvent>,
    cleanup_runs: Vec<CleanupRun>,
    migration_jobs: HashMap<Id, MigrationCleanupJob>,

    failing: BTreeSet<String>,
}

impl MemoryState {
    fn check(&self, operation: &str) -> Result<()> {
        if self.failing.contains(operation) {
            return Err(anyhow!("injected failure for {}", operation));
        }
        Ok(())
    }
}

/// Rewrite `id` when it is `from` or lies below it.
fn renamed(id: &str, from: &str, to: &str) -> Option<Id> {
    if id == from {
        Some(to.to_string())
    } else if is_descendant_of(id, from) {
        Some(format!("{}{}", to, &id[from.len()..]))
    } else {
        None
    }
}

fn rename_in_place(id: &mut Id, from: &str, to: &str) {
    if let Some(new_id) = renamed(id, from, to) {
        *id = new_id;
    }
}

fn rekey_revision_map<V>(
    map: &mut BTreeMap<RevisionKey, V>,
    from: &str,
    to: &str,
    mut fix: impl FnMut(&mut V),
) {
    let keys: Vec<RevisionKey> = map
        .keys()
        .filter(|(pkg, _, _)| renamed(pkg, from, to).is_some())
        .cloned()
        .collect();
    for key in keys {
        if let Some(mut value) = map.remove(&key) {
            fix(&mut value);
            let new_pkg = renamed(&key.0, from, to).unwrap_or(key.0.clone());
            map.insert((new_pkg, key.1, key.2), value);
        }
    }
}

/// In-process store used by tests and `APIHUB_STORE=memory` runs.
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        for role in builtin_roles() {
            state.roles.insert(role.id.clone(), role);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// Make every call of the named store method fail.
    pub async fn fail_on(&self, operation: &str) {
        self.state.write().await.failing.insert(operation.to_string());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PackageStore for MemoryStore {
    async fn get_package(&self, id: &str) -> Result<Option<Package>> {
        Ok(self.state.read().await.packages.get(id).cloned())
    }

    async fn list_packages(&self) -> Result<Vec<Package>> {
        let state = self.state.read().await;
        Ok(state
            .packages
            .values()
            .filter(|p| !p.is_deleted())
            .cloned()
            .collect())
    }

    async fn list_descendants(&self, id: &str) -> Result<Vec<Package>> {
        let state = self.state.read().await;
        Ok(state
            .packages
            .values()
            .filter(|p| !p.is_deleted() && is_descendant_of(&p.id, id))
            .cloned()
            .collect())
    }

    async fn insert_package(&self, package: Package) -> Result<()> {
        let mut state = self.state.write().await;
        if state.packages.contains_key(&package.id) {
            return Err(anyhow!("Package '{}' already exists", package.id));
        }
        state.packages.insert(package.id.clone(), package);
        Ok(())
    }

    async fn update_package(&self, package: Package) -> Result<()> {
        let mut state = self.state.write().await;
        match state.packages.get_mut(&package.id) {
            Some(existing) => {
                *existing = package;
                Ok(())
            }
            None => Err(anyhow!("Package '{}' does not exist", package.id)),
        }
    }

    async fn soft_delete_tree(&self, id: &str, user_id: &str, at: DateTime<Utc>) -> Result<Vec<Id>> {
        let mut state = self.state.write().await;
        let mut deleted = Vec::new();
        for package in state.packages.values_mut() {
            if !package.is_deleted() && (package.id == id || is_descendant_of(&package.id, id)) {
                package.deleted_at = Some(at);
                package.deleted_by = Some(user_id.to_string());
                deleted.push(package.id.clone());
            }
        }
        Ok(deleted)
    }

    async fn purge_deleted_tree(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .packages
            .retain(|pid, p| !(p.is_deleted() && (pid == id || is_descendant_of(pid, id))));
        Ok(())
    }

    async fn move_package_tree(&self, request: PackageMove) -> Result<()> {
        let mut state = self.state.write().await;
        let from = request.from_id.as_str();
        let to = request.to_id.as_str();
        if state.packages.get(to).map(|p| !p.is_deleted()).unwrap_or(false) {
            return Err(anyhow!("Target package '{}' already exists", to));
        }

        let moved: Vec<Id> = state
            .packages
            .values()
            .filter(|p| !p.is_deleted() && renamed(&p.id, from, to).is_some())
            .map(|p| p.id.clone())
            .collect();
        for old_id in moved {
            if let Some(mut package) = state.packages.remove(&old_id) {
                rename_in_place(&mut package.id, from, to);
                if old_id == from {
                    package.parent_id = parent_of(to).to_string();
                    package.alias = alias_of(to).to_string();
                    if let Some(kind) = request.new_kind {
                        package.kind = kind;
                    }
                } else {
                    rename_in_place(&mut package.parent_id, from, to);
                }
                state.packages.insert(package.id.clone(), package);
            }
        }

        rekey_revision_map(&mut state.revisions, from, to, |r| {
            rename_in_place(&mut r.package_id, from, to);
            if let Some(prev) = r.previous_version_package_id.as_mut() {
                rename_in_place(prev, from, to);
            }
        });
        rekey_revision_map(&mut state.documents, from, to, |docs| {
            docs.iter_mut()
                .for_each(|d| rename_in_place(&mut d.package_id, from, to));
        });
        rekey_revision_map(&mut state.operations, from, to, |ops| {
            ops.iter_mut()
                .for_each(|o| rename_in_place(&mut o.package_id, from, to));
        });
        rekey_revision_map(&mut state.references, from, to, |refs| {
            refs.iter_mut()
                .for_each(|r| rename_in_place(&mut r.package_id, from, to));
        });
        for refs in state.references.values_mut() {
            refs.iter_mut()
                .for_each(|r| rename_in_place(&mut r.ref_package_id, from, to));
        }

        let comparisons: Vec<VersionComparison> = state.comparisons.drain().map(|(_, c)| c).collect();
        for mut comparison in comparisons {
            rename_in_place(&mut comparison.package_id, from, to);
            rename_in_place(&mut comparison.previous_package_id, from, to);
            comparison.comparison_id = comparison_id(
                &comparison.package_id,
                &comparison.version,
                comparison.revision,
                &comparison.previous_package_id,
                &comparison.previous_version,
                comparison.previous_revision,
            );
            state
                .comparisons
                .insert(comparison.comparison_id.clone(), comparison);
        }

        for group in state.groups.values_mut() {
            rename_in_place(&mut group.package_id, from, to);
        }
        for members in state.grouped.values_mut() {
            members
                .iter_mut()
                .for_each(|m| rename_in_place(&mut m.package_id, from, to));
        }

        let member_keys: Vec<(Id, String)> = state
            .members
            .keys()
            .filter(|(pkg, _)| renamed(pkg, from, to).is_some())
            .cloned()
            .collect();
        for key in member_keys {
            if let Some(mut member) = state.members.remove(&key) {
                rename_in_place(&mut member.package_id, from, to);
                state
                    .members
                    .insert((member.package_id.clone(), key.1), member);
            }
        }
        for key in state.api_keys.values_mut() {
            rename_in_place(&mut key.package_id, from, to);
        }
        state.favorites = std::mem::take(&mut state.favorites)
            .into_iter()
            .map(|(user, pkg)| {
                let pkg = renamed(&pkg, from, to).unwrap_or(pkg);
                (user, pkg)
            })
            .collect();

        if request.overwrite_history {
            state
                .transitions
                .retain(|t| !(t.from_id == to || is_descendant_of(&t.from_id, to)));
        }
        for mut transition in request.transitions {
            state.transition_seq += 1;
            transition.seq = state.transition_seq;
            state.transitions.push(transition);
        }
        Ok(())
    }

    async fn list_transitions_from(&self, from_id: &str) -> Result<Vec<PackageTransition>> {
        let state = self.state.read().await;
        Ok(state
            .transitions
            .iter()
            .filter(|t| t.from_id == from_id)
            .cloned()
            .collect())
    }

    async fn list_transitions_touching(&self, id: &str) -> Result<Vec<PackageTransition>> {
        let state = self.state.read().await;
        Ok(state
            .transitions
            .iter()
            .filter(|t| t.from_id == id || t.to_id == id)
            .cloned()
            .collect())
    }

    async fn get_transition(&self, move_id: &str) -> Result<Option<PackageTransition>> {
        let state = self.state.read().await;
        Ok(state
            .transitions
            .iter()
            .filter(|t| t.move_id == move_id)
            .min_by_key(|t| t.seq)
            .cloned())
    }

    async fn complete_transitions(
        &self,
        move_id: &str,
        status: TransitionStatus,
        details: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        for transition in state.transitions.iter_mut().filter(|t| t.move_id == move_id) {
            transition.status = status;
            transition.details = details.clone();
            transition.completed_at = Some(now);
        }
        Ok(())
    }

    async fn add_favorite(&self, user_id: &str, package_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .favorites
            .insert((user_id.to_string(), package_id.to_string()));
        Ok(())
    }

    async fn remove_favorite(&self, user_id: &str, package_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .favorites
            .remove(&(user_id.to_string(), package_id.to_string()));
        Ok(())
    }

    async fn list_favorites(&self, user_id: &str) -> Result<Vec<Id>> {
        let state = self.state.read().await;
        Ok(state
            .favorites
            .iter()
            .filter(|(user, _)| user == user_id)
            .map(|(_, pkg)| pkg.clone())
            .collect())
    }
}

#[async_trait::async_trait]
impl VersionStore for MemoryStore {
    async fn insert_revision(&self, content: NewRevision) -> Result<Revision> {
        let mut state = self.state.write().await;
        let NewRevision {
            mut revision,
            documents,
            operations,
            references,
        } = content;
        let next = state
            .revisions
            .range(
                (revision.package_id.clone(), revision.version.clone(), i32::MIN)
                    ..=(revision.package_id.clone(), revision.version.clone(), i32::MAX),
            )
            .map(|(key, _)| key.2)
            .max()
            .unwrap_or(0)
            + 1;
        revision.revision = next;
        let key = (revision.package_id.clone(), revision.version.clone(), next);
        state.documents.insert(
            key.clone(),
            documents
                .into_iter()
                .map(|mut d| {
                    d.revision = next;
                    d
                })
                .collect(),
        );
        state.operations.insert(
            key.clone(),
            operations
                .into_iter()
                .map(|mut o| {
                    o.revision = next;
                    o
                })
                .collect(),
        );
        state.references.insert(
            key.clone(),
            references
                .into_iter()
                .map(|mut r| {
                    r.revision = next;
                    r
                })
                .collect(),
        );
        state.revisions.insert(key, revision.clone());
        Ok(revision)
    }

    async fn get_revision(&self, package_id: &str, version: &str, revision: i32) -> Result<Option<Revision>> {
        let state = self.state.read().await;
        Ok(state
            .revisions
            .get(&(package_id.to_string(), version.to_string(), revision))
            .filter(|r| !r.is_deleted())
            .cloned())
    }

    async fn get_latest_revision(&self, package_id: &str, version: &str) -> Result<Option<Revision>> {
        Ok(self.list_revisions(package_id, version).await?.pop())
    }

    async fn list_revisions(&self, package_id: &str, version: &str) -> Result<Vec<Revision>> {
        let state = self.state.read().await;
        Ok(state
            .revisions
            .range(
                (package_id.to_string(), version.to_string(), i32::MIN)
                    ..=(package_id.to_string(), version.to_string(), i32::MAX),
            )
            .map(|(_, r)| r)
            .filter(|r| !r.is_deleted())
            .cloned()
            .collect())
    }

    async fn list_versions(&self, package_id: &str) -> Result<Vec<Revision>> {
        let state = self.state.read().await;
        let mut latest: BTreeMap<String, Revision> = BTreeMap::new();
        for ((pkg, version, _), revision) in state.revisions.iter() {
            if pkg == package_id && !revision.is_deleted() {
                latest.insert(version.clone(), revision.clone());
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn update_revision_meta(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
        status: VersionStatus,
        labels: Vec<String>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .revisions
            .get_mut(&(package_id.to_string(), version.to_string(), revision))
            .ok_or_else(|| anyhow!("Revision {}@{} of '{}' not found", version, revision, package_id))?;
        entry.status = status;
        entry.labels = labels;
        Ok(())
    }

    async fn delete_version(&self, package_id: &str, version: &str, user_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        let mut touched = false;
        for ((pkg, ver, _), revision) in state.revisions.iter_mut() {
            if pkg == package_id && ver == version && !revision.is_deleted() {
                revision.deleted_at = Some(at);
                revision.deleted_by = Some(user_id.to_string());
                touched = true;
            }
        }
        Ok(touched)
    }

    async fn list_documents(&self, package_id: &str, version: &str, revision: i32) -> Result<Vec<PublishedDocument>> {
        let state = self.state.read().await;
        Ok(state
            .documents
            .get(&(package_id.to_string(), version.to_string(), revision))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_references(&self, package_id: &str, version: &str, revision: i32) -> Result<Vec<VersionReference>> {
        let state = self.state.read().await;
        Ok(state
            .references
            .get(&(package_id.to_string(), version.to_string(), revision))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_referrers(&self, package_id: &str) -> Result<Vec<VersionReference>> {
        let state = self.state.read().await;
        Ok(state
            .references
            .values()
            .flatten()
            .filter(|r| r.ref_package_id == package_id)
            .cloned()
            .collect())
    }

    async fn list_unpurged_deleted_sources(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Id>> {
        let state = self.state.read().await;
        Ok(state
            .revisions
            .values()
            .filter(|r| r.deleted_at.map(|d| d < before).unwrap_or(false))
            .filter_map(|r| r.publish_id.clone())
            .filter(|id| !state.purged_sources.contains(id))
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn mark_sources_purged(&self, publish_ids: &[Id]) -> Result<()> {
        let mut state = self.state.write().await;
        state.purged_sources.extend(publish_ids.iter().cloned());
        Ok(())
    }
}

#[async_trait::async_trait]
impl OperationStore for MemoryStore {
    async fn list_operations(&self, package_id: &str, version: &str, revision: i32) -> Result<Vec<Operation>> {
        let state = self.state.read().await;
        Ok(state
            .operations
            .get(&(package_id.to_string(), version.to_string(), revision))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_operation(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
        api_type: &str,
        operation_id: &str,
    ) -> Result<Option<Operation>> {
        let state = self.state.read().await;
        Ok(state
            .operations
            .get(&(package_id.to_string(), version.to_string(), revision))
            .and_then(|ops| {
                ops.iter()
                    .find(|o| o.api_type == api_type && o.operation_id == operation_id)
                    .cloned()
            }))
    }

    async fn put_comparison(&self, comparison: VersionComparison) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .comparisons
            .insert(comparison.comparison_id.clone(), comparison);
        Ok(())
    }

    async fn get_comparison(&self, comparison_id: &str) -> Result<Option<VersionComparison>> {
        Ok(self.state.read().await.comparisons.get(comparison_id).cloned())
    }
}

#[async_trait::async_trait]
impl GroupStore for MemoryStore {
    async fn get_group(&self, group_id: &str) -> Result<Option<OperationGroup>> {
        Ok(self.state.read().await.groups.get(group_id).cloned())
    }

    async fn list_groups(&self, package_id: &str, version: &str, revision: i32) -> Result<Vec<OperationGroup>> {
        let state = self.state.read().await;
        Ok(state
            .groups
            .values()
            .filter(|g| g.package_id == package_id && g.version == version && g.revision == revision)
            .cloned()
            .collect())
    }

    async fn list_grouped_operations(&self, group_id: &str) -> Result<Vec<GroupedOperation>> {
        Ok(self
            .state
            .read()
            .await
            .grouped
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_group(&self, write: GroupWrite, replaces: Option<&str>) -> Result<()> {
        let mut state = self.state.write().await;
        let GroupWrite {
            mut group,
            template,
            operations,
            history,
        } = write;
        let group_id = group.group_id.clone();

        let mut carried_ops = None;
        let mut carried_template = None;
        if let Some(old_id) = replaces.filter(|old| *old != group_id) {
            if state.groups.contains_key(&group_id) {
                return Err(anyhow!("Operation group '{}' already exists", group.group_name));
            }
            state.groups.remove(old_id);
            carried_ops = state.grouped.remove(old_id);
            carried_template = state.templates.remove(old_id);
        }

        let members = match operations {
            Some(ops) => ops
                .into_iter()
                .map(|mut op| {
                    op.group_id = group_id.clone();
                    op
                })
                .collect(),
            None => carried_ops
                .map(|ops| {
                    ops.into_iter()
                        .map(|mut op| {
                            op.group_id = group_id.clone();
                            op
                        })
                        .collect()
                })
                .or_else(|| state.grouped.get(&group_id).cloned())
                .unwrap_or_default(),
        };
        group.operations_count = members.len();
        state.grouped.insert(group_id.clone(), members);

        match (template, group.template_checksum.is_some()) {
            (Some(t), _) => {
                state.templates.insert(group_id.clone(), t);
            }
            (None, false) => {
                state.templates.remove(&group_id);
            }
            (None, true) => {
                if let Some(t) = carried_template {
                    state.templates.insert(group_id.clone(), t);
                }
            }
        }

        state.groups.insert(group_id, group);
        state.history.extend(history);
        Ok(())
    }

    async fn delete_group(&self, group_id: &str, history: OperationGroupHistory) -> Result<bool> {
        let mut state = self.state.write().await;
        let existed = state.groups.remove(group_id).is_some();
        state.grouped.remove(group_id);
        state.templates.remove(group_id);
        if existed {
            state.history.push(history);
        }
        Ok(existed)
    }

    async fn get_group_template(&self, group_id: &str) -> Result<Option<GroupTemplate>> {
        Ok(self.state.read().await.templates.get(group_id).cloned())
    }

    async fn list_group_history(&self, group_id: &str) -> Result<Vec<OperationGroupHistory>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn get_transformed_document(&self, key: &TransformedDocumentKey) -> Result<Option<TransformedDocument>> {
        Ok(self.state.read().await.transformed.get(key).cloned())
    }

    async fn put_transformed_document(&self, document: TransformedDocument) -> Result<()> {
        let mut state = self.state.write().await;
        state.transformed.insert(document.key.clone(), document);
        Ok(())
    }

    async fn delete_transformed_documents(&self, group_id: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        let before = state.transformed.len();
        state.transformed.retain(|key, _| key.group_id != group_id);
        Ok(before - state.transformed.len())
    }

    async fn delete_transformed_documents_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let count = state.transformed.len();
        state.transformed.retain(|_, doc| doc.created_at >= before);
        Ok(count - state.transformed.len())
    }

    async fn insert_group_publish(&self, publish: GroupPublish) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .group_publishes
            .insert(publish.publish_id.clone(), publish);
        Ok(())
    }

    async fn update_group_publish(&self, publish: GroupPublish) -> Result<()> {
        self.insert_group_publish(publish).await
    }

    async fn get_group_publish(&self, publish_id: &str) -> Result<Option<GroupPublish>> {
        Ok(self.state.read().await.group_publishes.get(publish_id).cloned())
    }
}

#[async_trait::async_trait]
impl BuildStore for MemoryStore {
    async fn insert_build(&self, build: Build) -> Result<()> {
        let mut state = self.state.write().await;
        state.builds.insert(build.build_id.clone(), build);
        Ok(())
    }

    async fn get_build(&self, build_id: &str) -> Result<Option<Build>> {
        Ok(self.state.read().await.builds.get(build_id).cloned())
    }

    async fn find_reusable_build(&self, checksum: &str, results_after: DateTime<Utc>) -> Result<Option<Build>> {
        let state = self.state.read().await;
        Ok(state
            .builds
            .values()
            .filter(|b| b.checksum == checksum)
            .filter(|b| match b.status {
                BuildStatus::NotStarted | BuildStatus::Running => true,
                BuildStatus::Complete => {
                    !b.result_deleted
                        && state
                            .export_results
                            .get(&b.build_id)
                            .map(|r| r.created_at > results_after)
                            .unwrap_or(false)
                }
                BuildStatus::Error => false,
            })
            .max_by_key(|b| b.created_at)
            .cloned())
    }

    async fn transition_build(
        &self,
        build_id: &str,
        from: &[BuildStatus],
        to: BuildStatus,
        details: &str,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(build) = state.builds.get_mut(build_id) else {
            return Ok(false);
        };
        if !from.contains(&build.status) || !build.status.can_transition_to(to) {
            return Ok(false);
        }
        build.status = to;
        build.details = details.to_string();
        let now = Utc::now();
        if to == BuildStatus::Running {
            build.started_at = Some(now);
        }
        if to.is_terminal() {
            build.finished_at = Some(now);
        }
        Ok(true)
    }

    async fn claim_next_build(&self, worker_id: &str) -> Result<Option<Build>> {
        let mut state = self.state.write().await;
        let next = state
            .builds
            .values()
            .filter(|b| b.status == BuildStatus::NotStarted)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.build_id.cmp(&b.build_id)))
            .map(|b| b.build_id.clone());
        let Some(build_id) = next else {
            return Ok(None);
        };
        let build = state
            .builds
            .get_mut(&build_id)
            .ok_or_else(|| anyhow!("Build '{}' vanished while claiming", build_id))?;
        let now = Utc::now();
        build.status = BuildStatus::Running;
        build.started_at = Some(now);
        build.heartbeat_at = Some(now);
        build.worker_id = Some(worker_id.to_string());
        Ok(Some(build.clone()))
    }

    async fn heartbeat_build(&self, build_id: &str, worker_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.builds.get_mut(build_id) {
            Some(build) if build.status == BuildStatus::Running && build.worker_id.as_deref() == Some(worker_id) => {
                build.heartbeat_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_stale_builds(&self, stale_before: DateTime<Utc>) -> Result<Vec<Id>> {
        let mut state = self.state.write().await;
        let mut requeued = Vec::new();
        for build in state.builds.values_mut() {
            let last_seen = build.heartbeat_at.or(build.started_at);
            if build.status == BuildStatus::Running && last_seen.map_or(true, |at| at < stale_before) {
                build.status = BuildStatus::NotStarted;
                build.worker_id = None;
                build.heartbeat_at = None;
                requeued.push(build.build_id.clone());
            }
        }
        Ok(requeued)
    }

    async fn insert_export_result(&self, record: ExportResultRecord) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.export_results.contains_key(&record.build_id) {
            return Ok(false);
        }
        state.export_results.insert(record.build_id.clone(), record);
        Ok(true)
    }

    async fn get_export_result(&self, build_id: &str) -> Result<Option<ExportResultRecord>> {
        Ok(self.state.read().await.export_results.get(build_id).cloned())
    }

    async fn list_expired_results(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Id>> {
        let state = self.state.read().await;
        let mut expired: Vec<&ExportResultRecord> = state
            .export_results
            .values()
            .filter(|r| r.created_at < before)
            .collect();
        expired.sort_by_key(|r| r.created_at);
        Ok(expired
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|r| r.build_id.clone())
            .collect())
    }

    async fn mark_results_deleted(&self, build_ids: &[Id]) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("mark_results_deleted")?;
        for id in build_ids {
            state.export_results.remove(id);
            if let Some(build) = state.builds.get_mut(id) {
                build.result_deleted = true;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryStore {
    async fn put_blob(&self, table: &str, id: &str, data: &[u8]) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .blobs
            .insert((table.to_string(), id.to_string()), data.to_vec());
        Ok(())
    }

    async fn get_blob(&self, table: &str, id: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.read().await;
        Ok(state
            .blobs
            .get(&(table.to_string(), id.to_string()))
            .cloned())
    }

    async fn delete_blobs(&self, table: &str, ids: &[Id]) -> Result<usize> {
        let mut state = self.state.write().await;
        Ok(ids
            .iter()
            .filter(|id| {
                state
                    .blobs
                    .remove(&(table.to_string(), id.to_string()))
                    .is_some()
            })
            .count())
    }

    async fn list_blob_ids(&self, table: &str, offset: i64, limit: i64) -> Result<Vec<Id>> {
        let state = self.state.read().await;
        Ok(state
            .blobs
            .keys()
            .filter(|(t, _)| t == table)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|(_, id)| id.clone())
            .collect())
    }
}

#[async_trait::async_trait]
impl AuthStore for MemoryStore {
    async fn list_roles(&self) -> Result<Vec<Role>> {
        let state = self.state.read().await;
        let mut roles: Vec<Role> = state.roles.values().cloned().collect();
        roles.sort_by(|a, b| b.rank.cmp(&a.rank));
        Ok(roles)
    }

    async fn get_role(&self, id: &str) -> Result<Option<Role>> {
        Ok(self.state.read().await.roles.get(id).cloned())
    }

    async fn insert_role(&self, role: Role) -> Result<()> {
        let mut state = self.state.write().await;
        if state.roles.contains_key(&role.id) {
            return Err(anyhow!("Role '{}' already exists", role.id));
        }
        for existing in state.roles.values_mut() {
            if existing.rank >= role.rank {
                existing.rank += 1;
            }
        }
        state.roles.insert(role.id.clone(), role);
        Ok(())
    }

    async fn update_role(&self, role: Role) -> Result<()> {
        let mut state = self.state.write().await;
        state.roles.insert(role.id.clone(), role);
        Ok(())
    }

    async fn delete_role(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let existed = state.roles.remove(id).is_some();
        for member in state.members.values_mut() {
            member.role_ids.retain(|r| r != id);
        }
        state.members.retain(|_, m| !m.role_ids.is_empty());
        Ok(existed)
    }

    async fn set_role_ranks(&self, ranks: Vec<(String, i32)>) -> Result<()> {
        let mut state = self.state.write().await;
        for (id, rank) in ranks {
            if let Some(role) = state.roles.get_mut(&id) {
                role.rank = rank;
            }
        }
        Ok(())
    }

    async fn get_member_roles(&self, package_id: &str, user_id: &str) -> Result<Option<PackageMemberRole>> {
        let state = self.state.read().await;
        Ok(state
            .members
            .get(&(package_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn list_member_roles(&self, package_ids: &[Id]) -> Result<Vec<PackageMemberRole>> {
        let state = self.state.read().await;
        Ok(state
            .members
            .values()
            .filter(|m| package_ids.contains(&m.package_id))
            .cloned()
            .collect())
    }

    async fn list_member_roles_for_user(&self, user_id: &str) -> Result<Vec<PackageMemberRole>> {
        let state = self.state.read().await;
        Ok(state
            .members
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn put_member_roles(&self, member: PackageMemberRole) -> Result<()> {
        let mut state = self.state.write().await;
        let key = (member.package_id.clone(), member.user_id.clone());
        if member.role_ids.is_empty() {
            state.members.remove(&key);
        } else {
            state.members.insert(key, member);
        }
        Ok(())
    }

    async fn delete_member(&self, package_id: &str, user_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(state
            .members
            .remove(&(package_id.to_string(), user_id.to_string()))
            .is_some())
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.state.read().await.users.get(id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let state = self.state.read().await;
        let email = email.trim().to_lowercase();
        Ok(state.users.values().find(|u| u.email == email).cloned())
    }

    async fn upsert_user(&self, user: User) -> Result<()> {
        let mut state = self.state.write().await;
        state.users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn is_sysadmin(&self, user_id: &str) -> Result<bool> {
        Ok(self.state.read().await.sysadmins.contains(user_id))
    }

    async fn add_sysadmin(&self, user_id: &str) -> Result<()> {
        self.state.write().await.sysadmins.insert(user_id.to_string());
        Ok(())
    }

    async fn insert_api_key(&self, key: ApiKey) -> Result<bool> {
        let mut state = self.state.write().await;
        let duplicate = state
            .api_keys
            .values()
            .any(|k| k.package_id == key.package_id && k.name == key.name && !k.is_revoked());
        if duplicate {
            return Ok(false);
        }
        state.api_keys.insert(key.id.clone(), key);
        Ok(true)
    }

    async fn get_api_key(&self, id: &str) -> Result<Option<ApiKey>> {
        Ok(self.state.read().await.api_keys.get(id).cloned())
    }

    async fn find_api_key_by_hash(&self, token_hash: &str) -> Result<Option<ApiKey>> {
        let state = self.state.read().await;
        Ok(state
            .api_keys
            .values()
            .find(|k| k.token_hash == token_hash)
            .cloned())
    }

    async fn list_api_keys(&self, package_id: &str) -> Result<Vec<ApiKey>> {
        let state = self.state.read().await;
        let mut keys: Vec<ApiKey> = state
            .api_keys
            .values()
            .filter(|k| k.package_id == package_id)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    async fn revoke_api_key(&self, id: &str, user_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.api_keys.get_mut(id) {
            Some(key) if !key.is_revoked() => {
                key.deleted_at = Some(at);
                key.deleted_by = Some(user_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait::async_trait]
impl ActivityStore for MemoryStore {
    async fn insert_events(&self, events: Vec<ActivityEvent>) -> Result<()> {
        self.state.write().await.events.extend(events);
        Ok(())
    }

    async fn list_events(&self, query: EventQuery) -> Result<Vec<ActivityEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<ActivityEvent> = state
            .events
            .iter()
            .filter(|e| {
                query
                    .package_ids
                    .as_ref()
                    .map(|ids| ids.contains(&e.package_id))
                    .unwrap_or(true)
            })
            .filter(|e| query.types.is_empty() || query.types.contains(&e.event_type))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(events
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }
}

#[async_trait::async_trait]
impl CleanupStore for MemoryStore {
    async fn begin_cleanup_run(&self, min_interval: chrono::Duration, now: DateTime<Utc>) -> Result<Option<CleanupRun>> {
        let mut state = self.state.write().await;
        let recent = state
            .cleanup_runs
            .iter()
            .filter(|r| r.succeeded())
            .map(|r| r.started_at)
            .max()
            .map(|last| now - last < min_interval)
            .unwrap_or(false);
        if recent {
            return Ok(None);
        }
        let run_id = state.cleanup_runs.iter().map(|r| r.run_id).max().unwrap_or(0) + 1;
        let run = CleanupRun {
            run_id,
            started_at: now,
            finished_at: None,
            deleted_builds: 0,
            deleted_transformed_documents: 0,
            deleted_sources: 0,
            error: None,
        };
        state.cleanup_runs.push(run.clone());
        Ok(Some(run))
    }

    async fn finish_cleanup_run(&self, run: CleanupRun) -> Result<()> {
        let mut state = self.state.write().await;
        match state.cleanup_runs.iter_mut().find(|r| r.run_id == run.run_id) {
            Some(existing) => *existing = run,
            None => state.cleanup_runs.push(run),
        }
        Ok(())
    }

    async fn last_cleanup_run(&self) -> Result<Option<CleanupRun>> {
        let state = self.state.read().await;
        Ok(state.cleanup_runs.iter().max_by_key(|r| r.run_id).cloned())
    }

    async fn put_migration_job(&self, job: MigrationCleanupJob) -> Result<()> {
        self.state
            .write()
            .await
            .migration_jobs
            .insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn get_migration_job(&self, job_id: &str) -> Result<Option<MigrationCleanupJob>> {
        Ok(self.state.read().await.migration_jobs.get(job_id).cloned())
    }

    async fn list_migration_builds(&self, limit: i64) -> Result<Vec<Id>> {
        let state = self.state.read().await;
        let mut builds: Vec<&Build> = state
            .builds
            .values()
            .filter(|b| b.created_by == MIGRATION_BUILD_AUTHOR && !b.result_deleted)
            .collect();
        builds.sort_by_key(|b| b.created_at);
        Ok(builds
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|b| b.build_id.clone())
            .collect())
    }
}

impl Store for MemoryStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildConfig, BuildFormat, BuildType, PackageKind};

    fn package(id: &str, kind: PackageKind) -> Package {
        Package {
            id: id.to_string(),
            kind,
            parent_id: parent_of(id).to_string(),
            alias: alias_of(id).to_string(),
            name: id.to_string(),
            description: String::new(),
            default_role: "viewer".to_string(),
            default_release_version: String::new(),
            release_version_pattern: String::new(),
            service_name: String::new(),
            rest_grouping_prefix: String::new(),
            exclude_from_search: false,
            image_url: String::new(),
            created_at: Utc::now(),
            created_by: "alice".to_string(),
            deleted_at: None,
            deleted_by: None,
        }
    }

    fn revision(package_id: &str, version: &str) -> Revision {
        Revision {
            package_id: package_id.to_string(),
            version: version.to_string(),
            revision: 0,
            status: VersionStatus::Draft,
            previous_version: None,
            previous_version_package_id: None,
            labels: vec![],
            published_at: Utc::now(),
            created_by: "alice".to_string(),
            publish_id: None,
            deleted_at: None,
            deleted_by: None,
        }
    }

    #[tokio::test]
    async fn test_revisions_are_contiguous() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .insert_revision(NewRevision {
                    revision: revision("acme.pay.gw", "2025.1"),
                    documents: vec![],
                    operations: vec![],
                    references: vec![],
                })
                .await
                .unwrap();
        }
        let revisions = store.list_revisions("acme.pay.gw", "2025.1").await.unwrap();
        assert_eq!(
            revisions.iter().map(|r| r.revision).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let latest = store
            .get_latest_revision("acme.pay.gw", "2025.1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.revision, 3);
    }

    #[tokio::test]
    async fn test_move_renames_subtree() {
        let store = MemoryStore::new();
        store.insert_package(package("acme", PackageKind::Workspace)).await.unwrap();
        store.insert_package(package("acme.pay", PackageKind::Group)).await.unwrap();
        store.insert_package(package("acme.pay.gw", PackageKind::Package)).await.unwrap();
        store
            .insert_revision(NewRevision {
                revision: revision("acme.pay.gw", "2025.1"),
                documents: vec![],
                operations: vec![],
                references: vec![],
            })
            .await
            .unwrap();

        store
            .move_package_tree(PackageMove {
                from_id: "acme.pay".to_string(),
                to_id: "acme.payments".to_string(),
                new_kind: None,
                transitions: vec![],
                overwrite_history: false,
            })
            .await
            .unwrap();

        assert!(store.get_package("acme.pay").await.unwrap().is_none());
        let moved = store.get_package("acme.payments.gw").await.unwrap().unwrap();
        assert_eq!(moved.parent_id, "acme.payments");
        assert_eq!(
            store
                .list_revisions("acme.payments.gw", "2025.1")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_transition_build_is_forward_only() {
        let store = MemoryStore::new();
        let config = BuildConfig::new("acme.pay.gw", "2025.1@1", BuildType::ExportVersion, BuildFormat::Json);
        store.insert_build(Build::new("b1".to_string(), config)).await.unwrap();
        let claimed = store.claim_next_build("w1").await.unwrap().unwrap();
        assert_eq!(claimed.status, BuildStatus::Running);
        assert!(store.claim_next_build("w2").await.unwrap().is_none());
        assert!(store
            .transition_build("b1", &[BuildStatus::Running], BuildStatus::Complete, "")
            .await
            .unwrap());
        assert!(!store
            .transition_build("b1", &[BuildStatus::Complete], BuildStatus::Error, "late")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_run_ids_are_monotonic() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let run = store
            .begin_cleanup_run(chrono::Duration::hours(1), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.run_id, 1);
        let mut finished = run.clone();
        finished.finished_at = Some(now);
        store.finish_cleanup_run(finished).await.unwrap();
        assert!(store
            .begin_cleanup_run(chrono::Duration::hours(1), now + chrono::Duration::minutes(5))
            .await
            .unwrap()
            .is_none());
        let next = store
            .begin_cleanup_run(chrono::Duration::hours(1), now + chrono::Duration::hours(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.run_id, 2);
    }
}
