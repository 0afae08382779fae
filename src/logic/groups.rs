use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::{codes, CatalogError, CatalogResult};
use crate::logic::activity::ActivityTracker;
use crate::logic::authorization::Authorization;
use crate::logic::background::BackgroundExecutor;
use crate::logic::builds::BuildController;
use crate::logic::versions::resolve_revision;
use crate::model::{
    generate_id, grouping_prefix_regex, make_group_id, ActivityEvent, BuildConfig, BuildFile,
    BuildFormat, BuildType, EventType, GroupHistoryAction, GroupOperationRef, GroupPublish,
    GroupPublishRequest, GroupPublishStatus, GroupTemplate, GroupWrite, GroupedOperation, Id,
    NewOperationGroup, Operation, OperationGroup, OperationGroupHistory, OperationGroupPatch,
    OperationListFilter, Package, Permission, Principal, PublishTarget, Revision, TextFilter,
    TransformedDocument, TransformedDocumentKey, VersionRef, API_TYPE_REST, SYSTEM_USER_ID,
};
use crate::store::traits::Store;
use crate::store::TransformedDocumentCache;

fn history(group: &OperationGroup, action: GroupHistoryAction, user_id: &str, automatic: bool) -> OperationGroupHistory {
    OperationGroupHistory {
        group_id: group.group_id.clone(),
        action,
        data: serde_json::json!({
            "groupName": group.group_name,
            "apiType": group.api_type,
            "description": group.description,
            "templateFilename": group.template_filename,
            "operationsCount": group.operations_count,
        }),
        user_id: user_id.to_string(),
        date: Utc::now(),
        automatic,
    }
}

/// Drop cached and persisted transformed documents of a group.
async fn evict_transformed<S: Store>(store: &S, cache: &TransformedDocumentCache, group_id: &str) -> CatalogResult<()> {
    let cached = cache.invalidate_group(group_id).await;
    let stored = store.delete_transformed_documents(group_id).await?;
    if cached + stored > 0 {
        log::debug!(
            "Evicted {} cached and {} stored transformed documents of group {}",
            cached,
            stored,
            group_id
        );
    }
    Ok(())
}

fn member_keys(members: &[GroupedOperation]) -> BTreeSet<(Id, String, i32, String)> {
    members
        .iter()
        .map(|m| (m.package_id.clone(), m.version.clone(), m.revision, m.operation_id.clone()))
        .collect()
}

/// Derive REST groups from operation paths using the package grouping
/// prefix. Manual groups keep their names; groups that no longer match any
/// operation are removed. Returns the number of groups written.
pub async fn recalculate_autogenerated_groups<S: Store>(
    store: &S,
    cache: &TransformedDocumentCache,
    package: &Package,
    revision: &Revision,
    limit: usize,
) -> CatalogResult<usize> {
    let groups = store
        .list_groups(&revision.package_id, &revision.version, revision.revision)
        .await?;
    let (existing, manual): (Vec<OperationGroup>, Vec<OperationGroup>) = groups
        .into_iter()
        .filter(|g| g.api_type == API_TYPE_REST)
        .partition(|g| g.autogenerated);
    let manual_names: BTreeSet<String> = manual.into_iter().map(|g| g.group_name).collect();

    let mut buckets: BTreeMap<String, Vec<GroupedOperation>> = BTreeMap::new();
    if !package.rest_grouping_prefix.is_empty() {
        let matcher = grouping_prefix_regex(&package.rest_grouping_prefix)?;
        let operations = store
            .list_operations(&revision.package_id, &revision.version, revision.revision)
            .await?;
        for op in operations.iter().filter(|op| op.api_type == API_TYPE_REST) {
            let Some(captures) = op.path.as_deref().and_then(|p| matcher.captures(p)) else {
                continue;
            };
            let name = captures[1].to_string();
            if manual_names.contains(&name) {
                continue;
            }
            let group_id = make_group_id(&revision.package_id, &revision.version, revision.revision, API_TYPE_REST, &name);
            buckets.entry(name).or_default().push(GroupedOperation {
                group_id,
                package_id: op.package_id.clone(),
                version: op.version.clone(),
                revision: op.revision,
                operation_id: op.operation_id.clone(),
            });
        }
    }

    let mut written = 0;
    let mut kept = BTreeSet::new();
    for (name, members) in buckets {
        let group_id = make_group_id(&revision.package_id, &revision.version, revision.revision, API_TYPE_REST, &name);
        kept.insert(group_id.clone());
        if members.len() > limit {
            log::warn!(
                "Autogenerated group '{}' of {} in '{}' has {} operations, above the limit of {}",
                name,
                revision.key(),
                revision.package_id,
                members.len(),
                limit
            );
            continue;
        }
        let current = existing.iter().find(|g| g.group_id == group_id);
        let (mut group, action) = match current {
            Some(group) => {
                let before = store.list_grouped_operations(&group_id).await?;
                if member_keys(&before) == member_keys(&members) {
                    continue;
                }
                evict_transformed(store, cache, &group_id).await?;
                (group.clone(), GroupHistoryAction::Update)
            }
            None => (
                OperationGroup::new(&revision.package_id, &revision.version, revision.revision, API_TYPE_REST, &name, true),
                GroupHistoryAction::Create,
            ),
        };
        group.operations_count = members.len();
        group.updated_at = Utc::now();
        let entry = history(&group, action, SYSTEM_USER_ID, true);
        store
            .write_group(
                GroupWrite {
                    group,
                    template: None,
                    operations: Some(members),
                    history: vec![entry],
                },
                None,
            )
            .await?;
        written += 1;
    }

    for stale in existing.iter().filter(|g| !kept.contains(&g.group_id)) {
        store
            .delete_group(&stale.group_id, history(stale, GroupHistoryAction::Delete, SYSTEM_USER_ID, true))
            .await?;
        evict_transformed(store, cache, &stale.group_id).await?;
    }
    if written > 0 {
        log::info!(
            "Recalculated {} autogenerated groups of {} in '{}'",
            written,
            revision.key(),
            revision.package_id
        );
    }
    Ok(written)
}

fn not_modifiable(group: &OperationGroup) -> CatalogError {
    CatalogError::validation(
        codes::OPERATION_GROUP_NOT_MODIFIABLE,
        format!(
            "Autogenerated group '{}' allows only description and template changes",
            group.group_name
        ),
    )
    .with_param("groupName", &group.group_name)
}

fn already_exists(name: &str, version: &str) -> CatalogError {
    CatalogError::conflict(
        codes::OPERATION_GROUP_ALREADY_EXISTS,
        format!("Operation group '{}' already exists in {}", name, version),
    )
    .with_param("groupName", name)
    .with_param("version", version)
}

/// Named subsets of operations within a revision and their publication.
pub struct GroupService<S: Store> {
    store: Arc<S>,
    config: Arc<AppConfig>,
    auth: Authorization<S>,
    activity: ActivityTracker<S>,
    cache: Arc<TransformedDocumentCache>,
    builds: BuildController<S>,
    background: BackgroundExecutor,
}

impl<S: Store> Clone for GroupService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            auth: self.auth.clone(),
            activity: self.activity.clone(),
            cache: self.cache.clone(),
            builds: self.builds.clone(),
            background: self.background.clone(),
        }
    }
}

impl<S: Store + 'static> GroupService<S> {
    pub fn new(
        store: Arc<S>,
        config: Arc<AppConfig>,
        auth: Authorization<S>,
        activity: ActivityTracker<S>,
        cache: Arc<TransformedDocumentCache>,
        builds: BuildController<S>,
        background: BackgroundExecutor,
    ) -> Self {
        Self {
            store,
            config,
            auth,
            activity,
            cache,
            builds,
            background,
        }
    }

    async fn revision(&self, principal: &Principal, package_id: &str, version: &str) -> CatalogResult<Revision> {
        self.auth.check_package(principal, package_id, Permission::Read).await?;
        resolve_revision(self.store.as_ref(), package_id, version).await
    }

    /// Revision resolved for a mutation: editing groups needs the permission
    /// of the revision status.
    async fn revision_for_update(&self, principal: &Principal, package_id: &str, version: &str) -> CatalogResult<Revision> {
        let revision = self.revision(principal, package_id, version).await?;
        self.auth
            .check_package(principal, package_id, Permission::for_version_status(revision.status))
            .await?;
        Ok(revision)
    }

    async fn find_group(&self, revision: &Revision, api_type: &str, group_name: &str) -> CatalogResult<OperationGroup> {
        let group_id = make_group_id(&revision.package_id, &revision.version, revision.revision, api_type, group_name);
        self.store
            .get_group(&group_id)
            .await?
            .ok_or_else(|| CatalogError::group_not_found(group_name))
    }

    /// Members must live in the revision itself or in one of its
    /// non-excluded references. Later duplicates replace earlier ones.
    async fn resolve_members(
        &self,
        revision: &Revision,
        api_type: &str,
        group_id: &str,
        refs: Vec<GroupOperationRef>,
    ) -> CatalogResult<Vec<GroupedOperation>> {
        let mut allowed: BTreeMap<(Id, String), i32> = BTreeMap::new();
        allowed.insert((revision.package_id.clone(), revision.version.clone()), revision.revision);
        for reference in self
            .store
            .list_references(&revision.package_id, &revision.version, revision.revision)
            .await?
            .into_iter()
            .filter(|r| !r.excluded)
        {
            allowed.insert((reference.ref_package_id, reference.ref_version), reference.ref_revision);
        }

        let mut members: BTreeMap<(Id, String, i32, String), GroupedOperation> = BTreeMap::new();
        for operation in refs {
            if operation.operation_id.is_empty() {
                return Err(CatalogError::empty_param("operationId"));
            }
            let package_id = operation
                .package_id
                .clone()
                .unwrap_or_else(|| revision.package_id.clone());
            let version = match operation.version.as_deref() {
                Some(raw) => VersionRef::parse(raw)?,
                None => VersionRef::exact(&revision.version, revision.revision),
            };
            let ref_revision = allowed
                .get(&(package_id.clone(), version.name.clone()))
                .copied()
                .filter(|rev| version.revision.map(|r| r == *rev).unwrap_or(true))
                .ok_or_else(|| {
                    CatalogError::validation(
                        codes::GROUPED_OPERATION_NOT_ALLOWED,
                        format!(
                            "Operation '{}' of '{}' {} is not part of {} or its references",
                            operation.operation_id,
                            package_id,
                            version,
                            revision.key()
                        ),
                    )
                    .with_param("operationId", &operation.operation_id)
                    .with_param("packageId", &package_id)
                    .with_param("version", &version)
                })?;
            self.store
                .get_operation(&package_id, &version.name, ref_revision, api_type, &operation.operation_id)
                .await?
                .ok_or_else(|| {
                    CatalogError::not_found(
                        codes::OPERATION_NOT_FOUND,
                        format!("Operation '{}' not found in '{}' {}", operation.operation_id, package_id, version),
                    )
                    .with_param("operationId", &operation.operation_id)
                })?;
            let key = (package_id.clone(), version.name.clone(), ref_revision, operation.operation_id.clone());
            members.insert(
                key,
                GroupedOperation {
                    group_id: group_id.to_string(),
                    package_id,
                    version: version.name,
                    revision: ref_revision,
                    operation_id: operation.operation_id,
                },
            );
        }

        let limit = self.config.limits.operation_group_operations_limit;
        if members.len() > limit {
            return Err(CatalogError::validation(
                codes::GROUP_OPERATIONS_LIMIT_EXCEEDED,
                format!(
                    "Operation group holds {} operations, the limit is {}",
                    members.len(),
                    limit
                ),
            )
            .with_param("limit", limit));
        }
        Ok(members.into_values().collect())
    }

    pub async fn create_group(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: &str,
        request: NewOperationGroup,
    ) -> CatalogResult<OperationGroup> {
        if request.group_name.trim().is_empty() {
            return Err(CatalogError::empty_param("groupName"));
        }
        let revision = self.revision_for_update(principal, package_id, version).await?;
        let mut group = OperationGroup::new(
            package_id,
            &revision.version,
            revision.revision,
            api_type,
            request.group_name.trim(),
            false,
        );
        if self.store.get_group(&group.group_id).await?.is_some() {
            return Err(already_exists(&group.group_name, &revision.key()));
        }
        let members = match request.operations {
            Some(refs) => self.resolve_members(&revision, api_type, &group.group_id, refs).await?,
            None => Vec::new(),
        };
        group.description = request.description;
        if let Some(template) = &request.template {
            group.template_checksum = Some(template.checksum());
            group.template_filename = Some(template.filename.clone());
        }
        group.operations_count = members.len();

        let entry = history(&group, GroupHistoryAction::Create, principal.actor_id(), false);
        self.store
            .write_group(
                GroupWrite {
                    group: group.clone(),
                    template: request.template,
                    operations: Some(members),
                    history: vec![entry],
                },
                None,
            )
            .await?;
        log::info!(
            "Created operation group '{}' in {} of '{}'",
            group.group_name,
            revision.key(),
            package_id
        );
        self.activity.track(ActivityEvent::for_version(
            EventType::CreateManualGroup,
            package_id,
            principal.actor_id(),
            &revision.version,
            revision.revision,
            serde_json::json!({ "groupName": group.group_name, "apiType": api_type }),
        ));
        Ok(group)
    }

    pub async fn update_group(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: &str,
        group_name: &str,
        patch: OperationGroupPatch,
    ) -> CatalogResult<OperationGroup> {
        let revision = self.revision_for_update(principal, package_id, version).await?;
        let current = self.find_group(&revision, api_type, group_name).await?;
        let renamed_to = patch
            .group_name
            .as_deref()
            .map(str::trim)
            .filter(|name| *name != current.group_name);
        if current.autogenerated && (renamed_to.is_some() || patch.operations.is_some()) {
            return Err(not_modifiable(&current));
        }
        if renamed_to == Some("") {
            return Err(CatalogError::empty_param("groupName"));
        }

        let mut group = current.clone();
        let mut changed: Vec<&str> = Vec::new();
        if let Some(name) = renamed_to {
            group.group_name = name.to_string();
            group.group_id = make_group_id(package_id, &revision.version, revision.revision, api_type, name);
            if self.store.get_group(&group.group_id).await?.is_some() {
                return Err(already_exists(name, &revision.key()));
            }
            changed.push("name");
        }
        if let Some(description) = patch.description.filter(|d| *d != current.description) {
            group.description = description;
            changed.push("description");
        }
        let mut template = None;
        if let Some(new_template) = patch.template {
            let checksum = new_template.as_ref().map(GroupTemplate::checksum);
            if checksum != current.template_checksum {
                group.template_checksum = checksum;
                group.template_filename = new_template.as_ref().map(|t| t.filename.clone());
                template = new_template;
                changed.push("template");
            }
        }
        let mut operations = None;
        if let Some(refs) = patch.operations {
            let members = self.resolve_members(&revision, api_type, &group.group_id, refs).await?;
            let before = self.store.list_grouped_operations(&current.group_id).await?;
            if member_keys(&before) != member_keys(&members) {
                group.operations_count = members.len();
                operations = Some(members);
                changed.push("operations");
            }
        }
        if changed.is_empty() {
            return Ok(current);
        }
        if renamed_to.is_some() || operations.is_some() {
            evict_transformed(self.store.as_ref(), &self.cache, &current.group_id).await?;
        }

        group.updated_at = Utc::now();
        let actor = principal.actor_id();
        let entries = if renamed_to.is_some() {
            vec![
                history(&current, GroupHistoryAction::Delete, actor, false),
                history(&group, GroupHistoryAction::Create, actor, false),
            ]
        } else {
            vec![history(&group, GroupHistoryAction::Update, actor, false)]
        };
        self.store
            .write_group(
                GroupWrite {
                    group: group.clone(),
                    template,
                    operations,
                    history: entries,
                },
                renamed_to.map(|_| current.group_id.as_str()),
            )
            .await?;
        let group = self.store.get_group(&group.group_id).await?.unwrap_or(group);
        self.activity.track(ActivityEvent::for_version(
            EventType::OperationsGroupParameters,
            package_id,
            actor,
            &revision.version,
            revision.revision,
            serde_json::json!({
                "groupName": group.group_name,
                "apiType": api_type,
                "changed": changed,
            }),
        ));
        Ok(group)
    }

    /// Full replacement: fields missing from the request are cleared.
    pub async fn replace_group(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: &str,
        group_name: &str,
        request: NewOperationGroup,
    ) -> CatalogResult<OperationGroup> {
        let revision = self.revision(principal, package_id, version).await?;
        let current = self.find_group(&revision, api_type, group_name).await?;
        let operations = if current.autogenerated {
            request.operations
        } else {
            Some(request.operations.unwrap_or_default())
        };
        let patch = OperationGroupPatch {
            group_name: Some(request.group_name),
            description: Some(request.description),
            template: Some(request.template),
            operations,
        };
        self.update_group(principal, package_id, version, api_type, group_name, patch)
            .await
    }

    pub async fn delete_group(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: &str,
        group_name: &str,
    ) -> CatalogResult<()> {
        let revision = self.revision_for_update(principal, package_id, version).await?;
        let group = self.find_group(&revision, api_type, group_name).await?;
        if group.autogenerated {
            return Err(not_modifiable(&group));
        }
        let actor = principal.actor_id();
        self.store
            .delete_group(&group.group_id, history(&group, GroupHistoryAction::Delete, actor, false))
            .await?;
        evict_transformed(self.store.as_ref(), &self.cache, &group.group_id).await?;
        self.activity.track(ActivityEvent::for_version(
            EventType::DeleteManualGroup,
            package_id,
            actor,
            &revision.version,
            revision.revision,
            serde_json::json!({ "groupName": group.group_name, "apiType": api_type }),
        ));
        Ok(())
    }

    pub async fn get_group(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: &str,
        group_name: &str,
    ) -> CatalogResult<OperationGroup> {
        let revision = self.revision(principal, package_id, version).await?;
        self.find_group(&revision, api_type, group_name).await
    }

    pub async fn list_groups(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: Option<&str>,
    ) -> CatalogResult<Vec<OperationGroup>> {
        let revision = self.revision(principal, package_id, version).await?;
        let mut groups: Vec<OperationGroup> = self
            .store
            .list_groups(package_id, &revision.version, revision.revision)
            .await?
            .into_iter()
            .filter(|g| api_type.map(|t| g.api_type == t).unwrap_or(true))
            .collect();
        groups.sort_by(|a, b| a.api_type.cmp(&b.api_type).then(a.group_name.cmp(&b.group_name)));
        Ok(groups)
    }

    async fn member_operations(&self, group: &OperationGroup) -> CatalogResult<Vec<Operation>> {
        let mut operations = Vec::new();
        for member in self.store.list_grouped_operations(&group.group_id).await? {
            match self
                .store
                .get_operation(&member.package_id, &member.version, member.revision, &group.api_type, &member.operation_id)
                .await?
            {
                Some(op) => operations.push(op),
                None => log::warn!(
                    "Group {} references missing operation '{}' of '{}'",
                    group.group_id,
                    member.operation_id,
                    member.package_id
                ),
            }
        }
        operations.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(operations)
    }

    pub async fn list_group_operations(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: &str,
        group_name: &str,
        filter: &OperationListFilter,
    ) -> CatalogResult<Vec<Operation>> {
        let group = self.get_group(principal, package_id, version, api_type, group_name).await?;
        let text = filter.text_filter.as_deref().and_then(TextFilter::parse);
        let operations = self
            .member_operations(&group)
            .await?
            .into_iter()
            .filter(|op| filter.kind.as_deref().map(|k| op.api_kind.as_str() == k).unwrap_or(true))
            .filter(|op| filter.tag.as_ref().map(|t| op.tags.contains(t)).unwrap_or(true))
            .filter(|op| !filter.empty_tag || op.tags.is_empty())
            .filter(|op| filter.deprecated.map(|d| op.deprecated == d).unwrap_or(true))
            .filter(|op| text.as_ref().map(|t| t.matches(op)).unwrap_or(true))
            .collect();
        Ok(filter.paging.apply(operations))
    }

    pub async fn get_group_template(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: &str,
        group_name: &str,
    ) -> CatalogResult<GroupTemplate> {
        let group = self.get_group(principal, package_id, version, api_type, group_name).await?;
        self.store
            .get_group_template(&group.group_id)
            .await?
            .ok_or_else(|| {
                CatalogError::not_found(
                    codes::TEMPLATE_NOT_FOUND,
                    format!("Operation group '{}' has no template", group_name),
                )
                .with_param("groupName", group_name)
            })
    }

    /// Newest first.
    pub async fn get_group_history(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: &str,
        group_name: &str,
    ) -> CatalogResult<Vec<OperationGroupHistory>> {
        let revision = self.revision(principal, package_id, version).await?;
        let group_id = make_group_id(package_id, &revision.version, revision.revision, api_type, group_name);
        let mut entries = self.store.list_group_history(&group_id).await?;
        if entries.is_empty() {
            return Err(CatalogError::group_not_found(group_name));
        }
        entries.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(entries)
    }

    /// Start publishing the group documents as a new version of the target
    /// package. Progress is tracked on the returned publish record.
    pub async fn publish_group(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: &str,
        group_name: &str,
        request: GroupPublishRequest,
    ) -> CatalogResult<GroupPublish> {
        let group = self.get_group(principal, package_id, version, api_type, group_name).await?;
        self.auth
            .check_package(principal, &request.package_id, Permission::for_version_status(request.status))
            .await?;
        let record = GroupPublish {
            publish_id: generate_id(),
            group_id: group.group_id.clone(),
            package_id: request.package_id.clone(),
            version: request.version.clone(),
            status: GroupPublishStatus::Running,
            details: String::new(),
            build_id: None,
            created_at: Utc::now(),
            created_by: principal.actor_id().to_string(),
        };
        self.store.insert_group_publish(record.clone()).await?;
        log::info!(
            "Publishing group '{}' of '{}' as {} of '{}' (publish {})",
            group.group_name,
            package_id,
            request.version,
            request.package_id,
            record.publish_id
        );

        let service = self.clone();
        let pending = record.clone();
        self.background.spawn("group-publish", async move {
            service.finish_publish(group, request, pending).await;
            Ok(())
        });
        Ok(record)
    }

    async fn finish_publish(&self, group: OperationGroup, request: GroupPublishRequest, mut record: GroupPublish) {
        match self.run_publish(&group, &request, &record).await {
            Ok(build_id) => {
                record.status = GroupPublishStatus::Complete;
                record.build_id = Some(build_id);
                self.activity.track(ActivityEvent::for_version(
                    EventType::PublishOperationsGroup,
                    &group.package_id,
                    &record.created_by,
                    &group.version,
                    group.revision,
                    serde_json::json!({
                        "groupName": group.group_name,
                        "targetPackageId": request.package_id,
                        "targetVersion": request.version,
                    }),
                ));
            }
            Err(e) => {
                log::error!("Publish {} of group {} failed: {}", record.publish_id, group.group_id, e);
                record.status = GroupPublishStatus::Error;
                record.details = e.to_string();
            }
        }
        if let Err(e) = self.store.update_group_publish(record.clone()).await {
            log::error!("Failed to record status of publish {}: {:#}", record.publish_id, e);
        }
    }

    async fn run_publish(
        &self,
        group: &OperationGroup,
        request: &GroupPublishRequest,
        record: &GroupPublish,
    ) -> CatalogResult<Id> {
        let document = self.transformed_document(group, &record.created_by).await?;
        let mut config = BuildConfig::new(&group.package_id, &group.version_key(), BuildType::Build, BuildFormat::Json);
        config.api_type = Some(group.api_type.clone());
        config.group_name = Some(group.group_name.clone());
        config.files = document
            .documents
            .iter()
            .map(|file| BuildFile {
                file_id: file.file_id.clone(),
                slug: file.slug.clone(),
                publish: true,
                labels: Vec::new(),
            })
            .collect();
        config.publish_target = Some(PublishTarget {
            package_id: request.package_id.clone(),
            version: request.version.clone(),
            status: request.status,
            previous_version: request.previous_version.clone(),
            previous_version_package_id: request.previous_version_package_id.clone(),
            labels: request.labels.clone(),
        });
        config.publish_id = Some(record.publish_id.clone());
        config.created_by = record.created_by.clone();

        let build_id = self.builds.create_build(config).await?;
        self.builds
            .await_completion(&build_id, self.config.await_timeout(), &self.background.cancellation_token())
            .await?;
        Ok(build_id)
    }

    /// Cached, stored, or freshly built reduced-source documents of a group.
    async fn transformed_document(&self, group: &OperationGroup, author: &str) -> CatalogResult<TransformedDocument> {
        let key = TransformedDocumentKey {
            package_id: group.package_id.clone(),
            version: group.version_key(),
            api_type: group.api_type.clone(),
            group_id: group.group_id.clone(),
            build_type: BuildType::ReducedSourceSpecifications,
            format: BuildFormat::Json,
        };
        if let Some(document) = self.cache.get(&key).await {
            log::debug!("Transformed documents of group {} served from cache", group.group_id);
            return Ok(document);
        }
        if let Some(document) = self.store.get_transformed_document(&key).await? {
            self.cache.put(document.clone()).await;
            return Ok(document);
        }

        let mut config = BuildConfig::new(
            &group.package_id,
            &group.version_key(),
            BuildType::ReducedSourceSpecifications,
            BuildFormat::Json,
        );
        config.api_type = Some(group.api_type.clone());
        config.group_name = Some(group.group_name.clone());
        config.created_by = author.to_string();
        let build_id = self.builds.create_build(config).await?;
        self.builds
            .await_completion(&build_id, self.config.await_timeout(), &self.background.cancellation_token())
            .await?;
        let document = self
            .store
            .get_transformed_document(&key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Build {} produced no documents for group {}", build_id, group.group_id))?;
        self.cache.put(document.clone()).await;
        Ok(document)
    }

    pub async fn get_publish_status(&self, principal: &Principal, publish_id: &str) -> CatalogResult<GroupPublish> {
        let record = self
            .store
            .get_group_publish(publish_id)
            .await?
            .ok_or_else(|| {
                CatalogError::not_found(
                    codes::PUBLISH_NOT_FOUND,
                    format!("Publish process '{}' not found", publish_id),
                )
                .with_param("publishId", publish_id)
            })?;
        self.auth
            .check_package(principal, &record.package_id, Permission::Read)
            .await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewOperation, PackageKind, VersionReference, VersionStatus, ROLE_VIEWER};
    use crate::storage::ObjectStorage;
    use crate::store::traits::NewRevision;
    use crate::store::MemoryStore;
    use crate::store::traits::*;

    fn package(id: &str, kind: PackageKind, prefix: &str) -> Package {
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
            rest_grouping_prefix: prefix.to_string(),
            exclude_from_search: false,
            image_url: String::new(),
            created_at: Utc::now(),
            created_by: "root".to_string(),
            deleted_at: None,
            deleted_by: None,
        }
    }

    fn op(package_id: &str, id: &str, path: &str) -> Operation {
        serde_json::from_value::<NewOperation>(serde_json::json!({
            "operationId": id,
            "title": id,
            "method": "get",
            "path": path,
        }))
        .unwrap()
        .into_operation(package_id, "2025.1", 0)
    }

    async fn publish(store: &MemoryStore, package_id: &str, operations: Vec<Operation>, references: Vec<VersionReference>) -> Revision {
        store
            .insert_revision(NewRevision {
                revision: Revision {
                    package_id: package_id.to_string(),
                    version: "2025.1".to_string(),
                    revision: 0,
                    status: VersionStatus::Draft,
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
                operations,
                references,
            })
            .await
            .unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        groups: GroupService<MemoryStore>,
        cache: Arc<TransformedDocumentCache>,
        root: Principal,
    }

    async fn fixture(limit: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.add_sysadmin("root").await.unwrap();
        store.insert_package(package("acme", PackageKind::Workspace, "")).await.unwrap();
        store.insert_package(package("acme.gw", PackageKind::Package, "")).await.unwrap();
        store.insert_package(package("acme.other", PackageKind::Package, "")).await.unwrap();
        store.insert_package(package("acme.dash", PackageKind::Dashboard, "")).await.unwrap();
        publish(
            &store,
            "acme.gw",
            vec![
                op("acme.gw", "get-users", "/api/users/list"),
                op("acme.gw", "get-user", "/api/users/{id}"),
                op("acme.gw", "get-orders", "/api/orders/list"),
            ],
            vec![],
        )
        .await;
        publish(&store, "acme.other", vec![op("acme.other", "get-stock", "/stock")], vec![]).await;
        publish(
            &store,
            "acme.dash",
            vec![],
            vec![VersionReference {
                package_id: "acme.dash".to_string(),
                version: "2025.1".to_string(),
                revision: 0,
                ref_package_id: "acme.gw".to_string(),
                ref_version: "2025.1".to_string(),
                ref_revision: 1,
                excluded: false,
            }],
        )
        .await;

        let mut config = AppConfig::default();
        config.limits.operation_group_operations_limit = limit;
        let config = Arc::new(config);
        let background = BackgroundExecutor::new(2);
        let activity = ActivityTracker::new(store.clone(), background.clone());
        let auth = Authorization::new(store.clone(), activity.clone());
        let cache = Arc::new(TransformedDocumentCache::new());
        let builds = BuildController::new(store.clone(), Arc::new(ObjectStorage::new(store.clone())), config.clone());
        let groups = GroupService::new(store.clone(), config, auth, activity, cache.clone(), builds, background);
        Fixture {
            store,
            groups,
            cache,
            root: Principal::user("root"),
        }
    }

    fn refs(ids: &[&str]) -> Option<Vec<GroupOperationRef>> {
        Some(
            ids.iter()
                .map(|id| GroupOperationRef {
                    operation_id: id.to_string(),
                    package_id: None,
                    version: None,
                })
                .collect(),
        )
    }

    fn new_group(name: &str, ids: &[&str]) -> NewOperationGroup {
        NewOperationGroup {
            group_name: name.to_string(),
            description: String::new(),
            template: None,
            operations: refs(ids),
        }
    }

    #[tokio::test]
    async fn test_group_size_limit_boundary() {
        let f = fixture(2).await;
        let group = f
            .groups
            .create_group(&f.root, "acme.gw", "2025.1", "rest", new_group("two", &["get-users", "get-user"]))
            .await
            .unwrap();
        assert_eq!(group.operations_count, 2);
        let err = f
            .groups
            .create_group(
                &f.root,
                "acme.gw",
                "2025.1",
                "rest",
                new_group("three", &["get-users", "get-user", "get-orders"]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::GROUP_OPERATIONS_LIMIT_EXCEEDED);
    }

    #[tokio::test]
    async fn test_duplicates_and_foreign_operations() {
        let f = fixture(10).await;
        let group = f
            .groups
            .create_group(&f.root, "acme.gw", "2025.1", "rest", new_group("users", &["get-users", "get-users"]))
            .await
            .unwrap();
        assert_eq!(group.operations_count, 1);

        let err = f
            .groups
            .create_group(&f.root, "acme.gw", "2025.1", "rest", new_group("users", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::OPERATION_GROUP_ALREADY_EXISTS);

        let foreign = NewOperationGroup {
            operations: Some(vec![GroupOperationRef {
                operation_id: "get-stock".to_string(),
                package_id: Some("acme.other".to_string()),
                version: Some("2025.1".to_string()),
            }]),
            ..new_group("stock", &[])
        };
        let err = f
            .groups
            .create_group(&f.root, "acme.gw", "2025.1", "rest", foreign)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::GROUPED_OPERATION_NOT_ALLOWED);

        let referenced = NewOperationGroup {
            operations: Some(vec![GroupOperationRef {
                operation_id: "get-users".to_string(),
                package_id: Some("acme.gw".to_string()),
                version: Some("2025.1@1".to_string()),
            }]),
            ..new_group("from-ref", &[])
        };
        let group = f
            .groups
            .create_group(&f.root, "acme.dash", "2025.1", "rest", referenced)
            .await
            .unwrap();
        assert_eq!(group.operations_count, 1);
    }

    #[tokio::test]
    async fn test_rename_and_unchanged_replace() {
        let f = fixture(10).await;
        f.groups
            .create_group(&f.root, "acme.gw", "2025.1", "rest", new_group("users", &["get-users", "get-user"]))
            .await
            .unwrap();
        let group = f.groups.get_group(&f.root, "acme.gw", "2025.1", "rest", "users").await.unwrap();
        f.cache
            .put(TransformedDocument {
                key: TransformedDocumentKey {
                    package_id: "acme.gw".to_string(),
                    version: group.version_key(),
                    api_type: "rest".to_string(),
                    group_id: group.group_id.clone(),
                    build_type: BuildType::ReducedSourceSpecifications,
                    format: BuildFormat::Json,
                },
                build_id: "b1".to_string(),
                documents: vec![],
                created_at: Utc::now(),
            })
            .await;

        f.groups
            .replace_group(&f.root, "acme.gw", "2025.1", "rest", "users", new_group("users", &["get-user", "get-users"]))
            .await
            .unwrap();
        assert_eq!(f.cache.len().await, 1);

        let renamed = f
            .groups
            .update_group(
                &f.root,
                "acme.gw",
                "2025.1",
                "rest",
                "users",
                OperationGroupPatch {
                    group_name: Some("people".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.operations_count, 2);
        assert_eq!(f.cache.len().await, 0);
        assert!(f.groups.get_group(&f.root, "acme.gw", "2025.1", "rest", "users").await.is_err());

        let history = f
            .groups
            .get_group_history(&f.root, "acme.gw", "2025.1", "rest", "people")
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, GroupHistoryAction::Create);
        let old = f
            .groups
            .get_group_history(&f.root, "acme.gw", "2025.1", "rest", "users")
            .await
            .unwrap();
        assert!(old.iter().any(|h| h.action == GroupHistoryAction::Delete));
    }

    #[tokio::test]
    async fn test_autogenerated_groups() {
        let f = fixture(10).await;
        let pkg = package("acme.gw", PackageKind::Package, "/api/{group}/");
        let revision = f.store.get_latest_revision("acme.gw", "2025.1").await.unwrap().unwrap();
        let written = recalculate_autogenerated_groups(f.store.as_ref(), &f.cache, &pkg, &revision, 10)
            .await
            .unwrap();
        assert_eq!(written, 2);
        let groups = f.groups.list_groups(&f.root, "acme.gw", "2025.1", Some("rest")).await.unwrap();
        let names: Vec<&str> = groups.iter().map(|g| g.group_name.as_str()).collect();
        assert_eq!(names, vec!["orders", "users"]);
        assert!(groups.iter().all(|g| g.autogenerated));

        let again = recalculate_autogenerated_groups(f.store.as_ref(), &f.cache, &pkg, &revision, 10)
            .await
            .unwrap();
        assert_eq!(again, 0);

        let err = f
            .groups
            .update_group(
                &f.root,
                "acme.gw",
                "2025.1",
                "rest",
                "users",
                OperationGroupPatch {
                    operations: refs(&["get-users"]),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::OPERATION_GROUP_NOT_MODIFIABLE);
        let described = f
            .groups
            .update_group(
                &f.root,
                "acme.gw",
                "2025.1",
                "rest",
                "users",
                OperationGroupPatch {
                    description: Some("User endpoints".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(described.description, "User endpoints");
        assert!(f
            .groups
            .delete_group(&f.root, "acme.gw", "2025.1", "rest", "users")
            .await
            .is_err());

        let cleared = package("acme.gw", PackageKind::Package, "");
        recalculate_autogenerated_groups(f.store.as_ref(), &f.cache, &cleared, &revision, 10)
            .await
            .unwrap();
        assert!(f.groups.list_groups(&f.root, "acme.gw", "2025.1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_template_and_viewer_access() {
        let f = fixture(10).await;
        let request = NewOperationGroup {
            template: Some(GroupTemplate {
                filename: "template.yaml".to_string(),
                data: b"openapi: 3.0.0".to_vec(),
            }),
            ..new_group("users", &["get-users"])
        };
        f.groups
            .create_group(&f.root, "acme.gw", "2025.1", "rest", request)
            .await
            .unwrap();
        let viewer = Principal::user("viewer");
        let template = f
            .groups
            .get_group_template(&viewer, "acme.gw", "2025.1", "rest", "users")
            .await
            .unwrap();
        assert_eq!(template.filename, "template.yaml");
        let err = f
            .groups
            .delete_group(&viewer, "acme.gw", "2025.1", "rest", "users")
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INSUFFICIENT_PRIVILEGES);
        let ops = f
            .groups
            .list_group_operations(&viewer, "acme.gw", "2025.1", "rest", "users", &OperationListFilter::default())
            .await
            .unwrap();
        assert_eq!(ops.len(), 1);
    }
}
