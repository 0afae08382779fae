use chrono::{DateTime, Utc};

use crate::model::{
    ActivityEvent, ApiKey, Build, BuildStatus, CleanupRun, EventType, ExportResultRecord,
    GroupPublish, GroupTemplate, GroupWrite, GroupedOperation, Id, MigrationCleanupJob, Operation,
    OperationGroup, OperationGroupHistory, Package, PackageKind, PackageMemberRole,
    PackageTransition, PublishedDocument, Revision, Role, TransformedDocument,
    TransformedDocumentKey, User, VersionComparison, VersionReference, VersionStatus,
};
use anyhow::Result;

/// Rename of a package subtree, applied in one transaction.
#[derive(Debug, Clone)]
pub struct PackageMove {
    pub from_id: Id,
    pub to_id: Id,
    /// New kind of the moved root when it changes between workspace and group.
    pub new_kind: Option<PackageKind>,
    pub transitions: Vec<PackageTransition>,
    /// Drop transitions that currently start at `to_id`.
    pub overwrite_history: bool,
}

/// Content of a revision before its number is allocated.
#[derive(Debug, Clone)]
pub struct NewRevision {
    pub revision: Revision,
    pub documents: Vec<PublishedDocument>,
    pub operations: Vec<Operation>,
    pub references: Vec<VersionReference>,
}

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// `None` means every package.
    pub package_ids: Option<Vec<Id>>,
    pub types: Vec<EventType>,
    pub offset: usize,
    pub limit: usize,
}

#[async_trait::async_trait]
pub trait PackageStore: Send + Sync {
    /// Get a package by id, soft-deleted ones included
    async fn get_package(&self, id: &str) -> Result<Option<Package>>;
    /// All live packages
    async fn list_packages(&self) -> Result<Vec<Package>>;
    /// Live packages strictly below `id`
    async fn list_descendants(&self, id: &str) -> Result<Vec<Package>>;
    async fn insert_package(&self, package: Package) -> Result<()>;
    async fn update_package(&self, package: Package) -> Result<()>;
    /// Soft delete `id` and its subtree, returning the affected ids
    async fn soft_delete_tree(&self, id: &str, user_id: &str, at: DateTime<Utc>) -> Result<Vec<Id>>;
    /// Permanently drop soft-deleted rows so their ids can be reused
    async fn purge_deleted_tree(&self, id: &str) -> Result<()>;
    async fn move_package_tree(&self, request: PackageMove) -> Result<()>;

    async fn list_transitions_from(&self, from_id: &str) -> Result<Vec<PackageTransition>>;
    /// Transitions where `id` is either endpoint, oldest first
    async fn list_transitions_touching(&self, id: &str) -> Result<Vec<PackageTransition>>;
    async fn get_transition(&self, move_id: &str) -> Result<Option<PackageTransition>>;
    async fn complete_transitions(
        &self,
        move_id: &str,
        status: crate::model::TransitionStatus,
        details: Option<String>,
    ) -> Result<()>;

    async fn add_favorite(&self, user_id: &str, package_id: &str) -> Result<()>;
    async fn remove_favorite(&self, user_id: &str, package_id: &str) -> Result<()>;
    async fn list_favorites(&self, user_id: &str) -> Result<Vec<Id>>;
}

#[async_trait::async_trait]
pub trait VersionStore: Send + Sync {
    /// Allocate `max(revision) + 1` under a lock on the version and persist
    /// the revision with its content. The maximum counts soft-deleted
    /// revisions, so numbers keep growing after a delete and a deleted
    /// `name@N` is never reused.
    async fn insert_revision(&self, content: NewRevision) -> Result<Revision>;
    async fn get_revision(&self, package_id: &str, version: &str, revision: i32) -> Result<Option<Revision>>;
    async fn get_latest_revision(&self, package_id: &str, version: &str) -> Result<Option<Revision>>;
    /// Live revisions of a version, oldest first
    async fn list_revisions(&self, package_id: &str, version: &str) -> Result<Vec<Revision>>;
    /// Latest live revision of every version of the package
    async fn list_versions(&self, package_id: &str) -> Result<Vec<Revision>>;
    async fn update_revision_meta(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
        status: VersionStatus,
        labels: Vec<String>,
    ) -> Result<()>;
    async fn delete_version(&self, package_id: &str, version: &str, user_id: &str, at: DateTime<Utc>) -> Result<bool>;
    async fn list_documents(&self, package_id: &str, version: &str, revision: i32) -> Result<Vec<PublishedDocument>>;
    async fn list_references(&self, package_id: &str, version: &str, revision: i32) -> Result<Vec<VersionReference>>;
    /// References pointing at any version of `package_id`
    async fn list_referrers(&self, package_id: &str) -> Result<Vec<VersionReference>>;
    /// Publish ids of revisions deleted before `before` whose sources are still stored
    async fn list_unpurged_deleted_sources(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Id>>;
    async fn mark_sources_purged(&self, publish_ids: &[Id]) -> Result<()>;
}

#[async_trait::async_trait]
pub trait OperationStore: Send + Sync {
    async fn list_operations(&self, package_id: &str, version: &str, revision: i32) -> Result<Vec<Operation>>;
    async fn get_operation(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
        api_type: &str,
        operation_id: &str,
    ) -> Result<Option<Operation>>;
    async fn put_comparison(&self, comparison: VersionComparison) -> Result<()>;
    async fn get_comparison(&self, comparison_id: &str) -> Result<Option<VersionComparison>>;
}

#[async_trait::async_trait]
pub trait GroupStore: Send + Sync {
    async fn get_group(&self, group_id: &str) -> Result<Option<OperationGroup>>;
    async fn list_groups(&self, package_id: &str, version: &str, revision: i32) -> Result<Vec<OperationGroup>>;
    async fn list_grouped_operations(&self, group_id: &str) -> Result<Vec<GroupedOperation>>;
    /// Upsert group metadata, template, membership and history atomically.
    /// `replaces` names a group id removed in the same transaction (rename).
    async fn write_group(&self, write: GroupWrite, replaces: Option<&str>) -> Result<()>;
    async fn delete_group(&self, group_id: &str, history: OperationGroupHistory) -> Result<bool>;
    async fn get_group_template(&self, group_id: &str) -> Result<Option<GroupTemplate>>;
    async fn list_group_history(&self, group_id: &str) -> Result<Vec<OperationGroupHistory>>;

    async fn get_transformed_document(&self, key: &TransformedDocumentKey) -> Result<Option<TransformedDocument>>;
    async fn put_transformed_document(&self, document: TransformedDocument) -> Result<()>;
    async fn delete_transformed_documents(&self, group_id: &str) -> Result<usize>;
    async fn delete_transformed_documents_before(&self, before: DateTime<Utc>) -> Result<usize>;

    async fn insert_group_publish(&self, publish: GroupPublish) -> Result<()>;
    async fn update_group_publish(&self, publish: GroupPublish) -> Result<()>;
    async fn get_group_publish(&self, publish_id: &str) -> Result<Option<GroupPublish>>;
}

#[async_trait::async_trait]
pub trait BuildStore: Send + Sync {
    async fn insert_build(&self, build: Build) -> Result<()>;
    async fn get_build(&self, build_id: &str) -> Result<Option<Build>>;
    /// A live build with the same config checksum: not finished yet, or
    /// complete with a result created after `results_after`
    async fn find_reusable_build(&self, checksum: &str, results_after: DateTime<Utc>) -> Result<Option<Build>>;
    /// Move a build forward only if its current status is in `from`
    async fn transition_build(
        &self,
        build_id: &str,
        from: &[BuildStatus],
        to: BuildStatus,
        details: &str,
    ) -> Result<bool>;
    /// Claim the oldest NotStarted build for a worker and start its lease
    async fn claim_next_build(&self, worker_id: &str) -> Result<Option<Build>>;
    /// Extend the lease of a running build still held by `worker_id`
    async fn heartbeat_build(&self, build_id: &str, worker_id: &str) -> Result<bool>;
    /// Put running builds whose last heartbeat is older than `stale_before`
    /// back in the queue, returning their ids
    async fn requeue_stale_builds(&self, stale_before: DateTime<Utc>) -> Result<Vec<Id>>;
    /// Insert unless a record for the build already exists
    async fn insert_export_result(&self, record: ExportResultRecord) -> Result<bool>;
    async fn get_export_result(&self, build_id: &str) -> Result<Option<ExportResultRecord>>;
    /// Builds with a stored result created before `before`
    async fn list_expired_results(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Id>>;
    /// Drop result records and flag the builds
    async fn mark_results_deleted(&self, build_ids: &[Id]) -> Result<()>;
}

/// Row-store backend of the object storage facade.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_blob(&self, table: &str, id: &str, data: &[u8]) -> Result<()>;
    async fn get_blob(&self, table: &str, id: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_blobs(&self, table: &str, ids: &[Id]) -> Result<usize>;
    async fn list_blob_ids(&self, table: &str, offset: i64, limit: i64) -> Result<Vec<Id>>;
}

#[async_trait::async_trait]
pub trait AuthStore: Send + Sync {
    async fn list_roles(&self) -> Result<Vec<Role>>;
    async fn get_role(&self, id: &str) -> Result<Option<Role>>;
    /// Shift every rank >= `role.rank` up by one and insert the role
    async fn insert_role(&self, role: Role) -> Result<()>;
    async fn update_role(&self, role: Role) -> Result<()>;
    /// Remove the role and strip it from member assignments
    async fn delete_role(&self, id: &str) -> Result<bool>;
    async fn set_role_ranks(&self, ranks: Vec<(String, i32)>) -> Result<()>;

    async fn get_member_roles(&self, package_id: &str, user_id: &str) -> Result<Option<PackageMemberRole>>;
    async fn list_member_roles(&self, package_ids: &[Id]) -> Result<Vec<PackageMemberRole>>;
    async fn list_member_roles_for_user(&self, user_id: &str) -> Result<Vec<PackageMemberRole>>;
    /// Replace the assignment; an empty role list removes it
    async fn put_member_roles(&self, member: PackageMemberRole) -> Result<()>;
    async fn delete_member(&self, package_id: &str, user_id: &str) -> Result<bool>;

    async fn get_user(&self, id: &str) -> Result<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn upsert_user(&self, user: User) -> Result<()>;
    async fn is_sysadmin(&self, user_id: &str) -> Result<bool>;
    async fn add_sysadmin(&self, user_id: &str) -> Result<()>;

    /// Returns false when a live key with the same name exists in the package
    async fn insert_api_key(&self, key: ApiKey) -> Result<bool>;
    async fn get_api_key(&self, id: &str) -> Result<Option<ApiKey>>;
    async fn find_api_key_by_hash(&self, token_hash: &str) -> Result<Option<ApiKey>>;
    async fn list_api_keys(&self, package_id: &str) -> Result<Vec<ApiKey>>;
    async fn revoke_api_key(&self, id: &str, user_id: &str, at: DateTime<Utc>) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait ActivityStore: Send + Sync {
    async fn insert_events(&self, events: Vec<ActivityEvent>) -> Result<()>;
    /// Newest first
    async fn list_events(&self, query: EventQuery) -> Result<Vec<ActivityEvent>>;
}

#[async_trait::async_trait]
pub trait CleanupStore: Send + Sync {
    /// Claim the next run id unless the last successful run started less
    /// than `min_interval` before `now`
    async fn begin_cleanup_run(&self, min_interval: chrono::Duration, now: DateTime<Utc>) -> Result<Option<CleanupRun>>;
    async fn finish_cleanup_run(&self, run: CleanupRun) -> Result<()>;
    async fn last_cleanup_run(&self) -> Result<Option<CleanupRun>>;
    async fn put_migration_job(&self, job: MigrationCleanupJob) -> Result<()>;
    async fn get_migration_job(&self, job_id: &str) -> Result<Option<MigrationCleanupJob>>;
    /// Builds created by storage migrations, oldest first
    async fn list_migration_builds(&self, limit: i64) -> Result<Vec<Id>>;
}

pub trait Store:
    PackageStore
    + VersionStore
    + OperationStore
    + GroupStore
    + BuildStore
    + BlobStore
    + AuthStore
    + ActivityStore
    + CleanupStore
    + Send
    + Sync
{
}
