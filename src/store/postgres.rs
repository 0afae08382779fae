use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Postgres, Row, Transaction};

use crate::model::{
    comparison_id, ActivityEvent, ApiKey, ApiKind, Build, BuildStatus, CleanupRun,
    ExportResultRecord, GroupPublish, GroupTemplate, GroupWrite, GroupedOperation, Id,
    MigrationCleanupJob, Operation, OperationGroup, OperationGroupHistory, Package,
    PackageMemberRole, PackageTransition, PublishedDocument, Revision, Role, TransformedDocument,
    TransformedDocumentKey, TransitionStatus, User, VersionComparison, VersionReference,
    VersionStatus, MIGRATION_BUILD_AUTHOR,
};
use crate::store::traits::{
    ActivityStore, AuthStore, BlobStore, BuildStore, CleanupStore, EventQuery, GroupStore,
    NewRevision, OperationStore, PackageMove, PackageStore, Store, VersionStore,
};

/// Tables and columns holding package ids, rewritten when a subtree moves.
const PACKAGE_ID_COLUMNS: &[(&str, &str)] = &[
    ("versions", "package_id"),
    ("revisions", "package_id"),
    ("revisions", "previous_version_package_id"),
    ("published_documents", "package_id"),
    ("operations", "package_id"),
    ("version_references", "package_id"),
    ("version_references", "ref_package_id"),
    ("version_comparisons", "package_id"),
    ("version_comparisons", "previous_package_id"),
    ("operation_groups", "package_id"),
    ("grouped_operations", "package_id"),
    ("package_member_roles", "package_id"),
    ("api_keys", "package_id"),
    ("favorites", "package_id"),
];

const PACKAGE_COLUMNS: &str = "id, kind, parent_id, alias, name, description, default_role, \
     default_release_version, release_version_pattern, service_name, rest_grouping_prefix, \
     exclude_from_search, image_url, created_at, created_by, deleted_at, deleted_by";

const REVISION_COLUMNS: &str = "package_id, version, revision, status, previous_version, \
     previous_version_package_id, labels, published_at, created_by, publish_id, deleted_at, deleted_by";

const GROUP_SELECT: &str = "SELECT g.group_id, g.package_id, g.version, g.revision, g.api_type, \
     g.group_name, g.description, g.autogenerated, g.template_checksum, g.template_filename, \
     g.created_at, g.updated_at, \
     (SELECT COUNT(*) FROM grouped_operations o WHERE o.group_id = g.group_id) AS operations_count \
     FROM operation_groups g";

const BUILD_COLUMNS: &str = "build_id, config, checksum, status, details, created_at, created_by, \
     started_at, finished_at, worker_id, heartbeat_at, result_deleted";

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse::<T>().map_err(|e| anyhow!(e))
}

fn package_from_row(row: &PgRow) -> Result<Package> {
    Ok(Package {
        id: row.get("id"),
        kind: parse_enum(row.get::<String, _>("kind").as_str())?,
        parent_id: row.get("parent_id"),
        alias: row.get("alias"),
        name: row.get("name"),
        description: row.get("description"),
        default_role: row.get("default_role"),
        default_release_version: row.get("default_release_version"),
        release_version_pattern: row.get("release_version_pattern"),
        service_name: row.get("service_name"),
        rest_grouping_prefix: row.get("rest_grouping_prefix"),
        exclude_from_search: row.get("exclude_from_search"),
        image_url: row.get("image_url"),
        created_at: row.get("created_at"),
        created_by: row.get("created_by"),
        deleted_at: row.get("deleted_at"),
        deleted_by: row.get("deleted_by"),
    })
}

fn transition_from_row(row: &PgRow) -> Result<PackageTransition> {
    Ok(PackageTransition {
        move_id: row.get("move_id"),
        from_id: row.get("from_id"),
        to_id: row.get("to_id"),
        status: parse_enum(row.get::<String, _>("status").as_str())?,
        details: row.get("details"),
        created_at: row.get("created_at"),
        created_by: row.get("created_by"),
        completed_at: row.get("completed_at"),
        seq: row.get("seq"),
    })
}

fn revision_from_row(row: &PgRow) -> Result<Revision> {
    Ok(Revision {
        package_id: row.get("package_id"),
        version: row.get("version"),
        revision: row.get("revision"),
        status: parse_enum(row.get::<String, _>("status").as_str())?,
        previous_version: row.get("previous_version"),
        previous_version_package_id: row.get("previous_version_package_id"),
        labels: serde_json::from_value(row.get("labels")).context("Failed to decode labels")?,
        published_at: row.get("published_at"),
        created_by: row.get("created_by"),
        publish_id: row.get("publish_id"),
        deleted_at: row.get("deleted_at"),
        deleted_by: row.get("deleted_by"),
    })
}

fn document_from_row(row: &PgRow) -> Result<PublishedDocument> {
    Ok(PublishedDocument {
        package_id: row.get("package_id"),
        version: row.get("version"),
        revision: row.get("revision"),
        file_id: row.get("file_id"),
        slug: row.get("slug"),
        title: row.get("title"),
        api_type: row.get("api_type"),
        format: row.get("format"),
        checksum: row.get("checksum"),
        operation_ids: serde_json::from_value(row.get("operation_ids"))
            .context("Failed to decode operation ids")?,
        data: row.get("data"),
    })
}

fn operation_from_row(row: &PgRow) -> Result<Operation> {
    Ok(Operation {
        package_id: row.get("package_id"),
        version: row.get("version"),
        revision: row.get("revision"),
        api_type: row.get("api_type"),
        operation_id: row.get("operation_id"),
        document_slug: row.get("document_slug"),
        title: row.get("title"),
        method: row.get("method"),
        path: row.get("path"),
        op_type: row.get("op_type"),
        api_kind: ApiKind::parse(row.get::<String, _>("api_kind").as_str()),
        api_audience: row.get("api_audience"),
        tags: serde_json::from_value(row.get("tags")).context("Failed to decode tags")?,
        custom_tags: serde_json::from_value(row.get("custom_tags"))
            .context("Failed to decode custom tags")?,
        deprecated: row.get("deprecated"),
        models: serde_json::from_value(row.get("models")).context("Failed to decode models")?,
        data_hash: row.get("data_hash"),
        data: row.get("data"),
    })
}

fn reference_from_row(row: &PgRow) -> VersionReference {
    VersionReference {
        package_id: row.get("package_id"),
        version: row.get("version"),
        revision: row.get("revision"),
        ref_package_id: row.get("ref_package_id"),
        ref_version: row.get("ref_version"),
        ref_revision: row.get("ref_revision"),
        excluded: row.get("excluded"),
    }
}

fn group_from_row(row: &PgRow) -> OperationGroup {
    OperationGroup {
        group_id: row.get("group_id"),
        package_id: row.get("package_id"),
        version: row.get("version"),
        revision: row.get("revision"),
        api_type: row.get("api_type"),
        group_name: row.get("group_name"),
        description: row.get("description"),
        autogenerated: row.get("autogenerated"),
        template_checksum: row.get("template_checksum"),
        template_filename: row.get("template_filename"),
        operations_count: row.get::<i64, _>("operations_count") as usize,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn history_from_row(row: &PgRow) -> Result<OperationGroupHistory> {
    Ok(OperationGroupHistory {
        group_id: row.get("group_id"),
        action: parse_enum(row.get::<String, _>("action").as_str())?,
        data: row.get("data"),
        user_id: row.get("user_id"),
        date: row.get("date"),
        automatic: row.get("automatic"),
    })
}

fn build_from_row(row: &PgRow) -> Result<Build> {
    Ok(Build {
        build_id: row.get("build_id"),
        config: serde_json::from_value(row.get("config")).context("Failed to decode build config")?,
        checksum: row.get("checksum"),
        status: parse_enum(row.get::<String, _>("status").as_str())?,
        details: row.get("details"),
        created_at: row.get("created_at"),
        created_by: row.get("created_by"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        worker_id: row.get("worker_id"),
        heartbeat_at: row.get("heartbeat_at"),
        result_deleted: row.get("result_deleted"),
    })
}

fn export_result_from_row(row: &PgRow) -> Result<ExportResultRecord> {
    Ok(ExportResultRecord {
        build_id: row.get("build_id"),
        filename: row.get("filename"),
        created_at: row.get("created_at"),
        created_by: row.get("created_by"),
        config: serde_json::from_value(row.get("config")).context("Failed to decode export config")?,
    })
}

fn role_from_row(row: &PgRow) -> Result<Role> {
    Ok(Role {
        id: row.get("id"),
        display_name: row.get("display_name"),
        permissions: serde_json::from_value(row.get("permissions"))
            .context("Failed to decode role permissions")?,
        rank: row.get("rank"),
        read_only: row.get("read_only"),
    })
}

fn member_from_row(row: &PgRow) -> Result<PackageMemberRole> {
    Ok(PackageMemberRole {
        package_id: row.get("package_id"),
        user_id: row.get("user_id"),
        role_ids: serde_json::from_value(row.get("role_ids")).context("Failed to decode member roles")?,
        updated_at: row.get("updated_at"),
        updated_by: row.get("updated_by"),
    })
}

fn user_from_row(row: &PgRow) -> User {
    User {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        avatar_url: row.get("avatar_url"),
        private_package_id: row.get("private_package_id"),
    }
}

fn api_key_from_row(row: &PgRow) -> Result<ApiKey> {
    Ok(ApiKey {
        id: row.get("id"),
        package_id: row.get("package_id"),
        name: row.get("name"),
        roles: serde_json::from_value(row.get("roles")).context("Failed to decode api key roles")?,
        created_by: row.get("created_by"),
        created_for: row.get("created_for"),
        created_at: row.get("created_at"),
        deleted_at: row.get("deleted_at"),
        deleted_by: row.get("deleted_by"),
        token_hash: row.get("token_hash"),
    })
}

fn cleanup_run_from_row(row: &PgRow) -> CleanupRun {
    CleanupRun {
        run_id: row.get("run_id"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        deleted_builds: row.get::<i64, _>("deleted_builds") as usize,
        deleted_transformed_documents: row.get::<i64, _>("deleted_transformed_documents") as usize,
        deleted_sources: row.get::<i64, _>("deleted_sources") as usize,
        error: row.get("error"),
    }
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_transition(tx: &mut Transaction<'_, Postgres>, t: &PackageTransition) -> Result<()> {
        sqlx::query(
            "INSERT INTO package_transitions (move_id, from_id, to_id, status, details, created_at, created_by, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&t.move_id)
        .bind(&t.from_id)
        .bind(&t.to_id)
        .bind(t.status.as_str())
        .bind(&t.details)
        .bind(t.created_at)
        .bind(&t.created_by)
        .bind(t.completed_at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert package transition")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PackageStore for PostgresStore {
    async fn get_package(&self, id: &str) -> Result<Option<Package>> {
        let row = sqlx::query(&format!("SELECT {} FROM packages WHERE id = $1", PACKAGE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch package")?;

        row.as_ref().map(package_from_row).transpose()
    }

    async fn list_packages(&self) -> Result<Vec<Package>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM packages WHERE deleted_at IS NULL ORDER BY id",
            PACKAGE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list packages")?;

        rows.iter().map(package_from_row).collect()
    }

    async fn list_descendants(&self, id: &str) -> Result<Vec<Package>> {
        let prefix = format!("{}.", id);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM packages WHERE deleted_at IS NULL AND left(id, length($1)) = $1 ORDER BY id",
            PACKAGE_COLUMNS
        ))
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list descendants")?;

        rows.iter().map(package_from_row).collect()
    }

    async fn insert_package(&self, p: Package) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO packages ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            PACKAGE_COLUMNS
        ))
        .bind(&p.id)
        .bind(p.kind.as_str())
        .bind(&p.parent_id)
        .bind(&p.alias)
        .bind(&p.name)
        .bind(&p.description)
        .bind(&p.default_role)
        .bind(&p.default_release_version)
        .bind(&p.release_version_pattern)
        .bind(&p.service_name)
        .bind(&p.rest_grouping_prefix)
        .bind(p.exclude_from_search)
        .bind(&p.image_url)
        .bind(p.created_at)
        .bind(&p.created_by)
        .bind(p.deleted_at)
        .bind(&p.deleted_by)
        .execute(&self.pool)
        .await
        .context("Failed to insert package")?;
        Ok(())
    }

    async fn update_package(&self, p: Package) -> Result<()> {
        let result = sqlx::query(
            "UPDATE packages SET name = $2, description = $3, default_role = $4,
                default_release_version = $5, release_version_pattern = $6, service_name = $7,
                rest_grouping_prefix = $8, exclude_from_search = $9, image_url = $10
             WHERE id = $1",
        )
        .bind(&p.id)
        .bind(&p.name)
        .bind(&p.description)
        .bind(&p.default_role)
        .bind(&p.default_release_version)
        .bind(&p.release_version_pattern)
        .bind(&p.service_name)
        .bind(&p.rest_grouping_prefix)
        .bind(p.exclude_from_search)
        .bind(&p.image_url)
        .execute(&self.pool)
        .await
        .context("Failed to update package")?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("Package '{}' does not exist", p.id));
        }
        Ok(())
    }

    async fn soft_delete_tree(&self, id: &str, user_id: &str, at: DateTime<Utc>) -> Result<Vec<Id>> {
        let rows = sqlx::query(
            "UPDATE packages SET deleted_at = $3, deleted_by = $4
             WHERE deleted_at IS NULL AND (id = $1 OR left(id, length($2)) = $2)
             RETURNING id",
        )
        .bind(id)
        .bind(format!("{}.", id))
        .bind(at)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to soft delete package tree")?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn purge_deleted_tree(&self, id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM packages WHERE deleted_at IS NOT NULL AND (id = $1 OR left(id, length($2)) = $2)",
        )
        .bind(id)
        .bind(format!("{}.", id))
        .execute(&self.pool)
        .await
        .context("Failed to purge deleted packages")?;
        Ok(())
    }

    async fn move_package_tree(&self, request: PackageMove) -> Result<()> {
        let from = request.from_id.as_str();
        let to = request.to_id.as_str();
        let from_prefix = format!("{}.", from);
        let mut tx = self.pool.begin().await.context("Failed to begin move transaction")?;

        let occupied: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM packages WHERE id = $1 AND deleted_at IS NULL")
                .bind(to)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to check move target")?;
        if occupied.is_some() {
            return Err(anyhow!("Target package '{}' already exists", to));
        }

        sqlx::query(
            "UPDATE packages SET
                id = $2 || substr(id, length($1) + 1),
                parent_id = CASE WHEN id = $1 THEN $4 ELSE $2 || substr(parent_id, length($1) + 1) END,
                alias = CASE WHEN id = $1 THEN $5 ELSE alias END,
                kind = CASE WHEN id = $1 AND $6::text IS NOT NULL THEN $6 ELSE kind END
             WHERE deleted_at IS NULL AND (id = $1 OR left(id, length($3)) = $3)",
        )
        .bind(from)
        .bind(to)
        .bind(&from_prefix)
        .bind(crate::model::parent_of(to))
        .bind(crate::model::alias_of(to))
        .bind(request.new_kind.map(|k| k.as_str()))
        .execute(&mut *tx)
        .await
        .context("Failed to rename packages")?;

        for (table, column) in PACKAGE_ID_COLUMNS {
            let sql = format!(
                "UPDATE {table} SET {column} = $2 || substr({column}, length($1) + 1)
                 WHERE {column} = $1 OR left({column}, length($3)) = $3",
                table = table,
                column = column
            );
            sqlx::query(&sql)
                .bind(from)
                .bind(to)
                .bind(&from_prefix)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to rename {}.{}", table, column))?;
        }

        let to_prefix = format!("{}.", to);
        let rows = sqlx::query(
            "SELECT comparison_id, package_id, version, revision, previous_package_id, previous_version, previous_revision
             FROM version_comparisons
             WHERE package_id = $1 OR left(package_id, length($2)) = $2
                OR previous_package_id = $1 OR left(previous_package_id, length($2)) = $2",
        )
        .bind(to)
        .bind(&to_prefix)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to load moved comparisons")?;
        for row in rows {
            let old_id: String = row.get("comparison_id");
            let new_id = comparison_id(
                row.get::<String, _>("package_id").as_str(),
                row.get::<String, _>("version").as_str(),
                row.get("revision"),
                row.get::<String, _>("previous_package_id").as_str(),
                row.get::<String, _>("previous_version").as_str(),
                row.get("previous_revision"),
            );
            if new_id != old_id {
                sqlx::query("UPDATE version_comparisons SET comparison_id = $2 WHERE comparison_id = $1")
                    .bind(&old_id)
                    .bind(&new_id)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to re-key comparison")?;
            }
        }

        if request.overwrite_history {
            sqlx::query(
                "DELETE FROM package_transitions WHERE from_id = $1 OR left(from_id, length($2)) = $2",
            )
            .bind(to)
            .bind(&to_prefix)
            .execute(&mut *tx)
            .await
            .context("Failed to drop overwritten transitions")?;
        }

        for transition in &request.transitions {
            Self::insert_transition(&mut tx, transition).await?;
        }

        tx.commit().await.context("Failed to commit package move")?;
        Ok(())
    }

    async fn list_transitions_from(&self, from_id: &str) -> Result<Vec<PackageTransition>> {
        let rows = sqlx::query("SELECT * FROM package_transitions WHERE from_id = $1 ORDER BY seq")
            .bind(from_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list transitions")?;
        rows.iter().map(transition_from_row).collect()
    }

    async fn list_transitions_touching(&self, id: &str) -> Result<Vec<PackageTransition>> {
        let rows = sqlx::query(
            "SELECT * FROM package_transitions WHERE from_id = $1 OR to_id = $1 ORDER BY seq",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transitions")?;
        rows.iter().map(transition_from_row).collect()
    }

    async fn get_transition(&self, move_id: &str) -> Result<Option<PackageTransition>> {
        let row = sqlx::query("SELECT * FROM package_transitions WHERE move_id = $1 ORDER BY seq LIMIT 1")
            .bind(move_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch transition")?;
        row.as_ref().map(transition_from_row).transpose()
    }

    async fn complete_transitions(
        &self,
        move_id: &str,
        status: TransitionStatus,
        details: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE package_transitions SET status = $2, details = $3, completed_at = NOW() WHERE move_id = $1",
        )
        .bind(move_id)
        .bind(status.as_str())
        .bind(details)
        .execute(&self.pool)
        .await
        .context("Failed to complete transitions")?;
        Ok(())
    }

    async fn add_favorite(&self, user_id: &str, package_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO favorites (user_id, package_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(user_id)
            .bind(package_id)
            .execute(&self.pool)
            .await
            .context("Failed to add favorite")?;
        Ok(())
    }

    async fn remove_favorite(&self, user_id: &str, package_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM favorites WHERE user_id = $1 AND package_id = $2")
            .bind(user_id)
            .bind(package_id)
            .execute(&self.pool)
            .await
            .context("Failed to remove favorite")?;
        Ok(())
    }

    async fn list_favorites(&self, user_id: &str) -> Result<Vec<Id>> {
        let ids = sqlx::query_scalar("SELECT package_id FROM favorites WHERE user_id = $1 ORDER BY package_id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list favorites")?;
        Ok(ids)
    }
}

#[async_trait::async_trait]
impl VersionStore for PostgresStore {
    async fn insert_revision(&self, content: NewRevision) -> Result<Revision> {
        let NewRevision {
            mut revision,
            documents,
            operations,
            references,
        } = content;
        let mut tx = self.pool.begin().await.context("Failed to begin publish transaction")?;

        // The upsert takes the row lock on the version for the rest of the transaction.
        let next: i32 = sqlx::query_scalar(
            "INSERT INTO versions (package_id, version, max_revision) VALUES ($1, $2, 1)
             ON CONFLICT (package_id, version) DO UPDATE SET max_revision = versions.max_revision + 1
             RETURNING max_revision",
        )
        .bind(&revision.package_id)
        .bind(&revision.version)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to allocate revision")?;
        revision.revision = next;

        sqlx::query(&format!(
            "INSERT INTO revisions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            REVISION_COLUMNS
        ))
        .bind(&revision.package_id)
        .bind(&revision.version)
        .bind(revision.revision)
        .bind(revision.status.as_str())
        .bind(&revision.previous_version)
        .bind(&revision.previous_version_package_id)
        .bind(serde_json::to_value(&revision.labels)?)
        .bind(revision.published_at)
        .bind(&revision.created_by)
        .bind(&revision.publish_id)
        .bind(revision.deleted_at)
        .bind(&revision.deleted_by)
        .execute(&mut *tx)
        .await
        .context("Failed to insert revision")?;

        for doc in &documents {
            sqlx::query(
                "INSERT INTO published_documents (package_id, version, revision, file_id, slug, title, api_type, format, checksum, operation_ids, data)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(&revision.package_id)
            .bind(&revision.version)
            .bind(next)
            .bind(&doc.file_id)
            .bind(&doc.slug)
            .bind(&doc.title)
            .bind(&doc.api_type)
            .bind(&doc.format)
            .bind(&doc.checksum)
            .bind(serde_json::to_value(&doc.operation_ids)?)
            .bind(&doc.data)
            .execute(&mut *tx)
            .await
            .context("Failed to insert document")?;
        }

        for op in &operations {
            sqlx::query(
                "INSERT INTO operations (package_id, version, revision, api_type, operation_id, document_slug, title, method, path, op_type,
                    api_kind, api_audience, tags, custom_tags, deprecated, models, data_hash, data)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
            )
            .bind(&revision.package_id)
            .bind(&revision.version)
            .bind(next)
            .bind(&op.api_type)
            .bind(&op.operation_id)
            .bind(&op.document_slug)
            .bind(&op.title)
            .bind(&op.method)
            .bind(&op.path)
            .bind(&op.op_type)
            .bind(op.api_kind.as_str())
            .bind(&op.api_audience)
            .bind(serde_json::to_value(&op.tags)?)
            .bind(serde_json::to_value(&op.custom_tags)?)
            .bind(op.deprecated)
            .bind(serde_json::to_value(&op.models)?)
            .bind(&op.data_hash)
            .bind(&op.data)
            .execute(&mut *tx)
            .await
            .context("Failed to insert operation")?;
        }

        for reference in &references {
            sqlx::query(
                "INSERT INTO version_references (package_id, version, revision, ref_package_id, ref_version, ref_revision, excluded)
                 VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT DO NOTHING",
            )
            .bind(&revision.package_id)
            .bind(&revision.version)
            .bind(next)
            .bind(&reference.ref_package_id)
            .bind(&reference.ref_version)
            .bind(reference.ref_revision)
            .bind(reference.excluded)
            .execute(&mut *tx)
            .await
            .context("Failed to insert version reference")?;
        }

        tx.commit().await.context("Failed to commit revision")?;
        Ok(revision)
    }

    async fn get_revision(&self, package_id: &str, version: &str, revision: i32) -> Result<Option<Revision>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM revisions WHERE package_id = $1 AND version = $2 AND revision = $3 AND deleted_at IS NULL",
            REVISION_COLUMNS
        ))
        .bind(package_id)
        .bind(version)
        .bind(revision)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch revision")?;
        row.as_ref().map(revision_from_row).transpose()
    }

    async fn get_latest_revision(&self, package_id: &str, version: &str) -> Result<Option<Revision>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM revisions WHERE package_id = $1 AND version = $2 AND deleted_at IS NULL
             ORDER BY revision DESC LIMIT 1",
            REVISION_COLUMNS
        ))
        .bind(package_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest revision")?;
        row.as_ref().map(revision_from_row).transpose()
    }

    async fn list_revisions(&self, package_id: &str, version: &str) -> Result<Vec<Revision>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM revisions WHERE package_id = $1 AND version = $2 AND deleted_at IS NULL ORDER BY revision",
            REVISION_COLUMNS
        ))
        .bind(package_id)
        .bind(version)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list revisions")?;
        rows.iter().map(revision_from_row).collect()
    }

    async fn list_versions(&self, package_id: &str) -> Result<Vec<Revision>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT ON (version) {} FROM revisions WHERE package_id = $1 AND deleted_at IS NULL
             ORDER BY version, revision DESC",
            REVISION_COLUMNS
        ))
        .bind(package_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list versions")?;
        rows.iter().map(revision_from_row).collect()
    }

    async fn update_revision_meta(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
        status: VersionStatus,
        labels: Vec<String>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE revisions SET status = $4, labels = $5 WHERE package_id = $1 AND version = $2 AND revision = $3",
        )
        .bind(package_id)
        .bind(version)
        .bind(revision)
        .bind(status.as_str())
        .bind(serde_json::to_value(&labels)?)
        .execute(&self.pool)
        .await
        .context("Failed to update revision metadata")?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("Revision {}@{} of '{}' not found", version, revision, package_id));
        }
        Ok(())
    }

    async fn delete_version(&self, package_id: &str, version: &str, user_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE revisions SET deleted_at = $3, deleted_by = $4
             WHERE package_id = $1 AND version = $2 AND deleted_at IS NULL",
        )
        .bind(package_id)
        .bind(version)
        .bind(at)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to delete version")?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_documents(&self, package_id: &str, version: &str, revision: i32) -> Result<Vec<PublishedDocument>> {
        let rows = sqlx::query(
            "SELECT * FROM published_documents WHERE package_id = $1 AND version = $2 AND revision = $3 ORDER BY slug",
        )
        .bind(package_id)
        .bind(version)
        .bind(revision)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list documents")?;
        rows.iter().map(document_from_row).collect()
    }

    async fn list_references(&self, package_id: &str, version: &str, revision: i32) -> Result<Vec<VersionReference>> {
        let rows = sqlx::query(
            "SELECT * FROM version_references WHERE package_id = $1 AND version = $2 AND revision = $3",
        )
        .bind(package_id)
        .bind(version)
        .bind(revision)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list references")?;
        Ok(rows.iter().map(reference_from_row).collect())
    }

    async fn list_referrers(&self, package_id: &str) -> Result<Vec<VersionReference>> {
        let rows = sqlx::query("SELECT * FROM version_references WHERE ref_package_id = $1")
            .bind(package_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list referrers")?;
        Ok(rows.iter().map(reference_from_row).collect())
    }

    async fn list_unpurged_deleted_sources(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Id>> {
        let ids = sqlx::query_scalar(
            "SELECT publish_id FROM revisions
             WHERE deleted_at < $1 AND publish_id IS NOT NULL AND NOT sources_purged
             ORDER BY deleted_at LIMIT $2",
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list deleted sources")?;
        Ok(ids)
    }

    async fn mark_sources_purged(&self, publish_ids: &[Id]) -> Result<()> {
        sqlx::query("UPDATE revisions SET sources_purged = TRUE WHERE publish_id = ANY($1)")
            .bind(publish_ids)
            .execute(&self.pool)
            .await
            .context("Failed to mark sources purged")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl OperationStore for PostgresStore {
    async fn list_operations(&self, package_id: &str, version: &str, revision: i32) -> Result<Vec<Operation>> {
        let rows = sqlx::query(
            "SELECT * FROM operations WHERE package_id = $1 AND version = $2 AND revision = $3
             ORDER BY api_type, operation_id",
        )
        .bind(package_id)
        .bind(version)
        .bind(revision)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list operations")?;
        rows.iter().map(operation_from_row).collect()
    }

    async fn get_operation(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
        api_type: &str,
        operation_id: &str,
    ) -> Result<Option<Operation>> {
        let row = sqlx::query(
            "SELECT * FROM operations WHERE package_id = $1 AND version = $2 AND revision = $3
                AND api_type = $4 AND operation_id = $5",
        )
        .bind(package_id)
        .bind(version)
        .bind(revision)
        .bind(api_type)
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch operation")?;
        row.as_ref().map(operation_from_row).transpose()
    }

    async fn put_comparison(&self, c: VersionComparison) -> Result<()> {
        sqlx::query(
            "INSERT INTO version_comparisons (comparison_id, package_id, version, revision, previous_package_id,
                previous_version, previous_revision, no_content, changes, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (comparison_id) DO UPDATE SET no_content = EXCLUDED.no_content,
                changes = EXCLUDED.changes, created_at = EXCLUDED.created_at",
        )
        .bind(&c.comparison_id)
        .bind(&c.package_id)
        .bind(&c.version)
        .bind(c.revision)
        .bind(&c.previous_package_id)
        .bind(&c.previous_version)
        .bind(c.previous_revision)
        .bind(c.no_content)
        .bind(serde_json::to_value(&c.changes)?)
        .bind(c.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to store comparison")?;
        Ok(())
    }

    async fn get_comparison(&self, id: &str) -> Result<Option<VersionComparison>> {
        let row = sqlx::query("SELECT * FROM version_comparisons WHERE comparison_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch comparison")?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(VersionComparison {
            comparison_id: row.get("comparison_id"),
            package_id: row.get("package_id"),
            version: row.get("version"),
            revision: row.get("revision"),
            previous_package_id: row.get("previous_package_id"),
            previous_version: row.get("previous_version"),
            previous_revision: row.get("previous_revision"),
            no_content: row.get("no_content"),
            changes: serde_json::from_value(row.get("changes")).context("Failed to decode changes")?,
            created_at: row.get("created_at"),
        }))
    }
}

#[async_trait::async_trait]
impl GroupStore for PostgresStore {
    async fn get_group(&self, group_id: &str) -> Result<Option<OperationGroup>> {
        let row = sqlx::query(&format!("{} WHERE g.group_id = $1", GROUP_SELECT))
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch operation group")?;
        Ok(row.as_ref().map(group_from_row))
    }

    async fn list_groups(&self, package_id: &str, version: &str, revision: i32) -> Result<Vec<OperationGroup>> {
        let rows = sqlx::query(&format!(
            "{} WHERE g.package_id = $1 AND g.version = $2 AND g.revision = $3 ORDER BY g.api_type, g.group_name",
            GROUP_SELECT
        ))
        .bind(package_id)
        .bind(version)
        .bind(revision)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list operation groups")?;
        Ok(rows.iter().map(group_from_row).collect())
    }

    async fn list_grouped_operations(&self, group_id: &str) -> Result<Vec<GroupedOperation>> {
        let rows = sqlx::query(
            "SELECT * FROM grouped_operations WHERE group_id = $1 ORDER BY package_id, version, revision, operation_id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list grouped operations")?;
        Ok(rows
            .iter()
            .map(|row| GroupedOperation {
                group_id: row.get("group_id"),
                package_id: row.get("package_id"),
                version: row.get("version"),
                revision: row.get("revision"),
                operation_id: row.get("operation_id"),
            })
            .collect())
    }

    async fn write_group(&self, write: GroupWrite, replaces: Option<&str>) -> Result<()> {
        let GroupWrite {
            group,
            template,
            operations,
            history,
        } = write;
        let mut tx = self.pool.begin().await.context("Failed to begin group transaction")?;

        let mut carried_ops: Option<Vec<GroupedOperation>> = None;
        let mut carried_template: Option<GroupTemplate> = None;
        if let Some(old_id) = replaces.filter(|old| *old != group.group_id) {
            let taken: Option<i32> = sqlx::query_scalar("SELECT 1 FROM operation_groups WHERE group_id = $1")
                .bind(&group.group_id)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to check group name")?;
            if taken.is_some() {
                return Err(anyhow!("Operation group '{}' already exists", group.group_name));
            }
            let rows = sqlx::query("SELECT * FROM grouped_operations WHERE group_id = $1")
                .bind(old_id)
                .fetch_all(&mut *tx)
                .await
                .context("Failed to load renamed group membership")?;
            carried_ops = Some(
                rows.iter()
                    .map(|row| GroupedOperation {
                        group_id: group.group_id.clone(),
                        package_id: row.get("package_id"),
                        version: row.get("version"),
                        revision: row.get("revision"),
                        operation_id: row.get("operation_id"),
                    })
                    .collect(),
            );
            carried_template = sqlx::query("SELECT filename, data FROM operation_group_templates WHERE group_id = $1")
                .bind(old_id)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to load renamed group template")?
                .map(|row| GroupTemplate {
                    filename: row.get("filename"),
                    data: row.get("data"),
                });
            sqlx::query("DELETE FROM operation_groups WHERE group_id = $1")
                .bind(old_id)
                .execute(&mut *tx)
                .await
                .context("Failed to delete renamed group")?;
        }

        sqlx::query(
            "INSERT INTO operation_groups (group_id, package_id, version, revision, api_type, group_name, description,
                autogenerated, template_checksum, template_filename, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (group_id) DO UPDATE SET group_name = EXCLUDED.group_name,
                description = EXCLUDED.description, autogenerated = EXCLUDED.autogenerated,
                template_checksum = EXCLUDED.template_checksum, template_filename = EXCLUDED.template_filename,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&group.group_id)
        .bind(&group.package_id)
        .bind(&group.version)
        .bind(group.revision)
        .bind(&group.api_type)
        .bind(&group.group_name)
        .bind(&group.description)
        .bind(group.autogenerated)
        .bind(&group.template_checksum)
        .bind(&group.template_filename)
        .bind(group.created_at)
        .bind(group.updated_at)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert operation group")?;

        let members = operations.or(carried_ops);
        if let Some(members) = members {
            sqlx::query("DELETE FROM grouped_operations WHERE group_id = $1")
                .bind(&group.group_id)
                .execute(&mut *tx)
                .await
                .context("Failed to clear group membership")?;
            for member in &members {
                sqlx::query(
                    "INSERT INTO grouped_operations (group_id, package_id, version, revision, operation_id)
                     VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
                )
                .bind(&group.group_id)
                .bind(&member.package_id)
                .bind(&member.version)
                .bind(member.revision)
                .bind(&member.operation_id)
                .execute(&mut *tx)
                .await
                .context("Failed to insert grouped operation")?;
            }
        }

        let template = template.or(if group.template_checksum.is_some() {
            carried_template
        } else {
            None
        });
        match template {
            Some(t) => {
                sqlx::query(
                    "INSERT INTO operation_group_templates (group_id, filename, data) VALUES ($1, $2, $3)
                     ON CONFLICT (group_id) DO UPDATE SET filename = EXCLUDED.filename, data = EXCLUDED.data",
                )
                .bind(&group.group_id)
                .bind(&t.filename)
                .bind(&t.data)
                .execute(&mut *tx)
                .await
                .context("Failed to store group template")?;
            }
            None if group.template_checksum.is_none() => {
                sqlx::query("DELETE FROM operation_group_templates WHERE group_id = $1")
                    .bind(&group.group_id)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to remove group template")?;
            }
            None => {}
        }

        for entry in &history {
            sqlx::query(
                "INSERT INTO operation_group_history (group_id, action, data, user_id, date, automatic)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&entry.group_id)
            .bind(entry.action.as_str())
            .bind(&entry.data)
            .bind(&entry.user_id)
            .bind(entry.date)
            .bind(entry.automatic)
            .execute(&mut *tx)
            .await
            .context("Failed to record group history")?;
        }

        tx.commit().await.context("Failed to commit group write")?;
        Ok(())
    }

    async fn delete_group(&self, group_id: &str, history: OperationGroupHistory) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin group delete")?;
        let result = sqlx::query("DELETE FROM operation_groups WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete operation group")?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            sqlx::query(
                "INSERT INTO operation_group_history (group_id, action, data, user_id, date, automatic)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&history.group_id)
            .bind(history.action.as_str())
            .bind(&history.data)
            .bind(&history.user_id)
            .bind(history.date)
            .bind(history.automatic)
            .execute(&mut *tx)
            .await
            .context("Failed to record group history")?;
        }
        tx.commit().await.context("Failed to commit group delete")?;
        Ok(deleted)
    }

    async fn get_group_template(&self, group_id: &str) -> Result<Option<GroupTemplate>> {
        let row = sqlx::query("SELECT filename, data FROM operation_group_templates WHERE group_id = $1")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch group template")?;
        Ok(row.map(|row| GroupTemplate {
            filename: row.get("filename"),
            data: row.get("data"),
        }))
    }

    async fn list_group_history(&self, group_id: &str) -> Result<Vec<OperationGroupHistory>> {
        let rows = sqlx::query("SELECT * FROM operation_group_history WHERE group_id = $1 ORDER BY id")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list group history")?;
        rows.iter().map(history_from_row).collect()
    }

    async fn get_transformed_document(&self, key: &TransformedDocumentKey) -> Result<Option<TransformedDocument>> {
        let row = sqlx::query(
            "SELECT build_id, documents, created_at FROM transformed_documents
             WHERE package_id = $1 AND version = $2 AND api_type = $3 AND group_id = $4
                AND build_type = $5 AND format = $6",
        )
        .bind(&key.package_id)
        .bind(&key.version)
        .bind(&key.api_type)
        .bind(&key.group_id)
        .bind(key.build_type.as_str())
        .bind(key.format.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch transformed document")?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(TransformedDocument {
            key: key.clone(),
            build_id: row.get("build_id"),
            documents: serde_json::from_value(row.get("documents"))
                .context("Failed to decode transformed documents")?,
            created_at: row.get("created_at"),
        }))
    }

    async fn put_transformed_document(&self, document: TransformedDocument) -> Result<()> {
        let key = &document.key;
        sqlx::query(
            "INSERT INTO transformed_documents (package_id, version, api_type, group_id, build_type, format, build_id, documents, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (package_id, version, api_type, group_id, build_type, format)
             DO UPDATE SET build_id = EXCLUDED.build_id, documents = EXCLUDED.documents, created_at = EXCLUDED.created_at",
        )
        .bind(&key.package_id)
        .bind(&key.version)
        .bind(&key.api_type)
        .bind(&key.group_id)
        .bind(key.build_type.as_str())
        .bind(key.format.as_str())
        .bind(&document.build_id)
        .bind(serde_json::to_value(&document.documents)?)
        .bind(document.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to store transformed document")?;
        Ok(())
    }

    async fn delete_transformed_documents(&self, group_id: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM transformed_documents WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete transformed documents")?;
        Ok(result.rows_affected() as usize)
    }

    async fn delete_transformed_documents_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query("DELETE FROM transformed_documents WHERE created_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .context("Failed to delete aged transformed documents")?;
        Ok(result.rows_affected() as usize)
    }

    async fn insert_group_publish(&self, p: GroupPublish) -> Result<()> {
        sqlx::query(
            "INSERT INTO operation_group_publishes (publish_id, group_id, package_id, version, status, details, build_id, created_at, created_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&p.publish_id)
        .bind(&p.group_id)
        .bind(&p.package_id)
        .bind(&p.version)
        .bind(p.status.as_str())
        .bind(&p.details)
        .bind(&p.build_id)
        .bind(p.created_at)
        .bind(&p.created_by)
        .execute(&self.pool)
        .await
        .context("Failed to insert group publish")?;
        Ok(())
    }

    async fn update_group_publish(&self, p: GroupPublish) -> Result<()> {
        sqlx::query(
            "UPDATE operation_group_publishes SET status = $2, details = $3, build_id = $4 WHERE publish_id = $1",
        )
        .bind(&p.publish_id)
        .bind(p.status.as_str())
        .bind(&p.details)
        .bind(&p.build_id)
        .execute(&self.pool)
        .await
        .context("Failed to update group publish")?;
        Ok(())
    }

    async fn get_group_publish(&self, publish_id: &str) -> Result<Option<GroupPublish>> {
        let row = sqlx::query("SELECT * FROM operation_group_publishes WHERE publish_id = $1")
            .bind(publish_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch group publish")?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(GroupPublish {
            publish_id: row.get("publish_id"),
            group_id: row.get("group_id"),
            package_id: row.get("package_id"),
            version: row.get("version"),
            status: parse_enum(row.get::<String, _>("status").as_str())?,
            details: row.get("details"),
            build_id: row.get("build_id"),
            created_at: row.get("created_at"),
            created_by: row.get("created_by"),
        }))
    }
}

#[async_trait::async_trait]
impl BuildStore for PostgresStore {
    async fn insert_build(&self, b: Build) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO builds ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            BUILD_COLUMNS
        ))
        .bind(&b.build_id)
        .bind(serde_json::to_value(&b.config)?)
        .bind(&b.checksum)
        .bind(b.status.as_str())
        .bind(&b.details)
        .bind(b.created_at)
        .bind(&b.created_by)
        .bind(b.started_at)
        .bind(b.finished_at)
        .bind(&b.worker_id)
        .bind(b.heartbeat_at)
        .bind(b.result_deleted)
        .execute(&self.pool)
        .await
        .context("Failed to insert build")?;
        Ok(())
    }

    async fn get_build(&self, build_id: &str) -> Result<Option<Build>> {
        let row = sqlx::query(&format!("SELECT {} FROM builds WHERE build_id = $1", BUILD_COLUMNS))
            .bind(build_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch build")?;
        row.as_ref().map(build_from_row).transpose()
    }

    async fn find_reusable_build(&self, checksum: &str, results_after: DateTime<Utc>) -> Result<Option<Build>> {
        let row = sqlx::query(
            "SELECT b.build_id, b.config, b.checksum, b.status, b.details, b.created_at, b.created_by,
                b.started_at, b.finished_at, b.worker_id, b.heartbeat_at, b.result_deleted
             FROM builds b LEFT JOIN export_results r ON r.build_id = b.build_id
             WHERE b.checksum = $1
               AND (b.status IN ('notStarted', 'running')
                    OR (b.status = 'complete' AND NOT b.result_deleted AND r.created_at > $2))
             ORDER BY b.created_at DESC LIMIT 1",
        )
        .bind(checksum)
        .bind(results_after)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up reusable build")?;
        row.as_ref().map(build_from_row).transpose()
    }

    async fn transition_build(
        &self,
        build_id: &str,
        from: &[BuildStatus],
        to: BuildStatus,
        details: &str,
    ) -> Result<bool> {
        let allowed: Vec<String> = from
            .iter()
            .filter(|s| s.can_transition_to(to))
            .map(|s| s.as_str().to_string())
            .collect();
        if allowed.is_empty() {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE builds SET status = $2, details = $3,
                started_at = CASE WHEN $2 = 'running' THEN NOW() ELSE started_at END,
                finished_at = CASE WHEN $2 IN ('complete', 'error') THEN NOW() ELSE finished_at END
             WHERE build_id = $1 AND status = ANY($4)",
        )
        .bind(build_id)
        .bind(to.as_str())
        .bind(details)
        .bind(&allowed)
        .execute(&self.pool)
        .await
        .context("Failed to transition build")?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_next_build(&self, worker_id: &str) -> Result<Option<Build>> {
        let row = sqlx::query(&format!(
            "UPDATE builds SET status = 'running', started_at = NOW(), heartbeat_at = NOW(), worker_id = $1
             WHERE build_id = (
                SELECT build_id FROM builds WHERE status = 'notStarted'
                ORDER BY created_at, build_id LIMIT 1 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            BUILD_COLUMNS
        ))
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim build")?;
        row.as_ref().map(build_from_row).transpose()
    }

    async fn heartbeat_build(&self, build_id: &str, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE builds SET heartbeat_at = NOW() WHERE build_id = $1 AND worker_id = $2 AND status = 'running'",
        )
        .bind(build_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .context("Failed to extend build lease")?;
        Ok(result.rows_affected() > 0)
    }

    async fn requeue_stale_builds(&self, stale_before: DateTime<Utc>) -> Result<Vec<Id>> {
        let ids: Vec<Id> = sqlx::query_scalar(
            "UPDATE builds SET status = 'notStarted', worker_id = NULL, heartbeat_at = NULL
             WHERE status = 'running' AND COALESCE(heartbeat_at, started_at, created_at) < $1
             RETURNING build_id",
        )
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await
        .context("Failed to requeue stale builds")?;
        Ok(ids)
    }

    async fn insert_export_result(&self, r: ExportResultRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO export_results (build_id, filename, created_at, created_by, config)
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (build_id) DO NOTHING",
        )
        .bind(&r.build_id)
        .bind(&r.filename)
        .bind(r.created_at)
        .bind(&r.created_by)
        .bind(serde_json::to_value(&r.config)?)
        .execute(&self.pool)
        .await
        .context("Failed to insert export result")?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_export_result(&self, build_id: &str) -> Result<Option<ExportResultRecord>> {
        let row = sqlx::query("SELECT * FROM export_results WHERE build_id = $1")
            .bind(build_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch export result")?;
        row.as_ref().map(export_result_from_row).transpose()
    }

    async fn list_expired_results(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Id>> {
        let ids = sqlx::query_scalar(
            "SELECT build_id FROM export_results WHERE created_at < $1 ORDER BY created_at LIMIT $2",
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list expired results")?;
        Ok(ids)
    }

    async fn mark_results_deleted(&self, build_ids: &[Id]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin result cleanup")?;
        sqlx::query("DELETE FROM export_results WHERE build_id = ANY($1)")
            .bind(build_ids)
            .execute(&mut *tx)
            .await
            .context("Failed to delete export results")?;
        sqlx::query("UPDATE builds SET result_deleted = TRUE WHERE build_id = ANY($1)")
            .bind(build_ids)
            .execute(&mut *tx)
            .await
            .context("Failed to flag builds")?;
        tx.commit().await.context("Failed to commit result cleanup")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobStore for PostgresStore {
    async fn put_blob(&self, table: &str, id: &str, data: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO stored_blobs (table_name, id, data) VALUES ($1, $2, $3)
             ON CONFLICT (table_name, id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(table)
        .bind(id)
        .bind(data)
        .execute(&self.pool)
        .await
        .context("Failed to store blob")?;
        Ok(())
    }

    async fn get_blob(&self, table: &str, id: &str) -> Result<Option<Vec<u8>>> {
        let data = sqlx::query_scalar("SELECT data FROM stored_blobs WHERE table_name = $1 AND id = $2")
            .bind(table)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch blob")?;
        Ok(data)
    }

    async fn delete_blobs(&self, table: &str, ids: &[Id]) -> Result<usize> {
        let result = sqlx::query("DELETE FROM stored_blobs WHERE table_name = $1 AND id = ANY($2)")
            .bind(table)
            .bind(ids)
            .execute(&self.pool)
            .await
            .context("Failed to delete blobs")?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_blob_ids(&self, table: &str, offset: i64, limit: i64) -> Result<Vec<Id>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM stored_blobs WHERE table_name = $1 ORDER BY id OFFSET $2 LIMIT $3",
        )
        .bind(table)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list blob ids")?;
        Ok(ids)
    }
}

#[async_trait::async_trait]
impl AuthStore for PostgresStore {
    async fn list_roles(&self) -> Result<Vec<Role>> {
        let rows = sqlx::query("SELECT * FROM roles ORDER BY rank DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list roles")?;
        rows.iter().map(role_from_row).collect()
    }

    async fn get_role(&self, id: &str) -> Result<Option<Role>> {
        let row = sqlx::query("SELECT * FROM roles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch role")?;
        row.as_ref().map(role_from_row).transpose()
    }

    async fn insert_role(&self, role: Role) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin role insert")?;
        sqlx::query("UPDATE roles SET rank = rank + 1 WHERE rank >= $1")
            .bind(role.rank)
            .execute(&mut *tx)
            .await
            .context("Failed to shift role ranks")?;
        sqlx::query("INSERT INTO roles (id, display_name, permissions, rank, read_only) VALUES ($1, $2, $3, $4, $5)")
            .bind(&role.id)
            .bind(&role.display_name)
            .bind(serde_json::to_value(&role.permissions)?)
            .bind(role.rank)
            .bind(role.read_only)
            .execute(&mut *tx)
            .await
            .context("Failed to insert role")?;
        tx.commit().await.context("Failed to commit role insert")?;
        Ok(())
    }

    async fn update_role(&self, role: Role) -> Result<()> {
        sqlx::query("UPDATE roles SET display_name = $2, permissions = $3, rank = $4, read_only = $5 WHERE id = $1")
            .bind(&role.id)
            .bind(&role.display_name)
            .bind(serde_json::to_value(&role.permissions)?)
            .bind(role.rank)
            .bind(role.read_only)
            .execute(&self.pool)
            .await
            .context("Failed to update role")?;
        Ok(())
    }

    async fn delete_role(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin role delete")?;
        let result = sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete role")?;
        sqlx::query("UPDATE package_member_roles SET role_ids = role_ids - $1::text WHERE role_ids ? $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to strip role from members")?;
        sqlx::query("DELETE FROM package_member_roles WHERE jsonb_array_length(role_ids) = 0")
            .execute(&mut *tx)
            .await
            .context("Failed to drop empty member assignments")?;
        tx.commit().await.context("Failed to commit role delete")?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_role_ranks(&self, ranks: Vec<(String, i32)>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin role reorder")?;
        for (id, rank) in ranks {
            sqlx::query("UPDATE roles SET rank = $2 WHERE id = $1")
                .bind(&id)
                .bind(rank)
                .execute(&mut *tx)
                .await
                .context("Failed to update role rank")?;
        }
        tx.commit().await.context("Failed to commit role reorder")?;
        Ok(())
    }

    async fn get_member_roles(&self, package_id: &str, user_id: &str) -> Result<Option<PackageMemberRole>> {
        let row = sqlx::query("SELECT * FROM package_member_roles WHERE package_id = $1 AND user_id = $2")
            .bind(package_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch member roles")?;
        row.as_ref().map(member_from_row).transpose()
    }

    async fn list_member_roles(&self, package_ids: &[Id]) -> Result<Vec<PackageMemberRole>> {
        let rows = sqlx::query("SELECT * FROM package_member_roles WHERE package_id = ANY($1)")
            .bind(package_ids)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list member roles")?;
        rows.iter().map(member_from_row).collect()
    }

    async fn list_member_roles_for_user(&self, user_id: &str) -> Result<Vec<PackageMemberRole>> {
        let rows = sqlx::query("SELECT * FROM package_member_roles WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list member roles for user")?;
        rows.iter().map(member_from_row).collect()
    }

    async fn put_member_roles(&self, member: PackageMemberRole) -> Result<()> {
        if member.role_ids.is_empty() {
            self.delete_member(&member.package_id, &member.user_id).await?;
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO package_member_roles (package_id, user_id, role_ids, updated_at, updated_by)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (package_id, user_id) DO UPDATE SET role_ids = EXCLUDED.role_ids,
                updated_at = EXCLUDED.updated_at, updated_by = EXCLUDED.updated_by",
        )
        .bind(&member.package_id)
        .bind(&member.user_id)
        .bind(serde_json::to_value(&member.role_ids)?)
        .bind(member.updated_at)
        .bind(&member.updated_by)
        .execute(&self.pool)
        .await
        .context("Failed to store member roles")?;
        Ok(())
    }

    async fn delete_member(&self, package_id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM package_member_roles WHERE package_id = $1 AND user_id = $2")
            .bind(package_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete member")?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = $1 LIMIT 1")
            .bind(email.trim().to_lowercase())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up user by email")?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn upsert_user(&self, user: User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, name, email, avatar_url, private_package_id) VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, email = EXCLUDED.email,
                avatar_url = EXCLUDED.avatar_url, private_package_id = EXCLUDED.private_package_id",
        )
        .bind(&user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.avatar_url)
        .bind(&user.private_package_id)
        .execute(&self.pool)
        .await
        .context("Failed to upsert user")?;
        Ok(())
    }

    async fn is_sysadmin(&self, user_id: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT user_id FROM system_admins WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check system admin")?;
        Ok(found.is_some())
    }

    async fn add_sysadmin(&self, user_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO system_admins (user_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to add system admin")?;
        Ok(())
    }

    async fn insert_api_key(&self, key: ApiKey) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO api_keys (id, package_id, name, roles, created_by, created_for, created_at, deleted_at, deleted_by, token_hash)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (package_id, name) WHERE deleted_at IS NULL DO NOTHING",
        )
        .bind(&key.id)
        .bind(&key.package_id)
        .bind(&key.name)
        .bind(serde_json::to_value(&key.roles)?)
        .bind(&key.created_by)
        .bind(&key.created_for)
        .bind(key.created_at)
        .bind(key.deleted_at)
        .bind(&key.deleted_by)
        .bind(&key.token_hash)
        .execute(&self.pool)
        .await
        .context("Failed to insert api key")?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_api_key(&self, id: &str) -> Result<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch api key")?;
        row.as_ref().map(api_key_from_row).transpose()
    }

    async fn find_api_key_by_hash(&self, token_hash: &str) -> Result<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up api key")?;
        row.as_ref().map(api_key_from_row).transpose()
    }

    async fn list_api_keys(&self, package_id: &str) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query("SELECT * FROM api_keys WHERE package_id = $1 ORDER BY created_at")
            .bind(package_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list api keys")?;
        rows.iter().map(api_key_from_row).collect()
    }

    async fn revoke_api_key(&self, id: &str, user_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE api_keys SET deleted_at = $2, deleted_by = $3 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to revoke api key")?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl ActivityStore for PostgresStore {
    async fn insert_events(&self, events: Vec<ActivityEvent>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin event insert")?;
        for event in &events {
            sqlx::query(
                "INSERT INTO activity_events (event_type, data, package_id, date, user_id) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(event.event_type.as_str())
            .bind(&event.data)
            .bind(&event.package_id)
            .bind(event.date)
            .bind(&event.user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to insert activity event")?;
        }
        tx.commit().await.context("Failed to commit activity events")?;
        Ok(())
    }

    async fn list_events(&self, query: EventQuery) -> Result<Vec<ActivityEvent>> {
        let types: Vec<String> = query.types.iter().map(|t| t.as_str().to_string()).collect();
        let rows = sqlx::query(
            "SELECT event_type, data, package_id, date, user_id FROM activity_events
             WHERE ($1::text[] IS NULL OR package_id = ANY($1))
               AND (cardinality($2::text[]) = 0 OR event_type = ANY($2))
             ORDER BY date DESC OFFSET $3 LIMIT $4",
        )
        .bind(query.package_ids)
        .bind(&types)
        .bind(query.offset as i64)
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list activity events")?;

        rows.iter()
            .map(|row| {
                Ok(ActivityEvent {
                    event_type: parse_enum(row.get::<String, _>("event_type").as_str())?,
                    data: row.get("data"),
                    package_id: row.get("package_id"),
                    date: row.get("date"),
                    user_id: row.get("user_id"),
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl CleanupStore for PostgresStore {
    async fn begin_cleanup_run(&self, min_interval: chrono::Duration, now: DateTime<Utc>) -> Result<Option<CleanupRun>> {
        let mut tx = self.pool.begin().await.context("Failed to begin cleanup claim")?;
        let last_success: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(started_at) FROM cleanup_runs WHERE finished_at IS NOT NULL AND error IS NULL",
        )
        .fetch_one(&mut *tx)
        .await
        .context("Failed to read last cleanup run")?;
        if let Some(last) = last_success {
            if now - last < min_interval {
                return Ok(None);
            }
        }
        let run_id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(run_id), 0) + 1 FROM cleanup_runs")
            .fetch_one(&mut *tx)
            .await
            .context("Failed to allocate cleanup run id")?;
        // A concurrent scheduler that claimed the same id wins; this one skips the tick.
        let inserted = sqlx::query(
            "INSERT INTO cleanup_runs (run_id, started_at) VALUES ($1, $2) ON CONFLICT (run_id) DO NOTHING",
        )
        .bind(run_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to claim cleanup run")?;
        tx.commit().await.context("Failed to commit cleanup claim")?;
        if inserted.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(CleanupRun {
            run_id,
            started_at: now,
            finished_at: None,
            deleted_builds: 0,
            deleted_transformed_documents: 0,
            deleted_sources: 0,
            error: None,
        }))
    }

    async fn finish_cleanup_run(&self, run: CleanupRun) -> Result<()> {
        sqlx::query(
            "UPDATE cleanup_runs SET finished_at = $2, deleted_builds = $3, deleted_transformed_documents = $4,
                deleted_sources = $5, error = $6 WHERE run_id = $1",
        )
        .bind(run.run_id)
        .bind(run.finished_at)
        .bind(run.deleted_builds as i64)
        .bind(run.deleted_transformed_documents as i64)
        .bind(run.deleted_sources as i64)
        .bind(&run.error)
        .execute(&self.pool)
        .await
        .context("Failed to finish cleanup run")?;
        Ok(())
    }

    async fn last_cleanup_run(&self) -> Result<Option<CleanupRun>> {
        let row = sqlx::query("SELECT * FROM cleanup_runs ORDER BY run_id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch last cleanup run")?;
        Ok(row.as_ref().map(cleanup_run_from_row))
    }

    async fn put_migration_job(&self, job: MigrationCleanupJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO migration_cleanup_jobs (job_id, status, deleted_items, error, started_at, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (job_id) DO UPDATE SET status = EXCLUDED.status, deleted_items = EXCLUDED.deleted_items,
                error = EXCLUDED.error, finished_at = EXCLUDED.finished_at",
        )
        .bind(&job.job_id)
        .bind(job.status.as_str())
        .bind(job.deleted_items as i64)
        .bind(&job.error)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await
        .context("Failed to store migration cleanup job")?;
        Ok(())
    }

    async fn get_migration_job(&self, job_id: &str) -> Result<Option<MigrationCleanupJob>> {
        let row = sqlx::query("SELECT * FROM migration_cleanup_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch migration cleanup job")?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(MigrationCleanupJob {
            job_id: row.get("job_id"),
            status: parse_enum(row.get::<String, _>("status").as_str())?,
            deleted_items: row.get::<i64, _>("deleted_items") as usize,
            error: row.get("error"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        }))
    }

    async fn list_migration_builds(&self, limit: i64) -> Result<Vec<Id>> {
        let ids = sqlx::query_scalar(
            "SELECT build_id FROM builds WHERE created_by = $1 AND NOT result_deleted ORDER BY created_at LIMIT $2",
        )
        .bind(MIGRATION_BUILD_AUTHOR)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list migration builds")?;
        Ok(ids)
    }
}

impl Store for PostgresStore {}
