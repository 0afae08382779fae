use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::{codes, CatalogError, CatalogResult};
use crate::logic::activity::ActivityTracker;
use crate::logic::authorization::Authorization;
use crate::logic::background::BackgroundExecutor;
use crate::logic::groups::recalculate_autogenerated_groups;
use crate::logic::versions::resolve_default_version;
use crate::model::{
    ancestor_ids, hash_parts_hex, is_descendant_of, make_package_id, parent_of, validate_alias,
    validate_package_id, validate_release_pattern, validate_rest_grouping_prefix, workspace_of,
    ActivityEvent, EventType, Id, NewPackage, Package, PackageKind, PackageListFilter,
    PackageLookup, PackagePatch, PackageTransition, PackageView, Permission, Principal,
    TransitionStatus, User, VersionRef, VersionStatus, ROLE_NONE, ROLE_VIEWER,
};
use crate::store::traits::{PackageMove, Store};
use crate::store::TransformedDocumentCache;

/// Alias prefix reserved for personal workspaces.
pub const PRIVATE_WORKSPACE_PREFIX: &str = "private-";

pub fn private_workspace_id(user_id: &str) -> Id {
    let digest = hash_parts_hex(&[user_id]);
    format!("{}{}", PRIVATE_WORKSPACE_PREFIX, &digest[..12])
}

/// Dotted-path package forest with rename history.
pub struct PackageGraph<S: Store> {
    store: Arc<S>,
    config: Arc<AppConfig>,
    auth: Authorization<S>,
    activity: ActivityTracker<S>,
    background: BackgroundExecutor,
    cache: Arc<TransformedDocumentCache>,
}

impl<S: Store> Clone for PackageGraph<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            auth: self.auth.clone(),
            activity: self.activity.clone(),
            background: self.background.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<S: Store + 'static> PackageGraph<S> {
    pub fn new(
        store: Arc<S>,
        config: Arc<AppConfig>,
        auth: Authorization<S>,
        activity: ActivityTracker<S>,
        background: BackgroundExecutor,
        cache: Arc<TransformedDocumentCache>,
    ) -> Self {
        Self {
            store,
            config,
            auth,
            activity,
            background,
            cache,
        }
    }

    async fn live(&self, id: &str) -> CatalogResult<Option<Package>> {
        Ok(self.store.get_package(id).await?.filter(|p| !p.is_deleted()))
    }

    pub async fn create_package(&self, principal: &Principal, request: NewPackage) -> CatalogResult<Package> {
        let kind = request.kind.ok_or_else(|| CatalogError::empty_param("kind"))?;
        validate_alias(&request.alias)?;
        validate_rest_grouping_prefix(&request.rest_grouping_prefix)?;
        validate_release_pattern(&request.release_version_pattern)?;

        let parent = if kind == PackageKind::Workspace {
            if !request.parent_id.is_empty() {
                return Err(invalid_kind(kind, "a workspace cannot have a parent"));
            }
            if request.alias.starts_with(PRIVATE_WORKSPACE_PREFIX) {
                return Err(alias_taken(&request.alias));
            }
            self.auth.require_sysadmin(principal).await?;
            None
        } else {
            if request.parent_id.is_empty() {
                return Err(CatalogError::empty_param("parentId"));
            }
            let parent = self
                .auth
                .check_package(principal, &request.parent_id, Permission::CreateAndUpdatePackage)
                .await?;
            if !parent.kind.is_container() {
                return Err(invalid_kind(
                    kind,
                    &format!("parent '{}' is a {} and cannot hold children", parent.id, parent.kind),
                ));
            }
            Some(parent)
        };

        let id = make_package_id(&request.parent_id, &request.alias);
        if self.store.get_package(&id).await?.is_some() {
            return Err(alias_taken(&id));
        }
        if !self.store.list_transitions_from(&id).await?.is_empty() {
            return Err(CatalogError::conflict(
                codes::PACKAGE_REDIRECT_EXISTS,
                format!("Package id '{}' is reserved by a redirect to a moved package", id),
            )
            .with_param("id", &id));
        }

        let default_role = match request.default_role {
            Some(role) if !role.is_empty() => role,
            _ if kind == PackageKind::Workspace => ROLE_VIEWER.to_string(),
            _ => String::new(),
        };
        self.validate_default_role(principal, kind, &default_role).await?;

        if !request.service_name.is_empty() {
            self.ensure_service_name_free(&id, &request.service_name).await?;
        }

        let package = Package {
            id: id.clone(),
            kind,
            parent_id: request.parent_id,
            alias: request.alias,
            name: if request.name.is_empty() { id.clone() } else { request.name },
            description: request.description,
            default_role,
            default_release_version: String::new(),
            release_version_pattern: request.release_version_pattern,
            service_name: request.service_name,
            rest_grouping_prefix: request.rest_grouping_prefix,
            exclude_from_search: request.exclude_from_search
                || parent.map(|p| p.exclude_from_search).unwrap_or(false),
            image_url: request.image_url,
            created_at: Utc::now(),
            created_by: principal.actor_id().to_string(),
            deleted_at: None,
            deleted_by: None,
        };
        self.store.insert_package(package.clone()).await?;
        log::info!("Package '{}' ({}) created by {}", package.id, package.kind, principal.actor_id());
        self.activity.track(ActivityEvent::new(
            EventType::CreatePackage,
            &package.id,
            principal.actor_id(),
            serde_json::json!({ "kind": package.kind.as_str(), "name": package.name }),
        ));
        Ok(package)
    }

    async fn validate_default_role(
        &self,
        principal: &Principal,
        kind: PackageKind,
        role_id: &str,
    ) -> CatalogResult<()> {
        if role_id.is_empty() {
            return Ok(());
        }
        if self.store.get_role(role_id).await?.is_none() {
            return Err(CatalogError::not_found(
                codes::ROLE_NOT_FOUND,
                format!("Role '{}' not found", role_id),
            )
            .with_param("role", role_id));
        }
        if role_id == ROLE_NONE && kind == PackageKind::Workspace && !self.auth.is_sysadmin(principal).await? {
            return Err(private_workspace_not_modifiable());
        }
        Ok(())
    }

    async fn ensure_service_name_free(&self, package_id: &str, service_name: &str) -> CatalogResult<()> {
        let workspace = workspace_of(package_id);
        let taken = self.store.list_packages().await?.into_iter().find(|p| {
            p.id != package_id && p.service_name == service_name && workspace_of(&p.id) == workspace
        });
        if let Some(other) = taken {
            return Err(CatalogError::conflict(
                codes::SERVICE_NAME_ALREADY_TAKEN,
                format!(
                    "Service name '{}' is already used by package '{}'",
                    service_name, other.id
                ),
            )
            .with_param("serviceName", service_name)
            .with_param("packageId", &other.id));
        }
        Ok(())
    }

    /// Live package view, or the id it was moved to.
    pub async fn get_package(
        &self,
        principal: &Principal,
        id: &str,
        with_parents: bool,
    ) -> CatalogResult<PackageLookup<PackageView>> {
        if let Some(package) = self.live(id).await? {
            self.auth.check(principal, &package, Permission::Read).await?;
            return Ok(PackageLookup::Found(self.view(principal, package, with_parents).await?));
        }
        match self.resolve_redirect(id).await? {
            Some(to_id) => {
                let target = self
                    .live(&to_id)
                    .await?
                    .ok_or_else(|| CatalogError::package_not_found(id))?;
                self.auth
                    .check(principal, &target, Permission::Read)
                    .await
                    .map_err(|_| CatalogError::package_not_found(id))?;
                Ok(PackageLookup::Moved {
                    from_id: id.to_string(),
                    to_id,
                })
            }
            None => Err(CatalogError::package_not_found(id)),
        }
    }

    /// Follow the latest forward edges until a live id is reached.
    pub async fn resolve_redirect(&self, id: &str) -> CatalogResult<Option<Id>> {
        let mut visited = BTreeSet::new();
        let mut current = id.to_string();
        loop {
            if !visited.insert(current.clone()) {
                return Ok(None);
            }
            let latest = self
                .store
                .list_transitions_from(&current)
                .await?
                .into_iter()
                .filter(|t| t.status != TransitionStatus::Error)
                .max_by_key(|t| t.seq);
            let Some(edge) = latest else {
                return Ok(None);
            };
            if self.live(&edge.to_id).await?.is_some() {
                return Ok(Some(edge.to_id));
            }
            current = edge.to_id;
        }
    }

    async fn view(&self, principal: &Principal, package: Package, with_parents: bool) -> CatalogResult<PackageView> {
        let mut parents = Vec::new();
        if with_parents {
            for ancestor_id in ancestor_ids(&package.id) {
                if let Some(ancestor) = self.live(&ancestor_id).await? {
                    parents.push(ancestor);
                }
            }
        }
        let is_favorite = match principal.user_id() {
            Some(user_id) => self
                .store
                .list_favorites(user_id)
                .await?
                .contains(&package.id),
            None => false,
        };
        let user_permissions = self
            .auth
            .permissions(principal, &package)
            .await?
            .into_iter()
            .map(|p| p.as_str().to_string())
            .collect();
        let default_version = if package.kind.holds_versions() {
            resolve_default_version(self.store.as_ref(), &package).await?
        } else {
            None
        };
        Ok(PackageView {
            package,
            parents,
            is_favorite,
            user_permissions,
            default_version,
        })
    }

    pub async fn update_package(
        &self,
        principal: &Principal,
        id: &str,
        patch: PackagePatch,
    ) -> CatalogResult<Package> {
        let mut package = self
            .auth
            .check_package(principal, id, Permission::CreateAndUpdatePackage)
            .await?;
        if package.is_private_workspace() && !self.auth.is_sysadmin(principal).await? {
            return Err(private_workspace_not_modifiable());
        }
        let mut changed = Vec::new();

        if let Some(name) = patch.name {
            package.name = name;
            changed.push("name");
        }
        if let Some(description) = patch.description {
            package.description = description;
            changed.push("description");
        }
        if let Some(image_url) = patch.image_url {
            package.image_url = image_url;
            changed.push("imageUrl");
        }
        if let Some(service_name) = patch.service_name {
            if !package.service_name.is_empty()
                && !service_name.is_empty()
                && service_name != package.service_name
            {
                return Err(CatalogError::conflict(
                    codes::SERVICE_NAME_CANT_BE_MODIFIED,
                    format!(
                        "Service name of package '{}' is already set to '{}'",
                        package.id, package.service_name
                    ),
                )
                .with_param("packageId", &package.id));
            }
            if !service_name.is_empty() && service_name != package.service_name {
                self.ensure_service_name_free(&package.id, &service_name).await?;
            }
            package.service_name = service_name;
            changed.push("serviceName");
        }
        if let Some(default_role) = patch.default_role {
            self.validate_default_role(principal, package.kind, &default_role)
                .await?;
            package.default_role = default_role;
            changed.push("defaultRole");
        }
        if let Some(pattern) = patch.release_version_pattern {
            validate_release_pattern(&pattern)?;
            package.release_version_pattern = pattern;
            changed.push("releaseVersionPattern");
        }
        if let Some(default_release) = patch.default_release_version {
            package.default_release_version = self
                .validate_default_release(&package, &default_release)
                .await?;
            changed.push("defaultReleaseVersion");
        }
        let mut regroup = false;
        if let Some(prefix) = patch.rest_grouping_prefix {
            validate_rest_grouping_prefix(&prefix)?;
            regroup = prefix != package.rest_grouping_prefix;
            package.rest_grouping_prefix = prefix;
            changed.push("restGroupingPrefix");
        }
        let mut hide_descendants = false;
        if let Some(exclude) = patch.exclude_from_search {
            let parent_hides = match self.live(&package.parent_id).await? {
                Some(parent) => parent.exclude_from_search,
                None => false,
            };
            hide_descendants = exclude && !package.exclude_from_search;
            package.exclude_from_search = exclude || parent_hides;
            changed.push("excludeFromSearch");
        }

        self.store.update_package(package.clone()).await?;
        if hide_descendants {
            for mut child in self.store.list_descendants(&package.id).await? {
                if !child.exclude_from_search {
                    child.exclude_from_search = true;
                    self.store.update_package(child).await?;
                }
            }
        }
        if regroup {
            self.schedule_regrouping(package.clone());
        }
        self.activity.track(ActivityEvent::new(
            EventType::PatchPackageMeta,
            &package.id,
            principal.actor_id(),
            serde_json::json!({ "changedFields": changed }),
        ));
        Ok(package)
    }

    /// Returns the version name to store. The version must be a release and
    /// a revision, when given, must be the latest one.
    async fn validate_default_release(&self, package: &Package, raw: &str) -> CatalogResult<String> {
        if raw.is_empty() {
            return Ok(String::new());
        }
        let reference = VersionRef::parse(raw)?;
        let latest = self
            .store
            .get_latest_revision(&package.id, &reference.name)
            .await?
            .ok_or_else(|| CatalogError::version_not_found(&package.id, raw))?;
        if let Some(revision) = reference.revision {
            if revision != latest.revision {
                return Err(CatalogError::validation(
                    codes::DEFAULT_RELEASE_NOT_LATEST_REVISION,
                    format!(
                        "Default release version '{}' is not the latest revision ({})",
                        raw,
                        latest.key()
                    ),
                )
                .with_param("version", raw));
            }
        }
        if latest.status != VersionStatus::Release {
            return Err(CatalogError::validation(
                codes::DEFAULT_RELEASE_NOT_RELEASE_STATUS,
                format!("Default release version '{}' has status {}", raw, latest.status),
            )
            .with_param("version", raw));
        }
        Ok(reference.name)
    }

    fn schedule_regrouping(&self, package: Package) {
        let store = self.store.clone();
        let cache = self.cache.clone();
        let limit = self.config.limits.operation_group_operations_limit;
        self.background.spawn("regroup", async move {
            for revision in store.list_versions(&package.id).await? {
                if let Err(e) =
                    recalculate_autogenerated_groups(store.as_ref(), &cache, &package, &revision, limit).await
                {
                    log::error!(
                        "Regrouping of {} in '{}' failed: {}",
                        revision.key(),
                        package.id,
                        e
                    );
                }
            }
            log::info!("Autogenerated groups of '{}' recalculated", package.id);
            Ok(())
        });
    }

    pub async fn delete_package(&self, principal: &Principal, id: &str) -> CatalogResult<Vec<Id>> {
        let package = self
            .auth
            .check_package(principal, id, Permission::DeletePackage)
            .await?;
        if package.is_private_workspace() && !self.auth.is_sysadmin(principal).await? {
            return Err(private_workspace_not_modifiable());
        }
        let deleted = self
            .store
            .soft_delete_tree(&package.id, principal.actor_id(), Utc::now())
            .await?;
        log::info!("Package '{}' deleted with {} packages in its subtree", package.id, deleted.len());
        self.activity.track(ActivityEvent::new(
            EventType::DeletePackage,
            &package.id,
            principal.actor_id(),
            serde_json::json!({ "deleted": deleted }),
        ));
        Ok(deleted)
    }

    /// Rename or move a subtree. Workspaces and groups may convert into each
    /// other; packages and dashboards always keep a parent.
    pub async fn move_package(
        &self,
        principal: &Principal,
        from_id: &str,
        to_id: &str,
        overwrite_history: bool,
    ) -> CatalogResult<PackageTransition> {
        validate_package_id(to_id)?;
        let package = self
            .auth
            .check_package(principal, from_id, Permission::CreateAndUpdatePackage)
            .await?;
        if package.is_private_workspace() && !self.auth.is_sysadmin(principal).await? {
            return Err(private_workspace_not_modifiable());
        }
        if to_id == from_id || is_descendant_of(to_id, from_id) {
            return Err(incompatible_move(from_id, to_id, "target lies inside the moved subtree"));
        }

        let new_parent_id = parent_of(to_id);
        let new_kind = match (package.kind, new_parent_id.is_empty()) {
            (PackageKind::Workspace, true) | (PackageKind::Group, false) => None,
            (PackageKind::Workspace, false) => Some(PackageKind::Group),
            (PackageKind::Group, true) => Some(PackageKind::Workspace),
            (PackageKind::Package | PackageKind::Dashboard, false) => None,
            (PackageKind::Package | PackageKind::Dashboard, true) => {
                return Err(incompatible_move(from_id, to_id, "only groups can become workspaces"));
            }
        };
        if new_parent_id.is_empty() {
            self.auth.require_sysadmin(principal).await?;
        } else {
            let parent = self
                .auth
                .check_package(principal, new_parent_id, Permission::CreateAndUpdatePackage)
                .await?;
            if !parent.kind.is_container() {
                return Err(incompatible_move(
                    from_id,
                    to_id,
                    &format!("'{}' cannot hold children", parent.id),
                ));
            }
        }
        if self.live(to_id).await?.is_some() {
            return Err(alias_taken(to_id));
        }
        if !overwrite_history {
            let latest = self
                .store
                .list_transitions_from(to_id)
                .await?
                .into_iter()
                .max_by_key(|t| t.seq);
            if let Some(edge) = latest {
                let reverses = edge.to_id == from_id;
                if !reverses {
                    return Err(CatalogError::conflict(
                        codes::TO_PACKAGE_REDIRECT_EXISTS,
                        format!(
                            "Package id '{}' redirects to '{}'; pass overwriteHistory to reuse it",
                            to_id, edge.to_id
                        ),
                    )
                    .with_param("id", to_id)
                    .with_param("redirectTo", &edge.to_id));
                }
            }
        }
        self.store.purge_deleted_tree(to_id).await?;

        let move_id = crate::model::generate_id();
        let now = Utc::now();
        let mut moved_ids = vec![package.id.clone()];
        moved_ids.extend(
            self.store
                .list_descendants(&package.id)
                .await?
                .into_iter()
                .map(|p| p.id),
        );
        let transitions: Vec<PackageTransition> = moved_ids
            .iter()
            .map(|old_id| PackageTransition {
                move_id: move_id.clone(),
                from_id: old_id.clone(),
                to_id: format!("{}{}", to_id, &old_id[from_id.len()..]),
                status: TransitionStatus::Running,
                details: None,
                created_at: now,
                created_by: principal.actor_id().to_string(),
                completed_at: None,
                seq: 0,
            })
            .collect();

        self.store
            .move_package_tree(PackageMove {
                from_id: from_id.to_string(),
                to_id: to_id.to_string(),
                new_kind,
                transitions,
                overwrite_history,
            })
            .await?;
        self.store
            .complete_transitions(&move_id, TransitionStatus::Complete, None)
            .await?;
        log::info!("Package '{}' moved to '{}' (move {})", from_id, to_id, move_id);
        self.activity.track(ActivityEvent::new(
            EventType::MovePackage,
            to_id,
            principal.actor_id(),
            serde_json::json!({ "fromId": from_id, "toId": to_id, "moveId": move_id }),
        ));
        self.get_move_status(&move_id).await
    }

    pub async fn get_move_status(&self, move_id: &str) -> CatalogResult<PackageTransition> {
        self.store.get_transition(move_id).await?.ok_or_else(|| {
            CatalogError::not_found(
                codes::TRANSITION_NOT_FOUND,
                format!("Package move '{}' not found", move_id),
            )
            .with_param("id", move_id)
        })
    }

    pub async fn list_transitions(&self, id: &str) -> CatalogResult<Vec<PackageTransition>> {
        let mut transitions = self.store.list_transitions_touching(id).await?;
        transitions.sort_by_key(|t| t.seq);
        Ok(transitions)
    }

    pub async fn list_packages(
        &self,
        principal: &Principal,
        filter: &PackageListFilter,
    ) -> CatalogResult<Vec<PackageView>> {
        let text = filter
            .text_filter
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);
        let favorites: BTreeSet<Id> = match principal.user_id() {
            Some(user_id) => self.store.list_favorites(user_id).await?.into_iter().collect(),
            None => BTreeSet::new(),
        };
        let shared: BTreeSet<Id> = match principal.user_id() {
            Some(user_id) if filter.only_shared => self
                .store
                .list_member_roles_for_user(user_id)
                .await?
                .into_iter()
                .map(|m| m.package_id)
                .collect(),
            _ => BTreeSet::new(),
        };

        let mut matched = Vec::new();
        for package in self.store.list_packages().await? {
            let in_scope = match filter.parent_id.as_deref() {
                Some(parent) if filter.show_all_descendants => is_descendant_of(&package.id, parent),
                Some(parent) => package.parent_id == parent,
                None if filter.show_all_descendants || text.is_some() => true,
                None => package.parent_id.is_empty(),
            };
            if !in_scope {
                continue;
            }
            if !filter.kinds.is_empty() && !filter.kinds.contains(&package.kind) {
                continue;
            }
            if let Some(service_name) = filter.service_name.as_deref() {
                if package.service_name != service_name {
                    continue;
                }
            }
            if let Some(text) = &text {
                let hit = package.id.to_lowercase().contains(text)
                    || package.name.to_lowercase().contains(text)
                    || package.service_name.to_lowercase().contains(text);
                if !hit || package.exclude_from_search {
                    continue;
                }
            }
            if filter.only_favorite && !favorites.contains(&package.id) {
                continue;
            }
            if filter.only_shared && !shared.contains(&package.id) {
                continue;
            }
            if !self.auth.can_read(principal, &package).await? {
                continue;
            }
            matched.push(package);
        }
        matched.sort_by(|a, b| a.id.cmp(&b.id));

        let mut views = Vec::new();
        for package in filter.paging.apply(matched) {
            views.push(self.view(principal, package, false).await?);
        }
        Ok(views)
    }

    pub async fn favor(&self, principal: &Principal, id: &str) -> CatalogResult<()> {
        let user_id = require_user(principal)?;
        let package = self.auth.check_package(principal, id, Permission::Read).await?;
        self.store.add_favorite(user_id, &package.id).await?;
        Ok(())
    }

    pub async fn disfavor(&self, principal: &Principal, id: &str) -> CatalogResult<()> {
        let user_id = require_user(principal)?;
        self.store.remove_favorite(user_id, id).await?;
        Ok(())
    }

    /// Personal workspace hidden from everyone but its owner and sysadmins.
    pub async fn create_private_workspace(&self, principal: &Principal) -> CatalogResult<Package> {
        let user_id = require_user(principal)?;
        let id = private_workspace_id(user_id);
        if let Some(existing) = self.live(&id).await? {
            return Ok(existing);
        }
        self.store.purge_deleted_tree(&id).await?;
        let package = Package {
            id: id.clone(),
            kind: PackageKind::Workspace,
            parent_id: String::new(),
            alias: id.clone(),
            name: format!("{} private workspace", user_id),
            description: String::new(),
            default_role: ROLE_NONE.to_string(),
            default_release_version: String::new(),
            release_version_pattern: String::new(),
            service_name: String::new(),
            rest_grouping_prefix: String::new(),
            exclude_from_search: true,
            image_url: String::new(),
            created_at: Utc::now(),
            created_by: user_id.to_string(),
            deleted_at: None,
            deleted_by: None,
        };
        self.store.insert_package(package.clone()).await?;
        self.auth.grant_admin(&id, user_id).await?;

        let mut user = match self.store.get_user(user_id).await? {
            Some(user) => user,
            None => User::external(user_id),
        };
        user.private_package_id = id.clone();
        self.store.upsert_user(user).await?;
        log::info!("Private workspace '{}' created for {}", id, user_id);
        self.activity.track(ActivityEvent::new(
            EventType::CreatePackage,
            &id,
            user_id,
            serde_json::json!({ "kind": "workspace", "private": true }),
        ));
        Ok(package)
    }
}

fn require_user(principal: &Principal) -> CatalogResult<&str> {
    principal
        .user_id()
        .ok_or_else(|| CatalogError::forbidden(codes::UNAUTHENTICATED, "This operation requires a user"))
}

fn invalid_kind(kind: PackageKind, reason: &str) -> CatalogError {
    CatalogError::validation(
        codes::INVALID_PACKAGE_KIND,
        format!("Cannot create {}: {}", kind, reason),
    )
    .with_param("kind", kind.as_str())
}

fn alias_taken(id: &str) -> CatalogError {
    CatalogError::conflict(
        codes::ALIAS_ALREADY_TAKEN,
        format!("Package id '{}' is already taken", id),
    )
    .with_param("id", id)
}

fn incompatible_move(from_id: &str, to_id: &str, reason: &str) -> CatalogError {
    CatalogError::validation(
        codes::INCOMPATIBLE_PACKAGE_MOVE,
        format!("Cannot move '{}' to '{}': {}", from_id, to_id, reason),
    )
    .with_param("from", from_id)
    .with_param("to", to_id)
}

fn private_workspace_not_modifiable() -> CatalogError {
    CatalogError::forbidden(
        codes::PRIVATE_WORKSPACE_NOT_MODIFIABLE,
        "Private workspace can only be modified by a system administrator",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::store::traits::*;

    fn graph() -> (Arc<MemoryStore>, PackageGraph<MemoryStore>, BackgroundExecutor) {
        let store = Arc::new(MemoryStore::new());
        let background = BackgroundExecutor::new(2);
        let activity = ActivityTracker::new(store.clone(), background.clone());
        let auth = Authorization::new(store.clone(), activity.clone());
        let graph = PackageGraph::new(
            store.clone(),
            Arc::new(AppConfig::default()),
            auth,
            activity,
            background.clone(),
            Arc::new(TransformedDocumentCache::new()),
        );
        (store, graph, background)
    }

    fn new_package(kind: PackageKind, parent: &str, alias: &str) -> NewPackage {
        NewPackage {
            kind: Some(kind),
            parent_id: parent.to_string(),
            alias: alias.to_string(),
            ..Default::default()
        }
    }

    async fn seed(graph: &PackageGraph<MemoryStore>, store: &MemoryStore) -> Principal {
        store.add_sysadmin("root").await.unwrap();
        let root = Principal::user("root");
        graph
            .create_package(&root, new_package(PackageKind::Workspace, "", "acme"))
            .await
            .unwrap();
        graph
            .create_package(&root, new_package(PackageKind::Group, "acme", "pay"))
            .await
            .unwrap();
        graph
            .create_package(&root, new_package(PackageKind::Package, "acme.pay", "gw"))
            .await
            .unwrap();
        root
    }

    #[tokio::test]
    async fn test_create_validates_kind_and_collisions() {
        let (store, graph, _) = graph();
        let root = seed(&graph, &store).await;

        let err = graph
            .create_package(&root, new_package(PackageKind::Package, "", "loose"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::EMPTY_PARAMETER);
        let err = graph
            .create_package(&root, new_package(PackageKind::Workspace, "acme", "nested"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_PACKAGE_KIND);
        let err = graph
            .create_package(&root, new_package(PackageKind::Package, "acme.pay.gw", "child"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_PACKAGE_KIND);
        let err = graph
            .create_package(&root, new_package(PackageKind::Package, "acme.pay", "gw"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::ALIAS_ALREADY_TAKEN);

        let mut bad_prefix = new_package(PackageKind::Package, "acme.pay", "orders");
        bad_prefix.rest_grouping_prefix = "/api/{group}".to_string();
        let err = graph.create_package(&root, bad_prefix).await.unwrap_err();
        assert_eq!(err.code(), codes::INVALID_REST_GROUPING_PREFIX);

        let created = store.get_package("acme.pay.gw").await.unwrap().unwrap();
        assert_eq!(created.parent_id, "acme.pay");
        assert_eq!(created.alias, "gw");
    }

    #[tokio::test]
    async fn test_rename_cycle_keeps_history() {
        let (store, graph, _) = graph();
        let root = seed(&graph, &store).await;

        graph
            .move_package(&root, "acme.pay", "acme.payments", false)
            .await
            .unwrap();
        match graph.get_package(&root, "acme.pay.gw", false).await.unwrap() {
            PackageLookup::Moved { to_id, .. } => assert_eq!(to_id, "acme.payments.gw"),
            other => panic!("expected redirect, got {:?}", other),
        }
        let err = graph
            .create_package(&root, new_package(PackageKind::Group, "acme", "pay"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::PACKAGE_REDIRECT_EXISTS);

        let status = graph
            .move_package(&root, "acme.payments", "acme.pay", false)
            .await
            .unwrap();
        assert_eq!(status.status, TransitionStatus::Complete);
        assert!(matches!(
            graph.get_package(&root, "acme.pay", false).await.unwrap(),
            PackageLookup::Found(_)
        ));
        let history = graph.list_transitions("acme.pay").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].to_id, "acme.payments");
        assert_eq!(history[1].from_id, "acme.payments");
    }

    #[tokio::test]
    async fn test_move_into_redirected_id_requires_overwrite() {
        let (store, graph, _) = graph();
        let root = seed(&graph, &store).await;
        graph
            .create_package(&root, new_package(PackageKind::Package, "acme.pay", "legacy"))
            .await
            .unwrap();
        graph
            .move_package(&root, "acme.pay.gw", "acme.pay.gateway", false)
            .await
            .unwrap();

        let err = graph
            .move_package(&root, "acme.pay.legacy", "acme.pay.gw", false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::TO_PACKAGE_REDIRECT_EXISTS);
        graph
            .move_package(&root, "acme.pay.legacy", "acme.pay.gw", true)
            .await
            .unwrap();

        let err = graph
            .move_package(&root, "acme.pay.gw", "rootless", false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INCOMPATIBLE_PACKAGE_MOVE);
    }

    #[tokio::test]
    async fn test_service_name_is_sticky_and_unique() {
        let (store, graph, _) = graph();
        let root = seed(&graph, &store).await;
        graph
            .update_package(
                &root,
                "acme.pay.gw",
                PackagePatch {
                    service_name: Some("gateway".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = graph
            .update_package(
                &root,
                "acme.pay.gw",
                PackagePatch {
                    service_name: Some("other".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::SERVICE_NAME_CANT_BE_MODIFIED);

        let mut twin = new_package(PackageKind::Package, "acme.pay", "twin");
        twin.service_name = "gateway".to_string();
        let err = graph.create_package(&root, twin).await.unwrap_err();
        assert_eq!(err.code(), codes::SERVICE_NAME_ALREADY_TAKEN);
    }

    #[tokio::test]
    async fn test_private_workspace_is_hidden() {
        let (store, graph, _) = graph();
        seed(&graph, &store).await;
        let alice = Principal::user("alice");
        let workspace = graph.create_private_workspace(&alice).await.unwrap();
        assert!(workspace.is_private_workspace());

        assert!(matches!(
            graph.get_package(&alice, &workspace.id, false).await.unwrap(),
            PackageLookup::Found(_)
        ));
        let err = graph
            .get_package(&Principal::user("bob"), &workspace.id, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::PACKAGE_NOT_FOUND);

        let err = graph
            .update_package(
                &alice,
                &workspace.id,
                PackagePatch {
                    name: Some("mine".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::PRIVATE_WORKSPACE_NOT_MODIFIABLE);
        assert_eq!(
            store.get_user("alice").await.unwrap().unwrap().private_package_id,
            workspace.id
        );
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let (store, graph, _) = graph();
        let root = seed(&graph, &store).await;
        graph.favor(&root, "acme.pay.gw").await.unwrap();

        let all = graph
            .list_packages(
                &root,
                &PackageListFilter {
                    parent_id: Some("acme".to_string()),
                    show_all_descendants: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        let favorites = graph
            .list_packages(
                &root,
                &PackageListFilter {
                    only_favorite: true,
                    show_all_descendants: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(favorites.len(), 1);
        assert!(favorites[0].is_favorite);

        let deleted = graph.delete_package(&root, "acme.pay").await.unwrap();
        assert_eq!(deleted.len(), 2);
        let err = graph.get_package(&root, "acme.pay.gw", false).await.unwrap_err();
        assert_eq!(err.code(), codes::PACKAGE_NOT_FOUND);
        let err = graph
            .create_package(&root, new_package(PackageKind::Group, "acme", "pay"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::ALIAS_ALREADY_TAKEN);
    }
}
