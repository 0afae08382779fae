use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::config::IdentityConfig;
use crate::error::{codes, CatalogError, CatalogResult};
use crate::logic::activity::ActivityTracker;
use crate::model::{
    api_key_covers, lineage_ids, slugify_role, ActivityEvent, ApiKey, CreatedApiKey, EventType, Id,
    MemberRoleView, NewApiKey, Package, PackageMember, PackageMemberRole, Permission, Principal,
    Role, RoleAction, User, ROLE_ADMIN, ROLE_NONE, ROLE_VIEWER, WILDCARD_PACKAGE_ID,
};
use crate::store::traits::Store;

pub const SYSTEM_API_KEY_NAME: &str = "system";

/// A role held on a package, directly or through an ancestor.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveRole {
    pub role_id: String,
    /// Ancestor the role is assigned on; `None` for direct assignments.
    pub inherited_from: Option<Id>,
}

/// Role-based access over package trees, plus the role catalog, members
/// and API keys.
pub struct Authorization<S: Store> {
    store: Arc<S>,
    activity: ActivityTracker<S>,
}

impl<S: Store> Clone for Authorization<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            activity: self.activity.clone(),
        }
    }
}

impl<S: Store + 'static> Authorization<S> {
    pub fn new(store: Arc<S>, activity: ActivityTracker<S>) -> Self {
        Self { store, activity }
    }

    /// The system principal and global admin keys count as sysadmins.
    pub async fn is_sysadmin(&self, principal: &Principal) -> CatalogResult<bool> {
        match principal {
            Principal::System => Ok(true),
            Principal::User { user_id, .. } => Ok(self.store.is_sysadmin(user_id).await?),
            Principal::ApiKey {
                package_id, roles, ..
            } => Ok(package_id == WILDCARD_PACKAGE_ID && roles.iter().any(|r| r == ROLE_ADMIN)),
        }
    }

    pub async fn require_sysadmin(&self, principal: &Principal) -> CatalogResult<()> {
        if self.is_sysadmin(principal).await? {
            Ok(())
        } else {
            Err(CatalogError::insufficient_privileges())
        }
    }

    async fn roles_by_id(&self) -> CatalogResult<HashMap<String, Role>> {
        Ok(self
            .store
            .list_roles()
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect())
    }

    /// Role applied when the user has no assignment anywhere in the lineage.
    /// `none` on any ancestor hides the whole subtree.
    async fn default_role(&self, package: &Package) -> CatalogResult<String> {
        let mut nearest = package.default_role.clone();
        if nearest == ROLE_NONE {
            return Ok(nearest);
        }
        for ancestor_id in lineage_ids(&package.id).iter().rev().skip(1) {
            let Some(ancestor) = self.store.get_package(ancestor_id).await? else {
                continue;
            };
            if ancestor.default_role == ROLE_NONE {
                return Ok(ROLE_NONE.to_string());
            }
            if nearest.is_empty() {
                nearest = ancestor.default_role;
            }
        }
        if nearest.is_empty() {
            nearest = ROLE_VIEWER.to_string();
        }
        Ok(nearest)
    }

    /// Union of the roles assigned over the lineage, root first.
    pub async fn effective_roles(
        &self,
        principal: &Principal,
        package: &Package,
    ) -> CatalogResult<Vec<EffectiveRole>> {
        match principal {
            Principal::System => Ok(vec![EffectiveRole {
                role_id: ROLE_ADMIN.to_string(),
                inherited_from: None,
            }]),
            Principal::ApiKey {
                package_id, roles, ..
            } => {
                if !api_key_covers(package_id, &package.id) {
                    return Ok(Vec::new());
                }
                Ok(roles
                    .iter()
                    .map(|role_id| EffectiveRole {
                        role_id: role_id.clone(),
                        inherited_from: None,
                    })
                    .collect())
            }
            Principal::User { user_id, .. } => {
                let lineage = lineage_ids(&package.id);
                let mut assignments: Vec<PackageMemberRole> = self
                    .store
                    .list_member_roles(&lineage)
                    .await?
                    .into_iter()
                    .filter(|m| &m.user_id == user_id)
                    .collect();
                assignments.sort_by_key(|m| m.package_id.len());

                let mut seen = BTreeSet::new();
                let mut roles = Vec::new();
                for assignment in assignments {
                    for role_id in assignment.role_ids {
                        if seen.insert(role_id.clone()) {
                            roles.push(EffectiveRole {
                                role_id,
                                inherited_from: (assignment.package_id != package.id)
                                    .then(|| assignment.package_id.clone()),
                            });
                        }
                    }
                }
                if roles.is_empty() {
                    roles.push(EffectiveRole {
                        role_id: self.default_role(package).await?,
                        inherited_from: None,
                    });
                }
                Ok(roles)
            }
        }
    }

    pub async fn permissions(
        &self,
        principal: &Principal,
        package: &Package,
    ) -> CatalogResult<BTreeSet<Permission>> {
        if self.is_sysadmin(principal).await? {
            return Ok(Permission::ALL.into_iter().collect());
        }
        let roles = self.roles_by_id().await?;
        Ok(self
            .effective_roles(principal, package)
            .await?
            .iter()
            .filter_map(|r| roles.get(&r.role_id))
            .flat_map(|r| r.permissions.iter().copied())
            .collect())
    }

    pub async fn can_read(&self, principal: &Principal, package: &Package) -> CatalogResult<bool> {
        Ok(self
            .permissions(principal, package)
            .await?
            .contains(&Permission::Read))
    }

    /// A package without read access reads as missing; an API key outside
    /// its subtree is refused outright.
    pub async fn check(
        &self,
        principal: &Principal,
        package: &Package,
        permission: Permission,
    ) -> CatalogResult<()> {
        if let Principal::ApiKey { package_id, .. } = principal {
            if !api_key_covers(package_id, &package.id) {
                return Err(CatalogError::insufficient_privileges()
                    .with_param("packageId", &package.id));
            }
        }
        let permissions = self.permissions(principal, package).await?;
        if !permissions.contains(&Permission::Read) {
            return Err(CatalogError::package_not_found(&package.id));
        }
        if !permissions.contains(&permission) {
            return Err(CatalogError::insufficient_privileges()
                .with_param("packageId", &package.id)
                .with_param("permission", permission.as_str()));
        }
        Ok(())
    }

    /// Load a live package and check `permission` on it.
    pub async fn check_package(
        &self,
        principal: &Principal,
        package_id: &str,
        permission: Permission,
    ) -> CatalogResult<Package> {
        let package = self
            .store
            .get_package(package_id)
            .await?
            .filter(|p| !p.is_deleted())
            .ok_or_else(|| CatalogError::package_not_found(package_id))?;
        self.check(principal, &package, permission).await?;
        Ok(package)
    }

    pub async fn user_permissions(
        &self,
        principal: &Principal,
        package_id: &str,
    ) -> CatalogResult<Vec<String>> {
        let package = self
            .check_package(principal, package_id, Permission::Read)
            .await?;
        Ok(self
            .permissions(principal, &package)
            .await?
            .into_iter()
            .map(|p| p.as_str().to_string())
            .collect())
    }

    async fn max_rank(&self, principal: &Principal, package: &Package) -> CatalogResult<i32> {
        if self.is_sysadmin(principal).await? {
            return Ok(i32::MAX);
        }
        let roles = self.roles_by_id().await?;
        Ok(self
            .effective_roles(principal, package)
            .await?
            .iter()
            .filter_map(|r| roles.get(&r.role_id))
            .map(|r| r.rank)
            .max()
            .unwrap_or(0))
    }

    /// Roles the caller may hand out on the package, highest rank first.
    pub async fn available_roles(
        &self,
        principal: &Principal,
        package_id: &str,
    ) -> CatalogResult<Vec<Role>> {
        let package = self
            .check_package(principal, package_id, Permission::Read)
            .await?;
        let max_rank = self.max_rank(principal, &package).await?;
        Ok(self
            .list_roles()
            .await?
            .into_iter()
            .filter(|r| r.id != ROLE_NONE && r.rank <= max_rank)
            .collect())
    }

    async fn require_available(
        &self,
        principal: &Principal,
        package: &Package,
        role_ids: &[String],
    ) -> CatalogResult<Vec<Role>> {
        let roles = self.roles_by_id().await?;
        let max_rank = self.max_rank(principal, package).await?;
        let mut resolved = Vec::with_capacity(role_ids.len());
        for role_id in role_ids {
            let role = roles.get(role_id).ok_or_else(|| role_not_found(role_id))?;
            if role.id == ROLE_NONE || role.rank > max_rank {
                return Err(CatalogError::forbidden(
                    codes::NOT_AVAILABLE_ROLE,
                    format!("Role '{}' is not available to you", role_id),
                )
                .with_param("role", role_id));
            }
            resolved.push(role.clone());
        }
        Ok(resolved)
    }

    // ---- role catalog ----

    pub async fn list_roles(&self) -> CatalogResult<Vec<Role>> {
        let mut roles = self.store.list_roles().await?;
        roles.sort_by(|a, b| b.rank.cmp(&a.rank));
        Ok(roles)
    }

    pub async fn create_role(
        &self,
        principal: &Principal,
        name: &str,
        permissions: Vec<Permission>,
    ) -> CatalogResult<Role> {
        self.require_sysadmin(principal).await?;
        let id = slugify_role(name);
        if id.is_empty() {
            return Err(CatalogError::empty_param("role"));
        }
        if self.store.get_role(&id).await?.is_some() {
            return Err(CatalogError::conflict(
                codes::ROLE_ALREADY_EXISTS,
                format!("Role '{}' already exists", id),
            )
            .with_param("role", &id));
        }
        let viewer = self
            .store
            .get_role(ROLE_VIEWER)
            .await?
            .ok_or_else(|| role_not_found(ROLE_VIEWER))?;
        let mut permissions: BTreeSet<Permission> = permissions.into_iter().collect();
        permissions.insert(Permission::Read);
        let role = Role {
            id,
            display_name: name.trim().to_string(),
            permissions: permissions.into_iter().collect(),
            rank: viewer.rank + 1,
            read_only: false,
        };
        self.store.insert_role(role.clone()).await?;
        log::info!("Role '{}' created with rank {}", role.id, role.rank);
        Ok(role)
    }

    pub async fn update_role_permissions(
        &self,
        principal: &Principal,
        role_id: &str,
        permissions: Vec<Permission>,
    ) -> CatalogResult<Role> {
        self.require_sysadmin(principal).await?;
        let mut role = self.modifiable_role(role_id).await?;
        let mut permissions: BTreeSet<Permission> = permissions.into_iter().collect();
        permissions.insert(Permission::Read);
        role.permissions = permissions.into_iter().collect();
        self.store.update_role(role.clone()).await?;
        Ok(role)
    }

    pub async fn delete_role(&self, principal: &Principal, role_id: &str) -> CatalogResult<()> {
        self.require_sysadmin(principal).await?;
        self.modifiable_role(role_id).await?;
        if !self.store.delete_role(role_id).await? {
            return Err(role_not_found(role_id));
        }
        log::info!("Role '{}' deleted", role_id);
        Ok(())
    }

    async fn modifiable_role(&self, role_id: &str) -> CatalogResult<Role> {
        let role = self
            .store
            .get_role(role_id)
            .await?
            .ok_or_else(|| role_not_found(role_id))?;
        if role.read_only {
            return Err(CatalogError::forbidden(
                codes::ROLE_NOT_MODIFIABLE,
                format!("Role '{}' is read-only", role_id),
            )
            .with_param("role", role_id));
        }
        Ok(role)
    }

    /// `ordered` lists every role except `none`, highest first. Admin stays
    /// on top and read-only roles keep their position.
    pub async fn set_role_order(&self, principal: &Principal, ordered: Vec<String>) -> CatalogResult<()> {
        self.require_sysadmin(principal).await?;
        let current: Vec<Role> = self
            .list_roles()
            .await?
            .into_iter()
            .filter(|r| r.id != ROLE_NONE)
            .collect();

        let requested: BTreeSet<&String> = ordered.iter().collect();
        let existing: BTreeSet<&String> = current.iter().map(|r| &r.id).collect();
        if requested.len() != ordered.len() || requested != existing {
            return Err(invalid_role_order("Role order must list every role exactly once"));
        }
        if ordered.first().map(String::as_str) != Some(ROLE_ADMIN) {
            return Err(invalid_role_order("Admin role must come first"));
        }
        for (index, role) in current.iter().enumerate() {
            if role.read_only && ordered[index] != role.id {
                return Err(invalid_role_order(&format!(
                    "Read-only role '{}' cannot change its position",
                    role.id
                ))
                .with_param("role", &role.id));
            }
        }

        let total = ordered.len() as i32;
        let ranks = ordered
            .into_iter()
            .enumerate()
            .map(|(index, id)| (id, total - index as i32))
            .collect();
        self.store.set_role_ranks(ranks).await?;
        Ok(())
    }

    // ---- members ----

    pub async fn list_members(
        &self,
        principal: &Principal,
        package_id: &str,
    ) -> CatalogResult<Vec<PackageMember>> {
        let package = self
            .check_package(principal, package_id, Permission::Read)
            .await?;
        let roles = self.roles_by_id().await?;
        let mut assignments = self
            .store
            .list_member_roles(&lineage_ids(&package.id))
            .await?;
        assignments.sort_by_key(|m| m.package_id.len());

        let mut by_user: BTreeMap<String, Vec<MemberRoleView>> = BTreeMap::new();
        for assignment in assignments {
            let views = by_user.entry(assignment.user_id.clone()).or_default();
            for role_id in &assignment.role_ids {
                let Some(role) = roles.get(role_id) else {
                    continue;
                };
                views.push(MemberRoleView {
                    role_id: role.id.clone(),
                    role: role.display_name.clone(),
                    inheritance: (assignment.package_id != package.id)
                        .then(|| assignment.package_id.clone()),
                });
            }
        }

        let mut members = Vec::with_capacity(by_user.len());
        for (user_id, roles) in by_user {
            let user = match self.store.get_user(&user_id).await? {
                Some(user) => user,
                None => User::external(&user_id),
            };
            members.push(PackageMember { user, roles });
        }
        Ok(members)
    }

    pub async fn add_members(
        &self,
        principal: &Principal,
        package_id: &str,
        emails: &[String],
        role_ids: &[String],
    ) -> CatalogResult<Vec<PackageMember>> {
        if emails.is_empty() {
            return Err(CatalogError::empty_param("emails"));
        }
        if role_ids.is_empty() {
            return Err(CatalogError::empty_param("roleIds"));
        }
        let package = self
            .check_package(principal, package_id, Permission::ManageMembers)
            .await?;
        self.require_available(principal, &package, role_ids).await?;

        for email in emails {
            let user = match self.store.find_user_by_email(email).await? {
                Some(user) => user,
                None => {
                    let user = User::external(email);
                    self.store.upsert_user(user.clone()).await?;
                    user
                }
            };
            let mut assigned = self
                .store
                .get_member_roles(&package.id, &user.id)
                .await?
                .map(|m| m.role_ids)
                .unwrap_or_default();
            for role_id in role_ids {
                if !assigned.contains(role_id) {
                    assigned.push(role_id.clone());
                }
            }
            self.store
                .put_member_roles(PackageMemberRole {
                    package_id: package.id.clone(),
                    user_id: user.id.clone(),
                    role_ids: assigned,
                    updated_at: Utc::now(),
                    updated_by: principal.actor_id().to_string(),
                })
                .await?;
            self.activity.track(ActivityEvent::new(
                EventType::GrantRole,
                &package.id,
                principal.actor_id(),
                serde_json::json!({ "memberId": user.id, "roles": role_ids }),
            ));
        }
        self.list_members(principal, &package.id).await
    }

    pub async fn update_member_role(
        &self,
        principal: &Principal,
        package_id: &str,
        user_id: &str,
        role_id: &str,
        action: RoleAction,
    ) -> CatalogResult<()> {
        let package = self
            .check_package(principal, package_id, Permission::ManageMembers)
            .await?;
        self.require_available(principal, &package, &[role_id.to_string()])
            .await?;
        let current = self.store.get_member_roles(&package.id, user_id).await?;
        let mut role_ids = match (&current, action) {
            (Some(member), _) => member.role_ids.clone(),
            (None, RoleAction::Add) => {
                if self.store.get_user(user_id).await?.is_none() {
                    return Err(CatalogError::not_found(
                        codes::USER_NOT_FOUND,
                        format!("User '{}' not found", user_id),
                    )
                    .with_param("userId", user_id));
                }
                Vec::new()
            }
            (None, RoleAction::Remove) => return Err(member_role_not_found(&package.id, user_id, role_id)),
        };
        match action {
            RoleAction::Add => {
                if !role_ids.iter().any(|r| r == role_id) {
                    role_ids.push(role_id.to_string());
                }
            }
            RoleAction::Remove => {
                let before = role_ids.len();
                role_ids.retain(|r| r != role_id);
                if role_ids.len() == before {
                    return Err(member_role_not_found(&package.id, user_id, role_id));
                }
            }
        }
        self.store
            .put_member_roles(PackageMemberRole {
                package_id: package.id.clone(),
                user_id: user_id.to_string(),
                role_ids,
                updated_at: Utc::now(),
                updated_by: principal.actor_id().to_string(),
            })
            .await?;
        let action_name = match action {
            RoleAction::Add => "add",
            RoleAction::Remove => "remove",
        };
        self.activity.track(ActivityEvent::new(
            EventType::UpdateRole,
            &package.id,
            principal.actor_id(),
            serde_json::json!({ "memberId": user_id, "roleId": role_id, "action": action_name }),
        ));
        Ok(())
    }

    /// Remove the direct assignment of a user; inherited roles are untouched.
    pub async fn delete_member(
        &self,
        principal: &Principal,
        package_id: &str,
        user_id: &str,
    ) -> CatalogResult<()> {
        let package = self
            .check_package(principal, package_id, Permission::ManageMembers)
            .await?;
        let Some(member) = self.store.get_member_roles(&package.id, user_id).await? else {
            return Err(user_with_no_roles(&package.id, user_id));
        };
        self.require_available(principal, &package, &member.role_ids)
            .await?;
        if !self.store.delete_member(&package.id, user_id).await? {
            return Err(user_with_no_roles(&package.id, user_id));
        }
        self.activity.track(ActivityEvent::new(
            EventType::DeleteRole,
            &package.id,
            principal.actor_id(),
            serde_json::json!({ "memberId": user_id, "roles": member.role_ids }),
        ));
        Ok(())
    }

    /// Direct admin assignment, used for private workspaces.
    pub(crate) async fn grant_admin(&self, package_id: &str, user_id: &str) -> CatalogResult<()> {
        self.store
            .put_member_roles(PackageMemberRole {
                package_id: package_id.to_string(),
                user_id: user_id.to_string(),
                role_ids: vec![ROLE_ADMIN.to_string()],
                updated_at: Utc::now(),
                updated_by: user_id.to_string(),
            })
            .await?;
        Ok(())
    }

    // ---- api keys ----

    async fn check_key_scope(&self, principal: &Principal, package_id: &str) -> CatalogResult<Option<Package>> {
        if package_id == WILDCARD_PACKAGE_ID {
            self.require_sysadmin(principal).await?;
            return Ok(None);
        }
        let package = self
            .check_package(principal, package_id, Permission::AccessTokenManagement)
            .await?;
        Ok(Some(package))
    }

    pub async fn create_api_key(
        &self,
        principal: &Principal,
        package_id: &str,
        request: NewApiKey,
    ) -> CatalogResult<CreatedApiKey> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(CatalogError::empty_param("name"));
        }
        let package = self.check_key_scope(principal, package_id).await?;
        let roles = if request.roles.is_empty() {
            vec![ROLE_VIEWER.to_string()]
        } else {
            request.roles
        };
        match &package {
            Some(package) => {
                self.require_available(principal, package, &roles).await?;
            }
            None => {
                let known = self.roles_by_id().await?;
                if let Some(missing) = roles.iter().find(|r| !known.contains_key(*r)) {
                    return Err(role_not_found(missing));
                }
            }
        }

        let token = ApiKey::new_token();
        let key = ApiKey {
            id: ApiKey::new_id(),
            package_id: package_id.to_string(),
            name,
            roles,
            created_by: principal.actor_id().to_string(),
            created_for: request.created_for,
            created_at: Utc::now(),
            deleted_at: None,
            deleted_by: None,
            token_hash: ApiKey::hash_token(&token),
        };
        self.insert_key(&key).await?;
        self.activity.track(ActivityEvent::new(
            EventType::GenerateApiKey,
            package_id,
            principal.actor_id(),
            serde_json::json!({ "apiKeyId": key.id, "name": key.name }),
        ));
        Ok(CreatedApiKey { key, api_key: token })
    }

    async fn insert_key(&self, key: &ApiKey) -> CatalogResult<()> {
        if !self.store.insert_api_key(key.clone()).await? {
            return Err(CatalogError::conflict(
                codes::API_KEY_NAME_DUPLICATE,
                format!("API key with name '{}' already exists", key.name),
            )
            .with_param("name", &key.name)
            .with_param("packageId", &key.package_id));
        }
        Ok(())
    }

    pub async fn list_api_keys(&self, principal: &Principal, package_id: &str) -> CatalogResult<Vec<ApiKey>> {
        self.check_key_scope(principal, package_id).await?;
        Ok(self.store.list_api_keys(package_id).await?)
    }

    pub async fn revoke_api_key(
        &self,
        principal: &Principal,
        package_id: &str,
        key_id: &str,
    ) -> CatalogResult<()> {
        self.check_key_scope(principal, package_id).await?;
        let key = self
            .store
            .get_api_key(key_id)
            .await?
            .filter(|k| k.package_id == package_id && !k.is_revoked())
            .ok_or_else(|| api_key_not_found(key_id))?;
        if !self
            .store
            .revoke_api_key(&key.id, principal.actor_id(), Utc::now())
            .await?
        {
            return Err(api_key_not_found(key_id));
        }
        self.activity.track(ActivityEvent::new(
            EventType::RevokeApiKey,
            package_id,
            principal.actor_id(),
            serde_json::json!({ "apiKeyId": key.id, "name": key.name }),
        ));
        Ok(())
    }

    /// Uncached lookup of a bearer token.
    pub async fn resolve_api_key(&self, token: &str) -> CatalogResult<Principal> {
        let key = self
            .store
            .find_api_key_by_hash(&ApiKey::hash_token(token.trim()))
            .await?
            .filter(|k| !k.is_revoked())
            .ok_or_else(|| {
                CatalogError::forbidden(codes::UNAUTHENTICATED, "API key is invalid or revoked")
            })?;
        Ok(Principal::ApiKey {
            key_id: key.id,
            package_id: key.package_id,
            roles: key.roles,
            created_by: key.created_by,
        })
    }

    /// Sysadmin from `APIHUB_ADMIN_EMAIL` and the global system key from
    /// `APIHUB_ACCESS_TOKEN`.
    pub async fn bootstrap(&self, identity: &IdentityConfig) -> CatalogResult<()> {
        let mut admin_id = None;
        if !identity.admin_email.trim().is_empty() {
            let user = match self.store.find_user_by_email(&identity.admin_email).await? {
                Some(user) => user,
                None => {
                    let user = User::external(&identity.admin_email);
                    self.store.upsert_user(user.clone()).await?;
                    user
                }
            };
            self.store.add_sysadmin(&user.id).await?;
            log::info!("Sysadmin '{}' ensured", user.id);
            admin_id = Some(user.id);
        }

        let token = identity.access_token.trim();
        if token.is_empty() {
            return Ok(());
        }
        let hash = ApiKey::hash_token(token);
        if self.store.find_api_key_by_hash(&hash).await?.is_some() {
            return Ok(());
        }
        let now = Utc::now();
        for stale in self.store.list_api_keys(WILDCARD_PACKAGE_ID).await? {
            if stale.name == SYSTEM_API_KEY_NAME && !stale.is_revoked() {
                log::info!("Revoking rotated system API key {}", stale.id);
                self.store
                    .revoke_api_key(&stale.id, Principal::System.actor_id(), now)
                    .await?;
            }
        }
        let key = ApiKey {
            id: ApiKey::new_id(),
            package_id: WILDCARD_PACKAGE_ID.to_string(),
            name: SYSTEM_API_KEY_NAME.to_string(),
            roles: vec![ROLE_ADMIN.to_string()],
            created_by: admin_id.unwrap_or_else(|| Principal::System.actor_id().to_string()),
            created_for: None,
            created_at: now,
            deleted_at: None,
            deleted_by: None,
            token_hash: hash,
        };
        self.insert_key(&key).await?;
        log::info!("System API key {} created", key.id);
        Ok(())
    }
}

fn role_not_found(role_id: &str) -> CatalogError {
    CatalogError::not_found(codes::ROLE_NOT_FOUND, format!("Role '{}' not found", role_id))
        .with_param("role", role_id)
}

fn invalid_role_order(message: &str) -> CatalogError {
    CatalogError::validation(codes::INVALID_ROLE_ORDER, message)
}

fn member_role_not_found(package_id: &str, user_id: &str, role_id: &str) -> CatalogError {
    CatalogError::not_found(
        codes::MEMBER_ROLE_NOT_FOUND,
        format!(
            "User '{}' has no direct role '{}' in package '{}'",
            user_id, role_id, package_id
        ),
    )
    .with_param("packageId", package_id)
    .with_param("userId", user_id)
    .with_param("role", role_id)
}

fn user_with_no_roles(package_id: &str, user_id: &str) -> CatalogError {
    CatalogError::not_found(
        codes::USER_WITH_NO_ROLES,
        format!("User '{}' has no roles assigned in package '{}'", user_id, package_id),
    )
    .with_param("packageId", package_id)
    .with_param("userId", user_id)
}

fn api_key_not_found(key_id: &str) -> CatalogError {
    CatalogError::not_found(codes::API_KEY_NOT_FOUND, format!("API key '{}' not found", key_id))
        .with_param("apiKeyId", key_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::background::BackgroundExecutor;
    use crate::model::PackageKind;
    use crate::store::MemoryStore;
    use crate::store::traits::*;

    fn package(id: &str, kind: PackageKind, default_role: &str) -> Package {
        Package {
            id: id.to_string(),
            kind,
            parent_id: crate::model::parent_of(id).to_string(),
            alias: crate::model::alias_of(id).to_string(),
            name: id.to_string(),
            description: String::new(),
            default_role: default_role.to_string(),
            default_release_version: String::new(),
            release_version_pattern: String::new(),
            service_name: String::new(),
            rest_grouping_prefix: String::new(),
            exclude_from_search: false,
            image_url: String::new(),
            created_at: Utc::now(),
            created_by: "seed".to_string(),
            deleted_at: None,
            deleted_by: None,
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Authorization<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for p in [
            package("acme", PackageKind::Workspace, ROLE_VIEWER),
            package("acme.pay", PackageKind::Group, ""),
            package("acme.pay.gw", PackageKind::Package, ""),
            package("acme.billing", PackageKind::Package, ""),
            package("secret", PackageKind::Workspace, ROLE_NONE),
            package("secret.api", PackageKind::Package, ROLE_VIEWER),
        ] {
            store.insert_package(p).await.unwrap();
        }
        store.add_sysadmin("root").await.unwrap();
        let activity = ActivityTracker::new(store.clone(), BackgroundExecutor::new(2));
        let auth = Authorization::new(store.clone(), activity);
        (store, auth)
    }

    #[tokio::test]
    async fn test_roles_are_inherited_from_ancestors() {
        let (store, auth) = setup().await;
        let root = Principal::user("root");
        auth.add_members(&root, "acme", &["bob@example.com".to_string()], &["editor".to_string()])
            .await
            .unwrap();

        let bob = Principal::user("bob@example.com");
        let gw = store.get_package("acme.pay.gw").await.unwrap().unwrap();
        let permissions = auth.permissions(&bob, &gw).await.unwrap();
        assert!(permissions.contains(&Permission::ManageDraftVersion));
        assert!(!permissions.contains(&Permission::DeletePackage));

        let roles = auth.effective_roles(&bob, &gw).await.unwrap();
        assert_eq!(roles[0].inherited_from.as_deref(), Some("acme"));

        let err = auth
            .delete_member(&root, "acme.pay.gw", "bob@example.com")
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::USER_WITH_NO_ROLES);
    }

    #[tokio::test]
    async fn test_none_default_role_hides_subtree() {
        let (_, auth) = setup().await;
        let alice = Principal::user("alice");
        let err = auth
            .check_package(&alice, "secret.api", Permission::Read)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::PACKAGE_NOT_FOUND);
        assert!(auth
            .check_package(&alice, "acme.pay.gw", Permission::Read)
            .await
            .is_ok());
        let err = auth
            .check_package(&alice, "acme.pay.gw", Permission::ManageDraftVersion)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INSUFFICIENT_PRIVILEGES);
    }

    #[tokio::test]
    async fn test_api_key_scope() {
        let (_, auth) = setup().await;
        let root = Principal::user("root");
        let created = auth
            .create_api_key(
                &root,
                "acme.pay",
                NewApiKey {
                    name: "ci".to_string(),
                    roles: vec![],
                    created_for: None,
                },
            )
            .await
            .unwrap();
        let key = auth.resolve_api_key(&created.api_key).await.unwrap();

        let err = auth
            .check_package(&key, "acme.billing", Permission::Read)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INSUFFICIENT_PRIVILEGES);
        assert!(auth
            .check_package(&key, "acme.pay.gw", Permission::Read)
            .await
            .is_ok());

        let duplicate = auth
            .create_api_key(
                &root,
                "acme.pay",
                NewApiKey {
                    name: "ci".to_string(),
                    roles: vec![],
                    created_for: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(duplicate.code(), codes::API_KEY_NAME_DUPLICATE);

        auth.revoke_api_key(&root, "acme.pay", &created.key.id)
            .await
            .unwrap();
        assert_eq!(
            auth.resolve_api_key(&created.api_key).await.unwrap_err().code(),
            codes::UNAUTHENTICATED
        );
    }

    #[tokio::test]
    async fn test_add_members_rejects_higher_roles() {
        let (_, auth) = setup().await;
        let root = Principal::user("root");
        auth.add_members(&root, "acme", &["eve@example.com".to_string()], &["editor".to_string()])
            .await
            .unwrap();
        let eve = Principal::user("eve@example.com");
        // editors cannot manage members at all
        let err = auth
            .add_members(&eve, "acme", &["mallory@example.com".to_string()], &["admin".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INSUFFICIENT_PRIVILEGES);

        auth.add_members(&root, "acme.pay", &["eve@example.com".to_string()], &["admin".to_string()])
            .await
            .unwrap();
        let ok = auth
            .add_members(&eve, "acme.pay", &["dan@example.com".to_string()], &["viewer".to_string()])
            .await
            .unwrap();
        assert!(ok.iter().any(|m| m.user.id == "dan@example.com"));
        let err = auth
            .add_members(&eve, "acme.pay", &["dan@example.com".to_string()], &["ghost".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::ROLE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_role_catalog() {
        let (_, auth) = setup().await;
        let root = Principal::user("root");
        let role = auth
            .create_role(&root, "Release Manager", vec![Permission::ManageReleaseVersion])
            .await
            .unwrap();
        assert_eq!(role.id, "release-manager");
        assert_eq!(role.rank, 2);
        assert!(role.permissions.contains(&Permission::Read));

        let roles = auth.list_roles().await.unwrap();
        let ids: Vec<&str> = roles.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["admin", "editor", "release-manager", "viewer", "none"]);

        let err = auth
            .set_role_order(
                &root,
                vec!["editor".into(), "admin".into(), "release-manager".into(), "viewer".into()],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_ROLE_ORDER);
        auth.set_role_order(
            &root,
            vec!["admin".into(), "release-manager".into(), "editor".into(), "viewer".into()],
        )
        .await
        .unwrap();
        let ids: Vec<String> = auth.list_roles().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids[1], "release-manager");

        let err = auth.delete_role(&root, "viewer").await.unwrap_err();
        assert_eq!(err.code(), codes::ROLE_NOT_MODIFIABLE);
        auth.delete_role(&root, "release-manager").await.unwrap();

        let err = auth
            .create_role(&Principal::user("alice"), "Ops", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INSUFFICIENT_PRIVILEGES);
    }

    #[tokio::test]
    async fn test_bootstrap_creates_system_key() {
        let (store, auth) = setup().await;
        let identity = IdentityConfig {
            admin_email: "Admin@Example.com".to_string(),
            access_token: "bootstrap-token".to_string(),
            ..Default::default()
        };
        auth.bootstrap(&identity).await.unwrap();
        auth.bootstrap(&identity).await.unwrap();

        assert!(store.is_sysadmin("admin@example.com").await.unwrap());
        let key = auth.resolve_api_key("bootstrap-token").await.unwrap();
        assert!(auth.is_sysadmin(&key).await.unwrap());
        assert_eq!(store.list_api_keys(WILDCARD_PACKAGE_ID).await.unwrap().len(), 1);
    }
}
