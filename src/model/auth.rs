use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{is_descendant_of, sha256_hex, Id, WILDCARD_PACKAGE_ID};

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_EDITOR: &str = "editor";
pub const ROLE_VIEWER: &str = "viewer";
/// Pseudo-role denying read on a package subtree.
pub const ROLE_NONE: &str = "none";

pub const API_KEY_PREFIX: &str = "api-key_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    CreateAndUpdatePackage,
    DeletePackage,
    ManageDraftVersion,
    ManageReleaseVersion,
    ManageArchivedVersion,
    /// Add, remove and re-role package members.
    #[serde(rename = "user_access_management")]
    ManageMembers,
    AccessTokenManagement,
}

impl Permission {
    pub const ALL: [Permission; 8] = [
        Permission::Read,
        Permission::CreateAndUpdatePackage,
        Permission::DeletePackage,
        Permission::ManageDraftVersion,
        Permission::ManageReleaseVersion,
        Permission::ManageArchivedVersion,
        Permission::ManageMembers,
        Permission::AccessTokenManagement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::CreateAndUpdatePackage => "create_and_update_package",
            Permission::DeletePackage => "delete_package",
            Permission::ManageDraftVersion => "manage_draft_version",
            Permission::ManageReleaseVersion => "manage_release_version",
            Permission::ManageArchivedVersion => "manage_archived_version",
            Permission::ManageMembers => "user_access_management",
            Permission::AccessTokenManagement => "access_token_management",
        }
    }

    /// Permission needed to publish or patch a version with the given status.
    pub fn for_version_status(status: crate::model::VersionStatus) -> Self {
        match status {
            crate::model::VersionStatus::Draft => Permission::ManageDraftVersion,
            crate::model::VersionStatus::Release => Permission::ManageReleaseVersion,
            crate::model::VersionStatus::Archived => Permission::ManageArchivedVersion,
        }
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown permission: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    pub display_name: String,
    pub permissions: Vec<Permission>,
    pub rank: i32,
    pub read_only: bool,
}

impl Role {
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Seeded role catalog, highest rank first.
pub fn builtin_roles() -> Vec<Role> {
    vec![
        Role {
            id: ROLE_ADMIN.to_string(),
            display_name: "Admin".to_string(),
            permissions: Permission::ALL.to_vec(),
            rank: 3,
            read_only: true,
        },
        Role {
            id: ROLE_EDITOR.to_string(),
            display_name: "Editor".to_string(),
            permissions: vec![
                Permission::Read,
                Permission::CreateAndUpdatePackage,
                Permission::ManageDraftVersion,
                Permission::ManageReleaseVersion,
                Permission::ManageArchivedVersion,
            ],
            rank: 2,
            read_only: false,
        },
        Role {
            id: ROLE_VIEWER.to_string(),
            display_name: "Viewer".to_string(),
            permissions: vec![Permission::Read],
            rank: 1,
            read_only: true,
        },
        Role {
            id: ROLE_NONE.to_string(),
            display_name: "None".to_string(),
            permissions: Vec::new(),
            rank: 0,
            read_only: true,
        },
    ]
}

/// Lowercase, non-alphanumerics collapsed to `-`.
pub fn slugify_role(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut dash = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Direct role assignment of a user on one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMemberRole {
    pub package_id: Id,
    pub user_id: String,
    pub role_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub avatar_url: String,
    /// Workspace id reserved for this user's private workspace.
    pub private_package_id: String,
}

impl User {
    /// External identity created on first reference by email.
    pub fn external(email: &str) -> Self {
        let email = email.trim().to_lowercase();
        let name = email.split('@').next().unwrap_or_default().to_string();
        Self {
            id: email.clone(),
            name,
            email,
            avatar_url: String::new(),
            private_package_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRoleView {
    pub role_id: String,
    pub role: String,
    /// Package the role is inherited from, absent for direct assignments.
    pub inheritance: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMember {
    pub user: User,
    pub roles: Vec<MemberRoleView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub package_id: Id,
    pub name: String,
    pub roles: Vec<String>,
    pub created_by: String,
    pub created_for: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
    #[serde(skip_serializing)]
    pub token_hash: String,
}

impl ApiKey {
    pub fn new_id() -> String {
        format!("{}{}", API_KEY_PREFIX, uuid::Uuid::new_v4())
    }

    /// Opaque bearer token returned once at creation.
    pub fn new_token() -> String {
        format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        )
    }

    pub fn hash_token(token: &str) -> String {
        sha256_hex(token.as_bytes())
    }

    pub fn is_revoked(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_global(&self) -> bool {
        self.package_id == WILDCARD_PACKAGE_ID
    }

    /// A key reaches its own package, its descendants, or everything if global.
    pub fn covers(&self, package_id: &str) -> bool {
        api_key_covers(&self.package_id, package_id)
    }
}

pub fn api_key_covers(key_package_id: &str, package_id: &str) -> bool {
    key_package_id == WILDCARD_PACKAGE_ID
        || key_package_id == package_id
        || is_descendant_of(package_id, key_package_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApiKey {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub created_for: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedApiKey {
    #[serde(flatten)]
    pub key: ApiKey,
    pub api_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_scope() {
        assert!(api_key_covers("*", "acme.billing"));
        assert!(api_key_covers("acme.pay", "acme.pay"));
        assert!(api_key_covers("acme.pay", "acme.pay.gw"));
        assert!(!api_key_covers("acme.pay", "acme.billing"));
        assert!(!api_key_covers("acme.pay", "acme.payments"));
        assert!(!api_key_covers("acme.pay", "acme"));
    }

    #[test]
    fn test_slugify_role() {
        assert_eq!(slugify_role("Release Manager"), "release-manager");
        assert_eq!(slugify_role("  QA / Ops!! "), "qa-ops");
    }

    #[test]
    fn test_builtin_roles_ordering() {
        let roles = builtin_roles();
        assert_eq!(roles[0].id, ROLE_ADMIN);
        assert!(roles.windows(2).all(|w| w[0].rank > w[1].rank));
        assert!(roles[0].has(Permission::AccessTokenManagement));
        assert!(!roles.iter().any(|r| r.id == ROLE_NONE && r.has(Permission::Read)));
    }

    #[test]
    fn test_token_hash_is_stable() {
        let token = ApiKey::new_token();
        assert_eq!(token.len(), 64);
        assert_eq!(ApiKey::hash_token(&token), ApiKey::hash_token(&token));
        assert!(ApiKey::new_id().starts_with(API_KEY_PREFIX));
    }
}
