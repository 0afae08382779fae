use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::{codes, CatalogError, CatalogResult};
use crate::model::{Id, Paging};

pub const GROUP_WILDCARD: &str = "{group}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Workspace,
    Group,
    Package,
    Dashboard,
}

impl PackageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Workspace => "workspace",
            PackageKind::Group => "group",
            PackageKind::Package => "package",
            PackageKind::Dashboard => "dashboard",
        }
    }

    /// Only leaves of the tree hold versions.
    pub fn holds_versions(&self) -> bool {
        matches!(self, PackageKind::Package | PackageKind::Dashboard)
    }

    /// Workspaces and groups may have children.
    pub fn is_container(&self) -> bool {
        matches!(self, PackageKind::Workspace | PackageKind::Group)
    }
}

impl std::fmt::Display for PackageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PackageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "workspace" => Ok(PackageKind::Workspace),
            "group" => Ok(PackageKind::Group),
            "package" => Ok(PackageKind::Package),
            "dashboard" => Ok(PackageKind::Dashboard),
            _ => Err(format!("Unknown package kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: Id,
    pub kind: PackageKind,
    /// Empty for workspaces.
    pub parent_id: Id,
    pub alias: String,
    pub name: String,
    pub description: String,
    pub default_role: String,
    pub default_release_version: String,
    pub release_version_pattern: String,
    pub service_name: String,
    pub rest_grouping_prefix: String,
    pub exclude_from_search: bool,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

impl Package {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn workspace_id(&self) -> &str {
        workspace_of(&self.id)
    }

    /// A workspace hidden from everyone without an explicit role.
    pub fn is_private_workspace(&self) -> bool {
        self.kind == PackageKind::Workspace && self.default_role == super::ROLE_NONE
    }
}

/// Build `parent.alias`, or `alias` for roots.
pub fn make_package_id(parent_id: &str, alias: &str) -> Id {
    if parent_id.is_empty() {
        alias.to_string()
    } else {
        format!("{}.{}", parent_id, alias)
    }
}

pub fn parent_of(id: &str) -> &str {
    match id.rfind('.') {
        Some(idx) => &id[..idx],
        None => "",
    }
}

pub fn alias_of(id: &str) -> &str {
    match id.rfind('.') {
        Some(idx) => &id[idx + 1..],
        None => id,
    }
}

pub fn workspace_of(id: &str) -> &str {
    match id.find('.') {
        Some(idx) => &id[..idx],
        None => id,
    }
}

/// Ancestors ordered from the root down to the direct parent.
pub fn ancestor_ids(id: &str) -> Vec<Id> {
    let segments: Vec<&str> = id.split('.').collect();
    (1..segments.len())
        .map(|n| segments[..n].join("."))
        .collect()
}

/// Root-to-leaf chain including the id itself.
pub fn lineage_ids(id: &str) -> Vec<Id> {
    let mut ids = ancestor_ids(id);
    ids.push(id.to_string());
    ids
}

pub fn is_descendant_of(id: &str, ancestor: &str) -> bool {
    id.len() > ancestor.len() && id.starts_with(ancestor) && id[ancestor.len()..].starts_with('.')
}

fn alias_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_-]+$").expect("alias regex"))
}

pub fn validate_alias(alias: &str) -> CatalogResult<()> {
    if alias.is_empty() {
        return Err(CatalogError::empty_param("alias"));
    }
    if !alias_regex().is_match(alias) {
        return Err(CatalogError::validation(
            codes::INVALID_PACKAGE_ALIAS,
            format!(
                "Alias '{}' must contain only lowercase letters, digits, '_' and '-'",
                alias
            ),
        )
        .with_param("alias", alias));
    }
    Ok(())
}

pub fn validate_package_id(id: &str) -> CatalogResult<()> {
    if id.is_empty() {
        return Err(CatalogError::empty_param("packageId"));
    }
    for segment in id.split('.') {
        validate_alias(segment)?;
    }
    Ok(())
}

/// The prefix must end with `/` and contain exactly one `{group}` token.
pub fn validate_rest_grouping_prefix(prefix: &str) -> CatalogResult<()> {
    if prefix.is_empty() {
        return Ok(());
    }
    let wildcards = prefix.matches(GROUP_WILDCARD).count();
    if wildcards != 1 || !prefix.ends_with('/') {
        return Err(CatalogError::validation(
            codes::INVALID_REST_GROUPING_PREFIX,
            format!(
                "Rest grouping prefix '{}' must end with '/' and contain exactly one '{}'",
                prefix, GROUP_WILDCARD
            ),
        )
        .with_param("restGroupingPrefix", prefix));
    }
    Ok(())
}

/// Compile the grouping prefix into a matcher capturing the group name.
pub fn grouping_prefix_regex(prefix: &str) -> CatalogResult<Regex> {
    validate_rest_grouping_prefix(prefix)?;
    let (before, after) = prefix
        .split_once(GROUP_WILDCARD)
        .unwrap_or((prefix, ""));
    let pattern = format!("^{}(.+?){}", regex::escape(before), regex::escape(after));
    Regex::new(&pattern).map_err(|e| {
        CatalogError::validation(codes::INVALID_REST_GROUPING_PREFIX, e.to_string())
            .with_param("restGroupingPrefix", prefix)
    })
}

pub fn validate_release_pattern(pattern: &str) -> CatalogResult<()> {
    if pattern.is_empty() {
        return Ok(());
    }
    Regex::new(pattern).map(|_| ()).map_err(|e| {
        CatalogError::validation(
            codes::INVALID_RELEASE_VERSION_PATTERN,
            format!("Release version pattern is not a valid regexp: {}", e),
        )
        .with_param("pattern", pattern)
    })
}

/// Input for package creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPackage {
    pub kind: Option<PackageKind>,
    #[serde(default)]
    pub parent_id: String,
    pub alias: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub default_role: Option<String>,
    #[serde(default)]
    pub release_version_pattern: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub rest_grouping_prefix: String,
    #[serde(default)]
    pub exclude_from_search: bool,
    #[serde(default)]
    pub image_url: String,
}

/// Partial update, only listed fields may change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PackagePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub service_name: Option<String>,
    pub image_url: Option<String>,
    pub default_role: Option<String>,
    pub default_release_version: Option<String>,
    pub release_version_pattern: Option<String>,
    pub exclude_from_search: Option<bool>,
    pub rest_grouping_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionStatus {
    Running,
    Complete,
    Error,
}

impl TransitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionStatus::Running => "running",
            TransitionStatus::Complete => "complete",
            TransitionStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for TransitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TransitionStatus::Running),
            "complete" => Ok(TransitionStatus::Complete),
            "error" => Ok(TransitionStatus::Error),
            _ => Err(format!("Unknown transition status: {}", s)),
        }
    }
}

/// A historical rename/move edge. One record per moved id; the record for the
/// moved root also carries the move id used for status lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageTransition {
    pub move_id: Id,
    pub from_id: Id,
    pub to_id: Id,
    pub status: TransitionStatus,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub completed_at: Option<DateTime<Utc>>,
    /// Serial order of insertion, used to find the latest edge.
    pub seq: i64,
}

/// Outcome of an id lookup: either the live package or the id it moved to.
#[derive(Debug, Clone, PartialEq)]
pub enum PackageLookup<T> {
    Found(T),
    Moved { from_id: Id, to_id: Id },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageListFilter {
    pub parent_id: Option<String>,
    #[serde(default)]
    pub kinds: Vec<PackageKind>,
    pub text_filter: Option<String>,
    #[serde(default)]
    pub show_all_descendants: bool,
    #[serde(default)]
    pub only_favorite: bool,
    #[serde(default)]
    pub only_shared: bool,
    pub service_name: Option<String>,
    #[serde(default)]
    pub paging: Paging,
}

/// Rich read model returned by the package graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageView {
    #[serde(flatten)]
    pub package: Package,
    pub parents: Vec<Package>,
    pub is_favorite: bool,
    pub user_permissions: Vec<String>,
    pub default_version: Option<String>,
}

/// Shape kept for the older endpoint revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageViewLegacy {
    pub package_id: Id,
    pub alias: String,
    pub parent_id: Id,
    pub kind: PackageKind,
    pub name: String,
    pub description: String,
    pub is_favorite: bool,
    pub service_name: String,
    pub parents: Vec<Id>,
}

impl From<&PackageView> for PackageViewLegacy {
    fn from(view: &PackageView) -> Self {
        Self {
            package_id: view.package.id.clone(),
            alias: view.package.alias.clone(),
            parent_id: view.package.parent_id.clone(),
            kind: view.package.kind,
            name: view.package.name.clone(),
            description: view.package.description.clone(),
            is_favorite: view.is_favorite,
            service_name: view.package.service_name.clone(),
            parents: view.parents.iter().map(|p| p.id.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_helpers() {
        assert_eq!(make_package_id("", "acme"), "acme");
        assert_eq!(make_package_id("acme.pay", "gw"), "acme.pay.gw");
        assert_eq!(parent_of("acme.pay.gw"), "acme.pay");
        assert_eq!(parent_of("acme"), "");
        assert_eq!(alias_of("acme.pay.gw"), "gw");
        assert_eq!(workspace_of("acme.pay.gw"), "acme");
        assert_eq!(ancestor_ids("acme.pay.gw"), vec!["acme", "acme.pay"]);
        assert_eq!(lineage_ids("acme"), vec!["acme"]);
        assert!(is_descendant_of("acme.pay.gw", "acme.pay"));
        assert!(!is_descendant_of("acme.payments", "acme.pay"));
        assert!(!is_descendant_of("acme.pay", "acme.pay"));
    }

    #[test]
    fn test_alias_validation() {
        assert!(validate_alias("pay-gw_2").is_ok());
        assert!(validate_alias("").is_err());
        assert!(validate_alias("Pay").is_err());
        assert!(validate_alias("a.b").is_err());
        assert!(validate_package_id("acme.pay.gw").is_ok());
        assert!(validate_package_id("acme..gw").is_err());
    }

    #[test]
    fn test_rest_grouping_prefix_validation() {
        assert!(validate_rest_grouping_prefix("/api/{group}/").is_ok());
        assert!(validate_rest_grouping_prefix("").is_ok());
        let missing_slash = validate_rest_grouping_prefix("/api/{group}").unwrap_err();
        assert_eq!(missing_slash.code(), codes::INVALID_REST_GROUPING_PREFIX);
        assert!(validate_rest_grouping_prefix("/api/v1/").is_err());
        assert!(validate_rest_grouping_prefix("/{group}/{group}/").is_err());
    }

    #[test]
    fn test_grouping_prefix_regex_captures_group() {
        let re = grouping_prefix_regex("/api/{group}/").unwrap();
        let caps = re.captures("/api/v2/users/{id}").unwrap();
        assert_eq!(&caps[1], "v2");
        assert!(re.captures("/other/v2/users").is_none());
    }
}
