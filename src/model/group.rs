use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{format_version_key, hash_parts_hex, sha256_hex, BuildFormat, BuildType, Id, VersionStatus};

/// `H(packageId, version, revision, apiType, groupName)`.
pub fn make_group_id(
    package_id: &str,
    version: &str,
    revision: i32,
    api_type: &str,
    group_name: &str,
) -> String {
    hash_parts_hex(&[package_id, version, &revision.to_string(), api_type, group_name])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationGroup {
    pub group_id: String,
    pub package_id: Id,
    pub version: String,
    pub revision: i32,
    pub api_type: String,
    pub group_name: String,
    pub description: String,
    pub autogenerated: bool,
    pub template_checksum: Option<String>,
    pub template_filename: Option<String>,
    pub operations_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OperationGroup {
    pub fn new(
        package_id: &str,
        version: &str,
        revision: i32,
        api_type: &str,
        group_name: &str,
        autogenerated: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            group_id: make_group_id(package_id, version, revision, api_type, group_name),
            package_id: package_id.to_string(),
            version: version.to_string(),
            revision,
            api_type: api_type.to_string(),
            group_name: group_name.to_string(),
            description: String::new(),
            autogenerated,
            template_checksum: None,
            template_filename: None,
            operations_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn version_key(&self) -> String {
        format_version_key(&self.version, self.revision)
    }
}

/// Membership row: the operation may live in a referenced version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedOperation {
    pub group_id: String,
    pub package_id: Id,
    pub version: String,
    pub revision: i32,
    pub operation_id: String,
}

/// Operation reference as given by the caller; package and version default
/// to the group's own revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupOperationRef {
    pub operation_id: String,
    pub package_id: Option<Id>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupTemplate {
    pub filename: String,
    pub data: Vec<u8>,
}

impl GroupTemplate {
    pub fn checksum(&self) -> String {
        sha256_hex(&self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperationGroup {
    pub group_name: String,
    #[serde(default)]
    pub description: String,
    pub template: Option<GroupTemplate>,
    pub operations: Option<Vec<GroupOperationRef>>,
}

/// Partial update. `template: Some(None)` removes the template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OperationGroupPatch {
    pub group_name: Option<String>,
    pub description: Option<String>,
    #[serde(default, with = "serde_with_option")]
    pub template: Option<Option<GroupTemplate>>,
    pub operations: Option<Vec<GroupOperationRef>>,
}

/// Helper so `"template": null` deserializes to `Some(None)`.
mod serde_with_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T: Serialize, S: Serializer>(
        value: &Option<Option<T>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<T>>, D::Error> {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupHistoryAction {
    Create,
    Update,
    Delete,
}

impl GroupHistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupHistoryAction::Create => "create",
            GroupHistoryAction::Update => "update",
            GroupHistoryAction::Delete => "delete",
        }
    }
}

impl std::str::FromStr for GroupHistoryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(GroupHistoryAction::Create),
            "update" => Ok(GroupHistoryAction::Update),
            "delete" => Ok(GroupHistoryAction::Delete),
            _ => Err(format!("Unknown group history action: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationGroupHistory {
    pub group_id: String,
    pub action: GroupHistoryAction,
    pub data: serde_json::Value,
    pub user_id: String,
    pub date: DateTime<Utc>,
    pub automatic: bool,
}

/// Atomic change applied to a group by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupWrite {
    pub group: OperationGroup,
    pub template: Option<GroupTemplate>,
    /// `None` keeps the current membership.
    pub operations: Option<Vec<GroupedOperation>>,
    pub history: Vec<OperationGroupHistory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformedDocumentKey {
    pub package_id: Id,
    /// `name@revision`
    pub version: String,
    pub api_type: String,
    pub group_id: String,
    pub build_type: BuildType,
    pub format: BuildFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformedDocument {
    #[serde(flatten)]
    pub key: TransformedDocumentKey,
    pub build_id: Id,
    pub documents: Vec<TransformedFile>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformedFile {
    pub file_id: String,
    pub slug: String,
    pub title: String,
    pub format: String,
    pub operation_ids: Vec<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPublishStatus {
    Running,
    Complete,
    Error,
}

impl GroupPublishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupPublishStatus::Running => "running",
            GroupPublishStatus::Complete => "complete",
            GroupPublishStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for GroupPublishStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(GroupPublishStatus::Running),
            "complete" => Ok(GroupPublishStatus::Complete),
            "error" => Ok(GroupPublishStatus::Error),
            _ => Err(format!("Unknown publish status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPublishRequest {
    pub package_id: Id,
    pub version: String,
    pub status: VersionStatus,
    pub previous_version: Option<String>,
    pub previous_version_package_id: Option<Id>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPublish {
    pub publish_id: Id,
    pub group_id: String,
    pub package_id: Id,
    pub version: String,
    pub status: GroupPublishStatus,
    pub details: String,
    pub build_id: Option<Id>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_is_scoped_to_revision() {
        let a = make_group_id("acme.pay.gw", "2025.1", 1, "rest", "users");
        assert_eq!(a, make_group_id("acme.pay.gw", "2025.1", 1, "rest", "users"));
        assert_ne!(a, make_group_id("acme.pay.gw", "2025.1", 2, "rest", "users"));
        assert_ne!(a, make_group_id("acme.pay.gw", "2025.1", 1, "rest", "orders"));
    }

    #[test]
    fn test_patch_template_null_removes() {
        let patch: OperationGroupPatch = serde_json::from_str(r#"{"template": null}"#).unwrap();
        assert_eq!(patch.template, Some(None));
        let patch: OperationGroupPatch = serde_json::from_str(r#"{"description": "x"}"#).unwrap();
        assert_eq!(patch.template, None);
        assert!(serde_json::from_str::<OperationGroupPatch>(r#"{"unknown": 1}"#).is_err());
    }
}
