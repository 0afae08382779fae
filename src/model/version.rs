use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{codes, CatalogError, CatalogResult};
use crate::model::{Id, NewOperation, Paging};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Draft,
    Release,
    Archived,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Draft => "draft",
            VersionStatus::Release => "release",
            VersionStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for VersionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(VersionStatus::Draft),
            "release" => Ok(VersionStatus::Release),
            "archived" => Ok(VersionStatus::Archived),
            _ => Err(format!("Unknown version status: {}", s)),
        }
    }
}

/// `name` or `name@N` with N >= 1; a missing revision means latest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRef {
    pub name: String,
    pub revision: Option<i32>,
}

impl VersionRef {
    pub fn parse(raw: &str) -> CatalogResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CatalogError::empty_param("version"));
        }
        match raw.split_once('@') {
            None => Ok(Self {
                name: raw.to_string(),
                revision: None,
            }),
            Some((name, rev)) => {
                let revision: i32 = rev.parse().map_err(|_| invalid_ref(raw))?;
                if name.is_empty() || revision < 1 {
                    return Err(invalid_ref(raw));
                }
                Ok(Self {
                    name: name.to_string(),
                    revision: Some(revision),
                })
            }
        }
    }

    pub fn exact(name: &str, revision: i32) -> Self {
        Self {
            name: name.to_string(),
            revision: Some(revision),
        }
    }
}

impl std::fmt::Display for VersionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.revision {
            Some(rev) => write!(f, "{}@{}", self.name, rev),
            None => write!(f, "{}", self.name),
        }
    }
}

fn invalid_ref(raw: &str) -> CatalogError {
    CatalogError::validation(
        codes::INVALID_PARAMETER,
        format!("Version reference '{}' must be 'name' or 'name@N' with N >= 1", raw),
    )
    .with_param("version", raw)
}

pub fn format_version_key(name: &str, revision: i32) -> String {
    format!("{}@{}", name, revision)
}

/// One immutable snapshot of a version. Only `status` and `labels` are
/// metadata that may be patched after publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub package_id: Id,
    pub version: String,
    pub revision: i32,
    pub status: VersionStatus,
    pub previous_version: Option<String>,
    pub previous_version_package_id: Option<Id>,
    pub labels: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub created_by: String,
    pub publish_id: Option<Id>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

impl Revision {
    pub fn key(&self) -> String {
        format_version_key(&self.version, self.revision)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A document (specification file) inside a revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedDocument {
    pub package_id: Id,
    pub version: String,
    pub revision: i32,
    pub file_id: String,
    pub slug: String,
    pub title: String,
    pub api_type: String,
    pub format: String,
    pub checksum: String,
    pub operation_ids: Vec<String>,
    pub data: Vec<u8>,
}

/// Cross-package reference from a (dashboard) revision to another version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionReference {
    pub package_id: Id,
    pub version: String,
    pub revision: i32,
    pub ref_package_id: Id,
    pub ref_version: String,
    pub ref_revision: i32,
    pub excluded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishFile {
    pub file_id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_api_type")]
    pub api_type: String,
    #[serde(default = "default_format")]
    pub format: String,
    pub content: String,
}

fn default_api_type() -> String {
    "rest".to_string()
}

fn default_format() -> String {
    "json".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRef {
    pub package_id: Id,
    pub version: String,
    #[serde(default)]
    pub excluded: bool,
}

/// Everything needed to publish one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub package_id: Id,
    pub version: String,
    pub status: VersionStatus,
    pub previous_version: Option<String>,
    pub previous_version_package_id: Option<Id>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub files: Vec<PublishFile>,
    #[serde(default)]
    pub operations: Vec<NewOperation>,
    #[serde(default)]
    pub refs: Vec<PublishRef>,
    /// Precomputed operation changes keyed by api type; computed when absent.
    pub changes: Option<Vec<crate::model::OperationChange>>,
    pub publish_id: Option<Id>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VersionPatch {
    pub status: Option<VersionStatus>,
    pub labels: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionListFilter {
    pub status: Option<VersionStatus>,
    pub text_filter: Option<String>,
    pub label: Option<String>,
    #[serde(default)]
    pub paging: Paging,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub file_id: String,
    pub slug: String,
    pub title: String,
    pub api_type: String,
    pub format: String,
    pub operation_count: usize,
}

/// Rich read model of a version at a concrete revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionView {
    pub package_id: Id,
    pub version: String,
    pub revision: i32,
    pub status: VersionStatus,
    pub latest_revision: i32,
    pub not_latest_revision: bool,
    pub previous_version: Option<String>,
    pub previous_version_package_id: Option<Id>,
    pub labels: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub created_by: String,
    pub documents: Vec<DocumentSummary>,
    pub operation_types: BTreeMap<String, usize>,
}

impl VersionView {
    pub fn key(&self) -> String {
        format_version_key(&self.version, self.revision)
    }
}

/// Shape kept for the older endpoint revision: the version is a flat string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionViewLegacy {
    pub version: String,
    pub status: VersionStatus,
    pub previous_version: Option<String>,
    pub version_labels: Vec<String>,
    pub published_at: DateTime<Utc>,
}

impl From<&VersionView> for VersionViewLegacy {
    fn from(view: &VersionView) -> Self {
        Self {
            version: view.key(),
            status: view.status,
            previous_version: view.previous_version.clone(),
            version_labels: view.labels.clone(),
            published_at: view.published_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ref_parse() {
        assert_eq!(
            VersionRef::parse("2025.1").unwrap(),
            VersionRef {
                name: "2025.1".to_string(),
                revision: None
            }
        );
        assert_eq!(VersionRef::parse("2025.1@3").unwrap().revision, Some(3));
        assert_eq!(VersionRef::parse("2025.1@3").unwrap().to_string(), "2025.1@3");
        assert!(VersionRef::parse("2025.1@0").is_err());
        assert!(VersionRef::parse("2025.1@x").is_err());
        assert!(VersionRef::parse("@2").is_err());
        assert_eq!(
            VersionRef::parse("").unwrap_err().code(),
            codes::EMPTY_PARAMETER
        );
    }
}
