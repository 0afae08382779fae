use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{codes, CatalogError, CatalogResult};
use crate::model::{sha256_hex, Id, VersionStatus};

/// Author recorded on builds started by version migrations.
pub const MIGRATION_BUILD_AUTHOR: &str = "migration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BuildType {
    #[serde(rename = "build")]
    Build,
    #[serde(rename = "exportVersion")]
    ExportVersion,
    #[serde(rename = "exportRestDocument")]
    ExportRestDocument,
    #[serde(rename = "exportRestOperationsGroup")]
    ExportRestOperationsGroup,
    #[serde(rename = "reducedSourceSpecifications")]
    ReducedSourceSpecifications,
    #[serde(rename = "mergedSpecification")]
    MergedSpecification,
}

impl BuildType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildType::Build => "build",
            BuildType::ExportVersion => "exportVersion",
            BuildType::ExportRestDocument => "exportRestDocument",
            BuildType::ExportRestOperationsGroup => "exportRestOperationsGroup",
            BuildType::ReducedSourceSpecifications => "reducedSourceSpecifications",
            BuildType::MergedSpecification => "mergedSpecification",
        }
    }

    pub fn is_export(&self) -> bool {
        matches!(
            self,
            BuildType::ExportVersion
                | BuildType::ExportRestDocument
                | BuildType::ExportRestOperationsGroup
        )
    }
}

impl std::str::FromStr for BuildType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(BuildType::Build),
            "exportVersion" => Ok(BuildType::ExportVersion),
            "exportRestDocument" => Ok(BuildType::ExportRestDocument),
            "exportRestOperationsGroup" => Ok(BuildType::ExportRestOperationsGroup),
            "reducedSourceSpecifications" => Ok(BuildType::ReducedSourceSpecifications),
            "mergedSpecification" => Ok(BuildType::MergedSpecification),
            _ => Err(format!("Unknown build type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildFormat {
    Yaml,
    Json,
    Html,
}

impl BuildFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildFormat::Yaml => "yaml",
            BuildFormat::Json => "json",
            BuildFormat::Html => "html",
        }
    }

    pub fn parse(raw: &str) -> CatalogResult<Self> {
        match raw.to_lowercase().as_str() {
            "yaml" => Ok(BuildFormat::Yaml),
            "json" => Ok(BuildFormat::Json),
            "html" => Ok(BuildFormat::Html),
            _ => Err(CatalogError::validation(
                codes::UNKNOWN_BUILD_FORMAT,
                format!("Format '{}' is not supported, expected yaml, json or html", raw),
            )
            .with_param("format", raw)),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            BuildFormat::Yaml => "application/yaml",
            BuildFormat::Json => "application/json",
            BuildFormat::Html => "text/html",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transformation {
    ReducedSource,
    Merged,
}

impl Transformation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transformation::ReducedSource => "reduced-source",
            Transformation::Merged => "merged",
        }
    }

    pub fn parse(raw: &str) -> CatalogResult<Self> {
        match raw {
            "reduced-source" => Ok(Transformation::ReducedSource),
            "merged" => Ok(Transformation::Merged),
            _ => Err(CatalogError::validation(
                codes::UNKNOWN_TRANSFORMATION,
                format!(
                    "Transformation '{}' is not supported, expected reduced-source or merged",
                    raw
                ),
            )
            .with_param("transformation", raw)),
        }
    }
}

/// Forward-only build state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuildStatus {
    NotStarted,
    Running,
    Complete,
    Error,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::NotStarted => "notStarted",
            BuildStatus::Running => "running",
            BuildStatus::Complete => "complete",
            BuildStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Complete | BuildStatus::Error)
    }

    fn order(&self) -> u8 {
        match self {
            BuildStatus::NotStarted => 0,
            BuildStatus::Running => 1,
            BuildStatus::Complete | BuildStatus::Error => 2,
        }
    }

    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        next.order() > self.order()
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notStarted" => Ok(BuildStatus::NotStarted),
            "running" => Ok(BuildStatus::Running),
            "complete" => Ok(BuildStatus::Complete),
            "error" => Ok(BuildStatus::Error),
            _ => Err(format!("Unknown build status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BuildFile {
    pub file_id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub publish: bool,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Where a `Build` publishes its files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PublishTarget {
    pub package_id: Id,
    pub version: String,
    pub status: VersionStatus,
    pub previous_version: Option<String>,
    pub previous_version_package_id: Option<Id>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BuildConfig {
    pub package_id: Id,
    pub version: String,
    pub build_type: BuildType,
    pub format: BuildFormat,
    #[serde(default)]
    pub api_type: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub transformation: Option<Transformation>,
    #[serde(default)]
    pub files: Vec<BuildFile>,
    #[serde(default)]
    pub publish_target: Option<PublishTarget>,
    #[serde(default)]
    pub publish_id: Option<Id>,
    #[serde(default)]
    pub created_by: String,
}

impl BuildConfig {
    pub fn new(package_id: &str, version: &str, build_type: BuildType, format: BuildFormat) -> Self {
        Self {
            package_id: package_id.to_string(),
            version: version.to_string(),
            build_type,
            format,
            api_type: None,
            group_name: None,
            document_id: None,
            transformation: None,
            files: Vec::new(),
            publish_target: None,
            publish_id: None,
            created_by: String::new(),
        }
    }

    /// Content identity used for de-duplication; the author and the publish
    /// correlation id do not take part.
    pub fn checksum(&self) -> String {
        let mut canonical = self.clone();
        canonical.created_by = String::new();
        canonical.publish_id = None;
        let json = serde_json::to_vec(&canonical).unwrap_or_default();
        sha256_hex(&json)
    }

    pub fn export_filename(&self) -> String {
        let base = self.package_id.replace('.', "_");
        match self.build_type {
            BuildType::ExportRestDocument => format!(
                "{}_{}_{}.{}",
                base,
                self.version,
                self.document_id.as_deref().unwrap_or("document"),
                self.format.as_str()
            ),
            BuildType::ExportRestOperationsGroup => format!(
                "{}_{}_{}.tar.gz",
                base,
                self.version,
                self.group_name.as_deref().unwrap_or("group")
            ),
            _ => format!("{}_{}.tar.gz", base, self.version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub build_id: Id,
    pub config: BuildConfig,
    pub checksum: String,
    pub status: BuildStatus,
    pub details: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    /// Last sign of life from the worker holding a running build.
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Set when cleanup dropped the stored result.
    pub result_deleted: bool,
}

impl Build {
    pub fn new(build_id: Id, config: BuildConfig) -> Self {
        Self {
            checksum: config.checksum(),
            created_by: config.created_by.clone(),
            build_id,
            config,
            status: BuildStatus::NotStarted,
            details: String::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            worker_id: None,
            heartbeat_at: None,
            result_deleted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub build_id: Id,
    pub data: Vec<u8>,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub config: BuildConfig,
}

/// Export result metadata row; the bytes live in object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResultRecord {
    pub build_id: Id,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub config: BuildConfig,
}

impl ExportResult {
    pub fn from_record(record: ExportResultRecord, data: Vec<u8>) -> Self {
        Self {
            build_id: record.build_id,
            data,
            filename: record.filename,
            created_at: record.created_at,
            created_by: record.created_by,
            config: record.config,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        if self.filename.ends_with(".tar.gz") {
            "application/gzip"
        } else {
            self.config.format.mime_type()
        }
    }
}

/// Export of a whole version, one document, or one REST operation group.
/// The kind is picked from which of `documentId` and `groupName` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub package_id: Id,
    pub version: String,
    pub format: String,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub api_type: Option<String>,
    #[serde(default)]
    pub transformation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStarted {
    pub export_id: Id,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStatusView {
    pub export_id: Id,
    pub status: BuildStatus,
    pub message: String,
    pub package_id: Id,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_forward_only() {
        assert!(BuildStatus::NotStarted.can_transition_to(BuildStatus::Running));
        assert!(BuildStatus::NotStarted.can_transition_to(BuildStatus::Error));
        assert!(BuildStatus::Running.can_transition_to(BuildStatus::Complete));
        assert!(!BuildStatus::Running.can_transition_to(BuildStatus::NotStarted));
        assert!(!BuildStatus::Complete.can_transition_to(BuildStatus::Error));
        assert!(!BuildStatus::Error.can_transition_to(BuildStatus::Running));
    }

    #[test]
    fn test_config_wire_format() {
        let mut config = BuildConfig::new(
            "acme.pay.gw",
            "2025.1@1",
            BuildType::ExportRestOperationsGroup,
            BuildFormat::Yaml,
        );
        config.group_name = Some("users".to_string());
        config.transformation = Some(Transformation::Merged);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["buildType"], "exportRestOperationsGroup");
        assert_eq!(json["transformation"], "merged");
        let back: BuildConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);

        let unknown = r#"{"packageId":"a","version":"1","buildType":"build","format":"json","extra":1}"#;
        assert!(serde_json::from_str::<BuildConfig>(unknown).is_err());
    }

    #[test]
    fn test_checksum_ignores_author() {
        let mut a = BuildConfig::new("acme.pay.gw", "2025.1@1", BuildType::ExportVersion, BuildFormat::Json);
        let mut b = a.clone();
        a.created_by = "alice".to_string();
        b.created_by = "bob".to_string();
        assert_eq!(a.checksum(), b.checksum());
        b.format = BuildFormat::Yaml;
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_format_and_transformation_validation() {
        assert_eq!(BuildFormat::parse("YAML").unwrap(), BuildFormat::Yaml);
        assert_eq!(
            BuildFormat::parse("xml").unwrap_err().code(),
            codes::UNKNOWN_BUILD_FORMAT
        );
        assert_eq!(
            Transformation::parse("flat").unwrap_err().code(),
            codes::UNKNOWN_TRANSFORMATION
        );
    }
}
