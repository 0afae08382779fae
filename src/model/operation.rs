use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{hash_parts, sha256_hex, Id, Paging};

pub const API_TYPE_REST: &str = "rest";
pub const API_TYPE_GRAPHQL: &str = "graphql";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiKind {
    Bwc,
    NoBwc,
    Experimental,
    Internal,
    #[serde(untagged)]
    Other(String),
}

impl ApiKind {
    pub fn as_str(&self) -> &str {
        match self {
            ApiKind::Bwc => "bwc",
            ApiKind::NoBwc => "no-bwc",
            ApiKind::Experimental => "experimental",
            ApiKind::Internal => "internal",
            ApiKind::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "bwc" => ApiKind::Bwc,
            "no-bwc" => ApiKind::NoBwc,
            "experimental" => ApiKind::Experimental,
            "internal" => ApiKind::Internal,
            other => ApiKind::Other(other.to_string()),
        }
    }
}

impl Default for ApiKind {
    fn default() -> Self {
        ApiKind::Bwc
    }
}

/// Schema reference held by an operation: model name -> content hash.
pub type ModelHashes = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub package_id: Id,
    pub version: String,
    pub revision: i32,
    pub api_type: String,
    pub operation_id: String,
    pub document_slug: String,
    pub title: String,
    pub method: Option<String>,
    pub path: Option<String>,
    /// GraphQL operation type (query, mutation, subscription).
    pub op_type: Option<String>,
    pub api_kind: ApiKind,
    pub api_audience: String,
    pub tags: Vec<String>,
    pub custom_tags: BTreeMap<String, serde_json::Value>,
    pub deprecated: bool,
    pub models: ModelHashes,
    /// Content fingerprint, used to detect changes between revisions.
    pub data_hash: String,
    pub data: serde_json::Value,
}

impl Operation {
    pub fn key(&self) -> OperationKey {
        OperationKey {
            package_id: self.package_id.clone(),
            version: self.version.clone(),
            revision: self.revision,
            api_type: self.api_type.clone(),
            operation_id: self.operation_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationKey {
    pub package_id: Id,
    pub version: String,
    pub revision: i32,
    pub api_type: String,
    pub operation_id: String,
}

/// Operation as supplied by a publish request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    pub operation_id: String,
    #[serde(default = "default_api_type")]
    pub api_type: String,
    #[serde(default)]
    pub document_slug: String,
    #[serde(default)]
    pub title: String,
    pub method: Option<String>,
    pub path: Option<String>,
    pub op_type: Option<String>,
    #[serde(default)]
    pub api_kind: ApiKind,
    #[serde(default = "default_audience")]
    pub api_audience: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_tags: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub models: ModelHashes,
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_api_type() -> String {
    API_TYPE_REST.to_string()
}

fn default_audience() -> String {
    "external".to_string()
}

impl NewOperation {
    pub fn into_operation(self, package_id: &str, version: &str, revision: i32) -> Operation {
        let fingerprint_source = serde_json::json!({
            "method": self.method,
            "path": self.path,
            "type": self.op_type,
            "kind": self.api_kind.as_str(),
            "deprecated": self.deprecated,
            "data": self.data,
        });
        let data_hash = sha256_hex(fingerprint_source.to_string().as_bytes());
        Operation {
            package_id: package_id.to_string(),
            version: version.to_string(),
            revision,
            api_type: self.api_type,
            operation_id: self.operation_id,
            document_slug: self.document_slug,
            title: self.title,
            method: self.method,
            path: self.path,
            op_type: self.op_type,
            api_kind: self.api_kind,
            api_audience: self.api_audience,
            tags: self.tags,
            custom_tags: self.custom_tags,
            deprecated: self.deprecated,
            models: self.models,
            data_hash,
            data: self.data,
        }
    }
}

impl From<&Operation> for NewOperation {
    fn from(op: &Operation) -> Self {
        Self {
            operation_id: op.operation_id.clone(),
            api_type: op.api_type.clone(),
            document_slug: op.document_slug.clone(),
            title: op.title.clone(),
            method: op.method.clone(),
            path: op.path.clone(),
            op_type: op.op_type.clone(),
            api_kind: op.api_kind.clone(),
            api_audience: op.api_audience.clone(),
            tags: op.tags.clone(),
            custom_tags: op.custom_tags.clone(),
            deprecated: op.deprecated,
            models: op.models.clone(),
            data: op.data.clone(),
        }
    }
}

/// `"KEY: VALUE"` is a custom-tag filter, anything else is free text.
#[derive(Debug, Clone, PartialEq)]
pub enum TextFilter {
    CustomTag { key: String, value: String },
    Text(String),
}

impl TextFilter {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some((key, value)) = raw.split_once(": ") {
            let key = key.trim();
            if !key.is_empty() && !key.contains(' ') {
                return Some(TextFilter::CustomTag {
                    key: key.to_string(),
                    value: value.trim().to_string(),
                });
            }
        }
        Some(TextFilter::Text(raw.to_lowercase()))
    }

    pub fn matches(&self, op: &Operation) -> bool {
        match self {
            TextFilter::CustomTag { key, value } => op
                .custom_tags
                .get(key)
                .map(|v| match v {
                    serde_json::Value::String(s) => s == value,
                    other => other.to_string() == *value,
                })
                .unwrap_or(false),
            TextFilter::Text(text) => {
                op.title.to_lowercase().contains(text)
                    || op.operation_id.to_lowercase().contains(text)
                    || op
                        .path
                        .as_deref()
                        .map(|p| p.to_lowercase().contains(text))
                        .unwrap_or(false)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationListFilter {
    pub api_type: Option<String>,
    pub kind: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub empty_tag: bool,
    pub group: Option<String>,
    #[serde(default)]
    pub empty_group: bool,
    pub api_audience: Option<String>,
    pub text_filter: Option<String>,
    pub deprecated: Option<bool>,
    pub document_slug: Option<String>,
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub skip_refs: bool,
    #[serde(default)]
    pub paging: Paging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Breaking,
    SemiBreaking,
    Deprecated,
    NonBreaking,
    Annotation,
    Unclassified,
}

impl Severity {
    pub const ALL: [Severity; 6] = [
        Severity::Breaking,
        Severity::SemiBreaking,
        Severity::Deprecated,
        Severity::NonBreaking,
        Severity::Annotation,
        Severity::Unclassified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Breaking => "breaking",
            Severity::SemiBreaking => "semi-breaking",
            Severity::Deprecated => "deprecated",
            Severity::NonBreaking => "non-breaking",
            Severity::Annotation => "annotation",
            Severity::Unclassified => "unclassified",
        }
    }

    /// Name exposed to clients, where semi-breaking is called risky.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Severity::SemiBreaking => "risky",
            other => other.as_str(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "breaking" => Some(Severity::Breaking),
            "semi-breaking" | "risky" => Some(Severity::SemiBreaking),
            "deprecated" => Some(Severity::Deprecated),
            "non-breaking" => Some(Severity::NonBreaking),
            "annotation" => Some(Severity::Annotation),
            "unclassified" => Some(Severity::Unclassified),
            _ => None,
        }
    }
}

/// Replace "Semi-Breaking" wording in user-facing text.
pub fn riskify_text(text: &str) -> String {
    text.replace("Semi-Breaking", "Risky")
        .replace("semi-breaking", "risky")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Remove,
    Change,
}

/// One operation-level difference between two revisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationChange {
    pub api_type: String,
    pub operation_id: String,
    pub previous_operation_id: Option<String>,
    pub action: ChangeAction,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub api_kind: ApiKind,
    pub tags: Vec<String>,
}

pub type ChangeSummary = BTreeMap<Severity, usize>;

/// `H(pkg, ver, rev) XOR H(prevPkg, prevVer, prevRev)`; swapping the sides
/// yields the same id.
pub fn comparison_id(
    package_id: &str,
    version: &str,
    revision: i32,
    previous_package_id: &str,
    previous_version: &str,
    previous_revision: i32,
) -> String {
    let left = hash_parts(&[package_id, version, &revision.to_string()]);
    let right = hash_parts(&[
        previous_package_id,
        previous_version,
        &previous_revision.to_string(),
    ]);
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = left[i] ^ right[i];
    }
    hex::encode(out)
}

/// Stored result of comparing a revision against its previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionComparison {
    pub comparison_id: String,
    pub package_id: Id,
    pub version: String,
    pub revision: i32,
    pub previous_package_id: Id,
    pub previous_version: String,
    pub previous_revision: i32,
    pub no_content: bool,
    pub changes: Vec<OperationChange>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl VersionComparison {
    pub fn summary_by_api_type(&self) -> BTreeMap<String, ChangeSummary> {
        let mut out: BTreeMap<String, ChangeSummary> = BTreeMap::new();
        for change in &self.changes {
            *out.entry(change.api_type.clone())
                .or_default()
                .entry(change.severity)
                .or_insert(0) += 1;
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogFilter {
    pub api_type: Option<String>,
    #[serde(default)]
    pub severities: Vec<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub empty_tag: bool,
    pub group: Option<String>,
    #[serde(default)]
    pub empty_group: bool,
    pub api_kind: Option<String>,
    pub text_filter: Option<String>,
    #[serde(default)]
    pub paging: Paging,
}

/// Change as exposed on the wire, with `risky` projection applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationChangeView {
    pub api_type: String,
    pub operation_id: String,
    pub previous_operation_id: Option<String>,
    pub action: ChangeAction,
    pub severity: String,
    pub title: String,
    pub description: String,
    pub api_kind: String,
    pub tags: Vec<String>,
}

impl From<&OperationChange> for OperationChangeView {
    fn from(change: &OperationChange) -> Self {
        Self {
            api_type: change.api_type.clone(),
            operation_id: change.operation_id.clone(),
            previous_operation_id: change.previous_operation_id.clone(),
            action: change.action,
            severity: change.severity.wire_name().to_string(),
            title: riskify_text(&change.title),
            description: riskify_text(&change.description),
            api_kind: change.api_kind.as_str().to_string(),
            tags: change.tags.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(custom: &[(&str, &str)]) -> Operation {
        NewOperation {
            operation_id: "get-users".to_string(),
            api_type: "rest".to_string(),
            document_slug: "users".to_string(),
            title: "Get Users".to_string(),
            method: Some("get".to_string()),
            path: Some("/api/v1/users".to_string()),
            op_type: None,
            api_kind: ApiKind::Bwc,
            api_audience: "external".to_string(),
            tags: vec!["users".to_string()],
            custom_tags: custom
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
                .collect(),
            deprecated: false,
            models: ModelHashes::new(),
            data: serde_json::json!({}),
        }
        .into_operation("acme.pay.gw", "2025.1", 1)
    }

    #[test]
    fn test_text_filter_parsing() {
        assert_eq!(
            TextFilter::parse("x-team: payments"),
            Some(TextFilter::CustomTag {
                key: "x-team".to_string(),
                value: "payments".to_string()
            })
        );
        assert_eq!(
            TextFilter::parse("Get Users"),
            Some(TextFilter::Text("get users".to_string()))
        );
        assert_eq!(TextFilter::parse("   "), None);
    }

    #[test]
    fn test_text_filter_matching() {
        let operation = op(&[("x-team", "payments")]);
        assert!(TextFilter::parse("x-team: payments").unwrap().matches(&operation));
        assert!(!TextFilter::parse("x-team: billing").unwrap().matches(&operation));
        assert!(TextFilter::parse("users").unwrap().matches(&operation));
        assert!(!TextFilter::parse("orders").unwrap().matches(&operation));
    }

    #[test]
    fn test_risky_projection() {
        let change = OperationChange {
            api_type: "rest".to_string(),
            operation_id: "get-users".to_string(),
            previous_operation_id: None,
            action: ChangeAction::Change,
            severity: Severity::SemiBreaking,
            title: "Semi-Breaking change in Get Users".to_string(),
            description: String::new(),
            api_kind: ApiKind::Bwc,
            tags: vec![],
        };
        let view = OperationChangeView::from(&change);
        assert_eq!(view.severity, "risky");
        assert_eq!(view.title, "Risky change in Get Users");
        assert_eq!(Severity::parse("risky"), Some(Severity::SemiBreaking));
    }

    #[test]
    fn test_comparison_id_is_symmetric() {
        let a = comparison_id("acme.pay.gw", "2025.2", 1, "acme.pay.gw", "2025.1", 3);
        let b = comparison_id("acme.pay.gw", "2025.1", 3, "acme.pay.gw", "2025.2", 1);
        assert_eq!(a, b);
        assert_ne!(a, comparison_id("acme.pay.gw", "2025.2", 2, "acme.pay.gw", "2025.1", 3));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(op(&[]).data_hash, op(&[]).data_hash);
    }
}
