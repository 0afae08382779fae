use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{format_version_key, Id, PackageKind, Paging};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CreatePackage,
    DeletePackage,
    PatchPackageMeta,
    MovePackage,
    PublishNewVersion,
    PublishNewRevision,
    PatchVersionMeta,
    DeleteVersion,
    GrantRole,
    UpdateRole,
    DeleteRole,
    GenerateApiKey,
    RevokeApiKey,
    CreateManualGroup,
    DeleteManualGroup,
    OperationsGroupParameters,
    PublishOperationsGroup,
}

impl EventType {
    pub const ALL: [EventType; 17] = [
        EventType::CreatePackage,
        EventType::DeletePackage,
        EventType::PatchPackageMeta,
        EventType::MovePackage,
        EventType::PublishNewVersion,
        EventType::PublishNewRevision,
        EventType::PatchVersionMeta,
        EventType::DeleteVersion,
        EventType::GrantRole,
        EventType::UpdateRole,
        EventType::DeleteRole,
        EventType::GenerateApiKey,
        EventType::RevokeApiKey,
        EventType::CreateManualGroup,
        EventType::DeleteManualGroup,
        EventType::OperationsGroupParameters,
        EventType::PublishOperationsGroup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CreatePackage => "create_package",
            EventType::DeletePackage => "delete_package",
            EventType::PatchPackageMeta => "patch_package_meta",
            EventType::MovePackage => "move_package",
            EventType::PublishNewVersion => "publish_new_version",
            EventType::PublishNewRevision => "publish_new_revision",
            EventType::PatchVersionMeta => "patch_version_meta",
            EventType::DeleteVersion => "delete_version",
            EventType::GrantRole => "grant_role",
            EventType::UpdateRole => "update_role",
            EventType::DeleteRole => "delete_role",
            EventType::GenerateApiKey => "generate_api_key",
            EventType::RevokeApiKey => "revoke_api_key",
            EventType::CreateManualGroup => "create_manual_group",
            EventType::DeleteManualGroup => "delete_manual_group",
            EventType::OperationsGroupParameters => "operations_group_parameters",
            EventType::PublishOperationsGroup => "publish_operations_group",
        }
    }

    pub fn concerns_version(&self) -> bool {
        matches!(
            self,
            EventType::PublishNewVersion
                | EventType::PublishNewRevision
                | EventType::PatchVersionMeta
                | EventType::DeleteVersion
                | EventType::CreateManualGroup
                | EventType::DeleteManualGroup
                | EventType::OperationsGroupParameters
                | EventType::PublishOperationsGroup
        )
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown event type: {}", s))
    }
}

/// Persisted event; `data` stays an opaque JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub package_id: Id,
    pub date: DateTime<Utc>,
    pub user_id: String,
}

impl ActivityEvent {
    pub fn new(event_type: EventType, package_id: &str, user_id: &str, data: serde_json::Value) -> Self {
        Self {
            event_type,
            data,
            package_id: package_id.to_string(),
            date: Utc::now(),
            user_id: user_id.to_string(),
        }
    }

    pub fn for_version(
        event_type: EventType,
        package_id: &str,
        user_id: &str,
        version: &str,
        revision: i32,
        mut extra: serde_json::Value,
    ) -> Self {
        if !extra.is_object() {
            extra = serde_json::json!({});
        }
        if let Some(map) = extra.as_object_mut() {
            map.insert("version".to_string(), serde_json::json!(version));
            map.insert("revision".to_string(), serde_json::json!(revision));
        }
        Self::new(event_type, package_id, user_id, extra)
    }

    /// Version coordinates carried by version-scoped events.
    pub fn version_coordinates(&self) -> Option<(String, i32)> {
        if !self.event_type.concerns_version() {
            return None;
        }
        let version = self.data.get("version")?.as_str()?.to_string();
        let revision = self.data.get("revision")?.as_i64()? as i32;
        Some((version, revision))
    }
}

/// Enrichment view of `data` for recognized event shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventParams {
    #[serde(rename_all = "camelCase")]
    Version {
        version: String,
        not_latest_revision: bool,
        #[serde(flatten)]
        rest: serde_json::Map<String, serde_json::Value>,
    },
    Generic {
        #[serde(flatten)]
        rest: serde_json::Map<String, serde_json::Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPrincipal {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEventView {
    pub event_type: EventType,
    pub package_id: Id,
    pub package_name: String,
    pub package_kind: Option<PackageKind>,
    pub date: DateTime<Utc>,
    pub principal: EventPrincipal,
    pub params: EventParams,
}

impl ActivityEventView {
    /// Build a fresh view; the stored event is never changed.
    pub fn enrich(
        event: &ActivityEvent,
        user_name: Option<&str>,
        package_name: &str,
        package_kind: Option<PackageKind>,
        latest_revision: Option<i32>,
    ) -> Self {
        let mut rest = event.data.as_object().cloned().unwrap_or_default();
        let params = match event.version_coordinates() {
            Some((version, revision)) => {
                rest.remove("version");
                rest.remove("revision");
                EventParams::Version {
                    version: format_version_key(&version, revision),
                    not_latest_revision: latest_revision.map(|l| revision < l).unwrap_or(false),
                    rest,
                }
            }
            None => EventParams::Generic { rest },
        };
        Self {
            event_type: event.event_type,
            package_id: event.package_id.clone(),
            package_name: package_name.to_string(),
            package_kind,
            date: event.date,
            principal: EventPrincipal {
                id: event.user_id.clone(),
                name: user_name.unwrap_or(&event.user_id).to_string(),
            },
            params,
        }
    }
}

/// Older shape: params as an untyped map, user name flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEventViewLegacy {
    pub event_type: EventType,
    pub package_id: Id,
    pub package_name: String,
    pub date: DateTime<Utc>,
    pub user_id: String,
    pub user_name: String,
    pub params: serde_json::Value,
}

impl From<&ActivityEventView> for ActivityEventViewLegacy {
    fn from(view: &ActivityEventView) -> Self {
        let params = match &view.params {
            EventParams::Version {
                version,
                not_latest_revision,
                rest,
            } => {
                let mut map = rest.clone();
                map.insert("version".to_string(), serde_json::json!(version));
                map.insert(
                    "notLatestRevision".to_string(),
                    serde_json::json!(not_latest_revision),
                );
                serde_json::Value::Object(map)
            }
            EventParams::Generic { rest } => serde_json::Value::Object(rest.clone()),
        };
        Self {
            event_type: view.event_type,
            package_id: view.package_id.clone(),
            package_name: view.package_name.clone(),
            date: view.date,
            user_id: view.principal.id.clone(),
            user_name: view.principal.name.clone(),
            params,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityFilter {
    #[serde(default)]
    pub include_refs: bool,
    #[serde(default)]
    pub only_favorite: bool,
    #[serde(default)]
    pub only_shared: bool,
    #[serde(default)]
    pub kinds: Vec<PackageKind>,
    pub text_filter: Option<String>,
    #[serde(default)]
    pub types: Vec<EventType>,
    #[serde(default)]
    pub paging: Paging,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrichment_flattens_version() {
        let event = ActivityEvent::for_version(
            EventType::PublishNewRevision,
            "acme.pay.gw",
            "alice",
            "2025.1",
            2,
            serde_json::json!({"status": "draft"}),
        );
        let view = ActivityEventView::enrich(&event, Some("Alice"), "Gateway", None, Some(3));
        match &view.params {
            EventParams::Version {
                version,
                not_latest_revision,
                rest,
            } => {
                assert_eq!(version, "2025.1@2");
                assert!(not_latest_revision);
                assert_eq!(rest.get("status"), Some(&serde_json::json!("draft")));
            }
            other => panic!("unexpected params {:?}", other),
        }
        assert_eq!(view.principal.name, "Alice");
        // stored event untouched
        assert_eq!(event.data["version"], "2025.1");

        let legacy = ActivityEventViewLegacy::from(&view);
        assert_eq!(legacy.params["version"], "2025.1@2");
        assert_eq!(legacy.params["notLatestRevision"], true);
    }

    #[test]
    fn test_generic_event_keeps_data() {
        let event = ActivityEvent::new(
            EventType::GrantRole,
            "acme",
            "alice",
            serde_json::json!({"memberId": "bob"}),
        );
        let view = ActivityEventView::enrich(&event, None, "Acme", Some(PackageKind::Workspace), None);
        assert_eq!(view.principal.name, "alice");
        assert!(matches!(view.params, EventParams::Generic { .. }));
    }
}
