use serde::{Deserialize, Serialize};

use crate::model::Id;

pub const SYSTEM_USER_ID: &str = "system";

/// Caller identity established at the request boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Principal {
    User {
        user_id: String,
        user_name: Option<String>,
        user_email: Option<String>,
    },
    /// Request authenticated by an API key; access is limited to the key's
    /// package subtree and roles.
    ApiKey {
        key_id: String,
        package_id: Id,
        roles: Vec<String>,
        created_by: String,
    },
    /// Background jobs acting on behalf of the system.
    System,
}

impl Principal {
    pub fn user(user_id: impl Into<String>) -> Self {
        Principal::User {
            user_id: user_id.into(),
            user_name: None,
            user_email: None,
        }
    }

    pub fn with_details(user_id: String, email: Option<String>, name: Option<String>) -> Self {
        Principal::User {
            user_id,
            user_name: name,
            user_email: email,
        }
    }

    /// Id written into audit columns.
    pub fn actor_id(&self) -> &str {
        match self {
            Principal::User { user_id, .. } => user_id,
            Principal::ApiKey { key_id, .. } => key_id,
            Principal::System => SYSTEM_USER_ID,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Principal::User { user_id, .. } => Some(user_id),
            _ => None,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Principal::System)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_ids() {
        assert_eq!(Principal::user("alice").actor_id(), "alice");
        assert_eq!(Principal::System.actor_id(), SYSTEM_USER_ID);
        let key = Principal::ApiKey {
            key_id: "api-key_1".to_string(),
            package_id: "acme.pay".to_string(),
            roles: vec!["viewer".to_string()],
            created_by: "alice".to_string(),
        };
        assert_eq!(key.actor_id(), "api-key_1");
        assert_eq!(key.user_id(), None);
    }
}
