use std::collections::BTreeMap;

/// Stable, client-facing error codes.
pub mod codes {
    pub const EMPTY_PARAMETER: &str = "EmptyParameter";
    pub const INVALID_PARAMETER: &str = "InvalidParameter";
    pub const INVALID_PACKAGE_KIND: &str = "InvalidPackageKind";
    pub const INVALID_PACKAGE_ALIAS: &str = "InvalidPackageAlias";
    pub const INVALID_REST_GROUPING_PREFIX: &str = "InvalidRestGroupingPrefix";
    pub const INVALID_RELEASE_VERSION_PATTERN: &str = "InvalidReleaseVersionPattern";
    pub const RELEASE_VERSION_DOESNT_MATCH_PATTERN: &str = "ReleaseVersionDoesntMatchPattern";
    pub const INVALID_VERSION_NAME: &str = "InvalidVersionName";
    pub const PUBLISH_FILE_SIZE_EXCEEDED: &str = "PublishFileSizeExceeded";
    pub const PUBLISH_ARCHIVE_SIZE_EXCEEDED: &str = "PublishArchiveSizeExceeded";
    pub const GROUP_OPERATIONS_LIMIT_EXCEEDED: &str = "GroupOperationsLimitExceeded";
    pub const UNKNOWN_BUILD_FORMAT: &str = "UnknownBuildFormat";
    pub const UNKNOWN_TRANSFORMATION: &str = "UnknownTransformation";
    pub const INCOMPATIBLE_PACKAGE_MOVE: &str = "IncompatiblePackageMove";
    pub const OPERATION_GROUP_NOT_MODIFIABLE: &str = "OperationGroupNotModifiable";
    pub const GROUPED_OPERATION_NOT_ALLOWED: &str = "GroupingOperationNotAllowed";
    pub const DEFAULT_RELEASE_NOT_LATEST_REVISION: &str = "DefaultReleaseVersionIsNotLatestRevision";
    pub const DEFAULT_RELEASE_NOT_RELEASE_STATUS: &str = "DefaultReleaseVersionHasNotReleaseStatus";
    pub const INVALID_ROLE_ORDER: &str = "InvalidRoleOrder";
    pub const REFERENCE_CYCLE: &str = "PackageReferenceCycle";

    pub const ALIAS_ALREADY_TAKEN: &str = "AliasAlreadyTaken";
    pub const PACKAGE_REDIRECT_EXISTS: &str = "PackageRedirectExists";
    pub const TO_PACKAGE_REDIRECT_EXISTS: &str = "ToPackageRedirectExists";
    pub const OPERATION_GROUP_ALREADY_EXISTS: &str = "OperationGroupAlreadyExists";
    pub const API_KEY_NAME_DUPLICATE: &str = "ApiKeyNameDuplicate";
    pub const SERVICE_NAME_ALREADY_TAKEN: &str = "ServiceNameAlreadyTaken";
    pub const SERVICE_NAME_CANT_BE_MODIFIED: &str = "ServiceNameCantBeModified";
    pub const ROLE_ALREADY_EXISTS: &str = "RoleAlreadyExists";
    pub const MIGRATION_IN_PROGRESS: &str = "MigrationInProgress";

    pub const PACKAGE_NOT_FOUND: &str = "PackageNotFound";
    pub const VERSION_NOT_FOUND: &str = "VersionNotFound";
    pub const REVISION_NOT_FOUND: &str = "RevisionNotFound";
    pub const DOCUMENT_NOT_FOUND: &str = "DocumentNotFound";
    pub const OPERATION_NOT_FOUND: &str = "OperationNotFound";
    pub const OPERATION_GROUP_NOT_FOUND: &str = "OperationGroupNotFound";
    pub const TEMPLATE_NOT_FOUND: &str = "OperationGroupTemplateNotFound";
    pub const BUILD_NOT_FOUND: &str = "BuildNotFound";
    pub const PUBLISH_NOT_FOUND: &str = "PublishProcessNotFound";
    pub const USER_NOT_FOUND: &str = "UserNotFound";
    pub const COMPARISON_NOT_FOUND: &str = "ComparisonNotFound";
    pub const MODEL_NOT_FOUND: &str = "ModelNotFound";
    pub const API_KEY_NOT_FOUND: &str = "ApiKeyNotFound";
    pub const ROLE_NOT_FOUND: &str = "RoleNotFound";
    pub const MEMBER_ROLE_NOT_FOUND: &str = "MemberRoleNotFound";
    pub const USER_WITH_NO_ROLES: &str = "UserWithNoRoles";
    pub const TRANSITION_NOT_FOUND: &str = "TransitionNotFound";
    pub const JOB_NOT_FOUND: &str = "JobNotFound";

    pub const INSUFFICIENT_PRIVILEGES: &str = "InsufficientPrivileges";
    pub const PRIVATE_WORKSPACE_NOT_MODIFIABLE: &str = "PrivateWorkspaceNotModifiable";
    pub const NOT_AVAILABLE_ROLE: &str = "NotAvailableRole";
    pub const ROLE_NOT_MODIFIABLE: &str = "RoleNotModifiable";
    pub const UNAUTHENTICATED: &str = "Unauthenticated";

    pub const EXPORT_RESULT_UNAVAILABLE: &str = "ExportResultUnavailable";
    pub const EXPORT_NOT_READY: &str = "ExportNotReady";
    pub const BUILD_FAILED: &str = "BuildFailed";
    pub const BUILD_AWAIT_TIMEOUT: &str = "BuildAwaitTimeout";
    pub const BUILD_AWAIT_CANCELLED: &str = "BuildAwaitCancelled";
    pub const STORAGE_UNAVAILABLE: &str = "StorageUnavailable";

    pub const INTERNAL: &str = "InternalServerError";
}

pub type Params = BTreeMap<String, String>;

/// Domain error shared by every service. Store failures arrive as `anyhow`
/// errors and surface as `Internal`.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{message}")]
    Validation {
        code: &'static str,
        message: String,
        params: Params,
    },
    #[error("{message}")]
    Conflict {
        code: &'static str,
        message: String,
        params: Params,
    },
    #[error("{message}")]
    NotFound {
        code: &'static str,
        message: String,
        params: Params,
    },
    #[error("{message}")]
    Forbidden {
        code: &'static str,
        message: String,
        params: Params,
    },
    /// An upstream collaborator (object store, build, identity provider) failed.
    #[error("{message}")]
    Dependency {
        code: &'static str,
        message: String,
        params: Params,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Coarse error class, used for HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Forbidden,
    Dependency,
    Internal,
}

impl CatalogError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
            params: Params::new(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
            params: Params::new(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
            params: Params::new(),
        }
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::Forbidden {
            code,
            message: message.into(),
            params: Params::new(),
        }
    }

    pub fn dependency(code: &'static str, message: impl Into<String>) -> Self {
        Self::Dependency {
            code,
            message: message.into(),
            params: Params::new(),
        }
    }

    /// Attach an offending identifier to the error envelope.
    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        match &mut self {
            Self::Validation { params, .. }
            | Self::Conflict { params, .. }
            | Self::NotFound { params, .. }
            | Self::Forbidden { params, .. }
            | Self::Dependency { params, .. } => {
                params.insert(key.to_string(), value.to_string());
            }
            Self::Internal(_) => {}
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::Dependency { .. } => ErrorKind::Dependency,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. }
            | Self::Conflict { code, .. }
            | Self::NotFound { code, .. }
            | Self::Forbidden { code, .. }
            | Self::Dependency { code, .. } => code,
            Self::Internal(_) => codes::INTERNAL,
        }
    }

    pub fn params(&self) -> Option<&Params> {
        match self {
            Self::Validation { params, .. }
            | Self::Conflict { params, .. }
            | Self::NotFound { params, .. }
            | Self::Forbidden { params, .. }
            | Self::Dependency { params, .. } => Some(params),
            Self::Internal(_) => None,
        }
    }

    /// HTTP-style status for the envelope.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Conflict { .. } => 409,
            Self::NotFound { code, .. } if *code == codes::EXPORT_RESULT_UNAVAILABLE => 410,
            Self::NotFound { .. } => 404,
            Self::Forbidden { code, .. } if *code == codes::UNAUTHENTICATED => 401,
            Self::Forbidden { .. } => 403,
            Self::Dependency { code, .. } if *code == codes::BUILD_AWAIT_TIMEOUT => 504,
            Self::Dependency { .. } => 424,
            Self::Internal(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn empty_param(name: &str) -> Self {
        Self::validation(
            codes::EMPTY_PARAMETER,
            format!("Parameter '{}' must not be empty", name),
        )
        .with_param("param", name)
    }

    pub fn insufficient_privileges() -> Self {
        Self::forbidden(
            codes::INSUFFICIENT_PRIVILEGES,
            "You don't have enough privileges to perform this operation",
        )
    }

    pub fn package_not_found(id: &str) -> Self {
        Self::not_found(
            codes::PACKAGE_NOT_FOUND,
            format!("Package with id '{}' not found", id),
        )
        .with_param("id", id)
    }

    pub fn version_not_found(package_id: &str, version: &str) -> Self {
        Self::not_found(
            codes::VERSION_NOT_FOUND,
            format!(
                "Published version '{}' not found for package '{}'",
                version, package_id
            ),
        )
        .with_param("packageId", package_id)
        .with_param("version", version)
    }

    pub fn group_not_found(group: &str) -> Self {
        Self::not_found(
            codes::OPERATION_GROUP_NOT_FOUND,
            format!("Operation group '{}' not found", group),
        )
        .with_param("groupName", group)
    }

    pub fn build_not_found(build_id: &str) -> Self {
        Self::not_found(
            codes::BUILD_NOT_FOUND,
            format!("Build with id '{}' not found", build_id),
        )
        .with_param("buildId", build_id)
    }
}
