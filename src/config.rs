use base64::Engine;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_RELEASE_VERSION_PATTERN: &str = r"^[0-9]{4}\.[1-4]$";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub identity: IdentityConfig,
    pub ldap: LdapConfig,
    pub limits: LimitsConfig,
    pub catalog: CatalogConfig,
    pub builds: BuildsConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_address: String,
    pub base_path: String,
    pub origin_allowed: String,
    pub production_mode: bool,
    pub monitoring_enabled: bool,
    pub insecure_proxy: bool,
    pub allowed_hosts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `postgres` or `memory`
    pub backend: String,
    pub connection_string: Option<String>,
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub username: String,
    pub password: String,
    pub ssl_mode: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub bucket_name: String,
    pub crt: String,
    pub active: bool,
    pub store_only_build_result: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    pub jwt_private_key: String,
    pub client_id: String,
    pub client_secret: String,
    pub admin_email: String,
    pub admin_password: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LdapConfig {
    pub server: String,
    pub base_dn: String,
    pub search_base: String,
    pub organization_unit: String,
    pub user: String,
    pub user_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub publish_archive_size_limit_mb: u64,
    pub publish_file_size_limit_mb: u64,
    pub branch_content_size_limit_mb: u64,
    pub operation_group_operations_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub release_version_pattern: String,
    pub default_workspace_id: String,
    pub external_links: String,
    pub custom_path_prefixes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildsConfig {
    pub export_result_ttl_sec: u64,
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub await_ceiling_ms: u64,
    pub await_timeout_sec: u64,
    /// A running build without a heartbeat for this long is queued again.
    pub lease_timeout_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Six-field cron expression (seconds first).
    pub schedule: String,
    pub build_result_ttl_days: i64,
    pub batch_size: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            base_path: String::new(),
            origin_allowed: String::new(),
            production_mode: false,
            monitoring_enabled: false,
            insecure_proxy: false,
            allowed_hosts: String::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: "postgres".to_string(),
            connection_string: None,
            host: "localhost".to_string(),
            port: 5432,
            db_name: "apihub".to_string(),
            username: "apihub".to_string(),
            password: String::new(),
            ssl_mode: "disable".to_string(),
            max_connections: Some(20),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            bucket_name: String::new(),
            crt: String::new(),
            active: false,
            store_only_build_result: false,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            publish_archive_size_limit_mb: 50,
            publish_file_size_limit_mb: 15,
            branch_content_size_limit_mb: 50,
            operation_group_operations_limit: 5000,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            release_version_pattern: DEFAULT_RELEASE_VERSION_PATTERN.to_string(),
            default_workspace_id: String::new(),
            external_links: String::new(),
            custom_path_prefixes: String::new(),
        }
    }
}

impl Default for BuildsConfig {
    fn default() -> Self {
        Self {
            export_result_ttl_sec: 24 * 60 * 60,
            workers: 2,
            poll_interval_ms: 500,
            await_ceiling_ms: 2000,
            await_timeout_sec: 600,
            lease_timeout_sec: 300,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            schedule: "0 15 0 * * Sun".to_string(),
            build_result_ttl_days: 30,
            batch_size: 500,
        }
    }
}

/// Environment variables recognised on top of the `APIHUB_` prefixed layer,
/// mapped to their nested config keys.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("LISTEN_ADDRESS", "server.listen_address"),
    ("BASE_PATH", "server.base_path"),
    ("ORIGIN_ALLOWED", "server.origin_allowed"),
    ("PRODUCTION_MODE", "server.production_mode"),
    ("MONITORING_ENABLED", "server.monitoring_enabled"),
    ("INSECURE_PROXY", "server.insecure_proxy"),
    ("ALLOWED_HOSTS", "server.allowed_hosts"),
    ("APIHUB_STORE", "database.backend"),
    ("DATABASE_URL", "database.connection_string"),
    ("APIHUB_POSTGRESQL_HOST", "database.host"),
    ("APIHUB_POSTGRESQL_PORT", "database.port"),
    ("APIHUB_POSTGRESQL_DB_NAME", "database.db_name"),
    ("APIHUB_POSTGRESQL_USERNAME", "database.username"),
    ("APIHUB_POSTGRESQL_PASSWORD", "database.password"),
    ("PG_SSL_MODE", "database.ssl_mode"),
    ("STORAGE_SERVER_URL", "storage.url"),
    ("STORAGE_SERVER_USERNAME", "storage.username"),
    ("STORAGE_SERVER_PASSWORD", "storage.password"),
    ("STORAGE_SERVER_BUCKET_NAME", "storage.bucket_name"),
    ("STORAGE_SERVER_CRT", "storage.crt"),
    ("STORAGE_SERVER_ACTIVE", "storage.active"),
    ("STORAGE_SERVER_STORE_ONLY_BUILD_RESULT", "storage.store_only_build_result"),
    ("JWT_PRIVATE_KEY", "identity.jwt_private_key"),
    ("CLIENT_ID", "identity.client_id"),
    ("CLIENT_SECRET", "identity.client_secret"),
    ("APIHUB_ADMIN_EMAIL", "identity.admin_email"),
    ("APIHUB_ADMIN_PASSWORD", "identity.admin_password"),
    ("APIHUB_ACCESS_TOKEN", "identity.access_token"),
    ("LDAP_SERVER", "ldap.server"),
    ("LDAP_BASE_DN", "ldap.base_dn"),
    ("LDAP_SEARCH_BASE", "ldap.search_base"),
    ("LDAP_ORGANIZATION_UNIT", "ldap.organization_unit"),
    ("LDAP_USER", "ldap.user"),
    ("LDAP_USER_PASSWORD", "ldap.user_password"),
    ("PUBLISH_ARCHIVE_SIZE_LIMIT_MB", "limits.publish_archive_size_limit_mb"),
    ("PUBLISH_FILE_SIZE_LIMIT_MB", "limits.publish_file_size_limit_mb"),
    ("BRANCH_CONTENT_SIZE_LIMIT_MB", "limits.branch_content_size_limit_mb"),
    ("OPERATION_GROUP_OPERATIONS_LIMIT", "limits.operation_group_operations_limit"),
    ("RELEASE_VERSION_PATTERN", "catalog.release_version_pattern"),
    ("DEFAULT_WORKSPACE_ID", "catalog.default_workspace_id"),
    ("EXTERNAL_LINKS", "catalog.external_links"),
    ("CUSTOM_PATH_PREFIXES", "catalog.custom_path_prefixes"),
    ("EXPORT_RESULT_TTL_SEC", "builds.export_result_ttl_sec"),
    ("BUILD_WORKERS", "builds.workers"),
    ("BUILD_POLL_INTERVAL_MS", "builds.poll_interval_ms"),
    ("BUILD_LEASE_TIMEOUT_SEC", "builds.lease_timeout_sec"),
    ("BUILDS_CLEANUP_SCHEDULE", "cleanup.schedule"),
    ("BUILD_RESULT_TTL_DAYS", "cleanup.build_result_ttl_days"),
];

impl AppConfig {
    /// Load configuration from defaults, an optional `config` file and the environment
    pub fn load() -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        config = config.add_source(config::Config::try_from(&AppConfig::default())?);

        config = config.add_source(config::File::with_name("config").required(false));

        for (var, key) in ENV_OVERRIDES {
            let value = std::env::var(var).ok().filter(|v| !v.is_empty());
            config = config.set_override_option(*key, value)?;
        }

        let config = config.build()?;
        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;

        Ok(app_config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        regex::Regex::new(&self.catalog.release_version_pattern).map_err(|e| {
            anyhow::anyhow!(
                "RELEASE_VERSION_PATTERN '{}' is not a valid regexp: {}",
                self.catalog.release_version_pattern,
                e
            )
        })?;
        cron::Schedule::from_str(&self.cleanup.schedule).map_err(|e| {
            anyhow::anyhow!(
                "cleanup schedule '{}' is not a valid cron expression: {}",
                self.cleanup.schedule,
                e
            )
        })?;
        if self.storage.active && (self.storage.url.is_empty() || self.storage.bucket_name.is_empty())
        {
            anyhow::bail!("STORAGE_SERVER_URL and STORAGE_SERVER_BUCKET_NAME are required when storage is active");
        }
        if !self.identity.jwt_private_key.is_empty() {
            base64::engine::general_purpose::STANDARD
                .decode(self.identity.jwt_private_key.trim())
                .map_err(|e| anyhow::anyhow!("JWT_PRIVATE_KEY is not valid base64: {}", e))?;
        }
        Ok(())
    }

    /// Get the database URL from config or the discrete connection settings
    pub fn database_url(&self) -> String {
        if let Some(connection_string) = &self.database.connection_string {
            return connection_string.clone();
        }
        let db = &self.database;
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            db.username, db.password, db.host, db.port, db.db_name, db.ssl_mode
        )
    }

    /// Get the server bind address; `:8080` style values bind all interfaces.
    pub fn server_address(&self) -> String {
        let addr = self.server.listen_address.trim();
        if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        }
    }

    pub fn export_result_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.builds.export_result_ttl_sec as i64)
    }

    pub fn await_timeout(&self) -> Duration {
        Duration::from_secs(self.builds.await_timeout_sec)
    }

    pub fn publish_file_size_limit(&self) -> u64 {
        self.limits.publish_file_size_limit_mb * 1024 * 1024
    }

    pub fn publish_archive_size_limit(&self) -> u64 {
        self.limits.publish_archive_size_limit_mb * 1024 * 1024
    }

    pub fn origins_allowed(&self) -> Vec<String> {
        split_list(&self.server.origin_allowed)
    }

    pub fn allowed_hosts(&self) -> Vec<String> {
        split_list(&self.server.allowed_hosts)
    }

    pub fn external_links(&self) -> Vec<String> {
        split_list(&self.catalog.external_links)
    }

    pub fn custom_path_prefixes(&self) -> Vec<String> {
        split_list(&self.catalog.custom_path_prefixes)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
