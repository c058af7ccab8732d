//! Connection configuration: credentials, target database and the fixed
//! transport options every connection is opened with.

use docrelay_common::{DocRelayError, Result};

pub const MONGO_USER_ENV: &str = "MONGO_USER";
pub const MONGO_PASS_ENV: &str = "MONGO_PASS";
pub const MONGO_HOST_ENV: &str = "MONGO_HOST";
pub const MONGO_DB_ENV: &str = "MONGO_DB";
pub const MONGO_AUTH_DB_ENV: &str = "MONGO_AUTH_DB";
pub const MONGO_REPSET_ENV: &str = "MONGO_REPSET";

/// Transport options baked into every connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// zlib wire compression (default: on)
    pub compression: bool,
    /// Driver-level read retry (default: on)
    pub retry_reads: bool,
    /// Driver-level write retry (default: on)
    pub retry_writes: bool,
    /// Maximum number of connections in the pool (default: 200)
    pub max_pool_size: u32,
    /// Application name for server logs
    pub app_name: Option<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            compression: true,
            retry_reads: true,
            retry_writes: true,
            max_pool_size: 200,
            app_name: Some("docrelay".to_string()),
        }
    }
}

/// Everything needed to open a connection. Built once at startup.
///
/// Required fields may be absent here; [`ConnectionConfig::connection_uri`]
/// rejects them so a bad config surfaces as a failed connection attempt.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionConfig {
    user: Option<String>,
    password: Option<String>,
    host: Option<String>,
    database: Option<String>,
    auth_database: Option<String>,
    replica_set: Option<String>,
    transport: TransportOptions,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("host", &self.host)
            .field("database", &self.database)
            .field("auth_database", &self.auth_database)
            .field("replica_set", &self.replica_set)
            .field("transport", &self.transport)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Create from environment variables.
    ///
    /// Reads MONGO_USER, MONGO_PASS, MONGO_HOST, MONGO_DB and optionally
    /// MONGO_AUTH_DB and MONGO_REPSET. Unset variables stay unset.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self {
            user: var(MONGO_USER_ENV),
            password: var(MONGO_PASS_ENV),
            host: var(MONGO_HOST_ENV),
            database: var(MONGO_DB_ENV),
            auth_database: var(MONGO_AUTH_DB_ENV),
            replica_set: var(MONGO_REPSET_ENV),
            transport: TransportOptions::default(),
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn auth_database(&self) -> Option<&str> {
        self.auth_database.as_deref()
    }

    pub fn replica_set(&self) -> Option<&str> {
        self.replica_set.as_deref()
    }

    pub fn transport(&self) -> &TransportOptions {
        &self.transport
    }

    /// Target database name
    ///
    /// # Errors
    /// Returns a Connection error if no database was configured
    pub fn database_name(&self) -> Result<&str> {
        required(&self.database, MONGO_DB_ENV)
    }

    /// Check every required field is present
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            (&self.user, MONGO_USER_ENV),
            (&self.password, MONGO_PASS_ENV),
            (&self.host, MONGO_HOST_ENV),
            (&self.database, MONGO_DB_ENV),
        ]
        .into_iter()
        .filter(|(value, _)| value.as_deref().map_or(true, str::is_empty))
        .map(|(_, name)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(DocRelayError::Connection(format!(
                "Missing required connection settings: {}",
                missing.join(", ")
            )))
        }
    }

    /// Build the `mongodb://` connection string
    ///
    /// # Errors
    /// Returns a Connection error if user, password, host or database is missing
    pub fn connection_uri(&self) -> Result<String> {
        self.validate()?;
        let user = required(&self.user, MONGO_USER_ENV)?;
        let password = required(&self.password, MONGO_PASS_ENV)?;
        Ok(self.render_uri(&urlencoding::encode(user), &urlencoding::encode(password)))
    }

    /// Connection string with the password masked, for logs
    pub fn redacted_uri(&self) -> String {
        let user = self.user.as_deref().unwrap_or_default();
        self.render_uri(&urlencoding::encode(user), "****")
    }

    fn render_uri(&self, user: &str, password: &str) -> String {
        let host = self.host.as_deref().unwrap_or_default();
        let transport = &self.transport;

        let mut params = Vec::new();
        if transport.compression {
            params.push("compressors=zlib".to_string());
        }
        params.push(format!("retryReads={}", transport.retry_reads));
        params.push(format!("retryWrites={}", transport.retry_writes));
        params.push(format!("maxPoolSize={}", transport.max_pool_size));
        if let Some(auth_db) = self.auth_database.as_deref().filter(|s| !s.is_empty()) {
            params.push(format!("authSource={}", auth_db));
        }
        if let Some(replica_set) = self.replica_set.as_deref().filter(|s| !s.is_empty()) {
            params.push(format!("replicaSet={}", replica_set));
        }

        format!("mongodb://{}:{}@{}/?{}", user, password, host, params.join("&"))
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            DocRelayError::Connection(format!("Missing required connection setting: {}", name))
        })
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.config.user = Some(user.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = Some(host.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    pub fn auth_database(mut self, auth_database: impl Into<String>) -> Self {
        self.config.auth_database = Some(auth_database.into());
        self
    }

    pub fn replica_set(mut self, replica_set: impl Into<String>) -> Self {
        self.config.replica_set = Some(replica_set.into());
        self
    }

    pub fn transport(mut self, transport: TransportOptions) -> Self {
        self.config.transport = transport;
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}
