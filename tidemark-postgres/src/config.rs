//! PostgreSQL connection configuration.

use std::time::Duration;

use crate::error::{PgError, PgResult};

/// Default `application_name`, visible in `pg_stat_activity`.
pub const DEFAULT_APPLICATION_NAME: &str = "tidemark";

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgConfig {
    /// Database URL.
    pub url: String,
    /// Host (extracted from URL or explicit).
    pub host: String,
    /// Port (default: 5432).
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Username.
    pub user: String,
    /// Password.
    pub password: Option<String>,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Server-side `statement_timeout`.
    pub statement_timeout: Option<Duration>,
    /// Server-side `lock_timeout`, bounding how long DDL waits on table locks.
    pub lock_timeout: Option<Duration>,
    /// Application name (shown in pg_stat_activity).
    pub application_name: String,
}

impl PgConfig {
    /// Create a new configuration from a database URL.
    pub fn from_url(url: impl Into<String>) -> PgResult<Self> {
        let url = url.into();
        let parsed = url::Url::parse(&url)
            .map_err(|e| PgError::config(format!("invalid database URL: {}", e)))?;

        if parsed.scheme() != "postgresql" && parsed.scheme() != "postgres" {
            return Err(PgError::config(format!(
                "invalid scheme: expected 'postgresql' or 'postgres', got '{}'",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| PgError::config("missing host in URL"))?
            .to_string();

        let port = parsed.port().unwrap_or(5432);

        let database = parsed.path().trim_start_matches('/').to_string();

        if database.is_empty() {
            return Err(PgError::config("missing database name in URL"));
        }

        let user = if parsed.username().is_empty() {
            "postgres".to_string()
        } else {
            parsed.username().to_string()
        };

        let password = parsed.password().map(String::from);

        let mut connect_timeout = Duration::from_secs(30);
        let mut statement_timeout = None;
        let mut lock_timeout = None;
        let mut application_name = DEFAULT_APPLICATION_NAME.to_string();

        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "connect_timeout" => {
                    connect_timeout = Duration::from_secs(parse_number(&key, &value)?);
                }
                "statement_timeout" => {
                    statement_timeout = Some(Duration::from_millis(parse_number(&key, &value)?));
                }
                "lock_timeout" => {
                    lock_timeout = Some(Duration::from_millis(parse_number(&key, &value)?));
                }
                "application_name" => {
                    application_name = value.to_string();
                }
                "sslmode" if value == "disable" || value == "prefer" => {}
                "sslmode" => {
                    return Err(PgError::config(format!("unsupported sslmode: {}", value)));
                }
                other => {
                    return Err(PgError::config(format!("unknown URL parameter: {}", other)));
                }
            }
        }

        Ok(Self {
            url,
            host,
            port,
            database,
            user,
            password,
            connect_timeout,
            statement_timeout,
            lock_timeout,
            application_name,
        })
    }

    /// Create a builder for configuration.
    pub fn builder() -> PgConfigBuilder {
        PgConfigBuilder::new()
    }

    /// Convert to tokio-postgres config.
    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.dbname(&self.database);
        config.user(&self.user);

        if let Some(ref password) = self.password {
            config.password(password);
        }

        config.application_name(&self.application_name);
        config.connect_timeout(self.connect_timeout);

        let options = self.session_options();
        if !options.is_empty() {
            config.options(&options);
        }

        config
    }

    /// `-c name=value` startup options for the session timeouts.
    fn session_options(&self) -> String {
        let mut options = Vec::new();
        if let Some(timeout) = self.statement_timeout {
            options.push(format!("-c statement_timeout={}", timeout.as_millis()));
        }
        if let Some(timeout) = self.lock_timeout {
            options.push(format!("-c lock_timeout={}", timeout.as_millis()));
        }
        options.join(" ")
    }
}

fn parse_number(key: &str, value: &str) -> PgResult<u64> {
    value
        .parse()
        .map_err(|_| PgError::config(format!("invalid {}: {}", key, value)))
}

/// Builder for PostgreSQL configuration.
#[derive(Debug, Default)]
pub struct PgConfigBuilder {
    url: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    database: Option<String>,
    user: Option<String>,
    password: Option<String>,
    connect_timeout: Option<Duration>,
    statement_timeout: Option<Duration>,
    lock_timeout: Option<Duration>,
    application_name: Option<String>,
}

impl PgConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database URL (parses all connection parameters).
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the database name.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the username.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the statement timeout.
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Set the lock timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Set the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PgResult<PgConfig> {
        let mut config = if let Some(url) = self.url {
            PgConfig::from_url(url)?
        } else {
            let host = self.host.clone().unwrap_or_else(|| "localhost".to_string());
            let port = self.port.unwrap_or(5432);
            let database = self
                .database
                .clone()
                .ok_or_else(|| PgError::config("database name is required"))?;
            let user = self.user.clone().unwrap_or_else(|| "postgres".to_string());

            PgConfig {
                url: format!("postgresql://{}@{}:{}/{}", user, host, port, database),
                host,
                port,
                database,
                user,
                password: None,
                connect_timeout: Duration::from_secs(30),
                statement_timeout: None,
                lock_timeout: None,
                application_name: DEFAULT_APPLICATION_NAME.to_string(),
            }
        };

        // Explicit values override the URL
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(database) = self.database {
            config.database = database;
        }
        if let Some(user) = self.user {
            config.user = user;
        }
        if let Some(password) = self.password {
            config.password = Some(password);
        }
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = timeout;
        }
        if let Some(timeout) = self.statement_timeout {
            config.statement_timeout = Some(timeout);
        }
        if let Some(timeout) = self.lock_timeout {
            config.lock_timeout = Some(timeout);
        }
        if let Some(name) = self.application_name {
            config.application_name = name;
        }

        Ok(config)
    }
}
