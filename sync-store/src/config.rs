//! Configuration loading for sync-store.
//!
//! Configuration is loaded from a TOML file. It describes the store server
//! (endpoints, number of logical databases, keyspace notifications) and a
//! catalog mapping database names to indexes and table separators.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use sync_types::DEFAULT_SEPARATOR;

/// Root configuration for sync-store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Named databases.
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// TCP host name (default: 127.0.0.1).
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// TCP port (default: 6379).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Unix socket path; the server also answers on it when set.
    pub unix_socket_path: Option<PathBuf>,
    /// Number of logical databases (default: 16).
    #[serde(default = "default_databases")]
    pub databases: u32,
    /// Emit keyspace/keyevent notifications (default: false).
    #[serde(default)]
    pub notify_keyspace_events: bool,
}

/// One entry of the database catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Logical database index.
    pub id: u32,
    /// Separator between table name and row key (default: ":").
    #[serde(default = "default_separator")]
    pub separator: String,
}

// Default value functions
fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_databases() -> u32 {
    16
}

fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            unix_socket_path: None,
            databases: default_databases(),
            notify_keyspace_events: false,
        }
    }
}

impl ServerConfig {
    /// Endpoints this server answers on: TCP first, then the unix socket.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = vec![Endpoint::Tcp {
            host: self.hostname.clone(),
            port: self.port,
        }];
        if let Some(path) = &self.unix_socket_path {
            endpoints.push(Endpoint::Unix(path.clone()));
        }
        endpoints
    }
}

impl StoreConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Resolve a named database into connection parameters.
    ///
    /// `use_unix_socket` selects the unix socket endpoint instead of TCP.
    pub fn connection_info(
        &self,
        db_name: &str,
        use_unix_socket: bool,
    ) -> Result<DbConnectionInfo, ConfigError> {
        let db = self
            .databases
            .get(db_name)
            .ok_or_else(|| ConfigError::UnknownDatabase {
                name: db_name.to_string(),
            })?;

        if db.id >= self.server.databases {
            return Err(ConfigError::DatabaseOutOfRange {
                name: db_name.to_string(),
                id: db.id,
                databases: self.server.databases,
            });
        }

        let endpoint = if use_unix_socket {
            let path = self
                .server
                .unix_socket_path
                .clone()
                .ok_or(ConfigError::NoUnixSocket)?;
            Endpoint::Unix(path)
        } else {
            Endpoint::Tcp {
                host: self.server.hostname.clone(),
                port: self.server.port,
            }
        };

        Ok(DbConnectionInfo {
            db_id: db.id,
            endpoint,
            separator: db.separator.clone(),
        })
    }
}

/// Where a store server answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP host and port.
    Tcp {
        /// Host name or address.
        host: String,
        /// Port number.
        port: u16,
    },
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Parameters for opening a connection to one logical database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConnectionInfo {
    /// Logical database index.
    pub db_id: u32,
    /// Server endpoint.
    pub endpoint: Endpoint,
    /// Table separator used for this database.
    pub separator: String,
}

impl DbConnectionInfo {
    /// TCP connection info with the default separator.
    pub fn tcp(db_id: u32, host: impl Into<String>, port: u16) -> Self {
        Self {
            db_id,
            endpoint: Endpoint::Tcp {
                host: host.into(),
                port,
            },
            separator: default_separator(),
        }
    }

    /// Unix socket connection info with the default separator.
    pub fn unix(db_id: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            db_id,
            endpoint: Endpoint::Unix(path.into()),
            separator: default_separator(),
        }
    }

    /// Override the table separator.
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Database name not present in the catalog.
    #[error("unknown database: {name}")]
    UnknownDatabase {
        /// The requested name.
        name: String,
    },
    /// Catalog entry points past the configured database count.
    #[error("database {name} has id {id} but the server has {databases} databases")]
    DatabaseOutOfRange {
        /// Database name.
        name: String,
        /// Configured id.
        id: u32,
        /// Configured database count.
        databases: u32,
    },
    /// Unix socket requested but not configured.
    #[error("no unix socket path configured")]
    NoUnixSocket,
}
