//! SurrealDB connection setup
//!
//! Resolves where the tree lives and opens an authenticated, schema-ready
//! connection. Supports in-memory, local file (`surrealkv://`) and remote
//! (WebSocket) endpoints.

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StoreError;
use crate::migrations;
use crate::storage_traits::StoreResult;

const DEFAULT_NAMESPACE: &str = "arbor";
const DEFAULT_DATABASE: &str = "main";

/// Credentials for an authenticated remote endpoint
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

/// Where and how to connect to the tree store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Engine URL (`mem://`, `surrealkv://path`, `wss://host`)
    pub endpoint: String,
    /// Namespace (default: "arbor")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Sign-in credentials; `None` for embedded engines
    pub credentials: Option<Credentials>,
}

impl StoreConfig {
    /// Unauthenticated connection to `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            credentials: None,
        }
    }

    /// Volatile in-process store
    pub fn in_memory() -> Self {
        Self::new("mem://")
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    /// Authenticate as a database user
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
            is_root: false,
        });
        self
    }

    /// Authenticate as a root user
    pub fn with_root(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
            is_root: true,
        });
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT + SURREALDB_USERNAME + SURREALDB_PASSWORD: remote endpoint
    /// - SURREALDB_ROOT (optional, default: "false") - set to "true" for root users
    /// - SURREALDB_URL: unauthenticated endpoint, used when no credentials are set
    /// - SURREALDB_NAMESPACE (optional, default: "arbor")
    /// - SURREALDB_DATABASE (optional, default: "main")
    ///
    /// Falls back to a local `surrealkv://.arbor/db` store.
    pub fn from_env() -> Self {
        let remote = (
            std::env::var("SURREALDB_ENDPOINT"),
            std::env::var("SURREALDB_USERNAME"),
            std::env::var("SURREALDB_PASSWORD"),
        );

        let mut config = match remote {
            (Ok(endpoint), Ok(username), Ok(password)) => {
                let is_root = std::env::var("SURREALDB_ROOT")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false);
                let config = Self::new(endpoint);
                if is_root {
                    config.with_root(username, password)
                } else {
                    config.with_user(username, password)
                }
            }
            _ => match std::env::var("SURREALDB_URL") {
                Ok(url) => Self::new(url),
                Err(_) => Self::new("surrealkv://.arbor/db"),
            },
        };

        if let Ok(ns) = std::env::var("SURREALDB_NAMESPACE") {
            config.namespace = ns;
        }
        if let Ok(db) = std::env::var("SURREALDB_DATABASE") {
            config.database = db;
        }
        config
    }

    /// Open, authenticate, select namespace/database and initialize schema.
    #[instrument(skip(self), fields(endpoint = %self.endpoint, namespace = %self.namespace, database = %self.database))]
    pub(crate) async fn connect(&self) -> StoreResult<Surreal<Any>> {
        if let Some(dir) = self.endpoint.strip_prefix("surrealkv://") {
            std::fs::create_dir_all(dir).map_err(|e| {
                StoreError::Connection(format!(
                    "Failed to create database directory {}: {}",
                    dir, e
                ))
            })?;
        }

        let db = surrealdb::engine::any::connect(self.endpoint.as_str())
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to connect to {}: {}", self.endpoint, e))
            })?;

        if let Some(creds) = &self.credentials {
            if creds.is_root {
                db.signin(Root {
                    username: &creds.username,
                    password: &creds.password,
                })
                .await
                .map_err(|e| StoreError::Connection(format!("Root authentication failed: {}", e)))?;
            } else {
                db.signin(Database {
                    namespace: &self.namespace,
                    database: &self.database,
                    username: &creds.username,
                    password: &creds.password,
                })
                .await
                .map_err(|e| {
                    StoreError::Connection(format!("Database authentication failed: {}", e))
                })?;
            }
        }

        db.use_ns(self.namespace.as_str())
            .use_db(self.database.as_str())
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to select namespace/database: {}", e))
            })?;

        migrations::init_schema(&db).await?;

        info!("Tree store connected and schema initialized");
        Ok(db)
    }
}
