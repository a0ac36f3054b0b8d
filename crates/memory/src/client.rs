//! ScyllaDB client and connection management

use crate::error::MemoryError;
use crate::schema;
use scylla::{Session, SessionBuilder};
use std::sync::Arc;

/// Row store configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub hosts: Vec<String>,
    pub keyspace: String,
    pub replication_factor: u8,
}

impl Default for DbConfig {
    fn default() -> Self {
        let hosts = std::env::var("DB_URL")
            .map(|s| s.split(',').map(|h| h.trim().to_string()).collect())
            .unwrap_or_else(|_| vec!["127.0.0.1:9042".to_string()]);

        let keyspace = std::env::var("DB_KEYSPACE").unwrap_or_else(|_| "colloquy".to_string());

        Self {
            hosts,
            keyspace,
            replication_factor: 1,
        }
    }
}

/// ScyllaDB client wrapper.
#[derive(Clone)]
pub struct DbClient {
    session: Arc<Session>,
    config: DbConfig,
}

impl DbClient {
    /// Connect to the cluster.
    pub async fn connect(config: DbConfig) -> Result<Self, MemoryError> {
        tracing::info!(hosts = ?config.hosts, keyspace = %config.keyspace, "Connecting to row store");

        let session = SessionBuilder::new()
            .known_nodes(&config.hosts)
            .build()
            .await?;

        Ok(Self {
            session: Arc::new(session),
            config,
        })
    }

    /// Ensure keyspace and tables exist.
    pub async fn ensure_schema(&self) -> Result<(), MemoryError> {
        schema::create_keyspace(
            &self.session,
            &self.config.keyspace,
            self.config.replication_factor,
        )
        .await?;
        schema::create_tables(&self.session, &self.config.keyspace).await?;
        tracing::info!(keyspace = %self.config.keyspace, "Schema ensured");
        Ok(())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn keyspace(&self) -> &str {
        &self.config.keyspace
    }
}
