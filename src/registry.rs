// src/registry.rs
//
// Get-or-create connection tracking. One optional default connection plus a
// pool keyed by logical connection type. The fast path is a short read lock
// checking the broker's own open state; establishment runs under a single
// async mutex with a re-check inside, so racing first users share one
// connection per scope and a stale connection is replaced exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use lapin::{Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::BrokerConfig;
use crate::errors::{BrokerError, Result};
use crate::shutdown;

/// Opaque tag identifying a logical connection purpose, e.g. "publisher"
/// or "worker-pool-a". Used only as a pool key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionType(String);

impl ConnectionType {
    pub fn new(tag: impl Into<String>) -> Self {
        ConnectionType(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionType {
    fn from(tag: &str) -> Self {
        ConnectionType(tag.to_string())
    }
}

impl From<String> for ConnectionType {
    fn from(tag: String) -> Self {
        ConnectionType(tag)
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const DEFAULT_SCOPE: &str = "default";

/// Tracks at most one live connection per scope for the process lifetime.
/// Construct once and share via `Arc`; connections are closed by process
/// exit, never torn down here.
pub struct ConnectionRegistry {
    config: BrokerConfig,
    default: RwLock<Option<Arc<Connection>>>,
    pool: RwLock<HashMap<ConnectionType, Arc<Connection>>>,
    // Serializes establishment across all scopes. Never taken on the fast
    // path; held across the connect await, which is the accepted
    // serialization point for concurrent first use.
    create_lock: Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new(config: BrokerConfig) -> Self {
        ConnectionRegistry {
            config,
            default: RwLock::new(None),
            pool: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(BrokerConfig::from_env()?))
    }

    /// True when the tracked default connection exists and is open.
    pub fn is_connected(&self) -> bool {
        matches!(self.live_default(), Ok(Some(_)))
    }

    /// Returns the default connection, establishing it on first use and
    /// replacing it if the tracked one has gone stale.
    pub async fn default_connection(&self) -> Result<Arc<Connection>> {
        if let Some(connection) = self.live_default()? {
            return Ok(connection);
        }

        let _guard = self.create_lock.lock().await;
        // Another task may have won the race while we waited.
        if let Some(connection) = self.live_default()? {
            return Ok(connection);
        }

        let connection = self.establish(DEFAULT_SCOPE).await?;
        *self
            .default
            .write()
            .map_err(|_| BrokerError::LockPoisoned)? = Some(connection.clone());
        Ok(connection)
    }

    /// Returns the connection tracked for `ty`, establishing it on first use
    /// and replacing it if stale. Same double-checked pattern as the default
    /// path; errors are logged and propagated identically.
    pub async fn connection(&self, ty: &ConnectionType) -> Result<Arc<Connection>> {
        if let Some(connection) = self.live_pooled(ty)? {
            return Ok(connection);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(connection) = self.live_pooled(ty)? {
            return Ok(connection);
        }

        let connection = self.establish(ty.as_str()).await?;
        self.pool
            .write()
            .map_err(|_| BrokerError::LockPoisoned)?
            .insert(ty.clone(), connection.clone());
        Ok(connection)
    }

    fn live_default(&self) -> Result<Option<Arc<Connection>>> {
        let guard = self.default.read().map_err(|_| BrokerError::LockPoisoned)?;
        Ok(guard
            .as_ref()
            .filter(|connection| connection.status().connected())
            .cloned())
    }

    fn live_pooled(&self, ty: &ConnectionType) -> Result<Option<Arc<Connection>>> {
        let guard = self.pool.read().map_err(|_| BrokerError::LockPoisoned)?;
        Ok(guard
            .get(ty)
            .filter(|connection| connection.status().connected())
            .cloned())
    }

    /// One connect attempt; recovery is deferred to the next acquisition.
    /// lapin performs no automatic reconnection, so replacement on the next
    /// call is the sole recovery mechanism.
    async fn establish(&self, scope: &str) -> Result<Arc<Connection>> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.config.client_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        match Connection::connect(&self.config.uri, properties).await {
            Ok(connection) => {
                shutdown::register(&connection, scope);
                info!(scope, "connection established");
                Ok(Arc::new(connection))
            }
            Err(source) => {
                error!(
                    category = shutdown::CONNECTION_CATEGORY,
                    index = shutdown::LOG_INDEX,
                    scope,
                    error = %source,
                    "failed to establish connection"
                );
                Err(BrokerError::Establish {
                    scope: scope.to_string(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_type_semantics() {
        let a = ConnectionType::from("publisher");
        let b = ConnectionType::new("publisher");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "publisher");
        assert_eq!(a.to_string(), "publisher");
        assert_ne!(a, ConnectionType::from("worker-pool-a"));
    }

    #[test]
    fn test_fresh_registry_tracks_nothing() {
        let registry =
            ConnectionRegistry::new(BrokerConfig::new("amqp://localhost:5672/%2f", None));
        assert!(!registry.is_connected());
        assert!(registry.live_default().unwrap().is_none());
        assert!(registry
            .live_pooled(&ConnectionType::from("publisher"))
            .unwrap()
            .is_none());
    }
}
