//! Generic connection lifecycle used by tasks that talk to external systems.
//!
//! Concrete backends (databases, HTTP clients, queues) implement
//! [`ConnectionProvider`]. A task declares the provider it needs when it is
//! registered; the registry acquires a typed [`Connection`] before the call
//! and releases it afterwards. Pooling and reconnects are the provider's
//! concern.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("connection provider '{0}' is not registered")]
    UnknownProvider(String),

    #[error("connection provider '{0}' is not connected")]
    NotConnected(String),

    #[error("connection failed: {0}")]
    Failed(String),

    #[error("connection has unexpected type, expected {expected}")]
    WrongType { expected: &'static str },
}

/// Settings passed to [`ConnectionProvider::connect`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// A live handle to an external system. Tasks downcast it to the concrete
/// type they expect.
pub trait Connection: Send + Sync {
    fn kind(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// Shared connection handle.
pub type ConnectionHandle = Arc<dyn Connection>;

/// Downcast a connection handle to a concrete type.
pub fn downcast_connection<T: Connection + 'static>(
    conn: &ConnectionHandle,
) -> Result<&T, ConnectionError> {
    conn.as_any()
        .downcast_ref::<T>()
        .ok_or(ConnectionError::WrongType {
            expected: std::any::type_name::<T>(),
        })
}

// ---------------------------------------------------------------------------
// ConnectionProvider
// ---------------------------------------------------------------------------

pub trait ConnectionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the backend connection (or pool).
    fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<ConnectionHandle, ConnectionError>> + Send;

    /// Borrow a connection for one task call.
    fn get_connection(
        &self,
    ) -> impl Future<Output = Result<ConnectionHandle, ConnectionError>> + Send;

    /// Return a connection obtained from `get_connection`.
    fn release_connection(&self, conn: ConnectionHandle) -> impl Future<Output = ()> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`ConnectionProvider`].
pub trait ConnectionProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn connect_boxed<'a>(
        &'a self,
        config: &'a ConnectionConfig,
    ) -> BoxFut<'a, Result<ConnectionHandle, ConnectionError>>;

    fn get_connection_boxed(&self) -> BoxFut<'_, Result<ConnectionHandle, ConnectionError>>;

    fn release_connection_boxed(&self, conn: ConnectionHandle) -> BoxFut<'_, ()>;

    fn disconnect_boxed(&self) -> BoxFut<'_, Result<(), ConnectionError>>;
}

impl<T: ConnectionProvider> ConnectionProviderDyn for T {
    fn name(&self) -> &str {
        ConnectionProvider::name(self)
    }

    fn connect_boxed<'a>(
        &'a self,
        config: &'a ConnectionConfig,
    ) -> BoxFut<'a, Result<ConnectionHandle, ConnectionError>> {
        Box::pin(self.connect(config))
    }

    fn get_connection_boxed(&self) -> BoxFut<'_, Result<ConnectionHandle, ConnectionError>> {
        Box::pin(self.get_connection())
    }

    fn release_connection_boxed(&self, conn: ConnectionHandle) -> BoxFut<'_, ()> {
        Box::pin(self.release_connection(conn))
    }

    fn disconnect_boxed(&self) -> BoxFut<'_, Result<(), ConnectionError>> {
        Box::pin(self.disconnect())
    }
}

/// Type-erased connection provider.
#[derive(Clone)]
pub struct BoxConnectionProvider {
    inner: Arc<dyn ConnectionProviderDyn>,
}

impl BoxConnectionProvider {
    pub fn new<T: ConnectionProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Arc::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<ConnectionHandle, ConnectionError> {
        self.inner.connect_boxed(config).await
    }

    pub async fn get_connection(&self) -> Result<ConnectionHandle, ConnectionError> {
        self.inner.get_connection_boxed().await
    }

    pub async fn release_connection(&self, conn: ConnectionHandle) {
        self.inner.release_connection_boxed(conn).await
    }

    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.inner.disconnect_boxed().await
    }
}

impl std::fmt::Debug for BoxConnectionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxConnectionProvider")
            .field("name", &self.name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    pub struct MemoryConnection {
        pub id: usize,
    }

    impl Connection for MemoryConnection {
        fn kind(&self) -> &str {
            "memory"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Hands out numbered connections and records lifecycle calls.
    #[derive(Default)]
    pub struct MemoryProvider {
        next: AtomicUsize,
        pub connected: Mutex<bool>,
        pub log: Mutex<Vec<String>>,
    }

    impl MemoryProvider {
        pub fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl ConnectionProvider for Arc<MemoryProvider> {
        fn name(&self) -> &str {
            "memory"
        }

        async fn connect(
            &self,
            config: &ConnectionConfig,
        ) -> Result<ConnectionHandle, ConnectionError> {
            *self.connected.lock().unwrap() = true;
            self.log.lock().unwrap().push(format!("connect:{}", config.name));
            Ok(Arc::new(MemoryConnection { id: 0 }))
        }

        async fn get_connection(&self) -> Result<ConnectionHandle, ConnectionError> {
            if !*self.connected.lock().unwrap() {
                return Err(ConnectionError::NotConnected("memory".into()));
            }
            let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            self.log.lock().unwrap().push(format!("get:{id}"));
            Ok(Arc::new(MemoryConnection { id }))
        }

        async fn release_connection(&self, conn: ConnectionHandle) {
            let id = downcast_connection::<MemoryConnection>(&conn)
                .map(|c| c.id)
                .unwrap_or(usize::MAX);
            self.log.lock().unwrap().push(format!("release:{id}"));
        }

        async fn disconnect(&self) -> Result<(), ConnectionError> {
            *self.connected.lock().unwrap() = false;
            self.log.lock().unwrap().push("disconnect".into());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MemoryConnection, MemoryProvider};
    use super::*;

    #[tokio::test]
    async fn provider_lifecycle_through_box() {
        let inner = Arc::new(MemoryProvider::default());
        let provider = BoxConnectionProvider::new(Arc::clone(&inner));
        assert_eq!(provider.name(), "memory");

        assert!(matches!(
            provider.get_connection().await,
            Err(ConnectionError::NotConnected(_))
        ));

        provider
            .connect(&ConnectionConfig {
                name: "primary".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let conn = provider.get_connection().await.unwrap();
        assert_eq!(conn.kind(), "memory");
        assert_eq!(downcast_connection::<MemoryConnection>(&conn).unwrap().id, 1);
        provider.release_connection(conn).await;
        provider.disconnect().await.unwrap();

        assert_eq!(inner.log(), ["connect:primary", "get:1", "release:1", "disconnect"]);
    }

    #[test]
    fn connection_config_from_yaml() {
        let config: ConnectionConfig =
            serde_yaml_ng::from_str("name: orders\nkind: postgres\nsettings:\n  pool: 4\n").unwrap();
        assert_eq!(config.kind, "postgres");
        assert_eq!(config.settings["pool"], 4);
    }
}
