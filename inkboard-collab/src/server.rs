//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── ConnectionRegistry (user → sessions)
//!            ├── handle_connection ─┤
//! Client B ──┘        │             └── Dispatcher ── RoomDirectory (fan-out)
//!                     │                    │
//!                     │                    └── PersistenceQueue ── dyn Storage
//!                     ▼                              (1 consumer)   │
//!                 TokenVerifier                                     ├── MemoryStore
//!                                                                   └── RocksStore
//! ```
//!
//! All shared state lives in [`Services`], built once when the server is
//! created and handed to every connection task behind an `Arc`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::auth::TokenVerifier;
use crate::dispatch::Dispatcher;
use crate::handler::handle_connection;
use crate::queue::{PersistenceQueue, QueueStats, RetryPolicy};
use crate::registry::ConnectionRegistry;
use crate::rooms::{RoomDirectory, RoomStats};
use crate::storage::{MemoryStore, Storage, StorageError};

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:4000";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Shared secret for HS256 handshake tokens
    pub jwt_secret: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Retry policy for failed durable writes
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            jwt_secret: String::new(),
            storage_path: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(port) = lookup("PORT") {
            let port: u16 = parse("PORT", &port)?;
            let host = config
                .bind_addr
                .rsplit_once(':')
                .map_or(config.bind_addr.as_str(), |(host, _)| host);
            config.bind_addr = format!("{host}:{port}");
        }
        if let Some(path) = lookup("STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }

        if let Some(v) = lookup("PERSIST_MAX_ATTEMPTS") {
            let attempts: u32 = parse("PERSIST_MAX_ATTEMPTS", &v)?;
            if attempts == 0 {
                return Err(ConfigError::Invalid {
                    name: "PERSIST_MAX_ATTEMPTS",
                    value: v,
                });
            }
            config.retry.max_attempts = attempts;
        }
        if let Some(v) = lookup("PERSIST_BACKOFF_MS") {
            config.retry.initial_backoff = Duration::from_millis(parse("PERSIST_BACKOFF_MS", &v)?);
        }
        if let Some(v) = lookup("PERSIST_MAX_BACKOFF_MS") {
            config.retry.max_backoff = Duration::from_millis(parse("PERSIST_MAX_BACKOFF_MS", &v)?);
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub rooms: RoomStats,
    pub queue: QueueStats,
}

/// Connection-level counters, updated by every connection task.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    pub(crate) total_connections: AtomicU64,
    pub(crate) active_connections: AtomicU64,
    pub(crate) rejected_handshakes: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) frames_sent: AtomicU64,
}

impl ConnectionCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide services shared by all connection tasks.
pub struct Services {
    verifier: TokenVerifier,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    counters: ConnectionCounters,
}

impl Services {
    pub fn new(verifier: TokenVerifier, dispatcher: Dispatcher) -> Self {
        Self {
            verifier,
            registry: Arc::new(ConnectionRegistry::new()),
            dispatcher,
            counters: ConnectionCounters::default(),
        }
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn counters(&self) -> &ConnectionCounters {
        &self.counters
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    services: Arc<Services>,
    consumer: Option<JoinHandle<()>>,
}

impl CollabServer {
    /// Wire up services over the given storage backend.
    ///
    /// Spawns the persistence consumer, so this must run inside a tokio runtime.
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Self {
        let (queue, consumer) = PersistenceQueue::start(storage, config.retry.clone());
        let dispatcher = Dispatcher::new(Arc::new(RoomDirectory::new()), queue);
        let verifier = TokenVerifier::new(config.jwt_secret.as_bytes());
        Self {
            config,
            services: Arc::new(Services::new(verifier, dispatcher)),
            consumer: Some(consumer),
        }
    }

    /// Open the storage backend named by the configuration and build the server.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let storage: Arc<dyn Storage> = match &config.storage_path {
            #[cfg(feature = "rocks")]
            Some(path) => {
                let store = crate::storage::RocksStore::open(crate::storage::StoreConfig {
                    path: path.clone(),
                    ..crate::storage::StoreConfig::default()
                })?;
                log::info!("Using RocksDB storage at {}", path.display());
                Arc::new(store)
            }
            #[cfg(not(feature = "rocks"))]
            Some(path) => {
                log::warn!(
                    "Storage path {} ignored: built without the `rocks` feature",
                    path.display()
                );
                Arc::new(MemoryStore::new())
            }
            None => {
                log::info!("Using in-memory storage");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(config, storage))
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Collab server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            self.spawn_connection(stream, addr);
        }
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let services = self.services.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, services).await {
                log::error!("Connection error from {addr}: {e}");
            }
        });
    }

    /// Close the persistence queue and wait for the consumer to drain it.
    ///
    /// Jobs submitted after this point are rejected with `QueueClosed`.
    /// The consumer is aborted only if it is still running after `timeout`;
    /// returns whether every admitted job finished.
    pub async fn shutdown(&mut self, timeout: Duration) -> bool {
        self.queue().close();
        let Some(mut consumer) = self.consumer.take() else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut consumer).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::error!("Persistence consumer failed: {e}");
                false
            }
            Err(_) => {
                log::warn!(
                    "Shutting down with {} unpersisted jobs",
                    self.queue().stats().depth
                );
                consumer.abort();
                false
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let counters = self.services.counters();
        ServerStats {
            total_connections: counters.total_connections.load(Ordering::Relaxed),
            active_connections: counters.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: counters.rejected_handshakes.load(Ordering::Relaxed),
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            rooms: self.rooms().stats().await,
            queue: self.queue().stats(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.services.registry()
    }

    pub fn rooms(&self) -> &Arc<RoomDirectory> {
        self.services.dispatcher().rooms()
    }

    pub fn queue(&self) -> &PersistenceQueue {
        self.services.dispatcher().queue()
    }
}
