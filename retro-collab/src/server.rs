//! WebSocket retro server with path-scoped rooms.
//!
//! Architecture:
//! ```text
//! Browser A ──┐  ws://host/ws/retro/<roomId>/
//!             ├── ConnectionManager ── SessionRegistry ── RoomSession ── RoomStore
//! Browser B ──┘          ▲                                    │
//!                        │                                    ▼
//!                        └──────── per-connection outbox ◄── Fanout
//! ```
//!
//! Each socket task reads text frames into the [`ConnectionManager`] and
//! writes whatever lands in its bounded outbox. When the outbox closes the
//! room has dropped the connection as a slow consumer, and the socket is
//! closed too.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use retro_core::{RetroRules, Workspace};

use crate::broadcast::Frame;
use crate::manager::{ConnectionHandle, ConnectionManager};
use crate::protocol::{ProtocolError, RoomId, ServerMessage};
use crate::registry::{EvictionPolicy, IdleTimeout, NeverEvict, RegistryConfig, SessionRegistry};
use crate::session::SessionError;
use crate::storage::{MemoryStore, RocksStore, RoomStore, StoreConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames queued per connection before it counts as a slow consumer
    pub outbound_capacity: usize,
    /// Canvas bounds for initial topic placement
    pub workspace: Workspace,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Create rooms on first connection
    pub auto_create_rooms: bool,
    pub rules: RetroRules,
    /// Evict rooms with no connections after this many idle seconds (None = never)
    pub idle_eviction_secs: Option<u64>,
    /// How often the eviction sweeper runs
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            workspace: Workspace::default(),
            storage_path: None,
            auto_create_rooms: true,
            rules: RetroRules::default(),
            idle_eviction_secs: None,
            sweep_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Registry settings derived from this config.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            rules: self.rules,
            workspace: self.workspace,
            auto_create_rooms: self.auto_create_rooms,
        }
    }

    pub fn eviction_policy(&self) -> Arc<dyn EvictionPolicy> {
        match self.idle_eviction_secs {
            Some(secs) => Arc::new(IdleTimeout(Duration::from_secs(secs))),
            None => Arc::new(NeverEvict),
        }
    }

    /// Open the configured room store.
    pub fn open_store(&self) -> Result<Arc<dyn RoomStore>, SessionError> {
        let store: Arc<dyn RoomStore> = match &self.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(store)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Connections turned away before joining a room
    pub refused_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_actions: u64,
    pub evicted_rooms: u64,
}

/// Inbound frame counters, bumped on every text frame without taking the stats lock.
#[derive(Debug, Default)]
struct Traffic {
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl Traffic {
    fn record(&self, len: usize) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }
}

/// The retro server.
pub struct RetroServer {
    config: ServerConfig,
    manager: Arc<ConnectionManager>,
    stats: Arc<RwLock<ServerStats>>,
    traffic: Arc<Traffic>,
}

impl RetroServer {
    /// Create a server, opening its room store.
    pub fn new(config: ServerConfig) -> Result<Self, SessionError> {
        let store = config.open_store()?;
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an already opened store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn RoomStore>) -> Self {
        let registry = SessionRegistry::new(config.registry_config(), store)
            .with_eviction(config.eviction_policy());
        Self {
            manager: Arc::new(ConnectionManager::new(Arc::new(registry))),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            traffic: Arc::new(Traffic::default()),
            config,
        }
    }

    /// Create with default configuration (in-memory, auto-created rooms).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.manager.registry()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Start listening for WebSocket connections.
    ///
    /// Loads stored rooms, starts the eviction sweeper if configured, then
    /// runs the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), BoxError> {
        let recovered = self.registry().recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} rooms from storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Retro server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Run the accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        if self.config.idle_eviction_secs.is_some() {
            self.spawn_sweeper();
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let manager = self.manager.clone();
            let stats = self.stats.clone();
            let traffic = self.traffic.clone();
            let capacity = self.config.outbound_capacity;

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, manager, stats, traffic, capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_sweeper(&self) {
        let registry = self.registry().clone();
        let stats = self.stats.clone();
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle().await;
                if !evicted.is_empty() {
                    let mut s = stats.write().await;
                    s.evicted_rooms += evicted.len() as u64;
                    s.active_rooms = registry.room_count().await;
                }
            }
        });
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        manager: Arc<ConnectionManager>,
        stats: Arc<RwLock<ServerStats>>,
        traffic: Arc<Traffic>,
        capacity: usize,
    ) -> Result<(), BoxError> {
        let mut path = String::new();
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        })
        .await?;

        log::info!("WebSocket connection established from {addr} on {path}");
        stats.write().await.total_connections += 1;

        let (outbox, outbound) = mpsc::channel::<Frame>(capacity);
        let opened = match RoomId::from_path(&path) {
            Ok(room) => manager.open(&room, outbox).await,
            Err(e) => Err(SessionError::Protocol(e)),
        };
        let handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("Refusing {addr} on {path}: {e}");
                stats.write().await.refused_connections += 1;
                let reply = ServerMessage::error(e.code(), &e).encode()?;
                ws.send(Message::text(reply)).await?;
                ws.close(None).await?;
                return Ok(());
            }
        };

        {
            let mut s = stats.write().await;
            s.active_connections += 1;
            s.active_rooms = manager.registry().room_count().await;
        }

        let room = handle.room().clone();
        let result = Self::pump(&mut ws, &manager, &handle, outbound, &traffic).await;
        manager.close(handle).await;

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.rejected_actions = manager.rejected_count();
        }
        log::info!("Connection from {addr} left room {room}");
        result
    }

    /// Shuttle frames between the socket and the room until either side ends.
    async fn pump(
        ws: &mut WebSocketStream<TcpStream>,
        manager: &ConnectionManager,
        handle: &ConnectionHandle,
        mut outbound: mpsc::Receiver<Frame>,
        traffic: &Traffic,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws.split();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            traffic.record(text.len());
                            // Rejections are already reported to the client
                            if let Err(e) = manager.receive(handle, text.as_str()).await {
                                log::debug!("{} action failed: {e}", handle.id());
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            let error = ProtocolError::MalformedMessage("binary frames are not supported".into());
                            manager.reject(handle, error).await;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("{} closed by peer", handle.id());
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error on {}: {e}", handle.id());
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room frame
                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::text(frame.to_string())).await?;
                        }
                        None => {
                            log::warn!("{} dropped by room {}", handle.id(), handle.room());
                            let _ = ws_sender.close().await;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry().room_count().await;
        stats.rejected_actions = self.manager.rejected_count();
        stats.total_messages = self.traffic.messages.load(Ordering::Relaxed);
        stats.total_bytes = self.traffic.bytes.load(Ordering::Relaxed);
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
