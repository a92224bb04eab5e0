//! WebSocket retro client.
//!
//! Connects to `/ws/retro/<roomId>/`, sends typed [`ClientMessage`]s and
//! yields decoded [`ServerMessage`]s on a channel. Used by the integration
//! tests and handy for scripting a room from a terminal.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, ProtocolError, RoomId, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the retro client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A message from the server
    Message(ServerMessage),
    /// Connection lost
    Disconnected,
}

pub struct RetroClient {
    room: RoomId,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl RetroClient {
    /// `server_url` is the base, e.g. `ws://127.0.0.1:9090`.
    pub fn new(server_url: impl Into<String>, room: RoomId) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            room,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), self.room.path())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.url()).await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.url());
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode server messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(decoded) => {
                            if event_tx.send(ClientEvent::Message(decoded)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        log::debug!("Connected to room {}", self.room);
        Ok(())
    }

    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        self.send_raw(msg.encode()?).await
    }

    /// Send a text frame as-is, without encoding.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(text.into())
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection. Pending frames are flushed first.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }
}
