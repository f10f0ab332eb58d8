//! The per-session protocol engine.
//!
//! A `WebTty` owns one transport and one backend for the lifetime of a
//! session. After the orchestrator has read the init message and
//! authenticated the client, the engine emits the fixed handshake
//! control messages and runs two pumps until either side closes, the
//! session context is cancelled, or a fatal protocol error occurs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webpty_protocol::{
    decode_client_message, server, server_message, ClientMessage, Encoding, DEFAULT_BUFFER_SIZE,
};

use crate::backend::{BackendError, Slave};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Snapshot of the server options a session runs with.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Whether client input (tag `1` and tmux passthrough) reaches the backend.
    pub permit_write: bool,
    /// Advertised maximum message size in bytes.
    pub buffer_size: usize,
    /// Seconds the client should wait before reconnecting, when enabled.
    pub reconnect_time: Option<u32>,
    /// Opaque preferences forwarded to the client verbatim.
    pub preferences: serde_json::Value,
    /// Window title template, e.g. `{command}@{hostname}`.
    pub title_format: String,
    /// Server-side title variables merged over the backend's.
    pub title_variables: HashMap<String, serde_json::Value>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            permit_write: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            reconnect_time: None,
            preferences: json!({}),
            title_format: "{command}@{hostname}".to_string(),
            title_variables: HashMap::new(),
        }
    }
}

pub struct WebTty {
    transport: Arc<dyn Transport>,
    slave: Arc<dyn Slave>,
    options: EngineOptions,
    encoding: Arc<Mutex<Encoding>>,
}

impl WebTty {
    pub fn new(transport: Arc<dyn Transport>, slave: Arc<dyn Slave>, options: EngineOptions) -> Self {
        Self {
            transport,
            slave,
            options,
            encoding: Arc::new(Mutex::new(Encoding::Base64)),
        }
    }

    /// Run the session to completion.
    ///
    /// Always closes both the transport and the backend before
    /// returning, exactly once each.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), EngineError> {
        let result = self.stream(&cancel).await;
        self.transport.close().await;
        self.slave.close();
        result
    }

    async fn stream(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        self.send_initial_messages().await?;

        let session = cancel.child_token();
        let output_task = tokio::spawn(output_pump(
            Arc::clone(&self.transport),
            Arc::clone(&self.slave),
            Arc::clone(&self.encoding),
            self.options.buffer_size,
            session.clone(),
        ));

        let result = self.input_pump(&session).await;

        // Unblock the sibling pump and wait for it to settle.
        session.cancel();
        let _ = output_task.await;
        result
    }

    async fn send_initial_messages(&self) -> Result<(), EngineError> {
        let title = self.render_title();
        self.transport
            .send(&server_message(server::SET_WINDOW_TITLE, title.as_bytes()))
            .await?;

        let prefs = serde_json::to_vec(&self.options.preferences).unwrap_or_else(|_| b"{}".to_vec());
        self.transport
            .send(&server_message(server::SET_PREFERENCES, &prefs))
            .await?;

        if let Some(seconds) = self.options.reconnect_time {
            self.transport
                .send(&server_message(
                    server::SET_RECONNECT,
                    seconds.to_string().as_bytes(),
                ))
                .await?;
        }

        self.transport
            .send(&server_message(
                server::SET_BUFFER_SIZE,
                self.options.buffer_size.to_string().as_bytes(),
            ))
            .await?;

        Ok(())
    }

    fn render_title(&self) -> String {
        let mut vars = self.slave.window_title_variables();
        for (key, value) in &self.options.title_variables {
            vars.insert(key.clone(), value.clone());
        }

        let mut title = self.options.title_format.clone();
        for (key, value) in &vars {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            title = title.replace(&format!("{{{key}}}"), &text);
        }
        title
    }

    /// Reads client messages and dispatches them until the peer goes
    /// away, the session is cancelled, or a fatal error occurs.
    async fn input_pump(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let mut buf = vec![0u8; self.options.buffer_size];
        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.transport.recv(&mut buf) => match res {
                    Ok(n) => n,
                    Err(TransportError::PeerClosed) => {
                        info!(remote = %self.transport.remote_addr(), "client closed the connection");
                        return Ok(());
                    }
                    Err(TransportError::MessageTooLarge { size, limit }) => {
                        warn!(size, limit, "client message exceeds advertised buffer size");
                        return Err(TransportError::MessageTooLarge { size, limit }.into());
                    }
                    Err(e) => return Err(e.into()),
                },
            };
            if n == 0 {
                continue;
            }

            let message = match decode_client_message(&buf[..n]) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "malformed client message");
                    continue;
                }
            };

            if message.writes_to_backend() && !self.options.permit_write {
                debug!("dropping client write: write permission not granted");
                continue;
            }

            match message {
                ClientMessage::Input(payload) => {
                    let data = match *self.encoding.lock().expect("encoding lock poisoned") {
                        Encoding::Base64 => match BASE64.decode(payload) {
                            Ok(d) => d,
                            Err(e) => {
                                warn!(error = %e, "undecodable input payload");
                                continue;
                            }
                        },
                        Encoding::Null => payload.to_vec(),
                    };
                    self.slave.write_input(&data)?;
                }
                ClientMessage::Ping => {
                    self.transport.send(&[server::PONG]).await?;
                }
                ClientMessage::ResizeTerminal(resize) => {
                    if let Err(e) = self.slave.resize_terminal(resize.columns, resize.rows) {
                        warn!(error = %e, "resize failed");
                    }
                }
                ClientMessage::SetEncoding(encoding) => {
                    debug!(?encoding, "switching payload encoding");
                    *self.encoding.lock().expect("encoding lock poisoned") = encoding;
                }
                ClientMessage::Tmux(command) => match self.slave.handle_command(command) {
                    Ok(()) => {}
                    Err(BackendError::Unsupported(cmd)) => {
                        debug!(command = %cmd, "backend does not support multiplexer commands");
                    }
                    Err(e) => warn!(error = %e, "multiplexer command failed"),
                },
                ClientMessage::Unknown(tag) => {
                    debug!(tag, "ignoring unknown client message tag");
                }
            }
        }
    }
}

/// Moves backend output to the client until EOF or cancellation.
///
/// A single backend read is split across multiple output messages only
/// when it exceeds the advertised buffer size minus the tag byte; each
/// piece is encoded independently.
async fn output_pump(
    transport: Arc<dyn Transport>,
    slave: Arc<dyn Slave>,
    encoding: Arc<Mutex<Encoding>>,
    buffer_size: usize,
    cancel: CancellationToken,
) {
    let max_chunk = buffer_size.saturating_sub(1).max(1);

    'outer: loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = slave.read_output() => match chunk {
                Some(c) => c,
                None => {
                    info!("backend closed");
                    break;
                }
            },
        };

        for piece in chunk.chunks(max_chunk) {
            let payload = match *encoding.lock().expect("encoding lock poisoned") {
                Encoding::Base64 => BASE64.encode(piece).into_bytes(),
                Encoding::Null => piece.to_vec(),
            };
            if let Err(e) = transport.send(&server_message(server::OUTPUT, &payload)).await {
                debug!(error = %e, "output write failed");
                break 'outer;
            }
        }
    }

    // Release the input pump so teardown can proceed.
    cancel.cancel();
}
