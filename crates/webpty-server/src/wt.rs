//! WebTransport realization of the transport contract.
//!
//! QUIC streams are plain byte streams, so message boundaries are
//! imposed with a 2-byte big-endian length prefix:
//!
//! ```text
//! ┌── 2 bytes ──┐┌──── N bytes ────┐
//! │ length (BE) ││     payload     │
//! └─────────────┘└─────────────────┘
//! ```
//!
//! The endpoint shares the HTTP host and port over UDP and accepts one
//! bidirectional stream per session.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wtransport::endpoint::IncomingSession;
use wtransport::{Connection, Endpoint, Identity, RecvStream, SendStream, ServerConfig, VarInt};

use libwebpty::{Transport, TransportError};
use webpty_protocol::WEBTRANSPORT_MAX_FRAME;

use crate::server::AppState;
use crate::session;
use crate::ws::origin_allowed;

/// Prefix a payload with its 2-byte big-endian length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > WEBTRANSPORT_MAX_FRAME {
        return Err(TransportError::MessageTooLarge {
            size: payload.len(),
            limit: WEBTRANSPORT_MAX_FRAME,
        });
    }
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split a frame produced by `encode_frame` back into its payload.
/// Returns `None` when the buffer is truncated.
pub fn decode_frame(frame: &[u8]) -> Option<&[u8]> {
    let (header, rest) = frame.split_first_chunk::<2>()?;
    let length = u16::from_be_bytes(*header) as usize;
    (rest.len() == length).then_some(rest)
}

pub struct WtTransport {
    connection: Connection,
    send: tokio::sync::Mutex<SendStream>,
    recv: tokio::sync::Mutex<RecvStream>,
}

impl WtTransport {
    pub fn new(connection: Connection, send: SendStream, recv: RecvStream) -> Self {
        Self {
            connection,
            send: tokio::sync::Mutex::new(send),
            recv: tokio::sync::Mutex::new(recv),
        }
    }
}

async fn read_full(stream: &mut RecvStream, buf: &mut [u8]) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]).await {
            Ok(Some(n)) => filled += n,
            Ok(None) => return Err(TransportError::PeerClosed),
            Err(e) => return Err(TransportError::Io(e.to_string())),
        }
    }
    Ok(())
}

#[async_trait]
impl Transport for WtTransport {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut stream = self.recv.lock().await;

        let mut header = [0u8; 2];
        read_full(&mut stream, &mut header).await?;
        let length = u16::from_be_bytes(header) as usize;

        if length > buf.len() {
            return Err(TransportError::MessageTooLarge {
                size: length,
                limit: buf.len(),
            });
        }
        read_full(&mut stream, &mut buf[..length]).await?;
        Ok(length)
    }

    async fn send(&self, msg: &[u8]) -> Result<(), TransportError> {
        let frame = encode_frame(msg)?;
        // Header and payload go out under one lock acquisition so two
        // concurrent writers cannot interleave bytes on the stream.
        self.send
            .lock()
            .await
            .write_all(&frame)
            .await
            .map_err(|_| TransportError::PeerClosed)
    }

    async fn close(&self) {
        let _ = self.send.lock().await.finish().await;
        self.connection.close(VarInt::from_u32(0), b"");
    }

    fn remote_addr(&self) -> String {
        self.connection.remote_address().to_string()
    }
}

/// Bind the UDP endpoint. Failures here are startup failures.
pub fn bind(addr: SocketAddr, identity: Identity) -> anyhow::Result<Endpoint<wtransport::endpoint::endpoint_side::Server>> {
    let config = ServerConfig::builder()
        .with_bind_address(addr)
        .with_identity(identity)
        .build();
    let endpoint = Endpoint::server(config)?;
    info!(%addr, "webtransport endpoint listening (UDP)");
    Ok(endpoint)
}

/// Accept loop for the WebTransport endpoint. Runs until the server's
/// shutdown token fires.
pub async fn run_endpoint(
    state: Arc<AppState>,
    endpoint: Endpoint<wtransport::endpoint::endpoint_side::Server>,
) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            incoming = endpoint.accept() => {
                let state = Arc::clone(&state);
                tokio::spawn(handle_incoming(state, incoming));
            }
        }
    }

    info!("webtransport endpoint stopped");
}

async fn handle_incoming(state: Arc<AppState>, incoming: IncomingSession) {
    let request = match incoming.await {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "webtransport session failed before request");
            return;
        }
    };

    let expected = state.webtransport_path();
    if request.path() != expected {
        debug!(path = request.path(), "rejecting webtransport session: unknown path");
        request.not_found().await;
        return;
    }

    let origin = request.headers().get("origin").map(String::as_str);
    let host = request.headers().get(":authority").map(String::as_str);
    if !origin_allowed(origin, host, state.origin_regex.as_ref()) {
        warn!(?origin, "rejecting webtransport session: origin not allowed");
        request.forbidden().await;
        return;
    }

    // Count the connection before accepting the session so an
    // over-capacity client is refused at the CONNECT request instead of
    // after a completed handshake. serve_transport owns the matching
    // done(); the failure paths below release the count themselves.
    let live = state.counter.add();
    let max = state.options.max_connections;
    if max > 0 && live > max as i64 {
        state.counter.done();
        warn!(live, max, "refusing webtransport session: connection limit reached");
        request.too_many_requests().await;
        return;
    }

    let headers: HashMap<String, Vec<String>> = request
        .headers()
        .iter()
        .map(|(name, value)| (name.clone(), vec![value.clone()]))
        .collect();

    let connection = match request.accept().await {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "webtransport accept failed");
            state.counter.done();
            return;
        }
    };
    let remote = connection.remote_address();

    let (send, recv) = match connection.accept_bi().await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(remote = %remote, error = %e, "no bidirectional stream from client");
            connection.close(VarInt::from_u32(0), b"");
            state.counter.done();
            return;
        }
    };

    debug!(remote = %remote, "webtransport session open");
    let transport = Arc::new(WtTransport::new(connection, send, recv));
    session::serve_transport(state, transport, headers).await;
}
