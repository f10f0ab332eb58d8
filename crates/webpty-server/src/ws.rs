//! WebSocket realization of the transport contract.
//!
//! One text WebSocket message carries exactly one protocol message, so
//! framing comes for free. Binary frames from the peer are discarded
//! without surfacing to the engine.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use libwebpty::{Transport, TransportError};
use webpty_protocol::SUBPROTOCOL;

use crate::server::AppState;
use crate::session;

pub struct WsTransport {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    stream: tokio::sync::Mutex<SplitStream<WebSocket>>,
    remote: String,
}

impl WsTransport {
    pub fn new(socket: WebSocket, remote: String) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
            remote,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            let message = match stream.next().await {
                None => return Err(TransportError::PeerClosed),
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                Some(Ok(m)) => m,
            };

            match message {
                Message::Text(text) => {
                    let bytes = text.as_bytes();
                    if bytes.len() > buf.len() {
                        return Err(TransportError::MessageTooLarge {
                            size: bytes.len(),
                            limit: buf.len(),
                        });
                    }
                    buf[..bytes.len()].copy_from_slice(bytes);
                    return Ok(bytes.len());
                }
                Message::Close(_) => return Err(TransportError::PeerClosed),
                // Binary, ping and pong frames are not part of the
                // protocol; skip them so they cannot smuggle input past
                // the decoder.
                _ => continue,
            }
        }
    }

    async fn send(&self, msg: &[u8]) -> Result<(), TransportError> {
        let text = String::from_utf8_lossy(msg).into_owned();
        self.sink
            .lock()
            .await
            .send(Message::text(text))
            .await
            .map_err(|_| TransportError::PeerClosed)
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }
}

/// Decide whether an upgrade request's origin is acceptable.
///
/// With a configured pattern only matching origins pass; otherwise the
/// origin must match the request host (and port, when both carry one).
pub fn origin_allowed(origin: Option<&str>, host: Option<&str>, pattern: Option<&Regex>) -> bool {
    let Some(origin) = origin.filter(|o| !o.is_empty()) else {
        return true;
    };

    if let Some(pattern) = pattern {
        return pattern.is_match(origin);
    }

    let Ok(origin_url) = url::Url::parse(origin) else {
        return false;
    };
    let Some(origin_host) = origin_url.host_str() else {
        return false;
    };
    let Some(request_host) = host else {
        return false;
    };

    let (request_host, request_port) = match request_host.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => (h, Some(p)),
        _ => (request_host, None),
    };

    if !origin_host.eq_ignore_ascii_case(request_host) {
        return false;
    }
    match (origin_url.port(), request_port) {
        (Some(op), Some(rp)) => op.to_string() == rp,
        _ => true,
    }
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if !origin_allowed(origin, host, state.origin_regex.as_ref()) {
        warn!(remote = %addr, ?origin, "rejecting websocket upgrade: origin not allowed");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    // Count the connection before upgrading so an over-capacity client
    // is refused with an unambiguous status instead of a post-upgrade
    // close. serve_transport owns the matching done().
    let live = state.counter.add();
    let max = state.options.max_connections;
    if max > 0 && live > max as i64 {
        state.counter.done();
        warn!(remote = %addr, live, max, "refusing websocket upgrade: connection limit reached");
        return (StatusCode::TOO_MANY_REQUESTS, "connection limit reached").into_response();
    }

    let header_map = header_multimap(&headers);
    debug!(remote = %addr, "websocket upgrade");
    ws.protocols([SUBPROTOCOL]).on_upgrade(move |socket| {
        let transport = Arc::new(WsTransport::new(socket, addr.to_string()));
        session::serve_transport(state, transport, header_map)
    })
}

/// Collect upgrade request headers into the multimap handed to the
/// backend factory. Values that are not valid UTF-8 are dropped.
fn header_multimap(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_origin_is_allowed() {
        assert!(origin_allowed(None, Some("example.com"), None));
        assert!(origin_allowed(Some(""), Some("example.com"), None));
    }

    #[test]
    fn same_origin_comparison() {
        assert!(origin_allowed(
            Some("https://example.com"),
            Some("example.com"),
            None
        ));
        assert!(origin_allowed(
            Some("https://EXAMPLE.com:8443"),
            Some("example.com:8443"),
            None
        ));
        assert!(!origin_allowed(
            Some("https://evil.example"),
            Some("example.com"),
            None
        ));
        assert!(!origin_allowed(
            Some("https://example.com:9000"),
            Some("example.com:8443"),
            None
        ));
    }

    #[test]
    fn port_is_ignored_when_one_side_omits_it() {
        assert!(origin_allowed(
            Some("https://example.com"),
            Some("example.com:443"),
            None
        ));
        assert!(origin_allowed(
            Some("https://example.com:443"),
            Some("example.com"),
            None
        ));
    }

    #[test]
    fn configured_pattern_wins() {
        let pattern = Regex::new(r"^https://.*\.trusted\.example$").unwrap();
        assert!(origin_allowed(
            Some("https://app.trusted.example"),
            Some("elsewhere.com"),
            Some(&pattern)
        ));
        assert!(!origin_allowed(
            Some("https://app.untrusted.example"),
            Some("app.untrusted.example"),
            Some(&pattern)
        ));
    }

    #[test]
    fn garbage_origin_is_rejected() {
        assert!(!origin_allowed(Some("not a url"), Some("example.com"), None));
    }

    #[test]
    fn header_multimap_groups_repeated_headers() {
        use axum::http::HeaderValue;

        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.append("x-forwarded-for", HeaderValue::from_static("10.0.0.2"));
        headers.insert("host", HeaderValue::from_static("example.com"));

        let map = header_multimap(&headers);
        assert_eq!(map["x-forwarded-for"], vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(map["host"], vec!["example.com"]);
    }
}
