//! Short-lived opaque tokens bridging HTTP basic auth to the
//! transport handshake.
//!
//! A token is issued once the client has passed basic auth and is
//! embedded in the served `auth_token.js`, so the WebSocket or
//! WebTransport handshake can present it without re-sending the
//! password.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use webpty_protocol::AUTH_TOKEN_LENGTH;

struct TokenInfo {
    expires_at: Instant,
    ip: Option<String>,
}

pub struct AuthTokenStore {
    tokens: Mutex<HashMap<String, TokenInfo>>,
    ttl: Duration,
}

impl AuthTokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Issue a fresh token, optionally bound to a client IP.
    pub fn issue(&self, ip: Option<&str>) -> String {
        let mut tokens = self.tokens.lock().expect("token store lock poisoned");
        let now = Instant::now();
        tokens.retain(|_, info| info.expires_at > now);

        loop {
            let token = generate_token();
            if tokens.contains_key(&token) {
                continue;
            }
            tokens.insert(
                token.clone(),
                TokenInfo {
                    expires_at: now + self.ttl,
                    ip: ip.map(str::to_string),
                },
            );
            return token;
        }
    }

    /// A token validates while it exists, is unexpired, and matches the
    /// issuing IP when one was bound at issue time.
    pub fn validate(&self, token: &str, ip: Option<&str>) -> bool {
        if token.is_empty() {
            return false;
        }

        let mut tokens = self.tokens.lock().expect("token store lock poisoned");
        let now = Instant::now();
        tokens.retain(|_, info| info.expires_at > now);

        let Some(info) = tokens.get(token) else {
            return false;
        };
        match (&info.ip, ip) {
            (Some(bound), Some(seen)) if !bound.is_empty() && !seen.is_empty() => bound == seen,
            _ => true,
        }
    }

}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTH_TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Extract the host portion of a `host:port` style address.
pub fn ip_from_addr(addr: &str) -> String {
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        return sock.ip().to_string();
    }
    addr.trim().to_string()
}
