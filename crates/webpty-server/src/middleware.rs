//! HTTP middleware chain: server header, access log, and basic auth
//! with brute-force rate limiting.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::server::AppState;

pub async fn fix_headers(req: Request, next: Next) -> Response {
    let mut res = next.run(req).await;
    res.headers_mut()
        .insert(header::SERVER, HeaderValue::from_static("webpty"));
    res
}

pub async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let res = next.run(req).await;

    info!(
        %method,
        path,
        status = res.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    res
}

/// The client IP used for rate limiting and token binding: the first
/// `X-Forwarded-For` hop when present, otherwise the socket address.
pub fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    addr.ip().to_string()
}

pub async fn basic_auth(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(req.headers(), &addr);

    if let Some((remaining, dimension)) = state.rate_limiter.check_locked(&ip) {
        warn!(%ip, %dimension, remaining_s = remaining.as_secs(), "auth attempt while locked out");
        let mut res = (
            StatusCode::TOO_MANY_REQUESTS,
            "too many failed authentication attempts\n",
        )
            .into_response();
        res.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from(remaining.as_secs().max(1)),
        );
        return res;
    }

    let expected = state.options.credential.as_deref().unwrap_or_default();
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "));

    match provided {
        // A request with no credentials is still a failed attempt;
        // otherwise probes without the header never count toward lockout.
        None => {
            state.rate_limiter.record_failure(&ip);
            unauthorized()
        }
        Some(encoded) => match BASE64.decode(encoded) {
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            Ok(decoded) if decoded == expected.as_bytes() => {
                state.rate_limiter.record_success(&ip);
                next.run(req).await
            }
            Ok(_) => {
                state.rate_limiter.record_failure(&ip);
                warn!(%ip, "basic auth failure");
                unauthorized()
            }
        },
    }
}

fn unauthorized() -> Response {
    let mut res = (StatusCode::UNAUTHORIZED, "authentication required\n").into_response();
    res.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"webpty\""),
    );
    res
}
