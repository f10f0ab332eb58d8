//! Non-upgrade HTTP routes: the index page, the PWA manifest, and the
//! two generated JS snippets that carry session bootstrap data.

use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{header, HeaderMap};
use axum::response::{Html, IntoResponse};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::middleware::client_ip;
use crate::server::AppState;

pub async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    let title = state.factory.name();
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <link rel="manifest" href="manifest.webmanifest">
  <title>{title} - webpty</title>
</head>
<body>
  <div id="terminal"></div>
  <script src="config.js"></script>
  <script src="auth_token.js"></script>
  <script src="webpty.js"></script>
</body>
</html>
"#
    ))
}

pub async fn manifest(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let manifest = json!({
        "name": format!("{} - webpty", state.factory.name()),
        "short_name": "webpty",
        "start_url": state.path_prefix,
        "display": "standalone",
        "background_color": "#000000",
    });
    (
        [(header::CONTENT_TYPE, "application/manifest+json")],
        manifest.to_string(),
    )
}

/// Feature flags and the query arguments the client should replay in
/// its init message.
pub async fn config_js(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let args = js_quote(query.as_deref().unwrap_or_default());
    let body = format!(
        "var gotty_ws_query_args = '{args}';\nvar gotty_webtransport_enabled = {};\n",
        state.options.enable_webtransport
    );
    ([(header::CONTENT_TYPE, "text/javascript")], body)
}

/// The auth token issued for this authenticated HTTP client, presented
/// back during the transport handshake.
pub async fn auth_token_js(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = client_ip(&headers, &addr);
    let token = state.issue_auth_token(&ip).unwrap_or_default();
    let body = format!("var gotty_auth_token = '{}';\n", js_quote(&token));
    ([(header::CONTENT_TYPE, "text/javascript")], body)
}

fn js_quote(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\'', "\\'")
}
