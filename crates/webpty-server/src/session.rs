//! Per-connection pipeline shared by both transports: read the init
//! message, authenticate, spawn the backend, run the engine, and
//! always release resources on the way out.
//!
//! The connection counter is incremented by the upgrade handlers
//! before the handshake completes, so an over-capacity client can be
//! refused without ever being upgraded.

use anyhow::{bail, Context};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use libwebpty::{Transport, WebTty};
use webpty_protocol::InitMessage;

use crate::auth_token::ip_from_addr;
use crate::server::AppState;

/// Run one accepted connection to completion.
///
/// The caller has already counted the connection; the matching
/// `done()` happens here on every exit path.
pub async fn serve_transport(
    state: Arc<AppState>,
    transport: Arc<dyn Transport>,
    headers: HashMap<String, Vec<String>>,
) {
    let remote = transport.remote_addr();

    match run_session(&state, Arc::clone(&transport), &headers).await {
        Ok(()) => info!(remote = %remote, "session closed"),
        Err(e) => warn!(remote = %remote, "session ended: {e:#}"),
    }

    // The engine closes on the normal path; failed handshakes land here
    // with the transport still open. Close is idempotent either way.
    transport.close().await;
    state.counter.done();

    if state.options.once {
        info!("single-session mode: shutting down");
        state.shutdown.cancel();
    }
}

async fn run_session(
    state: &Arc<AppState>,
    transport: Arc<dyn Transport>,
    headers: &HashMap<String, Vec<String>>,
) -> anyhow::Result<()> {
    info!(remote = %transport.remote_addr(), live = state.counter.count(), "new client connected");

    let mut buf = vec![0u8; state.options.buffer_size];
    let n = transport
        .recv(&mut buf)
        .await
        .context("failed to read init message")?;
    let init: InitMessage =
        serde_json::from_slice(&buf[..n]).context("failed to parse init message")?;

    let ip = ip_from_addr(&transport.remote_addr());
    if !state.validate_auth_token(&init.auth_token, &ip) {
        state.rate_limiter.record_failure(&ip);
        bail!("authentication failed for {ip}");
    }

    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    if state.options.permit_arguments && !init.arguments.is_empty() {
        params = parse_arguments(&init.arguments).context("failed to parse arguments")?;
    }

    let slave = state
        .factory
        .create(&params, headers)
        .await
        .context("failed to create backend")?;

    let engine = WebTty::new(transport, slave, state.engine_options());
    engine.run(state.shutdown.child_token()).await?;
    Ok(())
}

/// Parse the init message's query-string shaped arguments.
fn parse_arguments(arguments: &str) -> anyhow::Result<HashMap<String, Vec<String>>> {
    let Some(query) = arguments.strip_prefix('?') else {
        bail!("arguments must be a query string starting with '?'");
    };

    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key.is_empty() {
            continue;
        }
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    Ok(params)
}
