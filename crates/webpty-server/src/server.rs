//! Server lifecycle: one TCP listener for HTTP(S), optionally one UDP
//! endpoint for WebTransport on the same port, a shared middleware
//! chain, and context-based shutdown with a connection drain barrier.

use anyhow::Context;
use axum::middleware;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wtransport::Identity;

use libwebpty::{EngineOptions, Factory};
use webpty_protocol::AUTH_TOKEN_TTL;

use crate::auth_token::AuthTokenStore;
use crate::config::Options;
use crate::counter::ConnectionCounter;
use crate::middleware as mw;
use crate::rate_limit::RateLimiter;
use crate::routes;
use crate::ws;
use crate::wt;

pub struct AppState {
    pub options: Options,
    pub factory: Arc<dyn Factory>,
    pub auth_tokens: AuthTokenStore,
    pub rate_limiter: RateLimiter,
    pub counter: ConnectionCounter,
    pub origin_regex: Option<Regex>,
    pub path_prefix: String,
    pub preferences: serde_json::Value,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn basic_auth_enabled(&self) -> bool {
        self.options.credential.is_some() && !self.options.no_auth
    }

    /// Issue a token for an authenticated HTTP client, or `None` when
    /// basic auth is off and no token is needed.
    pub fn issue_auth_token(&self, ip: &str) -> Option<String> {
        if !self.basic_auth_enabled() {
            return None;
        }
        let bound_ip = self.options.auth_ip_binding.then_some(ip);
        Some(self.auth_tokens.issue(bound_ip))
    }

    /// Accepts unconditionally when basic auth is disabled.
    pub fn validate_auth_token(&self, token: &str, ip: &str) -> bool {
        if !self.basic_auth_enabled() {
            return true;
        }
        let seen_ip = self.options.auth_ip_binding.then_some(ip);
        self.auth_tokens.validate(token, seen_ip)
    }

    pub fn webtransport_path(&self) -> String {
        if self.path_prefix == "/" {
            "/wt".to_string()
        } else {
            format!("{}/wt", self.path_prefix)
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            permit_write: self.options.permit_write,
            buffer_size: self.options.buffer_size,
            reconnect_time: self
                .options
                .enable_reconnect
                .then_some(self.options.reconnect_time),
            preferences: self.preferences.clone(),
            title_format: self.options.title_format.clone(),
            title_variables: HashMap::new(),
        }
    }
}

pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    pub fn new(options: Options, factory: Arc<dyn Factory>) -> anyhow::Result<Self> {
        options.validate()?;

        let origin_regex = options
            .ws_origin
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("invalid --ws-origin pattern")?;

        let preferences = match &options.preferences {
            Some(raw) => serde_json::from_str(raw).context("--preferences must be valid JSON")?,
            None => serde_json::json!({}),
        };

        let path_prefix = if options.random_url {
            format!("/{}", random_prefix(options.random_url_length))
        } else {
            normalize_prefix(&options.path)
        };

        let drain = Duration::from_secs(options.drain_time);
        let state = Arc::new(AppState {
            factory,
            auth_tokens: AuthTokenStore::new(AUTH_TOKEN_TTL),
            rate_limiter: RateLimiter::new(),
            counter: ConnectionCounter::new(drain),
            origin_regex,
            path_prefix,
            preferences,
            shutdown: CancellationToken::new(),
            options,
        });

        Ok(Self { state })
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let state = self.state();
        let addr: SocketAddr = format!("{}:{}", state.options.address, state.options.port)
            .parse()
            .context("invalid listen address")?;

        let app = self.build_router();

        // Ctrl-C cancels the root context; everything else follows.
        {
            let shutdown = state.shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    shutdown.cancel();
                }
            });
        }

        let handle = axum_server::Handle::new();
        {
            let handle = handle.clone();
            let shutdown = state.shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                handle.graceful_shutdown(Some(Duration::from_secs(10)));
            });
        }

        let mut wt_task = None;
        if state.options.enable_webtransport {
            let cert = state.options.tls_crt.clone().context("missing --tls-crt")?;
            let key = state.options.tls_key.clone().context("missing --tls-key")?;
            let identity = Identity::load_pemfiles(&cert, &key)
                .await
                .context("failed to load TLS identity for WebTransport")?;
            let endpoint = wt::bind(addr, identity)?;
            wt_task = Some(tokio::spawn(wt::run_endpoint(Arc::clone(&state), endpoint)));
        }

        let scheme = if state.options.enable_tls { "https" } else { "http" };
        info!(
            url = %format!("{scheme}://{}:{}{}", state.options.address, state.options.port, state.path_prefix),
            command = state.factory.name(),
            "server ready"
        );

        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if state.options.enable_tls {
            let tls = build_rustls_config(&state.options)?;
            let config = RustlsConfig::from_config(Arc::new(tls));
            axum_server::bind_rustls(addr, config)
                .handle(handle)
                .serve(service)
                .await
                .context("https server failed")?;
        } else {
            axum_server::bind(addr)
                .handle(handle)
                .serve(service)
                .await
                .context("http server failed")?;
        }

        // The accept loops are down; wait out in-flight sessions.
        state.shutdown.cancel();
        if let Some(task) = wt_task {
            let _ = task.await;
        }
        state.counter.wait().await;
        info!("all sessions drained");
        Ok(())
    }

    fn build_router(&self) -> Router {
        let state = self.state();

        let mut router = Router::new()
            .route("/", get(routes::index))
            .route("/manifest.webmanifest", get(routes::manifest))
            .route("/config.js", get(routes::config_js))
            .route("/auth_token.js", get(routes::auth_token_js))
            .route("/ws", get(ws::ws_handler))
            .with_state(Arc::clone(&state));

        if state.path_prefix != "/" {
            router = Router::new().nest(&state.path_prefix, router);
        }

        if state.basic_auth_enabled() {
            router = router.layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                mw::basic_auth,
            ));
        }

        router
            .layer(middleware::from_fn(mw::access_log))
            .layer(middleware::from_fn(mw::fix_headers))
    }
}

fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn random_prefix(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn build_rustls_config(options: &Options) -> anyhow::Result<rustls::ServerConfig> {
    let cert_path = options.tls_crt.as_ref().context("missing --tls-crt")?;
    let key_path = options.tls_key.as_ref().context("missing --tls-key")?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()
            .context("failed to read certificate chain")?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))
            .context("failed to read private key")?
            .context("no private key found")?;

    let builder = rustls::ServerConfig::builder();
    let mut config = if options.enable_tls_client_auth {
        let ca_path = options.tls_ca_crt.as_ref().context("missing --tls-ca-crt")?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut BufReader::new(File::open(ca_path)?)) {
            roots.add(cert.context("failed to read CA certificate")?)?;
        }
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("failed to build client certificate verifier")?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    };
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use clap::Parser;
    use libwebpty::{BackendError, Slave};

    struct NullFactory;

    #[async_trait]
    impl Factory for NullFactory {
        fn name(&self) -> &str {
            "null"
        }

        async fn create(
            &self,
            _params: &HashMap<String, Vec<String>>,
            _headers: &HashMap<String, Vec<String>>,
        ) -> Result<Arc<dyn Slave>, BackendError> {
            Err(BackendError::Spawn("null factory".to_string()))
        }
    }

    fn server_with(args: &[&str]) -> Server {
        let argv = [&["webpty-server"], args].concat();
        let options = Options::parse_from(argv);
        Server::new(options, Arc::new(NullFactory)).unwrap()
    }

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix("/app/"), "/app");
        assert_eq!(normalize_prefix("/app"), "/app");
    }

    #[test]
    fn random_url_produces_a_prefix_of_requested_length() {
        let server = server_with(&["--random-url", "--random-url-length", "12"]);
        let prefix = &server.state().path_prefix;
        assert_eq!(prefix.len(), 13);
        assert!(prefix.starts_with('/'));
    }

    #[test]
    fn webtransport_path_follows_the_prefix() {
        assert_eq!(server_with(&[]).state().webtransport_path(), "/wt");
        assert_eq!(
            server_with(&["--path", "/term"]).state().webtransport_path(),
            "/term/wt"
        );
    }

    #[test]
    fn auth_token_validation_tracks_basic_auth_state() {
        let server = server_with(&[]);
        // No basic auth: everything validates, nothing is issued.
        assert!(server.state().validate_auth_token("", "1.2.3.4"));
        assert!(server.state().issue_auth_token("1.2.3.4").is_none());

        let server = server_with(&["--credential", "admin:secret"]);
        let state = server.state();
        assert!(!state.validate_auth_token("", "1.2.3.4"));
        let token = state.issue_auth_token("1.2.3.4").expect("token");
        assert!(state.validate_auth_token(&token, "1.2.3.4"));
    }

    #[test]
    fn ip_binding_is_honored_end_to_end() {
        let server = server_with(&["--credential", "admin:secret", "--auth-ip-binding"]);
        let state = server.state();
        let token = state.issue_auth_token("10.0.0.1").expect("token");
        assert!(state.validate_auth_token(&token, "10.0.0.1"));
        assert!(!state.validate_auth_token(&token, "10.0.0.2"));
    }

    #[test]
    fn engine_options_snapshot_reflects_flags() {
        let server = server_with(&[
            "--permit-write",
            "--enable-reconnect",
            "--reconnect-time",
            "7",
            "--buffer-size",
            "1024",
        ]);
        let opts = server.state().engine_options();
        assert!(opts.permit_write);
        assert_eq!(opts.reconnect_time, Some(7));
        assert_eq!(opts.buffer_size, 1024);
    }
}
