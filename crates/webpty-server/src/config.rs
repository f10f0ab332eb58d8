use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;

/// Server options, one flag per externally facing input.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "webpty-server",
    about = "Share a terminal as a web application over WebSocket or WebTransport"
)]
pub struct Options {
    /// IP address to listen on.
    #[arg(long, short = 'a', default_value = "0.0.0.0")]
    pub address: String,

    /// Port to listen on.
    #[arg(long, short = 'p', default_value_t = 8080)]
    pub port: u16,

    /// URL path prefix to serve under.
    #[arg(long, default_value = "/")]
    pub path: String,

    /// Serve under a randomized URL prefix instead of --path.
    #[arg(long)]
    pub random_url: bool,

    /// Length of the randomized URL prefix.
    #[arg(long, default_value_t = 8)]
    pub random_url_length: usize,

    /// Enable TLS on the HTTP listener.
    #[arg(long)]
    pub enable_tls: bool,

    /// TLS certificate chain (PEM).
    #[arg(long)]
    pub tls_crt: Option<PathBuf>,

    /// TLS private key (PEM).
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Require client certificates signed by --tls-ca-crt.
    #[arg(long)]
    pub enable_tls_client_auth: bool,

    /// CA bundle for client certificate verification (PEM).
    #[arg(long)]
    pub tls_ca_crt: Option<PathBuf>,

    /// Also accept WebTransport (HTTP/3) sessions on the same port over UDP.
    #[arg(long)]
    pub enable_webtransport: bool,

    /// Enable basic auth with this credential (format: user:pass).
    #[arg(long, short = 'c')]
    pub credential: Option<String>,

    /// Disable authentication even when a credential is configured.
    #[arg(long)]
    pub no_auth: bool,

    /// Bind issued auth tokens to the requesting IP. Leave off behind
    /// reverse proxies that aggregate clients.
    #[arg(long)]
    pub auth_ip_binding: bool,

    /// Permit clients to write to the terminal.
    #[arg(long, short = 'w')]
    pub permit_write: bool,

    /// Permit clients to pass command arguments in the init message.
    #[arg(long)]
    pub permit_arguments: bool,

    /// Maximum concurrent connections (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub max_connections: usize,

    /// Advertise a reconnect hint to clients.
    #[arg(long)]
    pub enable_reconnect: bool,

    /// Seconds clients should wait before reconnecting.
    #[arg(long, default_value_t = 10)]
    pub reconnect_time: u32,

    /// Fixed terminal width (0 = client controlled).
    #[arg(long, default_value_t = 0)]
    pub width: u16,

    /// Fixed terminal height (0 = client controlled).
    #[arg(long, default_value_t = 0)]
    pub height: u16,

    /// Window title template; {command}, {argv} and {hostname} are
    /// substituted per session.
    #[arg(long, default_value = "{command}@{hostname}")]
    pub title_format: String,

    /// Regular expression of origins accepted on upgrade; defaults to
    /// same-origin checking.
    #[arg(long)]
    pub ws_origin: Option<String>,

    /// Maximum protocol message size advertised to clients.
    #[arg(long, default_value_t = webpty_protocol::DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Opaque preferences JSON forwarded to clients verbatim.
    #[arg(long)]
    pub preferences: Option<String>,

    /// Seconds shutdown waits after the last session before returning.
    #[arg(long, default_value_t = 0)]
    pub drain_time: u64,

    /// Accept a single session, then exit.
    #[arg(long)]
    pub once: bool,

    /// Command to run, with its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Options {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.path.starts_with('/') {
            bail!("--path must start with '/'");
        }
        if self.enable_tls && (self.tls_crt.is_none() || self.tls_key.is_none()) {
            bail!("--enable-tls requires --tls-crt and --tls-key");
        }
        if self.enable_tls_client_auth && self.tls_ca_crt.is_none() {
            bail!("--enable-tls-client-auth requires --tls-ca-crt");
        }
        if self.enable_webtransport && !self.enable_tls {
            bail!("--enable-webtransport requires TLS");
        }
        if let Some(credential) = &self.credential {
            if !credential.contains(':') {
                bail!("--credential must use the form user:pass");
            }
        }
        if self.random_url && self.random_url_length == 0 {
            bail!("--random-url-length must be positive");
        }
        if self.buffer_size < 2 {
            bail!("--buffer-size is too small to carry a message");
        }
        if let Some(preferences) = &self.preferences {
            serde_json::from_str::<serde_json::Value>(preferences)
                .context("--preferences must be valid JSON")?;
        }
        Ok(())
    }

    /// The command to spawn and its arguments; defaults to the login
    /// shell.
    pub fn command_line(&self) -> (String, Vec<String>) {
        match self.command.split_first() {
            Some((command, args)) => (command.clone(), args.to_vec()),
            None => (
                std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string()),
                Vec::new(),
            ),
        }
    }

    /// Initial terminal geometry handed to the backend factory.
    pub fn terminal_size(&self) -> (u16, u16) {
        let columns = if self.width > 0 { self.width } else { 80 };
        let rows = if self.height > 0 { self.height } else { 24 };
        (columns, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Options {
        Options::parse_from(["webpty-server"])
    }

    #[test]
    fn defaults_validate() {
        base().validate().unwrap();
    }

    #[test]
    fn webtransport_requires_tls() {
        let mut options = base();
        options.enable_webtransport = true;
        assert!(options.validate().is_err());

        options.enable_tls = true;
        options.tls_crt = Some("cert.pem".into());
        options.tls_key = Some("key.pem".into());
        options.validate().unwrap();
    }

    #[test]
    fn tls_requires_cert_and_key() {
        let mut options = base();
        options.enable_tls = true;
        assert!(options.validate().is_err());
    }

    #[test]
    fn credential_shape_is_checked() {
        let mut options = base();
        options.credential = Some("no-separator".to_string());
        assert!(options.validate().is_err());
        options.credential = Some("user:pass".to_string());
        options.validate().unwrap();
    }

    #[test]
    fn preferences_must_be_json() {
        let mut options = base();
        options.preferences = Some("{nope".to_string());
        assert!(options.validate().is_err());
        options.preferences = Some(r#"{"fontSize": 14}"#.to_string());
        options.validate().unwrap();
    }

    #[test]
    fn command_line_defaults_to_a_shell() {
        let (command, args) = base().command_line();
        assert!(!command.is_empty());
        assert!(args.is_empty());

        let options = Options::parse_from(["webpty-server", "tmux", "new", "-A"]);
        assert_eq!(options.command_line(), ("tmux".to_string(), vec!["new".to_string(), "-A".to_string()]));
    }

    #[test]
    fn trailing_command_flags_are_not_swallowed() {
        let options = Options::parse_from(["webpty-server", "--permit-write", "bash", "-l"]);
        assert!(options.permit_write);
        assert_eq!(options.command_line(), ("bash".to_string(), vec!["-l".to_string()]));
    }
}
