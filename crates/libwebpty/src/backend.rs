use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use webpty_protocol::TmuxCommand;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn backend: {0}")]
    Spawn(String),

    #[error("backend closed")]
    Closed,

    #[error("unsupported command: {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The process side of a session, typically a shell behind a PTY.
///
/// Ownership transfers to the session on creation; the session is the
/// only reader and writer for the backend's lifetime.
#[async_trait]
pub trait Slave: Send + Sync {
    /// Next chunk of backend output, or `None` once the process has
    /// exited and the PTY drained.
    async fn read_output(&self) -> Option<Vec<u8>>;

    fn write_input(&self, data: &[u8]) -> Result<(), BackendError>;

    fn resize_terminal(&self, columns: u16, rows: u16) -> Result<(), BackendError>;

    /// Passthrough for tmux commands. Backends without multiplexer
    /// support reject these.
    fn handle_command(&self, command: TmuxCommand) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(format!("{command:?}")))
    }

    /// Variables available to the window-title template.
    fn window_title_variables(&self) -> HashMap<String, serde_json::Value>;

    /// Terminate the backend process. Idempotent.
    fn close(&self);
}

/// Creates one backend per accepted session.
#[async_trait]
pub trait Factory: Send + Sync {
    fn name(&self) -> &str;

    /// `params` is the parsed query-string argument map from the init
    /// message (empty unless permit-arguments is enabled); `headers`
    /// carries the headers of the upgrade request that produced the
    /// session.
    async fn create(
        &self,
        params: &HashMap<String, Vec<String>>,
        headers: &HashMap<String, Vec<String>>,
    ) -> Result<Arc<dyn Slave>, BackendError>;
}
