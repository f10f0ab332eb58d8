pub mod backend;
pub mod local_command;
pub mod transport;
pub mod webtty;

pub use backend::{BackendError, Factory, Slave};
pub use local_command::{LocalCommand, LocalCommandFactory};
pub use transport::{Transport, TransportError};
pub use webtty::{EngineError, EngineOptions, WebTty};
