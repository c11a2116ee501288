pub mod channel;
pub mod client;
pub mod listener;
pub mod porter;
pub mod protocol;
pub mod router;

pub use client::{IncomingConnection, PorterClient};
pub use porter::Porter;
pub use protocol::{RequestLine, WireProtocol};
pub use router::PathRouter;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PorterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Login refused: {0}")]
    LoginRefused(String),

    #[error("Control channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PorterError>;
