use std::path::PathBuf;

/// Errors that can occur when controlling a VM.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("monitor is not connected")]
    NotConnected,

    #[error("monitor connection lost")]
    ConnectionLost,

    #[error("invalid monitor response: {0}")]
    InvalidResponse(String),

    #[error("monitor error {class}: {desc}")]
    Monitor { class: String, desc: String },

    #[error("hypervisor process is not running")]
    ProcessNotRunning,

    #[error("hypervisor process is already running")]
    ProcessAlreadyRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("control socket did not appear at {}", .0.display())]
    SocketCreationFailed(PathBuf),

    #[error("operation timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
