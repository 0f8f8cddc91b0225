use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netstring error: {0}")]
    Netstring(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request queue is full")]
    QueueFull,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MuxError>;
