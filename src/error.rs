use thiserror::Error;

#[derive(Debug, Error)]
pub enum QosError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled: connection closed")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),
}
