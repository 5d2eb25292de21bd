use thiserror::Error;

/// Failure of a single transfer attempt. Kept separate from [`UploadError`]
/// so transport implementations other than HTTP can fail without a
/// `reqwest::Error` in hand.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("message bus closed")]
    BusClosed,

    #[error("executor is not running")]
    ExecutorStopped,

    #[error("task failed: {0}")]
    TaskFailed(String),
}
