use thiserror::Error;

/// Errors raised while executing a report job.
///
/// The stage variants carry the failing stage's message unchanged; that text
/// becomes the `error_log` of the terminal execution update.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    ReportFetch(String),

    #[error("{0}")]
    Connection(String),

    #[error("{0}")]
    Query(String),

    #[error("{0}")]
    Encoding(String),

    #[error("{0}")]
    Delivery(String),

    #[error("execution timed out after {0} seconds")]
    Timeout(u64),

    #[error("execution cancelled")]
    Cancelled,

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("{0}")]
    StatusUpdate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
