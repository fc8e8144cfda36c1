use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no such session: {0}")]
    NoSuchSession(String),

    #[error("no such worker: {0}")]
    NoSuchWorker(String),

    #[error("unknown {kind} type: {value}")]
    UnknownComponent { kind: &'static str, value: String },

    /// The sender side of a completion future was dropped before a
    /// matching `finish` arrived.
    #[error("completion future for {0} was dropped")]
    CompletionDropped(String),

    /// Only reachable when a completion timeout is configured; waits
    /// are unbounded by default.
    #[error("timed out waiting for completion of {0}")]
    CompletionTimeout(String),

    #[error("result retrieval failed: {0}")]
    Receive(#[from] reqwest::Error),

    /// Failure reported by an external collaborator (instance
    /// provider or manager).
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
