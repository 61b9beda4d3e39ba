use thiserror::Error;

/// Worker errors never propagate to a caller: failures are either captured
/// by the DB write in the worker itself or inferred by the Scheduler from
/// the exit code. `main` matches on these only to decide which exit code to
/// return.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("malformed argv")]
    BadArgs,

    #[error("failed to set address-space limit: {0}")]
    Rlimit(#[source] std::io::Error),

    #[error("persistence error: {0}")]
    Persistence(#[from] spanners_common::error::PersistenceError),

    #[error("handler {0:?} is not registered")]
    UnknownHandler(String),
}
