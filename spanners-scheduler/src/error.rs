use thiserror::Error;

/// Scheduler errors never propagate out of the background loop; this enum
/// exists so internal helpers have something to `?` against before the
/// loop logs and swallows it.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler::start() called more than once")]
    AlreadyStarted,

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persistence(#[from] spanners_common::error::PersistenceError),
}
