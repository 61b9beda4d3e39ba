use thiserror::Error;

/// Top-level error a client connection task catches into before translating
/// it to an error frame on the wire: every failure is caught at the top of
/// the connection task, translated to an error frame on the client socket,
/// then the connection closes.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Protocol(#[from] spanners_common::error::ProtocolError),

    #[error(transparent)]
    Persistence(#[from] spanners_common::error::PersistenceError),

    #[error(transparent)]
    Auth(#[from] spanners_common::error::AuthError),

    #[error("user already exists")]
    UserCreation,

    #[error("request rejected: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Scheduler(#[from] spanners_scheduler::SchedulerError),
}

impl ServerError {
    /// The `MetaData.type`/error-tag string a client-facing `ErrorMessage`
    /// carries for this failure.
    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::Protocol(_) => "PARSE",
            ServerError::Persistence(spanners_common::error::PersistenceError::NotFound) => {
                "NOT_FOUND"
            }
            ServerError::Persistence(_) => "DB_ERROR",
            ServerError::Auth(_) => "AUTH",
            ServerError::UserCreation => "USER_CREATION",
            ServerError::InvalidRequest(_) => "INVALID_REQUEST",
            ServerError::Scheduler(_) => "INTERNAL",
        }
    }

    /// The human-readable `message` carried alongside `error_type`. Most
    /// variants just reuse their `Display` text; USER_CREATION uses a fixed
    /// client-facing wording instead of the internal
    /// `PersistenceError::Duplicate` message.
    pub fn message(&self) -> String {
        match self {
            ServerError::UserCreation => "User already exists.".to_owned(),
            other => other.to_string(),
        }
    }
}
