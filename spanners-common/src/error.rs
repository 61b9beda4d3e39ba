use thiserror::Error;

/// Errors from the wire-protocol framing and parsing layer (client I/O).
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("parse error: {0}")]
    Parse(String),
}

/// Errors from the Persistence Gateway.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("not found")]
    NotFound,

    #[error("user already exists")]
    Duplicate,
}

/// Errors from password hashing and verification.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("unknown user")]
    UnknownUser,

    #[error("wrong password")]
    WrongPassword,

    #[error("user is blocked")]
    Blocked,

    #[error("key-derivation failure: {0}")]
    Kdf(String),
}

/// Errors from the management plane, collapsed to the three wire strings a
/// reply's `status` field carries.
#[derive(Error, Debug)]
pub enum ManagementError {
    #[error("malformed request")]
    Malformed,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ManagementError {
    /// Wraps any displayable failure (persistence, scheduler) as an
    /// `internal-error` reply.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        ManagementError::Internal(err.to_string())
    }

    pub fn status(&self) -> &'static str {
        match self {
            ManagementError::Malformed => "malformed-request-error",
            ManagementError::InvalidArgument => "invalid-argument-error",
            ManagementError::Internal(_) => "internal-error",
        }
    }
}

/// Errors from loading and validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write default config file {path}: {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("missing required option: {0}")]
    Missing(String),

    #[error("could not determine a config directory")]
    NoConfigHome,
}
