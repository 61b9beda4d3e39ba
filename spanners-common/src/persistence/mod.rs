pub mod gateway;
pub mod models;

pub use gateway::PersistenceGateway;
pub use models::{Job, JobStatus, NewUser, Role, StatusRecord, User};
