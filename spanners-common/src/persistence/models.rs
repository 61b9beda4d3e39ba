//! Row types for the three persistent tables (`users`, `jobs`, `data`).
//! Enums are encoded as `SMALLINT` on the wire to avoid Postgres schema
//! coupling (no native Postgres enum types).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum Role {
    User = 0,
    Admin = 1,
}

impl From<i16> for Role {
    fn from(value: i16) -> Self {
        match value {
            1 => Role::Admin,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum JobStatus {
    Waiting = 0,
    Running = 1,
    Success = 2,
    Failed = 3,
    Aborted = 4,
    Unknown = 5,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Aborted
        )
    }
}

impl From<i16> for JobStatus {
    fn from(value: i16) -> Self {
        match value {
            0 => JobStatus::Waiting,
            1 => JobStatus::Running,
            2 => JobStatus::Success,
            3 => JobStatus::Failed,
            4 => JobStatus::Aborted,
            _ => JobStatus::Unknown,
        }
    }
}

/// A user account. Password material (`pw_hash`, `salt`) never leaves
/// persistence except inside `Auth::verify`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub user_id: i64,
    pub name: String,
    pub pw_hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub role: i16,
    pub blocked: bool,
}

impl User {
    pub fn role(&self) -> Role {
        Role::from(self.role)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub job_id: i64,
    pub user_id: i64,
    pub handler_type: String,
    pub job_name: String,
    pub status: i16,
    pub request_type: i16,
    pub request_id: Option<i64>,
    pub response_id: Option<i64>,
    pub time_received: DateTime<Utc>,
    pub starting_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub ogdf_runtime: Option<i64>,
    pub stdout_msg: String,
    pub error_msg: String,
}

impl Job {
    pub fn status(&self) -> JobStatus {
        JobStatus::from(self.status)
    }
}

/// Status view returned by `STATUS` and the management plane's `job info`/
/// `job list` commands. Deliberately leaves `binary_data` out — callers that
/// need the payload use `get_request_data`/`get_response_data_raw`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub job_id: i64,
    pub job_name: String,
    pub handler_type: String,
    pub status: JobStatus,
    pub time_received: DateTime<Utc>,
    pub starting_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub ogdf_runtime: Option<i64>,
    pub error_msg: String,
}

impl From<&Job> for StatusRecord {
    fn from(job: &Job) -> Self {
        StatusRecord {
            job_id: job.job_id,
            job_name: job.job_name.clone(),
            handler_type: job.handler_type.clone(),
            status: job.status(),
            time_received: job.time_received,
            starting_time: job.starting_time,
            end_time: job.end_time,
            ogdf_runtime: job.ogdf_runtime,
            error_msg: job.error_msg.clone(),
        }
    }
}

/// A new user submitted to `create_user`.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub pw_hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub role: Role,
}
