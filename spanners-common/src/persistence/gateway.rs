//! Single choke-point over Postgres. Every operation is one transaction:
//! it commits or the whole operation fails with `PersistenceError::Db`.
//! Connections are pooled (`sqlx::PgPool`); reconnecting after a dropped
//! connection is handled by the pool itself via `PgPoolOptions`.

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::PersistenceError;

use super::models::{Job, JobStatus, NewUser, Role, StatusRecord, User};

pub type Result<T> = std::result::Result<T, PersistenceError>;

#[derive(Debug, Clone)]
pub struct JobMeta {
    pub job_id: i64,
    pub user_id: i64,
    pub handler_type: String,
    pub job_name: String,
}

#[derive(Clone)]
pub struct PersistenceGateway {
    pool: PgPool,
}

impl PersistenceGateway {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the embedded migrations against the connected database.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ---- jobs ----

    /// Inserts the job row and its request `Data` row in one transaction,
    /// then patches `jobs.request_id` to point at it.
    pub async fn add_job(
        &self,
        user_id: i64,
        handler_type: &str,
        job_name: &str,
        request_type: i16,
        blob: &[u8],
    ) -> Result<i64> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        let job_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (user_id, handler_type, job_name, status, request_type,
                               time_received, stdout_msg, error_msg)
            VALUES ($1, $2, $3, $4, $5, now(), '', '')
            RETURNING job_id
            "#,
        )
        .bind(user_id)
        .bind(handler_type)
        .bind(job_name)
        .bind(JobStatus::Waiting as i16)
        .bind(request_type)
        .fetch_one(&mut *tx)
        .await?;

        let data_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO data (job_id, type, binary_data)
            VALUES ($1, $2, $3)
            RETURNING data_id
            "#,
        )
        .bind(job_id)
        .bind(request_type)
        .bind(blob)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE jobs SET request_id = $1 WHERE job_id = $2")
            .bind(data_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(job_id)
    }

    /// Sets `starting_time = now(), status = RUNNING`.
    pub async fn set_started(&self, job_id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET starting_time = now(), status = $1 WHERE job_id = $2",
        )
        .bind(JobStatus::Running as i16)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound);
        }
        Ok(())
    }

    /// Sets `end_time = now()` and writes the terminal status and captured
    /// output. Not asserted idempotent: callers must not call this twice.
    pub async fn set_finished(
        &self,
        job_id: i64,
        status: JobStatus,
        stdout: &str,
        stderr: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET end_time = now(), status = $1, stdout_msg = $2, error_msg = $3
            WHERE job_id = $4
            "#,
        )
        .bind(status as i16)
        .bind(stdout)
        .bind(stderr)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts the response `Data` row and updates `response_id` and
    /// `ogdf_runtime`. Must precede `set_finished(SUCCESS)`.
    pub async fn add_response(
        &self,
        job_id: i64,
        response_type: i16,
        blob: &[u8],
        ogdf_runtime_us: i64,
    ) -> Result<()> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        let data_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO data (job_id, type, binary_data)
            VALUES ($1, $2, $3)
            RETURNING data_id
            "#,
        )
        .bind(job_id)
        .bind(response_type)
        .bind(blob)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE jobs SET response_id = $1, ogdf_runtime = $2 WHERE job_id = $3")
            .bind(data_id)
            .bind(ogdf_runtime_us)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Locks up to `n` `WAITING` jobs (ascending by `time_received`, `FOR
    /// UPDATE SKIP LOCKED` so concurrent callers never double-pick a row)
    /// and moves them straight to `RUNNING` in the same statement. The
    /// lock+status-update happen inside one implicit single-statement
    /// transaction, so no other Scheduler instance can observe a row as
    /// still `WAITING` between the pick and the claim — unlike a bare
    /// `SELECT ... FOR UPDATE SKIP LOCKED` followed by a separate `UPDATE`,
    /// whose row lock is released the moment the `SELECT` completes.
    pub async fn get_next_jobs(&self, n: i64) -> Result<Vec<(i64, i64)>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            WITH claimed AS (
                SELECT job_id
                FROM jobs
                WHERE status = $1
                ORDER BY time_received ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = $3, starting_time = now()
            FROM claimed
            WHERE jobs.job_id = claimed.job_id
            RETURNING jobs.job_id, jobs.user_id
            "#,
        )
        .bind(JobStatus::Waiting as i16)
        .bind(n)
        .bind(JobStatus::Running as i16)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_request_data(&self, job_id: i64, user_id: i64) -> Result<(i16, Vec<u8>)> {
        let row: Option<(i16, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT data.type, data.binary_data
            FROM data
            JOIN jobs ON jobs.request_id = data.data_id
            WHERE jobs.job_id = $1 AND jobs.user_id = $2
            "#,
        )
        .bind(job_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(PersistenceError::NotFound)
    }

    pub async fn get_response_data_raw(&self, job_id: i64, user_id: i64) -> Result<(i16, Vec<u8>)> {
        let row: Option<(i16, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT data.type, data.binary_data
            FROM data
            JOIN jobs ON jobs.response_id = data.data_id
            WHERE jobs.job_id = $1 AND jobs.user_id = $2
            "#,
        )
        .bind(job_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(PersistenceError::NotFound)
    }

    pub async fn get_meta_data(&self, job_id: i64, user_id: i64) -> Result<JobMeta> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT handler_type, job_name FROM jobs WHERE job_id = $1 AND user_id = $2",
        )
        .bind(job_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        let (handler_type, job_name) = row.ok_or(PersistenceError::NotFound)?;
        Ok(JobMeta {
            job_id,
            user_id,
            handler_type,
            job_name,
        })
    }

    pub async fn get_job_entries(&self, user_id: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE user_id = $1 ORDER BY time_received ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn get_all_job_entries(&self) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY time_received ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    pub async fn resolve_job_entry(&self, name_or_id: &str) -> Result<Option<Job>> {
        if let Ok(id) = name_or_id.parse::<i64>() {
            let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE job_id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if job.is_some() {
                return Ok(job);
            }
        }
        let job = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE job_name = $1 ORDER BY time_received DESC LIMIT 1",
        )
        .bind(name_or_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// The full job row, scoped to the owning user. Callers that need to
    /// inspect `request_id`/`response_id` directly (rather than just the
    /// `StatusRecord` view) use this instead of `get_status_data`.
    pub async fn get_job(&self, job_id: i64, user_id: i64) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE job_id = $1 AND user_id = $2",
        )
        .bind(job_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        job.ok_or(PersistenceError::NotFound)
    }

    pub async fn get_status_data(&self, job_id: i64, user_id: i64) -> Result<StatusRecord> {
        self.get_job(job_id, user_id).await.map(|job| StatusRecord::from(&job))
    }

    // ---- users ----

    pub async fn create_user(&self, user: NewUser) -> Result<i64> {
        let existing = self.get_user_by_name(&user.name).await?;
        if existing.is_some() {
            return Err(PersistenceError::Duplicate);
        }

        let user_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO users (name, pw_hash, salt, role, blocked)
            VALUES ($1, $2, $3, $4, false)
            RETURNING user_id
            "#,
        )
        .bind(&user.name)
        .bind(&user.pw_hash)
        .bind(&user.salt)
        .bind(user.role as i16)
        .fetch_one(&self.pool)
        .await?;
        Ok(user_id)
    }

    pub async fn get_all_users(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY user_id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    pub async fn get_user_by_name(&self, name: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_id(&self, user_id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn resolve_user(&self, name_or_id: &str) -> Result<Option<User>> {
        if let Ok(id) = name_or_id.parse::<i64>() {
            if let Some(user) = self.get_user_by_id(id).await? {
                return Ok(Some(user));
            }
        }
        self.get_user_by_name(name_or_id).await
    }

    pub async fn set_user_blocked(&self, user_id: i64, blocked: bool) -> Result<()> {
        let result = sqlx::query("UPDATE users SET blocked = $1 WHERE user_id = $2")
            .bind(blocked)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound);
        }
        Ok(())
    }

    pub async fn change_user_role(&self, user_id: i64, role: Role) -> Result<()> {
        let result = sqlx::query("UPDATE users SET role = $1 WHERE user_id = $2")
            .bind(role as i16)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound);
        }
        Ok(())
    }

    pub async fn change_user_auth(&self, user_id: i64, pw_hash: &[u8], salt: &[u8]) -> Result<()> {
        let result = sqlx::query("UPDATE users SET pw_hash = $1, salt = $2 WHERE user_id = $3")
            .bind(pw_hash)
            .bind(salt)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound);
        }
        Ok(())
    }

    /// Marks every `WAITING` job owned by `user_id` as `ABORTED`, returning
    /// the ids of jobs that were `RUNNING` (and therefore still need the
    /// Scheduler to terminate their live child). Step one of the
    /// user-deletion sequence: the caller is expected to call this, then
    /// `Scheduler::cancel_user_jobs`, then `delete_user`.
    pub async fn mark_waiting_jobs_aborted(&self, user_id: i64) -> Result<Vec<i64>> {
        sqlx::query(
            "UPDATE jobs SET status = $1, end_time = now(), error_msg = 'User deleted' \
             WHERE user_id = $2 AND status = $3",
        )
        .bind(JobStatus::Aborted as i16)
        .bind(user_id)
        .bind(JobStatus::Waiting as i16)
        .execute(&self.pool)
        .await?;

        let running: Vec<(i64,)> = sqlx::query_as(
            "SELECT job_id FROM jobs WHERE user_id = $1 AND status = $2",
        )
        .bind(user_id)
        .bind(JobStatus::Running as i16)
        .fetch_all(&self.pool)
        .await?;
        Ok(running.into_iter().map(|(id,)| id).collect())
    }

    /// Deletes the user row (jobs and their data cascade via foreign keys).
    /// A no-op if the user does not exist.
    pub async fn delete_user(&self, user_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes a single job row (its `data` rows cascade), scoped to the
    /// owning user so one user cannot delete another's job by guessing an
    /// id. `NOT_FOUND` if no such job is owned by `user_id`.
    pub async fn delete_job(&self, job_id: i64, user_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_id = $1 AND user_id = $2")
            .bind(job_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound);
        }
        Ok(())
    }

    /// Deletes a job row by id only, for the management plane's `job
    /// delete`, which is not scoped to a single requesting user.
    pub async fn delete_job_admin(&self, job_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound);
        }
        Ok(())
    }

    pub async fn data_size(&self, data_id: i64) -> Result<i64> {
        let size: Option<i64> =
            sqlx::query_scalar("SELECT octet_length(binary_data) FROM data WHERE data_id = $1")
                .bind(data_id)
                .fetch_optional(&self.pool)
                .await?;
        size.ok_or(PersistenceError::NotFound)
    }
}
