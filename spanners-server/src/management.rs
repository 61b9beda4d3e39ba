//! The management server: a local `UnixDatagram` listener accepting one
//! JSON request per datagram, routed to the Persistence Gateway or the
//! Scheduler, replying with one JSON object. Unlike the Client I/O Server,
//! a datagram has no handshake and no length prefix — each recv is already
//! a complete request.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use spanners_common::error::ManagementError;
use spanners_common::management::{ManagementReply, ManagementRequest, RequestKind, UserView};
use spanners_common::persistence::{Job, PersistenceGateway};
use spanners_scheduler::Scheduler;
use tokio::net::UnixDatagram;
use tracing::{info, warn};

/// Runs the accept loop until the process is torn down. Removes a stale
/// socket file left over from an unclean shutdown before binding, matching
/// the usual Unix-datagram-server idiom (`bind` fails with `AddrInUse`
/// otherwise).
pub async fn run(
    socket_path: &Path,
    persistence: PersistenceGateway,
    scheduler: Arc<Scheduler>,
    liveness: Option<health::HealthHandle>,
) -> std::io::Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    let socket = UnixDatagram::bind(socket_path)?;
    info!("management server listening on {}", socket_path.display());

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        if let Some(liveness) = &liveness {
            liveness.report_healthy().await;
        }

        let reply = handle(&buf[..len], &persistence, &scheduler).await;
        let bytes = serde_json::to_vec(&reply)
            .unwrap_or_else(|_| br#"{"status":"internal-error"}"#.to_vec());

        match peer.as_pathname() {
            Some(path) => {
                if let Err(e) = socket.send_to(&bytes, path).await {
                    warn!("failed to reply to management client {path:?}: {e}");
                }
            }
            None => warn!("management datagram from an unbound peer; dropping reply"),
        }
    }
}

async fn handle(
    datagram: &[u8],
    persistence: &PersistenceGateway,
    scheduler: &Scheduler,
) -> ManagementReply {
    let request: ManagementRequest = match serde_json::from_slice(datagram) {
        Ok(req) => req,
        Err(e) => {
            warn!("malformed management request: {e}");
            return ManagementReply::malformed();
        }
    };

    let result = match request.kind {
        RequestKind::User => handle_user(&request.cmd, request.arg, persistence, scheduler).await,
        RequestKind::Job => handle_job(&request.cmd, request.arg, persistence, scheduler).await,
        RequestKind::Scheduler => handle_scheduler(&request.cmd, request.arg, scheduler).await,
    };

    match result {
        Ok(message) => match message {
            Value::Null => ManagementReply::ok_empty(),
            other => ManagementReply::ok(other),
        },
        Err(e) => {
            warn!("management request {:?}/{} failed: {e}", request.kind, request.cmd);
            ManagementReply::failure(e.status(), e.to_string())
        }
    }
}

fn arg_str(arg: &Option<Value>) -> Result<String, ManagementError> {
    match arg {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ManagementError::InvalidArgument),
    }
}

fn arg_u64(arg: &Option<Value>) -> Result<u64, ManagementError> {
    arg.as_ref()
        .and_then(Value::as_u64)
        .ok_or(ManagementError::InvalidArgument)
}

async fn handle_user(
    cmd: &str,
    arg: Option<Value>,
    persistence: &PersistenceGateway,
    scheduler: &Scheduler,
) -> Result<Value, ManagementError> {
    match cmd {
        "list" => {
            let users = persistence
                .get_all_users()
                .await
                .map_err(ManagementError::internal)?;
            let views: Vec<UserView> = users.iter().map(UserView::from).collect();
            Ok(json!(views))
        }

        "info" => {
            let user = resolve_user(&arg_str(&arg)?, persistence).await?;
            let jobs = persistence
                .get_job_entries(user.user_id)
                .await
                .map_err(ManagementError::internal)?;
            let job_views = job_list_entries(persistence, &jobs).await?;
            Ok(json!({ "user": UserView::from(&user), "jobs": job_views }))
        }

        // Passes handles downward rather than having Persistence call back
        // into the Scheduler: mark waiting jobs aborted, then cancel live
        // workers, then delete the row.
        "delete" => {
            let user = resolve_user(&arg_str(&arg)?, persistence).await?;
            persistence
                .mark_waiting_jobs_aborted(user.user_id)
                .await
                .map_err(ManagementError::internal)?;
            scheduler.cancel_user_jobs(user.user_id).await;
            persistence
                .delete_user(user.user_id)
                .await
                .map_err(ManagementError::internal)?;
            Ok(Value::Null)
        }

        "block" | "unblock" => {
            let user = resolve_user(&arg_str(&arg)?, persistence).await?;
            persistence
                .set_user_blocked(user.user_id, cmd == "block")
                .await
                .map_err(ManagementError::internal)?;
            Ok(Value::Null)
        }

        _ => Err(ManagementError::Malformed),
    }
}

async fn handle_job(
    cmd: &str,
    arg: Option<Value>,
    persistence: &PersistenceGateway,
    scheduler: &Scheduler,
) -> Result<Value, ManagementError> {
    match cmd {
        "list" => {
            let jobs = persistence
                .get_all_job_entries()
                .await
                .map_err(ManagementError::internal)?;
            Ok(Value::Array(job_list_entries(persistence, &jobs).await?))
        }

        "info" => {
            let job = resolve_job(&arg_str(&arg)?, persistence).await?;
            job_info_entry(persistence, &job).await
        }

        "delete" => {
            let job = resolve_job(&arg_str(&arg)?, persistence).await?;
            persistence
                .delete_job_admin(job.job_id)
                .await
                .map_err(ManagementError::internal)?;
            Ok(Value::Null)
        }

        "stop" => {
            let job = resolve_job(&arg_str(&arg)?, persistence).await?;
            scheduler
                .cancel_job(job.job_id, job.user_id)
                .await
                .map_err(ManagementError::internal)?;
            Ok(Value::Null)
        }

        _ => Err(ManagementError::Malformed),
    }
}

async fn handle_scheduler(
    cmd: &str,
    arg: Option<Value>,
    scheduler: &Scheduler,
) -> Result<Value, ManagementError> {
    if !matches!(cmd, "time-limit" | "resource-limit" | "process-limit" | "sleep") {
        return Err(ManagementError::Malformed);
    }

    if arg.is_some() {
        let value = arg_u64(&arg)?;
        match cmd {
            "time-limit" => scheduler.set_time_limit(value).await,
            "resource-limit" => scheduler.set_resource_limit(value).await,
            "process-limit" => {
                let limit = u32::try_from(value).map_err(|_| ManagementError::InvalidArgument)?;
                scheduler.set_process_limit(limit).await;
            }
            "sleep" => scheduler.set_sleep(value).await,
            _ => unreachable!(),
        }
    }

    let limits = scheduler.current_limits().await;
    let value = match cmd {
        "time-limit" => limits.time_limit_ms,
        "resource-limit" => limits.resource_limit_bytes,
        "process-limit" => u64::from(limits.process_limit),
        "sleep" => limits.sleep_ms,
        _ => unreachable!(),
    };
    Ok(json!({ cmd: value }))
}

async fn resolve_user(
    name_or_id: &str,
    persistence: &PersistenceGateway,
) -> Result<spanners_common::persistence::User, ManagementError> {
    persistence
        .resolve_user(name_or_id)
        .await
        .map_err(ManagementError::internal)?
        .ok_or(ManagementError::InvalidArgument)
}

async fn resolve_job(
    name_or_id: &str,
    persistence: &PersistenceGateway,
) -> Result<Job, ManagementError> {
    persistence
        .resolve_job_entry(name_or_id)
        .await
        .map_err(ManagementError::internal)?
        .ok_or(ManagementError::InvalidArgument)
}

/// `job list` view: omits `stdout_msg`/`error_msg`, adds the request/
/// response blob sizes in their place.
async fn job_list_entries(
    persistence: &PersistenceGateway,
    jobs: &[Job],
) -> Result<Vec<Value>, ManagementError> {
    let mut entries = Vec::with_capacity(jobs.len());
    for job in jobs {
        entries.push(job_summary(persistence, job).await?);
    }
    Ok(entries)
}

async fn job_summary(persistence: &PersistenceGateway, job: &Job) -> Result<Value, ManagementError> {
    let (request_size, response_size) = data_sizes(persistence, job).await?;
    Ok(json!({
        "job_id": job.job_id,
        "user_id": job.user_id,
        "handler_type": job.handler_type,
        "job_name": job.job_name,
        "status": job.status(),
        "time_received": job.time_received,
        "starting_time": job.starting_time,
        "end_time": job.end_time,
        "ogdf_runtime": job.ogdf_runtime,
        "request_size": request_size,
        "response_size": response_size,
    }))
}

/// `job info` view: the summary plus the captured stdout/stderr messages.
async fn job_info_entry(persistence: &PersistenceGateway, job: &Job) -> Result<Value, ManagementError> {
    let (request_size, response_size) = data_sizes(persistence, job).await?;
    Ok(json!({
        "job_id": job.job_id,
        "user_id": job.user_id,
        "handler_type": job.handler_type,
        "job_name": job.job_name,
        "status": job.status(),
        "time_received": job.time_received,
        "starting_time": job.starting_time,
        "end_time": job.end_time,
        "ogdf_runtime": job.ogdf_runtime,
        "stdout_msg": job.stdout_msg,
        "error_msg": job.error_msg,
        "request_size": request_size,
        "response_size": response_size,
    }))
}

async fn data_sizes(
    persistence: &PersistenceGateway,
    job: &Job,
) -> Result<(Option<i64>, Option<i64>), ManagementError> {
    let request_size = match job.request_id {
        Some(id) => Some(
            persistence
                .data_size(id)
                .await
                .map_err(ManagementError::internal)?,
        ),
        None => None,
    };
    let response_size = match job.response_id {
        Some(id) => Some(
            persistence
                .data_size(id)
                .await
                .map_err(ManagementError::internal)?,
        ),
        None => None,
    };
    Ok((request_size, response_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanners_common::auth;
    use spanners_common::persistence::{NewUser, Role};
    use spanners_scheduler::SchedulerLimits;
    use sqlx::PgPool;

    #[test]
    fn arg_str_accepts_strings_and_numbers() {
        assert_eq!(arg_str(&Some(Value::from("alice"))).unwrap(), "alice");
        assert_eq!(arg_str(&Some(Value::from(7))).unwrap(), "7");
        assert!(arg_str(&None).is_err());
    }

    #[test]
    fn arg_u64_rejects_non_numeric() {
        assert_eq!(arg_u64(&Some(Value::from(500))).unwrap(), 500);
        assert!(arg_u64(&Some(Value::from("500"))).is_err());
        assert!(arg_u64(&None).is_err());
    }

    fn test_scheduler(persistence: PersistenceGateway) -> Arc<Scheduler> {
        Scheduler::new(
            "/bin/does-not-matter",
            "postgres://unused",
            persistence,
            SchedulerLimits {
                process_limit: 1,
                time_limit_ms: 0,
                resource_limit_bytes: 0,
                sleep_ms: 1000,
            },
            None,
        )
    }

    async fn seed_user(persistence: &PersistenceGateway, name: &str) -> i64 {
        let (pw_hash, salt) = auth::hash("hunter2").unwrap();
        persistence
            .create_user(NewUser {
                name: name.to_owned(),
                pw_hash: pw_hash.into_bytes(),
                salt,
                role: Role::User,
            })
            .await
            .unwrap()
    }

    fn request(kind: RequestKind, cmd: &str, arg: Option<Value>) -> Vec<u8> {
        serde_json::to_vec(&json!({ "type": kind, "cmd": cmd, "arg": arg })).unwrap()
    }

    #[sqlx::test(migrations = "../spanners-common/migrations")]
    async fn user_list_and_block_unblock_roundtrip(db: PgPool) {
        let persistence = PersistenceGateway::from_pool(db);
        let scheduler = test_scheduler(persistence.clone());
        seed_user(&persistence, "alice").await;

        let reply = handle(
            &request(RequestKind::User, "list", None),
            &persistence,
            &scheduler,
        )
        .await;
        assert_eq!(reply.status, "ok");
        let message = reply.message.unwrap();
        assert_eq!(message.as_array().unwrap().len(), 1);
        assert_eq!(message[0]["name"], "alice");
        assert_eq!(message[0]["blocked"], false);

        let reply = handle(
            &request(RequestKind::User, "block", Some(Value::from("alice"))),
            &persistence,
            &scheduler,
        )
        .await;
        assert_eq!(reply.status, "ok");

        let user = persistence.get_user_by_name("alice").await.unwrap().unwrap();
        assert!(user.blocked);

        let reply = handle(
            &request(RequestKind::User, "unblock", Some(Value::from("alice"))),
            &persistence,
            &scheduler,
        )
        .await;
        assert_eq!(reply.status, "ok");
        let user = persistence.get_user_by_name("alice").await.unwrap().unwrap();
        assert!(!user.blocked);
    }

    /// `user delete` ordering: WAITING jobs are marked aborted, live
    /// workers are cancelled, then the row itself is removed.
    #[sqlx::test(migrations = "../spanners-common/migrations")]
    async fn user_delete_cascades_waiting_jobs(db: PgPool) {
        let persistence = PersistenceGateway::from_pool(db);
        let scheduler = test_scheduler(persistence.clone());
        let user_id = seed_user(&persistence, "alice").await;
        let job_id = persistence
            .add_job(user_id, "echo", "job-1", 0, b"payload")
            .await
            .unwrap();

        let reply = handle(
            &request(RequestKind::User, "delete", Some(Value::from("alice"))),
            &persistence,
            &scheduler,
        )
        .await;
        assert_eq!(reply.status, "ok");

        assert!(persistence.get_user_by_name("alice").await.unwrap().is_none());
        // The job row is gone too: user_id carries ON DELETE CASCADE.
        assert!(persistence
            .get_status_data(job_id, user_id)
            .await
            .is_err());
    }

    #[sqlx::test(migrations = "../spanners-common/migrations")]
    async fn job_list_and_info_report_blob_sizes(db: PgPool) {
        let persistence = PersistenceGateway::from_pool(db);
        let scheduler = test_scheduler(persistence.clone());
        let user_id = seed_user(&persistence, "alice").await;
        let job_id = persistence
            .add_job(user_id, "echo", "job-1", 0, b"hello")
            .await
            .unwrap();

        let reply = handle(
            &request(RequestKind::Job, "list", None),
            &persistence,
            &scheduler,
        )
        .await;
        let jobs = reply.message.unwrap();
        assert_eq!(jobs.as_array().unwrap().len(), 1);
        assert_eq!(jobs[0]["request_size"], 5);
        assert!(jobs[0].get("stdout_msg").is_none());

        let reply = handle(
            &request(RequestKind::Job, "info", Some(Value::from(job_id))),
            &persistence,
            &scheduler,
        )
        .await;
        let info = reply.message.unwrap();
        assert_eq!(info["request_size"], 5);
        assert_eq!(info["stdout_msg"], "");
    }

    /// `job stop` on a still-WAITING job preemptively aborts it without a
    /// live worker to reap.
    #[sqlx::test(migrations = "../spanners-common/migrations")]
    async fn job_stop_preemptively_aborts_waiting_job(db: PgPool) {
        let persistence = PersistenceGateway::from_pool(db);
        let scheduler = test_scheduler(persistence.clone());
        let user_id = seed_user(&persistence, "alice").await;
        let job_id = persistence
            .add_job(user_id, "echo", "job-1", 0, b"payload")
            .await
            .unwrap();

        let reply = handle(
            &request(RequestKind::Job, "stop", Some(Value::from(job_id))),
            &persistence,
            &scheduler,
        )
        .await;
        assert_eq!(reply.status, "ok");

        let status = persistence.get_status_data(job_id, user_id).await.unwrap();
        assert!(matches!(status.status, spanners_common::persistence::JobStatus::Aborted));
    }

    /// Setting a scheduler limit and reading it back returns the
    /// just-written value.
    #[sqlx::test(migrations = "../spanners-common/migrations")]
    async fn scheduler_set_and_readback_each_limit(db: PgPool) {
        let persistence = PersistenceGateway::from_pool(db);
        let scheduler = test_scheduler(persistence.clone());

        let reply = handle(
            &request(RequestKind::Scheduler, "process-limit", Some(Value::from(4))),
            &persistence,
            &scheduler,
        )
        .await;
        assert_eq!(reply.message.unwrap()["process-limit"], 4);

        let reply = handle(
            &request(RequestKind::Scheduler, "time-limit", Some(Value::from(5000))),
            &persistence,
            &scheduler,
        )
        .await;
        assert_eq!(reply.message.unwrap()["time-limit"], 5000);

        // No arg: a bare read-back of the current value.
        let reply = handle(
            &request(RequestKind::Scheduler, "sleep", None),
            &persistence,
            &scheduler,
        )
        .await;
        assert_eq!(reply.message.unwrap()["sleep"], 1000);
    }
}
