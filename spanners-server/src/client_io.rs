//! The Client I/O Server: a TCP listener, optionally TLS-wrapped, accepting
//! length-prefixed framed messages. Each connection is an independent task
//! handling exactly one request/response pair before closing — cooperative
//! concurrency, no connection blocks another.

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use spanners_common::error::PersistenceError;
use spanners_common::handlers;
use spanners_common::persistence::{
    NewUser, PersistenceGateway, Role, StatusRecord, User,
};
use spanners_common::protocol::{read_request, write_response, MetaData, RequestType, ResponseMeta, ResultRequest};
use spanners_common::{auth, error::AuthError};
use spanners_scheduler::Scheduler;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::error::ServerError;
use crate::tls;

/// Blanket trait so a connection can be either a plain `TcpStream` or a
/// `TlsStream<TcpStream>` behind one boxed handle — the rest of the state
/// machine doesn't care which.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Runs the accept loop until the process is torn down. Binds plaintext TCP
/// when no TLS paths are configured, or wraps every accepted socket in a TLS
/// handshake when both `cert_path`/`key_path` are set.
pub async fn run(
    bind: &str,
    tls_paths: Option<(&Path, &Path)>,
    persistence: PersistenceGateway,
    scheduler: Arc<Scheduler>,
    liveness: Option<health::HealthHandle>,
) -> std::io::Result<()> {
    let acceptor = match tls_paths {
        Some((cert, key)) => Some(tls::load_acceptor(cert, key)?),
        None => None,
    };

    let listener = TcpListener::bind(bind).await?;
    info!("client I/O server listening on {bind} (tls={})", acceptor.is_some());

    loop {
        let (tcp_stream, peer) = listener.accept().await?;
        let persistence = persistence.clone();
        let scheduler = Arc::clone(&scheduler);
        let acceptor = acceptor.clone();
        if let Some(liveness) = &liveness {
            liveness.report_healthy().await;
        }

        tokio::spawn(async move {
            let stream: Box<dyn AsyncStream> = match acceptor {
                Some(acceptor) => match accept_tls(&acceptor, tcp_stream).await {
                    Ok(stream) => Box::new(stream),
                    Err(e) => {
                        warn!("TLS handshake with {peer} failed: {e}");
                        return;
                    }
                },
                None => Box::new(tcp_stream),
            };
            handle_connection(stream, persistence, scheduler).await;
        });
    }
}

async fn accept_tls(
    acceptor: &TlsAcceptor,
    stream: tokio::net::TcpStream,
) -> std::io::Result<tokio_rustls::server::TlsStream<tokio::net::TcpStream>> {
    acceptor.accept(stream).await
}

/// Handles exactly one request/response pair, then the caller drops the
/// connection.
async fn handle_connection(
    mut stream: Box<dyn AsyncStream>,
    persistence: PersistenceGateway,
    scheduler: Arc<Scheduler>,
) {
    let outcome = process(&mut stream, &persistence, &scheduler).await;
    let (meta, container) = match outcome {
        Ok((meta, container)) => (meta, container),
        Err(e) => {
            warn!("request failed: {e}");
            (ResponseMeta::error(e.error_type(), e.message()), None)
        }
    };

    if let Err(e) = write_response(&mut stream, meta, container.as_deref()).await {
        warn!("failed to write response frame: {e}");
    }
}

async fn process(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    persistence: &PersistenceGateway,
    scheduler: &Arc<Scheduler>,
) -> Result<(ResponseMeta, Option<Vec<u8>>), ServerError> {
    let (meta, body) = read_request(stream).await?;

    if meta.message_type == RequestType::CreateUser {
        return handle_create_user(persistence, &meta).await;
    }

    let user = authenticate(persistence, &meta).await?;
    dispatch(&meta, body, &user, persistence, scheduler).await
}

/// `CREATE_USER` is handled before the generic AUTH step: a duplicate name
/// must reply `USER_CREATION` regardless of whether the submitted password
/// happens to match the existing account, so duplicate detection must run
/// before any password check, not after it.
async fn handle_create_user(
    persistence: &PersistenceGateway,
    meta: &MetaData,
) -> Result<(ResponseMeta, Option<Vec<u8>>), ServerError> {
    let (pw_hash, salt) = auth::hash(&meta.user.password)?;
    let new_user = NewUser {
        name: meta.user.name.clone(),
        pw_hash: pw_hash.into_bytes(),
        salt,
        role: Role::User,
    };
    match persistence.create_user(new_user).await {
        Ok(_) => Ok((ResponseMeta::Ok, None)),
        Err(PersistenceError::Duplicate) => Err(ServerError::UserCreation),
        Err(e) => Err(e.into()),
    }
}

/// Looks up the user, rejects unknown/blocked accounts, then verifies the
/// password. A blocked user can authenticate neither new jobs nor control
/// actions.
async fn authenticate(persistence: &PersistenceGateway, meta: &MetaData) -> Result<User, ServerError> {
    let user = persistence
        .get_user_by_name(&meta.user.name)
        .await?
        .ok_or(AuthError::UnknownUser)?;
    if user.blocked {
        return Err(AuthError::Blocked.into());
    }

    let stored_hash = String::from_utf8(user.pw_hash.clone())
        .map_err(|_| ServerError::Auth(AuthError::Kdf("stored hash is not valid UTF-8".into())))?;
    if !auth::verify(&meta.user.password, &stored_hash)? {
        return Err(AuthError::WrongPassword.into());
    }
    Ok(user)
}

async fn dispatch(
    meta: &MetaData,
    body: Option<Vec<u8>>,
    user: &User,
    persistence: &PersistenceGateway,
    scheduler: &Arc<Scheduler>,
) -> Result<(ResponseMeta, Option<Vec<u8>>), ServerError> {
    match meta.message_type {
        RequestType::Auth => Ok((ResponseMeta::Ok, None)),

        RequestType::AvailableHandlers => Ok((
            ResponseMeta::AvailableHandlers {
                handlers: handlers::all(),
            },
            None,
        )),

        RequestType::Status => {
            let jobs = persistence.get_job_entries(user.user_id).await?;
            let jobs: Vec<StatusRecord> = jobs.iter().map(StatusRecord::from).collect();
            Ok((ResponseMeta::Status { jobs }, None))
        }

        RequestType::Result => {
            let req: ResultRequest = parse_body(body)?;
            let job = persistence.get_job(req.jobid, user.user_id).await?;
            if job.response_id.is_none() {
                return Err(ServerError::InvalidRequest(
                    "job has not produced a result yet".into(),
                ));
            }
            let status = StatusRecord::from(&job);
            let (_response_type, blob) = persistence
                .get_response_data_raw(req.jobid, user.user_id)
                .await?;
            Ok((ResponseMeta::Result { status }, Some(blob)))
        }

        // ORIGIN_GRAPH carries the same `jobid` request body as RESULT and is
        // equally a blob tied to a job's status, so it reuses RESULT's reply
        // shape, pointed at the request blob instead of the response blob.
        RequestType::OriginGraph => {
            let req: ResultRequest = parse_body(body)?;
            let job = persistence.get_job(req.jobid, user.user_id).await?;
            if job.request_id.is_none() {
                return Err(ServerError::InvalidRequest(
                    "job has no request blob".into(),
                ));
            }
            let status = StatusRecord::from(&job);
            let (_request_type, blob) = persistence
                .get_request_data(req.jobid, user.user_id)
                .await?;
            Ok((ResponseMeta::Result { status }, Some(blob)))
        }

        RequestType::AbortJob => {
            let req: ResultRequest = parse_body(body)?;
            if let Err(e) = persistence.get_status_data(req.jobid, user.user_id).await {
                return Ok(not_found_or_err(e)?);
            }
            scheduler
                .cancel_job(req.jobid, user.user_id)
                .await
                .map_err(ServerError::from)?;
            Ok((ResponseMeta::Ok, None))
        }

        RequestType::DeleteJob => {
            let req: ResultRequest = parse_body(body)?;
            match persistence.delete_job(req.jobid, user.user_id).await {
                Ok(()) => Ok((ResponseMeta::Ok, None)),
                Err(e) => not_found_or_err(e),
            }
        }

        // Every other/unrecognised tag defaults to job submission, so
        // clients that don't send an explicit NEW_JOB tag still work.
        RequestType::NewJob | RequestType::CreateUser => {
            let blob = body
                .ok_or_else(|| ServerError::InvalidRequest("NEW_JOB requires a body".into()))?;
            let job_id = persistence
                .add_job(user.user_id, &meta.handlertype, &meta.jobname, 0, &blob)
                .await?;
            Ok((ResponseMeta::NewJobResponse { jobid: job_id }, None))
        }
    }
}

fn not_found_or_err(
    e: PersistenceError,
) -> Result<(ResponseMeta, Option<Vec<u8>>), ServerError> {
    match e {
        PersistenceError::NotFound => Ok((ResponseMeta::NotFound, None)),
        other => Err(other.into()),
    }
}

fn parse_body<T: DeserializeOwned>(body: Option<Vec<u8>>) -> Result<T, ServerError> {
    let bytes =
        body.ok_or_else(|| ServerError::InvalidRequest("request requires a body".into()))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ServerError::InvalidRequest(format!("malformed request body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanners_common::persistence::JobStatus;
    use spanners_common::protocol::{write_request, UserCredentials};
    use spanners_scheduler::SchedulerLimits;
    use sqlx::PgPool;

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

    async fn seed_user(persistence: &PersistenceGateway, name: &str, password: &str) -> i64 {
        let (pw_hash, salt) = auth::hash(password).unwrap();
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

    fn request_meta(message_type: RequestType, name: &str, password: &str) -> MetaData {
        MetaData {
            message_type,
            containersize: 0,
            handlertype: String::new(),
            jobname: String::new(),
            user: UserCredentials {
                name: name.to_owned(),
                password: password.to_owned(),
            },
        }
    }

    /// A fresh CREATE_USER succeeds, and the new account can immediately
    /// AUTH.
    #[sqlx::test(migrations = "../spanners-common/migrations")]
    async fn create_user_then_auth_succeeds(db: PgPool) {
        let persistence = PersistenceGateway::from_pool(db);
        let scheduler = test_scheduler(persistence.clone());

        let (mut client, mut server) = tokio::io::duplex(8192);
        write_request(&mut client, request_meta(RequestType::CreateUser, "alice", "hunter2"), None)
            .await
            .unwrap();
        let (reply, _) = process(&mut server, &persistence, &scheduler).await.unwrap();
        assert!(matches!(reply, ResponseMeta::Ok));

        let (mut client, mut server) = tokio::io::duplex(8192);
        write_request(&mut client, request_meta(RequestType::Auth, "alice", "hunter2"), None)
            .await
            .unwrap();
        let (reply, _) = process(&mut server, &persistence, &scheduler).await.unwrap();
        assert!(matches!(reply, ResponseMeta::Ok));
    }

    /// CREATE_USER for an existing name fails with USER_CREATION regardless
    /// of the submitted password.
    #[sqlx::test(migrations = "../spanners-common/migrations")]
    async fn duplicate_create_user_is_rejected(db: PgPool) {
        let persistence = PersistenceGateway::from_pool(db);
        let scheduler = test_scheduler(persistence.clone());
        seed_user(&persistence, "alice", "hunter2").await;

        let (mut client, mut server) = tokio::io::duplex(8192);
        write_request(
            &mut client,
            request_meta(RequestType::CreateUser, "alice", "anything"),
            None,
        )
        .await
        .unwrap();
        let err = process(&mut server, &persistence, &scheduler).await.unwrap_err();
        assert!(matches!(err, ServerError::UserCreation));
        assert_eq!(err.error_type(), "USER_CREATION");
        assert_eq!(err.message(), "User already exists.");
    }

    /// A blocked user's AUTH-gated request fails with AUTH/Blocked
    /// regardless of the password supplied.
    #[sqlx::test(migrations = "../spanners-common/migrations")]
    async fn blocked_user_cannot_authenticate(db: PgPool) {
        let persistence = PersistenceGateway::from_pool(db);
        let scheduler = test_scheduler(persistence.clone());
        let user_id = seed_user(&persistence, "bob", "hunter2").await;
        persistence.set_user_blocked(user_id, true).await.unwrap();

        let (mut client, mut server) = tokio::io::duplex(8192);
        write_request(&mut client, request_meta(RequestType::Status, "bob", "hunter2"), None)
            .await
            .unwrap();
        let err = process(&mut server, &persistence, &scheduler).await.unwrap_err();
        assert!(matches!(err, ServerError::Auth(AuthError::Blocked)));
        assert_eq!(err.error_type(), "AUTH");
    }

    /// An unknown username and a wrong password are each reported with the
    /// matching `AuthError` variant, not a single undifferentiated failure.
    #[sqlx::test(migrations = "../spanners-common/migrations")]
    async fn unknown_user_and_wrong_password_report_distinct_errors(db: PgPool) {
        let persistence = PersistenceGateway::from_pool(db);
        let scheduler = test_scheduler(persistence.clone());
        seed_user(&persistence, "alice", "hunter2").await;

        let (mut client, mut server) = tokio::io::duplex(8192);
        write_request(
            &mut client,
            request_meta(RequestType::Status, "nobody", "whatever"),
            None,
        )
        .await
        .unwrap();
        let err = process(&mut server, &persistence, &scheduler).await.unwrap_err();
        assert!(matches!(err, ServerError::Auth(AuthError::UnknownUser)));

        let (mut client, mut server) = tokio::io::duplex(8192);
        write_request(
            &mut client,
            request_meta(RequestType::Status, "alice", "wrong password"),
            None,
        )
        .await
        .unwrap();
        let err = process(&mut server, &persistence, &scheduler).await.unwrap_err();
        assert!(matches!(err, ServerError::Auth(AuthError::WrongPassword)));
    }

    /// Submit NEW_JOB, then once a (simulated) worker has written the
    /// response, STATUS and RESULT both observe it.
    #[sqlx::test(migrations = "../spanners-common/migrations")]
    async fn new_job_then_status_and_result_round_trip(db: PgPool) {
        let persistence = PersistenceGateway::from_pool(db);
        let scheduler = test_scheduler(persistence.clone());
        seed_user(&persistence, "alice", "hunter2").await;

        let (mut client, mut server) = tokio::io::duplex(65536);
        let mut new_job = request_meta(RequestType::NewJob, "alice", "hunter2");
        new_job.handlertype = "echo".to_owned();
        new_job.jobname = "job-1".to_owned();
        write_request(&mut client, new_job, Some(b"request payload")).await.unwrap();
        let (reply, _) = process(&mut server, &persistence, &scheduler).await.unwrap();
        let job_id = match reply {
            ResponseMeta::NewJobResponse { jobid } => jobid,
            other => panic!("unexpected reply: {other:?}"),
        };

        // A real Worker would do this; simulate it directly to exercise the
        // client-facing read path in isolation.
        persistence.set_started(job_id).await.unwrap();
        persistence
            .add_response(job_id, 0, b"response payload", 123)
            .await
            .unwrap();
        persistence
            .set_finished(job_id, JobStatus::Success, "", "")
            .await
            .unwrap();

        let (mut client, mut server) = tokio::io::duplex(8192);
        write_request(&mut client, request_meta(RequestType::Status, "alice", "hunter2"), None)
            .await
            .unwrap();
        let (reply, _) = process(&mut server, &persistence, &scheduler).await.unwrap();
        match reply {
            ResponseMeta::Status { jobs } => {
                assert_eq!(jobs.len(), 1);
                assert_eq!(jobs[0].job_id, job_id);
                assert!(matches!(jobs[0].status, JobStatus::Success));
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let (mut client, mut server) = tokio::io::duplex(8192);
        let result_request = request_meta(RequestType::Result, "alice", "hunter2");
        let body = serde_json::to_vec(&ResultRequest { jobid: job_id }).unwrap();
        write_request(&mut client, result_request, Some(&body))
            .await
            .unwrap();
        let (reply, blob) = process(&mut server, &persistence, &scheduler).await.unwrap();
        assert!(matches!(reply, ResponseMeta::Result { .. }));
        assert_eq!(blob.unwrap(), b"response payload");
    }

    /// RESULT against a job that exists and is owned by the caller but has
    /// not finished yet (no response blob written) is a client mistake, not
    /// a missing job — it must come back INVALID_REQUEST, not NOT_FOUND.
    #[sqlx::test(migrations = "../spanners-common/migrations")]
    async fn result_on_unfinished_job_is_invalid_request(db: PgPool) {
        let persistence = PersistenceGateway::from_pool(db);
        let scheduler = test_scheduler(persistence.clone());
        seed_user(&persistence, "alice", "hunter2").await;

        let (mut client, mut server) = tokio::io::duplex(65536);
        let mut new_job = request_meta(RequestType::NewJob, "alice", "hunter2");
        new_job.handlertype = "echo".to_owned();
        new_job.jobname = "job-1".to_owned();
        write_request(&mut client, new_job, Some(b"request payload")).await.unwrap();
        let (reply, _) = process(&mut server, &persistence, &scheduler).await.unwrap();
        let job_id = match reply {
            ResponseMeta::NewJobResponse { jobid } => jobid,
            other => panic!("unexpected reply: {other:?}"),
        };

        let (mut client, mut server) = tokio::io::duplex(8192);
        let result_request = request_meta(RequestType::Result, "alice", "hunter2");
        let body = serde_json::to_vec(&ResultRequest { jobid: job_id }).unwrap();
        write_request(&mut client, result_request, Some(&body))
            .await
            .unwrap();
        let err = process(&mut server, &persistence, &scheduler).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
        assert_eq!(err.error_type(), "INVALID_REQUEST");
    }
}
