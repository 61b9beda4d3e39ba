//! The Scheduler: a process-wide singleton owning the set of live worker
//! processes. A background loop reaps finished children, enforces the
//! wall-clock timeout, and dispatches waiting jobs up to `process_limit`.
//! Supports runtime reconfiguration and targeted cancellation. Captured
//! stdout/stderr are message-passed out of the child via `tokio::spawn`ed
//! reader tasks rather than held as raw pipe handles.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use health::HealthHandle;
use spanners_common::persistence::{JobStatus, PersistenceGateway};
use spanners_common::worker::{exit_code, WorkerArgs};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::SchedulerError;

/// The four setter-reachable scheduler parameters.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerLimits {
    pub process_limit: u32,
    /// 0 = disabled.
    pub time_limit_ms: u64,
    /// 0 = disabled. Applies only to newly-spawned children.
    pub resource_limit_bytes: u64,
    pub sleep_ms: u64,
}

struct LiveWorker {
    user_id: i64,
    child: Child,
    stdout_task: JoinHandle<String>,
    stderr_task: JoinHandle<String>,
    started_at: DateTime<Utc>,
}

struct SchedulerState {
    limits: SchedulerLimits,
    stop_flag: bool,
    live: HashMap<i64, LiveWorker>,
}

pub struct Scheduler {
    exec_path: String,
    db_conn_string: String,
    persistence: PersistenceGateway,
    state: Mutex<SchedulerState>,
    started: AtomicBool,
    liveness: Option<HealthHandle>,
}

impl Scheduler {
    pub fn new(
        exec_path: impl Into<String>,
        db_conn_string: impl Into<String>,
        persistence: PersistenceGateway,
        limits: SchedulerLimits,
        liveness: Option<HealthHandle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            exec_path: exec_path.into(),
            db_conn_string: db_conn_string.into(),
            persistence,
            state: Mutex::new(SchedulerState {
                limits,
                stop_flag: false,
                live: HashMap::new(),
            }),
            started: AtomicBool::new(false),
            liveness,
        })
    }

    /// Spawns exactly one background loop. A second call is a programming
    /// error and panics — calling this twice is fatal misuse, not something
    /// the design tolerates.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            panic!("{}", SchedulerError::AlreadyStarted);
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run_loop().await });
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            self.reap().await;

            if let Some(liveness) = &self.liveness {
                liveness.report_healthy().await;
            }

            let stop_flag = self.state.lock().await.stop_flag;
            if !stop_flag {
                self.dispatch().await;
            }

            let (stop_flag, live_empty, sleep_ms) = {
                let state = self.state.lock().await;
                (state.stop_flag, state.live.is_empty(), state.limits.sleep_ms)
            };
            if stop_flag && live_empty {
                info!("scheduler loop exiting: stop requested, no live workers remain");
                break;
            }

            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    }

    /// Reaps exited children and enforces the wall-clock timeout.
    async fn reap(&self) {
        let now = Utc::now();

        let mut exited: Vec<(i64, LiveWorker, std::process::ExitStatus)> = Vec::new();
        let mut timed_out: Vec<(i64, LiveWorker)> = Vec::new();

        {
            let mut state = self.state.lock().await;
            let time_limit_ms = state.limits.time_limit_ms;
            let job_ids: Vec<i64> = state.live.keys().copied().collect();

            for job_id in job_ids {
                let status = state
                    .live
                    .get_mut(&job_id)
                    .and_then(|w| w.child.try_wait().ok().flatten());

                if let Some(status) = status {
                    if let Some(worker) = state.live.remove(&job_id) {
                        exited.push((job_id, worker, status));
                    }
                    continue;
                }

                if time_limit_ms > 0 {
                    let over = state
                        .live
                        .get(&job_id)
                        .map(|w| elapsed_ms(w.started_at, now) > time_limit_ms)
                        .unwrap_or(false);
                    if over {
                        if let Some(worker) = state.live.remove(&job_id) {
                            timed_out.push((job_id, worker));
                        }
                    }
                }
            }
        }

        for (job_id, worker, status) in exited {
            let stdout = worker.stdout_task.await.unwrap_or_default();
            let stderr = worker.stderr_task.await.unwrap_or_default();
            let (job_status, forced_stderr) = classify_exit(status.code());
            let stderr = forced_stderr.map(str::to_owned).unwrap_or(stderr);

            if let Err(e) = self
                .persistence
                .set_finished(job_id, job_status, &stdout, &stderr)
                .await
            {
                error!("set_finished({job_id}) failed after worker exit: {e}");
            }
        }

        for (job_id, mut worker) in timed_out {
            let _ = worker.child.start_kill();
            let _ = worker.child.wait().await;
            warn!("job {job_id} exceeded the scheduler time limit, terminated");

            if let Err(e) = self
                .persistence
                .set_finished(job_id, JobStatus::Aborted, "", "Timeout")
                .await
            {
                error!("set_finished({job_id}) failed after timeout: {e}");
            }
        }
    }

    /// Pulls up to `process_limit - live` waiting jobs and spawns a worker
    /// per job.
    async fn dispatch(&self) {
        let (capacity, resource_limit_bytes) = {
            let state = self.state.lock().await;
            let capacity = state
                .limits
                .process_limit
                .saturating_sub(state.live.len() as u32);
            (capacity, state.limits.resource_limit_bytes)
        };
        if capacity == 0 {
            return;
        }

        // get_next_jobs claims each returned row straight to RUNNING in the
        // same statement that locks it, so by the time control reaches here
        // every (job_id, user_id) pair is already committed as RUNNING.
        let jobs = match self.persistence.get_next_jobs(capacity as i64).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("get_next_jobs failed: {e}");
                return;
            }
        };

        for (job_id, user_id) in jobs {
            match self
                .spawn_worker(job_id, user_id, resource_limit_bytes)
                .await
            {
                Ok(worker) => {
                    self.state.lock().await.live.insert(job_id, worker);
                }
                Err(e) => {
                    error!("failed to spawn worker for job {job_id}: {e}");
                    if let Err(e2) = self
                        .persistence
                        .set_finished(job_id, JobStatus::Failed, "", &e.to_string())
                        .await
                    {
                        error!("set_finished({job_id}) failed after spawn error: {e2}");
                    }
                }
            }
        }
    }

    async fn spawn_worker(
        &self,
        job_id: i64,
        user_id: i64,
        resource_limit_bytes: u64,
    ) -> Result<LiveWorker, SchedulerError> {
        let args = WorkerArgs {
            job_id,
            user_id,
            db_conn_string: self.db_conn_string.clone(),
            memory_limit_bytes: resource_limit_bytes,
        };

        let mut child = Command::new(&self.exec_path)
            .args(args.to_argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("stdout was piped at spawn");
        let stderr = child.stderr.take().expect("stderr was piped at spawn");
        let stdout_task = tokio::spawn(drain_to_string(stdout));
        let stderr_task = tokio::spawn(drain_to_string(stderr));

        Ok(LiveWorker {
            user_id,
            child,
            stdout_task,
            stderr_task,
            started_at: Utc::now(),
        })
    }

    /// `stop(false)` drains live workers (no new dispatch, existing children
    /// run to completion); `stop(true)` terminates them synchronously and
    /// writes `ABORTED`.
    pub async fn stop(&self, force: bool) {
        let workers: Vec<(i64, LiveWorker)> = {
            let mut state = self.state.lock().await;
            state.stop_flag = true;
            if force {
                state.live.drain().collect()
            } else {
                Vec::new()
            }
        };

        for (job_id, mut worker) in workers {
            let _ = worker.child.start_kill();
            let _ = worker.child.wait().await;
            if let Err(e) = self
                .persistence
                .set_finished(job_id, JobStatus::Aborted, "", "Global scheduler stop")
                .await
            {
                error!("set_finished({job_id}) failed during forced stop: {e}");
            }
        }
    }

    /// Cancels a single job. If a live worker for
    /// `(job_id, user_id)` is still running, terminates it and marks
    /// `ABORTED("Aborted by Request")`. Otherwise writes
    /// `ABORTED("Preemptive abort")` directly, bypassing `WAITING ->
    /// RUNNING` so the loop never dispatches it.
    pub async fn cancel_job(&self, job_id: i64, user_id: i64) -> Result<(), SchedulerError> {
        let live_match = {
            let mut state = self.state.lock().await;
            match state.live.get(&job_id) {
                Some(w) if w.user_id == user_id => state.live.remove(&job_id),
                _ => None,
            }
        };

        match live_match {
            Some(mut worker) => {
                let _ = worker.child.start_kill();
                let _ = worker.child.wait().await;
                self.persistence
                    .set_finished(job_id, JobStatus::Aborted, "", "Aborted by Request")
                    .await?;
            }
            None => {
                self.persistence
                    .set_finished(job_id, JobStatus::Aborted, "", "Preemptive abort")
                    .await?;
            }
        }
        Ok(())
    }

    /// Terminates all live workers of `user_id` and drops them from the
    /// live set. Does not itself touch the database — the caller (user
    /// deletion) has already updated statuses.
    pub async fn cancel_user_jobs(&self, user_id: i64) {
        let workers: Vec<(i64, LiveWorker)> = {
            let mut state = self.state.lock().await;
            let job_ids: Vec<i64> = state
                .live
                .iter()
                .filter(|(_, w)| w.user_id == user_id)
                .map(|(id, _)| *id)
                .collect();
            job_ids
                .into_iter()
                .filter_map(|id| state.live.remove(&id).map(|w| (id, w)))
                .collect()
        };

        for (_, mut worker) in workers {
            let _ = worker.child.start_kill();
            let _ = worker.child.wait().await;
        }
    }

    pub async fn current_limits(&self) -> SchedulerLimits {
        self.state.lock().await.limits
    }

    pub async fn set_time_limit(&self, ms: u64) {
        self.state.lock().await.limits.time_limit_ms = ms;
    }

    pub async fn set_resource_limit(&self, bytes: u64) {
        self.state.lock().await.limits.resource_limit_bytes = bytes;
    }

    pub async fn set_process_limit(&self, n: u32) {
        self.state.lock().await.limits.process_limit = n;
    }

    pub async fn set_sleep(&self, ms: u64) {
        self.state.lock().await.limits.sleep_ms = ms;
    }

    pub async fn live_count(&self) -> usize {
        self.state.lock().await.live.len()
    }
}

fn elapsed_ms(started_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - started_at).num_milliseconds().max(0) as u64
}

async fn drain_to_string(mut reader: impl tokio::io::AsyncRead + Unpin) -> String {
    let mut buf = String::new();
    let _ = reader.read_to_string(&mut buf).await;
    buf
}

/// Classifies a worker's exit code: `0` succeeds; `11` (segfault-class)
/// fails with a forced `"Segfault"` message overriding whatever was
/// captured on stderr; anything else fails with the captured stderr kept
/// as-is.
fn classify_exit(code: Option<i32>) -> (JobStatus, Option<&'static str>) {
    match code {
        Some(exit_code::SUCCESS) => (JobStatus::Success, None),
        Some(exit_code::SEGFAULT) => (JobStatus::Failed, Some("Segfault")),
        _ => (JobStatus::Failed, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_success() {
        assert!(matches!(
            classify_exit(Some(0)),
            (JobStatus::Success, None)
        ));
    }

    #[test]
    fn classifies_segfault() {
        assert!(matches!(
            classify_exit(Some(11)),
            (JobStatus::Failed, Some("Segfault"))
        ));
    }

    #[test]
    fn classifies_general_error_and_signals() {
        assert!(matches!(classify_exit(Some(1)), (JobStatus::Failed, None)));
        assert!(matches!(classify_exit(None), (JobStatus::Failed, None)));
    }
}
