//! The worker process body: resolve the handler, dispatch, write the
//! response back, report the elapsed wall-clock time. Split into a testable
//! `run` plus the address-space limit and argv parsing that live in
//! `main.rs`.

use std::time::Instant;

use rlimit::{getrlimit, setrlimit, Resource};
use spanners_common::handlers;
use spanners_common::persistence::PersistenceGateway;
use spanners_common::worker::WorkerArgs;

use crate::error::WorkerError;

/// Applies the per-process address-space limit a non-zero `memory_limit`
/// requests. A limit above what the OS hard cap allows, or a `setrlimit`
/// failure, is propagated so `main` exits `1` rather than silently running
/// unconstrained.
pub fn apply_memory_limit(memory_limit_bytes: u64) -> Result<(), WorkerError> {
    if memory_limit_bytes == 0 {
        return Ok(());
    }
    let (_soft, hard) = getrlimit(Resource::AS).map_err(WorkerError::Rlimit)?;
    if memory_limit_bytes > hard {
        return Err(WorkerError::Rlimit(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "requested memory limit exceeds the process's hard address-space limit",
        )));
    }
    setrlimit(Resource::AS, memory_limit_bytes, hard).map_err(WorkerError::Rlimit)
}

/// Runs the worker's one job to completion: fetch `(meta, request)`,
/// dispatch to the named handler, write the response and elapsed runtime
/// back to persistence.
pub async fn run(args: &WorkerArgs, persistence: &PersistenceGateway) -> Result<(), WorkerError> {
    let meta = persistence
        .get_meta_data(args.job_id, args.user_id)
        .await?;
    let (request_type, request_blob) = persistence
        .get_request_data(args.job_id, args.user_id)
        .await?;

    let started = Instant::now();
    let response_blob = handlers::invoke(&meta.handler_type, &request_blob)
        .ok_or_else(|| WorkerError::UnknownHandler(meta.handler_type.clone()))?;
    let elapsed_us = started.elapsed().as_micros() as i64;

    persistence
        .add_response(args.job_id, request_type, &response_blob, elapsed_us)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_memory_limit_is_a_no_op() {
        assert!(apply_memory_limit(0).is_ok());
    }
}
