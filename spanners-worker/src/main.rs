//! The worker binary: a short-lived child invoked by the Scheduler as
//! `spanners-worker job_id user_id db_conn_string memory_limit_bytes`.
//! Runs exactly one job, then exits.

use spanners_common::persistence::PersistenceGateway;
use spanners_common::worker::exit_code;
use spanners_common::worker::WorkerArgs;

mod error;
mod worker;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = match WorkerArgs::parse(std::env::args().skip(1)) {
        Some(args) => args,
        None => {
            eprintln!("malformed argv: expected job_id user_id db_conn_string memory_limit_bytes");
            std::process::exit(exit_code::GENERAL_ERROR);
        }
    };

    if let Err(e) = worker::apply_memory_limit(args.memory_limit_bytes) {
        eprintln!("{e}");
        std::process::exit(exit_code::GENERAL_ERROR);
    }

    let persistence = match PersistenceGateway::new(&args.db_conn_string, 1).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("failed to connect to persistence: {e}");
            std::process::exit(exit_code::GENERAL_ERROR);
        }
    };

    match worker::run(&args, &persistence).await {
        Ok(()) => std::process::exit(exit_code::SUCCESS),
        Err(e) => {
            eprintln!("job {} failed: {e}", args.job_id);
            std::process::exit(exit_code::GENERAL_ERROR);
        }
    }
}
