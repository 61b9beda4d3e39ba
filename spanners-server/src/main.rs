//! The `spanners-server` daemon binary: wires `Config` into a
//! `PersistenceGateway`, starts the `Scheduler` singleton, then runs the
//! Client I/O Server and the Management Server concurrently in the same
//! process. The Scheduler is started before either server begins accepting,
//! so management cancels always reach a live instance.

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use clap::Parser;
use health::HealthRegistry;

use spanners_common::config::{CliArgs, Config};
use spanners_common::metrics;
use spanners_common::persistence::PersistenceGateway;
use spanners_scheduler::{Scheduler, SchedulerLimits};

mod client_io;
mod error;
mod management;
mod tls;

const METRICS_BIND: &str = "0.0.0.0:9090";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = CliArgs::parse();
    let config = Config::load(cli).expect("failed to load configuration");

    let persistence = PersistenceGateway::new(&config.database_url(), 10)
        .await
        .expect("failed to connect to the database");
    persistence
        .migrate()
        .await
        .expect("failed to run database migrations");

    let liveness = HealthRegistry::new("liveness");
    let scheduler_health = liveness
        .register("scheduler".to_owned(), time::Duration::seconds(60))
        .await;
    let client_io_health = liveness
        .register("client-io".to_owned(), time::Duration::seconds(60))
        .await;
    let management_health = liveness
        .register("management".to_owned(), time::Duration::seconds(60))
        .await;

    let limits = SchedulerLimits {
        process_limit: config.scheduler_process_limit,
        time_limit_ms: config.scheduler_time_limit_ms,
        resource_limit_bytes: config.scheduler_resource_limit_bytes,
        sleep_ms: config.scheduler_sleep_ms,
    };
    let scheduler = Scheduler::new(
        config.scheduler_exec_path.clone(),
        config.database_url(),
        persistence.clone(),
        limits,
        Some(scheduler_health),
    );
    scheduler.start();

    let tls_paths = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
        _ => None,
    };

    let router = metrics::setup_metrics_router()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));

    let client_io = client_io::run(
        &config.bind(),
        tls_paths,
        persistence.clone(),
        Arc::clone(&scheduler),
        Some(client_io_health),
    );
    let mgmt = management::run(
        &config.management_socket_path,
        persistence.clone(),
        Arc::clone(&scheduler),
        Some(management_health),
    );
    let metrics_serve = metrics::serve(router, METRICS_BIND);

    tokio::select! {
        res = client_io => if let Err(e) = res {
            tracing::error!("client I/O server exited: {e}");
        },
        res = mgmt => if let Err(e) = res {
            tracing::error!("management server exited: {e}");
        },
        res = metrics_serve => if let Err(e) = res {
            tracing::error!("metrics server exited: {e}");
        },
    }
}

async fn index() -> &'static str {
    "spanners-server"
}
