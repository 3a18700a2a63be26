use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use vote_counter::config::{Config, USAGE};
use vote_counter::db::Database;
use vote_counter::handlers::IngestHandler;
use vote_counter::shutdown::{ShutdownCoordinator, TerminationSignals};
use vote_counter::tally::Accumulator;
use vote_counter::tasks::flusher::FlushScheduler;
use vote_counter::transport::LineConsumer;

// Initialization failures are fatal: print the error and the usage, exit non-zero
fn fatal(e: vote_counter::Error) -> ExitCode {
    error!("{}", e);
    eprintln!("{}", e);
    eprintln!("{}", USAGE);
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => return fatal(e),
    };

    info!("Connecting to database...");
    let database = match Database::connect(&config.database_url).await {
        Ok(db) => Arc::new(db),
        Err(e) => return fatal(e),
    };

    let signals = match TerminationSignals::register() {
        Ok(signals) => signals,
        Err(e) => return fatal(e),
    };

    let accumulator = Arc::new(Accumulator::new());
    let handler = Arc::new(IngestHandler::new(Arc::clone(&accumulator)));

    info!("Starting vote consumer...");
    let consumer = match LineConsumer::bind(&config.listen_addr, handler).await {
        Ok(consumer) => Arc::new(consumer),
        Err(e) => return fatal(e),
    };

    let flusher = FlushScheduler::new(
        Arc::clone(&accumulator),
        database.clone(),
        config.flush_interval,
        config.failure_policy,
    )
    .start();

    ShutdownCoordinator::new(flusher, consumer, accumulator)
        .run(signals.recv())
        .await;

    info!("Closing database connection...");
    database.close().await;
    ExitCode::SUCCESS
}
