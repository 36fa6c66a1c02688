//! # Cluster Benchmark - Main Entry Point
//!
//! One binary, two roles:
//!
//! - `cluster-bench server` publishes its control endpoint and echoes whatever
//!   the Controller's Clients send until interrupted.
//! - `cluster-bench master` finds the Server, runs the latency and throughput
//!   rounds, prints the result tables and optionally writes a JSON report.
//!
//! ## Error Handling
//!
//! Every failure is fatal: the error chain is logged as a single diagnostic,
//! also written to stderr directly so it survives any `RUST_LOG` filter, and
//! the process exits with status 1.

use anyhow::{Context, Result};
use clap::Parser;
use cluster_bench::{
    cli::{Args, Command, MasterArgs, ServerArgs},
    logging::init_logging,
    run_master, serve, FileRendezvous, MasterConfig, ResultsManager, ServerConfig,
};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let verbose = match &args.command {
        Command::Master(master) => master.common.verbose,
        Command::Server(server) => server.common.verbose,
    };
    init_logging(verbose);
    debug!("Configuration: {:?}", args);

    let outcome = match args.command {
        Command::Master(master) => run_master_role(master).await,
        Command::Server(server) => run_server_role(server).await,
    };

    if let Err(e) = outcome {
        error!("Error: {:#}", e);
        if !tracing::enabled!(tracing::Level::ERROR) {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

/// Run the Controller against the Server published in the rendezvous dir.
async fn run_master_role(args: MasterArgs) -> Result<()> {
    let config = MasterConfig::from_args(&args)?;
    info!("****** Cluster Benchmark Client Started ******");

    let rendezvous = FileRendezvous::new(&args.common.rendezvous_dir);
    let mut results = ResultsManager::new(&config, args.output_file.as_deref());

    run_master(config, &rendezvous, Some(&mut results))
        .await
        .context("Benchmark failed")?;

    results.finalize()?;
    info!("****** Cluster Benchmark Client Finished ******");
    Ok(())
}

/// Serve Controller sessions until Ctrl-C.
async fn run_server_role(args: ServerArgs) -> Result<()> {
    let config = ServerConfig::from_args(&args)?;
    let rendezvous = FileRendezvous::new(&args.common.rendezvous_dir);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    serve(&config, &rendezvous, shutdown)
        .await
        .context("Server failed")?;
    info!("Benchmark server stopped");
    Ok(())
}
