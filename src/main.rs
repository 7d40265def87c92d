//! Thin CLI entry point: parse [`c8ylp::config::Config`], initialize
//! logging, run the [`c8ylp::supervisor::Supervisor`], and translate its
//! [`c8ylp::supervisor::ExitStatus`] into a process exit code. This is the
//! only place in the crate that calls `std::process::exit`.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use c8ylp::acceptor::DEFAULT_MAX_CONCURRENT_BRIDGES;
use c8ylp::config::{reconcile_env_prefixes, Config};
use c8ylp::resolver::Resolver;
use c8ylp::supervisor::{ExitStatus, Supervisor};

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    reconcile_env_prefixes();
    let config = Config::parse();
    init_tracing(config.verbose);

    let (input, endpoint, mode, params) = match config.into_parts() {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("c8ylp: {e}");
            std::process::exit(2);
        }
    };

    let resolver = match Resolver::new() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("c8ylp: {e}");
            std::process::exit(e.exit_code());
        }
    };

    let supervisor = Supervisor::new(resolver, input, endpoint, mode, DEFAULT_MAX_CONCURRENT_BRIDGES, params);

    let status = supervisor
        .run(|addr| {
            tracing::info!(%addr, "c8ylp ready");
            println!("{addr}");
        })
        .await;

    let code = match status {
        ExitStatus::Ok => 0,
        ExitStatus::Cancelled => 130,
        ExitStatus::Failed(e) => {
            tracing::error!(error = %e, "c8ylp exiting");
            e.exit_code()
        }
    };
    std::process::exit(code);
}
