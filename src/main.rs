//! labgate - per-student GNS3 lab containers behind session, CSRF and rate-limit protection.
//!
//! Usage:
//!   labgate serve [--port 8080] [--roster roster.json]   # HTTP API, realtime channel and control plane

mod auth;
mod config;
mod csrf;
mod error;
mod grpc_server;
mod http_server;
mod notifier;
mod orchestrator;
mod rate_limit;
mod roster;
mod runtime;
mod session;
mod state;
#[cfg(test)]
mod testing;

use std::process::exit;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{ServeArgs, Settings};
use crate::roster::{Roster, StaticRoster};
use crate::runtime::docker::DockerRuntime;
use crate::session::MemorySessionStore;
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "labgate")]
#[command(about = "GNS3 lab lifecycle and access protection")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server and the gRPC control plane
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve) => {
            if let Err(e) = serve_labs(serve.settings()).await {
                error!(error = %e, "labgate stopped");
                exit(1);
            }
        }
    }
}

async fn serve_labs(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Arc::new(DockerRuntime::new(settings.docker.clone()));
    let roster: Arc<dyn Roster> = match &settings.roster {
        Some(path) => Arc::new(StaticRoster::load(path)?),
        None => {
            warn!("No roster configured; every classroom starts empty");
            Arc::new(StaticRoster::new())
        }
    };
    let store = Arc::new(MemorySessionStore::new(settings.session_ttl));
    let state = AppState::new(&settings, store, runtime, roster);

    let grpc_state = state.clone();
    let grpc_addr = settings.grpc_addr;
    tokio::spawn(async move {
        if let Err(e) = grpc_server::run_server(grpc_addr, grpc_state).await {
            error!(error = %e, "gRPC control plane stopped");
        }
    });

    http_server::run_server(settings.http_port, state, settings.reconcile_interval, &settings.cors_origins).await?;
    Ok(())
}
