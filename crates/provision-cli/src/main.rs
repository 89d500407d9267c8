mod cmd;
mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "provision",
    about = "Policy-bound provisioning orchestrator: serve requests and inspect runs",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to the orchestrator config file
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "PROVISION_CONFIG",
        default_value = "provision.yaml"
    )]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server and the background reconciler
    Serve {
        /// Address to bind (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides server.port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate the config, policy bundles and backend wiring
    Check,

    /// Show the state, steps and transitions of a run
    Status { run_id: String },

    /// Show the bundle rationale and audit trail of a run
    Explain { run_id: String },

    /// List runs in the store, newest first
    Runs {
        /// Only runs that have not reached a terminal state
        #[arg(long)]
        active: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Serve { bind, port } => cmd::serve::run(&cli.config, bind, port),
        Commands::Check => cmd::check::run(&cli.config, cli.json),
        Commands::Status { run_id } => cmd::runs::status(&cli.config, &run_id, cli.json),
        Commands::Explain { run_id } => cmd::runs::explain(&cli.config, &run_id, cli.json),
        Commands::Runs { active } => cmd::runs::list(&cli.config, active, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
