// src/main.rs
//
// =============================================================================
// TASKGRID: COMMANDER & ENTRY POINT (v 0.3)
// =============================================================================
//
// The wiring center.
//
// Modes:
// 1. SERVER:    Boots the controller (HTTP API + Scheduler + Watchdog).
// 2. AGENT:     Registers and runs a Main Agent on this host.
// 3. SUB-AGENT: Internal mode; one task's lifetime. Spawned by a main agent
//               with the task JSON as an argument, never by hand.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskgrid::agent::main_agent::run_main_agent;
use taskgrid::agent::sub_agent::SubAgent;
use taskgrid::config::Config;
use taskgrid::core::TaskAssignment;
use taskgrid::server;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "taskgrid",
    version,
    about = "Distributed job-execution control plane"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the controller: HTTP API, scheduler and watchdog.
    Server {
        /// Port to bind (default 5000, or TASKGRID_PORT).
        #[arg(long)]
        port: Option<u16>,

        /// Root directory for the database and task logs.
        #[arg(long)]
        data_dir: Option<String>,
    },

    /// Register and run a main agent on this host until interrupted.
    Agent {
        /// Agent name; defaults to the hostname.
        #[arg(long)]
        name: Option<String>,

        /// Controller URL (default http://localhost:5000).
        #[arg(long)]
        server: Option<String>,

        /// Register but refuse task dispatch until told otherwise.
        #[arg(long)]
        reject_new_task: bool,
    },

    /// Run a sub agent for one task. Spawned by a main agent.
    #[command(hide = true, name = "sub-agent")]
    SubAgent {
        #[arg(long = "main-id")]
        main_id: String,

        #[arg(long)]
        server: Option<String>,

        #[arg(long)]
        name: Option<String>,

        /// The task assignment as JSON.
        #[arg(long)]
        task: String,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server { port, data_dir } => {
            let mut config = Config::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir.into();
            }
            server::serve(config).await
        }

        Commands::Agent {
            name,
            server,
            reject_new_task,
        } => run_main_agent(name, server, reject_new_task).await,

        Commands::SubAgent {
            main_id,
            server,
            name,
            task,
        } => {
            let assignment: TaskAssignment =
                serde_json::from_str(&task).context("invalid task JSON argument")?;
            let agent = SubAgent::new(main_id, assignment, server, name);
            let completed = agent.run().await?;
            if !completed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
