// src/bin/setup_master_agent.rs
//
// Thin CLI that registers and runs a main agent until interrupted.
// Exit code 0 on clean shutdown, 1 when registration fails.

use clap::Parser;
use taskgrid::agent::main_agent::run_main_agent;

#[derive(Parser)]
#[command(
    name = "setup_master_agent",
    version,
    about = "Register and run a TaskGrid main agent"
)]
struct Args {
    /// Agent name; defaults to the hostname.
    #[arg(long)]
    name: Option<String>,

    /// Controller URL (default http://localhost:5000).
    #[arg(long)]
    server: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::info!("Starting main agent...");

    match run_main_agent(args.name, args.server, false).await {
        Ok(()) => {
            log::info!("Main agent shut down cleanly");
            std::process::exit(0);
        }
        Err(e) => {
            log::error!("Main agent failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
