use clap::{Parser, Subcommand};
use colored::*;
use std::process;
use tracing_subscriber::EnvFilter;
use vmweb_config::{constants, Config};
use vmweb_machines::MachineManager;

mod cli;

use cli::files::FilesCommands;
use cli::machines::{MachineCommands, SettingsCommands};
use cli::monitor::MonitorCommands;

#[derive(Parser)]
#[command(name = "vmweb")]
#[command(about = "VM Web GUI - container-backed machines from the command line")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Machines(MachineCommands),
    /// Show or change a machine's build and run settings
    #[command(subcommand)]
    Settings(SettingsCommands),
    /// Work with a machine's files
    #[command(subcommand)]
    Files(FilesCommands),
    #[command(flatten)]
    Monitor(MonitorCommands),
    /// Relaunch machines recorded as running (run after a host restart)
    Reconcile,
    /// Print the activity log
    Activity,
    /// Check whether a unique path is still free on the short-link service
    CheckPath {
        /// Unique path to check
        unique_path: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(constants::RUST_LOG).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let manager = MachineManager::with_docker(config);

    match command {
        Commands::Machines(cmd) => cli::machines::handle_machine_command(&manager, cmd).await,
        Commands::Settings(cmd) => cli::machines::handle_settings_command(&manager, cmd).await,
        Commands::Files(cmd) => cli::files::handle_files_command(&manager, cmd).await,
        Commands::Monitor(cmd) => cli::monitor::handle_monitor_command(&manager, cmd).await,
        Commands::Reconcile => cli::machines::reconcile(&manager).await,
        Commands::Activity => cli::monitor::show_activity(&manager).await,
        Commands::CheckPath { unique_path } => {
            cli::monitor::check_path(manager.config(), &unique_path).await
        }
    }
}
