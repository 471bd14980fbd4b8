// ABOUTME: CLI commands for machine lifecycle (list, create, start, stop, delete, settings)
// ABOUTME: Each command drives the in-process MachineManager against the local container runtime

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::*;
use inquire::Confirm;
use vmweb_cli::{machines_table, settings_lines, status_label, SettingsUpdate};
use vmweb_machines::{CreateMachineRequest, MachineManager};

#[derive(Subcommand)]
pub enum MachineCommands {
    /// List all machines with live status
    List,
    /// Show one machine's record
    Show {
        /// Machine ID
        id: String,
    },
    /// Create a new machine
    Create {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Base image, e.g. python:3.11-slim
        #[arg(short, long)]
        image: String,
        /// Memory in GB (1-8)
        #[arg(long, default_value = "2")]
        ram: u32,
        /// CPU cores (1-4)
        #[arg(long, default_value = "1")]
        cores: u32,
    },
    /// Build and start a machine (always a clean start)
    Start {
        /// Machine ID
        id: String,
    },
    /// Stop a machine's container
    Stop {
        /// Machine ID
        id: String,
    },
    /// Delete a machine, its files and its container
    Delete {
        /// Machine ID
        id: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum SettingsCommands {
    /// Show current settings
    Show {
        /// Machine ID
        id: String,
    },
    /// Change one or more settings; omitted options keep their value
    Set {
        /// Machine ID
        id: String,
        #[arg(long)]
        install: Option<String>,
        #[arg(long)]
        build: Option<String>,
        #[arg(long)]
        run: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        unique_path: Option<String>,
    },
}

pub async fn handle_machine_command(manager: &MachineManager, command: MachineCommands) -> Result<()> {
    match command {
        MachineCommands::List => list_machines(manager).await,
        MachineCommands::Show { id } => show_machine(manager, &id).await,
        MachineCommands::Create {
            name,
            image,
            ram,
            cores,
        } => {
            create_machine(
                manager,
                CreateMachineRequest {
                    name,
                    ram_gb: ram,
                    core: cores,
                    image,
                },
            )
            .await
        }
        MachineCommands::Start { id } => start_machine(manager, &id).await,
        MachineCommands::Stop { id } => stop_machine(manager, &id).await,
        MachineCommands::Delete { id, yes } => delete_machine(manager, &id, yes).await,
    }
}

async fn list_machines(manager: &MachineManager) -> Result<()> {
    let machines = manager.list_machines().await?;

    if machines.is_empty() {
        println!("{}", "No machines found".yellow());
        println!("{}", "Use 'vmweb create' to create your first machine".dimmed());
        return Ok(());
    }

    println!("{}", machines_table(&machines));
    println!("Total: {} machines", machines.len().to_string().cyan());
    Ok(())
}

async fn show_machine(manager: &MachineManager, id: &str) -> Result<()> {
    let record = manager.get_machine(id).await?;

    println!("{}", format!("Machine {} - {}", record.id, record.name).blue().bold());
    println!();
    println!("{} {}", "Image:    ".bold(), record.image);
    println!("{} {}", "RAM:      ".bold(), record.ram);
    println!("{} {}", "Cores:    ".bold(), record.core);
    println!("{} {}", "Status:   ".bold(), status_label(record.status));
    println!(
        "{} {}",
        "Container:".bold(),
        record
            .container_id
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "—".to_string())
    );
    println!("{} {}", "Created:  ".bold(), record.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    for line in settings_lines(&record.effective_settings()) {
        println!("{}", line);
    }
    Ok(())
}

async fn create_machine(manager: &MachineManager, request: CreateMachineRequest) -> Result<()> {
    let record = manager.create_machine(request).await?;

    println!(
        "{} Created machine {} ({})",
        "✓".green(),
        record.name.bold(),
        record.id.cyan()
    );
    println!("{}", format!("Start it with 'vmweb start {}'", record.id).dimmed());
    Ok(())
}

async fn start_machine(manager: &MachineManager, id: &str) -> Result<()> {
    if !manager.runtime_available().await {
        bail!(
            "Container runtime '{}' is not available",
            manager.config().docker_bin
        );
    }

    println!("{} Building and starting machine {}...", "▶".blue(), id.cyan());
    let record = manager
        .start_machine(id)
        .await
        .with_context(|| format!("Failed to start machine {}", id))?;

    println!(
        "{} Machine {} is {}",
        "✓".green(),
        record.id.cyan(),
        status_label(record.status)
    );
    Ok(())
}

async fn stop_machine(manager: &MachineManager, id: &str) -> Result<()> {
    let record = manager
        .stop_machine(id)
        .await
        .with_context(|| format!("Failed to stop machine {}", id))?;

    println!(
        "{} Machine {} is {}",
        "✓".green(),
        record.id.cyan(),
        status_label(record.status)
    );
    Ok(())
}

async fn delete_machine(manager: &MachineManager, id: &str, yes: bool) -> Result<()> {
    if !yes {
        let confirmed = Confirm::new(&format!(
            "Delete machine {} with all its files and its container?",
            id
        ))
        .with_default(false)
        .prompt()?;

        if !confirmed {
            println!("{}", "Deletion cancelled".yellow());
            return Ok(());
        }
    }

    manager.delete_machine(id).await?;
    println!("{} Deleted machine {}", "✓".green(), id.cyan());
    Ok(())
}

pub async fn handle_settings_command(manager: &MachineManager, command: SettingsCommands) -> Result<()> {
    match command {
        SettingsCommands::Show { id } => {
            let settings = manager.get_settings(&id).await?;
            println!("{}", format!("Settings for machine {}", id).blue().bold());
            for line in settings_lines(&settings) {
                println!("{}", line);
            }
            Ok(())
        }
        SettingsCommands::Set {
            id,
            install,
            build,
            run,
            port,
            unique_path,
        } => {
            let update = SettingsUpdate {
                install_command: install,
                build_command: build,
                run_command: run,
                forwarding_port: port,
                unique_path,
            };
            if update.is_empty() {
                bail!("Nothing to change; pass at least one of --install, --build, --run, --port, --unique-path");
            }

            let current = manager.get_settings(&id).await?;
            let updated = manager.update_settings(&id, update.apply(current)).await?;

            println!("{} Updated settings for machine {}", "✓".green(), id.cyan());
            for line in settings_lines(&updated) {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

pub async fn reconcile(manager: &MachineManager) -> Result<()> {
    if !manager.runtime_available().await {
        bail!(
            "Container runtime '{}' is not available; cannot reconcile",
            manager.config().docker_bin
        );
    }

    let report = manager.reconcile().await?;

    for id in &report.restarted {
        println!("{} Restarted {}", "✓".green(), id.cyan());
    }
    for (id, reason) in &report.failed {
        println!("{} {} failed: {}", "✗".red(), id.cyan(), reason);
    }
    println!(
        "Restarted: {}  Failed: {}  Untouched: {}",
        report.restarted.len().to_string().green(),
        report.failed.len().to_string().red(),
        report.skipped
    );

    if !report.failed.is_empty() {
        bail!("{} machine(s) could not be restarted", report.failed.len());
    }
    Ok(())
}
