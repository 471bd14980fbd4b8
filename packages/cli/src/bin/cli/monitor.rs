// ABOUTME: CLI commands for observing machines: live logs, usage samples and the activity log
// ABOUTME: Also hosts the short-link unique path availability check

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use vmweb_cli::usage_table;
use vmweb_config::Config;
use vmweb_machines::{MachineManager, ShortLinkClient, UsageReport};

#[derive(Subcommand)]
pub enum MonitorCommands {
    /// Follow a machine's container logs (Ctrl-C to stop)
    Logs {
        /// Machine ID
        id: String,
    },
    /// Sample resource usage
    Usage {
        /// Machine ID
        id: String,
        /// Number of samples to take
        #[arg(short = 'n', long, default_value = "1")]
        samples: usize,
        /// Seconds between samples
        #[arg(long, default_value = "2")]
        interval: u64,
        /// Print samples as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_monitor_command(manager: &MachineManager, command: MonitorCommands) -> Result<()> {
    match command {
        MonitorCommands::Logs { id } => follow_logs(manager, id).await,
        MonitorCommands::Usage {
            id,
            samples,
            interval,
            json,
        } => sample_usage(manager, &id, samples, Duration::from_secs(interval), json).await,
    }
}

async fn follow_logs(manager: &MachineManager, id: String) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(256);
    let session = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.stream_logs(&id, tx).await })
    };

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => println!("{}", line),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("{}", "Stopping log stream".dimmed());
                break;
            }
        }
    }

    // Closing the receiver ends the session and stops the follower
    drop(rx);
    let end = session.await??;
    debug!("Log session ended: {:?}", end);
    Ok(())
}

async fn sample_usage(
    manager: &MachineManager,
    id: &str,
    samples: usize,
    interval: Duration,
    json: bool,
) -> Result<()> {
    for n in 0..samples.max(1) {
        if n > 0 {
            tokio::time::sleep(interval).await;
        }

        match manager.usage_snapshot(id).await? {
            UsageReport::Sample(sample) if json => println!("{}", serde_json::to_string(&sample)?),
            UsageReport::Sample(sample) => println!(
                "CPU {}  MEM {} / {}  NET {} / {}",
                sample.cpu_percent.cyan(),
                sample.mem_usage,
                sample.mem_limit,
                sample.net_rx,
                sample.net_tx
            ),
            UsageReport::Unavailable(reason) => {
                println!("{}", reason.yellow());
                return Ok(());
            }
        }
    }

    if samples > 1 && !json {
        println!();
        println!("{}", usage_table(&manager.usage_history(id).await));
    }
    Ok(())
}

pub async fn show_activity(manager: &MachineManager) -> Result<()> {
    let activity = manager.activity().read().await?;
    if activity.trim().is_empty() {
        println!("{}", "No activity recorded yet".dimmed());
    } else {
        print!("{}", activity);
    }
    Ok(())
}

pub async fn check_path(config: &Config, unique_path: &str) -> Result<()> {
    let client = ShortLinkClient::from_config(config);
    let availability = client.is_path_available(unique_path).await?;

    if availability.available {
        println!("{} '{}' is available", "✓".green(), unique_path);
    } else {
        println!(
            "{} '{}' is taken (service answered {})",
            "✗".red(),
            unique_path,
            availability.status_code
        );
    }
    Ok(())
}
