// ABOUTME: Table rendering and argument helpers shared by the vmweb binary
// ABOUTME: Kept in the library so formatting can be tested without a container runtime

use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use vmweb_machines::{FileEntry, FileKind, MachineSettings, MachineStatus, MachineView, UsageSample};

/// Partial settings change; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub run_command: Option<String>,
    pub forwarding_port: Option<u16>,
    pub unique_path: Option<String>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(self, current: MachineSettings) -> MachineSettings {
        MachineSettings {
            install_command: self.install_command.unwrap_or(current.install_command),
            build_command: self.build_command.unwrap_or(current.build_command),
            run_command: self.run_command.unwrap_or(current.run_command),
            forwarding_port: self.forwarding_port.unwrap_or(current.forwarding_port),
            unique_path: self.unique_path.unwrap_or(current.unique_path),
        }
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

pub fn status_label(status: MachineStatus) -> ColoredString {
    match status {
        MachineStatus::Running => status.as_str().green(),
        MachineStatus::Starting | MachineStatus::Stopping => status.as_str().yellow(),
        MachineStatus::Stopped => status.as_str().dimmed(),
        MachineStatus::Unknown => status.as_str().magenta(),
        MachineStatus::Error => status.as_str().red(),
    }
}

pub fn machines_table(machines: &[MachineView]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["ID", "Name", "Image", "RAM", "Cores", "Status", "Uptime", "Container"]);

    for machine in machines {
        table.add_row(vec![
            machine.id.clone(),
            truncate(&machine.name, 25),
            truncate(&machine.image, 30),
            machine.ram.to_string(),
            machine.core.to_string(),
            status_label(machine.status).to_string(),
            machine.uptime.clone(),
            machine
                .container_id
                .as_ref()
                .map(|c| truncate(c.as_str(), 12))
                .unwrap_or_else(|| "—".to_string()),
        ]);
    }
    table
}

pub fn files_table(entries: &[FileEntry]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Name", "Type"]);

    for entry in entries {
        let (name, kind) = match entry.kind {
            FileKind::Folder => (format!("{}/", entry.name).blue().to_string(), "folder"),
            FileKind::File => (entry.name.clone(), "file"),
        };
        table.add_row(vec![name, kind.to_string()]);
    }
    table
}

pub fn usage_table(samples: &[UsageSample]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Time", "CPU", "Memory", "Limit", "Net RX", "Net TX"]);

    for sample in samples {
        table.add_row(vec![
            sample.timestamp.format("%H:%M:%S").to_string(),
            sample.cpu_percent.clone(),
            sample.mem_usage.clone(),
            sample.mem_limit.clone(),
            sample.net_rx.clone(),
            sample.net_tx.clone(),
        ]);
    }
    table
}

pub fn settings_lines(settings: &MachineSettings) -> Vec<String> {
    let or_none = |value: &str| {
        if value.trim().is_empty() {
            "(none)".dimmed().to_string()
        } else {
            value.to_string()
        }
    };

    vec![
        format!("{} {}", "Install command:".bold(), or_none(&settings.install_command)),
        format!("{} {}", "Build command:  ".bold(), or_none(&settings.build_command)),
        format!("{} {}", "Run command:    ".bold(), or_none(&settings.run_command)),
        format!("{} {}", "Forwarding port:".bold(), settings.forwarding_port),
        format!("{} {}", "Unique path:    ".bold(), settings.unique_path),
    ]
}
