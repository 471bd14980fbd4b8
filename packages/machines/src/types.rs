// ABOUTME: Machine record, settings, status and resource types
// ABOUTME: Structured representations with explicit parse/render at the storage and runtime boundaries

use crate::error::{MachineError, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIN_RAM_GB: u32 = 1;
pub const MAX_RAM_GB: u32 = 8;
pub const MIN_CORES: u32 = 1;
pub const MAX_CORES: u32 = 4;
pub const DEFAULT_FORWARDING_PORT: u16 = 5000;

/// Persisted lifecycle status of a machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MachineStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Unknown,
    Error,
}

impl MachineStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Unknown => "Unknown",
            Self::Error => "Error",
        }
    }

    /// Statuses whose persisted value is trusted over a live runtime query
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container status as reported by the runtime, normalized
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuntimeStatus {
    Running,
    Stopped,
    Starting,
    Stopping,
    Unknown,
}

impl RuntimeStatus {
    /// Normalize a raw `State.Status` value (`running`, `exited`, ...)
    pub fn from_state(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "exited" | "dead" => Self::Stopped,
            "created" | "restarting" => Self::Starting,
            "removing" => Self::Stopping,
            _ => Self::Unknown,
        }
    }

    /// Normalize a human status column from a container listing
    /// (`Up 5 minutes`, `Exited (0) 2 hours ago`, ...)
    pub fn from_ps_status(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("Up") {
            Self::Running
        } else if raw.starts_with("Exited") {
            Self::Stopped
        } else if raw.starts_with("Created") || raw.starts_with("Restarting") {
            Self::Starting
        } else if raw.starts_with("Stopping") || raw.starts_with("Removal") {
            Self::Stopping
        } else {
            Self::Unknown
        }
    }
}

impl From<RuntimeStatus> for MachineStatus {
    fn from(status: RuntimeStatus) -> Self {
        match status {
            RuntimeStatus::Running => Self::Running,
            RuntimeStatus::Stopped => Self::Stopped,
            RuntimeStatus::Starting => Self::Starting,
            RuntimeStatus::Stopping => Self::Stopping,
            RuntimeStatus::Unknown => Self::Unknown,
        }
    }
}

/// Memory limit. Stored as `"2GB"` / `"512MB"`, passed to the runtime as `2g` / `512m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MemorySize {
    Gigabytes(u32),
    Megabytes(u32),
}

impl MemorySize {
    pub fn parse(raw: &str) -> Result<Self> {
        let upper = raw.trim().to_ascii_uppercase();
        let (digits, unit): (&str, fn(u32) -> Self) = if let Some(n) = upper.strip_suffix("GB") {
            (n, Self::Gigabytes)
        } else if let Some(n) = upper.strip_suffix("MB") {
            (n, Self::Megabytes)
        } else {
            (upper.as_str(), Self::Gigabytes)
        };

        digits
            .trim()
            .parse::<u32>()
            .map(unit)
            .map_err(|_| MachineError::Validation(format!("Invalid memory size: {}", raw)))
    }

    /// Value for the runtime's `--memory` flag
    pub fn runtime_arg(&self) -> String {
        match self {
            Self::Gigabytes(n) => format!("{}g", n),
            Self::Megabytes(n) => format!("{}m", n),
        }
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gigabytes(n) => write!(f, "{}GB", n),
            Self::Megabytes(n) => write!(f, "{}MB", n),
        }
    }
}

impl TryFrom<String> for MemorySize {
    type Error = MachineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<MemorySize> for String {
    fn from(value: MemorySize) -> Self {
        value.to_string()
    }
}

/// Per-machine build and run configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineSettings {
    #[serde(default)]
    pub install_command: String,
    #[serde(default)]
    pub build_command: String,
    #[serde(default)]
    pub run_command: String,
    #[serde(default = "default_forwarding_port")]
    pub forwarding_port: u16,
    #[serde(default)]
    pub unique_path: String,
}

fn default_forwarding_port() -> u16 {
    DEFAULT_FORWARDING_PORT
}

impl MachineSettings {
    pub fn with_defaults(machine_id: &str) -> Self {
        Self {
            install_command: String::new(),
            build_command: String::new(),
            run_command: String::new(),
            forwarding_port: DEFAULT_FORWARDING_PORT,
            unique_path: machine_id.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.forwarding_port == 0 {
            return Err(MachineError::Validation(
                "Forwarding port must be between 1 and 65535".to_string(),
            ));
        }
        validate_unique_path(&self.unique_path)
    }
}

/// Unique paths become part of a public URL, so only `[A-Za-z0-9_-]` is allowed.
pub fn validate_unique_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(MachineError::Validation(
            "Unique path cannot be empty".to_string(),
        ));
    }

    if !path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(MachineError::Validation(format!(
            "Unique path '{}' can only contain letters, digits, hyphens and underscores",
            path
        )));
    }

    Ok(())
}

/// Opaque handle to a container instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerRef(pub String);

impl ContainerRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One persisted machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineRecord {
    pub id: String,
    pub name: String,
    pub ram: MemorySize,
    pub core: u32,
    #[serde(rename = "docker_image")]
    pub image: String,
    pub status: MachineStatus,
    pub container_id: Option<ContainerRef>,
    pub settings: MachineSettings,
    pub created_at: DateTime<Utc>,
}

impl MachineRecord {
    /// Build a fresh, stopped record after validating resource limits.
    pub fn new(name: &str, ram_gb: u32, core: u32, image: &str) -> Result<Self> {
        validate_resources(ram_gb, core)?;

        let name = name.trim();
        if name.is_empty() {
            return Err(MachineError::Validation(
                "Machine name cannot be empty".to_string(),
            ));
        }

        let image = image.trim();
        if image.is_empty() {
            return Err(MachineError::Validation(
                "Machine image cannot be empty".to_string(),
            ));
        }

        let id = generate_machine_id();
        Ok(Self {
            settings: MachineSettings::with_defaults(&id),
            id,
            name: name.to_string(),
            ram: MemorySize::Gigabytes(ram_gb),
            core,
            image: image.to_string(),
            status: MachineStatus::Stopped,
            container_id: None,
            created_at: Utc::now(),
        })
    }

    /// Container name: `vmwebgui-<id>-<name lowercased, spaces to dashes>`
    pub fn container_name(&self) -> String {
        format!(
            "vmwebgui-{}-{}",
            self.id,
            self.name.to_lowercase().replace(' ', "-")
        )
    }

    pub fn image_tag(&self) -> String {
        self.id.to_lowercase()
    }

    /// Settings with the unique path falling back to the machine id
    pub fn effective_settings(&self) -> MachineSettings {
        let mut settings = self.settings.clone();
        if settings.unique_path.is_empty() {
            settings.unique_path = self.id.clone();
        }
        settings
    }
}

pub fn validate_resources(ram_gb: u32, core: u32) -> Result<()> {
    if !(MIN_RAM_GB..=MAX_RAM_GB).contains(&ram_gb) {
        return Err(MachineError::Validation(format!(
            "RAM must be between {} and {} GB, got {}",
            MIN_RAM_GB, MAX_RAM_GB, ram_gb
        )));
    }
    if !(MIN_CORES..=MAX_CORES).contains(&core) {
        return Err(MachineError::Validation(format!(
            "Core count must be between {} and {}, got {}",
            MIN_CORES, MAX_CORES, core
        )));
    }
    Ok(())
}

/// 12-character identifier derived from a v4 UUID
pub fn generate_machine_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Folder,
}

/// Entry in a machine's file tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
}

/// Point-in-time resource usage, in the runtime's own display units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: String,
    pub mem_usage: String,
    pub mem_limit: String,
    pub net_rx: String,
    pub net_tx: String,
}

/// Machine as shown in a listing, with live status and uptime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineView {
    pub id: String,
    pub name: String,
    pub ram: MemorySize,
    pub core: u32,
    pub image: String,
    pub status: MachineStatus,
    pub uptime: String,
    pub container_id: Option<ContainerRef>,
}

pub const UPTIME_NOT_AVAILABLE: &str = "N/A";

/// Parse a container creation timestamp. Accepts the listing format
/// (`2024-01-15 10:30:00 +0000 UTC`) and RFC 3339.
pub fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    // Drop the trailing zone abbreviation, keep date, time and offset
    let mut parts = raw.split_whitespace();
    let (date, time, offset) = (parts.next()?, parts.next()?, parts.next()?);
    let time = time.split('.').next().unwrap_or(time);
    DateTime::<FixedOffset>::parse_from_str(
        &format!("{} {} {}", date, time, offset),
        "%Y-%m-%d %H:%M:%S %z",
    )
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}

/// `{h}h {m}m {s}s` since `created`. Unparseable timestamps count from now.
pub fn format_uptime(created: &str, now: DateTime<Utc>) -> String {
    let started = parse_created_at(created).unwrap_or(now);
    let secs = (now - started).num_seconds().max(0);
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}
