// ABOUTME: Container driver trait abstracting the container runtime's CLI surface
// ABOUTME: Build, run, stop, remove, inspect, label lookup, log follow and stats sampling

use crate::types::{ContainerRef, MemorySize, RuntimeStatus, UsageSample};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub mod docker_cli;

pub use docker_cli::DockerCli;

#[derive(Error, Debug)]
pub enum DriverError {
    /// The runtime binary could not be executed at all
    #[error("{binary} is not available: {reason}")]
    Unavailable { binary: String, reason: String },

    /// The runtime ran and reported failure
    #[error("`{command}` failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected runtime output: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

/// Everything needed to launch a machine container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub memory: MemorySize,
    pub cpus: u32,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<VolumeMount>,
}

/// Live state of one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub status: RuntimeStatus,
    pub image: String,
}

/// A container found through its machine label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub container: ContainerRef,
    pub status: RuntimeStatus,
    /// Human status column, e.g. `Up 5 minutes`
    pub raw_status: String,
    pub image: String,
    pub created_at: String,
}

/// How a log follower process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowerExit {
    pub code: Option<i32>,
    /// The follower ignored the graceful stop and was killed
    pub forced: bool,
}

impl FollowerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running `logs --follow`. Lines arrive until the process exits or is finished.
#[async_trait]
pub trait LogFollower: Send {
    async fn next_line(&mut self) -> Option<String>;

    /// Stop following: ask the process to exit, kill it after `grace`.
    async fn finish(self: Box<Self>, grace: Duration) -> FollowerExit;
}

#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Whether the runtime binary responds at all
    async fn is_available(&self) -> bool;

    /// Build the image in `context` and tag it; returns the image reference.
    async fn build(&self, context: &Path, tag: &str) -> Result<String>;

    async fn run(&self, spec: &RunSpec) -> Result<ContainerRef>;

    async fn stop(&self, container: &ContainerRef) -> Result<()>;

    async fn remove(&self, container: &ContainerRef) -> Result<()>;

    /// `None` when the runtime does not know the container
    async fn inspect_status(&self, container: &ContainerRef) -> Result<Option<ContainerState>>;

    /// The container labelled with this machine id, running or not
    async fn find_by_label(&self, machine_id: &str) -> Result<Option<ContainerSummary>>;

    async fn follow_logs(
        &self,
        container: &ContainerRef,
        tail_lines: usize,
    ) -> Result<Box<dyn LogFollower>>;

    async fn stats(&self, container: &ContainerRef) -> Result<UsageSample>;
}
