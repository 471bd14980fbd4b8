// ABOUTME: Container driver backed by the docker CLI
// ABOUTME: Every call passes explicit arguments; output is parsed from tab-separated --format templates

use super::{
    ContainerDriver, ContainerState, ContainerSummary, DriverError, FollowerExit, LogFollower,
    Result, RunSpec,
};
use crate::types::{ContainerRef, RuntimeStatus, UsageSample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vmweb_config::Config;

const INSPECT_FORMAT: &str = "{{.State.Status}}\t{{.Config.Image}}";
const PS_FORMAT: &str = "{{.ID}}\t{{.Status}}\t{{.Image}}\t{{.CreatedAt}}";
const STATS_FORMAT: &str = "{{.CPUPerc}}\t{{.MemUsage}}\t{{.NetIO}}";

/// Build output lines kept for the error report when a build fails
const BUILD_OUTPUT_TAIL: usize = 40;

fn spawn_error(binary: &str, e: std::io::Error) -> DriverError {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => DriverError::Unavailable {
            binary: binary.to_string(),
            reason: e.to_string(),
        },
        _ => DriverError::Io(e),
    }
}

fn command_line(binary: &str, args: &[String]) -> String {
    format!("{} {}", binary, args.join(" "))
}

/// Run a command to completion, capturing output. A non-zero exit becomes
/// `CommandFailed` carrying stderr; a missing binary becomes `Unavailable`.
pub(crate) async fn run_captured(binary: &str, args: &[String], cwd: Option<&Path>) -> Result<Output> {
    let mut cmd = Command::new(binary);
    cmd.args(args).stdin(Stdio::null());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd.output().await.map_err(|e| spawn_error(binary, e))?;

    if !output.status.success() {
        return Err(DriverError::CommandFailed {
            command: command_line(binary, args),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output)
}

/// Forward each line of `reader` into `tx` until EOF or the receiver is gone
fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

/// Spawn with stdout and stderr merged into one line channel
fn spawn_merged(binary: &str, mut cmd: Command) -> Result<(Child, mpsc::UnboundedReceiver<String>)> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| spawn_error(binary, e))?;

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx);
    }

    Ok((child, rx))
}

fn is_missing_container(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such object") || lower.contains("no such container")
}

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    machine_label: String,
}

impl DockerCli {
    /// `machine_label` is the label key carrying the machine id
    pub fn new(binary: impl Into<String>, machine_label: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            machine_label: machine_label.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.docker_bin.clone(), config.label("machine_id"))
    }

    async fn docker(&self, args: &[String]) -> Result<String> {
        let output = run_captured(&self.binary, args, None).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// `docker run` arguments for a spec, image last
pub fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut out = args(["run", "--name", &spec.name, "-d"]);
    for (key, value) in &spec.labels {
        out.push("-l".to_string());
        out.push(format!("{}={}", key, value));
    }
    for mount in &spec.mounts {
        out.push("-v".to_string());
        out.push(format!(
            "{}:{}",
            mount.host_path.display(),
            mount.container_path
        ));
    }
    out.push(format!("--memory={}", spec.memory.runtime_arg()));
    out.push(format!("--cpus={}", spec.cpus));
    out.push(spec.image.clone());
    out
}

/// Parse one `{{.State.Status}}\t{{.Config.Image}}` line
pub fn parse_inspect_line(line: &str) -> Result<ContainerState> {
    let mut parts = line.trim().splitn(2, '\t');
    let state = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DriverError::Parse(format!("empty inspect output: {:?}", line)))?;
    Ok(ContainerState {
        status: RuntimeStatus::from_state(state),
        image: parts.next().unwrap_or_default().trim().to_string(),
    })
}

/// Parse one `{{.ID}}\t{{.Status}}\t{{.Image}}\t{{.CreatedAt}}` line
pub fn parse_ps_line(line: &str) -> Result<ContainerSummary> {
    let fields: Vec<&str> = line.trim().split('\t').collect();
    match fields.as_slice() {
        [id, status, image, created_at, ..] if !id.is_empty() => Ok(ContainerSummary {
            container: ContainerRef::from(*id),
            status: RuntimeStatus::from_ps_status(status),
            raw_status: status.to_string(),
            image: image.to_string(),
            created_at: created_at.to_string(),
        }),
        _ => Err(DriverError::Parse(format!(
            "unexpected container listing: {:?}",
            line
        ))),
    }
}

fn split_pair(value: &str) -> (String, String) {
    match value.split_once(" / ") {
        Some((left, right)) => (left.trim().to_string(), right.trim().to_string()),
        None => (value.trim().to_string(), String::new()),
    }
}

/// Parse one `{{.CPUPerc}}\t{{.MemUsage}}\t{{.NetIO}}` line
pub fn parse_stats_line(line: &str, timestamp: DateTime<Utc>) -> Result<UsageSample> {
    let fields: Vec<&str> = line.trim().split('\t').collect();
    let [cpu, mem, net] = fields.as_slice() else {
        return Err(DriverError::Parse(format!(
            "unexpected stats output: {:?}",
            line
        )));
    };

    let (mem_usage, mem_limit) = split_pair(mem);
    let (net_rx, net_tx) = split_pair(net);

    Ok(UsageSample {
        timestamp,
        cpu_percent: cpu.trim().to_string(),
        mem_usage,
        mem_limit,
        net_rx,
        net_tx,
    })
}

#[async_trait]
impl ContainerDriver for DockerCli {
    async fn is_available(&self) -> bool {
        self.docker(&args(["version", "--format", "{{.Server.Version}}"]))
            .await
            .is_ok()
    }

    async fn build(&self, context: &Path, tag: &str) -> Result<String> {
        let build_args = args(["build", "--no-cache", "-t", tag, "."]);
        info!("Building image {} in {}", tag, context.display());

        let mut cmd = Command::new(&self.binary);
        cmd.args(&build_args).current_dir(context);
        let (mut child, mut lines) = spawn_merged(&self.binary, cmd)?;

        let mut tail = VecDeque::with_capacity(BUILD_OUTPUT_TAIL);
        while let Some(line) = lines.recv().await {
            debug!("[build {}] {}", tag, line);
            if tail.len() == BUILD_OUTPUT_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child.wait().await?;
        if !status.success() {
            warn!("Image build for {} failed with {}", tag, status);
            return Err(DriverError::CommandFailed {
                command: command_line(&self.binary, &build_args),
                code: status.code(),
                stderr: Vec::from(tail).join("\n"),
            });
        }

        info!("Built image {}", tag);
        Ok(tag.to_string())
    }

    async fn run(&self, spec: &RunSpec) -> Result<ContainerRef> {
        let id = self.docker(&run_args(spec)).await?;
        if id.is_empty() {
            return Err(DriverError::Parse(
                "run returned no container id".to_string(),
            ));
        }
        info!("Started container {} ({})", spec.name, id);
        Ok(ContainerRef(id))
    }

    async fn stop(&self, container: &ContainerRef) -> Result<()> {
        self.docker(&args(["stop", container.as_str()])).await?;
        info!("Stopped container {}", container);
        Ok(())
    }

    async fn remove(&self, container: &ContainerRef) -> Result<()> {
        self.docker(&args(["rm", "--force", container.as_str()]))
            .await?;
        info!("Removed container {}", container);
        Ok(())
    }

    async fn inspect_status(&self, container: &ContainerRef) -> Result<Option<ContainerState>> {
        match self
            .docker(&args(["inspect", "--format", INSPECT_FORMAT, container.as_str()]))
            .await
        {
            Ok(stdout) => parse_inspect_line(&stdout).map(Some),
            Err(DriverError::CommandFailed { stderr, .. }) if is_missing_container(&stderr) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn find_by_label(&self, machine_id: &str) -> Result<Option<ContainerSummary>> {
        let filter = format!("label={}={}", self.machine_label, machine_id);
        let stdout = self
            .docker(&args(["ps", "-a", "--filter", &filter, "--format", PS_FORMAT]))
            .await?;

        match stdout.lines().find(|l| !l.trim().is_empty()) {
            Some(line) => parse_ps_line(line).map(Some),
            None => Ok(None),
        }
    }

    async fn follow_logs(
        &self,
        container: &ContainerRef,
        tail_lines: usize,
    ) -> Result<Box<dyn LogFollower>> {
        let tail = tail_lines.to_string();
        let mut cmd = Command::new(&self.binary);
        cmd.args(["logs", "--tail", tail.as_str(), "-f", container.as_str()]);
        let (child, lines) = spawn_merged(&self.binary, cmd)?;

        debug!("Following logs of {} (pid {:?})", container, child.id());
        Ok(Box::new(ProcessLogFollower { child, lines }))
    }

    async fn stats(&self, container: &ContainerRef) -> Result<UsageSample> {
        let stdout = self
            .docker(&args([
                "stats",
                "--no-stream",
                "--format",
                STATS_FORMAT,
                container.as_str(),
            ]))
            .await?;
        let line = stdout.lines().next().unwrap_or_default();
        parse_stats_line(line, Utc::now())
    }
}

/// Log follower over a child process whose stdout and stderr are merged
pub struct ProcessLogFollower {
    child: Child,
    lines: mpsc::UnboundedReceiver<String>,
}

impl ProcessLogFollower {
    #[cfg(unix)]
    fn terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("Failed to send SIGTERM to log follower {}: {}", pid, e);
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}
}

#[async_trait]
impl LogFollower for ProcessLogFollower {
    async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    async fn finish(mut self: Box<Self>, grace: Duration) -> FollowerExit {
        if let Ok(Some(status)) = self.child.try_wait() {
            return FollowerExit {
                code: status.code(),
                forced: false,
            };
        }

        self.terminate();
        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
            return FollowerExit {
                code: status.code(),
                forced: false,
            };
        }

        warn!("Log follower did not exit within {:?}, killing it", grace);
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill log follower: {}", e);
        }
        FollowerExit {
            code: None,
            forced: true,
        }
    }
}
