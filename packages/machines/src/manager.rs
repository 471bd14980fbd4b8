// ABOUTME: Lifecycle orchestrator driving machines through create, start, stop and delete
// ABOUTME: Owns the record store, container driver, log sessions, usage history and activity log

use crate::activity::ActivityLog;
use crate::artifacts::{self, ArtifactOptions, TunnelOptions, DOCKERFILE, TUNNEL_BINARY, TUNNEL_SCRIPT};
use crate::error::{MachineError, Result};
use crate::files::MachineFiles;
use crate::locks::MachineLocks;
use crate::logs::{send_notice, LogSession, LogSessionRegistry, SessionEnd};
use crate::runtime::{ContainerDriver, DockerCli, RunSpec, VolumeMount};
use crate::storage::{validate_machine_id, MachineStore};
use crate::types::{
    format_uptime, ContainerRef, MachineRecord, MachineSettings, MachineStatus, MachineView,
    RuntimeStatus, UsageSample, UPTIME_NOT_AVAILABLE,
};
use crate::usage::UsageHistory;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use vmweb_config::Config;

/// Mount point of the machine's file root inside its container
pub const WORKSPACE_MOUNT: &str = "/workspace";

const ZERO_UPTIME: &str = "0h 0m 0s";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMachineRequest {
    pub name: String,
    pub ram_gb: u32,
    pub core: u32,
    pub image: String,
}

/// Outcome of a usage request. Missing or stopped containers are reported in-band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum UsageReport {
    Sample(UsageSample),
    Unavailable(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Machines whose containers were rebuilt and relaunched
    pub restarted: Vec<String>,
    /// Machine id and failure detail for each relaunch that failed
    pub failed: Vec<(String, String)>,
    /// Records not marked running, left untouched
    pub skipped: usize,
}

/// Container lifecycle orchestrator.
///
/// Every start, stop, delete and settings update holds a per-machine lease for
/// its whole duration, so two transitions on the same machine never interleave.
/// Operations on different machines proceed in parallel.
#[derive(Clone)]
pub struct MachineManager {
    config: Arc<Config>,
    store: MachineStore,
    driver: Arc<dyn ContainerDriver>,
    locks: MachineLocks,
    log_sessions: LogSessionRegistry,
    usage: UsageHistory,
    activity: ActivityLog,
}

impl MachineManager {
    pub fn new(config: Config, driver: Arc<dyn ContainerDriver>) -> Self {
        Self {
            store: MachineStore::new(config.workspace_dir.clone()),
            usage: UsageHistory::new(config.usage_history_limit),
            activity: ActivityLog::new(config.activity_log_path.clone(), config.activity_log_limit),
            locks: MachineLocks::new(),
            log_sessions: LogSessionRegistry::new(),
            config: Arc::new(config),
            driver,
        }
    }

    /// Manager backed by the runtime CLI named in the config
    pub fn with_docker(config: Config) -> Self {
        let driver = Arc::new(DockerCli::from_config(&config));
        Self::new(config, driver)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &MachineStore {
        &self.store
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn log_sessions(&self) -> &LogSessionRegistry {
        &self.log_sessions
    }

    pub async fn runtime_available(&self) -> bool {
        self.driver.is_available().await
    }

    pub async fn create_machine(&self, request: CreateMachineRequest) -> Result<MachineRecord> {
        let record = MachineRecord::new(&request.name, request.ram_gb, request.core, &request.image)?;
        self.store.create(&record).await?;

        let dir = self.store.machine_dir(&record.id)?;
        self.copy_tunnel_assets(&dir).await;

        info!("Created machine {} ({})", record.name, record.id);
        self.activity
            .append(&format!("Machine '{}' ({}) created.", record.name, record.id))
            .await;
        Ok(record)
    }

    async fn copy_tunnel_assets(&self, dir: &Path) {
        for asset in [TUNNEL_BINARY, TUNNEL_SCRIPT] {
            let source = self.config.tunnel_assets_dir.join(asset);
            if let Err(e) = fs::copy(&source, dir.join(asset)).await {
                warn!(
                    "Could not copy tunnel asset {} into {}: {}",
                    source.display(),
                    dir.display(),
                    e
                );
            }
        }
    }

    pub async fn get_machine(&self, id: &str) -> Result<MachineRecord> {
        self.store.load(id).await
    }

    /// All machines with display status and uptime. Runtime lookups run
    /// concurrently; a failed lookup only affects its own machine.
    pub async fn list_machines(&self) -> Result<Vec<MachineView>> {
        let records = self.store.list().await?;
        Ok(join_all(records.into_iter().map(|record| self.view(record))).await)
    }

    async fn view(&self, record: MachineRecord) -> MachineView {
        let mut view = MachineView {
            id: record.id.clone(),
            name: record.name.clone(),
            ram: record.ram,
            core: record.core,
            image: record.image.clone(),
            status: record.status,
            uptime: UPTIME_NOT_AVAILABLE.to_string(),
            container_id: record.container_id.clone(),
        };

        // A live query mid-transition is unreliable, so the persisted status wins
        if record.status.is_transitional() {
            return view;
        }

        match self.driver.find_by_label(&record.id).await {
            Ok(Some(summary)) => {
                view.status = summary.status.into();
                view.uptime = if summary.status == RuntimeStatus::Running {
                    format_uptime(&summary.created_at, Utc::now())
                } else {
                    ZERO_UPTIME.to_string()
                };
                if !summary.image.is_empty() {
                    view.image = summary.image;
                }
                view.container_id = Some(summary.container);
            }
            Ok(None) => {
                view.status = MachineStatus::Stopped;
                view.uptime = ZERO_UPTIME.to_string();
                view.container_id = None;
            }
            Err(e) => {
                warn!("Could not query container for machine {}: {}", record.id, e);
                view.status = MachineStatus::Unknown;
            }
        }
        view
    }

    pub async fn get_settings(&self, id: &str) -> Result<MachineSettings> {
        Ok(self.store.load(id).await?.effective_settings())
    }

    /// Replace the settings block. Allowed in any status; a running machine
    /// picks the new settings up on its next start.
    pub async fn update_settings(&self, id: &str, settings: MachineSettings) -> Result<MachineSettings> {
        settings.validate()?;

        validate_machine_id(id)?;
        let _lease = self.locks.acquire(id).await;
        let mut record = self.store.load(id).await?;
        if record.status != MachineStatus::Stopped {
            warn!(
                "Updating settings of machine {} while it is {}",
                id, record.status
            );
        }

        record.settings = settings;
        self.store.save(&record).await?;

        info!("Updated settings for machine {}", id);
        self.activity
            .append(&format!("Machine {}: Settings updated.", id))
            .await;
        Ok(record.effective_settings())
    }

    /// Clean start: regenerate artifacts, replace any existing container,
    /// rebuild the image and launch a fresh container.
    pub async fn start_machine(&self, id: &str) -> Result<MachineRecord> {
        validate_machine_id(id)?;
        let _lease = self.locks.acquire(id).await;
        let mut record = self.store.load(id).await?;
        let dir = self.store.machine_dir(id)?;

        self.write_artifacts(&record, &dir).await?;

        record.status = MachineStatus::Starting;
        self.store.save(&record).await?;
        info!("Starting machine {} ({})", record.name, id);

        match self.launch(&mut record, &dir).await {
            Ok(()) => {
                self.activity
                    .append(&format!(
                        "Machine '{}' ({}) started with status {}.",
                        record.name, id, record.status
                    ))
                    .await;
                Ok(record)
            }
            Err(e) => {
                self.record_failure(&mut record, "start", &e).await;
                Err(e)
            }
        }
    }

    async fn write_artifacts(&self, record: &MachineRecord, dir: &Path) -> Result<()> {
        let options = self.artifact_options(dir).await;
        artifacts::generate(record, &options).write_to(dir).await?;
        debug!("Wrote build artifacts for machine {}", record.id);
        Ok(())
    }

    async fn artifact_options(&self, dir: &Path) -> ArtifactOptions {
        let binary = fs::try_exists(dir.join(TUNNEL_BINARY)).await.unwrap_or(false);
        let script = fs::try_exists(dir.join(TUNNEL_SCRIPT)).await.unwrap_or(false);

        if !(binary && script) {
            debug!("Tunnel assets missing in {}, building without tunnel", dir.display());
            return ArtifactOptions::default();
        }

        ArtifactOptions {
            tunnel: Some(TunnelOptions {
                short_link_url: self.config.shortlink_url.clone(),
                authorization: self.config.shortlink_token.clone(),
            }),
        }
    }

    /// Everything after the record is marked starting: replace, build, run, inspect.
    async fn launch(&self, record: &mut MachineRecord, dir: &Path) -> Result<()> {
        self.remove_existing(&record.id).await;

        let image = self.driver.build(dir, &record.image_tag()).await?;
        let files = fs::canonicalize(self.store.files_dir(&record.id)?).await?;

        let spec = RunSpec {
            image,
            name: record.container_name(),
            memory: record.ram,
            cpus: record.core,
            labels: self.labels(record),
            mounts: vec![VolumeMount {
                host_path: files,
                container_path: WORKSPACE_MOUNT.to_string(),
            }],
        };
        let container = self.driver.run(&spec).await?;
        record.container_id = Some(container.clone());

        record.status = match self.driver.inspect_status(&container).await {
            Ok(Some(state)) => state.status.into(),
            Ok(None) => {
                warn!("Container {} vanished right after launch", container);
                MachineStatus::Unknown
            }
            Err(e) => {
                warn!("Could not inspect container {}: {}", container, e);
                MachineStatus::Unknown
            }
        };

        self.store.save(record).await?;
        info!(
            "Machine {} launched in container {} ({})",
            record.id, container, record.status
        );
        Ok(())
    }

    fn labels(&self, record: &MachineRecord) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.config.label("machine_id"), record.id.clone()),
            (self.config.label("machine_name"), record.name.clone()),
            (self.config.label("ram"), record.ram.to_string()),
            (self.config.label("core"), record.core.to_string()),
        ])
    }

    /// Stop and remove whatever container currently carries the machine label
    async fn remove_existing(&self, id: &str) {
        let existing = match self.driver.find_by_label(id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => return,
            Err(e) => {
                warn!("Could not look up existing container for machine {}: {}", id, e);
                return;
            }
        };

        info!(
            "Removing existing container {} for machine {}",
            existing.container, id
        );
        if existing.status == RuntimeStatus::Running {
            if let Err(e) = self.driver.stop(&existing.container).await {
                warn!("Failed to stop container {}: {}", existing.container, e);
            }
        }
        if let Err(e) = self.driver.remove(&existing.container).await {
            warn!("Failed to remove container {}: {}", existing.container, e);
        }
    }

    /// Persist `Error` so a failed transition never leaves the machine starting forever
    async fn record_failure(&self, record: &mut MachineRecord, action: &str, cause: &MachineError) {
        error!("Failed to {} machine {}: {}", action, record.id, cause);
        record.status = MachineStatus::Error;
        record.container_id = None;

        if let Err(e) = self.store.save(record).await {
            error!("Could not persist error status for machine {}: {}", record.id, e);
        }
        self.activity
            .append(&format!("Machine {}: Failed to {}: {}", record.id, action, cause))
            .await;
    }

    pub async fn stop_machine(&self, id: &str) -> Result<MachineRecord> {
        validate_machine_id(id)?;
        let _lease = self.locks.acquire(id).await;
        let mut record = self.store.load(id).await?;
        let Some(container) = record.container_id.clone() else {
            return Err(MachineError::NoContainer(id.to_string()));
        };

        record.status = MachineStatus::Stopping;
        self.store.save(&record).await?;
        info!("Stopping machine {} (container {})", id, container);

        match self.halt(&container).await {
            Ok(status) => {
                record.status = status;
                if status != MachineStatus::Unknown {
                    record.container_id = None;
                }
                self.store.save(&record).await?;
                self.activity
                    .append(&format!("Machine '{}' ({}) stopped.", record.name, id))
                    .await;
                Ok(record)
            }
            Err(e) => {
                error!("Failed to stop machine {}: {}", id, e);
                record.status = self.observed_status(&container).await;
                if record.status == MachineStatus::Stopped {
                    record.container_id = None;
                }
                if let Err(save) = self.store.save(&record).await {
                    error!("Could not persist status for machine {}: {}", id, save);
                }
                Err(e)
            }
        }
    }

    /// Stop the container if it runs; otherwise only normalize the status
    async fn halt(&self, container: &ContainerRef) -> Result<MachineStatus> {
        match self.driver.inspect_status(container).await? {
            Some(state) if state.status == RuntimeStatus::Running => {
                self.driver.stop(container).await?;
                Ok(MachineStatus::Stopped)
            }
            Some(state) if state.status == RuntimeStatus::Unknown => {
                warn!("Container {} is in an unrecognized state", container);
                Ok(MachineStatus::Unknown)
            }
            Some(_) => Ok(MachineStatus::Stopped),
            None => {
                debug!("Container {} no longer exists", container);
                Ok(MachineStatus::Stopped)
            }
        }
    }

    /// Best known status after a failed stop
    async fn observed_status(&self, container: &ContainerRef) -> MachineStatus {
        match self.driver.inspect_status(container).await {
            Ok(Some(state)) => state.status.into(),
            Ok(None) => MachineStatus::Stopped,
            Err(_) => MachineStatus::Error,
        }
    }

    /// Remove the machine directory, then any container carrying its label.
    /// Both sides tolerate being already gone; `MachineNotFound` is returned
    /// only when neither existed.
    pub async fn delete_machine(&self, id: &str) -> Result<()> {
        validate_machine_id(id)?;
        let _lease = self.locks.acquire(id).await;
        self.log_sessions.terminate(id);

        let dir_removed = match self.store.remove(id).await {
            Ok(()) => true,
            Err(MachineError::MachineNotFound(_)) => {
                debug!("Machine directory for {} already absent", id);
                false
            }
            Err(e) => return Err(e),
        };

        let container_removed = match self.driver.find_by_label(id).await {
            Ok(Some(existing)) => {
                if let Err(e) = self.driver.stop(&existing.container).await {
                    debug!("Stop of container {} failed: {}", existing.container, e);
                }
                match self.driver.remove(&existing.container).await {
                    Ok(()) => {
                        info!("Removed container {} for machine {}", existing.container, id);
                        true
                    }
                    Err(e) => {
                        warn!("Failed to remove container {}: {}", existing.container, e);
                        false
                    }
                }
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Could not look up container for machine {}: {}", id, e);
                false
            }
        };

        self.usage.clear(id).await;

        if !dir_removed && !container_removed {
            return Err(MachineError::MachineNotFound(id.to_string()));
        }

        info!("Deleted machine {}", id);
        self.activity
            .append(&format!("Machine {} deleted.", id))
            .await;
        Ok(())
    }

    /// Startup sweep: relaunch every machine recorded as running.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for candidate in self.store.list().await? {
            if candidate.status != MachineStatus::Running {
                report.skipped += 1;
                continue;
            }

            let id = candidate.id;
            let _lease = self.locks.acquire(&id).await;
            // Re-read under the lease; a concurrent transition may have changed it
            let mut record = match self.store.load(&id).await {
                Ok(record) if record.status == MachineStatus::Running => record,
                Ok(_) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    report.failed.push((id, e.to_string()));
                    continue;
                }
            };

            info!("Reconciling machine {}", id);
            match self.relaunch(&mut record).await {
                Ok(()) => {
                    self.activity
                        .append(&format!("Machine {}: Restarted after orchestrator restart.", id))
                        .await;
                    report.restarted.push(id);
                }
                Err(e) => {
                    self.record_failure(&mut record, "restart", &e).await;
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        info!(
            "Reconciliation finished: {} restarted, {} failed, {} skipped",
            report.restarted.len(),
            report.failed.len(),
            report.skipped
        );
        Ok(report)
    }

    async fn relaunch(&self, record: &mut MachineRecord) -> Result<()> {
        let dir = self.store.machine_dir(&record.id)?;
        if !fs::try_exists(dir.join(DOCKERFILE)).await? {
            self.write_artifacts(record, &dir).await?;
        }
        self.launch(record, &dir).await
    }

    /// Follow the machine's container logs into `sink`. A machine without a
    /// running container gets one explanatory line instead of a stream.
    pub async fn stream_logs(&self, id: &str, sink: mpsc::Sender<String>) -> Result<SessionEnd> {
        let record = self.store.load(id).await?;

        let Some(container) = record.container_id else {
            send_notice(
                &sink,
                "Machine not started, no Docker logs available. Start the machine first.",
            )
            .await;
            return Ok(SessionEnd::Unavailable);
        };

        if let Some(notice) = self.unavailable_notice(&container, "Logs unavailable", true).await {
            send_notice(&sink, notice).await;
            return Ok(SessionEnd::Unavailable);
        }

        let ticket = self.log_sessions.register(id);
        let follower = match self
            .driver
            .follow_logs(&container, self.config.log_tail_lines)
            .await
        {
            Ok(follower) => follower,
            Err(e) => {
                warn!("Could not follow logs of container {}: {}", container, e);
                send_notice(&sink, format!("--- LOG STREAM ERROR: {} ---", e)).await;
                return Ok(SessionEnd::Unavailable);
            }
        };

        Ok(LogSession::new(follower, ticket, self.config.log_kill_grace)
            .run(sink)
            .await)
    }

    /// Explanation for a container that cannot be observed, or `None` when it runs
    async fn unavailable_notice(
        &self,
        container: &ContainerRef,
        what: &str,
        hint: bool,
    ) -> Option<String> {
        match self.driver.inspect_status(container).await {
            Ok(Some(state)) if state.status == RuntimeStatus::Running => None,
            Ok(Some(state)) => Some(if hint {
                format!(
                    "Docker container is {}. {}. Start the machine to view live logs.",
                    MachineStatus::from(state.status),
                    what
                )
            } else {
                format!(
                    "Docker container is {}. {}.",
                    MachineStatus::from(state.status),
                    what
                )
            }),
            Ok(None) => Some(format!(
                "Docker container with ID {} not found. It might have been removed manually. {}.",
                container, what
            )),
            Err(e) => Some(format!(
                "Error inspecting Docker container {}: {}. {}.",
                container, e, what
            )),
        }
    }

    /// Take one resource sample and append it to the machine's history
    pub async fn usage_snapshot(&self, id: &str) -> Result<UsageReport> {
        let record = self.store.load(id).await?;

        let Some(container) = record.container_id else {
            return Ok(UsageReport::Unavailable(
                "Machine not started, no Docker usage data available. Start the machine first."
                    .to_string(),
            ));
        };

        if let Some(notice) = self
            .unavailable_notice(&container, "Usage data unavailable", false)
            .await
        {
            return Ok(UsageReport::Unavailable(notice));
        }

        match self.driver.stats(&container).await {
            Ok(sample) => {
                // Deletion clears the history after removing the record
                self.usage
                    .record_if(id, sample.clone(), self.store.exists(id))
                    .await;
                Ok(UsageReport::Sample(sample))
            }
            Err(e) => {
                warn!("Could not sample usage of container {}: {}", container, e);
                Ok(UsageReport::Unavailable(format!(
                    "Error fetching Docker usage data: {}",
                    e
                )))
            }
        }
    }

    /// Samples taken so far, oldest first; empty for unknown machines
    pub async fn usage_history(&self, id: &str) -> Vec<UsageSample> {
        self.usage.snapshot(id).await
    }

    /// Sandboxed file manager for the machine's file root
    pub async fn files(&self, id: &str) -> Result<MachineFiles> {
        if !self.store.exists(id).await {
            return Err(MachineError::MachineNotFound(id.to_string()));
        }
        Ok(MachineFiles::new(self.store.files_dir(id)?).with_activity(id, self.activity.clone()))
    }
}
