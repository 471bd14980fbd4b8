// ABOUTME: Common test utilities for machine integration tests
// ABOUTME: In-memory container driver fake plus manager setup over a temp workspace

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use vmweb_config::Config;
use vmweb_machines::{
    ContainerDriver, ContainerRef, ContainerState, ContainerSummary, DriverError, FollowerExit,
    LogFollower, MachineManager, RunSpec, RuntimeStatus, UsageSample,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub machine_id: String,
    pub status: RuntimeStatus,
    pub spec: RunSpec,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    calls: Vec<String>,
    fail_build: bool,
    fail_stop: bool,
    broken_lookups: HashSet<String>,
    log_lines: Vec<String>,
    log_exit_code: Option<i32>,
    log_hang: bool,
}

/// Container driver that keeps containers in memory
#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<FakeState>,
    build_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        let driver = Self::default();
        driver.state().log_exit_code = Some(0);
        Arc::new(driver)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn fail_builds(&self, fail: bool) {
        self.state().fail_build = fail;
    }

    pub fn fail_stops(&self, fail: bool) {
        self.state().fail_stop = fail;
    }

    /// Lookups by label for this machine fail as if the runtime were unreachable
    pub fn break_lookup(&self, machine_id: &str) {
        self.state().broken_lookups.insert(machine_id.to_string());
    }

    /// Builds wait until the returned handle is notified
    pub fn gate_builds(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.build_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn script_logs(&self, lines: &[&str], exit_code: Option<i32>, hang: bool) {
        let mut state = self.state();
        state.log_lines = lines.iter().map(|l| l.to_string()).collect();
        state.log_exit_code = exit_code;
        state.log_hang = hang;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state().containers.values().cloned().collect()
    }

    pub fn containers_for(&self, machine_id: &str) -> Vec<FakeContainer> {
        self.containers()
            .into_iter()
            .filter(|c| c.machine_id == machine_id)
            .collect()
    }

    /// Simulate an external change to a container's state
    pub fn set_status(&self, container: &ContainerRef, status: RuntimeStatus) {
        if let Some(c) = self.state().containers.get_mut(container.as_str()) {
            c.status = status;
        }
    }

    /// Simulate the runtime losing every container, e.g. after a host reboot
    pub fn forget_all(&self) {
        self.state().containers.clear();
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }
}

fn failed(command: &str, stderr: &str) -> DriverError {
    DriverError::CommandFailed {
        command: command.to_string(),
        code: Some(1),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn is_available(&self) -> bool {
        true
    }

    async fn build(&self, context: &Path, tag: &str) -> Result<String, DriverError> {
        self.record(format!("build {}", tag));
        assert!(context.join("Dockerfile").is_file(), "build without Dockerfile");

        let gate = self.build_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.state().fail_build {
            return Err(failed("docker build", "step 3/5: pip: command not found"));
        }
        Ok(tag.to_string())
    }

    async fn run(&self, spec: &RunSpec) -> Result<ContainerRef, DriverError> {
        self.record(format!("run {}", spec.name));
        let machine_id = spec
            .labels
            .iter()
            .find(|(key, _)| key.ends_with(".machine_id"))
            .map(|(_, value)| value.clone())
            .unwrap_or_default();

        let mut state = self.state();
        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                machine_id,
                status: RuntimeStatus::Running,
                spec: spec.clone(),
            },
        );
        Ok(ContainerRef(id))
    }

    async fn stop(&self, container: &ContainerRef) -> Result<(), DriverError> {
        self.record(format!("stop {}", container));
        let mut state = self.state();
        if state.fail_stop {
            return Err(failed("docker stop", "daemon timed out"));
        }
        match state.containers.get_mut(container.as_str()) {
            Some(c) => {
                c.status = RuntimeStatus::Stopped;
                Ok(())
            }
            None => Err(failed("docker stop", "No such container")),
        }
    }

    async fn remove(&self, container: &ContainerRef) -> Result<(), DriverError> {
        self.record(format!("remove {}", container));
        match self.state().containers.remove(container.as_str()) {
            Some(_) => Ok(()),
            None => Err(failed("docker rm", "No such container")),
        }
    }

    async fn inspect_status(
        &self,
        container: &ContainerRef,
    ) -> Result<Option<ContainerState>, DriverError> {
        Ok(self
            .state()
            .containers
            .get(container.as_str())
            .map(|c| ContainerState {
                status: c.status,
                image: c.spec.image.clone(),
            }))
    }

    async fn find_by_label(
        &self,
        machine_id: &str,
    ) -> Result<Option<ContainerSummary>, DriverError> {
        let state = self.state();
        if state.broken_lookups.contains(machine_id) {
            return Err(DriverError::Unavailable {
                binary: "docker".to_string(),
                reason: "daemon unreachable".to_string(),
            });
        }

        Ok(state
            .containers
            .iter()
            .find(|(_, c)| c.machine_id == machine_id)
            .map(|(id, c)| ContainerSummary {
                container: ContainerRef(id.clone()),
                status: c.status,
                raw_status: format!("{:?}", c.status),
                image: c.spec.image.clone(),
                created_at: (Utc::now() - chrono::Duration::seconds(3725)).to_rfc3339(),
            }))
    }

    async fn follow_logs(
        &self,
        container: &ContainerRef,
        tail_lines: usize,
    ) -> Result<Box<dyn LogFollower>, DriverError> {
        self.record(format!("logs {} --tail {}", container, tail_lines));
        let state = self.state();
        Ok(Box::new(FakeFollower {
            lines: state.log_lines.iter().cloned().collect(),
            code: state.log_exit_code,
            hang: state.log_hang,
        }))
    }

    async fn stats(&self, container: &ContainerRef) -> Result<UsageSample, DriverError> {
        self.record(format!("stats {}", container));
        Ok(UsageSample {
            timestamp: Utc::now(),
            cpu_percent: "1.50%".to_string(),
            mem_usage: "120MiB".to_string(),
            mem_limit: "2GiB".to_string(),
            net_rx: "1.2kB".to_string(),
            net_tx: "800B".to_string(),
        })
    }
}

struct FakeFollower {
    lines: VecDeque<String>,
    code: Option<i32>,
    hang: bool,
}

#[async_trait]
impl LogFollower for FakeFollower {
    async fn next_line(&mut self) -> Option<String> {
        match self.lines.pop_front() {
            Some(line) => Some(line),
            None if self.hang => std::future::pending().await,
            None => None,
        }
    }

    async fn finish(self: Box<Self>, _grace: Duration) -> FollowerExit {
        FollowerExit {
            code: if self.hang { None } else { self.code },
            forced: self.hang,
        }
    }
}

pub struct TestContext {
    pub manager: MachineManager,
    pub driver: Arc<FakeDriver>,
    pub _temp_dir: TempDir,
}

impl TestContext {
    pub fn workspace(&self) -> PathBuf {
        self.manager.config().workspace_dir.clone()
    }

    pub fn machine_dir(&self, id: &str) -> PathBuf {
        self.workspace().join(format!("container-{}", id))
    }
}

pub fn test_config(root: &Path) -> Config {
    Config {
        workspace_dir: root.join("workspace"),
        activity_log_path: root.join("activity.log"),
        tunnel_assets_dir: root.join("assets"),
        log_kill_grace: Duration::from_millis(10),
        ..Config::default()
    }
}

pub fn setup() -> TestContext {
    setup_with(|_| {})
}

pub fn setup_with(adjust: impl FnOnce(&mut Config)) -> TestContext {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(temp_dir.path());
    adjust(&mut config);

    let driver = FakeDriver::new();
    let manager = MachineManager::new(config, driver.clone());

    TestContext {
        manager,
        driver,
        _temp_dir: temp_dir,
    }
}
