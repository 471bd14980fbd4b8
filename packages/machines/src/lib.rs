// ABOUTME: Container-backed machines with persisted records, sandboxed files and live telemetry
// ABOUTME: MachineManager is the entry point; the container runtime sits behind ContainerDriver

pub mod activity;
pub mod artifacts;
pub mod error;
pub mod files;
pub mod locks;
pub mod logs;
pub mod manager;
pub mod runtime;
pub mod shortlink;
pub mod storage;
pub mod types;
pub mod usage;

pub use activity::ActivityLog;
pub use error::{ErrorKind, MachineError, Result};
pub use files::MachineFiles;
pub use logs::{LogSessionRegistry, SessionEnd, END_OF_LOGS};
pub use manager::{CreateMachineRequest, MachineManager, ReconcileReport, UsageReport};
pub use runtime::{
    ContainerDriver, ContainerState, ContainerSummary, DockerCli, DriverError, FollowerExit,
    LogFollower, RunSpec, VolumeMount,
};
pub use shortlink::{PathAvailability, ShortLinkClient};
pub use storage::MachineStore;
pub use types::{
    ContainerRef, FileEntry, FileKind, MachineRecord, MachineSettings, MachineStatus, MachineView,
    MemorySize, RuntimeStatus, UsageSample,
};
pub use usage::UsageHistory;
