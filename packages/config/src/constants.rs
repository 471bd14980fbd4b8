// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across VM Web GUI

// Workspace Layout
pub const VMWEB_WORKSPACE_DIR: &str = "VMWEB_WORKSPACE_DIR";
pub const VMWEB_TUNNEL_ASSETS_DIR: &str = "VMWEB_TUNNEL_ASSETS_DIR";

// Container Runtime
pub const VMWEB_DOCKER_BIN: &str = "VMWEB_DOCKER_BIN";
pub const VMWEB_LABEL_PREFIX: &str = "VMWEB_LABEL_PREFIX";

// Log Streaming
pub const VMWEB_LOG_TAIL_LINES: &str = "VMWEB_LOG_TAIL_LINES";
pub const VMWEB_LOG_KILL_GRACE_MS: &str = "VMWEB_LOG_KILL_GRACE_MS";

// Usage Sampling
pub const VMWEB_USAGE_HISTORY_LIMIT: &str = "VMWEB_USAGE_HISTORY_LIMIT";

// Activity Log
pub const VMWEB_ACTIVITY_LOG: &str = "VMWEB_ACTIVITY_LOG";
pub const VMWEB_ACTIVITY_LOG_LIMIT: &str = "VMWEB_ACTIVITY_LOG_LIMIT";

// Short-link Service
pub const VMWEB_SHORTLINK_URL: &str = "VMWEB_SHORTLINK_URL";
pub const VMWEB_SHORTLINK_TOKEN: &str = "VMWEB_SHORTLINK_TOKEN";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
