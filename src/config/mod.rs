//! Daemon configuration, read from `config/craftd.toml` (override the
//! path with `CRAFTD_CONFIG`). Every field has a default so a missing
//! file yields a runnable configuration.

use std::path::PathBuf;

use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "config/craftd.toml";

/// Minecraft's "ready" console line, e.g. `[Server thread/INFO]: Done (5.1s)!`
pub const DEFAULT_READY_PATTERN: &str = r"Done \([0-9.,]+s\)!";

/// Level extraction for Minecraft-style log lines.
pub const DEFAULT_LEVEL_PATTERN: &str = r"/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]";

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct GlobalConfig {
    pub listen_addr: ListenAddr,
    pub server: ServerConfig,
    pub console: ConsoleConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ListenAddr(pub String);

impl Default for ListenAddr {
    fn default() -> Self {
        Self("127.0.0.1:57420".to_string())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Operator-facing server name
    pub name: String,
    /// Server root directory (jar, eula.txt, world)
    pub dir: PathBuf,
    pub java_bin: String,
    pub jvm_args: Vec<String>,
    pub jar_name: String,
    pub world_dir: String,
    /// Regex matched against stdout lines to detect startup completion
    pub ready_pattern: String,
    /// Regex with a `level` capture group for console severity parsing
    pub level_pattern: String,
    /// Command written to stdin for a graceful shutdown
    pub stop_command: String,
    pub start_timeout_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "minecraft".to_string(),
            dir: PathBuf::from("./server"),
            java_bin: "java".to_string(),
            jvm_args: vec!["-Xms1G".to_string(), "-Xmx1G".to_string()],
            jar_name: "server.jar".to_string(),
            world_dir: "world".to_string(),
            ready_pattern: DEFAULT_READY_PATTERN.to_string(),
            level_pattern: DEFAULT_LEVEL_PATTERN.to_string(),
            stop_command: "stop".to_string(),
            start_timeout_secs: 120,
            stop_grace_secs: 30,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ConsoleConfig {
    pub buffer_size: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            buffer_size: crate::console::DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Daily restart trigger, "HH:MM" 24-hour local time. None disables the job.
    pub restart_time: Option<String>,
    /// Daily backup trigger, "HH:MM" 24-hour local time. None disables the job.
    pub backup_time: Option<String>,
    /// Whether a restart job may start a server the operator stopped manually.
    pub restart_when_stopped: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            restart_time: None,
            backup_time: None,
            restart_when_stopped: false,
        }
    }
}

impl GlobalConfig {
    /// Load from `CRAFTD_CONFIG` or the default path. A missing file is
    /// fine (all defaults apply); a malformed file is an error rather
    /// than a silent fallback.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CRAFTD_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> anyhow::Result<Self> {
        if !std::path::Path::new(path).exists() {
            tracing::info!("No config file at {}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path, e))?;
        let cfg: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path, e))?;
        Ok(cfg)
    }
}
