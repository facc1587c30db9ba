//! Engine configuration types and loading

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::stages::{Stage, StageRestrictions};
use crate::watcher::{ExhaustionThresholds, WatcherConfig};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM driver configuration
    pub llm: LlmConfig,

    /// Conductor loop settings
    pub conductor: ConductorSettings,

    /// Context watcher thresholds and timers
    pub watcher: WatcherSettings,

    /// State persistence
    pub state: StateConfig,

    /// Per-stage overrides (restriction profiles)
    pub stages: HashMap<String, StageOverride>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // Explicit path must load or the command fails
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config
        let local_config = PathBuf::from(".missiond.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("missiond").join("missiond.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Restriction overrides keyed by parsed stage; unknown stage names
    /// are warned about and dropped.
    pub fn stage_restriction_overrides(&self) -> HashMap<Stage, StageRestrictions> {
        let mut overrides = HashMap::new();
        for (name, stage_config) in &self.stages {
            let Ok(stage) = name.parse::<Stage>() else {
                warn!(stage = %name, "Ignoring restriction override for unknown stage");
                continue;
            };
            if let Some(restrictions) = &stage_config.restrictions {
                overrides.insert(stage, restrictions.clone().into());
            }
        }
        overrides
    }
}

/// LLM driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name, selects the ground-rules overlay
    pub provider: String,

    /// Agent CLI command
    pub command: String,

    /// Arguments passed to the CLI
    pub args: Vec<String>,

    /// Per-turn timeout in seconds
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "claude".to_string(),
            command: "claude".to_string(),
            args: vec!["-p".to_string()],
            timeout_secs: 3600,
        }
    }
}

/// Conductor loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorSettings {
    /// Retriable-error budget
    #[serde(rename = "max-restarts")]
    pub max_restarts: u32,

    /// Backstop on total turns
    #[serde(rename = "max-turns")]
    pub max_turns: u32,
}

impl Default for ConductorSettings {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            max_turns: 500,
        }
    }
}

/// Context watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    /// Graceful handoff threshold (cache-creation tokens)
    #[serde(rename = "graceful-threshold")]
    pub graceful_threshold: u64,

    /// Emergency handoff threshold (cache-creation tokens)
    #[serde(rename = "emergency-threshold")]
    pub emergency_threshold: u64,

    /// Cache-read ceiling below which exhaustion is considered
    #[serde(rename = "low-cache-read")]
    pub low_cache_read: u64,

    /// Tail cadence in milliseconds
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Time-based handoff delay in minutes
    #[serde(rename = "time-handoff-minutes")]
    pub time_handoff_minutes: u64,

    #[serde(rename = "time-handoff-enabled")]
    pub time_handoff_enabled: bool,

    /// Idle session cleanup threshold in seconds
    #[serde(rename = "stale-timeout-secs")]
    pub stale_timeout_secs: u64,

    /// Root of the per-workspace transcript tree
    #[serde(rename = "transcript-root")]
    pub transcript_root: Option<PathBuf>,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            graceful_threshold: 130_000,
            emergency_threshold: 140_000,
            low_cache_read: 5_000,
            poll_interval_ms: 1_000,
            time_handoff_minutes: 55,
            time_handoff_enabled: true,
            stale_timeout_secs: 300,
            transcript_root: None,
        }
    }
}

impl From<&WatcherSettings> for WatcherConfig {
    fn from(settings: &WatcherSettings) -> Self {
        Self {
            thresholds: ExhaustionThresholds {
                graceful: settings.graceful_threshold,
                emergency: settings.emergency_threshold,
                low_cache_read: settings.low_cache_read,
            },
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            time_handoff: Duration::from_secs(settings.time_handoff_minutes * 60),
            time_handoff_enabled: settings.time_handoff_enabled,
            stale_timeout: Duration::from_secs(settings.stale_timeout_secs),
        }
    }
}

/// State persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Path of the mission JSON document
    #[serde(rename = "mission-path")]
    pub mission_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            mission_path: PathBuf::from("state/mission.json"),
        }
    }
}

/// Per-stage configuration override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOverride {
    pub restrictions: Option<RestrictionOverride>,
}

/// Restriction profile as written in config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestrictionOverride {
    #[serde(rename = "allowed-tools")]
    pub allowed_tools: Vec<String>,
    #[serde(rename = "blocked-tools")]
    pub blocked_tools: Vec<String>,
    #[serde(rename = "allowed-write-paths")]
    pub allowed_write_paths: Vec<String>,
    #[serde(rename = "forbidden-write-paths")]
    pub forbidden_write_paths: Vec<String>,
    #[serde(rename = "allow-bash")]
    pub allow_bash: bool,
    #[serde(rename = "read-only")]
    pub read_only: bool,
}

impl From<RestrictionOverride> for StageRestrictions {
    fn from(value: RestrictionOverride) -> Self {
        Self {
            allowed_tools: value.allowed_tools,
            blocked_tools: value.blocked_tools,
            allowed_write_paths: value.allowed_write_paths,
            forbidden_write_paths: value.forbidden_write_paths,
            allow_bash: value.allow_bash,
            read_only: value.read_only,
        }
    }
}
