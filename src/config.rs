//! Agent configuration: optional YAML file, overridden by CLI flags

use crate::ebpf::ringbuf::OutputFormat;
use crate::trace_log::{TRACE_PATH, TRACE_PIPE_PATH};
use crate::{HooktailError, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PIN_PATH: &str = "/sys/fs/bpf/hooktail_state";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding compiled probe objects
    pub probes_dir: Option<PathBuf>,
    pub fcntl: FcntlConfig,
    pub guard: GuardConfig,
}

/// Agent A: fentry probe streaming over a ring buffer
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FcntlConfig {
    pub object: String,
    pub program: String,
    pub hook: String,
    pub events_map: String,
    pub state_map: String,
    pub pin_path: PathBuf,
    pub output: OutputFormat,
}

impl Default for FcntlConfig {
    fn default() -> Self {
        Self {
            object: "fcntl_probe".to_string(),
            program: "security_file_fcntl".to_string(),
            hook: "security_file_fcntl".to_string(),
            events_map: hooktail_common::EVENTS_MAP.to_string(),
            state_map: hooktail_common::STATE_MAP.to_string(),
            pin_path: PathBuf::from(DEFAULT_PIN_PATH),
            output: OutputFormat::Table,
        }
    }
}

/// Agent B: directly invoked init-guard probe with trace log tail
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    pub object: String,
    pub program: String,
    /// Periodic callback fired while lingering
    pub callback_program: String,
    pub state_map: String,
    pub runs: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub flush_delay: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub callback_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub linger: Duration,
    pub trace_path: PathBuf,
    pub trace_pipe_path: PathBuf,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            object: "guard_probe".to_string(),
            program: "init_guard".to_string(),
            callback_program: "guard_tick".to_string(),
            state_map: hooktail_common::STATE_MAP.to_string(),
            runs: 2,
            flush_delay: Duration::from_millis(500),
            callback_interval: Duration::from_secs(1),
            linger: Duration::from_secs(5),
            trace_path: PathBuf::from(TRACE_PATH),
            trace_pipe_path: PathBuf::from(TRACE_PIPE_PATH),
        }
    }
}

impl Config {
    /// Read `path` if given, otherwise use defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    HooktailError::ConfigError(format!("{}: {}", path.display(), e))
                })?;
                Self::from_yaml(&contents)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| HooktailError::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let names = [
            ("fcntl.object", &self.fcntl.object),
            ("fcntl.program", &self.fcntl.program),
            ("fcntl.hook", &self.fcntl.hook),
            ("fcntl.events_map", &self.fcntl.events_map),
            ("fcntl.state_map", &self.fcntl.state_map),
            ("guard.object", &self.guard.object),
            ("guard.program", &self.guard.program),
            ("guard.callback_program", &self.guard.callback_program),
            ("guard.state_map", &self.guard.state_map),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(HooktailError::ConfigError(format!("{} must not be empty", field)));
            }
        }

        if self.guard.runs == 0 {
            return Err(HooktailError::ConfigError(
                "guard.runs must be at least 1".to_string(),
            ));
        }
        if self.guard.callback_interval.is_zero() {
            return Err(HooktailError::ConfigError(
                "guard.callback_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse durations such as `500ms`, `5s`, `1m`, `1h`
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (num, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1u64)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1000u64)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60_000u64)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 3_600_000u64)
    } else {
        return Err(HooktailError::ConfigError(format!(
            "Invalid duration '{}'. Use: 500ms, 30s, 5m, 1h",
            s
        )));
    };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| HooktailError::ConfigError(format!("Invalid duration number '{}'", s)))?;
    Ok(Duration::from_millis(value.saturating_mul(unit_ms)))
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}
