//! Configuration vault – reads `buspoll.toml`.
//!
//! ```toml
//! sampling_period_ms = 500
//! restart_policy = "on_failure"
//!
//! [[widget]]
//! type = "sim"
//! name = "Inlet"
//! unit = "[C]"
//! port_name = "/dev/ttyUSB0"
//! slave_address = 1
//! waveform = { kind = "sine", offset = 21.0, amplitude = 1.5, period = 40 }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use buspoll_hal::{FaultPlan, Registry, SimConnector, Waveform, Widget};
use buspoll_runtime::{LogFormat, OrchestratorConfig, RestartPolicy, SchedulerConfig};
use buspoll_types::{ErrorClass, PollError, WidgetMeta};
use serde::{Deserialize, Serialize};

/// File used when neither a CLI argument nor `BUSPOLL_CONFIG` names one.
pub const DEFAULT_CONFIG_FILE: &str = "buspoll.toml";

/// Device families this host can open.  `Dummy` is the default `type`.
pub const SUPPORTED_DEVICE_TYPES: [&str; 2] = ["sim", "Dummy"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    #[default]
    Never,
    OnFailure,
}

/// How the host prints bus events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    Pretty,
    Json,
}

/// Simulated signal shape for a configured widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaveformConfig {
    Constant { value: f64 },
    Ramp { start: f64, step: f64 },
    Sine { offset: f64, amplitude: f64, period: u32 },
}

impl Default for WaveformConfig {
    fn default() -> Self {
        WaveformConfig::Sine {
            offset: 20.0,
            amplitude: 1.0,
            period: 20,
        }
    }
}

impl WaveformConfig {
    pub fn to_waveform(&self) -> Waveform {
        match *self {
            WaveformConfig::Constant { value } => Waveform::Constant(value),
            WaveformConfig::Ramp { start, step } => Waveform::Ramp { start, step },
            WaveformConfig::Sine {
                offset,
                amplitude,
                period,
            } => Waveform::Sine {
                offset,
                amplitude,
                period,
            },
        }
    }
}

/// One `[[widget]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetConfig {
    #[serde(flatten)]
    pub meta: WidgetMeta,
    #[serde(default)]
    pub waveform: WaveformConfig,
    /// Simulated transport latency per read.
    #[serde(default)]
    pub latency_ms: u64,
    /// Every n-th read times out; `0` keeps the link healthy.
    #[serde(default)]
    pub fail_every: u32,
}

impl WidgetConfig {
    /// Connector for this widget's device family.
    ///
    /// # Errors
    ///
    /// [`PollError::Config`] when `type` names a family this host has no
    /// driver for.
    pub fn connector(&self) -> Result<SimConnector, PollError> {
        self.check_device_type()?;
        let faults = if self.fail_every > 0 {
            FaultPlan::EveryNth(self.fail_every, ErrorClass::Transient)
        } else {
            FaultPlan::Healthy
        };
        Ok(SimConnector::new(self.waveform.to_waveform())
            .with_latency(Duration::from_millis(self.latency_ms))
            .with_faults(faults))
    }

    fn check_device_type(&self) -> Result<(), PollError> {
        if SUPPORTED_DEVICE_TYPES.contains(&self.meta.device_type.as_str()) {
            return Ok(());
        }
        Err(PollError::Config(format!(
            "widget '{}' has unsupported type '{}' (supported: {})",
            self.meta.name,
            self.meta.device_type,
            SUPPORTED_DEVICE_TYPES.join(", ")
        )))
    }
}

/// Host configuration stored in `buspoll.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_sampling_period_ms")]
    pub sampling_period_ms: u64,

    /// Shared deadline for stopping every scheduler on exit.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    #[serde(default)]
    pub restart_policy: RestartMode,

    /// Restart budget per port under `restart_policy = "on_failure"`.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default)]
    pub output: OutputMode,

    #[serde(default, rename = "widget")]
    pub widgets: Vec<WidgetConfig>,
}

fn default_sampling_period_ms() -> u64 {
    500
}
fn default_shutdown_timeout_ms() -> u64 {
    2000
}
fn default_max_consecutive_failures() -> u32 {
    5
}
fn default_stall_timeout_ms() -> u64 {
    5000
}
fn default_max_restarts() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sampling_period_ms: default_sampling_period_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            stall_timeout_ms: default_stall_timeout_ms(),
            restart_policy: RestartMode::default(),
            max_restarts: default_max_restarts(),
            log_format: LogFormat::default(),
            output: OutputMode::default(),
            widgets: Vec::new(),
        }
    }
}

impl Config {
    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), PollError> {
        if self.sampling_period_ms == 0 {
            return Err(PollError::Config(
                "sampling_period_ms must be greater than zero".to_string(),
            ));
        }
        if self.stall_timeout_ms <= self.sampling_period_ms {
            return Err(PollError::Config(format!(
                "stall_timeout_ms ({}) must exceed sampling_period_ms ({})",
                self.stall_timeout_ms, self.sampling_period_ms
            )));
        }
        if let Some(w) = self
            .widgets
            .iter()
            .find(|w| w.meta.port_name.trim().is_empty())
        {
            return Err(PollError::Config(format!(
                "widget '{}' has an empty port_name",
                w.meta.name
            )));
        }
        for widget in &self.widgets {
            widget.check_device_type()?;
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            scheduler: SchedulerConfig {
                sampling_period: Duration::from_millis(self.sampling_period_ms),
                max_consecutive_failures: self.max_consecutive_failures,
                stall_timeout: Duration::from_millis(self.stall_timeout_ms),
            },
            restart_policy: match self.restart_policy {
                RestartMode::Never => RestartPolicy::Never,
                RestartMode::OnFailure => RestartPolicy::OnFailure {
                    max_restarts: self.max_restarts,
                },
            },
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }

    /// Widgets to run: the configured ones, or a two-port bench setup when
    /// the file lists none.
    pub fn effective_widgets(&self) -> Vec<WidgetConfig> {
        if !self.widgets.is_empty() {
            return self.widgets.clone();
        }
        let bench = |name: &str, port: &str, address: u8, waveform: WaveformConfig| WidgetConfig {
            meta: WidgetMeta {
                device_type: "sim".to_string(),
                name: name.to_string(),
                port_name: port.to_string(),
                slave_address: address,
                ..WidgetMeta::default()
            },
            waveform,
            latency_ms: 5,
            fail_every: 0,
        };
        vec![
            bench("Top", "/dev/ttyUSB0", 1, WaveformConfig::default()),
            bench(
                "Bottom",
                "/dev/ttyUSB0",
                2,
                WaveformConfig::Ramp {
                    start: 18.0,
                    step: 0.1,
                },
            ),
            bench(
                "Ambient",
                "/dev/ttyUSB1",
                1,
                WaveformConfig::Constant { value: 22.5 },
            ),
        ]
    }

    /// Register and attach every widget to a fresh [`Registry`].
    pub fn build_registry(&self) -> Result<Registry, PollError> {
        let mut registry = Registry::new();
        for widget in self.effective_widgets() {
            let connector = Arc::new(widget.connector()?);
            registry.register_and_attach(Widget::new(widget.meta, connector))?;
        }
        Ok(registry)
    }
}

/// Pick the config file: explicit argument, then `BUSPOLL_CONFIG`, then
/// `./buspoll.toml`.
pub fn config_path(arg: Option<String>) -> PathBuf {
    config_path_from(arg, std::env::var("BUSPOLL_CONFIG").ok())
}

/// Extracted for testability without mutating environment variables.
pub(crate) fn config_path_from(arg: Option<String>, env: Option<String>) -> PathBuf {
    arg.or(env)
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load, override from the environment, and validate.  A missing file
/// yields the defaults.
pub fn load(path: &Path) -> Result<Config, PollError> {
    let cfg = match load_from(path)? {
        Some(cfg) => cfg,
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            cfg
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, PollError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        PollError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|e| {
        PollError::Config(format!("failed to parse {}: {}", path.display(), e))
    })?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `BUSPOLL_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `BUSPOLL_SAMPLING_PERIOD_MS` | `sampling_period_ms` |
/// | `BUSPOLL_SHUTDOWN_TIMEOUT_MS` | `shutdown_timeout_ms` |
/// | `BUSPOLL_LOG_FORMAT` | `log_format` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("BUSPOLL_SAMPLING_PERIOD_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.sampling_period_ms = ms;
    }
    if let Ok(v) = std::env::var("BUSPOLL_SHUTDOWN_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.shutdown_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("BUSPOLL_LOG_FORMAT")
        && let Ok(format) = v.parse::<LogFormat>()
    {
        cfg.log_format = format;
    }
}
