use crate::gate::{DEFAULT_PROBE_TIMEOUT, DEFAULT_RETRY_INTERVAL};
use crate::process::SupervisorConfig;
use crate::reconcile::{ReconcileConfig, DEFAULT_POLL_INTERVAL};
use hyper::Uri;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for every environment variable the proxy reads
pub const ENV_PREFIX: &str = "IDLEGATE_";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front door and backend target
    #[serde(default)]
    pub server: ServerConfig,

    /// Supervised daemon
    #[serde(default)]
    pub process: ProcessConfig,

    /// Reconciliation loop tuning
    #[serde(default)]
    pub reconcile: ReconcileSettings,

    /// Readiness probing
    #[serde(default)]
    pub gate: GateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Interface to bind (default: 0.0.0.0)
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port (default: 80)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Where requests are forwarded once the backend is ready
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Idle timeout for client connections (default: 1m)
    #[serde(default = "default_idle_timeout", deserialize_with = "de_duration")]
    pub idle_timeout: Duration,

    /// How long shutdown waits for open connections to finish (default: 5s)
    #[serde(default = "default_drain_timeout", deserialize_with = "de_duration")]
    pub drain_timeout: Duration,

    /// Verbose diagnostic logging
    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backend_url: default_backend_url(),
            idle_timeout: default_idle_timeout(),
            drain_timeout: default_drain_timeout(),
            debug: false,
        }
    }
}

/// Configuration for the supervised daemon
///
/// # Security Warning
///
/// `command` is handed to the system shell verbatim. Configuration files and
/// the environment must come from trusted sources only.
#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    /// Working directory for the daemon
    pub working_dir: Option<PathBuf>,

    /// Shell command line; empty disables supervision (pure reverse proxy)
    #[serde(default)]
    pub command: String,

    /// Grace period after spawn before the daemon counts as running
    #[serde(default, deserialize_with = "de_duration")]
    pub start_delay: Duration,

    /// Time between the interrupt and a forced kill (default: 5s)
    #[serde(default = "default_kill_grace", deserialize_with = "de_duration")]
    pub kill_grace: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            command: String::new(),
            start_delay: Duration::ZERO,
            kill_grace: default_kill_grace(),
        }
    }
}

impl ProcessConfig {
    /// Whether a daemon should be supervised at all
    pub fn enabled(&self) -> bool {
        !self.command.trim().is_empty()
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            working_dir: self.working_dir.clone(),
            command: self.command.clone(),
            start_delay: self.start_delay,
            kill_grace_period: self.kill_grace,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileSettings {
    /// Safety-net interval between reconciliation ticks (default: 100ms)
    #[serde(default = "default_poll_interval", deserialize_with = "de_duration")]
    pub poll_interval: Duration,

    /// Consecutive idle ticks before the daemon is stopped (default: 1)
    #[serde(default = "default_stop_after_idle_ticks")]
    pub stop_after_idle_ticks: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            stop_after_idle_ticks: default_stop_after_idle_ticks(),
        }
    }
}

impl ReconcileSettings {
    pub fn loop_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            poll_interval: self.poll_interval,
            stop_after_idle_ticks: self.stop_after_idle_ticks,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GateConfig {
    /// Timeout for a single readiness probe (default: 1s)
    #[serde(default = "default_probe_timeout", deserialize_with = "de_duration")]
    pub probe_timeout: Duration,

    /// Sleep between failed probes (default: 100ms)
    #[serde(default = "default_retry_interval", deserialize_with = "de_duration")]
    pub retry_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            probe_timeout: default_probe_timeout(),
            retry_interval: default_retry_interval(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    80
}

fn default_backend_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_kill_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_stop_after_idle_ticks() -> u32 {
    1
}

fn default_probe_timeout() -> Duration {
    DEFAULT_PROBE_TIMEOUT
}

fn default_retry_interval() -> Duration {
    DEFAULT_RETRY_INTERVAL
}

/// Accepts either a duration string or a bare number of seconds
fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Parse a duration such as `500ms`, `15s`, `1m30s` or `2h`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{}'", input))?;
        if number_len == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", input))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let scale = match unit {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("unknown unit '{}' in duration '{}'", unit, input)),
        };

        let out_of_range = || format!("duration '{}' is out of range", input);
        let part = Duration::try_from_secs_f64(value * scale).map_err(|_| out_of_range())?;
        total = total.checked_add(part).ok_or_else(out_of_range)?;
        rest = next;
    }

    Ok(total)
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("invalid boolean '{}'", other)),
    }
}

impl Config {
    /// Defaults (or `path`, if given) overlaid with `IDLEGATE_*` variables
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
                })?;
                toml::from_str(&content)?
            }
            None => Config::default(),
        };
        // Non-unicode variables cannot be ours; skip them instead of panicking
        let vars = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)));
        config.apply_env(vars)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `IDLEGATE_*` overrides. Empty values count as unset.
    pub fn apply_env<I>(&mut self, vars: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut errors = Vec::new();

        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }

            let result = match name {
                "HOST" => {
                    self.server.host = value;
                    Ok(())
                }
                "PORT" => value
                    .trim()
                    .parse()
                    .map(|p| self.server.port = p)
                    .map_err(|e| format!("{}", e)),
                "BACKEND_URL" => {
                    self.server.backend_url = value;
                    Ok(())
                }
                "IDLE_TIMEOUT" => parse_duration(&value).map(|d| self.server.idle_timeout = d),
                "DRAIN_TIMEOUT" => parse_duration(&value).map(|d| self.server.drain_timeout = d),
                "DEBUG" => parse_bool(&value).map(|b| self.server.debug = b),
                "PROCESS_CWD" => {
                    self.process.working_dir = Some(PathBuf::from(value));
                    Ok(())
                }
                "PROCESS_CMD" => {
                    self.process.command = value;
                    Ok(())
                }
                "PROCESS_START_DELAY" => parse_duration(&value).map(|d| self.process.start_delay = d),
                "PROCESS_KILL_GRACE" => parse_duration(&value).map(|d| self.process.kill_grace = d),
                "POLL_INTERVAL" => parse_duration(&value).map(|d| self.reconcile.poll_interval = d),
                "STOP_AFTER_IDLE_TICKS" => value
                    .trim()
                    .parse()
                    .map(|n| self.reconcile.stop_after_idle_ticks = n)
                    .map_err(|e| format!("{}", e)),
                "PROBE_TIMEOUT" => parse_duration(&value).map(|d| self.gate.probe_timeout = d),
                "PROBE_INTERVAL" => parse_duration(&value).map(|d| self.gate.retry_interval = d),
                _ => Err("unknown setting".to_string()),
            };

            if let Err(e) = result {
                errors.push(format!("{}{}: {}", ENV_PREFIX, name, e));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Parsed backend target
    pub fn backend_uri(&self) -> anyhow::Result<Uri> {
        let uri: Uri = self
            .server
            .backend_url
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid backend URL '{}': {}", self.server.backend_url, e))?;
        if uri.scheme_str() != Some("http") {
            anyhow::bail!("backend URL '{}' must use http://", self.server.backend_url);
        }
        if uri.authority().is_none() {
            anyhow::bail!("backend URL '{}' has no host", self.server.backend_url);
        }
        Ok(uri)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.backend_uri() {
            errors.push(e.to_string());
        }
        if self.server.host.trim().is_empty() {
            errors.push("listen host must not be empty".to_string());
        }
        if self.reconcile.poll_interval.is_zero() {
            errors.push("poll interval must be greater than zero".to_string());
        }
        if self.gate.probe_timeout.is_zero() {
            errors.push("probe timeout must be greater than zero".to_string());
        }
        if let Some(ref dir) = self.process.working_dir {
            if self.process.enabled() && !dir.is_dir() {
                errors.push(format!("process working directory {} does not exist", dir.display()));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
