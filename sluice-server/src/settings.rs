use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use sluice::{EnvVars, Result, SluiceError};

const DEFAULT_BIND: &str = "0.0.0.0:5140";
const DEFAULT_RECV_BUFFER: usize = 4 * 1024 * 1024;
const MAX_UDP_PAYLOAD: usize = 65_507;

/// Server-side settings; the pipeline itself is configured by `PipelineConfig`.
///
/// | Variable                              | Default         |
/// |---------------------------------------|-----------------|
/// | `<PREFIX>_BIND`                       | `0.0.0.0:5140`  |
/// | `<PREFIX>_RECV_BUFFER_BYTES`          | `4194304`       |
/// | `<PREFIX>_MAX_DATAGRAM_BYTES`         | `65507`         |
/// | `<PREFIX>_JOURNAL_PATH`               | `data/journal`  |
/// | `<PREFIX>_JOURNAL_CAPACITY_BYTES`     | `268435456`     |
/// | `<PREFIX>_JOURNAL_FLUSH_ON_WRITE`     | `false`         |
/// | `<PREFIX>_USAGE_LOG_INTERVAL_MS`      | `10000`         |
///
/// `BIND` takes a comma-separated list of addresses.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind: Vec<SocketAddr>,
    pub recv_buffer_bytes: usize,
    pub max_datagram_bytes: usize,
    pub journal_path: PathBuf,
    pub journal_capacity_bytes: usize,
    pub journal_flush_on_write: bool,
    pub usage_log_interval: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: vec![SocketAddr::from(([0, 0, 0, 0], 5140))],
            recv_buffer_bytes: DEFAULT_RECV_BUFFER,
            max_datagram_bytes: MAX_UDP_PAYLOAD,
            journal_path: PathBuf::from("data/journal"),
            journal_capacity_bytes: 256 * 1024 * 1024,
            journal_flush_on_write: false,
            usage_log_interval: Duration::from_secs(10),
        }
    }
}

impl ServerSettings {
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = EnvVars::new(prefix, lookup);
        let mut settings = Self::default();

        let (key, bind) = vars
            .get("BIND")
            .unwrap_or_else(|| (format!("{}_BIND", prefix), DEFAULT_BIND.to_string()));
        settings.bind = parse_bind_list(&key, &bind)?;
        settings.recv_buffer_bytes = vars.parse("RECV_BUFFER_BYTES", settings.recv_buffer_bytes)?;
        settings.max_datagram_bytes = vars.parse("MAX_DATAGRAM_BYTES", settings.max_datagram_bytes)?;
        if let Some((_, path)) = vars.get("JOURNAL_PATH") {
            settings.journal_path = PathBuf::from(path);
        }
        settings.journal_capacity_bytes =
            vars.parse("JOURNAL_CAPACITY_BYTES", settings.journal_capacity_bytes)?;
        settings.journal_flush_on_write =
            vars.flag("JOURNAL_FLUSH_ON_WRITE", settings.journal_flush_on_write)?;
        settings.usage_log_interval =
            vars.millis("USAGE_LOG_INTERVAL_MS", settings.usage_log_interval)?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind.is_empty() {
            return Err(SluiceError::config("At least one bind address is required"));
        }
        if self.max_datagram_bytes == 0 || self.max_datagram_bytes > MAX_UDP_PAYLOAD {
            return Err(SluiceError::config(format!(
                "Max datagram size must be between 1 and {}",
                MAX_UDP_PAYLOAD
            )));
        }
        if self.usage_log_interval.is_zero() {
            return Err(SluiceError::config("Usage log interval must be greater than 0"));
        }
        Ok(())
    }
}

fn parse_bind_list(key: &str, value: &str) -> Result<Vec<SocketAddr>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(|addr| {
            addr.parse()
                .map_err(|e| SluiceError::config(format!("{}='{}': {}", key, addr, e)))
        })
        .collect()
}
