//! Pipeline configuration.
//!
//! Everything can be built in code with validated builders, or read from
//! environment variables sharing a common prefix:
//!
//! | Variable                              | Default    |
//! |---------------------------------------|------------|
//! | `<PREFIX>_INPUT_BUFFER_SIZE`          | `65536`    |
//! | `<PREFIX>_INPUT_PROCESSORS`           | `2`        |
//! | `<PREFIX>_INPUT_WAIT_STRATEGY`        | `blocking` |
//! | `<PREFIX>_PROCESS_BUFFER_SIZE`        | `65536`    |
//! | `<PREFIX>_PROCESSORS`                 | `5`        |
//! | `<PREFIX>_PROCESS_WAIT_STRATEGY`      | `blocking` |
//! | `<PREFIX>_JOURNAL_ENABLED`            | `true`     |
//! | `<PREFIX>_RETRY_INITIAL_MS`           | `250`      |
//! | `<PREFIX>_RETRY_MAX_MS`               | `60000`    |
//! | `<PREFIX>_JOURNAL_READ_BATCH_SIZE`    | `1024`     |
//! | `<PREFIX>_JOURNAL_POLL_INTERVAL_MS`   | `100`      |

use std::str::FromStr;
use std::time::Duration;

use crate::disruptor::{RingBufferConfig, WaitStrategyKind};
use crate::error::{Result, SluiceError};

const DEFAULT_BUFFER_SIZE: usize = 65536;
const DEFAULT_INPUT_PROCESSORS: usize = 2;
const DEFAULT_PROCESSORS: usize = 5;
const DEFAULT_READ_BATCH_SIZE: usize = 1024;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exponential backoff for journal write retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl BackoffConfig {
    pub fn new(initial: Duration, max: Duration) -> Result<Self> {
        let config = Self {
            initial,
            max,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_multiplier(mut self, multiplier: u32) -> Result<Self> {
        self.multiplier = multiplier;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial.is_zero() {
            return Err(SluiceError::config("Retry initial delay must be greater than 0"));
        }
        if self.max < self.initial {
            return Err(SluiceError::config(
                "Retry max delay must not be shorter than the initial delay",
            ));
        }
        if self.multiplier == 0 {
            return Err(SluiceError::config("Retry multiplier must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ring A and the encoding (or dispatch) pool draining it
    pub input: RingBufferConfig,
    /// Ring B and the decode pool draining it
    pub process: RingBufferConfig,
    /// Persist every message before it is processed
    pub journal_enabled: bool,
    pub retry: BackoffConfig,
    pub journal_read_batch_size: usize,
    /// Longest the journal reader sleeps without a write signal
    pub journal_poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: RingBufferConfig {
                size: DEFAULT_BUFFER_SIZE,
                num_consumers: DEFAULT_INPUT_PROCESSORS,
                wait_strategy: WaitStrategyKind::Blocking,
            },
            process: RingBufferConfig {
                size: DEFAULT_BUFFER_SIZE,
                num_consumers: DEFAULT_PROCESSORS,
                wait_strategy: WaitStrategyKind::Blocking,
            },
            journal_enabled: true,
            retry: BackoffConfig::default(),
            journal_read_batch_size: DEFAULT_READ_BATCH_SIZE,
            journal_poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PipelineConfig {
    pub fn new(input: RingBufferConfig, process: RingBufferConfig) -> Result<Self> {
        let config = Self {
            input,
            process,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_journal(mut self, enabled: bool) -> Self {
        self.journal_enabled = enabled;
        self
    }

    pub fn with_retry(mut self, retry: BackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.input.validate()?;
        self.process.validate()?;
        self.retry.validate()?;
        if self.journal_read_batch_size == 0 {
            return Err(SluiceError::config("Journal read batch size must be greater than 0"));
        }
        if self.journal_poll_interval.is_zero() {
            return Err(SluiceError::config("Journal poll interval must be greater than 0"));
        }
        Ok(())
    }

    /// Read from the process environment. See the module docs for variable names.
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = EnvVars::new(prefix, lookup);
        let mut config = Self::default();

        config.input.size = vars.parse("INPUT_BUFFER_SIZE", config.input.size)?;
        config.input.num_consumers = vars.parse("INPUT_PROCESSORS", config.input.num_consumers)?;
        config.input.wait_strategy = vars.parse("INPUT_WAIT_STRATEGY", config.input.wait_strategy)?;
        config.process.size = vars.parse("PROCESS_BUFFER_SIZE", config.process.size)?;
        config.process.num_consumers = vars.parse("PROCESSORS", config.process.num_consumers)?;
        config.process.wait_strategy =
            vars.parse("PROCESS_WAIT_STRATEGY", config.process.wait_strategy)?;
        config.journal_enabled = vars.flag("JOURNAL_ENABLED", config.journal_enabled)?;
        config.retry.initial = vars.millis("RETRY_INITIAL_MS", config.retry.initial)?;
        config.retry.max = vars.millis("RETRY_MAX_MS", config.retry.max)?;
        config.journal_read_batch_size =
            vars.parse("JOURNAL_READ_BATCH_SIZE", config.journal_read_batch_size)?;
        config.journal_poll_interval =
            vars.millis("JOURNAL_POLL_INTERVAL_MS", config.journal_poll_interval)?;

        config.validate()?;
        Ok(config)
    }
}

/// Typed reads of `<prefix>_<NAME>` variables. Blank values count as unset.
pub struct EnvVars<'a, F> {
    prefix: &'a str,
    lookup: F,
}

impl<'a, F> EnvVars<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    pub fn new(prefix: &'a str, lookup: F) -> Self {
        Self { prefix, lookup }
    }

    /// Full variable name and trimmed value, if set.
    pub fn get(&self, name: &str) -> Option<(String, String)> {
        let key = format!("{}_{}", self.prefix, name);
        let value = (self.lookup)(&key)?;
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        Some((key, value.to_string()))
    }

    pub fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some((key, value)) => value
                .parse()
                .map_err(|e| SluiceError::config(format!("{}='{}': {}", key, value, e))),
        }
    }

    pub fn flag(&self, name: &str, default: bool) -> Result<bool> {
        match self.get(name) {
            None => Ok(default),
            Some((key, value)) => match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(SluiceError::config(format!(
                    "{}='{}': expected true or false",
                    key, value
                ))),
            },
        }
    }

    pub fn millis(&self, name: &str, default: Duration) -> Result<Duration> {
        let ms = self.parse(name, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.input.size, 65536);
        assert_eq!(config.input.num_consumers, 2);
        assert_eq!(config.process.num_consumers, 5);
        assert!(config.journal_enabled);
        assert_eq!(config.retry.initial, Duration::from_millis(250));
        assert_eq!(config.retry.max, Duration::from_secs(60));
        assert_eq!(config.retry.multiplier, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let config = PipelineConfig::from_lookup(
            "SLUICE",
            lookup(&[
                ("SLUICE_INPUT_BUFFER_SIZE", "1024"),
                ("SLUICE_INPUT_PROCESSORS", "3"),
                ("SLUICE_INPUT_WAIT_STRATEGY", "yielding"),
                ("SLUICE_PROCESS_BUFFER_SIZE", "256"),
                ("SLUICE_PROCESSORS", "4"),
                ("SLUICE_PROCESS_WAIT_STRATEGY", "busy-spin"),
                ("SLUICE_JOURNAL_ENABLED", "off"),
                ("SLUICE_RETRY_INITIAL_MS", "10"),
                ("SLUICE_RETRY_MAX_MS", "500"),
                ("OTHER_PROCESSORS", "99"),
            ]),
        )
        .unwrap();

        assert_eq!(config.input.size, 1024);
        assert_eq!(config.input.num_consumers, 3);
        assert_eq!(config.input.wait_strategy, WaitStrategyKind::Yielding);
        assert_eq!(config.process.size, 256);
        assert_eq!(config.process.num_consumers, 4);
        assert_eq!(config.process.wait_strategy, WaitStrategyKind::BusySpin);
        assert!(!config.journal_enabled);
        assert_eq!(config.retry.initial, Duration::from_millis(10));
        assert_eq!(config.retry.max, Duration::from_millis(500));
    }

    #[test]
    fn test_blank_values_keep_defaults() {
        let config =
            PipelineConfig::from_lookup("SLUICE", lookup(&[("SLUICE_PROCESSORS", "  ")])).unwrap();
        assert_eq!(config.process.num_consumers, 5);
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = PipelineConfig::from_lookup("SLUICE", lookup(&[("SLUICE_INPUT_BUFFER_SIZE", "1000")]))
            .unwrap_err();
        assert!(matches!(err, SluiceError::Config(_)));

        let err = PipelineConfig::from_lookup("SLUICE", lookup(&[("SLUICE_PROCESSORS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("SLUICE_PROCESSORS"));

        let err = PipelineConfig::from_lookup("SLUICE", lookup(&[("SLUICE_JOURNAL_ENABLED", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("SLUICE_JOURNAL_ENABLED"));
    }

    #[test]
    fn test_backoff_validation() {
        assert!(BackoffConfig::new(Duration::ZERO, Duration::from_secs(1)).is_err());
        assert!(BackoffConfig::new(Duration::from_secs(2), Duration::from_secs(1)).is_err());
        let backoff = BackoffConfig::new(Duration::from_millis(5), Duration::from_millis(40)).unwrap();
        assert!(backoff.clone().with_multiplier(0).is_err());
        assert_eq!(backoff.with_multiplier(3).unwrap().multiplier, 3);
    }

    #[test]
    fn test_retry_max_below_initial_rejected() {
        let result = PipelineConfig::from_lookup(
            "SLUICE",
            lookup(&[("SLUICE_RETRY_INITIAL_MS", "1000"), ("SLUICE_RETRY_MAX_MS", "10")]),
        );
        assert!(result.is_err());
    }
}
