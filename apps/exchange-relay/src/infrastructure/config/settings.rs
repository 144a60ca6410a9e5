//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.

use std::time::Duration;

use chrono::{FixedOffset, NaiveTime};

use crate::application::ports::Flow;
use crate::application::services::{DEFAULT_FLOWS, FetcherConfig, RefreshSchedule, RetryConfig};
use crate::infrastructure::broadcast::PushConfig;

/// Upstream endpoints.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Base URL of the snapshot relay.
    pub snapshot_url: String,
    /// Instrument listing URL.
    pub directory_url: String,
    /// Daily valuation detail URL.
    pub daily_detail_url: Option<String>,
    /// Static per-instrument detail URL.
    pub static_detail_url: Option<String>,
    /// Per-request timeout.
    pub http_timeout: Duration,
}

/// Fetch loop settings.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Market flows to query.
    pub flows: Vec<Flow>,
    /// Interval between cycles that produced data.
    pub poll_interval: Duration,
    /// First retry delay after an empty cycle.
    pub empty_retry: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            flows: DEFAULT_FLOWS.to_vec(),
            poll_interval: Duration::from_secs(60),
            empty_retry: Duration::from_secs(5),
        }
    }
}

impl FetchSettings {
    /// Fetcher configuration for these settings.
    #[must_use]
    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            flows: self.flows.clone(),
            poll_interval: self.poll_interval,
            empty_retry: RetryConfig::for_fetch_loop(self.empty_retry, self.poll_interval),
        }
    }
}

/// Directory refresh settings.
#[derive(Debug, Clone, Copy)]
pub struct MetadataSettings {
    /// Local time from which the daily refresh may run.
    pub cutover: NaiveTime,
    /// Exchange timezone as minutes east of UTC.
    pub utc_offset_minutes: i32,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        let schedule = RefreshSchedule::default();
        Self {
            cutover: schedule.cutover,
            utc_offset_minutes: schedule.offset.local_minus_utc() / 60,
        }
    }
}

impl MetadataSettings {
    /// Refresh schedule for these settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the offset is outside ±24h.
    pub fn schedule(&self) -> Result<RefreshSchedule, ConfigError> {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).ok_or_else(
            || ConfigError::Invalid {
                key: "RELAY_UTC_OFFSET_MINUTES".to_string(),
                value: self.utc_offset_minutes.to_string(),
            },
        )?;
        Ok(RefreshSchedule {
            offset,
            cutover: self.cutover,
        })
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// WebSocket and query HTTP port.
    pub stream_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            stream_port: 8000,
            health_port: 8082,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream endpoints.
    pub source: SourceSettings,
    /// Fetch loop settings.
    pub fetch: FetchSettings,
    /// Directory refresh settings.
    pub metadata: MetadataSettings,
    /// Per-connection push settings.
    pub push: PushConfig,
    /// Server port settings.
    pub server: ServerSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or empty, or a
    /// variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let source = SourceSettings {
            snapshot_url: env.required("RELAY_SNAPSHOT_URL")?,
            directory_url: env.required("RELAY_DIRECTORY_URL")?,
            daily_detail_url: env.optional("RELAY_DAILY_DETAIL_URL"),
            static_detail_url: env.optional("RELAY_STATIC_DETAIL_URL"),
            http_timeout: env.secs("RELAY_HTTP_TIMEOUT_SECS", Duration::from_secs(30))?,
        };

        let fetch_defaults = FetchSettings::default();
        let fetch = FetchSettings {
            flows: env.flows("RELAY_FLOWS", fetch_defaults.flows)?,
            poll_interval: env.secs("RELAY_POLL_INTERVAL_SECS", fetch_defaults.poll_interval)?,
            empty_retry: env.secs("RELAY_EMPTY_RETRY_SECS", fetch_defaults.empty_retry)?,
        };

        let metadata_defaults = MetadataSettings::default();
        let metadata = MetadataSettings {
            cutover: env.time("RELAY_METADATA_CUTOVER", metadata_defaults.cutover)?,
            utc_offset_minutes: env.parsed(
                "RELAY_UTC_OFFSET_MINUTES",
                metadata_defaults.utc_offset_minutes,
            )?,
        };
        metadata.schedule()?;

        let push_defaults = PushConfig::default();
        let push = PushConfig {
            stock_interval: env.millis("RELAY_STOCK_PUSH_INTERVAL_MS", push_defaults.stock_interval)?,
            summary_interval: env.millis(
                "RELAY_SUMMARY_PUSH_INTERVAL_MS",
                push_defaults.summary_interval,
            )?,
            empty_cache_wait: env.millis("RELAY_EMPTY_CACHE_WAIT_MS", push_defaults.empty_cache_wait)?,
            summary_batch_size: env.parsed(
                "RELAY_SUMMARY_BATCH_SIZE",
                push_defaults.summary_batch_size,
            )?,
            batch_pause: env.millis("RELAY_BATCH_PAUSE_MS", push_defaults.batch_pause)?,
            outbound_capacity: env.parsed(
                "RELAY_OUTBOUND_CAPACITY",
                push_defaults.outbound_capacity,
            )?,
        };
        if push.summary_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "RELAY_SUMMARY_BATCH_SIZE".to_string(),
                value: "0".to_string(),
            });
        }
        if push.outbound_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "RELAY_OUTBOUND_CAPACITY".to_string(),
                value: "0".to_string(),
            });
        }

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            stream_port: env.parsed("RELAY_STREAM_PORT", server_defaults.stream_port)?,
            health_port: env.parsed("RELAY_HEALTH_PORT", server_defaults.health_port)?,
        };

        Ok(Self {
            source,
            fetch,
            metadata,
            push,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    Invalid {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value.to_string())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.optional(key).map_or(Ok(default), |value| {
            value
                .parse()
                .map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    value,
                })
        })
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parsed(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parsed(key, default).map(Duration::from_millis)
    }

    fn time(&self, key: &str, default: NaiveTime) -> Result<NaiveTime, ConfigError> {
        self.optional(key).map_or(Ok(default), |value| {
            NaiveTime::parse_from_str(&value, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(&value, "%H:%M:%S"))
                .map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    value,
                })
        })
    }

    fn flows(&self, key: &str, default: Vec<Flow>) -> Result<Vec<Flow>, ConfigError> {
        let Some(value) = self.optional(key) else {
            return Ok(default);
        };
        let flows = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<Flow>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: value.clone(),
            })?;
        if flows.is_empty() {
            return Err(ConfigError::Invalid {
                key: key.to_string(),
                value,
            });
        }
        Ok(flows)
    }
}
