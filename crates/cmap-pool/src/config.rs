//! Pool configuration.

use std::time::Duration;

use crate::address::ServerAddress;
use crate::error::PoolError;

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool id, reported in events and errors.
    pub id: u32,

    /// Address every connection in the pool targets.
    pub address: ServerAddress,

    /// Maximum number of connections; 0 means unbounded.
    pub max_pool_size: u32,

    /// Number of connections to keep open.
    pub min_pool_size: u32,

    /// Time a connection may sit idle before it is evicted on next use.
    pub max_idle_time: Option<Duration>,

    /// Maximum number of queued acquisitions; 0 means unbounded.
    pub wait_queue_size: usize,

    /// Time an acquisition may wait in the queue.
    pub wait_queue_timeout: Option<Duration>,

    /// Period of the wait queue run loop.
    pub wait_queue_period: Duration,

    /// Interval of the background task that re-establishes `min_pool_size`.
    pub maintenance_interval: Option<Duration>,

    /// Capacity of the broadcast channel behind [`Pool::subscribe`](crate::Pool::subscribe).
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            id: 0,
            address: ServerAddress::default(),
            max_pool_size: 100,
            min_pool_size: 0,
            max_idle_time: None,
            wait_queue_size: 0,
            wait_queue_timeout: None,
            wait_queue_period: Duration::from_millis(10),
            maintenance_interval: None,
            event_capacity: 1024,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool id.
    #[must_use]
    pub fn id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Set the server address.
    #[must_use]
    pub fn address(mut self, address: ServerAddress) -> Self {
        self.address = address;
        self
    }

    /// Set the maximum number of connections (0 for unbounded).
    #[must_use]
    pub fn max_pool_size(mut self, size: u32) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_pool_size(mut self, size: u32) -> Self {
        self.min_pool_size = size;
        self
    }

    /// Set the idle eviction threshold.
    #[must_use]
    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = (!idle.is_zero()).then_some(idle);
        self
    }

    /// Set the wait queue capacity (0 for unbounded).
    #[must_use]
    pub fn wait_queue_size(mut self, size: usize) -> Self {
        self.wait_queue_size = size;
        self
    }

    /// Set the wait queue timeout.
    #[must_use]
    pub fn wait_queue_timeout(mut self, timeout: Duration) -> Self {
        self.wait_queue_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Set the wait queue run loop period.
    #[must_use]
    pub fn wait_queue_period(mut self, period: Duration) -> Self {
        self.wait_queue_period = period;
        self
    }

    /// Enable background `min_pool_size` maintenance.
    #[must_use]
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = Some(interval);
        self
    }

    /// Whether the pool has no size limit.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.max_pool_size == 0
    }

    /// The wire-named options this configuration corresponds to.
    #[must_use]
    pub fn options(&self) -> PoolOptions {
        PoolOptions {
            max_pool_size: Some(i64::from(self.max_pool_size)),
            min_pool_size: Some(u64::from(self.min_pool_size)),
            max_idle_time_ms: Some(duration_ms(self.max_idle_time)),
            wait_queue_size: Some(self.wait_queue_size as u64),
            wait_queue_timeout_ms: Some(duration_ms(self.wait_queue_timeout)),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if !self.is_unbounded() && self.min_pool_size > self.max_pool_size {
            return Err(PoolError::Configuration(
                "min_pool_size cannot be greater than max_pool_size".into(),
            ));
        }
        if self.wait_queue_period.is_zero() {
            return Err(PoolError::Configuration(
                "wait_queue_period must be greater than 0".into(),
            ));
        }
        if self.maintenance_interval.is_some_and(|i| i.is_zero()) {
            return Err(PoolError::Configuration(
                "maintenance_interval must be greater than 0".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(PoolError::Configuration(
                "event_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn duration_ms(d: Option<Duration>) -> u64 {
    d.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Pool options under their connection-string names.
///
/// Unset fields keep the [`PoolConfig`] defaults. `maxPoolSize <= 0` means
/// unbounded; a zero `maxIdleTimeMS` or `waitQueueTimeoutMS` disables the
/// limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct PoolOptions {
    /// `maxPoolSize`
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub max_pool_size: Option<i64>,
    /// `minPoolSize`
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub min_pool_size: Option<u64>,
    /// `maxIdleTimeMS`
    #[cfg_attr(
        feature = "serde",
        serde(
            default,
            rename = "maxIdleTimeMS",
            skip_serializing_if = "Option::is_none"
        )
    )]
    pub max_idle_time_ms: Option<u64>,
    /// `waitQueueSize`
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub wait_queue_size: Option<u64>,
    /// `waitQueueTimeoutMS`
    #[cfg_attr(
        feature = "serde",
        serde(
            default,
            rename = "waitQueueTimeoutMS",
            skip_serializing_if = "Option::is_none"
        )
    )]
    pub wait_queue_timeout_ms: Option<u64>,
}

impl PoolOptions {
    /// Parse options from a URI query string such as
    /// `maxPoolSize=5&waitQueueTimeoutMS=100`.
    ///
    /// Keys are case-insensitive. Unknown keys are ignored.
    pub fn from_query(query: &str) -> Result<Self, PoolError> {
        let mut options = Self::default();
        let query = query.trim().trim_start_matches('?');

        for part in query.split(['&', ';']) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::Configuration(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "maxpoolsize" => options.max_pool_size = Some(parse_option(&key, value)?),
                "minpoolsize" => options.min_pool_size = Some(parse_option(&key, value)?),
                "maxidletimems" => options.max_idle_time_ms = Some(parse_option(&key, value)?),
                "waitqueuesize" => options.wait_queue_size = Some(parse_option(&key, value)?),
                "waitqueuetimeoutms" => {
                    options.wait_queue_timeout_ms = Some(parse_option(&key, value)?);
                }
                _ => {
                    tracing::debug!(key = key, value = value, "ignoring unknown pool option");
                }
            }
        }

        Ok(options)
    }

    /// Apply these options on top of `config`.
    #[must_use]
    pub fn apply(&self, mut config: PoolConfig) -> PoolConfig {
        if let Some(max) = self.max_pool_size {
            config.max_pool_size = u32::try_from(max.max(0)).unwrap_or(u32::MAX);
        }
        if let Some(min) = self.min_pool_size {
            config.min_pool_size = u32::try_from(min).unwrap_or(u32::MAX);
        }
        if let Some(ms) = self.max_idle_time_ms {
            config = config.max_idle_time(Duration::from_millis(ms));
        }
        if let Some(size) = self.wait_queue_size {
            config.wait_queue_size = usize::try_from(size).unwrap_or(usize::MAX);
        }
        if let Some(ms) = self.wait_queue_timeout_ms {
            config = config.wait_queue_timeout(Duration::from_millis(ms));
        }
        config
    }
}

impl From<PoolOptions> for PoolConfig {
    fn from(options: PoolOptions) -> Self {
        options.apply(PoolConfig::default())
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, PoolError> {
    value
        .parse()
        .map_err(|_| PoolError::Configuration(format!("invalid value for {key}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_pool_size, 100);
        assert_eq!(config.min_pool_size, 0);
        assert_eq!(config.max_idle_time, None);
        assert_eq!(config.wait_queue_size, 0);
        assert_eq!(config.wait_queue_timeout, None);
        assert_eq!(config.wait_queue_period, Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_min_above_max() {
        let config = PoolConfig::new().max_pool_size(2).min_pool_size(3);
        assert!(matches!(
            config.validate(),
            Err(PoolError::Configuration(_))
        ));

        // Unbounded pools accept any minimum.
        let config = PoolConfig::new().max_pool_size(0).min_pool_size(3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_period() {
        let config = PoolConfig::new().wait_queue_period(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_durations_disable_limits() {
        let config = PoolConfig::new()
            .max_idle_time(Duration::ZERO)
            .wait_queue_timeout(Duration::ZERO);
        assert_eq!(config.max_idle_time, None);
        assert_eq!(config.wait_queue_timeout, None);
    }

    #[test]
    fn test_query_parsing() {
        let options = PoolOptions::from_query(
            "?maxPoolSize=5&MINPOOLSIZE=1&waitQueueTimeoutMS=100&appName=test",
        )
        .unwrap();

        assert_eq!(options.max_pool_size, Some(5));
        assert_eq!(options.min_pool_size, Some(1));
        assert_eq!(options.wait_queue_timeout_ms, Some(100));
        assert_eq!(options.wait_queue_size, None);

        let config = PoolConfig::from(options);
        assert_eq!(config.max_pool_size, 5);
        assert_eq!(config.min_pool_size, 1);
        assert_eq!(config.wait_queue_timeout, Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_query_parsing_rejects_garbage() {
        assert!(PoolOptions::from_query("maxPoolSize").is_err());
        assert!(PoolOptions::from_query("maxPoolSize=lots").is_err());
    }

    #[test]
    fn test_negative_max_pool_size_is_unbounded() {
        let options = PoolOptions {
            max_pool_size: Some(-1),
            ..PoolOptions::default()
        };
        let config = PoolConfig::from(options);
        assert!(config.is_unbounded());
    }
}
