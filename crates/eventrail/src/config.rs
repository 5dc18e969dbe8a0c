use std::fmt::Debug;
use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;

/// Lower bound applied to every blocking read, so a misconfigured zero block
/// time cannot turn a polling loop into a busy loop.
pub const MIN_BLOCK_TIME: Duration = Duration::from_millis(100);

/// The per-channel parameters a consumer role must supply.
pub trait ChannelProfile
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// Consumer group, stable per deployed worker role
    /// (e.g. `order.local.process.v1`).
    fn group_name(&self) -> &str;

    /// Consumer name, unique per process instance
    /// (e.g. `order-local-worker-v1-1`).
    fn consumer_name(&self) -> &str;

    /// How long a read waits for new entries.
    fn block_time(&self) -> Duration;

    /// Maximum number of entries per read.
    fn batch_size(&self) -> usize;

    /// How long an entry must sit pending before another consumer may claim it.
    fn idle_time(&self) -> Duration;

    /// Maximum number of entries claimed per reclaim pass.
    fn max_claim_count(&self) -> usize;

    /// Delivery count at which an entry is moved to the dead-letter stream.
    fn max_times_delivered(&self) -> u64;
}

/// Plain-data [`ChannelProfile`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSettings {
    /// See [`ChannelProfile::group_name`].
    pub group_name: String,
    /// See [`ChannelProfile::consumer_name`].
    pub consumer_name: String,
    /// See [`ChannelProfile::block_time`].
    pub block_time: Duration,
    /// See [`ChannelProfile::batch_size`].
    pub batch_size: usize,
    /// See [`ChannelProfile::idle_time`].
    pub idle_time: Duration,
    /// See [`ChannelProfile::max_claim_count`].
    pub max_claim_count: usize,
    /// See [`ChannelProfile::max_times_delivered`].
    pub max_times_delivered: u64,
}

impl ChannelProfile for ChannelSettings {
    fn group_name(&self) -> &str {
        &self.group_name
    }

    fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    fn block_time(&self) -> Duration {
        self.block_time
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn idle_time(&self) -> Duration {
        self.idle_time
    }

    fn max_claim_count(&self) -> usize {
        self.max_claim_count
    }

    fn max_times_delivered(&self) -> u64 {
        self.max_times_delivered
    }
}

/// Invalid configuration.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting that must be positive is zero.
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),

    /// A name that must be set is empty.
    #[error("`{0}` must not be empty")]
    Empty(&'static str),
}

/// Process-wide settings, fixed at worker startup.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventStreamConfig {
    /// Deployment environment, e.g. `local` or `production`.
    pub environment: String,

    /// Name of this service; stamped on every published entry.
    pub service_name: String,

    /// Version of the event contract this service speaks.
    pub service_version: String,

    /// Overrides the templated origin stream key.
    pub stream_key: Option<String>,

    /// Overrides the shared dead-letter stream key.
    pub dead_letter_stream_key: Option<String>,

    /// Group used by origin-stream consumers.
    pub default_group: String,

    /// Consumer used by origin-stream consumers.
    pub default_consumer: String,

    /// Timezone for rendered timestamps.
    pub timezone: Tz,

    /// Retry ceiling.
    pub max_times_delivered: u64,

    /// Claim idle threshold, in milliseconds.
    pub idle_time_ms: u64,

    /// Page size of a reclaim pass.
    pub max_claim_count: usize,

    /// Entries per read.
    pub batch_size: usize,

    /// Read block duration, in milliseconds.
    pub block_time_ms: u64,

    /// Group of the dead-letter notification consumer.
    pub dead_letter_mail_group: String,

    /// Consumer of the dead-letter notification group.
    pub dead_letter_mail_consumer: String,

    /// Overrides the per-service dead-letter reprocessing group.
    pub dead_letter_reprocess_group: Option<String>,

    /// Optional per-message handler timeout, in milliseconds.
    pub handler_timeout_ms: Option<u64>,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            environment: "local".to_string(),
            service_name: "default".to_string(),
            service_version: "1.0.0".to_string(),
            stream_key: None,
            dead_letter_stream_key: None,
            default_group: "default-group".to_string(),
            default_consumer: "worker-1".to_string(),
            timezone: Tz::Asia__Ho_Chi_Minh,
            max_times_delivered: 3,
            idle_time_ms: 60_000,
            max_claim_count: 10,
            batch_size: 10,
            block_time_ms: 10_000,
            dead_letter_mail_group: "dead-letter-mail-group".to_string(),
            dead_letter_mail_consumer: "dead-letter-mail-worker-1".to_string(),
            dead_letter_reprocess_group: None,
            handler_timeout_ms: None,
        }
    }
}

impl EventStreamConfig {
    /// The origin stream key, `{env}:{service}::events:{version}` unless overridden.
    ///
    /// The doubled separator matches keys already written by existing producers.
    #[must_use]
    pub fn stream_key(&self) -> String {
        self.stream_key.clone().unwrap_or_else(|| {
            format!(
                "{}:{}::events:{}",
                self.environment, self.service_name, self.service_version
            )
        })
    }

    /// The dead-letter stream key, shared by every service of an environment.
    #[must_use]
    pub fn dead_letter_stream_key(&self) -> String {
        self.dead_letter_stream_key
            .clone()
            .unwrap_or_else(|| format!("{}:events:dead-letter", self.environment))
    }

    /// The reprocessing group; per service so services never skip each other's letters.
    #[must_use]
    pub fn dead_letter_reprocess_group(&self) -> String {
        self.dead_letter_reprocess_group
            .clone()
            .unwrap_or_else(|| format!("{}.dead-letter.reprocess", self.service_name))
    }

    /// The per-message handler timeout, if any.
    #[must_use]
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    /// Settings for consuming the origin stream with the default group and consumer.
    #[must_use]
    pub fn origin_settings(&self) -> ChannelSettings {
        self.settings(self.default_group.clone(), self.default_consumer.clone())
    }

    /// Settings for the dead-letter notification consumer.
    #[must_use]
    pub fn mail_settings(&self) -> ChannelSettings {
        self.settings(
            self.dead_letter_mail_group.clone(),
            self.dead_letter_mail_consumer.clone(),
        )
    }

    /// Settings for the dead-letter reprocessing consumer.
    #[must_use]
    pub fn reprocess_settings(&self) -> ChannelSettings {
        self.settings(
            self.dead_letter_reprocess_group(),
            self.default_consumer.clone(),
        )
    }

    fn settings(&self, group_name: String, consumer_name: String) -> ChannelSettings {
        ChannelSettings {
            group_name,
            consumer_name,
            block_time: Duration::from_millis(self.block_time_ms),
            batch_size: self.batch_size,
            idle_time: Duration::from_millis(self.idle_time_ms),
            max_claim_count: self.max_claim_count,
            max_times_delivered: self.max_times_delivered,
        }
    }

    /// Checks the settings a worker cannot run without.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::Empty("service_name"));
        }
        if self.default_group.is_empty() {
            return Err(ConfigError::Empty("default_group"));
        }
        if self.default_consumer.is_empty() {
            return Err(ConfigError::Empty("default_consumer"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch_size"));
        }
        if self.max_claim_count == 0 {
            return Err(ConfigError::Zero("max_claim_count"));
        }
        if self.max_times_delivered == 0 {
            return Err(ConfigError::Zero("max_times_delivered"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_keys() {
        let config = EventStreamConfig {
            environment: "production".to_string(),
            service_name: "order".to_string(),
            service_version: "2.1.0".to_string(),
            ..EventStreamConfig::default()
        };

        assert_eq!(config.stream_key(), "production:order::events:2.1.0");
        assert_eq!(
            config.dead_letter_stream_key(),
            "production:events:dead-letter"
        );
        assert_eq!(
            config.dead_letter_reprocess_group(),
            "order.dead-letter.reprocess"
        );
    }

    #[test]
    fn test_overrides() {
        let config = EventStreamConfig {
            stream_key: Some("custom".to_string()),
            dead_letter_stream_key: Some("custom-dlq".to_string()),
            ..EventStreamConfig::default()
        };

        assert_eq!(config.stream_key(), "custom");
        assert_eq!(config.dead_letter_stream_key(), "custom-dlq");
    }

    #[test]
    fn test_settings() {
        let config = EventStreamConfig::default();
        let mail = config.mail_settings();

        assert_eq!(mail.group_name(), "dead-letter-mail-group");
        assert_eq!(mail.consumer_name(), "dead-letter-mail-worker-1");
        assert_eq!(mail.block_time(), Duration::from_secs(10));
        assert_eq!(config.origin_settings().max_times_delivered(), 3);
        assert_ne!(
            config.reprocess_settings().group_name(),
            mail.group_name()
        );
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EventStreamConfig = serde_json::from_str(
            r#"{ "service_name": "billing", "timezone": "UTC", "handler_timeout_ms": 500 }"#,
        )
        .unwrap();

        assert_eq!(config.service_name, "billing");
        assert_eq!(config.timezone, Tz::UTC);
        assert_eq!(config.handler_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn test_validate() {
        assert_eq!(EventStreamConfig::default().validate(), Ok(()));

        let config = EventStreamConfig {
            batch_size: 0,
            ..EventStreamConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("batch_size")));

        let config = EventStreamConfig {
            service_name: String::new(),
            ..EventStreamConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Empty("service_name")));
    }
}
