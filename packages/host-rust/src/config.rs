//! Host configuration types.

use std::time::Duration;

use uuid::Uuid;

/// Top-level configuration for a [`MessageHost`](crate::MessageHost).
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Identity of this fleet member, used in logs.
    pub instance_id: String,
    /// Maximum time `shutdown` waits for in-flight attempts to finish.
    pub drain_timeout: Duration,
    pub singleton: SingletonConfig,
    pub receiver: ReceiverConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            drain_timeout: Duration::from_secs(30),
            singleton: SingletonConfig::default(),
            receiver: ReceiverConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl HostConfig {
    /// Checks every nested section.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.instance_id.is_empty() {
            return Err("instance_id must not be empty".to_string());
        }
        self.singleton.validate()?;
        self.receiver.validate()
    }
}

/// Lease timing for singleton coordination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingletonConfig {
    /// Duration of one lease.
    pub lease_period: Duration,
    /// Interval between renewals while locked. Must be shorter than
    /// `lease_period`.
    pub renew_interval: Duration,
    /// Interval between acquisition attempts while another member holds the
    /// lock.
    pub poll_interval: Duration,
    /// Extra renewal attempts after a transient failure before the lease is
    /// considered lost.
    pub renew_retries: u32,
    /// Delay before the first retry; later retries back off from it.
    pub renew_retry_delay: Duration,
    /// Timeout handed to each renewal call.
    pub renew_timeout: Duration,
}

impl Default for SingletonConfig {
    fn default() -> Self {
        Self {
            lease_period: Duration::from_secs(60),
            renew_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(60),
            renew_retries: 3,
            renew_retry_delay: Duration::from_secs(1),
            renew_timeout: Duration::from_secs(10),
        }
    }
}

impl SingletonConfig {
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.lease_period.is_zero()
            || self.renew_interval.is_zero()
            || self.poll_interval.is_zero()
        {
            return Err("singleton lease, renew and poll intervals must be non-zero".to_string());
        }
        if self.renew_interval >= self.lease_period {
            return Err(format!(
                "singleton renew_interval ({:?}) must be shorter than lease_period ({:?})",
                self.renew_interval, self.lease_period
            ));
        }
        Ok(())
    }
}

/// Receive-loop timing shared by all channel receivers of a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// Longest a single receive call waits for the first message.
    pub receive_wait: Duration,
    /// Pause after a failed receive before trying again.
    pub receive_error_backoff: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            receive_wait: Duration::from_secs(1),
            receive_error_backoff: Duration::from_secs(5),
        }
    }
}

impl ReceiverConfig {
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.receive_wait.is_zero() {
            return Err("receive_wait must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Logging setup consumed by [`init_tracing`](crate::telemetry::init_tracing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
            service_name: "conveyor".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert_eq!(config.singleton.lease_period, Duration::from_secs(60));
        assert_eq!(config.singleton.renew_interval, Duration::from_secs(30));
        assert_eq!(config.singleton.poll_interval, Duration::from_secs(60));
        assert_eq!(config.singleton.renew_retries, 3);
    }

    #[test]
    fn instance_ids_are_unique() {
        assert_ne!(
            HostConfig::default().instance_id,
            HostConfig::default().instance_id
        );
    }

    #[test]
    fn renew_interval_must_be_shorter_than_lease() {
        let config = SingletonConfig {
            renew_interval: Duration::from_secs(60),
            ..SingletonConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("renew_interval"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = SingletonConfig {
            poll_interval: Duration::ZERO,
            ..SingletonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_receive_wait_is_rejected() {
        let config = HostConfig {
            receiver: ReceiverConfig {
                receive_wait: Duration::ZERO,
                ..ReceiverConfig::default()
            },
            ..HostConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
