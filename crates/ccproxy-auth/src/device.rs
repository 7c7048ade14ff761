use std::time::Duration;

use serde::Deserialize;

/// What a provider hands back when a device-code flow starts.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    #[serde(alias = "verification_uri_complete")]
    pub verification_uri: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_expires_in() -> u64 {
    900
}

fn default_interval() -> u64 {
    5
}

/// One poll of the token endpoint.
#[derive(Debug, Clone)]
pub enum PollOutcome<T> {
    Authorized(T),
    Pending,
    SlowDown,
    Expired,
    Denied,
}

/// Backoff schedule while the user is off approving the device code.
/// `slow_down` responses stretch the interval; plain pending keeps it.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    interval: Duration,
}

impl PollBackoff {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    pub fn delay(&self) -> Duration {
        self.interval
    }

    pub fn slow_down(&mut self) {
        // GitHub asks for +5 seconds on slow_down; cap so a misbehaving
        // server cannot stall the flow forever.
        self.interval = (self.interval + Duration::from_secs(5)).min(Duration::from_secs(60));
    }
}
