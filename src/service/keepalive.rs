use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Observable keep-alive counters for one connection
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepAliveStats {
    pub enabled: bool,
    pub interval_minutes: u32,
    pub last_sent: Option<DateTime<Utc>>,
    pub last_received: Option<DateTime<Utc>>,
    pub in_progress: bool,
}

/// Keep-alive bookkeeping owned by a connection controller.
///
/// The schedule itself is a timer in the controller's event loop; ticks
/// request a normal outbound send, which naturally loses arbitration to a
/// concurrent inbound transmission.
#[derive(Debug)]
pub struct KeepAliveState {
    interval: Option<Duration>,
    stats: KeepAliveStats,
}

impl KeepAliveState {
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            stats: KeepAliveStats {
                enabled: interval.is_some(),
                interval_minutes: interval
                    .map(|d| (d.as_secs() / 60) as u32)
                    .unwrap_or(0),
                ..Default::default()
            },
        }
    }

    pub fn enabled(&self) -> bool {
        self.interval.is_some()
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// A keep-alive send was queued and is on the wire
    pub fn sending(&mut self) {
        self.stats.in_progress = true;
    }

    /// The queued keep-alive send finished, successfully or not
    pub fn sent(&mut self, success: bool) {
        self.stats.in_progress = false;
        if success {
            self.stats.last_sent = Some(Utc::now());
        }
    }

    /// An inbound transmission classified as a keep-alive arrived
    pub fn received(&mut self) {
        self.stats.last_received = Some(Utc::now());
    }

    pub fn stats(&self) -> KeepAliveStats {
        self.stats.clone()
    }
}
