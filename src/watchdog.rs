//! Connectivity watchdog: periodic link check with non-blocking reconnect

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::link::{LinkStatus, NetworkLink};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Healthy,
    ReconnectRequested,
}

pub struct ConnectivityWatchdog {
    link: Arc<dyn NetworkLink>,
    interval: Duration,
    last: Option<LinkStatus>,
}

impl ConnectivityWatchdog {
    pub fn new(link: Arc<dyn NetworkLink>, interval: Duration) -> Self {
        Self {
            link,
            interval,
            last: None,
        }
    }

    /// One check. A down link gets a reconnect request; the outcome is only
    /// observed on the next tick.
    pub fn tick(&mut self) -> WatchdogAction {
        let status = self.link.status();
        let previous = self.last.replace(status);

        match status {
            LinkStatus::Up => {
                if previous == Some(LinkStatus::Down) {
                    info!(link = self.link.name(), "Network link restored");
                }
                WatchdogAction::Healthy
            }
            LinkStatus::Down => {
                warn!(link = self.link.name(), "Network link down, requesting reconnect");
                if let Err(e) = self.link.request_reconnect() {
                    warn!(link = self.link.name(), "Reconnect request failed: {}", e);
                }
                WatchdogAction::ReconnectRequested
            }
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; the link was just checked at startup.
            interval.tick().await;
            loop {
                interval.tick().await;
                self.tick();
            }
        })
    }
}
