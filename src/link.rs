//! Network link abstraction
//!
//! The link is a black box to the rest of the appliance: it can be asked for
//! its status and told to reconnect. Reconnect requests never block.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CamError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Interface to supervise; `None` assumes the link is always up
    pub interface: Option<String>,
    /// Startup window: number of polls before giving up
    pub startup_attempts: u32,
    pub startup_step_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interface: None,
            startup_attempts: 20,
            startup_step_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
}

pub trait NetworkLink: Send + Sync {
    fn status(&self) -> LinkStatus;

    /// Start bringing the link up and return immediately.
    fn request_reconnect(&self) -> Result<()>;

    fn disconnect(&self) -> Result<()>;

    fn name(&self) -> &str;
}

/// A host network interface, observed through sysfs and driven with `ip`.
pub struct InterfaceLink {
    name: String,
    operstate: PathBuf,
}

impl InterfaceLink {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let operstate = PathBuf::from(format!("/sys/class/net/{name}/operstate"));
        Self { name, operstate }
    }

    fn spawn_ip(&self, state: &'static str) -> Result<()> {
        // Reaping the child needs a runtime; refusing is better than a zombie.
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| CamError::Link(format!("no runtime to drive `ip`: {e}")))?;

        let mut child = tokio::process::Command::new("ip")
            .args(["link", "set", self.name.as_str(), state])
            .kill_on_drop(false)
            .spawn()?;

        let name = self.name.clone();
        handle.spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!(link = %name, state, "ip link set done"),
                Ok(status) => warn!(link = %name, state, %status, "ip link set failed"),
                Err(e) => warn!(link = %name, state, "ip link set did not run: {}", e),
            }
        });
        Ok(())
    }
}

impl NetworkLink for InterfaceLink {
    fn status(&self) -> LinkStatus {
        match std::fs::read_to_string(&self.operstate) {
            // Loopback and some tunnel drivers report "unknown" while usable
            Ok(state) if matches!(state.trim(), "up" | "unknown") => LinkStatus::Up,
            _ => LinkStatus::Down,
        }
    }

    fn request_reconnect(&self) -> Result<()> {
        self.spawn_ip("up")
    }

    fn disconnect(&self) -> Result<()> {
        self.spawn_ip("down")
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// In-memory link. Reconnects succeed immediately.
#[derive(Debug)]
pub struct StaticLink {
    up: AtomicBool,
    reconnects: AtomicU64,
}

impl StaticLink {
    pub fn new(up: bool) -> Self {
        Self {
            up: AtomicBool::new(up),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn reconnect_requests(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

impl NetworkLink for StaticLink {
    fn status(&self) -> LinkStatus {
        if self.up.load(Ordering::Relaxed) {
            LinkStatus::Up
        } else {
            LinkStatus::Down
        }
    }

    fn request_reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.up.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.up.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Block startup until the link is up, polling `attempts` times `step` apart.
///
/// Fails with [`CamError::LinkTimeout`] once the window is exhausted.
pub async fn wait_for_link(link: &dyn NetworkLink, attempts: u32, step: Duration) -> Result<()> {
    if link.status() == LinkStatus::Up {
        return Ok(());
    }

    info!(link = link.name(), "Waiting for network link");
    if let Err(e) = link.request_reconnect() {
        warn!(link = link.name(), "Reconnect request failed: {}", e);
    }

    for _ in 0..attempts {
        tokio::time::sleep(step).await;
        if link.status() == LinkStatus::Up {
            info!(link = link.name(), "Network link up");
            return Ok(());
        }
    }

    Err(CamError::LinkTimeout {
        link: link.name().to_string(),
        waited: step * attempts,
    })
}
