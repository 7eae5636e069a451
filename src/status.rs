//! Liveness telemetry for `/status`

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use sysinfo::System;

use crate::stream::SessionManager;

/// Point-in-time view of process counters and host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub uptime_seconds: u64,
    pub free_memory_kb: u64,
    pub total_connections: u64,
    pub active: bool,
}

/// Wire shape of the `/status` JSON body.
#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub running: bool,
    pub uptime: u64,
    pub heap: u64,
    pub clients: u64,
    pub active: u8,
}

impl From<StatusSnapshot> for StatusBody {
    fn from(snapshot: StatusSnapshot) -> Self {
        Self {
            running: true,
            uptime: snapshot.uptime_seconds,
            heap: snapshot.free_memory_kb,
            clients: snapshot.total_connections,
            active: snapshot.active as u8,
        }
    }
}

pub struct StatusReporter {
    started: Instant,
    sessions: Arc<SessionManager>,
    system: Mutex<System>,
}

impl StatusReporter {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            started: Instant::now(),
            sessions,
            system: Mutex::new(System::new()),
        }
    }

    /// Read-only; never fails.
    pub fn snapshot(&self) -> StatusSnapshot {
        let free_memory_kb = {
            let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_memory();
            system.available_memory() / 1024
        };

        StatusSnapshot {
            uptime_seconds: self.started.elapsed().as_secs(),
            free_memory_kb,
            total_connections: self.sessions.total_connections(),
            active: self.sessions.is_active(),
        }
    }
}
