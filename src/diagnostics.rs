//! Runtime diagnostics for `/infos`, `/mem` and `/stats`

use std::time::{Duration, Instant};

use crate::hub::HubStats;

/// Point-in-time view of the process and the hub
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub version: &'static str,
    pub os: &'static str,
    pub arch: &'static str,
    pub cpus: usize,
    pub workers: usize,
    pub alive_tasks: usize,
    /// Resident set size in bytes, when the platform exposes it
    pub resident_bytes: Option<u64>,
    pub hub: HubStats,
    pub uptime: Duration,
}

impl Diagnostics {
    /// Collect diagnostics; must be called from inside a tokio runtime
    pub fn collect(hub: HubStats, started: Instant) -> Self {
        let metrics = tokio::runtime::Handle::current().metrics();
        Self {
            version: env!("CARGO_PKG_VERSION"),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            workers: metrics.num_workers(),
            alive_tasks: metrics.num_alive_tasks(),
            resident_bytes: resident_bytes(),
            hub,
            uptime: started.elapsed(),
        }
    }

    /// Render as reply lines
    pub fn lines(&self) -> Vec<String> {
        let memory = match self.resident_bytes {
            Some(bytes) => format!("{:.3} MiB", bytes as f64 / 1024.0 / 1024.0),
            None => "unavailable".to_string(),
        };
        vec![
            format!("chat_hub {} {} {}", self.version, self.os, self.arch),
            format!("CPUs: {}", self.cpus),
            format!("Runtime workers: {}", self.workers),
            format!("Alive tasks: {}", self.alive_tasks),
            format!("Resident memory: {}", memory),
            format!("Connected clients: {}", self.hub.sessions),
            format!("Total joins: {}", self.hub.total_joined),
            format!("Broadcast messages: {}", self.hub.messages_broadcast),
            format!("Slow client disconnects: {}", self.hub.slow_disconnects),
            format!("Dropped messages: {}", self.hub.dropped_messages),
            format!("Uptime: {}s", self.uptime.as_secs()),
        ]
    }
}

#[cfg(target_os = "linux")]
fn resident_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes() -> Option<u64> {
    None
}

/// Parse the `VmRSS:   1234 kB` line of `/proc/self/status`
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb * 1024)
}
