//! Host identity facts reported once at agent startup, and lightweight
//! resource samples reported on an interval while jobs run.
//!
//! Field names match a fixed monitoring payload shape so a coordinator
//! that already understands it needs no changes to ingest this agent's
//! telemetry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// How often [`sample`] is expected to be called by the reporting loop.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// Static facts about the machine the agent runs on, gathered once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFacts {
    pub os: String,
    pub os_release: Option<String>,
    pub os_version: Option<String>,
    pub runtime_version: String,
    pub total_memory: u64,
    pub cpu_name: String,
    pub cpu_freq_min: u64,
    pub cpu_freq_max: u64,
    pub cpu_cores_physical: usize,
    pub cpu_cores_logical: usize,
    pub agent_version: String,
}

/// Gathers [`HostFacts`] for the current machine. `agent_version` is
/// passed in rather than read from `CARGO_PKG_VERSION` here, since the
/// reported version is the running agent binary's, which `agent-cli`
/// knows and this crate should not guess at.
pub fn host_facts(agent_version: &str) -> HostFacts {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu_all();

    let cpu_name = system
        .cpus()
        .first()
        .map(|c| c.brand().to_string())
        .unwrap_or_default();
    let cpu_freq_max = system.cpus().iter().map(|c| c.frequency()).max().unwrap_or(0);
    let cpu_freq_min = system.cpus().iter().map(|c| c.frequency()).min().unwrap_or(0);

    HostFacts {
        os: std::env::consts::OS.to_string(),
        os_release: System::kernel_version(),
        os_version: System::os_version(),
        runtime_version: std::env::var("CARGO_PKG_RUST_VERSION").unwrap_or_else(|_| "unknown".to_string()),
        total_memory: system.total_memory(),
        cpu_name,
        cpu_freq_min,
        cpu_freq_max,
        cpu_cores_physical: System::physical_core_count().unwrap_or(system.cpus().len()),
        cpu_cores_logical: system.cpus().len(),
        agent_version: agent_version.to_string(),
    }
}

/// A point-in-time resource usage reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub sampled_at: DateTime<Utc>,
    pub cpu_usage: f32,
    pub memory_usage: u64,
    pub disk_usage: u64,
    pub avg_load1: f64,
    pub avg_load5: f64,
    pub avg_load15: f64,
}

/// Samples current resource usage. `system` is reused across calls so
/// `sysinfo`'s CPU percentage, which needs two refreshes apart in time to
/// mean anything, is accurate after the first call.
pub fn sample(system: &mut System) -> ResourceSample {
    system.refresh_cpu_all();
    system.refresh_memory();
    let cpu_usage = if system.cpus().is_empty() {
        0.0
    } else {
        system.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / system.cpus().len() as f32
    };
    let load = System::load_average();
    let disk_usage = sysinfo::Disks::new_with_refreshed_list()
        .iter()
        .map(|d| d.total_space().saturating_sub(d.available_space()))
        .sum();

    ResourceSample {
        sampled_at: Utc::now(),
        cpu_usage,
        memory_usage: system.used_memory(),
        disk_usage,
        avg_load1: load.one,
        avg_load5: load.five,
        avg_load15: load.fifteen,
    }
}

/// Runs `on_sample` every [`SAMPLE_INTERVAL`] until cancelled. The first
/// reading is discarded: `sysinfo`'s CPU percentage is meaningless until a
/// second refresh has happened, so reporting it would show a misleading
/// zero or full-load spike at startup.
pub async fn run_sampling_loop<F>(mut on_sample: F)
where
    F: FnMut(ResourceSample),
{
    let mut system = System::new();
    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
    interval.tick().await;
    sample(&mut system);

    loop {
        interval.tick().await;
        let reading = sample(&mut system);
        on_sample(reading);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_facts_reports_nonzero_logical_cores() {
        let facts = host_facts("0.1.0");
        assert!(facts.cpu_cores_logical >= 1);
        assert_eq!(facts.agent_version, "0.1.0");
    }

    #[test]
    fn sample_reports_nonnegative_usage() {
        let mut system = System::new();
        let reading = sample(&mut system);
        assert!(reading.cpu_usage >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_loop_discards_first_tick() {
        let samples = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let samples_clone = samples.clone();

        let handle = tokio::spawn(async move {
            run_sampling_loop(move |s| samples_clone.lock().unwrap().push(s)).await;
        });

        tokio::task::yield_now().await;
        tokio::time::advance(SAMPLE_INTERVAL * 2 + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        handle.abort();

        assert!(!samples.lock().unwrap().is_empty());
    }
}
