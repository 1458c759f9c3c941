use std::env;
use std::time::Duration;

use uuid::Uuid;

/// Engine tuning knobs. `from_env` reads `STAGEHAND_*` variables (loading a
/// `.env` file if present); `Default` gives the same values for constructing
/// an engine directly in code or tests.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identifies this worker in lease columns; visible in `leased_by` for
    /// debugging which process owns an active run.
    pub worker_id: String,
    /// Idle sleep between claim attempts when nothing is eligible.
    pub poll_interval: Duration,
    /// How long a claim is held before the recovery sweep may requeue the
    /// run. The executor renews the lease between steps, so any single step
    /// must finish within this window.
    pub lease_seconds: i32,
    /// How often each poller sweeps for expired leases.
    pub sweep_interval: Duration,
    /// Number of concurrent poller tasks spawned by `start`.
    pub pollers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_interval: Duration::from_millis(750),
            lease_seconds: 30,
            sweep_interval: Duration::from_secs(5),
            pollers: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let worker_id = env::var("STAGEHAND_WORKER_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(default_worker_id);
        let poll_interval = env::var("STAGEHAND_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(750));
        let lease_seconds = env::var("STAGEHAND_LEASE_SECONDS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(30);
        let sweep_interval = env::var("STAGEHAND_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));
        let pollers = env::var("STAGEHAND_POLLERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(1);

        Self {
            worker_id,
            poll_interval,
            lease_seconds,
            sweep_interval,
            pollers,
        }
    }
}

fn default_worker_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}
