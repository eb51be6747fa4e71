use std::time::Duration;

/// Hard cap on the number of messages fetched from the durable queue in one
/// poll cycle; the service-side batch APIs accept at most this many entries.
pub const MAX_RECEIVE_BATCH: usize = 10;

/// Maximum number of receipt handles sent in one visibility-reset batch call.
pub const MAX_VISIBILITY_BATCH: usize = 10;

/// Absolute bounds for the worker pool size. Configured values outside these
/// bounds are clamped with a warning, never rejected.
pub const ABSOLUTE_MIN_WORKERS: usize = 1;
pub const ABSOLUTE_MAX_WORKERS: usize = 256;

/// How long the orchestrator loop waits for a signal before re-checking its
/// housekeeping timer. Keeps housekeeping from being starved by signal
/// inactivity.
pub const ORCHESTRATOR_WAIT_CAP: Duration = Duration::from_secs(1);

/// How long a pool worker blocks on an empty internal queue before
/// re-checking its stop flag.
pub const WORKER_POP_TIMEOUT: Duration = Duration::from_millis(250);

/// How often should the instance inventory be fully refreshed.
pub fn get_inventory_refresh_interval() -> Duration {
    get_duration_from_env("SKYHOOK_INVENTORY_REFRESH_INTERVAL_MS")
        .unwrap_or_else(|| Duration::from_secs(30))
}

/// How often the orchestrator garbage-collects stale compute nodes.
pub fn get_housekeeping_interval() -> Duration {
    get_duration_from_env("SKYHOOK_HOUSEKEEPING_INTERVAL_MS")
        .unwrap_or_else(|| Duration::from_secs(60))
}

/// How often the pool-management loop enforces worker min/max bounds.
pub fn get_pool_enforcement_interval() -> Duration {
    get_duration_from_env("SKYHOOK_POOL_ENFORCEMENT_INTERVAL_MS")
        .unwrap_or_else(|| Duration::from_secs(15))
}

/// How long the poller sleeps after the pool reported capacity exceeded.
pub fn get_backpressure_backoff() -> Duration {
    get_duration_from_env("SKYHOOK_BACKPRESSURE_BACKOFF_MS")
        .unwrap_or_else(|| Duration::from_secs(5))
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Clamps a configured value into `[min, max]`, logging a warning when the
/// value had to be adjusted.
pub fn clamp_with_warning(what: &str, value: usize, min: usize, max: usize) -> usize {
    if value < min {
        log::warn!("Configured {what} {value} is below the minimum {min}, using {min}");
        min
    } else if value > max {
        log::warn!("Configured {what} {value} is above the maximum {max}, using {max}");
        max
    } else {
        value
    }
}
