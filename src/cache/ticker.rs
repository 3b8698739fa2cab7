//! Diagnostic ticker.
//!
//! Probes the fetch gate once a second and logs how long the probe waited.
//! A frozen gate shows up as a gap between `tick` lines followed by a large
//! `waited_ms`.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::info;

use super::guard::FetchGuard;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Run the ticker loop.  Should be spawned as a background task.
pub async fn run_ticker(guard: FetchGuard) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        tick(&guard).await;
    }
}

async fn tick(guard: &FetchGuard) -> Duration {
    let waited = guard.probe().await;
    info!(
        waited_ms = waited.as_millis() as u64,
        inflight = guard.inflight_keys(),
        "tick"
    );
    waited
}
