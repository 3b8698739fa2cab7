//! Administrative freeze route.
//!
//! `GET /lock` takes the fetch gate exclusively and keeps it for as long as
//! the client stays connected, so an operator can clean the state directory
//! by hand without racing cache fills.  Cached entries are still served
//! while frozen; only misses wait.
//!
//! The response body emits `locked` once the gate is held and then one
//! keep-alive line per second.  When the client goes away the next write
//! fails, the body is dropped and the gate is released with it.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use prometheus_client::metrics::gauge::Gauge;
use tokio::sync::OwnedRwLockWriteGuard;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::AppState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// `GET /lock`
pub async fn handle_lock(State(state): State<Arc<AppState>>) -> Response {
    warn!("administrative lock requested, waiting for in-flight fetches");
    let guard = state.cache.guard().freeze().await;

    let gauge = state.metrics.metrics.freeze_active.clone();
    gauge.inc();
    warn!("fetch gate frozen until the lock client disconnects");

    let hold = FreezeHold {
        _guard: guard,
        gauge,
    };
    let mut ticks =
        tokio::time::interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let body = Body::from_stream(keepalive_stream(hold, ticks, state.shutdown.clone()));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response()
}

/// A stream that owns `hold` until it is dropped or `shutdown` fires.
fn keepalive_stream(
    hold: FreezeHold,
    ticks: Interval,
    shutdown: CancellationToken,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    futures::stream::unfold(
        Some((hold, ticks, true)),
        move |held| {
            let shutdown = shutdown.clone();
            async move {
                let (hold, mut ticks, first) = held?;
                if first {
                    let line = Bytes::from_static(b"locked\n");
                    return Some((Ok(line), Some((hold, ticks, false))));
                }
                let stopping = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => true,
                    _ = ticks.tick() => false,
                };
                if stopping {
                    info!("shutting down, releasing administrative lock");
                    drop(hold);
                    return None;
                }
                Some((Ok(Bytes::from_static(b"\n")), Some((hold, ticks, false))))
            }
        },
    )
}

/// Keeps the gate frozen and the gauge raised while alive.
struct FreezeHold {
    _guard: OwnedRwLockWriteGuard<()>,
    gauge: Gauge,
}

impl Drop for FreezeHold {
    fn drop(&mut self) {
        self.gauge.dec();
        info!("administrative lock released");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
