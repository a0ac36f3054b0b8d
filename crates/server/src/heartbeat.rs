//! Keepalive task
//!
//! Publishes a `system.health.heartbeat` at a fixed cadence with coarse
//! service metrics.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use colloquy_bus::EphemeralBus;
use colloquy_session::SessionManager;

pub fn spawn_heartbeat(
    bus: Arc<EphemeralBus>,
    sessions: Arc<SessionManager>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = std::time::Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let result = bus
                .publish_heartbeat(
                    "healthy",
                    serde_json::json!({
                        "active_sessions": sessions.count(),
                        "uptime_s": started.elapsed().as_secs(),
                    }),
                )
                .await;
            if let Err(e) = result {
                tracing::debug!(error = %e, "Heartbeat publish failed");
            }
        }
    })
}
