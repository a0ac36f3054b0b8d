//! Server crate: HTTP surface, websocket ingress and service wiring.

pub mod heartbeat;
pub mod http;
pub mod metrics;
pub mod state;
pub mod ws;

pub use http::create_router;
pub use metrics::init_metrics;
pub use state::{AppState, LocalBrain};
