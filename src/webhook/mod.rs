//! Webhook gateway.
//!
//! All wire communication with the external analysis engine: the outbound
//! dispatch client, the inbound HTTP server (results, status, health), the
//! HMAC authentication layer, and the buffered result consumer that routes
//! validated payloads into the job tracker and queue manager.

mod auth;
mod client;
mod consumer;
mod payload;
mod server;

pub use auth::{sign, verify_request, AuthFailure, RequestAuth};
pub use client::{TrackingDispatcher, WebhookClient};
pub use consumer::{
    process_result, result_channel, spawn_consumer, ResultNotifier, TracingResultNotifier,
    RESULT_CHANNEL_CAPACITY,
};
pub use payload::{DispatchPayload, ResultPayload, ResultStatus};
pub use server::{create_router, serve, GatewayState};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("engine rejected request: HTTP {0}")]
    Client(u16),
    #[error("engine unavailable: HTTP {0}")]
    Server(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
}
