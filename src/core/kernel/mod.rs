/// Kiwoom kernel - transport and session layer
///
/// This module holds the venue-agnostic half of the client: how calls are
/// paced, sent, retried and paged, and how the realtime connection is kept
/// alive and its messages routed. Wire formats live with the venue adapter.
///
/// # Architecture
///
/// ## Transport Layer
/// - `RateLimiter`: Rolling-window pacing shared by every REST call
/// - `RestClient`: Unified HTTP client interface with continuation cursors
/// - `WsSession`: WebSocket connection management
///
/// ## Authentication
/// - `Signer`: Pluggable request authentication
/// - `BearerSigner`: Access token holder for REST headers and the socket login
///
/// ## Realtime
/// - `WsCodec`: Venue-specific frame encoding/decoding
/// - `SubscriptionRegistry`: Desired subscriptions grouped under capacity
/// - `CallbackDispatcher`: Failure-isolated callback invocation
/// - `SocketSession`: Login, heartbeat, reconnect-with-replay and dispatch
///
/// # Example
///
/// ```rust,no_run
/// use kiwoom::core::kernel::*;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let rest_config = RestClientConfig::new(
///     "https://api.kiwoom.com".to_string(),
///     "kiwoom".to_string(),
/// );
/// let signer = Arc::new(BearerSigner::with_token("access-token"));
/// let rest = RestClientBuilder::new(rest_config)
///     .with_signer(signer)
///     .with_rate_limiter(Arc::new(RateLimiter::per_second(5)))
///     .build()?;
///
/// let request = RestRequest::post("/api/dostk/stkinfo", "ka10099")
///     .with_body(json!({ "mrkt_tp": "0" }));
/// let pages = fetch_all_pages(&rest, &request, DEFAULT_MAX_PAGES).await?;
/// let records = concat_records(&pages, "list");
/// # let _ = records;
/// # Ok(())
/// # }
/// ```
pub mod codec;
pub mod dispatch;
pub mod rate_limit;
pub mod registry;
pub mod rest;
pub mod signer;
pub mod socket;
pub mod ws;

use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;

// Re-export key types for convenience
pub use codec::WsCodec;
pub use dispatch::{CallbackDispatcher, DispatchOutcome};
pub use rate_limit::RateLimiter;
pub use registry::{Callback, SubscriptionRegistry, MAX_GROUP_ITEMS};
pub use rest::{
    concat_records, fetch_all_pages, request_until, ContinuationCursor, ReqwestRest, RestClient,
    RestClientBuilder, RestClientConfig, RestRequest, RestResponse, DEFAULT_MAX_PAGES,
};
pub use signer::{AccessToken, BearerSigner, SignatureResult, Signer, TokenSource};
pub use socket::SocketSession;
pub use ws::{ConnectionStats, HeartbeatMonitor, TungsteniteWs, WsConfig, WsSession};

/// Doubling delays starting at `base_ms`, each capped at `max_ms`
pub(crate) fn exponential_backoff(base_ms: u64, max_ms: u64) -> ExponentialBackoff {
    ExponentialBackoff::from_millis(2)
        .factor((base_ms / 2).max(1))
        .max_delay(Duration::from_millis(max_ms))
}
