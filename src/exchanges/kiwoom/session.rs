use crate::core::config::KiwoomConfig;
use crate::core::errors::KiwoomError;
use crate::core::kernel::{
    AccessToken, BearerSigner, Callback, ReqwestRest, RestRequest, RestResponse, SocketSession,
    SubscriptionRegistry,
};
use crate::core::types::{ConnectionState, Subscription};
use crate::exchanges::kiwoom::auth::{issue_token, revoke_token};
use crate::exchanges::kiwoom::builder::KiwoomSessionBuilder;
use crate::exchanges::kiwoom::codec::KiwoomCodec;
use crate::exchanges::kiwoom::realtime::{typed_callback, OrderBook, Tick, ORDER_BOOK, TICK};
use crate::exchanges::kiwoom::rest::KiwoomRestClient;
use crate::exchanges::kiwoom::types::{ChartPeriod, ChartTarget, Market, StockInfo};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

fn owned(values: &[impl AsRef<str>]) -> Vec<String> {
    values.iter().map(|v| v.as_ref().to_string()).collect()
}

/// An authenticated session with the venue
///
/// Owns the REST client, the access token and the realtime connection. Call
/// [`close`](Self::close) to revoke the token and stop the connection;
/// dropping the session only cancels its background tasks.
pub struct KiwoomSession {
    config: KiwoomConfig,
    rest: KiwoomRestClient<ReqwestRest>,
    signer: Arc<BearerSigner>,
    socket: SocketSession<KiwoomCodec>,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for KiwoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KiwoomSession")
            .field("config", &self.config)
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

impl KiwoomSession {
    pub(crate) fn from_parts(
        config: KiwoomConfig,
        rest: KiwoomRestClient<ReqwestRest>,
        signer: Arc<BearerSigner>,
        socket: SocketSession<KiwoomCodec>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            config,
            rest,
            signer,
            socket,
            shutdown_timeout,
        }
    }

    pub fn builder(config: KiwoomConfig) -> KiwoomSessionBuilder {
        KiwoomSessionBuilder::new(config)
    }

    /// Connect with default tuning
    pub async fn connect(config: KiwoomConfig) -> Result<Self, KiwoomError> {
        KiwoomSessionBuilder::new(config).connect().await
    }

    /// Connect, run `body`, then close whatever `body` returned
    pub async fn scoped<F, Fut, T>(config: KiwoomConfig, body: F) -> Result<T, KiwoomError>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = Result<T, KiwoomError>>,
    {
        let session = Arc::new(Self::connect(config).await?);
        let result = body(session.clone()).await;
        session.close().await;
        result
    }

    /// Issue the access token and bring the realtime connection live
    #[instrument(skip(self), fields(host = ?self.config.host))]
    pub(crate) async fn start(&self) -> Result<(), KiwoomError> {
        let token = issue_token(self.rest.inner(), &self.config).await?;
        self.signer.set_token(token);
        self.socket.connect().await?;
        info!("session live");
        Ok(())
    }

    pub fn rest(&self) -> &KiwoomRestClient<ReqwestRest> {
        &self.rest
    }

    /// Send one REST request
    pub async fn send(&self, request: &RestRequest) -> Result<RestResponse, KiwoomError> {
        self.rest.send(request).await
    }

    /// Follow a paged query to exhaustion and concatenate the array under `key`
    pub async fn fetch_all(&self, request: &RestRequest, key: &str) -> Result<Vec<Value>, KiwoomError> {
        self.rest.fetch_all(request, key).await
    }

    /// Page through a query while `should_continue` accepts the latest body
    pub async fn request_until<F>(
        &self,
        request: &RestRequest,
        max_pages: usize,
        should_continue: F,
    ) -> Result<Vec<RestResponse>, KiwoomError>
    where
        F: FnMut(&Value) -> bool + Send,
    {
        self.rest
            .request_until(request, max_pages, should_continue)
            .await
    }

    pub async fn stock_list(&self, market: Market) -> Result<Vec<StockInfo>, KiwoomError> {
        self.rest.stock_list(market).await
    }

    pub async fn stock_codes(&self, market: Market, integrated: bool) -> Result<Vec<String>, KiwoomError> {
        self.rest.stock_codes(market, integrated).await
    }

    /// Chart bars back to `start`; see [`KiwoomRestClient::candle`]
    pub async fn candle(
        &self,
        code: &str,
        period: ChartPeriod,
        target: ChartTarget,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<Value>, KiwoomError> {
        self.rest.candle(code, period, target, start, end).await
    }

    /// Register subjects for items in a group and bind `callback` to them
    ///
    /// Fails with `CapacityExceeded` if the group would hold more than 100
    /// items. The subscription is sent now if live, otherwise on next login.
    pub fn register(
        &self,
        group: &str,
        items: &[impl AsRef<str>],
        subjects: &[impl AsRef<str>],
        callback: Callback,
    ) -> Result<Subscription, KiwoomError> {
        self.socket
            .register(group, &owned(items), &owned(subjects), Some(callback))
    }

    /// Register executed trades for items in a group
    pub fn register_tick<F>(
        &self,
        group: &str,
        items: &[impl AsRef<str>],
        handler: F,
    ) -> Result<Subscription, KiwoomError>
    where
        F: Fn(Tick) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(group, items, &[TICK], typed_callback(handler))
    }

    /// Register order book updates for items in a group
    pub fn register_order_book<F>(
        &self,
        group: &str,
        items: &[impl AsRef<str>],
        handler: F,
    ) -> Result<Subscription, KiwoomError>
    where
        F: Fn(OrderBook) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(group, items, &[ORDER_BOOK], typed_callback(handler))
    }

    /// Remove subjects from a group; absent subjects are ignored
    pub fn remove(&self, group: &str, subjects: &[impl AsRef<str>]) -> Result<(), KiwoomError> {
        self.socket.remove(group, &owned(subjects))
    }

    pub fn state(&self) -> ConnectionState {
        self.socket.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.socket.state_changes()
    }

    /// Fatal realtime error (login rejected or reconnect budget exhausted)
    pub fn fatal_error(&self) -> Option<KiwoomError> {
        self.socket.fatal_error()
    }

    pub fn token(&self) -> Option<AccessToken> {
        self.signer.token()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.socket.registry()
    }

    /// Stop the realtime connection and revoke the token
    ///
    /// Revocation is best effort and abandoned after the shutdown deadline.
    /// REST calls already in flight are not cancelled.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        self.socket.close().await;

        if let Some(token) = self.signer.clear() {
            let revoke = revoke_token(self.rest.inner(), &self.config, &token);
            match tokio::time::timeout(self.shutdown_timeout, revoke).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "token revocation failed"),
                Err(_) => warn!("token revocation abandoned at shutdown deadline"),
            }
        }
        info!("session closed");
    }
}
