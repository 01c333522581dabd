use crate::core::config::KiwoomConfig;
use crate::core::errors::KiwoomError;
use crate::core::kernel::{
    BearerSigner, RateLimiter, RestClientBuilder, RestClientConfig, SocketSession,
    SubscriptionRegistry, WsConfig,
};
use crate::exchanges::kiwoom::codec::KiwoomCodec;
use crate::exchanges::kiwoom::rest::KiwoomRestClient;
use crate::exchanges::kiwoom::session::KiwoomSession;
use std::sync::Arc;
use std::time::Duration;

pub const VENUE_NAME: &str = "kiwoom";

/// Assembles a [`KiwoomSession`] from configuration and engine tuning
pub struct KiwoomSessionBuilder {
    config: KiwoomConfig,
    rest_config: RestClientConfig,
    ws_config: WsConfig,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl KiwoomSessionBuilder {
    pub fn new(config: KiwoomConfig) -> Self {
        let rest_config = RestClientConfig::new(config.rest_endpoint(), VENUE_NAME.to_string());
        Self {
            config,
            rest_config,
            ws_config: WsConfig::default(),
            rate_limiter: None,
        }
    }

    /// Replace the REST tuning; the base URL always follows the session config
    pub fn with_rest_config(mut self, rest_config: RestClientConfig) -> Self {
        self.rest_config = RestClientConfig {
            base_url: self.config.rest_endpoint(),
            ..rest_config
        };
        self
    }

    pub fn with_ws_config(mut self, ws_config: WsConfig) -> Self {
        self.ws_config = ws_config;
        self
    }

    /// Admit at most `calls` REST calls per rolling second
    pub fn with_rate_limit(mut self, calls: usize) -> Self {
        self.rate_limiter = Some(Arc::new(RateLimiter::per_second(calls)));
        self
    }

    /// Share a limiter with other sessions of the same account
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Assemble the session without touching the network
    pub fn build(self) -> Result<KiwoomSession, KiwoomError> {
        if !self.config.has_credentials() {
            return Err(KiwoomError::AuthError(
                "App key and secret key are required".to_string(),
            ));
        }

        let signer = Arc::new(BearerSigner::new());
        let limiter = self
            .rate_limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::default()));

        let rest = RestClientBuilder::new(self.rest_config)
            .with_signer(signer.clone())
            .with_rate_limiter(limiter)
            .build()?;

        let shutdown_timeout = Duration::from_millis(self.ws_config.shutdown_timeout_ms);
        let socket = SocketSession::new(
            self.config.ws_endpoint(),
            VENUE_NAME.to_string(),
            self.ws_config,
            KiwoomCodec,
            Arc::new(SubscriptionRegistry::new()),
            signer.clone(),
        )?;

        Ok(KiwoomSession::from_parts(
            self.config,
            KiwoomRestClient::new(rest),
            signer,
            socket,
            shutdown_timeout,
        ))
    }

    /// Assemble the session, issue a token and wait until the socket is live
    pub async fn connect(self) -> Result<KiwoomSession, KiwoomError> {
        let session = self.build()?;
        if let Err(e) = session.start().await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }
}
