use crate::core::errors::KiwoomError;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, Secret};
use std::collections::HashMap;

/// Result type for signing operations: headers to attach
pub type SignatureResult = Result<HashMap<String, String>, KiwoomError>;

/// Signer trait for request authentication
///
/// Implementations return the headers that authenticate one request.
pub trait Signer: Send + Sync {
    /// Sign a request and return headers
    ///
    /// # Arguments
    /// * `method` - HTTP method (GET, POST, etc.)
    /// * `endpoint` - API endpoint path
    /// * `body` - Raw request body bytes
    fn sign_request(&self, method: &str, endpoint: &str, body: &[u8]) -> SignatureResult;
}

/// Supplies the access token presented in the realtime login frame
pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// Access token issued by the token endpoint
#[derive(Debug, Clone)]
pub struct AccessToken {
    value: Secret<String>,
    expires_at: Option<DateTime<FixedOffset>>,
}

impl AccessToken {
    pub fn new(value: String) -> Self {
        Self {
            value: Secret::new(value),
            expires_at: None,
        }
    }

    /// Attach the expiry reported by the venue as `YYYYMMDDHHMMSS` in Korea
    /// Standard Time
    pub fn with_expiry(mut self, expires_dt: &str) -> Result<Self, KiwoomError> {
        let naive = NaiveDateTime::parse_from_str(expires_dt, "%Y%m%d%H%M%S").map_err(|e| {
            KiwoomError::DecodeError(format!("Invalid token expiry '{}': {}", expires_dt, e))
        })?;
        let kst = FixedOffset::east_opt(9 * 3600)
            .ok_or_else(|| KiwoomError::DecodeError("Invalid KST offset".to_string()))?;
        self.expires_at = kst.from_local_datetime(&naive).single();
        Ok(self)
    }

    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn expires_at(&self) -> Option<DateTime<FixedOffset>> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at.with_timezone(&Utc) <= Utc::now())
    }
}

/// Bearer-token signer shared by the REST client and the socket login
#[derive(Debug, Default)]
pub struct BearerSigner {
    token: RwLock<Option<AccessToken>>,
}

impl BearerSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(AccessToken::new(token.into()))),
        }
    }

    pub fn set_token(&self, token: AccessToken) {
        *self.token.write() = Some(token);
    }

    pub fn clear(&self) -> Option<AccessToken> {
        self.token.write().take()
    }

    pub fn token(&self) -> Option<AccessToken> {
        self.token.read().clone()
    }
}

impl Signer for BearerSigner {
    fn sign_request(&self, _method: &str, _endpoint: &str, _body: &[u8]) -> SignatureResult {
        let guard = self.token.read();
        let token = guard
            .as_ref()
            .ok_or_else(|| KiwoomError::AuthError("No access token available".to_string()))?;

        if token.is_expired() {
            return Err(KiwoomError::AuthError("Access token expired".to_string()));
        }

        let mut headers = HashMap::new();
        headers.insert(
            "authorization".to_string(),
            format!("Bearer {}", token.expose()),
        );
        Ok(headers)
    }
}

impl TokenSource for BearerSigner {
    fn access_token(&self) -> Option<String> {
        self.token
            .read()
            .as_ref()
            .map(|token| token.expose().to_string())
    }
}
