use crate::core::errors::KiwoomError;
use crate::core::kernel::exponential_backoff;
use crate::core::kernel::rate_limit::RateLimiter;
use crate::core::kernel::signer::Signer;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::jitter;
use tokio_retry::RetryIf;
use tracing::{instrument, trace, warn};

/// Request header naming the venue operation
pub const HEADER_API_ID: &str = "api-id";
/// Request/response header flagging a continued query
pub const HEADER_CONT_YN: &str = "cont-yn";
/// Request/response header carrying the continuation cursor
pub const HEADER_NEXT_KEY: &str = "next-key";
/// Body `return_code` reported for an invalid or expired access token
pub const INVALID_TOKEN_CODE: i64 = 8005;
/// Page cap applied by the paging helpers when the caller has no better bound
pub const DEFAULT_MAX_PAGES: usize = 100;

/// Opaque server token selecting the next page of a query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContinuationCursor(String);

impl ContinuationCursor {
    /// Returns `None` for an empty key, which the venue uses to signal exhaustion
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let more = headers
            .get(HEADER_CONT_YN)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("Y"));
        if !more {
            return None;
        }
        headers
            .get(HEADER_NEXT_KEY)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::new)
    }
}

/// One REST call
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    pub endpoint: String,
    pub api_id: Option<String>,
    pub query: Vec<(String, String)>,
    pub body: Value,
    pub authenticated: bool,
    pub cursor: Option<ContinuationCursor>,
}

impl RestRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            api_id: None,
            query: Vec::new(),
            body: Value::Null,
            authenticated: true,
            cursor: None,
        }
    }

    /// Authenticated POST naming the venue operation, the shape of every venue query
    pub fn post(endpoint: impl Into<String>, api_id: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint).with_api_id(api_id)
    }

    pub fn with_api_id(mut self, api_id: impl Into<String>) -> Self {
        self.api_id = Some(api_id.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_cursor(mut self, cursor: Option<ContinuationCursor>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Send without the authorization header
    pub fn public(mut self) -> Self {
        self.authenticated = false;
        self
    }
}

/// Decoded REST response
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub api_id: Option<String>,
    pub cursor: Option<ContinuationCursor>,
    pub body: Value,
}

impl RestResponse {
    pub fn has_more(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, KiwoomError> {
        T::deserialize(&self.body).map_err(|e| {
            KiwoomError::DecodeError(format!("Failed to deserialize response: {}", e))
        })
    }
}

/// REST client trait for making HTTP requests
///
/// Implementations gate every network call through the shared rate limiter,
/// retry transient failures and surface authentication failures untouched.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Send one request, following no continuation
    ///
    /// # Arguments
    /// * `request` - The request to send; a cursor on it selects a later page
    ///
    /// # Returns
    /// The decoded response with the next cursor, if the server issued one
    async fn send(&self, request: &RestRequest) -> Result<RestResponse, KiwoomError>;

    /// Send one request and deserialize the body to the specified type
    async fn send_json<T: DeserializeOwned>(&self, request: &RestRequest) -> Result<T, KiwoomError>;
}

/// Configuration for the REST client
#[derive(Clone, Debug)]
pub struct RestClientConfig {
    /// Base URL for the API
    pub base_url: String,
    /// Venue name for logging and tracing
    pub venue_name: String,
    /// Total request timeout in seconds
    pub timeout_seconds: u64,
    /// Connect timeout in seconds
    pub connect_timeout_seconds: u64,
    /// Maximum number of retries for transient failures
    pub max_retries: u32,
    /// First retry delay in milliseconds; later delays double
    pub retry_base_delay_ms: u64,
    /// Upper bound for a single retry delay in milliseconds
    pub retry_max_delay_ms: u64,
    /// User agent string to include in requests
    pub user_agent: String,
}

impl RestClientConfig {
    /// Create a new configuration
    ///
    /// # Arguments
    /// * `base_url` - Base URL for the API
    /// * `venue_name` - Name of the venue
    pub fn new(base_url: String, venue_name: String) -> Self {
        Self {
            base_url,
            venue_name,
            timeout_seconds: 10,
            connect_timeout_seconds: 3,
            max_retries: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 3_000,
            user_agent: concat!("kiwoom-rs/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    /// Set the total request timeout
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Set the maximum number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the retry backoff bounds
    pub fn with_retry_delay(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay_ms = base.as_millis() as u64;
        self.retry_max_delay_ms = max.as_millis() as u64;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Builder for creating REST client instances
pub struct RestClientBuilder {
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl RestClientBuilder {
    /// Create a new builder with the given configuration
    pub fn new(config: RestClientConfig) -> Self {
        Self {
            config,
            signer: None,
            limiter: None,
        }
    }

    /// Set the signer for authenticated requests
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Share a rate limiter with other clients of the same account
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Build the REST client
    pub fn build(self) -> Result<ReqwestRest, KiwoomError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_seconds))
            .user_agent(&self.config.user_agent)
            .build()
            .map_err(|e| KiwoomError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(ReqwestRest {
            client,
            config: self.config,
            signer: self.signer,
            limiter: self
                .limiter
                .unwrap_or_else(|| Arc::new(RateLimiter::default())),
        })
    }
}

/// Implementation of `RestClient` using reqwest
#[derive(Clone)]
pub struct ReqwestRest {
    client: Client,
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
    limiter: Arc<RateLimiter>,
}

impl std::fmt::Debug for ReqwestRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestRest")
            .field("config", &self.config)
            .field("has_signer", &self.signer.is_some())
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl ReqwestRest {
    pub fn config(&self) -> &RestClientConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Build the full URL for an endpoint
    fn build_url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    /// Map a send failure onto the transient family
    fn classify_send_error(e: &reqwest::Error) -> KiwoomError {
        if e.is_timeout() {
            KiwoomError::ConnectionTimeout(format!("Request timed out: {}", e))
        } else {
            KiwoomError::NetworkError(format!("Request failed: {}", e))
        }
    }

    /// Reject bodies whose `return_code` reports a failure
    fn check_return_code(body: &Value) -> Result<(), KiwoomError> {
        let Some(code) = body.get("return_code").and_then(Value::as_i64) else {
            return Ok(());
        };
        if code == 0 {
            return Ok(());
        }

        let message = body
            .get("return_msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if code == INVALID_TOKEN_CODE {
            Err(KiwoomError::AuthError(message))
        } else {
            Err(KiwoomError::ApiError { code, message })
        }
    }

    /// Handle the response and extract JSON
    #[instrument(skip(self, response), fields(venue = %self.config.venue_name, status = %response.status()))]
    async fn handle_response(&self, response: Response) -> Result<RestResponse, KiwoomError> {
        let status = response.status();
        let headers = response.headers().clone();
        let response_text = response.text().await.map_err(|e| {
            KiwoomError::NetworkError(format!("Failed to read response body: {}", e))
        })?;

        trace!("Response body: {}", response_text);

        if status == StatusCode::UNAUTHORIZED {
            return Err(KiwoomError::AuthError(response_text));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(KiwoomError::ServerError {
                status: status.as_u16(),
                message: response_text,
            });
        }
        if !status.is_success() {
            return Err(KiwoomError::ApiError {
                code: status.as_u16() as i64,
                message: response_text,
            });
        }

        let body: Value = if response_text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&response_text).map_err(|e| {
                KiwoomError::DecodeError(format!("Failed to parse JSON response: {}", e))
            })?
        };
        Self::check_return_code(&body)?;

        Ok(RestResponse {
            status: status.as_u16(),
            api_id: headers
                .get(HEADER_API_ID)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            cursor: ContinuationCursor::from_headers(&headers),
            body,
        })
    }

    /// Make a single attempt, waiting for a rate window slot first
    async fn execute(&self, request: &RestRequest) -> Result<RestResponse, KiwoomError> {
        let body = if request.body.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(&request.body).map_err(|e| {
                KiwoomError::SerializationError(format!("Failed to serialize request body: {}", e))
            })?
        };

        let mut builder = self
            .client
            .request(request.method.clone(), self.build_url(&request.endpoint));

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(api_id) = &request.api_id {
            builder = builder.header(HEADER_API_ID, api_id);
        }
        if let Some(cursor) = &request.cursor {
            builder = builder
                .header(HEADER_CONT_YN, "Y")
                .header(HEADER_NEXT_KEY, cursor.as_str());
        }

        // Handle authentication if required
        if request.authenticated {
            let signer = self.signer.as_ref().ok_or_else(|| {
                KiwoomError::AuthError("Authentication required but no signer provided".to_string())
            })?;
            let headers =
                signer.sign_request(request.method.as_str(), &request.endpoint, &body)?;
            for (key, value) in headers {
                builder = builder.header(key, value);
            }
        }

        if !body.is_empty() {
            builder = builder
                .header("content-type", "application/json;charset=UTF-8")
                .body(body);
        }

        self.limiter.acquire().await;

        let response = builder
            .send()
            .await
            .map_err(|e| Self::classify_send_error(&e))?;

        self.handle_response(response).await
    }
}

#[async_trait]
impl RestClient for ReqwestRest {
    #[instrument(skip(self, request), fields(venue = %self.config.venue_name, endpoint = %request.endpoint, api_id = ?request.api_id))]
    async fn send(&self, request: &RestRequest) -> Result<RestResponse, KiwoomError> {
        let strategy = exponential_backoff(
            self.config.retry_base_delay_ms,
            self.config.retry_max_delay_ms,
        )
        .map(jitter)
        .take(self.config.max_retries as usize);

        RetryIf::start(
            strategy,
            || self.execute(request),
            |e: &KiwoomError| {
                let retry = e.is_transient();
                if retry {
                    warn!(error = %e, "transient REST failure, retrying");
                }
                retry
            },
        )
        .await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: &RestRequest) -> Result<T, KiwoomError> {
        self.send(request).await.and_then(|response| response.json())
    }
}

/// Keep requesting pages while the server returns a cursor and
/// `should_continue` accepts the latest body
///
/// Pages are returned in arrival order. Reaching `max_pages` stops paging with
/// a warning rather than an error.
pub async fn request_until<R, F>(
    client: &R,
    request: &RestRequest,
    max_pages: usize,
    mut should_continue: F,
) -> Result<Vec<RestResponse>, KiwoomError>
where
    R: RestClient,
    F: FnMut(&Value) -> bool + Send,
{
    let max_pages = max_pages.max(1);
    let mut next = request.clone();
    let mut pages = Vec::new();

    loop {
        let page = client.send(&next).await?;
        let cursor = page.cursor.clone();
        let proceed = should_continue(&page.body);
        pages.push(page);

        match cursor {
            Some(cursor) if proceed => {
                if pages.len() >= max_pages {
                    warn!(
                        endpoint = %request.endpoint,
                        max_pages,
                        "page cap reached, truncating continued query"
                    );
                    break;
                }
                next.cursor = Some(cursor);
            }
            _ => break,
        }
    }

    Ok(pages)
}

/// Follow continuation cursors until the server reports no further pages
pub async fn fetch_all_pages<R: RestClient>(
    client: &R,
    request: &RestRequest,
    max_pages: usize,
) -> Result<Vec<RestResponse>, KiwoomError> {
    request_until(client, request, max_pages, |_| true).await
}

/// Concatenate the array stored under `key` across pages, in page order
pub fn concat_records(pages: &[RestResponse], key: &str) -> Vec<Value> {
    pages
        .iter()
        .filter_map(|page| page.body.get(key).and_then(Value::as_array))
        .flat_map(|records| records.iter().cloned())
        .collect()
}
