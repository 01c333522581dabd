use crate::core::config::CredentialProvider;
use crate::core::errors::KiwoomError;
use crate::core::kernel::{AccessToken, RestClient, RestRequest};
use crate::exchanges::kiwoom::types::{RevokeRequest, TokenRequest, TokenResponse};
use tracing::{debug, instrument};

pub const TOKEN_ENDPOINT: &str = "/oauth2/token";
pub const TOKEN_API_ID: &str = "au10001";
pub const REVOKE_ENDPOINT: &str = "/oauth2/revoke";
pub const REVOKE_API_ID: &str = "au10002";

fn to_body<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, KiwoomError> {
    serde_json::to_value(value).map_err(|e| {
        KiwoomError::SerializationError(format!("Failed to serialize auth request: {}", e))
    })
}

/// Exchange the app key and secret for an access token
///
/// Any rejection of the credentials surfaces as `AuthError`.
#[instrument(skip_all)]
pub async fn issue_token<R: RestClient>(
    rest: &R,
    credentials: &dyn CredentialProvider,
) -> Result<AccessToken, KiwoomError> {
    let body = to_body(&TokenRequest {
        grant_type: "client_credentials",
        appkey: credentials.app_key(),
        secretkey: credentials.secret_key(),
    })?;
    let request = RestRequest::post(TOKEN_ENDPOINT, TOKEN_API_ID)
        .with_body(body)
        .public();

    let response: TokenResponse = rest.send_json(&request).await.map_err(|e| match e {
        KiwoomError::ApiError { code, message } => {
            KiwoomError::AuthError(format!("Token request rejected ({}): {}", code, message))
        }
        other => other,
    })?;

    if response.token.is_empty() {
        return Err(KiwoomError::AuthError(format!(
            "Token response carried no token: {}",
            response.return_msg.unwrap_or_default()
        )));
    }

    let token = AccessToken::new(response.token);
    let token = match response.expires_dt.as_deref() {
        Some(expires_dt) if !expires_dt.is_empty() => token.with_expiry(expires_dt)?,
        _ => token,
    };
    debug!(expires_at = ?token.expires_at(), "access token issued");
    Ok(token)
}

/// Invalidate an access token
#[instrument(skip_all)]
pub async fn revoke_token<R: RestClient>(
    rest: &R,
    credentials: &dyn CredentialProvider,
    token: &AccessToken,
) -> Result<(), KiwoomError> {
    let body = to_body(&RevokeRequest {
        appkey: credentials.app_key(),
        secretkey: credentials.secret_key(),
        token: token.expose(),
    })?;
    let request = RestRequest::post(REVOKE_ENDPOINT, REVOKE_API_ID)
        .with_body(body)
        .public();

    rest.send(&request).await?;
    debug!("access token revoked");
    Ok(())
}
