use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;

/// Production REST host
pub const REAL_REST_URL: &str = "https://api.kiwoom.com";
/// Simulated-trading REST host
pub const MOCK_REST_URL: &str = "https://mockapi.kiwoom.com";
/// Production realtime endpoint
pub const REAL_WS_URL: &str = "wss://api.kiwoom.com:10000/api/dostk/websocket";
/// Simulated-trading realtime endpoint
pub const MOCK_WS_URL: &str = "wss://mockapi.kiwoom.com:10000/api/dostk/websocket";

/// Venue environment selected at session construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Host {
    Real,
    Mock,
}

impl Host {
    pub fn rest_url(self) -> &'static str {
        match self {
            Self::Real => REAL_REST_URL,
            Self::Mock => MOCK_REST_URL,
        }
    }

    pub fn ws_url(self) -> &'static str {
        match self {
            Self::Real => REAL_WS_URL,
            Self::Mock => MOCK_WS_URL,
        }
    }
}

/// Source of the credentials used for the token exchange.
///
/// Loading keys from files or vaults is left to the implementor.
pub trait CredentialProvider: Send + Sync {
    fn app_key(&self) -> &str;
    fn secret_key(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct KiwoomConfig {
    pub appkey: Secret<String>,
    pub secretkey: Secret<String>,
    pub host: Host,
    pub base_url: Option<String>,
    pub ws_url: Option<String>,
}

// Custom Serialize implementation - never expose secrets in serialization
impl Serialize for KiwoomConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("KiwoomConfig", 5)?;
        state.serialize_field("appkey", "[REDACTED]")?;
        state.serialize_field("secretkey", "[REDACTED]")?;
        state.serialize_field("host", &self.host)?;
        state.serialize_field("base_url", &self.base_url)?;
        state.serialize_field("ws_url", &self.ws_url)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for KiwoomConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct KiwoomConfigHelper {
            appkey: String,
            secretkey: String,
            host: Host,
            #[serde(default)]
            base_url: Option<String>,
            #[serde(default)]
            ws_url: Option<String>,
        }

        let helper = KiwoomConfigHelper::deserialize(deserializer)?;
        Ok(Self {
            appkey: Secret::new(helper.appkey),
            secretkey: Secret::new(helper.secretkey),
            host: helper.host,
            base_url: helper.base_url,
            ws_url: helper.ws_url,
        })
    }
}

impl KiwoomConfig {
    /// Create a production configuration with API credentials
    #[must_use]
    pub fn new(appkey: String, secretkey: String) -> Self {
        Self {
            appkey: Secret::new(appkey),
            secretkey: Secret::new(secretkey),
            host: Host::Real,
            base_url: None,
            ws_url: None,
        }
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `{PREFIX}_APPKEY` (e.g., `KIWOOM_APPKEY`)
    /// - `{PREFIX}_SECRETKEY`
    /// - `{PREFIX}_MOCK` (optional, defaults to false)
    /// - `{PREFIX}_BASE_URL` (optional)
    /// - `{PREFIX}_WS_URL` (optional)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let appkey_var = format!("{}_APPKEY", prefix);
        let secretkey_var = format!("{}_SECRETKEY", prefix);
        let mock_var = format!("{}_MOCK", prefix);

        let appkey =
            env::var(&appkey_var).map_err(|_| ConfigError::MissingEnvironmentVariable(appkey_var))?;
        let secretkey = env::var(&secretkey_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(secretkey_var))?;

        let mock = match env::var(&mock_var) {
            Ok(value) => value.parse::<bool>().map_err(|_| {
                ConfigError::InvalidConfiguration(format!(
                    "{} must be 'true' or 'false', got '{}'",
                    mock_var, value
                ))
            })?,
            Err(_) => false,
        };

        Ok(Self {
            appkey: Secret::new(appkey),
            secretkey: Secret::new(secretkey),
            host: if mock { Host::Mock } else { Host::Real },
            base_url: env::var(format!("{}_BASE_URL", prefix)).ok(),
            ws_url: env::var(format!("{}_WS_URL", prefix)).ok(),
        })
    }

    /// Create configuration from a .env file and environment variables
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(prefix, ".env")
    }

    /// Create configuration from a specific .env file path
    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(_) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // .env file doesn't exist, continue with system env vars
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    /// Select the production or simulated environment
    #[must_use]
    pub const fn host(mut self, host: Host) -> Self {
        self.host = host;
        self
    }

    /// Set custom REST base URL
    #[must_use]
    pub fn base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }

    /// Set custom realtime endpoint URL
    #[must_use]
    pub fn ws_url(mut self, ws_url: String) -> Self {
        self.ws_url = Some(ws_url);
        self
    }

    pub fn rest_endpoint(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.host.rest_url().to_string())
    }

    pub fn ws_endpoint(&self) -> String {
        self.ws_url
            .clone()
            .unwrap_or_else(|| self.host.ws_url().to_string())
    }

    /// Check if this configuration carries both keys
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.appkey.expose_secret().is_empty() && !self.secretkey.expose_secret().is_empty()
    }
}

impl CredentialProvider for KiwoomConfig {
    fn app_key(&self) -> &str {
        self.appkey.expose_secret()
    }

    fn secret_key(&self) -> &str {
        self.secretkey.expose_secret()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
