//! Session configuration
//!
//! A [`SessionConfig`] names the signaling endpoint, the optional ICE
//! server list handed to the local peer, and the timeouts that bound each
//! negotiation step.
//!
//! ```rust
//! use loopback_session_core::config::{IceServerPolicy, SessionConfig};
//! use std::time::Duration;
//!
//! let config = SessionConfig::new()
//!     .with_ws_uri("ws://media.example.org:8888/kurento")
//!     .with_step_timeout(Duration::from_secs(5));
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.ice_policy(), IceServerPolicy::Automatic);
//! ```
//!
//! The browser demo this coordinator drives read its options from the page
//! query string; [`SessionConfig::from_query`] accepts the same format:
//!
//! ```rust
//! use loopback_session_core::config::SessionConfig;
//!
//! let config = SessionConfig::from_query(
//!     "?ws_uri=wss://kms.local:8433/kurento&ice_servers=[{\"urls\":\"stun:stun.l.google.com:19302\"}]",
//!     "localhost",
//! ).unwrap();
//! assert_eq!(config.ws_uri, "wss://kms.local:8433/kurento");
//! assert_eq!(config.ice_servers.unwrap()[0].urls, vec!["stun:stun.l.google.com:19302"]);
//! ```

use loopback_pipeline_client::{ConnectOptions, EndpointId};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::errors::{Result, SessionError};

/// Port the media server listens on for signaling by default
pub const DEFAULT_SIGNALING_PORT: u16 = 8888;

/// Path of the signaling endpoint on the media server
pub const DEFAULT_SIGNALING_PATH: &str = "/kurento";

/// Label of the data channel opened by the initiating side
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "sendDataChannel";

pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Signaling URI for a media server on `host` with the default port and path
pub fn default_ws_uri(host: &str) -> String {
    format!("ws://{}:{}{}", host, DEFAULT_SIGNALING_PORT, DEFAULT_SIGNALING_PATH)
}

/// One STUN/TURN server, in the browser's `RTCIceServer` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(alias = "url", deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, credential: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// How the local peer finds its traversal servers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceServerPolicy {
    /// Use exactly these servers
    Explicit(Vec<IceServer>),
    /// No list supplied; the peer discovers servers on its own
    Automatic,
}

/// Where the remote endpoint's media output is connected once negotiated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectTarget {
    /// Back into the same endpoint
    #[default]
    SelfLoop,
    /// Into another endpoint of the same pipeline
    Endpoint(EndpointId),
}

/// Configuration of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signaling endpoint, `ws://` or `wss://`
    pub ws_uri: String,
    /// Explicit ICE servers; `None` selects automatic discovery
    pub ice_servers: Option<Vec<IceServer>>,
    pub data_channel_label: String,
    pub connect_target: ConnectTarget,
    /// Upper bound on each negotiation step, including teardown's release
    pub step_timeout_ms: u64,
    /// Upper bound on one request to the pipeline server
    pub request_timeout_ms: u64,
    /// Interval of keepalive pings to the pipeline server
    pub keepalive_interval_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ws_uri: default_ws_uri("localhost"),
            ice_servers: None,
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            connect_target: ConnectTarget::SelfLoop,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            keepalive_interval_ms: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with the signaling URI derived from `host`
    pub fn for_host(host: &str) -> Self {
        Self {
            ws_uri: default_ws_uri(host),
            ..Self::default()
        }
    }

    pub fn with_ws_uri(mut self, uri: impl Into<String>) -> Self {
        self.ws_uri = uri.into();
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = Some(servers);
        self
    }

    pub fn with_data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.data_channel_label = label.into();
        self
    }

    pub fn with_connect_target(mut self, target: ConnectTarget) -> Self {
        self.connect_target = target;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ice_policy(&self) -> IceServerPolicy {
        match &self.ice_servers {
            Some(servers) => IceServerPolicy::Explicit(servers.clone()),
            None => IceServerPolicy::Automatic,
        }
    }

    /// Options for the pipeline client connection
    pub fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::default().with_request_timeout(self.request_timeout());
        if let Some(ms) = self.keepalive_interval_ms.filter(|ms| *ms > 0) {
            options = options.with_keepalive(Duration::from_millis(ms));
        }
        options
    }

    pub fn validate(&self) -> Result<()> {
        let uri = url::Url::parse(&self.ws_uri)
            .map_err(|e| SessionError::Config(format!("invalid ws_uri '{}': {}", self.ws_uri, e)))?;
        if !matches!(uri.scheme(), "ws" | "wss") {
            return Err(SessionError::Config(format!(
                "ws_uri must use ws:// or wss://, got '{}'",
                self.ws_uri
            )));
        }
        if self.data_channel_label.is_empty() {
            return Err(SessionError::Config("data channel label must not be empty".into()));
        }
        if self.step_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(SessionError::Config("timeouts must be greater than zero".into()));
        }
        if let Some(servers) = &self.ice_servers {
            if servers.iter().any(|s| s.urls.is_empty()) {
                return Err(SessionError::Config("every ICE server needs at least one url".into()));
            }
        }
        Ok(())
    }

    /// Read options from a browser-style query string.
    ///
    /// Recognised keys are `ws_uri` and `ice_servers` (a JSON list of
    /// ICE servers). Unknown keys are ignored. `host` is used for the
    /// default signaling URI when `ws_uri` is absent.
    pub fn from_query(query: &str, host: &str) -> Result<Self> {
        let mut config = Self::for_host(host);
        let query = query.strip_prefix('?').unwrap_or(query);

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "ws_uri" if !value.is_empty() => config.ws_uri = value.into_owned(),
                "ice_servers" if !value.is_empty() => {
                    let servers: Vec<IceServer> = serde_json::from_str(&value)
                        .map_err(|e| SessionError::Config(format!("invalid ice_servers: {}", e)))?;
                    config.ice_servers = Some(servers);
                }
                _ => {}
            }
        }

        Ok(config)
    }
}
