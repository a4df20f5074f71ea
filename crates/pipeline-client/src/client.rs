//! Capability traits for talking to a media pipeline server

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{EndpointId, IceCandidate, PipelineEvent, PipelineId};

/// Operations a media pipeline server offers to a signaling client.
///
/// Every method is one request/response round trip. Server-initiated events
/// are delivered through [`RemotePipelineClient::events`]; candidate events
/// for an endpoint only start flowing after
/// [`RemotePipelineClient::subscribe_ice_candidates`] succeeded for it.
#[async_trait]
pub trait RemotePipelineClient: Send + Sync {
    /// Allocate a new media pipeline
    async fn create_pipeline(&self) -> Result<PipelineId>;

    /// Allocate a WebRTC endpoint inside `pipeline`
    async fn create_endpoint(&self, pipeline: &PipelineId) -> Result<EndpointId>;

    /// Hand the local SDP offer to `endpoint` and return its SDP answer
    async fn process_offer(&self, endpoint: &EndpointId, offer: &str) -> Result<String>;

    /// Give `endpoint` one of the local peer's candidates
    async fn add_ice_candidate(&self, endpoint: &EndpointId, candidate: &IceCandidate) -> Result<()>;

    /// Start receiving `OnIceCandidate` events for `endpoint`
    async fn subscribe_ice_candidates(&self, endpoint: &EndpointId) -> Result<()>;

    /// Ask `endpoint` to start gathering its own candidates
    async fn gather_candidates(&self, endpoint: &EndpointId) -> Result<()>;

    /// Connect the media output of `source` into `sink`
    async fn connect(&self, source: &EndpointId, sink: &EndpointId) -> Result<()>;

    /// Release `pipeline` and every endpoint inside it
    async fn release(&self, pipeline: &PipelineId) -> Result<()>;

    /// Subscribe to server-initiated events
    fn events(&self) -> broadcast::Receiver<PipelineEvent>;

    /// Close the connection; pending and later requests fail with `Closed`
    async fn close(&self);
}

/// Options applied when opening a connection to a pipeline server
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// How long a single request may wait for its response
    pub request_timeout: Duration,
    /// Interval of `ping` keepalive requests, `None` disables them
    pub keepalive_interval: Option<Duration>,
    /// Capacity of the server event broadcast channel
    pub event_buffer: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            keepalive_interval: None,
            event_buffer: 256,
        }
    }
}

impl ConnectOptions {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }
}

/// Opens connections to a pipeline server.
///
/// The session layer connects once per session, so it holds a connector
/// rather than a client.
#[async_trait]
pub trait PipelineConnector: Send + Sync {
    async fn connect(&self, uri: &str, options: &ConnectOptions) -> Result<Arc<dyn RemotePipelineClient>>;
}
