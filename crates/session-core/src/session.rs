//! The single negotiation session and its read-only snapshot

use loopback_pipeline_client::{EndpointId, IceCandidate, PipelineId, RemotePipelineClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::channel::{ChannelState, Channels, StateObserver};
use crate::config::SessionConfig;
use crate::errors::NegotiationStep;
use crate::negotiator::NegotiationState;
use crate::peer::{PeerConnection, PeerEvent};
use crate::relay::{ErrorSink, IceCandidateRelay};

/// Session ID type
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("session-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything one negotiation owns.
///
/// Only the controller actor touches a `Session`. Each start builds a new
/// one with a fresh epoch; completions tagged with another epoch are stale.
pub(crate) struct Session {
    pub id: SessionId,
    pub epoch: u64,
    pub config: SessionConfig,
    pub state: NegotiationState,
    pub local_offer: Option<String>,
    pub remote_answer: Option<String>,
    pub pipeline: Option<PipelineId>,
    pub endpoint: Option<EndpointId>,
    pub peer: Option<Arc<dyn PeerConnection>>,
    pub client: Option<Arc<dyn RemotePipelineClient>>,
    pub relay: Option<IceCandidateRelay>,
    pub channels: Channels,
    /// Local candidates found before the relay existed
    pub pending_local: Vec<IceCandidate>,
    /// Peer events not yet picked up by a forwarder task
    pub peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    pub forwarder: Option<JoinHandle<()>>,
    pub error_sink: ErrorSink,
    pub channel_observer: Option<StateObserver>,
    /// The step whose future is running
    pub in_flight: Option<NegotiationStep>,
    pub created_at: Instant,
}

impl Session {
    pub fn new(epoch: u64, config: SessionConfig, error_sink: ErrorSink, channel_observer: Option<StateObserver>) -> Self {
        Self {
            id: SessionId::new(),
            epoch,
            config,
            state: NegotiationState::Idle,
            local_offer: None,
            remote_answer: None,
            pipeline: None,
            endpoint: None,
            peer: None,
            client: None,
            relay: None,
            channels: Channels::default(),
            pending_local: Vec::new(),
            peer_events: None,
            forwarder: None,
            error_sink,
            channel_observer,
            in_flight: None,
            created_at: Instant::now(),
        }
    }

    /// Move to `next` unless that would go backwards
    pub fn advance_state(&mut self, next: NegotiationState) -> bool {
        if next.rank() <= self.state.rank() {
            return false;
        }
        debug!("Session {} state {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        true
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            state: self.state,
            pipeline: self.pipeline.clone(),
            endpoint: self.endpoint.clone(),
            local_offer: self.local_offer.clone(),
            remote_answer: self.remote_answer.clone(),
            submitted_candidates: self
                .relay
                .as_ref()
                .map(|r| r.submitted_candidates())
                .unwrap_or_default(),
            applied_candidates: self
                .relay
                .as_ref()
                .map(|r| r.applied_candidates())
                .unwrap_or_default(),
            buffered_candidates: self.pending_local.len(),
            channels: self.channels.summary(),
            age: self.age(),
        }
    }
}

/// Snapshot of the active session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: NegotiationState,
    pub pipeline: Option<PipelineId>,
    pub endpoint: Option<EndpointId>,
    pub local_offer: Option<String>,
    pub remote_answer: Option<String>,
    /// Local candidates handed to the remote endpoint
    pub submitted_candidates: Vec<IceCandidate>,
    /// Remote candidates applied to the local peer
    pub applied_candidates: Vec<IceCandidate>,
    /// Local candidates still waiting for the relay
    pub buffered_candidates: usize,
    /// `(label, state)` of every channel
    pub channels: Vec<(String, ChannelState)>,
    pub age: Duration,
}
