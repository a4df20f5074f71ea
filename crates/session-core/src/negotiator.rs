//! Offer/answer negotiation with the remote pipeline
//!
//! Negotiation is a fixed sequence of [`NegotiationStep`]s. Each step is a
//! future that only reads what earlier steps stored on the [`Session`];
//! the controller awaits it off the actor and hands its [`StepOutput`] back
//! through [`SessionNegotiator::advance`], which records the result and
//! builds the next step.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use loopback_pipeline_client::{
    EndpointId, PipelineConnector, PipelineId, RemotePipelineClient,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::ChannelHandle;
use crate::config::ConnectTarget;
use crate::errors::{NegotiationStep, Result, SessionError};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent};
use crate::relay::IceCandidateRelay;
use crate::session::Session;

/// Where a session stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiationState {
    /// No session
    Idle,
    /// Creating the local peer and its offer
    Offering,
    /// Connecting signaling and allocating the pipeline and endpoint
    Provisioning,
    /// Exchanging the offer, answer and candidates
    Negotiating,
    /// Media loops back through the remote endpoint
    Connected,
    /// Tearing down
    Stopping,
}

impl NegotiationState {
    pub(crate) fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Offering => 1,
            Self::Provisioning => 2,
            Self::Negotiating => 3,
            Self::Connected => 4,
            Self::Stopping => 5,
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Stopping)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Offering => "offering",
            Self::Provisioning => "provisioning",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

impl NegotiationStep {
    /// The session state while this step runs
    pub fn state(self) -> NegotiationState {
        match self {
            Self::CreateOffer => NegotiationState::Offering,
            Self::ConnectSignaling | Self::CreatePipeline | Self::CreateEndpoint => NegotiationState::Provisioning,
            _ => NegotiationState::Negotiating,
        }
    }

    /// The step after this one, `None` after the last
    pub fn next(self) -> Option<Self> {
        match self {
            Self::CreateOffer => Some(Self::ConnectSignaling),
            Self::ConnectSignaling => Some(Self::CreatePipeline),
            Self::CreatePipeline => Some(Self::CreateEndpoint),
            Self::CreateEndpoint => Some(Self::RegisterRelay),
            Self::RegisterRelay => Some(Self::ProcessOffer),
            Self::ProcessOffer => Some(Self::GatherCandidates),
            Self::GatherCandidates => Some(Self::ApplyAnswer),
            Self::ApplyAnswer => Some(Self::ConnectLoopback),
            Self::ConnectLoopback => None,
        }
    }
}

/// What a finished step produced
pub(crate) enum StepOutput {
    Offer {
        peer: Arc<dyn PeerConnection>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        channel: ChannelHandle,
        sdp: String,
    },
    SignalingConnected(Arc<dyn RemotePipelineClient>),
    PipelineCreated {
        pipeline: PipelineId,
        client: Arc<dyn RemotePipelineClient>,
    },
    EndpointCreated(EndpointId),
    RelayRegistered(IceCandidateRelay),
    Answer(String),
    GatheringStarted,
    AnswerApplied,
    LoopbackConnected,
}

impl StepOutput {
    /// Release what a stale step produced
    pub async fn discard(self) {
        match self {
            Self::Offer { peer, channel, .. } => {
                debug!("Disposing peer from a stale offer");
                channel.close().await;
                if let Err(e) = peer.dispose().await {
                    warn!("Disposing stale peer failed: {}", e);
                }
            }
            Self::SignalingConnected(client) => {
                debug!("Closing stale signaling connection");
                client.close().await;
            }
            Self::PipelineCreated { pipeline, client } => {
                debug!("Releasing stale pipeline {}", pipeline);
                if let Err(e) = client.release(&pipeline).await {
                    debug!("Stale pipeline {} not released: {}", pipeline, e);
                }
            }
            Self::RelayRegistered(relay) => relay.shutdown(),
            _ => {}
        }
    }
}

pub(crate) type StepFuture = BoxFuture<'static, Result<StepOutput>>;

/// What comes after a completed step
pub(crate) enum Progress {
    Next(NegotiationStep, StepFuture),
    Complete,
}

/// Runs the negotiation steps against injected collaborators
pub(crate) struct SessionNegotiator {
    peers: Arc<dyn PeerConnectionFactory>,
    connector: Arc<dyn PipelineConnector>,
}

impl SessionNegotiator {
    pub fn new(peers: Arc<dyn PeerConnectionFactory>, connector: Arc<dyn PipelineConnector>) -> Self {
        Self { peers, connector }
    }

    /// Record `output` of `step` on the session and prepare the next step
    pub fn advance(&self, session: &mut Session, step: NegotiationStep, output: StepOutput) -> Result<Progress> {
        match (step, output) {
            (NegotiationStep::CreateOffer, StepOutput::Offer { peer, events, channel, sdp }) => {
                session.channels.set_initiator(channel);
                session.peer = Some(peer);
                session.peer_events = Some(events);
                session.local_offer = Some(sdp);
            }
            (NegotiationStep::ConnectSignaling, StepOutput::SignalingConnected(client)) => {
                session.client = Some(client);
            }
            (NegotiationStep::CreatePipeline, StepOutput::PipelineCreated { pipeline, .. }) => {
                info!("Session {} uses pipeline {}", session.id, pipeline);
                session.pipeline = Some(pipeline);
            }
            (NegotiationStep::CreateEndpoint, StepOutput::EndpointCreated(endpoint)) => {
                info!("Session {} uses endpoint {}", session.id, endpoint);
                session.endpoint = Some(endpoint);
            }
            (NegotiationStep::RegisterRelay, StepOutput::RelayRegistered(relay)) => {
                let buffered = std::mem::take(&mut session.pending_local);
                if !buffered.is_empty() {
                    debug!("Flushing {} buffered local candidates", buffered.len());
                }
                for candidate in buffered {
                    relay.forward_local(candidate);
                }
                session.relay = Some(relay);
            }
            (NegotiationStep::ProcessOffer, StepOutput::Answer(sdp)) => {
                session.remote_answer = Some(sdp);
            }
            (NegotiationStep::GatherCandidates, StepOutput::GatheringStarted)
            | (NegotiationStep::ApplyAnswer, StepOutput::AnswerApplied)
            | (NegotiationStep::ConnectLoopback, StepOutput::LoopbackConnected) => {}
            (step, _) => {
                return Err(SessionError::Internal(format!("unexpected output for {}", step)));
            }
        }

        match step.next() {
            Some(next) => Ok(Progress::Next(next, self.step(next, session)?)),
            None => Ok(Progress::Complete),
        }
    }

    /// Build the future for `step` from what the session holds
    pub fn step(&self, step: NegotiationStep, session: &Session) -> Result<StepFuture> {
        let timeout = session.config.step_timeout();

        let fut: StepFuture = match step {
            NegotiationStep::CreateOffer => {
                let peers = self.peers.clone();
                let ice = session.config.ice_policy();
                let label = session.config.data_channel_label.clone();
                let observer = session.channel_observer.clone();
                async move {
                    let (peer, events) = peers.create(&ice).await.map_err(|e| SessionError::for_step(step, e.to_string()))?;
                    let offered = match ChannelHandle::open(peer.as_ref(), &label, observer).await {
                        Ok(channel) => peer
                            .create_offer()
                            .await
                            .map(|sdp| (channel, sdp))
                            .map_err(|e| e.to_string()),
                        Err(e) => Err(e.to_string()),
                    };
                    match offered {
                        Ok((channel, sdp)) => Ok(StepOutput::Offer { peer, events, channel, sdp }),
                        Err(reason) => {
                            let _ = peer.dispose().await;
                            Err(SessionError::for_step(step, reason))
                        }
                    }
                }
                .boxed()
            }
            NegotiationStep::ConnectSignaling => {
                let connector = self.connector.clone();
                let uri = session.config.ws_uri.clone();
                let options = session.config.connect_options();
                async move {
                    let client = connector
                        .connect(&uri, &options)
                        .await
                        .map_err(|e| SessionError::for_step(step, e.to_string()))?;
                    Ok(StepOutput::SignalingConnected(client))
                }
                .boxed()
            }
            NegotiationStep::CreatePipeline => {
                let client = require(session.client.clone(), step, "signaling connection")?;
                async move {
                    let pipeline = client
                        .create_pipeline()
                        .await
                        .map_err(|e| SessionError::for_step(step, e.to_string()))?;
                    Ok(StepOutput::PipelineCreated { pipeline, client })
                }
                .boxed()
            }
            NegotiationStep::CreateEndpoint => {
                let client = require(session.client.clone(), step, "signaling connection")?;
                let pipeline = require(session.pipeline.clone(), step, "pipeline")?;
                async move {
                    let endpoint = client
                        .create_endpoint(&pipeline)
                        .await
                        .map_err(|e| SessionError::for_step(step, e.to_string()))?;
                    Ok(StepOutput::EndpointCreated(endpoint))
                }
                .boxed()
            }
            NegotiationStep::RegisterRelay => {
                let client = require(session.client.clone(), step, "signaling connection")?;
                let peer = require(session.peer.clone(), step, "local peer")?;
                let endpoint = require(session.endpoint.clone(), step, "endpoint")?;
                let on_error = session.error_sink.clone();
                async move {
                    let relay = IceCandidateRelay::register(client, peer, endpoint, on_error)
                        .await
                        .map_err(|e| SessionError::for_step(step, e.to_string()))?;
                    Ok(StepOutput::RelayRegistered(relay))
                }
                .boxed()
            }
            NegotiationStep::ProcessOffer => {
                let client = require(session.client.clone(), step, "signaling connection")?;
                let endpoint = require(session.endpoint.clone(), step, "endpoint")?;
                let offer = require(session.local_offer.clone(), step, "local offer")?;
                async move {
                    let answer = client
                        .process_offer(&endpoint, &offer)
                        .await
                        .map_err(|e| SessionError::for_step(step, e.to_string()))?;
                    if !answer.trim_start().starts_with("v=") {
                        return Err(SessionError::for_step(step, "remote answer is not an SDP description"));
                    }
                    Ok(StepOutput::Answer(answer))
                }
                .boxed()
            }
            NegotiationStep::GatherCandidates => {
                let client = require(session.client.clone(), step, "signaling connection")?;
                let endpoint = require(session.endpoint.clone(), step, "endpoint")?;
                async move {
                    client
                        .gather_candidates(&endpoint)
                        .await
                        .map_err(|e| SessionError::for_step(step, e.to_string()))?;
                    Ok(StepOutput::GatheringStarted)
                }
                .boxed()
            }
            NegotiationStep::ApplyAnswer => {
                let peer = require(session.peer.clone(), step, "local peer")?;
                let answer = require(session.remote_answer.clone(), step, "remote answer")?;
                async move {
                    peer.process_answer(&answer)
                        .await
                        .map_err(|e| SessionError::for_step(step, e.to_string()))?;
                    Ok(StepOutput::AnswerApplied)
                }
                .boxed()
            }
            NegotiationStep::ConnectLoopback => {
                let client = require(session.client.clone(), step, "signaling connection")?;
                let endpoint = require(session.endpoint.clone(), step, "endpoint")?;
                let sink = match &session.config.connect_target {
                    ConnectTarget::SelfLoop => endpoint.clone(),
                    ConnectTarget::Endpoint(other) => other.clone(),
                };
                async move {
                    client
                        .connect(&endpoint, &sink)
                        .await
                        .map_err(|e| SessionError::for_step(step, e.to_string()))?;
                    Ok(StepOutput::LoopbackConnected)
                }
                .boxed()
            }
        };

        Ok(with_timeout(step, timeout, fut))
    }
}

fn require<T>(value: Option<T>, step: NegotiationStep, what: &str) -> Result<T> {
    value.ok_or_else(|| SessionError::Internal(format!("{} has no {}", step, what)))
}

fn with_timeout(
    step: NegotiationStep,
    timeout: Duration,
    fut: impl Future<Output = Result<StepOutput>> + Send + 'static,
) -> StepFuture {
    async move {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::for_step(step, format!("timed out after {:?}", timeout))),
        }
    }
    .boxed()
}
