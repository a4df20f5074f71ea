//! ICE candidate relay between the local peer and the remote endpoint
//!
//! Local candidates go to the endpoint through `addIceCandidate`; the
//! endpoint's `OnIceCandidate` events are applied to the local peer. Every
//! candidate is exchanged by its own task, so a slow or failing one never
//! holds up the others. Failures are reported through the error sink and
//! the relay keeps running.

use dashmap::DashSet;
use loopback_pipeline_client::{EndpointId, IceCandidate, PipelineEvent, RemotePipelineClient};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::errors::{CandidateDirection, SessionError};
use crate::peer::PeerConnection;

/// Where non-fatal exchange failures are reported
pub type ErrorSink = Arc<dyn Fn(SessionError) + Send + Sync>;

struct RelayShared {
    endpoint: EndpointId,
    client: Arc<dyn RemotePipelineClient>,
    peer: Arc<dyn PeerConnection>,
    on_error: ErrorSink,
    submitted: DashSet<IceCandidate>,
    applied: DashSet<IceCandidate>,
    active: AtomicBool,
}

impl RelayShared {
    fn forward_local(self: &Arc<Self>, candidate: IceCandidate) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        if candidate.is_end_of_candidates() {
            trace!("Skipping end-of-candidates marker");
            return;
        }
        if !self.submitted.insert(candidate.clone()) {
            trace!("Local candidate already submitted: {}", candidate);
            return;
        }

        let shared = self.clone();
        tokio::spawn(async move {
            debug!("Local candidate -> {}: {}", shared.endpoint, candidate);
            if let Err(e) = shared.client.add_ice_candidate(&shared.endpoint, &candidate).await {
                shared.submitted.remove(&candidate);
                shared.report(SessionError::candidate(
                    CandidateDirection::LocalToRemote,
                    candidate.candidate.clone(),
                    e.to_string(),
                ));
            }
        });
    }

    fn apply_remote(self: &Arc<Self>, candidate: IceCandidate) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        if candidate.is_end_of_candidates() {
            return;
        }
        if !self.applied.insert(candidate.clone()) {
            trace!("Remote candidate already applied: {}", candidate);
            return;
        }

        let shared = self.clone();
        tokio::spawn(async move {
            debug!("Remote candidate from {}: {}", shared.endpoint, candidate);
            if let Err(e) = shared.peer.add_ice_candidate(&candidate).await {
                shared.applied.remove(&candidate);
                shared.report(SessionError::candidate(
                    CandidateDirection::RemoteToLocal,
                    candidate.candidate.clone(),
                    e.to_string(),
                ));
            }
        });
    }

    fn report(&self, error: SessionError) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        warn!("{}", error);
        (self.on_error)(error);
    }
}

/// Relays candidates for one (peer, endpoint) pair
pub struct IceCandidateRelay {
    shared: Arc<RelayShared>,
    listener: Option<JoinHandle<()>>,
}

impl IceCandidateRelay {
    /// Start listening for the endpoint's candidates and subscribe to them.
    ///
    /// The event stream is attached before the subscription request so no
    /// candidate the server sends right after subscribing is lost.
    pub async fn register(
        client: Arc<dyn RemotePipelineClient>,
        peer: Arc<dyn PeerConnection>,
        endpoint: EndpointId,
        on_error: ErrorSink,
    ) -> loopback_pipeline_client::Result<Self> {
        let mut events = client.events();
        let shared = Arc::new(RelayShared {
            endpoint,
            client,
            peer,
            on_error,
            submitted: DashSet::new(),
            applied: DashSet::new(),
            active: AtomicBool::new(true),
        });

        let listener_shared = shared.clone();
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PipelineEvent::IceCandidateFound { endpoint, candidate }) => {
                        if endpoint == listener_shared.endpoint {
                            listener_shared.apply_remote(candidate);
                        } else {
                            trace!("Ignoring candidate for foreign endpoint {}", endpoint);
                        }
                    }
                    Ok(PipelineEvent::ConnectionClosed) => {
                        debug!("Pipeline connection closed, candidate relay stops listening");
                        break;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Candidate relay lagged behind, {} server events lost", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let relay = Self {
            shared,
            listener: Some(listener),
        };

        if let Err(e) = relay.shared.client.subscribe_ice_candidates(&relay.shared.endpoint).await {
            relay.shutdown();
            return Err(e);
        }
        debug!("Candidate relay registered for {}", relay.shared.endpoint);
        Ok(relay)
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.shared.endpoint
    }

    /// Submit a local candidate to the remote endpoint
    pub fn forward_local(&self, candidate: IceCandidate) {
        self.shared.forward_local(candidate);
    }

    /// Apply a remote candidate to the local peer
    pub fn apply_remote(&self, candidate: IceCandidate) {
        self.shared.apply_remote(candidate);
    }

    /// Local candidates submitted so far, in a stable order
    pub fn submitted_candidates(&self) -> Vec<IceCandidate> {
        let mut all: Vec<_> = self.shared.submitted.iter().map(|c| c.key().clone()).collect();
        all.sort();
        all
    }

    /// Remote candidates applied so far, in a stable order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        let mut all: Vec<_> = self.shared.applied.iter().map(|c| c.key().clone()).collect();
        all.sort();
        all
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Stop relaying; exchanges already in flight finish silently
    pub fn shutdown(&self) {
        if !self.shared.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = &self.listener {
            listener.abort();
        }
        debug!("Candidate relay for {} shut down", self.shared.endpoint);
    }
}

impl Drop for IceCandidateRelay {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}
