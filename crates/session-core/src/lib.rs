//! Signaling and ICE candidate exchange coordinator for pipeline loopback sessions.
//!
//! A local WebRTC peer negotiates one bidirectional media session with a
//! remote media pipeline server. The server endpoint loops its media back
//! into itself, and a data channel carries messages alongside.
//!
//! The local peer is injected through [`PeerConnectionFactory`]; the remote
//! server is reached through a [`loopback_pipeline_client::PipelineConnector`],
//! by default the JSON-RPC WebSocket client.

// Error handling
pub mod errors;

// Configuration
pub mod config;

// Local peer seam
pub mod peer;

// Data channels
pub mod channel;

// Candidate relay
pub mod relay;

// Negotiation
pub mod negotiator;
pub mod session;

// Lifecycle
pub mod controller;
pub mod events;

// Public exports
pub use channel::{ChannelHandle, ChannelState, MessageHandler, Payload};
pub use config::{ConnectTarget, IceServer, IceServerPolicy, SessionConfig};
pub use controller::SessionController;
pub use errors::{CandidateDirection, NegotiationStep, Result, SessionError};
pub use events::SessionEvent;
pub use negotiator::NegotiationState;
pub use peer::{DataChannelTransport, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerResult};
pub use relay::{ErrorSink, IceCandidateRelay};
pub use session::{SessionId, SessionInfo};

pub use loopback_pipeline_client::{EndpointId, IceCandidate, PipelineId};

/// Re-export of common types and functions
pub mod prelude {
    pub use super::{
        ChannelHandle, ChannelState, ConnectTarget, DataChannelTransport, IceCandidate, IceServer,
        IceServerPolicy, NegotiationState, NegotiationStep, Payload, PeerConnection, PeerConnectionFactory,
        PeerError, PeerEvent, Result, SessionConfig, SessionController, SessionError, SessionEvent,
        SessionId, SessionInfo,
    };
}
