//! Events published by the session controller

use crate::channel::{ChannelState, Payload};
use crate::errors::{NegotiationStep, SessionError};
use crate::negotiator::NegotiationState;
use crate::session::SessionId;

/// Session lifecycle and data events, delivered over a broadcast channel
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        session_id: SessionId,
        state: NegotiationState,
    },
    StepCompleted {
        session_id: SessionId,
        step: NegotiationStep,
    },
    /// All steps succeeded
    Connected { session_id: SessionId },
    /// A fatal error; teardown follows
    Failed {
        session_id: SessionId,
        error: SessionError,
    },
    /// One candidate could not be exchanged; the session carries on
    CandidateError {
        session_id: SessionId,
        error: SessionError,
    },
    ChannelStateChanged {
        session_id: SessionId,
        channel: u16,
        label: String,
        state: ChannelState,
    },
    MessageReceived {
        session_id: SessionId,
        label: String,
        payload: Payload,
    },
    /// Teardown finished; published once per session
    Stopped { session_id: SessionId },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::StateChanged { session_id, .. }
            | Self::StepCompleted { session_id, .. }
            | Self::Connected { session_id }
            | Self::Failed { session_id, .. }
            | Self::CandidateError { session_id, .. }
            | Self::ChannelStateChanged { session_id, .. }
            | Self::MessageReceived { session_id, .. }
            | Self::Stopped { session_id } => session_id,
        }
    }
}
