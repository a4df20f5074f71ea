//! Error types for session negotiation and lifecycle

use std::fmt;
use thiserror::Error;

use crate::channel::ChannelState;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// The negotiation steps, in the order they run.
///
/// Connecting to the signaling endpoint and creating the pipeline are two
/// round trips but one logical step, so both report number 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationStep {
    CreateOffer,
    ConnectSignaling,
    CreatePipeline,
    CreateEndpoint,
    RegisterRelay,
    ProcessOffer,
    GatherCandidates,
    ApplyAnswer,
    ConnectLoopback,
}

impl NegotiationStep {
    pub fn number(self) -> u8 {
        match self {
            Self::CreateOffer => 1,
            Self::ConnectSignaling | Self::CreatePipeline => 2,
            Self::CreateEndpoint => 3,
            Self::RegisterRelay => 4,
            Self::ProcessOffer => 5,
            Self::GatherCandidates => 6,
            Self::ApplyAnswer => 7,
            Self::ConnectLoopback => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CreateOffer => "create offer",
            Self::ConnectSignaling => "connect signaling",
            Self::CreatePipeline => "create pipeline",
            Self::CreateEndpoint => "create endpoint",
            Self::RegisterRelay => "register candidate relay",
            Self::ProcessOffer => "process offer",
            Self::GatherCandidates => "gather candidates",
            Self::ApplyAnswer => "apply answer",
            Self::ConnectLoopback => "connect loopback",
        }
    }
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({})", self.number(), self.name())
    }
}

/// Which way a candidate was travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateDirection {
    /// Local peer candidate sent to the remote endpoint
    LocalToRemote,
    /// Remote endpoint candidate applied to the local peer
    RemoteToLocal,
}

impl fmt::Display for CandidateDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalToRemote => write!(f, "local->remote"),
            Self::RemoteToLocal => write!(f, "remote->local"),
        }
    }
}

/// Errors raised by the session coordinator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("{step}: cannot reach signaling endpoint: {reason}")]
    SignalingConnect { step: NegotiationStep, reason: String },

    #[error("{step}: remote provisioning failed: {reason}")]
    RemoteProvisioning { step: NegotiationStep, reason: String },

    #[error("{step}: negotiation failed: {reason}")]
    Negotiation { step: NegotiationStep, reason: String },

    /// One candidate could not be exchanged; the session carries on
    #[error("candidate exchange {direction} failed for '{candidate}': {reason}")]
    CandidateExchange {
        direction: CandidateDirection,
        candidate: String,
        reason: String,
    },

    #[error("channel '{label}' is {state}, not open")]
    ChannelState { label: String, state: ChannelState },

    /// Cleanup of one resource failed; the remaining cleanup still runs
    #[error("teardown of {resource} failed: {reason}")]
    Teardown { resource: String, reason: String },

    #[error("a session is already active")]
    AlreadyStarted,

    #[error("session stopped before negotiation completed")]
    Stopped,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Build the error kind that matches a failure at `step`
    pub fn for_step(step: NegotiationStep, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match step {
            NegotiationStep::ConnectSignaling => Self::SignalingConnect { step, reason },
            NegotiationStep::CreatePipeline | NegotiationStep::CreateEndpoint => {
                Self::RemoteProvisioning { step, reason }
            }
            _ => Self::Negotiation { step, reason },
        }
    }

    pub fn candidate(direction: CandidateDirection, candidate: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CandidateExchange {
            direction,
            candidate: candidate.into(),
            reason: reason.into(),
        }
    }

    pub fn teardown(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Teardown {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: &str) -> Self {
        Self::Internal(message.to_string())
    }

    /// The negotiation step this error originated from, if any
    pub fn step(&self) -> Option<NegotiationStep> {
        match self {
            Self::SignalingConnect { step, .. }
            | Self::RemoteProvisioning { step, .. }
            | Self::Negotiation { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Fatal errors stop the session; the others are handled where they occur
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SignalingConnect { .. } | Self::RemoteProvisioning { .. } | Self::Negotiation { .. } | Self::Internal(_)
        )
    }
}
