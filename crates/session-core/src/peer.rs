//! The local peer connection seam
//!
//! The coordinator does not implement WebRTC itself. It drives a
//! [`PeerConnection`] created by an injected [`PeerConnectionFactory`] and
//! listens to the [`PeerEvent`]s the peer reports.

use async_trait::async_trait;
use loopback_pipeline_client::IceCandidate;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::channel::Payload;
use crate::config::IceServerPolicy;

/// Errors reported by the local peer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer operation failed: {0}")]
    Operation(String),

    #[error("peer connection is closed")]
    Closed,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

/// Things the local peer reports while it runs
pub enum PeerEvent {
    /// A local candidate was discovered
    LocalCandidate(IceCandidate),
    /// Local candidate gathering finished
    GatheringComplete,
    /// The remote side opened a channel towards us
    IncomingChannel(Arc<dyn DataChannelTransport>),
    ChannelOpened { channel: u16 },
    ChannelClosed { channel: u16 },
    /// A message arrived on a channel
    Message { channel: u16, payload: Payload },
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::GatheringComplete => write!(f, "GatheringComplete"),
            Self::IncomingChannel(t) => f
                .debug_struct("IncomingChannel")
                .field("id", &t.id())
                .field("label", &t.label())
                .finish(),
            Self::ChannelOpened { channel } => f.debug_struct("ChannelOpened").field("channel", channel).finish(),
            Self::ChannelClosed { channel } => f.debug_struct("ChannelClosed").field("channel", channel).finish(),
            Self::Message { channel, payload } => f
                .debug_struct("Message")
                .field("channel", channel)
                .field("len", &payload.len())
                .finish(),
        }
    }
}

/// The raw duplex channel underneath a [`crate::channel::ChannelHandle`]
#[async_trait]
pub trait DataChannelTransport: Send + Sync {
    fn id(&self) -> u16;

    fn label(&self) -> &str;

    async fn send(&self, payload: &Payload) -> PeerResult<()>;

    async fn close(&self) -> PeerResult<()>;
}

/// A local WebRTC peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open an ordered data channel; it reports `ChannelOpened` once usable
    async fn create_data_channel(&self, label: &str) -> PeerResult<Arc<dyn DataChannelTransport>>;

    /// Create a send/receive offer and install it as the local description
    async fn create_offer(&self) -> PeerResult<String>;

    /// Install the remote SDP answer
    async fn process_answer(&self, sdp: &str) -> PeerResult<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> PeerResult<()>;

    /// Stop all transports; no events are reported afterwards
    async fn dispose(&self) -> PeerResult<()>;
}

/// Creates local peers
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice: &IceServerPolicy,
    ) -> PeerResult<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>)>;
}
