//! A local peer backed by a pre-generated SDP offer
//!
//! The CLI does not run a media stack. It hands an offer produced elsewhere
//! (a browser, `gst-launch`, a test fixture) to the coordinator, reports the
//! offer's `a=candidate` lines as local candidates and records whatever the
//! remote pipeline sends back.

use async_trait::async_trait;
use loopback_pipeline_client::IceCandidate;
use loopback_session_core::{
    DataChannelTransport, IceServerPolicy, Payload, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent,
    PeerResult,
};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Creates [`SdpFilePeer`]s that all offer the same SDP
pub struct SdpFilePeerFactory {
    offer: String,
}

impl SdpFilePeerFactory {
    pub fn new(offer: impl Into<String>) -> Self {
        Self { offer: offer.into() }
    }
}

#[async_trait]
impl PeerConnectionFactory for SdpFilePeerFactory {
    async fn create(
        &self,
        ice: &IceServerPolicy,
    ) -> PeerResult<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>)> {
        debug!("Creating file peer with {:?}", ice);
        let (peer, events) = SdpFilePeer::new(self.offer.clone());
        let peer: Arc<dyn PeerConnection> = Arc::new(peer);
        Ok((peer, events))
    }
}

/// Split the candidate attributes out of an SDP body
///
/// Each candidate carries the `a=mid` of its media section when one is
/// present, and the zero-based index of that section.
pub fn extract_candidates(sdp: &str) -> Vec<IceCandidate> {
    let mut candidates = Vec::new();
    let mut m_line: Option<u16> = None;
    let mut mid: Option<String> = None;

    for line in sdp.lines().map(str::trim) {
        if line.starts_with("m=") {
            m_line = Some(m_line.map_or(0, |i| i + 1));
            mid = None;
        } else if let Some(value) = line.strip_prefix("a=mid:") {
            mid = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("a=") {
            if value.starts_with("candidate:") {
                candidates.push(IceCandidate::new(value, mid.clone(), m_line));
            }
        }
    }
    candidates
}

pub struct SdpFilePeer {
    offer: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    answer: Mutex<Option<String>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    next_channel: AtomicU16,
    disposed: AtomicBool,
}

impl SdpFilePeer {
    pub fn new(offer: String) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let peer = Self {
            offer,
            events,
            answer: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            next_channel: AtomicU16::new(0),
            disposed: AtomicBool::new(false),
        };
        (peer, rx)
    }

    #[cfg(test)]
    fn answer(&self) -> Option<String> {
        self.answer.lock().ok().and_then(|a| a.clone())
    }

    #[cfg(test)]
    fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn ensure_live(&self) -> PeerResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for SdpFilePeer {
    async fn create_data_channel(&self, label: &str) -> PeerResult<Arc<dyn DataChannelTransport>> {
        self.ensure_live()?;
        let id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let channel: Arc<dyn DataChannelTransport> = Arc::new(DetachedChannel {
            id,
            label: label.to_string(),
        });
        Ok(channel)
    }

    async fn create_offer(&self) -> PeerResult<String> {
        self.ensure_live()?;
        if !self.offer.trim_start().starts_with("v=") {
            return Err(PeerError::InvalidDescription("offer does not start with v=".into()));
        }
        for candidate in extract_candidates(&self.offer) {
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        }
        let _ = self.events.send(PeerEvent::GatheringComplete);
        Ok(self.offer.clone())
    }

    async fn process_answer(&self, sdp: &str) -> PeerResult<()> {
        self.ensure_live()?;
        if let Ok(mut answer) = self.answer.lock() {
            *answer = Some(sdp.to_string());
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> PeerResult<()> {
        self.ensure_live()?;
        debug!("Remote candidate {}", candidate);
        if let Ok(mut candidates) = self.remote_candidates.lock() {
            candidates.push(candidate.clone());
        }
        Ok(())
    }

    async fn dispose(&self) -> PeerResult<()> {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            let answered = self.answer.lock().map(|a| a.is_some()).unwrap_or(false);
            let remote = self.remote_candidates.lock().map(|c| c.len()).unwrap_or(0);
            debug!("Disposing file peer (answered: {}, remote candidates: {})", answered, remote);
        }
        Ok(())
    }
}

/// A channel with no transport behind it; it never reports open
struct DetachedChannel {
    id: u16,
    label: String,
}

#[async_trait]
impl DataChannelTransport for DetachedChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, _payload: &Payload) -> PeerResult<()> {
        Err(PeerError::Closed)
    }

    async fn close(&self) -> PeerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 1 1 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=mid:audio0\r\n\
        a=candidate:1 1 udp 2122260223 192.168.1.5 50000 typ host\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=mid:video0\r\n\
        a=candidate:2 1 udp 2122260223 192.168.1.5 50002 typ host\r\n\
        a=candidate:3 1 udp 1686052607 203.0.113.7 50002 typ srflx raddr 192.168.1.5 rport 50002\r\n";

    #[test]
    fn test_extracts_candidates_with_media_section() {
        let candidates = extract_candidates(OFFER);
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].sdp_mid.as_deref(), Some("audio0"));
        assert_eq!(candidates[0].sdp_m_line_index, Some(0));
        assert!(candidates[0].candidate.starts_with("candidate:1 "));
        assert_eq!(candidates[2].sdp_mid.as_deref(), Some("video0"));
        assert_eq!(candidates[2].sdp_m_line_index, Some(1));
    }

    #[test]
    fn test_no_candidates_in_plain_offer() {
        assert!(extract_candidates("v=0\r\nm=audio 9 RTP/AVP 0\r\n").is_empty());
    }

    #[tokio::test]
    async fn test_offer_reports_candidates_then_gathering_complete() {
        let (peer, mut events) = SdpFilePeer::new(OFFER.to_string());
        assert_eq!(peer.create_offer().await.unwrap(), OFFER);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 4);
        assert!(matches!(seen[0], PeerEvent::LocalCandidate(_)));
        assert!(matches!(seen[3], PeerEvent::GatheringComplete));
    }

    #[tokio::test]
    async fn test_rejects_non_sdp_offer() {
        let (peer, _events) = SdpFilePeer::new("hello".to_string());
        assert!(matches!(peer.create_offer().await, Err(PeerError::InvalidDescription(_))));
    }

    #[tokio::test]
    async fn test_records_answer_and_remote_candidates() {
        let (peer, _events) = SdpFilePeer::new(OFFER.to_string());
        peer.process_answer("v=0\r\n").await.unwrap();
        let remote = IceCandidate::new("candidate:9 1 udp 1 10.0.0.1 9 typ host", Some("audio0".into()), Some(0));
        peer.add_ice_candidate(&remote).await.unwrap();

        assert_eq!(peer.answer().as_deref(), Some("v=0\r\n"));
        assert_eq!(peer.remote_candidates(), vec![remote]);
    }

    #[tokio::test]
    async fn test_disposed_peer_refuses_work() {
        let (peer, _events) = SdpFilePeer::new(OFFER.to_string());
        peer.dispose().await.unwrap();
        assert_eq!(peer.create_offer().await, Err(PeerError::Closed));
        assert!(peer.create_data_channel("x").await.is_err());
    }

    #[tokio::test]
    async fn test_dispose_after_answer_is_idempotent() {
        let (peer, _events) = SdpFilePeer::new(OFFER.to_string());
        peer.process_answer("v=0\r\n").await.unwrap();
        peer.dispose().await.unwrap();
        peer.dispose().await.unwrap();
        assert_eq!(peer.answer().as_deref(), Some("v=0\r\n"));
        assert_eq!(peer.process_answer("v=0\r\n").await, Err(PeerError::Closed));
    }

    #[tokio::test]
    async fn test_channels_get_distinct_ids() {
        let (peer, _events) = SdpFilePeer::new(OFFER.to_string());
        let a = peer.create_data_channel("a").await.unwrap();
        let b = peer.create_data_channel("b").await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(b.label(), "b");
    }
}
