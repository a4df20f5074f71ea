//! Data channels of a session
//!
//! A [`ChannelHandle`] wraps one [`DataChannelTransport`] and gates it on
//! readiness: messages are only handed to the transport while the channel
//! is [`ChannelState::Open`]. Readiness follows
//! `connecting -> open -> closing -> closed` and never goes back.

use bytes::Bytes;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::errors::{Result, SessionError};
use crate::peer::{DataChannelTransport, PeerConnection, PeerError};

/// Readiness of a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// One message on a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(b))
    }
}

/// Receives every message that arrives on a channel
pub type MessageHandler = Arc<dyn Fn(Payload) + Send + Sync>;

/// Told about every readiness change: `(channel id, label, new state)`
pub type StateObserver = Arc<dyn Fn(u16, &str, ChannelState) + Send + Sync>;

struct ChannelInner {
    transport: Arc<dyn DataChannelTransport>,
    label: String,
    id: u16,
    state: watch::Sender<ChannelState>,
    handler: RwLock<Option<MessageHandler>>,
    observer: Option<StateObserver>,
}

/// Shared handle to one data channel
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

impl ChannelHandle {
    /// Wrap a transport; the channel starts out connecting
    pub fn new(transport: Arc<dyn DataChannelTransport>) -> Self {
        Self::with_observer(transport, None)
    }

    pub fn with_observer(transport: Arc<dyn DataChannelTransport>, observer: Option<StateObserver>) -> Self {
        let (state, _) = watch::channel(ChannelState::Connecting);
        Self {
            inner: Arc::new(ChannelInner {
                label: transport.label().to_string(),
                id: transport.id(),
                transport,
                state,
                handler: RwLock::new(None),
                observer,
            }),
        }
    }

    /// Ask `peer` for a new channel named `label`
    pub async fn open(peer: &dyn PeerConnection, label: &str, observer: Option<StateObserver>) -> Result<Self> {
        let transport = peer
            .create_data_channel(label)
            .await
            .map_err(|e| SessionError::Internal(format!("cannot open channel '{}': {}", label, e)))?;
        debug!("Opened data channel '{}' (id {})", label, transport.id());
        Ok(Self::with_observer(transport, observer))
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn id(&self) -> u16 {
        self.inner.id
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Watch readiness changes
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Replace the message handler of this channel
    pub fn on_message(&self, handler: MessageHandler) {
        if let Ok(mut slot) = self.inner.handler.write() {
            *slot = Some(handler);
        }
    }

    /// Send one message.
    ///
    /// Fails with [`SessionError::ChannelState`] unless the channel is open;
    /// in that case nothing reaches the transport.
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        let state = self.state();
        if state != ChannelState::Open {
            return Err(SessionError::ChannelState {
                label: self.inner.label.clone(),
                state,
            });
        }

        let payload = payload.into();
        trace!("Sending {} bytes on '{}'", payload.len(), self.inner.label);
        match self.inner.transport.send(&payload).await {
            Ok(()) => Ok(()),
            Err(PeerError::Closed) => {
                self.mark_closed();
                Err(SessionError::ChannelState {
                    label: self.inner.label.clone(),
                    state: ChannelState::Closed,
                })
            }
            Err(e) => Err(SessionError::Internal(format!(
                "send on '{}' failed: {}",
                self.inner.label, e
            ))),
        }
    }

    /// Close the channel; closing twice is a no-op
    pub async fn close(&self) {
        let began = self.transition(|current| match current {
            ChannelState::Connecting | ChannelState::Open => Some(ChannelState::Closing),
            _ => None,
        });
        if !began {
            return;
        }

        if let Err(e) = self.inner.transport.close().await {
            warn!("Closing data channel '{}' failed: {}", self.inner.label, e);
        }
        self.mark_closed();
    }

    /// Connecting -> open, reported by the peer
    pub(crate) fn mark_open(&self) -> bool {
        self.transition(|current| (current == ChannelState::Connecting).then_some(ChannelState::Open))
    }

    /// Anything -> closed, reported by the peer or a failed send
    pub(crate) fn mark_closed(&self) -> bool {
        self.transition(|current| (current != ChannelState::Closed).then_some(ChannelState::Closed))
    }

    /// Hand an incoming message to the handler
    pub(crate) fn deliver(&self, payload: Payload) {
        let handler = self.inner.handler.read().ok().and_then(|slot| slot.clone());
        match handler {
            Some(handler) => handler(payload),
            None => trace!("No handler on '{}', dropping {} bytes", self.inner.label, payload.len()),
        }
    }

    fn transition(&self, next: impl FnOnce(ChannelState) -> Option<ChannelState>) -> bool {
        let mut moved_to = None;
        self.inner.state.send_if_modified(|state| match next(*state) {
            Some(new_state) => {
                *state = new_state;
                moved_to = Some(new_state);
                true
            }
            None => false,
        });

        match moved_to {
            Some(state) => {
                debug!("Data channel '{}' is now {}", self.inner.label, state);
                if let Some(observer) = &self.inner.observer {
                    observer(self.inner.id, &self.inner.label, state);
                }
                true
            }
            None => false,
        }
    }
}

/// The channels of one session
///
/// The channel we opened ourselves sits in its own slot; channels the
/// remote side opened are keyed by transport id. An id is never tracked
/// twice.
#[derive(Default)]
pub(crate) struct Channels {
    initiator: Option<ChannelHandle>,
    incoming: HashMap<u16, ChannelHandle>,
    handler: Option<MessageHandler>,
}

impl Channels {
    pub fn set_initiator(&mut self, handle: ChannelHandle) {
        if let Some(handler) = &self.handler {
            handle.on_message(handler.clone());
        }
        self.initiator = Some(handle);
    }

    /// Track a channel the remote side opened; fails if its id is taken
    pub fn add_incoming(&mut self, handle: ChannelHandle) -> bool {
        if self.contains(handle.id()) {
            return false;
        }
        if let Some(handler) = &self.handler {
            handle.on_message(handler.clone());
        }
        self.incoming.insert(handle.id(), handle);
        true
    }

    pub fn contains(&self, id: u16) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: u16) -> Option<&ChannelHandle> {
        match &self.initiator {
            Some(handle) if handle.id() == id => Some(handle),
            _ => self.incoming.get(&id),
        }
    }

    pub fn initiator(&self) -> Option<ChannelHandle> {
        self.initiator.clone()
    }

    /// Install `handler` on every present and future channel
    pub fn set_handler(&mut self, handler: MessageHandler) {
        for handle in self.initiator.iter().chain(self.incoming.values()) {
            handle.on_message(handler.clone());
        }
        self.handler = Some(handler);
    }

    /// `(label, state)` of every channel, ordered by id
    pub fn summary(&self) -> Vec<(String, ChannelState)> {
        let mut handles: Vec<&ChannelHandle> = self.initiator.iter().chain(self.incoming.values()).collect();
        handles.sort_by_key(|h| h.id());
        handles.into_iter().map(|h| (h.label().to_string(), h.state())).collect()
    }

    /// Close every channel, giving each transport at most `timeout`
    pub async fn close_all(&mut self, timeout: Duration) {
        let handles: Vec<ChannelHandle> = self
            .initiator
            .take()
            .into_iter()
            .chain(self.incoming.drain().map(|(_, handle)| handle))
            .collect();

        join_all(handles.iter().map(|handle| async move {
            if tokio::time::timeout(timeout, handle.close()).await.is_err() {
                let resource = format!("data channel '{}'", handle.label());
                warn!("{}", SessionError::teardown(resource, "close timed out"));
                handle.mark_closed();
            }
        }))
        .await;
    }
}
