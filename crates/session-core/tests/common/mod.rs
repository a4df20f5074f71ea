// Scripted doubles for the local peer and the remote pipeline server
//
// Every double appends to a shared call log so tests can assert ordering
// and count teardown calls. Gates hold an operation until the test opens
// them, which is how in-flight steps are created deterministically.

#![allow(dead_code)]

use async_trait::async_trait;
use loopback_pipeline_client::{
    ClientError, ConnectOptions, EndpointId, IceCandidate, PipelineConnector, PipelineEvent, PipelineId,
    RemotePipelineClient,
};
use loopback_session_core::prelude::*;
use loopback_session_core::PeerResult;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify, Semaphore};

pub const OFFER_SDP: &str =
    "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";
pub const ANSWER_SDP: &str = "v=0\r\no=- 2 2 IN IP4 10.0.0.5\r\ns=Kurento Media Server\r\nt=0 0\r\n";
pub const PIPELINE: &str = "pipeline-1";
pub const ENDPOINT: &str = "pipeline-1/endpoint-1";

pub fn local_candidate(n: u16) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{} 1 udp 2122260223 192.168.1.{} {} typ host", n, n, 50000 + n),
        Some("0".to_string()),
        Some(0),
    )
}

pub fn remote_candidate(n: u16) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{} 1 UDP 2013266431 10.0.0.{} {} typ host", n, n, 40000 + n),
        Some("0".to_string()),
        Some(0),
    )
}

pub fn config() -> SessionConfig {
    SessionConfig::new().with_step_timeout(Duration::from_secs(2))
}

/// Route crate logs to the test output; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub type CallLog = Arc<Mutex<Vec<String>>>;

fn record(log: &CallLog, call: &str) {
    log.lock().unwrap().push(call.to_string());
}

/// Holds an operation until opened; once open it stays open
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn closed() -> Self {
        Self(Arc::new(Semaphore::new(0)))
    }

    pub fn open(&self) {
        self.0.add_permits(1);
    }

    pub async fn wait(&self) {
        // The permit goes back on drop, so every later waiter passes too
        let _permit = self.0.acquire().await;
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receive events until one matches
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    let fut = async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if matches(&event) {
                return event;
            }
        }
    };
    with_deadline(fut).await
}

pub async fn with_deadline<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("timed out")
}

/// Everything currently buffered on an event receiver
pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut all = Vec::new();
    while let Ok(event) = events.try_recv() {
        all.push(event);
    }
    all
}

// ---------------------------------------------------------------------------
// Local peer
// ---------------------------------------------------------------------------

pub struct MockTransport {
    id: u16,
    label: String,
    hang_on_close: bool,
    pub sent: Mutex<Vec<Payload>>,
    pub closed: AtomicBool,
}

impl MockTransport {
    pub fn new(id: u16, label: &str) -> Arc<Self> {
        Self::build(id, label, false)
    }

    /// A transport whose close never completes
    pub fn hanging(id: u16, label: &str) -> Arc<Self> {
        Self::build(id, label, true)
    }

    fn build(id: u16, label: &str, hang_on_close: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            label: label.to_string(),
            hang_on_close,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannelTransport for MockTransport {
    fn id(&self) -> u16 {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, payload: &Payload) -> PeerResult<()> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn close(&self) -> PeerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct PeerScript {
    /// Reported while the offer is created, before any relay exists
    pub local_candidates: Vec<IceCandidate>,
    pub fail_create: bool,
    pub fail_channel: bool,
    pub fail_offer: bool,
    pub fail_answer: bool,
    pub fail_remote_candidates: bool,
    /// Never report the initiator channel as open
    pub hold_channel: bool,
    pub offer_gate: Option<Gate>,
}

pub struct MockPeer {
    script: PeerScript,
    log: CallLog,
    events: mpsc::UnboundedSender<PeerEvent>,
    channel: Mutex<Option<Arc<MockTransport>>>,
    pub answers: Mutex<Vec<String>>,
    pub remote_candidates: Mutex<Vec<IceCandidate>>,
    pub disposed: AtomicUsize,
}

impl MockPeer {
    pub fn new(script: PeerScript, log: CallLog) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            script,
            log,
            events,
            channel: Mutex::new(None),
            answers: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            disposed: AtomicUsize::new(0),
        });
        (peer, rx)
    }

    /// Report an event as the real peer would
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn channel(&self) -> Arc<MockTransport> {
        self.channel.lock().unwrap().clone().expect("no data channel created")
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().unwrap().clone()
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_data_channel(&self, label: &str) -> PeerResult<Arc<dyn DataChannelTransport>> {
        record(&self.log, "peer.create_data_channel");
        if self.script.fail_channel {
            return Err(PeerError::Operation("sctp unavailable".into()));
        }
        let transport = MockTransport::new(0, label);
        *self.channel.lock().unwrap() = Some(transport.clone());
        let transport: Arc<dyn DataChannelTransport> = transport;
        Ok(transport)
    }

    async fn create_offer(&self) -> PeerResult<String> {
        record(&self.log, "peer.create_offer");
        if let Some(gate) = &self.script.offer_gate {
            gate.wait().await;
        }
        if self.script.fail_offer {
            return Err(PeerError::Operation("offer refused".into()));
        }
        for candidate in &self.script.local_candidates {
            self.emit(PeerEvent::LocalCandidate(candidate.clone()));
        }
        Ok(OFFER_SDP.to_string())
    }

    async fn process_answer(&self, sdp: &str) -> PeerResult<()> {
        record(&self.log, "peer.process_answer");
        if self.script.fail_answer {
            return Err(PeerError::InvalidDescription("answer refused".into()));
        }
        self.answers.lock().unwrap().push(sdp.to_string());
        if !self.script.hold_channel {
            self.emit(PeerEvent::ChannelOpened { channel: 0 });
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> PeerResult<()> {
        record(&self.log, "peer.add_ice_candidate");
        if self.script.fail_remote_candidates {
            return Err(PeerError::Operation("candidate refused".into()));
        }
        self.remote_candidates.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    async fn dispose(&self) -> PeerResult<()> {
        record(&self.log, "peer.dispose");
        self.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockPeerFactory {
    script: PeerScript,
    log: CallLog,
    pub peers: Mutex<Vec<Arc<MockPeer>>>,
    pub policies: Mutex<Vec<IceServerPolicy>>,
}

impl MockPeerFactory {
    pub fn new(script: PeerScript, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            script,
            log,
            peers: Mutex::new(Vec::new()),
            policies: Mutex::new(Vec::new()),
        })
    }

    pub fn peer(&self, index: usize) -> Arc<MockPeer> {
        self.peers.lock().unwrap()[index].clone()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        ice: &IceServerPolicy,
    ) -> PeerResult<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>)> {
        record(&self.log, "peer.create");
        self.policies.lock().unwrap().push(ice.clone());
        if self.script.fail_create {
            return Err(PeerError::Operation("no peer".into()));
        }
        let (peer, events) = MockPeer::new(self.script.clone(), self.log.clone());
        self.peers.lock().unwrap().push(peer.clone());
        let peer: Arc<dyn PeerConnection> = peer;
        Ok((peer, events))
    }
}

// ---------------------------------------------------------------------------
// Remote pipeline
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct PipelineScript {
    pub(crate) failures: HashMap<&'static str, String>,
    pub(crate) gates: HashMap<&'static str, Gate>,
    pub answer: Option<String>,
    /// Announced for the endpoint once it is asked to gather
    pub remote_candidates: Vec<IceCandidate>,
    /// Candidate lines `addIceCandidate` rejects
    pub rejected_candidates: Vec<String>,
}

impl PipelineScript {
    pub fn failing(mut self, operation: &'static str, reason: &str) -> Self {
        self.failures.insert(operation, reason.to_string());
        self
    }

    pub fn gated(mut self, operation: &'static str, gate: Gate) -> Self {
        self.gates.insert(operation, gate);
        self
    }
}

pub struct MockPipeline {
    script: PipelineScript,
    log: CallLog,
    events: broadcast::Sender<PipelineEvent>,
    pub added: Mutex<Vec<IceCandidate>>,
    pub connected: Mutex<Vec<(EndpointId, EndpointId)>>,
    pub released: AtomicUsize,
    pub closed: AtomicUsize,
    /// Whether the current connection is shut down
    shut: AtomicBool,
    shut_down: Notify,
}

impl MockPipeline {
    pub fn new(script: PipelineScript, log: CallLog) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            script,
            log,
            events,
            added: Mutex::new(Vec::new()),
            connected: Mutex::new(Vec::new()),
            released: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            shut: AtomicBool::new(false),
            shut_down: Notify::new(),
        })
    }

    /// A new connection; calls work again
    pub fn reopen(&self) {
        self.shut.store(false, Ordering::SeqCst);
    }

    /// Announce a remote candidate as the server would
    pub fn emit_candidate(&self, endpoint: &str, candidate: IceCandidate) {
        let _ = self.events.send(PipelineEvent::IceCandidateFound {
            endpoint: EndpointId::from(endpoint),
            candidate,
        });
    }

    pub fn added(&self) -> Vec<IceCandidate> {
        self.added.lock().unwrap().clone()
    }

    /// Like the JSON-RPC client: calls fail once the connection is closed,
    /// including calls already waiting for a reply
    async fn operation(&self, name: &'static str) -> loopback_pipeline_client::Result<()> {
        record(&self.log, &format!("pipeline.{}", name));
        let closed = self.shut_down.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if self.shut.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if let Some(gate) = self.script.gates.get(name) {
            tokio::select! {
                _ = gate.wait() => {}
                _ = &mut closed => return Err(ClientError::Closed),
            }
        }
        match self.script.failures.get(name) {
            Some(reason) => Err(ClientError::Rpc {
                code: 40000,
                message: reason.clone(),
                data: None,
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemotePipelineClient for MockPipeline {
    async fn create_pipeline(&self) -> loopback_pipeline_client::Result<PipelineId> {
        self.operation("create_pipeline").await?;
        Ok(PipelineId::from(PIPELINE))
    }

    async fn create_endpoint(&self, _pipeline: &PipelineId) -> loopback_pipeline_client::Result<EndpointId> {
        self.operation("create_endpoint").await?;
        Ok(EndpointId::from(ENDPOINT))
    }

    async fn process_offer(&self, _endpoint: &EndpointId, _offer: &str) -> loopback_pipeline_client::Result<String> {
        self.operation("process_offer").await?;
        Ok(self.script.answer.clone().unwrap_or_else(|| ANSWER_SDP.to_string()))
    }

    async fn add_ice_candidate(
        &self,
        _endpoint: &EndpointId,
        candidate: &IceCandidate,
    ) -> loopback_pipeline_client::Result<()> {
        self.operation("add_ice_candidate").await?;
        if self.script.rejected_candidates.contains(&candidate.candidate) {
            return Err(ClientError::Rpc {
                code: 40001,
                message: "candidate rejected".into(),
                data: None,
            });
        }
        self.added.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    async fn subscribe_ice_candidates(&self, _endpoint: &EndpointId) -> loopback_pipeline_client::Result<()> {
        self.operation("subscribe").await
    }

    async fn gather_candidates(&self, endpoint: &EndpointId) -> loopback_pipeline_client::Result<()> {
        self.operation("gather_candidates").await?;
        for candidate in &self.script.remote_candidates {
            self.emit_candidate(endpoint.as_str(), candidate.clone());
        }
        Ok(())
    }

    async fn connect(&self, source: &EndpointId, sink: &EndpointId) -> loopback_pipeline_client::Result<()> {
        self.operation("connect").await?;
        self.connected.lock().unwrap().push((source.clone(), sink.clone()));
        Ok(())
    }

    async fn release(&self, _pipeline: &PipelineId) -> loopback_pipeline_client::Result<()> {
        self.operation("release").await?;
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        record(&self.log, "pipeline.close");
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.shut.store(true, Ordering::SeqCst);
        self.shut_down.notify_waiters();
        let _ = self.events.send(PipelineEvent::ConnectionClosed);
    }
}

#[derive(Clone, Default)]
pub struct ConnectorScript {
    pub fail: Option<String>,
    pub gate: Option<Gate>,
}

pub struct MockConnector {
    script: ConnectorScript,
    log: CallLog,
    pipeline: Arc<MockPipeline>,
    pub uris: Mutex<Vec<String>>,
}

#[async_trait]
impl PipelineConnector for MockConnector {
    async fn connect(
        &self,
        uri: &str,
        _options: &ConnectOptions,
    ) -> loopback_pipeline_client::Result<Arc<dyn RemotePipelineClient>> {
        record(&self.log, "signaling.connect");
        self.uris.lock().unwrap().push(uri.to_string());
        if let Some(gate) = &self.script.gate {
            gate.wait().await;
        }
        if let Some(reason) = &self.script.fail {
            return Err(ClientError::Connect {
                uri: uri.to_string(),
                reason: reason.clone(),
            });
        }
        self.pipeline.reopen();
        let client: Arc<dyn RemotePipelineClient> = self.pipeline.clone();
        Ok(client)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub log: CallLog,
    pub peers: Arc<MockPeerFactory>,
    pub pipeline: Arc<MockPipeline>,
    pub connector: Arc<MockConnector>,
    pub controller: SessionController,
}

impl Harness {
    pub fn new(peer: PeerScript, pipeline: PipelineScript) -> Self {
        Self::with_connector(peer, pipeline, ConnectorScript::default())
    }

    pub fn with_connector(peer: PeerScript, pipeline: PipelineScript, connector: ConnectorScript) -> Self {
        init_tracing();
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let peers = MockPeerFactory::new(peer, log.clone());
        let pipeline = MockPipeline::new(pipeline, log.clone());
        let connector = Arc::new(MockConnector {
            script: connector,
            log: log.clone(),
            pipeline: pipeline.clone(),
            uris: Mutex::new(Vec::new()),
        });
        let controller = SessionController::new(peers.clone(), connector.clone());
        Self {
            log,
            peers,
            pipeline,
            connector,
            controller,
        }
    }

    pub fn default_scripts() -> Self {
        Self::new(PeerScript::default(), PipelineScript::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn peer(&self, index: usize) -> Arc<MockPeer> {
        self.peers.peer(index)
    }

    /// Negotiate and wait until the initiator channel is open
    pub async fn connect_and_open(&self) -> SessionId {
        let mut events = self.controller.subscribe();
        let session_id = self.controller.negotiate(config()).await.expect("negotiation failed");
        let channel = with_deadline(self.controller.data_channel())
            .await
            .expect("no data channel");
        if !channel.is_open() {
            wait_for_event(&mut events, |e| {
                matches!(e, SessionEvent::ChannelStateChanged { state: ChannelState::Open, .. })
            })
            .await;
        }
        session_id
    }
}
