//! Session lifecycle controller
//!
//! [`SessionController`] is a handle to an actor task that owns the one
//! active [`Session`]. Commands from the handle, step completions, peer
//! events and relay errors all arrive on channels and are handled one at a
//! time, so the session is never touched concurrently.
//!
//! Every spawned step and every peer event forwarder is tagged with the
//! epoch of the session that started it. When the session is gone, or a
//! newer one has replaced it, the completion is stale: it is ignored and
//! any resource it carries is released.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use loopback_session_core::prelude::*;
//! # async fn example(peers: Arc<dyn PeerConnectionFactory>) -> Result<()> {
//! let controller = SessionController::with_peer_factory(peers);
//! controller.set_message_handler(|payload| println!("received {:?}", payload));
//!
//! let session_id = controller.negotiate(SessionConfig::default()).await?;
//! println!("{} connected", session_id);
//!
//! controller.send("hello").await?;
//! controller.stop().await;
//! # Ok(())
//! # }
//! ```

use loopback_pipeline_client::{PipelineConnector, RemotePipelineClient, WsConnector};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::channel::{ChannelHandle, ChannelState, MessageHandler, Payload, StateObserver};
use crate::config::{SessionConfig, DEFAULT_DATA_CHANNEL_LABEL};
use crate::errors::{NegotiationStep, Result, SessionError};
use crate::events::SessionEvent;
use crate::negotiator::{NegotiationState, Progress, SessionNegotiator, StepFuture, StepOutput};
use crate::peer::{PeerConnectionFactory, PeerEvent};
use crate::relay::ErrorSink;
use crate::session::{Session, SessionId, SessionInfo};

const EVENT_BUFFER: usize = 256;

enum Command {
    Start {
        config: SessionConfig,
        reply: oneshot::Sender<Result<SessionId>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Channel {
        reply: oneshot::Sender<Result<ChannelHandle>>,
    },
    SetHandler(MessageHandler),
    Info {
        reply: oneshot::Sender<Option<SessionInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Completions and notifications produced off the actor
enum Internal {
    Step {
        epoch: u64,
        step: NegotiationStep,
        result: Result<StepOutput>,
    },
    Peer {
        epoch: u64,
        event: PeerEvent,
    },
    CandidateError {
        epoch: u64,
        error: SessionError,
    },
}

/// Handle to the session actor
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Receiver<NegotiationState>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Spawn the actor; must be called inside a tokio runtime
    pub fn new(peers: Arc<dyn PeerConnectionFactory>, connector: Arc<dyn PipelineConnector>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state_tx, state) = watch::channel(NegotiationState::Idle);

        let actor = SessionActor {
            negotiator: SessionNegotiator::new(peers, connector),
            session: None,
            next_epoch: 0,
            handler: None,
            last_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            lingering: HashMap::new(),
            state: state_tx,
            events: events.clone(),
            internal_tx,
        };
        let handle = tokio::spawn(actor.run(command_rx, internal_rx));

        Self {
            commands,
            events,
            state,
            actor: Mutex::new(Some(handle)),
        }
    }

    /// Controller that reaches the pipeline server over WebSocket
    pub fn with_peer_factory(peers: Arc<dyn PeerConnectionFactory>) -> Self {
        Self::new(peers, Arc::new(WsConnector::new()))
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| SessionError::internal("session controller has shut down"))?;
        rx.await
            .map_err(|_| SessionError::internal("session controller dropped the request"))
    }

    /// Begin negotiating a new session.
    ///
    /// Returns as soon as the first step is running; progress is reported
    /// through [`SessionController::subscribe`]. Fails with
    /// [`SessionError::AlreadyStarted`] while another session is active.
    pub async fn start(&self, config: SessionConfig) -> Result<SessionId> {
        self.request(|reply| Command::Start { config, reply }).await?
    }

    /// Start a session and wait until it is connected or torn down.
    ///
    /// On failure this returns after teardown finished, with the error that
    /// caused it.
    pub async fn negotiate(&self, config: SessionConfig) -> Result<SessionId> {
        let mut events = self.subscribe();
        let session_id = self.start(config).await?;
        let mut failure = None;

        loop {
            match events.recv().await {
                Ok(event) if event.session_id() != &session_id => {}
                Ok(SessionEvent::Connected { .. }) => return Ok(session_id),
                Ok(SessionEvent::Failed { error, .. }) => failure = Some(error),
                Ok(SessionEvent::Stopped { .. }) => return Err(failure.unwrap_or(SessionError::Stopped)),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!("Missed {} session events while negotiating", missed);
                    match self.session_info().await {
                        Some(info) if info.id == session_id => {
                            if info.state == NegotiationState::Connected {
                                return Ok(session_id);
                            }
                        }
                        _ => return Err(failure.unwrap_or(SessionError::Stopped)),
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(SessionError::internal("session controller has shut down"));
                }
            }
        }
    }

    /// Stop the active session; without one this does nothing
    pub async fn stop(&self) {
        if self.request(|reply| Command::Stop { reply }).await.is_err() {
            debug!("Stop requested after the controller shut down");
        }
    }

    /// Send a message on the initiator's data channel
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        let channel = self.request(|reply| Command::Channel { reply }).await??;
        channel.send(payload).await
    }

    /// The initiator's data channel, once the offer exists
    pub async fn data_channel(&self) -> Option<ChannelHandle> {
        self.request(|reply| Command::Channel { reply }).await.ok()?.ok()
    }

    /// Handle every message received on any channel of this and later sessions.
    ///
    /// The handler runs on the controller task and must not block.
    pub fn set_message_handler(&self, handler: impl Fn(Payload) + Send + Sync + 'static) {
        if self.commands.send(Command::SetHandler(Arc::new(handler))).is_err() {
            debug!("Message handler set after the controller shut down");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    /// Snapshot of the active session
    pub async fn session_info(&self) -> Option<SessionInfo> {
        self.request(|reply| Command::Info { reply }).await.ok().flatten()
    }

    /// Stop the session and end the actor task
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            debug!("Controller already shut down");
        }
        let handle = self.actor.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Session actor ended abnormally: {}", e);
            }
        }
    }
}

struct SessionActor {
    negotiator: SessionNegotiator,
    session: Option<Session>,
    next_epoch: u64,
    handler: Option<MessageHandler>,
    /// Label reported by sends after the session is gone
    last_label: String,
    /// Connections of stopped sessions whose pipeline creation is still
    /// running, by epoch, with the step timeout bounding the wait
    lingering: HashMap<u64, (Arc<dyn RemotePipelineClient>, Duration)>,
    state: watch::Sender<NegotiationState>,
    events: broadcast::Sender<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut internal: mpsc::UnboundedReceiver<Internal>) {
        debug!("Session controller started");
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = internal.recv() => self.handle_internal(event).await,
            }
        }
        self.teardown().await;
        self.settle_lingering(&mut internal).await;
        debug!("Session controller stopped");
    }

    /// Let in-flight pipeline creations finish so their pipelines get
    /// released, then close what is still open
    async fn settle_lingering(&mut self, internal: &mut mpsc::UnboundedReceiver<Internal>) {
        let Some(wait) = self.lingering.values().map(|(_, timeout)| *timeout).max() else {
            return;
        };
        let deadline = tokio::time::Instant::now() + wait;
        while !self.lingering.is_empty() {
            match tokio::time::timeout_at(deadline, internal.recv()).await {
                Ok(Some(event)) => self.handle_internal(event).await,
                _ => break,
            }
        }
        for (epoch, (client, _)) in self.lingering.drain() {
            debug!("Closing signaling connection of epoch {}", epoch);
            client.close().await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { config, reply } => {
                let result = self.start(config);
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
            Command::Channel { reply } => {
                let _ = reply.send(self.initiator_channel());
            }
            Command::SetHandler(handler) => {
                if let Some(session) = self.session.as_mut() {
                    session.channels.set_handler(handler.clone());
                }
                self.handler = Some(handler);
            }
            Command::Info { reply } => {
                let _ = reply.send(self.session.as_ref().map(Session::info));
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Step { epoch, step, result } => self.on_step(epoch, step, result).await,
            Internal::Peer { epoch, event } => self.on_peer_event(epoch, event),
            Internal::CandidateError { epoch, error } => match self.current(epoch) {
                Some(session) => {
                    let _ = self.events.send(SessionEvent::CandidateError {
                        session_id: session.id.clone(),
                        error,
                    });
                }
                None => trace!("Dropping candidate error from epoch {}", epoch),
            },
        }
    }

    fn current(&self, epoch: u64) -> Option<&Session> {
        self.session.as_ref().filter(|s| s.epoch == epoch)
    }

    fn start(&mut self, config: SessionConfig) -> Result<SessionId> {
        if let Some(session) = &self.session {
            warn!("Rejecting start: session {} is {}", session.id, session.state);
            return Err(SessionError::AlreadyStarted);
        }
        config.validate()?;

        self.next_epoch += 1;
        let epoch = self.next_epoch;

        let internal_tx = self.internal_tx.clone();
        let error_sink: ErrorSink = Arc::new(move |error: SessionError| {
            let _ = internal_tx.send(Internal::CandidateError { epoch, error });
        });

        let mut session = Session::new(epoch, config, error_sink, None);
        let events = self.events.clone();
        let session_id = session.id.clone();
        let observer: StateObserver = Arc::new(move |channel, label: &str, state| {
            let _ = events.send(SessionEvent::ChannelStateChanged {
                session_id: session_id.clone(),
                channel,
                label: label.to_string(),
                state,
            });
        });
        session.channel_observer = Some(observer);
        if let Some(handler) = &self.handler {
            session.channels.set_handler(handler.clone());
        }
        self.last_label = session.config.data_channel_label.clone();

        let step = NegotiationStep::CreateOffer;
        let fut = self.negotiator.step(step, &session)?;
        session.in_flight = Some(step);
        let session_id = session.id.clone();
        info!("Starting session {} against {}", session_id, session.config.ws_uri);

        self.session = Some(session);
        self.enter(step.state());
        self.spawn_step(epoch, &session_id, step, fut);
        Ok(session_id)
    }

    fn spawn_step(&self, epoch: u64, session_id: &SessionId, step: NegotiationStep, fut: StepFuture) {
        let tx = self.internal_tx.clone();
        let span = info_span!("negotiation", session = %session_id, step = step.number());
        tokio::spawn(
            async move {
                debug!("Running {}", step);
                let result = fut.await;
                let _ = tx.send(Internal::Step { epoch, step, result });
            }
            .instrument(span),
        );
    }

    /// Move the session forward and publish the change
    fn enter(&mut self, state: NegotiationState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.advance_state(state) {
            self.state.send_replace(state);
            let _ = self.events.send(SessionEvent::StateChanged {
                session_id: session.id.clone(),
                state,
            });
        }
    }

    async fn on_step(&mut self, epoch: u64, step: NegotiationStep, result: Result<StepOutput>) {
        if self.current(epoch).is_none() {
            debug!("Ignoring stale completion of {} from epoch {}", step, epoch);
            let lingering = self.lingering.remove(&epoch).map(|(client, _)| client);
            tokio::spawn(async move {
                if let Ok(output) = result {
                    output.discard().await;
                }
                if let Some(client) = lingering {
                    debug!("Closing signaling connection kept open for {}", step);
                    client.close().await;
                }
            });
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.in_flight = None;
        }

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };

        let Some(session) = self.session.as_mut() else {
            return;
        };
        debug!("Session {} completed {}", session.id, step);
        let _ = self.events.send(SessionEvent::StepCompleted {
            session_id: session.id.clone(),
            step,
        });

        let progress = self.negotiator.advance(session, step, output);
        if let Some(peer_events) = session.peer_events.take() {
            session.forwarder = Some(spawn_forwarder(self.internal_tx.clone(), epoch, peer_events));
        }
        let session_id = session.id.clone();

        match progress {
            Ok(Progress::Next(next, fut)) => {
                session.in_flight = Some(next);
                self.enter(next.state());
                self.spawn_step(epoch, &session_id, next, fut);
            }
            Ok(Progress::Complete) => {
                self.enter(NegotiationState::Connected);
                info!("Session {} connected", session_id);
                let _ = self.events.send(SessionEvent::Connected { session_id });
            }
            Err(e) => self.fail(e).await,
        }
    }

    fn on_peer_event(&mut self, epoch: u64, event: PeerEvent) {
        let Some(session) = self.session.as_mut().filter(|s| s.epoch == epoch) else {
            trace!("Ignoring stale peer event {:?}", event);
            if let PeerEvent::IncomingChannel(transport) = event {
                tokio::spawn(async move {
                    let _ = transport.close().await;
                });
            }
            return;
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => match &session.relay {
                Some(relay) => relay.forward_local(candidate),
                None => {
                    debug!("Buffering local candidate until the relay is registered: {}", candidate);
                    session.pending_local.push(candidate);
                }
            },
            PeerEvent::GatheringComplete => {
                debug!("Local candidate gathering complete for {}", session.id);
            }
            PeerEvent::IncomingChannel(transport) => {
                if session.channels.contains(transport.id()) {
                    warn!(
                        "Refusing data channel '{}': id {} is already in use",
                        transport.label(),
                        transport.id()
                    );
                    tokio::spawn(async move {
                        let _ = transport.close().await;
                    });
                    return;
                }
                info!("Remote side opened data channel '{}'", transport.label());
                let handle = ChannelHandle::with_observer(transport, session.channel_observer.clone());
                session.channels.add_incoming(handle);
            }
            PeerEvent::ChannelOpened { channel } => match session.channels.get(channel) {
                Some(handle) => {
                    if handle.mark_open() {
                        info!("Data channel '{}' is open", handle.label());
                    }
                }
                None => warn!("Open reported for unknown data channel {}", channel),
            },
            PeerEvent::ChannelClosed { channel } => match session.channels.get(channel) {
                Some(handle) => {
                    handle.mark_closed();
                }
                None => debug!("Close reported for unknown data channel {}", channel),
            },
            PeerEvent::Message { channel, payload } => match session.channels.get(channel) {
                Some(handle) => {
                    handle.deliver(payload.clone());
                    let _ = self.events.send(SessionEvent::MessageReceived {
                        session_id: session.id.clone(),
                        label: handle.label().to_string(),
                        payload,
                    });
                }
                None => warn!("Message on unknown data channel {}", channel),
            },
        }
    }

    fn initiator_channel(&self) -> Result<ChannelHandle> {
        match &self.session {
            Some(session) => session.channels.initiator().ok_or_else(|| SessionError::ChannelState {
                label: session.config.data_channel_label.clone(),
                state: ChannelState::Connecting,
            }),
            None => Err(SessionError::ChannelState {
                label: self.last_label.clone(),
                state: ChannelState::Closed,
            }),
        }
    }

    async fn fail(&mut self, error: SessionError) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        error!("Session {} failed: {}", session.id, error);
        let _ = self.events.send(SessionEvent::Failed {
            session_id: session.id.clone(),
            error,
        });
        self.teardown().await;
    }

    /// Release everything the session holds.
    ///
    /// The session is removed first, so every completion still in flight
    /// becomes stale. Each failure is logged and the rest still runs.
    async fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let session_id = session.id.clone();
        let timeout = session.config.step_timeout();
        info!("Stopping session {} after {:?}", session_id, session.age());

        session.state = NegotiationState::Stopping;
        self.publish_state(&session_id, NegotiationState::Stopping);

        session.channels.close_all(timeout).await;

        if let Some(relay) = session.relay.take() {
            relay.shutdown();
        }
        if let Some(forwarder) = session.forwarder.take() {
            forwarder.abort();
        }

        if let Some(peer) = session.peer.take() {
            match tokio::time::timeout(timeout, peer.dispose()).await {
                Ok(Ok(())) => debug!("Disposed local peer"),
                Ok(Err(e)) => warn!("{}", SessionError::teardown("local peer", e.to_string())),
                Err(_) => warn!("{}", SessionError::teardown("local peer", "dispose timed out")),
            }
        }

        if let Some(client) = session.client.take() {
            if let Some(pipeline) = session.pipeline.take() {
                let resource = format!("pipeline {}", pipeline);
                match tokio::time::timeout(timeout, client.release(&pipeline)).await {
                    Ok(Ok(())) => debug!("Released {}", resource),
                    Ok(Err(e)) => warn!("{}", SessionError::teardown(resource, e.to_string())),
                    Err(_) => warn!("{}", SessionError::teardown(resource, "release timed out")),
                }
            }
            if session.in_flight == Some(NegotiationStep::CreatePipeline) {
                // Closing now would fail the create and orphan its pipeline
                debug!("Keeping signaling open until pipeline creation settles");
                self.lingering.insert(session.epoch, (client, timeout));
            } else {
                client.close().await;
            }
        }

        self.publish_state(&session_id, NegotiationState::Idle);
        let _ = self.events.send(SessionEvent::Stopped {
            session_id: session_id.clone(),
        });
        info!("Session {} stopped", session_id);
    }

    fn publish_state(&self, session_id: &SessionId, state: NegotiationState) {
        self.state.send_replace(state);
        let _ = self.events.send(SessionEvent::StateChanged {
            session_id: session_id.clone(),
            state,
        });
    }
}

fn spawn_forwarder(
    tx: mpsc::UnboundedSender<Internal>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(Internal::Peer { epoch, event }).is_err() {
                break;
            }
        }
        trace!("Peer event stream for epoch {} ended", epoch);
    })
}
