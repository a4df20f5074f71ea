//! WebSocket implementation of [`RemotePipelineClient`]

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use crate::client::{ConnectOptions, PipelineConnector, RemotePipelineClient};
use crate::error::{ClientError, Result};
use crate::jsonrpc::{self, Frame, Request};
use crate::types::{EndpointId, IceCandidate, PipelineEvent, PipelineId};

type PendingMap = DashMap<u64, oneshot::Sender<Result<Value>>>;

/// State shared between the client handle and its I/O tasks
struct Shared {
    pending: PendingMap,
    events: broadcast::Sender<PipelineEvent>,
    session_id: RwLock<Option<String>>,
    closed: AtomicBool,
}

impl Shared {
    /// Fail every outstanding request and announce the closure once
    fn shut_down(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(ClientError::Closed));
            }
        }
        let _ = self.events.send(PipelineEvent::ConnectionClosed);
    }

    async fn dispatch(&self, text: &str) {
        let frame = match jsonrpc::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping undecodable frame from pipeline server: {}", e);
                return;
            }
        };

        match frame {
            Frame::Response { id, outcome } => {
                if let Ok(result) = &outcome {
                    if let Some(session_id) = jsonrpc::result_session_id(result) {
                        let mut guard = self.session_id.write().await;
                        if guard.as_deref() != Some(session_id) {
                            debug!("Pipeline server session id is now {}", session_id);
                            *guard = Some(session_id.to_string());
                        }
                    }
                }

                match self.pending.remove(&id) {
                    Some((_, tx)) => {
                        let _ = tx.send(outcome.map_err(ClientError::from));
                    }
                    None => debug!("Response for unknown or expired request id {}", id),
                }
            }
            Frame::Notification { method, params } => {
                if method != "onEvent" {
                    trace!("Ignoring server notification '{}'", method);
                    return;
                }
                match jsonrpc::parse_event(&params) {
                    Ok(Some(event)) => {
                        // No receivers is fine: nobody subscribed yet
                        let _ = self.events.send(event);
                    }
                    Ok(None) => trace!("Ignoring unmodelled server event"),
                    Err(e) => warn!("Malformed server event: {}", e),
                }
            }
        }
    }
}

/// JSON-RPC 2.0 client for a media pipeline server over one WebSocket.
///
/// Requests are multiplexed by id; a reader task routes responses to their
/// waiting callers and broadcasts `onEvent` notifications. The server's
/// `sessionId` is learned from the first response and echoed afterwards.
pub struct JsonRpcPipelineClient {
    uri: String,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    request_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JsonRpcPipelineClient {
    /// Open a WebSocket to `uri` and start the I/O tasks
    pub async fn connect(uri: &str, options: &ConnectOptions) -> Result<Self> {
        debug!("Connecting to pipeline server at {}", uri);
        let (stream, _response) = tokio_tungstenite::connect_async(uri)
            .await
            .map_err(|e| ClientError::Connect {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;
        info!("Connected to pipeline server at {}", uri);

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events, _) = broadcast::channel(options.event_buffer.max(1));

        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            events,
            session_id: RwLock::new(None),
            closed: AtomicBool::new(false),
        });

        let writer_shared = shared.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    error!("Failed to write to pipeline server: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
            writer_shared.shut_down();
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => reader_shared.dispatch(&text).await,
                    Ok(Message::Close(frame)) => {
                        debug!("Pipeline server closed the connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
            reader_shared.shut_down();
        });

        let client = Self {
            uri: uri.to_string(),
            next_id: AtomicU64::new(1),
            shared,
            outbound,
            request_timeout: options.request_timeout,
            tasks: Mutex::new(vec![writer, reader]),
        };

        if let Some(interval) = options.keepalive_interval {
            client.spawn_keepalive(interval);
        }

        Ok(client)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The server-assigned session id, once known
    pub async fn session_id(&self) -> Option<String> {
        self.shared.session_id.read().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn spawn_keepalive(&self, interval: Duration) {
        let shared = self.shared.clone();
        let outbound = self.outbound.clone();
        let id_base = 1u64 << 48;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut n = 0u64;
            loop {
                ticker.tick().await;
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                // Pings use a separate id range and nobody waits for the pong
                n += 1;
                let params = json!({ "interval": interval.as_millis() as u64 });
                let request = Request::new(id_base + n, "ping", params);
                match serde_json::to_string(&request) {
                    Ok(text) => {
                        if outbound.send(Message::Text(text)).is_err() {
                            break;
                        }
                        trace!("Sent keepalive ping");
                    }
                    Err(e) => {
                        error!("Failed to encode keepalive: {}", e);
                        break;
                    }
                }
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    /// Send one request and wait for its result
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session_id = self.session_id().await;
        let request = Request::new(id, method, jsonrpc::with_session(params, session_id.as_deref()));
        let text = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);

        trace!("-> {}", text);
        if self.outbound.send(Message::Text(text)).is_err() {
            self.shared.pending.remove(&id);
            return Err(ClientError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.shared.pending.remove(&id);
                Err(ClientError::Timeout {
                    method: method.to_string(),
                    timeout: self.request_timeout,
                })
            }
        }
    }

    async fn create(&self, object_type: &str, constructor_params: Value) -> Result<String> {
        let result = self
            .call("create", jsonrpc::create_params(object_type, constructor_params))
            .await?;
        jsonrpc::result_value_str(&result)
    }

    async fn invoke(&self, object: &str, operation: &str, operation_params: Value) -> Result<Value> {
        self.call("invoke", jsonrpc::invoke_params(object, operation, operation_params))
            .await
    }
}

#[async_trait]
impl RemotePipelineClient for JsonRpcPipelineClient {
    async fn create_pipeline(&self) -> Result<PipelineId> {
        let id = self.create(jsonrpc::MEDIA_PIPELINE, json!({})).await?;
        debug!("Created media pipeline {}", id);
        Ok(PipelineId(id))
    }

    async fn create_endpoint(&self, pipeline: &PipelineId) -> Result<EndpointId> {
        let id = self
            .create(jsonrpc::WEBRTC_ENDPOINT, json!({ "mediaPipeline": pipeline.as_str() }))
            .await?;
        debug!("Created WebRTC endpoint {} in pipeline {}", id, pipeline);
        Ok(EndpointId(id))
    }

    async fn process_offer(&self, endpoint: &EndpointId, offer: &str) -> Result<String> {
        let result = self
            .invoke(endpoint.as_str(), "processOffer", json!({ "offer": offer }))
            .await?;
        jsonrpc::result_value_str(&result)
    }

    async fn add_ice_candidate(&self, endpoint: &EndpointId, candidate: &IceCandidate) -> Result<()> {
        self.invoke(
            endpoint.as_str(),
            "addIceCandidate",
            json!({ "candidate": jsonrpc::ice_candidate_param(candidate) }),
        )
        .await?;
        Ok(())
    }

    async fn subscribe_ice_candidates(&self, endpoint: &EndpointId) -> Result<()> {
        let result = self
            .call("subscribe", jsonrpc::subscribe_params(endpoint.as_str(), jsonrpc::ON_ICE_CANDIDATE))
            .await?;
        debug!("Subscribed to {} on {}: {}", jsonrpc::ON_ICE_CANDIDATE, endpoint, result);
        Ok(())
    }

    async fn gather_candidates(&self, endpoint: &EndpointId) -> Result<()> {
        self.invoke(endpoint.as_str(), "gatherCandidates", Value::Null).await?;
        Ok(())
    }

    async fn connect(&self, source: &EndpointId, sink: &EndpointId) -> Result<()> {
        self.invoke(source.as_str(), "connect", json!({ "sink": sink.as_str() }))
            .await?;
        Ok(())
    }

    async fn release(&self, pipeline: &PipelineId) -> Result<()> {
        self.call("release", jsonrpc::release_params(pipeline.as_str())).await?;
        debug!("Released media pipeline {}", pipeline);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    async fn close(&self) {
        if self.is_closed() {
            return;
        }
        debug!("Closing connection to {}", self.uri);
        // The writer task stops after flushing the close frame
        let _ = self.outbound.send(Message::Close(None));
        self.shared.shut_down();
    }
}

impl Drop for JsonRpcPipelineClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Opens [`JsonRpcPipelineClient`] connections
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PipelineConnector for WsConnector {
    async fn connect(&self, uri: &str, options: &ConnectOptions) -> Result<Arc<dyn RemotePipelineClient>> {
        let client = JsonRpcPipelineClient::connect(uri, options).await?;
        Ok(Arc::new(client))
    }
}
