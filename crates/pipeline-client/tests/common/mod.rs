//! A scripted media pipeline server for exercising the WebSocket client

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

pub const ANSWER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=loopback\r\nt=0 0\r\n";
pub const SERVER_SESSION: &str = "srv-session-1";
pub const REMOTE_CANDIDATE: &str = "candidate:1 1 UDP 2013266431 10.0.0.5 40000 typ host";

/// Route crate logs to the test output; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the server reacts to one kind of request
#[derive(Debug, Clone)]
pub enum Reply {
    /// Normal scripted answer
    Script,
    /// JSON-RPC error object
    Error { code: i64, message: String },
    /// Never answer
    Silent,
    /// Close the socket instead of answering
    Hangup,
}

/// Requests are keyed as `method` or `invoke:<operation>`
#[derive(Debug, Clone, Default)]
pub struct ServerScript {
    overrides: HashMap<String, Reply>,
}

impl ServerScript {
    pub fn with(mut self, key: &str, reply: Reply) -> Self {
        self.overrides.insert(key.to_string(), reply);
        self
    }

    fn reply_for(&self, key: &str) -> Reply {
        self.overrides.get(key).cloned().unwrap_or(Reply::Script)
    }
}

pub struct FakeMediaServer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeMediaServer {
    pub async fn start(script: ServerScript) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let (mut sink, mut source) = ws.split();

            while let Some(Ok(message)) = source.next().await {
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let request: Value = serde_json::from_str(&text).unwrap();
                recorded.lock().await.push(request.clone());

                let id = request["id"].clone();
                let method = request["method"].as_str().unwrap_or_default().to_string();
                let params = request["params"].clone();
                let key = match method.as_str() {
                    "invoke" => format!("invoke:{}", params["operation"].as_str().unwrap_or_default()),
                    "create" => format!("create:{}", params["type"].as_str().unwrap_or_default()),
                    other => other.to_string(),
                };

                let result = match script.reply_for(&key) {
                    Reply::Silent => continue,
                    Reply::Hangup => {
                        let _ = sink.close().await;
                        return;
                    }
                    Reply::Error { code, message } => {
                        let frame = json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}});
                        sink.send(Message::Text(frame.to_string())).await.unwrap();
                        continue;
                    }
                    Reply::Script => scripted_result(&key, &params),
                };

                let frame = json!({"jsonrpc": "2.0", "id": id, "result": result});
                sink.send(Message::Text(frame.to_string())).await.unwrap();

                if key == "invoke:gatherCandidates" {
                    let endpoint = params["object"].as_str().unwrap_or_default();
                    sink.send(Message::Text(on_ice_candidate(endpoint).to_string()))
                        .await
                        .unwrap();
                }
            }
        });

        Self { addr, requests }
    }

    pub fn uri(&self) -> String {
        format!("ws://{}/kurento", self.addr)
    }

    pub async fn requests(&self) -> Vec<Value> {
        self.requests.lock().await.clone()
    }
}

fn scripted_result(key: &str, _params: &Value) -> Value {
    let value = match key {
        "create:MediaPipeline" => json!("pipeline-1"),
        "create:WebRtcEndpoint" => json!("pipeline-1/endpoint-1"),
        "invoke:processOffer" => json!(ANSWER_SDP),
        "subscribe" => json!("subscription-1"),
        "ping" => json!("pong"),
        _ => Value::Null,
    };
    if value.is_null() {
        json!({ "sessionId": SERVER_SESSION })
    } else {
        json!({ "value": value, "sessionId": SERVER_SESSION })
    }
}

pub fn on_ice_candidate(endpoint: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "onEvent",
        "params": {
            "value": {
                "data": {
                    "candidate": {
                        "__module__": "kurento",
                        "__type__": "IceCandidate",
                        "candidate": REMOTE_CANDIDATE,
                        "sdpMid": "0",
                        "sdpMLineIndex": 0
                    },
                    "source": endpoint,
                    "tags": [],
                    "type": "OnIceCandidate"
                },
                "object": endpoint,
                "type": "OnIceCandidate"
            }
        }
    })
}
