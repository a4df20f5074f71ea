//! JSON-RPC 2.0 framing and the pipeline server's parameter shapes

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ClientError, Result};
use crate::types::{EndpointId, IceCandidate, PipelineEvent};

pub const JSONRPC_VERSION: &str = "2.0";

/// Server-side object types
pub const MEDIA_PIPELINE: &str = "MediaPipeline";
pub const WEBRTC_ENDPOINT: &str = "WebRtcEndpoint";

/// Event type emitted when an endpoint discovers a candidate
pub const ON_ICE_CANDIDATE: &str = "OnIceCandidate";

/// An outgoing request
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Error object of a failed response
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        ClientError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// A decoded incoming frame
#[derive(Debug)]
pub enum Frame {
    Response { id: u64, outcome: std::result::Result<Value, RpcError> },
    Notification { method: String, params: Value },
}

/// Decode one text frame from the server
pub fn decode(text: &str) -> Result<Frame> {
    let raw: RawFrame = serde_json::from_str(text)?;

    if let Some(method) = raw.method {
        // Requests from the server carry an id too; they are handled the same way
        return Ok(Frame::Notification {
            method,
            params: raw.params.unwrap_or(Value::Null),
        });
    }

    let id = raw
        .id
        .as_ref()
        .and_then(response_id)
        .ok_or_else(|| ClientError::protocol(format!("response without usable id: {}", text)))?;

    let outcome = match (raw.result, raw.error) {
        (_, Some(error)) => Err(error),
        (Some(result), None) => Ok(result),
        (None, None) => Ok(Value::Null),
    };

    Ok(Frame::Response { id, outcome })
}

fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Add the server's session id to request parameters
pub fn with_session(mut params: Value, session_id: Option<&str>) -> Value {
    if let (Some(session_id), Value::Object(map)) = (session_id, &mut params) {
        map.insert("sessionId".to_string(), Value::String(session_id.to_string()));
    }
    params
}

pub fn create_params(object_type: &str, constructor_params: Value) -> Value {
    json!({
        "type": object_type,
        "constructorParams": constructor_params,
        "properties": {},
    })
}

pub fn invoke_params(object: &str, operation: &str, operation_params: Value) -> Value {
    let mut params = Map::new();
    params.insert("object".to_string(), Value::String(object.to_string()));
    params.insert("operation".to_string(), Value::String(operation.to_string()));
    if !operation_params.is_null() {
        params.insert("operationParams".to_string(), operation_params);
    }
    Value::Object(params)
}

pub fn subscribe_params(object: &str, event_type: &str) -> Value {
    json!({ "object": object, "type": event_type })
}

pub fn release_params(object: &str) -> Value {
    json!({ "object": object })
}

/// Wrap a candidate into the server's `IceCandidate` complex type
pub fn ice_candidate_param(candidate: &IceCandidate) -> Value {
    json!({
        "__module__": "kurento",
        "__type__": "IceCandidate",
        "candidate": candidate.candidate,
        "sdpMid": candidate.sdp_mid,
        "sdpMLineIndex": candidate.sdp_m_line_index,
    })
}

/// The `value` member of a result, as a string
pub fn result_value_str(result: &Value) -> Result<String> {
    result
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::protocol(format!("result without string value: {}", result)))
}

/// Server session id carried in a result, if any
pub fn result_session_id(result: &Value) -> Option<&str> {
    result.get("sessionId").and_then(Value::as_str)
}

/// Turn an `onEvent` notification into a [`PipelineEvent`].
///
/// Returns `Ok(None)` for event types this client does not model.
pub fn parse_event(params: &Value) -> Result<Option<PipelineEvent>> {
    let value = params.get("value").unwrap_or(params);
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::protocol("event without type"))?;

    if event_type != ON_ICE_CANDIDATE {
        return Ok(None);
    }

    let data = value.get("data").unwrap_or(&Value::Null);
    let source = data
        .get("source")
        .or_else(|| value.get("object"))
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::protocol("OnIceCandidate without source"))?;
    let candidate: IceCandidate = serde_json::from_value(
        data.get("candidate")
            .cloned()
            .ok_or_else(|| ClientError::protocol("OnIceCandidate without candidate"))?,
    )?;

    Ok(Some(PipelineEvent::IceCandidateFound {
        endpoint: EndpointId::from(source),
        candidate,
    }))
}
