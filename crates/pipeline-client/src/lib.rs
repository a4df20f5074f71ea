//! Client side of the remote media pipeline protocol.
//!
//! A media pipeline server exposes server-side objects (pipelines and the
//! WebRTC endpoints inside them) through JSON-RPC 2.0 over a WebSocket.
//! This crate models that surface as the [`RemotePipelineClient`] capability
//! trait and ships [`JsonRpcPipelineClient`], the concrete WebSocket client.
//!
//! ```no_run
//! use loopback_pipeline_client::{ConnectOptions, JsonRpcPipelineClient, RemotePipelineClient};
//!
//! # async fn demo() -> loopback_pipeline_client::Result<()> {
//! let client = JsonRpcPipelineClient::connect("ws://localhost:8888/kurento", &ConnectOptions::default()).await?;
//! let pipeline = client.create_pipeline().await?;
//! let endpoint = client.create_endpoint(&pipeline).await?;
//! let answer = client.process_offer(&endpoint, "v=0\r\n...").await?;
//! client.release(&pipeline).await?;
//! # let _ = answer;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod jsonrpc;
pub mod types;
pub mod ws;

pub use client::{ConnectOptions, PipelineConnector, RemotePipelineClient};
pub use error::{ClientError, Result};
pub use types::{CandidateInfo, CandidateType, EndpointId, IceCandidate, PipelineEvent, PipelineId, TransportProtocol};
pub use ws::{JsonRpcPipelineClient, WsConnector};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        ClientError, ConnectOptions, EndpointId, IceCandidate, JsonRpcPipelineClient, PipelineConnector,
        PipelineEvent, PipelineId, RemotePipelineClient, Result, WsConnector,
    };
}
