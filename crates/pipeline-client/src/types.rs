//! Identifiers, ICE candidates and server events

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ClientError, Result};

/// Server-side id of a media pipeline
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PipelineId(pub String);

/// Server-side id of a WebRTC endpoint inside a pipeline
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EndpointId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(PipelineId);
string_id!(EndpointId);

/// One ICE candidate as exchanged over signaling.
///
/// This is the browser's `RTCIceCandidateInit` shape: the `candidate`
/// attribute line plus the media section it belongs to. Two candidates are
/// equal when all three fields are equal, which makes applying the same
/// candidate twice detectable.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, sdp_m_line_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_m_line_index,
        }
    }

    /// Parse the attribute line into its individual fields
    pub fn info(&self) -> Result<CandidateInfo> {
        self.candidate.parse()
    }

    /// An empty candidate line signals end-of-candidates
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.candidate)?;
        if let Some(mid) = &self.sdp_mid {
            write!(f, " (mid={})", mid)?;
        }
        Ok(())
    }
}

/// Transport protocol of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// Candidate type (RFC 8445 section 5.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl FromStr for CandidateType {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            other => Err(ClientError::protocol(format!("unknown candidate type '{}'", other))),
        }
    }
}

/// The fields of a `candidate:` attribute line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInfo {
    pub foundation: String,
    pub component: u16,
    pub protocol: TransportProtocol,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub kind: CandidateType,
}

impl FromStr for CandidateInfo {
    type Err = ClientError;

    /// Accepts `candidate:...` with or without a leading `a=`
    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let body = line
            .strip_prefix("candidate:")
            .ok_or_else(|| ClientError::protocol(format!("not a candidate line: '{}'", line)))?;

        let parts: Vec<&str> = body.split_whitespace().collect();
        if parts.len() < 8 || parts[6] != "typ" {
            return Err(ClientError::protocol(format!("malformed candidate: '{}'", line)));
        }

        let field = |name: &str, value: &str| ClientError::protocol(format!("invalid {} '{}' in candidate", name, value));

        let protocol = match parts[2].to_ascii_lowercase().as_str() {
            "udp" => TransportProtocol::Udp,
            "tcp" => TransportProtocol::Tcp,
            other => return Err(field("transport", other)),
        };

        Ok(Self {
            foundation: parts[0].to_string(),
            component: parts[1].parse().map_err(|_| field("component", parts[1]))?,
            protocol,
            priority: parts[3].parse().map_err(|_| field("priority", parts[3]))?,
            address: parts[4].to_string(),
            port: parts[5].parse().map_err(|_| field("port", parts[5]))?,
            kind: parts[7].parse()?,
        })
    }
}

/// Events pushed by the server outside of request/response pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// An endpoint discovered one of its own candidates (`OnIceCandidate`)
    IceCandidateFound { endpoint: EndpointId, candidate: IceCandidate },

    /// The connection to the server is gone
    ConnectionClosed,
}
