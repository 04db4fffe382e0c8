//! Wire encodings for the SNI routing table and the control protocol.
//!
//! The blob-store payload and the control messages are JSON: self-describing,
//! stable across restarts, and the same bytes decode to the same map
//! indefinitely. An empty payload decodes to an empty map so a freshly
//! initialized device needs no special casing.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The catch-all routing key used when a client's SNI is absent or unknown.
pub const DEFAULT_KEY: &str = "default";

/// A backend address: an IP literal and a TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAddr {
    pub host: IpAddr,
    pub port: u16,
}

/// The SNI routing table. Keys are lowercased domain names or [`DEFAULT_KEY`].
pub type SniMap = BTreeMap<String, BackendAddr>;

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
}

/// Normalize an SNI name for map keys and lookups: lowercase, trailing dot
/// trimmed. The literal `"default"` normalizes to itself.
pub fn normalize_sni(name: &str) -> String {
    name.to_lowercase().trim_end_matches('.').to_string()
}

/// Encode the SNI map into the blob-store payload.
pub fn encode_data(map: &SniMap) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(map).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a blob-store payload into the SNI map. Empty input is the empty map.
pub fn decode_data(bytes: &[u8]) -> Result<SniMap, CodecError> {
    if bytes.is_empty() {
        return Ok(SniMap::new());
    }
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// A control-channel request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Insert or overwrite a routing entry and persist the table.
    Add {
        sni: String,
        host: IpAddr,
        port: u16,
    },
    /// Delete a routing entry (no-op when absent) and persist the table.
    Remove { sni: String },
    /// Return the current routing table. No state change.
    List,
}

/// One row of a `List` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SniEntry {
    pub sni: String,
    pub host: IpAddr,
    pub port: u16,
}

/// A control-channel response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    /// Outcome of a mutation: `code` 0 on success, >= 1 on failure.
    Result { code: u32, message: String },
    /// The routing table, in response to `List`.
    Snis { entries: Vec<SniEntry> },
}

impl Reply {
    pub fn ok(message: impl Into<String>) -> Self {
        Reply::Result {
            code: 0,
            message: message.into(),
        }
    }

    pub fn failure(code: u32, message: impl Into<String>) -> Self {
        Reply::Result {
            code,
            message: message.into(),
        }
    }
}

/// Encode a control command.
pub fn cmd_to_bytes(cmd: &Command) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(cmd).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a control command. Unknown tags and malformed fields error.
pub fn cmd_of_bytes(bytes: &[u8]) -> Result<Command, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Encode a control reply.
pub fn reply_to_bytes(reply: &Reply) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(reply).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a control reply.
pub fn reply_of_bytes(bytes: &[u8]) -> Result<Reply, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
