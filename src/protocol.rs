//! Telemetry wire protocol for the per-session WebSocket channel.
//!
//! All frames are JSON text. The client sends periodic pings carrying a
//! wrapping nonce; the server echoes the nonce back in a pong. Every other
//! JSON object the server sends is a full stats snapshot that replaces the
//! previous one.

use serde::Serialize;
use serde_json::Value;

/// Backend streaming session identifier. Opaque, assigned by the backend
/// on stream start.
pub type SessionId = u64;

/// Ping nonces wrap at this modulus.
pub const NONCE_MODULUS: u64 = 1_000_000_000;

/// The latest full telemetry payload for a session (bitrate, fps, dropped
/// frames, backend status, destination URL, ...). Kept verbatim as received;
/// each new snapshot replaces the previous one wholesale.
pub type StatsSnapshot = serde_json::Map<String, Value>;

/// Client-to-server telemetry messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Heartbeat. `client_time` is wall-clock epoch milliseconds at send.
    Ping { nonce: u64, client_time: u64 },
}

/// A classified inbound telemetry frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Pong reply; `nonce` echoes a previously sent ping's nonce.
    Pong { nonce: u64 },
    /// Anything else the server sends: a full stats snapshot.
    Stats(StatsSnapshot),
}

/// Classify an inbound text frame.
///
/// Returns `None` for anything that is not a JSON object, or a pong whose
/// nonce is missing or not an integer — malformed telemetry is dropped, not
/// surfaced. A JSON object without `"type": "pong"` is a stats snapshot.
pub fn parse_inbound(text: &str) -> Option<Inbound> {
    let value: Value = serde_json::from_str(text).ok()?;
    let Value::Object(obj) = value else {
        return None;
    };
    if obj.get("type").and_then(Value::as_str) == Some("pong") {
        let nonce = obj.get("nonce").and_then(Value::as_u64)?;
        return Some(Inbound::Pong { nonce });
    }
    Some(Inbound::Stats(obj))
}
