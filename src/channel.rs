//! Per-session telemetry channel.
//!
//! One WebSocket connection to `<ws-base>/ws/streams/{id}`, owned by a
//! spawned tokio task that:
//! - Connects (with optional Bearer token) and reports `connected`
//! - Runs a select! loop: heartbeat ping timer, incoming frames, shutdown
//! - Correlates pongs to the outstanding ping nonce and reports round-trip
//!   latency; treats every other JSON object as a full stats snapshot
//! - On any close path reports `disconnected`, clears latency, and lets
//!   the heartbeat timer die with the task
//!
//! There is no reconnect loop: a dropped channel stays disconnected until
//! a fresh attach creates a new channel.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{parse_inbound, ClientMessage, Inbound, SessionId, StatsSnapshot, NONCE_MODULUS};

/// Heartbeat ping period while a channel is open.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Connection state of a telemetry channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// What a channel can report back to the attachment manager.
#[derive(Debug, Clone)]
pub enum ChannelEventKind {
    StatusChanged(ChannelStatus),
    /// Round-trip time of the most recent matched ping/pong, in ms.
    LatencyMeasured(u64),
    /// Latency is no longer meaningful (channel closed).
    LatencyCleared,
    /// Full snapshot replacing any previous one.
    StatsUpdated(StatsSnapshot),
}

#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub session: SessionId,
    /// Stamp of the attach that created the emitting channel. The manager
    /// drops events whose generation no longer matches the live channel.
    pub generation: u64,
    pub kind: ChannelEventKind,
}

/// Handle to one telemetry channel task.
///
/// Construction is non-blocking: the task connects in the background and
/// the handle is usable immediately. `close()` is idempotent.
pub struct TelemetryChannel {
    session: SessionId,
    generation: u64,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl TelemetryChannel {
    /// Spawn the channel task for `session`, emitting events tagged with
    /// `generation` into `events`.
    pub fn open(
        session: SessionId,
        generation: u64,
        url: String,
        token: Option<String>,
        heartbeat: Duration,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(channel_loop(
            session,
            generation,
            url,
            token,
            heartbeat,
            events,
            shutdown_rx,
        ));
        Self {
            session,
            generation,
            shutdown_tx,
            task,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Request teardown: the task sends a close frame and exits, which
    /// also stops its heartbeat timer. Closing twice is a no-op.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the channel task to complete. Consumes the handle.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Advance the ping nonce, wrapping at [`NONCE_MODULUS`].
fn next_nonce(nonce: u64) -> u64 {
    (nonce + 1) % NONCE_MODULUS
}

fn emit(
    events: &mpsc::UnboundedSender<ChannelEvent>,
    session: SessionId,
    generation: u64,
    kind: ChannelEventKind,
) {
    let _ = events.send(ChannelEvent {
        session,
        generation,
        kind,
    });
}

async fn channel_loop(
    session: SessionId,
    generation: u64,
    url: String,
    token: Option<String>,
    heartbeat: Duration,
    events: mpsc::UnboundedSender<ChannelEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Build connection request with optional auth header.
    let connect_fut = async {
        if let Some(ref tok) = token {
            use tokio_tungstenite::tungstenite::http::Request;
            let host_authority = url
                .strip_prefix("wss://")
                .or_else(|| url.strip_prefix("ws://"))
                .unwrap_or(&url)
                .split('/')
                .next()
                .unwrap_or(&url)
                .to_string();
            let req = Request::builder()
                .uri(&url)
                .header("Authorization", format!("Bearer {}", tok))
                .header("Connection", "Upgrade")
                .header("Upgrade", "websocket")
                .header("Sec-WebSocket-Version", "13")
                .header(
                    "Sec-WebSocket-Key",
                    tokio_tungstenite::tungstenite::handshake::client::generate_key(),
                )
                .header("Host", &host_authority)
                .body(())
                .unwrap();
            tokio_tungstenite::connect_async(req).await
        } else {
            tokio_tungstenite::connect_async(&url).await
        }
    };

    let connect_result = tokio::select! {
        result = connect_fut => result,
        _ = shutdown_rx.changed() => {
            emit(&events, session, generation, ChannelEventKind::StatusChanged(ChannelStatus::Disconnected));
            emit(&events, session, generation, ChannelEventKind::LatencyCleared);
            return;
        }
    };

    let ws_stream = match connect_result {
        Ok((ws_stream, _)) => {
            tracing::debug!(session, "telemetry channel connected");
            emit(
                &events,
                session,
                generation,
                ChannelEventKind::StatusChanged(ChannelStatus::Connected),
            );
            ws_stream
        }
        Err(e) => {
            tracing::debug!(session, error = %e, "telemetry channel connect failed");
            emit(
                &events,
                session,
                generation,
                ChannelEventKind::StatusChanged(ChannelStatus::Disconnected),
            );
            emit(&events, session, generation, ChannelEventKind::LatencyCleared);
            return;
        }
    };

    let (mut sink, mut stream) = ws_stream.split();
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await; // Skip the first immediate tick.

    let mut nonce: u64 = 0;
    // The one ping awaiting a pong: (nonce, send instant). Consumed on
    // match so a duplicated pong cannot re-measure; a mismatched nonce is
    // a stale reply from a previous heartbeat and is ignored.
    let mut outstanding: Option<(u64, Instant)> = None;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match parse_inbound(text.as_str()) {
                            Some(Inbound::Pong { nonce: reply }) => {
                                match outstanding {
                                    Some((expected, sent_at)) if expected == reply => {
                                        outstanding = None;
                                        let rtt = sent_at.elapsed().as_millis() as u64;
                                        emit(&events, session, generation, ChannelEventKind::LatencyMeasured(rtt));
                                    }
                                    _ => {
                                        tracing::trace!(session, reply, "stale pong ignored");
                                    }
                                }
                            }
                            Some(Inbound::Stats(snapshot)) => {
                                emit(&events, session, generation, ChannelEventKind::StatsUpdated(snapshot));
                            }
                            None => {
                                tracing::trace!(session, "malformed telemetry frame dropped");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Binary frames are not part of the contract.
                    Some(Err(_)) => break,
                }
            }
            _ = ticker.tick() => {
                nonce = next_nonce(nonce);
                let sent_at = Instant::now();
                let client_time = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                let ping = ClientMessage::Ping { nonce, client_time };
                let text = match serde_json::to_string(&ping) {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                // The connection may have died between the tick and this
                // send; a failed send exits the loop instead of panicking.
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                outstanding = Some((nonce, sent_at));
            }
            _ = shutdown_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    tracing::debug!(session, "telemetry channel closed");
    emit(
        &events,
        session,
        generation,
        ChannelEventKind::StatusChanged(ChannelStatus::Disconnected),
    );
    emit(&events, session, generation, ChannelEventKind::LatencyCleared);
}
