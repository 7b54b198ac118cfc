//! Attachment manager: the lifecycle authority for telemetry channels.
//!
//! Maintains exactly one live [`TelemetryChannel`] per attached session,
//! exposes an observable mapping of session id to [`AttachmentRecord`],
//! and keeps the persisted attachment set equal to the live channel set on
//! every mutation. Channels report back through an event queue; a single
//! pump task is the only writer of records, so updates apply in arrival
//! order without further coordination.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

use crate::api::{ApiClient, ApiError, StartStreamRequest};
use crate::channel::{
    ChannelEvent, ChannelEventKind, ChannelStatus, TelemetryChannel, HEARTBEAT_INTERVAL,
};
use crate::protocol::{SessionId, StatsSnapshot};
use crate::registry::SessionRegistry;
use crate::store::AttachmentStore;

/// Observable state of one attached session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttachmentRecord {
    pub status: ChannelStatus,
    /// Most recent measured round-trip time in ms; `None` until the first
    /// pong and again after disconnect.
    pub latency_ms: Option<u64>,
    /// Latest stats snapshot, replaced wholesale on each update.
    pub stats: StatsSnapshot,
}

impl AttachmentRecord {
    fn connecting() -> Self {
        Self {
            status: ChannelStatus::Connecting,
            latency_ms: None,
            stats: StatsSnapshot::new(),
        }
    }
}

struct Attachment {
    generation: u64,
    channel: TelemetryChannel,
    record: AttachmentRecord,
}

struct ManagerInner {
    api: ApiClient,
    registry: SessionRegistry,
    store: Box<dyn AttachmentStore>,
    attachments: RwLock<HashMap<SessionId, Attachment>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    updates_tx: broadcast::Sender<SessionId>,
    restored: AtomicBool,
    next_generation: AtomicU64,
    heartbeat: Duration,
}

impl ManagerInner {
    /// Apply one channel event to its record. Events for sessions that are
    /// no longer attached, or stamped by a superseded channel generation,
    /// are dropped — a late disconnect from a closed channel must not
    /// clobber the record of a re-attached session.
    fn apply(&self, event: ChannelEvent) {
        let mut attachments = self.attachments.write();
        let Some(att) = attachments.get_mut(&event.session) else {
            return;
        };
        if att.generation != event.generation {
            return;
        }
        match event.kind {
            ChannelEventKind::StatusChanged(status) => {
                att.record.status = status;
                if status == ChannelStatus::Disconnected {
                    att.record.latency_ms = None;
                }
            }
            ChannelEventKind::LatencyMeasured(ms) => att.record.latency_ms = Some(ms),
            ChannelEventKind::LatencyCleared => att.record.latency_ms = None,
            ChannelEventKind::StatsUpdated(stats) => att.record.stats = stats,
        }
        drop(attachments);
        let _ = self.updates_tx.send(event.session);
    }

    /// Rewrite the persisted set from the current attachment keys. Called
    /// with the write lock held so the store always sees mutations in
    /// order. A failed write is logged, not fatal: the in-memory channels
    /// stay authoritative for this process.
    fn persist(&self, attachments: &HashMap<SessionId, Attachment>) {
        let ids: BTreeSet<SessionId> = attachments.keys().copied().collect();
        if let Err(e) = self.store.save(&ids) {
            tracing::warn!(error = %e, "failed to persist attachment set");
        }
    }
}

/// Owns all telemetry channels and their records.
///
/// Cheap to clone; all clones share state. Must be kept alive for the
/// lifetime of the process so the pump task and channel tasks are not
/// orphaned.
#[derive(Clone)]
pub struct AttachmentManager {
    inner: Arc<ManagerInner>,
}

impl AttachmentManager {
    pub fn new(
        api: ApiClient,
        registry: SessionRegistry,
        store: Box<dyn AttachmentStore>,
    ) -> Self {
        Self::with_heartbeat(api, registry, store, HEARTBEAT_INTERVAL)
    }

    /// Like [`AttachmentManager::new`] with an explicit heartbeat period.
    /// Tests drive heartbeats at millisecond scale through this.
    pub fn with_heartbeat(
        api: ApiClient,
        registry: SessionRegistry,
        store: Box<dyn AttachmentStore>,
        heartbeat: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates_tx, _) = broadcast::channel(64);
        let inner = Arc::new(ManagerInner {
            api,
            registry,
            store,
            attachments: RwLock::new(HashMap::new()),
            events_tx,
            updates_tx,
            restored: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
            heartbeat,
        });
        spawn_pump(Arc::downgrade(&inner), events_rx);
        Self { inner }
    }

    /// Open a telemetry channel for `id` and seed its record as
    /// connecting. No-op if already attached: rapid repeated attaches
    /// produce exactly one channel. Returns whether a channel was created.
    pub fn attach(&self, id: SessionId) -> bool {
        let inner = &self.inner;
        let mut attachments = inner.attachments.write();
        if attachments.contains_key(&id) {
            return false;
        }
        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let channel = TelemetryChannel::open(
            id,
            generation,
            inner.api.ws_url_for(id),
            inner.api.token().map(String::from),
            inner.heartbeat,
            inner.events_tx.clone(),
        );
        attachments.insert(
            id,
            Attachment {
                generation,
                channel,
                record: AttachmentRecord::connecting(),
            },
        );
        inner.persist(&attachments);
        drop(attachments);
        tracing::debug!(session = id, "attached");
        let _ = inner.updates_tx.send(id);
        true
    }

    /// Close the channel for `id`, drop its record, and rewrite the
    /// persisted set. No-op if not attached.
    pub fn detach(&self, id: SessionId) -> bool {
        let inner = &self.inner;
        let mut attachments = inner.attachments.write();
        let Some(att) = attachments.remove(&id) else {
            return false;
        };
        att.channel.close();
        inner.persist(&attachments);
        drop(attachments);
        tracing::debug!(session = id, "detached");
        let _ = inner.updates_tx.send(id);
        true
    }

    /// Ask the backend to stop the session, then detach locally whether or
    /// not the stop succeeded — the operator always gets to stop watching,
    /// even when the backend call fails. Finishes with a best-effort
    /// refresh of the active-session registry. The stop outcome is
    /// returned so the caller can surface a distinct warning.
    pub async fn stop_and_detach(&self, id: SessionId) -> Result<(), ApiError> {
        let result = self.inner.api.stop_stream(id).await;
        if let Err(ref e) = result {
            tracing::warn!(session = id, error = %e, "backend stop failed, detaching locally anyway");
        }
        self.detach(id);
        if let Err(e) = self.inner.registry.refresh(&self.inner.api).await {
            tracing::debug!(error = %e, "active-session refresh failed");
        }
        result
    }

    /// Replay the persisted attachment set: one `attach` per stored id.
    /// Runs at most once per manager; later calls return 0. Returns the
    /// number of ids in the persisted set.
    pub fn restore_on_load(&self) -> usize {
        if self.inner.restored.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let ids = match self.inner.store.load() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load persisted attachment set");
                return 0;
            }
        };
        for &id in &ids {
            self.attach(id);
        }
        ids.len()
    }

    /// Start a new streaming session on the backend and attach to it. The
    /// only path that both creates a backend session and begins observing
    /// it; `attach` alone never starts a stream.
    pub async fn start_streaming(&self, req: StartStreamRequest) -> Result<SessionId, ApiError> {
        let started = self.inner.api.start_stream(&req).await?;
        self.attach(started.id);
        Ok(started.id)
    }

    /// Close every channel without touching records or the persisted set.
    /// Used on process exit so a later run can restore the same set.
    pub fn shutdown_all(&self) {
        let attachments = self.inner.attachments.read();
        for att in attachments.values() {
            att.channel.close();
        }
    }

    pub fn is_attached(&self, id: SessionId) -> bool {
        self.inner.attachments.read().contains_key(&id)
    }

    pub fn attached_ids(&self) -> BTreeSet<SessionId> {
        self.inner.attachments.read().keys().copied().collect()
    }

    pub fn record(&self, id: SessionId) -> Option<AttachmentRecord> {
        self.inner
            .attachments
            .read()
            .get(&id)
            .map(|att| att.record.clone())
    }

    /// Snapshot of the whole observable mapping, ordered by session id.
    pub fn snapshot(&self) -> BTreeMap<SessionId, AttachmentRecord> {
        self.inner
            .attachments
            .read()
            .iter()
            .map(|(id, att)| (*id, att.record.clone()))
            .collect()
    }

    /// Subscribe to change notifications: the id of each session whose
    /// record was touched. Lagging receivers miss ids, not correctness —
    /// re-read via [`AttachmentManager::snapshot`].
    pub fn subscribe(&self) -> broadcast::Receiver<SessionId> {
        self.inner.updates_tx.subscribe()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }
}

/// The single writer of attachment records: drains channel events in
/// arrival order for the life of the manager.
fn spawn_pump(inner: Weak<ManagerInner>, mut events_rx: mpsc::UnboundedReceiver<ChannelEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.apply(event);
        }
    });
}
