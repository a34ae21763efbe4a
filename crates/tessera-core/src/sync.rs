//! Optimistic state with debounced, rollback-capable commits.
//!
//! Each resource keeps two values: the authoritative payload, which only
//! changes when the durable store confirms a write, and the local view, which
//! takes every patch immediately. Every optimistic patch records the snapshot
//! that preceded it; a failed commit restores that snapshot.
//!
//! Commits for one resource are queued to a per-resource writer task, so at
//! most one write per resource is in flight and writes land in the order they
//! become due. Debounced commits share one timer per resource: a new request
//! aborts the pending timer and starts a fresh one, and the quiet window
//! reaches the store as one combined patch under the last mutation's ID.

use crate::connection::{now_millis, ResourceId};
use crate::patch;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Client-chosen mutation identifier.
pub type MutationId = String;

/// Default quiet period before a debounced commit is written.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(1000);

/// Default time after which an unanswered write counts as failed.
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Durable store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store refused the write.
    #[error("store rejected write: {0}")]
    Rejected(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Writes patches to durable storage.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Persist a patch for a resource.
    async fn persist(&self, resource_id: &str, patch: &Value) -> Result<(), StoreError>;
}

/// Sync coordinator errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The resource was never loaded.
    #[error("Unknown resource: {0}")]
    UnknownResource(ResourceId),

    /// The resource cannot be reloaded while mutations are pending.
    #[error("Resource {0} has pending mutations")]
    Busy(ResourceId),

    /// A mutation with this ID is already pending or committing.
    #[error("Mutation already pending: {0}")]
    DuplicateMutation(MutationId),

    /// The mutation was applied with a different patch.
    #[error("Mutation {0} was applied with a different patch")]
    PatchMismatch(MutationId),

    /// The store failed the write. The mutation was rolled back.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The store did not answer in time. The mutation was rolled back.
    #[error("Commit timed out after {0:?}")]
    Timeout(Duration),

    /// The transport gave up reconnecting. The mutation was rolled back.
    #[error("Commit dropped after the transport retry budget was exhausted")]
    Dropped,

    /// A later debounced commit replaced this one before it was written.
    #[error("Superseded by mutation {0}")]
    Superseded(MutationId),

    /// An earlier mutation this one was built on was rolled back.
    #[error("Cancelled: mutation {0} was rolled back")]
    Cancelled(MutationId),

    /// The commit was abandoned without an outcome.
    #[error("Commit outcome lost")]
    Abandoned,
}

impl SyncError {
    /// Check if this error restored a rollback snapshot.
    #[must_use]
    pub fn rolled_back(&self) -> bool {
        matches!(
            self,
            SyncError::Store(_) | SyncError::Timeout(_) | SyncError::Dropped
        )
    }
}

/// How a commit reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Write as soon as the resource's commit lock is free.
    Immediate,
    /// Write after the quiet period, unless superseded first.
    Debounced,
}

/// Whether commits can currently reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Commits are written.
    Online,
    /// Commits wait for the link to come back.
    Offline,
    /// The transport gave up; waiting commits are dropped.
    Exhausted,
}

/// Sync coordinator configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period for debounced commits.
    pub debounce_window: Duration,
    /// Time after which an unanswered write counts as failed.
    pub commit_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        }
    }
}

/// Authoritative state of a resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharedState {
    /// Resource ID.
    pub resource_id: ResourceId,
    /// Payload as confirmed by the store.
    pub payload: Value,
    /// Number of committed mutations since load.
    pub version: u64,
    /// Last change in milliseconds since the Unix epoch.
    pub updated_at: u64,
}

/// A successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// Committed mutation.
    pub mutation_id: MutationId,
    /// Authoritative version after the commit.
    pub version: u64,
}

type Outcome = Result<Committed, SyncError>;

/// Resolves once a commit is written, rolled back, or superseded.
#[derive(Debug)]
pub struct CommitTicket {
    mutation_id: MutationId,
    rx: oneshot::Receiver<Outcome>,
}

impl CommitTicket {
    /// The mutation this ticket tracks.
    #[must_use]
    pub fn mutation_id(&self) -> &str {
        &self.mutation_id
    }

    /// Wait for the commit outcome.
    ///
    /// # Errors
    ///
    /// Returns the reason the mutation was not committed. A lost outcome is
    /// reported as [`SyncError::Abandoned`].
    pub async fn outcome(self) -> Outcome {
        self.rx.await.unwrap_or(Err(SyncError::Abandoned))
    }
}

struct PendingMutation {
    seq: u64,
    mutation_id: MutationId,
    /// Patch as applied to the local view.
    applied: Value,
    /// Patch to write: `applied` plus patches folded in by supersede and
    /// rebase.
    patch: Value,
    issued_at: u64,
    deadline: Option<Instant>,
    /// Local view before the earliest unwritten patch this mutation covers.
    snapshot: Value,
    /// Sequence number of the mutation `snapshot` was captured for.
    base_seq: u64,
    committing: bool,
    notify: Option<oneshot::Sender<Outcome>>,
}

impl PendingMutation {
    fn resolve(mut self, outcome: Outcome) {
        if let Some(tx) = self.notify.take() {
            let _ = tx.send(outcome);
        }
    }
}

struct DebounceEntry {
    seq: u64,
    handle: JoinHandle<()>,
}

struct ResourceSlot {
    state: SharedState,
    local: Value,
    pending: Vec<PendingMutation>,
    debounce: Option<DebounceEntry>,
    queue: Option<mpsc::UnboundedSender<u64>>,
}

impl ResourceSlot {
    fn new(resource_id: ResourceId, payload: Value) -> Self {
        Self {
            local: payload.clone(),
            state: SharedState {
                resource_id,
                payload,
                version: 0,
                updated_at: now_millis(),
            },
            pending: Vec::new(),
            debounce: None,
            queue: None,
        }
    }

    fn position(&self, mutation_id: &str) -> Option<usize> {
        self.pending.iter().position(|p| p.mutation_id == mutation_id)
    }

    fn take(&mut self, seq: u64) -> Option<PendingMutation> {
        let idx = self.pending.iter().position(|p| p.seq == seq)?;
        Some(self.pending.remove(idx))
    }

    fn apply(&mut self, seq: u64, mutation_id: MutationId, patch: Value) -> Value {
        let snapshot = self.local.clone();
        patch::merge(&mut self.local, &patch);
        self.pending.push(PendingMutation {
            seq,
            mutation_id,
            applied: patch.clone(),
            patch,
            issued_at: now_millis(),
            deadline: None,
            snapshot: snapshot.clone(),
            base_seq: seq,
            committing: false,
            notify: None,
        });
        snapshot
    }

    /// Replace the debounced mutation `old` with `new`.
    ///
    /// The window rolls back as a unit, so `new` inherits the earlier of the
    /// two snapshots. Its patch becomes the composition of everything applied
    /// from `old` through `new`, so the write reproduces the local view.
    fn supersede(&mut self, old: u64, new: u64) {
        let Some(replaced) = self.take(old) else {
            return;
        };
        let mut combined = replaced.patch.clone();
        for between in self.pending.iter().filter(|p| p.seq > old && p.seq < new) {
            patch::compose(&mut combined, &between.patch);
        }
        let new_id = match self.pending.iter_mut().find(|p| p.seq == new) {
            Some(next) => {
                patch::compose(&mut combined, &next.patch);
                next.patch = combined;
                if replaced.base_seq < next.base_seq {
                    next.snapshot = replaced.snapshot.clone();
                    next.base_seq = replaced.base_seq;
                }
                next.mutation_id.clone()
            }
            None => return,
        };
        debug!(
            resource = %self.state.resource_id,
            superseded = %replaced.mutation_id,
            by = %new_id,
            "Debounced commit superseded"
        );
        replaced.resolve(Err(SyncError::Superseded(new_id)));
    }
}

struct Inner {
    slots: DashMap<ResourceId, ResourceSlot>,
    store: Arc<dyn DurableStore>,
    config: SyncConfig,
    link: watch::Sender<LinkStatus>,
    next_seq: AtomicU64,
}

/// Applies optimistic mutations and reconciles them with durable storage.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Create a coordinator with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self::with_config(store, SyncConfig::default())
    }

    /// Create a coordinator with custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn DurableStore>, config: SyncConfig) -> Self {
        info!("Creating sync coordinator with config: {:?}", config);
        let (link, _) = watch::channel(LinkStatus::Online);
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                store,
                config,
                link,
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Seed a resource with its persisted payload.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Busy`] if mutations are pending for the resource.
    pub fn load(&self, resource_id: impl Into<ResourceId>, payload: Value) -> Result<(), SyncError> {
        let resource_id = resource_id.into();
        if let Some(slot) = self.inner.slots.get(&resource_id) {
            if !slot.pending.is_empty() {
                return Err(SyncError::Busy(resource_id));
            }
        }
        debug!(resource = %resource_id, "Loaded resource state");
        self.inner
            .slots
            .insert(resource_id.clone(), ResourceSlot::new(resource_id, payload));
        Ok(())
    }

    /// Authoritative state of a resource.
    #[must_use]
    pub fn state(&self, resource_id: &str) -> Option<SharedState> {
        self.inner.slots.get(resource_id).map(|s| s.state.clone())
    }

    /// Local optimistic view of a resource.
    #[must_use]
    pub fn local(&self, resource_id: &str) -> Option<Value> {
        self.inner.slots.get(resource_id).map(|s| s.local.clone())
    }

    /// IDs of the unresolved mutations of a resource, oldest first.
    #[must_use]
    pub fn pending(&self, resource_id: &str) -> Vec<MutationId> {
        self.inner
            .slots
            .get(resource_id)
            .map(|s| s.pending.iter().map(|p| p.mutation_id.clone()).collect())
            .unwrap_or_default()
    }

    /// When the resource's debounce timer fires, if one is armed.
    #[must_use]
    pub fn debounce_deadline(&self, resource_id: &str) -> Option<Instant> {
        let slot = self.inner.slots.get(resource_id)?;
        let seq = slot.debounce.as_ref()?.seq;
        slot.pending
            .iter()
            .find(|p| p.seq == seq)
            .and_then(|p| p.deadline)
    }

    /// When a pending mutation was issued, in milliseconds since the epoch.
    #[must_use]
    pub fn issued_at(&self, resource_id: &str, mutation_id: &str) -> Option<u64> {
        let slot = self.inner.slots.get(resource_id)?;
        let idx = slot.position(mutation_id)?;
        Some(slot.pending[idx].issued_at)
    }

    /// Current link status.
    #[must_use]
    pub fn link(&self) -> LinkStatus {
        *self.inner.link.borrow()
    }

    /// Update the link status.
    ///
    /// `Offline` holds commits back, `Online` releases them and `Exhausted`
    /// drops every waiting commit.
    pub fn set_link(&self, status: LinkStatus) {
        let previous = self.inner.link.send_replace(status);
        if previous != status {
            info!(from = ?previous, to = ?status, "Sync link status changed");
        }
    }

    /// Apply a patch to the local view.
    ///
    /// Returns the snapshot the patch was applied to.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource is unknown or the mutation ID is
    /// already pending.
    pub fn apply_optimistic(
        &self,
        resource_id: &str,
        mutation_id: impl Into<MutationId>,
        patch: Value,
    ) -> Result<Value, SyncError> {
        let mutation_id = mutation_id.into();
        let mut slot = self
            .inner
            .slots
            .get_mut(resource_id)
            .ok_or_else(|| SyncError::UnknownResource(resource_id.to_string()))?;

        if slot.position(&mutation_id).is_some() {
            return Err(SyncError::DuplicateMutation(mutation_id));
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        Ok(slot.apply(seq, mutation_id, patch))
    }

    /// Request a durable write for a mutation.
    ///
    /// A mutation that was not applied optimistically yet is applied first.
    /// The returned ticket resolves once the write lands, fails, or is
    /// superseded; the local view is never blocked on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource is unknown or the mutation is
    /// already committing.
    pub fn commit(
        &self,
        resource_id: &str,
        mutation_id: impl Into<MutationId>,
        patch: Value,
        mode: CommitMode,
    ) -> Result<CommitTicket, SyncError> {
        let mutation_id = mutation_id.into();
        let mut slot = self
            .inner
            .slots
            .get_mut(resource_id)
            .ok_or_else(|| SyncError::UnknownResource(resource_id.to_string()))?;

        let idx = match slot.position(&mutation_id) {
            Some(idx) => idx,
            None => {
                let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
                slot.apply(seq, mutation_id.clone(), patch.clone());
                slot.pending.len() - 1
            }
        };

        let (tx, rx) = oneshot::channel();
        let pending = &mut slot.pending[idx];
        if pending.committing {
            return Err(SyncError::DuplicateMutation(mutation_id));
        }
        if pending.applied != patch {
            return Err(SyncError::PatchMismatch(mutation_id));
        }
        pending.committing = true;
        pending.notify = Some(tx);
        let seq = pending.seq;

        let resource = resource_id.to_string();
        match mode {
            CommitMode::Immediate => {
                self.inner.enqueue(&mut slot, seq);
            }
            CommitMode::Debounced => {
                let deadline = Instant::now() + self.inner.config.debounce_window;
                pending.deadline = Some(deadline);

                if let Some(previous) = slot.debounce.take() {
                    previous.handle.abort();
                    slot.supersede(previous.seq, seq);
                }

                let inner = Arc::clone(&self.inner);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    inner.fire_debounce(&resource, seq);
                });
                slot.debounce = Some(DebounceEntry { seq, handle });
            }
        }

        Ok(CommitTicket { mutation_id, rx })
    }
}

impl Inner {
    fn fire_debounce(self: &Arc<Self>, resource: &str, seq: u64) {
        let Some(mut slot) = self.slots.get_mut(resource) else {
            return;
        };
        if slot.debounce.as_ref().map(|d| d.seq) == Some(seq) {
            slot.debounce = None;
            self.enqueue(&mut slot, seq);
        }
    }

    /// Hand a due mutation to the resource's writer, starting it if needed.
    fn enqueue(self: &Arc<Self>, slot: &mut ResourceSlot, seq: u64) {
        if let Some(queue) = &slot.queue {
            if queue.send(seq).is_ok() {
                return;
            }
        }
        let queue = self.spawn_writer(slot.state.resource_id.clone());
        let _ = queue.send(seq);
        slot.queue = Some(queue);
    }

    fn spawn_writer(self: &Arc<Self>, resource: ResourceId) -> mpsc::UnboundedSender<u64> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let inner: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(seq) = rx.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.persist(&resource, seq).await;
            }
        });
        tx
    }

    async fn persist(&self, resource: &str, seq: u64) {
        // Superseded or cancelled while queued.
        let patch = self.slots.get(resource).and_then(|slot| {
            slot.pending
                .iter()
                .find(|p| p.seq == seq)
                .map(|p| p.patch.clone())
        });
        let Some(patch) = patch else {
            return;
        };

        match self.write(resource, &patch).await {
            Ok(()) => self.resolve(resource, seq, &patch),
            Err(e) => self.rollback(resource, seq, e),
        }
    }

    async fn write(&self, resource: &str, patch: &Value) -> Result<(), SyncError> {
        let mut link = self.link.subscribe();
        let status = match link.wait_for(|s| *s != LinkStatus::Offline).await {
            Ok(status) => *status,
            Err(_) => LinkStatus::Exhausted,
        };
        if status == LinkStatus::Exhausted {
            return Err(SyncError::Dropped);
        }

        match tokio::time::timeout(self.config.commit_timeout, self.store.persist(resource, patch))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SyncError::Store(e)),
            Err(_) => Err(SyncError::Timeout(self.config.commit_timeout)),
        }
    }

    fn resolve(&self, resource: &str, seq: u64, patch: &Value) {
        let Some(mut slot) = self.slots.get_mut(resource) else {
            return;
        };
        let Some(done) = slot.take(seq) else {
            return;
        };

        patch::merge(&mut slot.state.payload, patch);
        slot.state.version += 1;
        slot.state.updated_at = now_millis();
        let version = slot.state.version;

        // Older unwritten mutations must not roll back past this write, and
        // must not undo it when written later.
        for older in slot.pending.iter_mut() {
            if older.base_seq < seq {
                patch::merge(&mut older.snapshot, patch);
            }
            if older.seq < seq {
                patch::compose(&mut older.patch, patch);
            }
        }

        debug!(resource = %resource, mutation = %done.mutation_id, version, "Committed mutation");
        let mutation_id = done.mutation_id.clone();
        done.resolve(Ok(Committed {
            mutation_id,
            version,
        }));
    }

    fn rollback(&self, resource: &str, seq: u64, error: SyncError) {
        let Some(mut slot) = self.slots.get_mut(resource) else {
            return;
        };
        let Some(mut failed) = slot.take(seq) else {
            return;
        };

        // Dependents may carry an older snapshot inherited from a superseded
        // mutation; restore the oldest one they reach back to.
        let mut base = failed.base_seq;
        let mut snapshot = std::mem::take(&mut failed.snapshot);
        while let Some(earlier) = slot
            .pending
            .iter()
            .filter(move |p| p.seq > base && p.base_seq < base)
            .min_by_key(|p| p.base_seq)
        {
            base = earlier.base_seq;
            snapshot = earlier.snapshot.clone();
        }
        slot.local = snapshot;

        if slot.debounce.as_ref().map_or(false, |d| d.seq > base) {
            if let Some(entry) = slot.debounce.take() {
                entry.handle.abort();
            }
        }

        let (cancelled, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut slot.pending).into_iter().partition(|p| p.seq > base);
        slot.pending = kept;
        drop(slot);

        warn!(
            resource = %resource,
            mutation = %failed.mutation_id,
            cancelled = cancelled.len(),
            error = %error,
            "Commit failed, rolled back"
        );
        for dependent in cancelled {
            dependent.resolve(Err(SyncError::Cancelled(failed.mutation_id.clone())));
        }
        failed.resolve(Err(error));
    }
}

/// Store held in memory, with scriptable failures.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    writes: Mutex<Vec<(ResourceId, Value)>>,
    script: Mutex<VecDeque<Option<StoreError>>>,
    latency: Option<Duration>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose writes take `latency`.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Fail the next unscripted write with `error`.
    pub async fn fail_next(&self, error: StoreError) {
        self.script.lock().await.push_back(Some(error));
    }

    /// Let the next unscripted write succeed.
    pub async fn succeed_next(&self) {
        self.script.lock().await.push_back(None);
    }

    /// Every successful write, in order.
    pub async fn writes(&self) -> Vec<(ResourceId, Value)> {
        self.writes.lock().await.clone()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn persist(&self, resource_id: &str, patch: &Value) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(Some(error)) = self.script.lock().await.pop_front() {
            return Err(error);
        }
        self.writes
            .lock()
            .await
            .push((resource_id.to_string(), patch.clone()));
        Ok(())
    }
}
