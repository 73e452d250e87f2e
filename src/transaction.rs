use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serenity::model::id::{GuildId, UserId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ack::{AckChannel, AckHandle};
use crate::error::{AckError, StoreError};
use crate::models::{Queue, TriggerKind};
use crate::registry::GuildRegistry;
use crate::render::{RenderVariant, RenderedView, Renderer};
use crate::store::PersistentStore;
use crate::voice::VoiceTransport;

/// Delivery budget for a single convergence when the caller has no tighter
/// deadline of its own.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long before a handle's deadline its expiry watcher fires. The watcher
/// must win the race against the platform surfacing "interaction failed".
const EXPIRY_MARGIN: Duration = Duration::from_millis(300);

/// Transaction ids wrap modulo this bound; they only need to be unique
/// within a log window.
const ID_BOUND: u64 = 1 << 32;

/// One unit of convergence work tied to a trigger. Holds no back-pointer to
/// its coordinator; terminal actions are invoked with the coordinator passed
/// in.
pub struct Transaction {
    id: u64,
    kind: TriggerKind,
    guild_id: GuildId,
    done: AtomicBool,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Marks the transaction done without rendering anything. Idempotent.
    pub fn defer(&self) {
        self.mark_done();
    }

    /// Re-arms a finished transaction so a later convergence can reuse it
    /// (quick ack first, slower state update after).
    pub fn refresh(&self) {
        self.done.store(false, Ordering::Release);
        debug!("transaction {} refreshed", self.id);
    }

    /// Converges the guild's visible queue message with store state through
    /// the coordinator. No-op when already done.
    pub async fn update_queue<V: VoiceTransport>(
        &self,
        coordinator: &Coordinator<V>,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        coordinator.update_queue(self, timeout).await
    }

    fn mark_done(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            debug!("transaction {} ({}) done", self.id, self.kind.as_str());
        }
    }
}

/// Converges the user-visible queue message with authoritative store state,
/// racing buffered acknowledgment handles against the message-edit fallback.
pub struct Coordinator<V: VoiceTransport> {
    client_id: UserId,
    store: Arc<dyn PersistentStore>,
    registry: Arc<GuildRegistry>,
    voice: Arc<V>,
    ack: Arc<dyn AckChannel>,
    renderer: Arc<dyn Renderer>,
    ready: watch::Receiver<bool>,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

impl<V: VoiceTransport> Coordinator<V> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: UserId,
        store: Arc<dyn PersistentStore>,
        registry: Arc<GuildRegistry>,
        voice: Arc<V>,
        ack: Arc<dyn AckChannel>,
        renderer: Arc<dyn Renderer>,
        ready: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client_id,
            store,
            registry,
            voice,
            ack,
            renderer,
            ready,
            cancel,
            next_id: AtomicU64::new(0),
        }
    }

    /// Creates a transaction for an incoming trigger. A supplied handle is
    /// buffered for the guild and watched: shortly before its deadline an
    /// unused handle is auto-acknowledged so the user never sees a platform
    /// failure for it.
    pub fn new_transaction(
        &self,
        kind: TriggerKind,
        guild_id: GuildId,
        handle: Option<AckHandle>,
    ) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) % ID_BOUND;
        debug!("transaction {id} ({}) created for guild {guild_id}", kind.as_str());

        if let Some(handle) = handle {
            self.registry.buffer_handle(guild_id, handle.clone());
            self.spawn_expiry_watcher(handle);
        }

        Transaction {
            id,
            kind,
            guild_id,
            done: AtomicBool::new(false),
        }
    }

    fn spawn_expiry_watcher(&self, handle: AckHandle) {
        let ack = Arc::clone(&self.ack);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let wake = handle
                .deadline()
                .checked_sub(EXPIRY_MARGIN)
                .unwrap_or_else(Instant::now);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
            }
            if handle.claim() {
                if let Err(err) = ack.defer(&handle).await {
                    warn!("auto-acknowledge of an expiring handle failed: {err}");
                }
            }
        });
    }

    pub(crate) async fn update_queue(
        &self,
        transaction: &Transaction,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        if transaction.is_done() {
            return Ok(());
        }
        let guild_id = transaction.guild_id;

        let queue = match self.store.get_queue(self.client_id, guild_id).await {
            Ok(queue) => queue,
            Err(err) => {
                // Cleanup sweeps treat any fetch failure as "entity gone";
                // other callers may retry on transport errors.
                if err.is_not_found() || transaction.kind == TriggerKind::CleanupSweep {
                    transaction.mark_done();
                }
                debug!("queue fetch failed for guild {guild_id}: {err}");
                return Err(err);
            }
        };

        let variant = if !*self.ready.borrow() {
            RenderVariant::Disabled
        } else if !self.voice.is_connected(guild_id) {
            RenderVariant::JoinPrompt
        } else {
            RenderVariant::Interactive
        };
        let view = self.renderer.render(&queue, variant);

        match tokio::time::timeout(timeout, self.deliver(&queue, &view)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                // Both paths failed; last-write-wins semantics make this
                // safe to drop after logging.
                warn!("queue update delivery failed for guild {guild_id}: {err}");
            }
            Err(_) => warn!("queue update timed out for guild {guild_id}"),
        }

        transaction.mark_done();
        Ok(())
    }

    /// Races the two delivery paths: a buffered handle (fast, unlimited rate,
    /// short-lived) first, the stored message edit (always available, rate
    /// limited) as fallback. Exactly one delivery per call.
    async fn deliver(&self, queue: &Queue, view: &RenderedView) -> Result<(), AckError> {
        while let Some(handle) = self.registry.drain_one_handle(queue.guild_id) {
            if !handle.claim() {
                // Already auto-acknowledged by its expiry watcher.
                continue;
            }
            match self.ack.respond_via(&handle, view).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!("handle delivery failed, falling back to edit: {err}");
                    break;
                }
            }
        }
        self.ack
            .edit_message(queue.channel_id, queue.message_id, view)
            .await
    }

    /// One pass over every queue this client owns, re-converging each. A
    /// NotFound-class failure removes the stale entity. Run once at gateway
    /// ready.
    pub async fn run_cleanup_sweep(&self) {
        let queues = match self.store.list_queues(self.client_id).await {
            Ok(queues) => queues,
            Err(err) => {
                warn!("cleanup sweep could not list queues: {err}");
                return;
            }
        };
        info!("cleanup sweep over {} queues", queues.len());

        for queue in queues {
            let transaction = self.new_transaction(TriggerKind::CleanupSweep, queue.guild_id, None);
            if let Err(err) = self.update_queue(&transaction, DEFAULT_UPDATE_TIMEOUT).await {
                if err.is_not_found() {
                    info!("removing stale queue for guild {}", queue.guild_id);
                    if let Err(err) = self
                        .store
                        .remove_queue(self.client_id, queue.guild_id)
                        .await
                    {
                        warn!("stale queue removal failed: {err}");
                    }
                }
            }
        }
    }

    pub fn client_id(&self) -> UserId {
        self.client_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Queue;
    use crate::store::MemoryStore;
    use crate::testing::{RecordingAck, RecordingRenderer, TestVoice};
    use serenity::model::id::{ChannelId, MessageId};

    const CLIENT: UserId = UserId(1);
    const GUILD: GuildId = GuildId(42);

    struct Harness {
        coordinator: Coordinator<TestVoice>,
        store: Arc<MemoryStore>,
        registry: Arc<GuildRegistry>,
        voice: Arc<TestVoice>,
        ack: Arc<RecordingAck>,
        renderer: Arc<RecordingRenderer>,
        ready_tx: watch::Sender<bool>,
        cancel: CancellationToken,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(GuildRegistry::new());
        let voice = Arc::new(TestVoice::new());
        let ack = Arc::new(RecordingAck::new());
        let renderer = Arc::new(RecordingRenderer::new());
        let (ready_tx, ready_rx) = watch::channel(true);
        let cancel = CancellationToken::new();
        let coordinator = Coordinator::new(
            CLIENT,
            store.clone() as Arc<dyn PersistentStore>,
            registry.clone(),
            voice.clone(),
            ack.clone(),
            renderer.clone(),
            ready_rx,
            cancel.clone(),
        );
        Harness {
            coordinator,
            store,
            registry,
            voice,
            ack,
            renderer,
            ready_tx,
            cancel,
        }
    }

    async fn seed_queue(store: &MemoryStore) {
        let queue = Queue::new(CLIENT, GUILD, ChannelId(7), MessageId(77));
        store.persist_queue(&queue).await.unwrap();
    }

    fn sample_handle() -> AckHandle {
        AckHandle::new(500, "tok", Instant::now() + Duration::from_secs(2))
    }

    #[tokio::test]
    async fn update_prefers_a_buffered_handle() {
        let h = harness();
        seed_queue(&h.store).await;
        h.voice.set_connected(true);

        let handle = sample_handle();
        let tx = h
            .coordinator
            .new_transaction(TriggerKind::ButtonClick, GUILD, Some(handle));
        tx.update_queue(&h.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(h.ack.responds(), vec![500]);
        assert_eq!(h.ack.edit_count(), 0);
        assert!(tx.is_done());
    }

    #[tokio::test]
    async fn update_falls_back_to_editing_the_message() {
        let h = harness();
        seed_queue(&h.store).await;

        // No handle buffered at all.
        let tx = h
            .coordinator
            .new_transaction(TriggerKind::VoiceStateUpdate, GUILD, None);
        tx.update_queue(&h.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(h.ack.edit_count(), 1);

        // A handle whose send fails also ends on the edit path.
        h.ack.fail_responds(true);
        let tx = h
            .coordinator
            .new_transaction(TriggerKind::ButtonClick, GUILD, Some(sample_handle()));
        tx.update_queue(&h.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(h.ack.edit_count(), 2);
        assert!(tx.is_done());
    }

    #[tokio::test]
    async fn missing_queue_marks_done_and_surfaces_not_found() {
        let h = harness();
        let tx = h
            .coordinator
            .new_transaction(TriggerKind::CleanupSweep, GUILD, None);
        let err = tx
            .update_queue(&h.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(tx.is_done());
        assert_eq!(h.ack.edit_count(), 0);
    }

    #[tokio::test]
    async fn render_variant_tracks_readiness_and_connection() {
        let h = harness();
        seed_queue(&h.store).await;

        h.ready_tx.send(false).unwrap();
        let tx = h
            .coordinator
            .new_transaction(TriggerKind::VoiceStateUpdate, GUILD, None);
        tx.update_queue(&h.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
            .unwrap();

        h.ready_tx.send(true).unwrap();
        tx.refresh();
        tx.update_queue(&h.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
            .unwrap();

        h.voice.set_connected(true);
        tx.refresh();
        tx.update_queue(&h.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(
            h.renderer.variants(),
            vec![
                RenderVariant::Disabled,
                RenderVariant::JoinPrompt,
                RenderVariant::Interactive
            ]
        );
    }

    #[tokio::test]
    async fn done_transactions_do_not_deliver_again() {
        let h = harness();
        seed_queue(&h.store).await;
        let tx = h
            .coordinator
            .new_transaction(TriggerKind::ButtonClick, GUILD, None);
        tx.defer();
        tx.update_queue(&h.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(h.ack.edit_count(), 0);

        tx.refresh();
        tx.update_queue(&h.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(h.ack.edit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unused_handles_are_auto_acknowledged_before_the_deadline() {
        let h = harness();
        seed_queue(&h.store).await;

        let handle = AckHandle::new(900, "tok", Instant::now() + Duration::from_secs(2));
        let _tx = h
            .coordinator
            .new_transaction(TriggerKind::ButtonClick, GUILD, Some(handle.clone()));

        // Never consumed by an update; the watcher must claim it.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(handle.is_claimed());
        assert_eq!(h.ack.defers(), vec![900]);

        // A later update cannot reuse the claimed handle and edits instead.
        let tx = h
            .coordinator
            .new_transaction(TriggerKind::VoiceStateUpdate, GUILD, None);
        tx.update_queue(&h.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
            .unwrap();
        assert!(h.ack.responds().is_empty());
        assert_eq!(h.ack.edit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_root_context_stops_expiry_watchers() {
        let h = harness();
        let handle = AckHandle::new(901, "tok", Instant::now() + Duration::from_secs(2));
        let _tx = h
            .coordinator
            .new_transaction(TriggerKind::ButtonClick, GUILD, Some(handle.clone()));

        h.cancel.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!handle.is_claimed());
        assert!(h.ack.defers().is_empty());
    }

    #[tokio::test]
    async fn cleanup_sweep_leaves_healthy_queues_in_place() {
        let h = harness();
        seed_queue(&h.store).await;
        h.coordinator.run_cleanup_sweep().await;
        assert!(h.store.get_queue(CLIENT, GUILD).await.is_ok());
        assert_eq!(h.ack.edit_count(), 1);
    }

    /// Store whose queue for one guild is listed but no longer fetchable,
    /// like a row deleted between the sweep's listing and its convergence.
    struct VanishingStore {
        inner: MemoryStore,
        vanished: GuildId,
        removed: std::sync::Mutex<Vec<GuildId>>,
    }

    #[async_trait::async_trait]
    impl PersistentStore for VanishingStore {
        async fn get_queue(&self, client_id: UserId, guild_id: GuildId) -> Result<Queue, StoreError> {
            if guild_id == self.vanished {
                return Err(StoreError::NotFound);
            }
            self.inner.get_queue(client_id, guild_id).await
        }

        async fn persist_queue(&self, queue: &Queue) -> Result<(), StoreError> {
            self.inner.persist_queue(queue).await
        }

        async fn update_queue(&self, queue: &Queue) -> Result<(), StoreError> {
            self.inner.update_queue(queue).await
        }

        async fn remove_queue(
            &self,
            client_id: UserId,
            guild_id: GuildId,
        ) -> Result<(), StoreError> {
            self.removed.lock().unwrap().push(guild_id);
            self.inner.remove_queue(client_id, guild_id).await
        }

        async fn list_queues(&self, client_id: UserId) -> Result<Vec<Queue>, StoreError> {
            self.inner.list_queues(client_id).await
        }

        async fn get_songs(
            &self,
            client_id: UserId,
            guild_id: GuildId,
            offset: i64,
            limit: i64,
        ) -> Result<Vec<crate::models::Song>, StoreError> {
            self.inner.get_songs(client_id, guild_id, offset, limit).await
        }

        async fn get_all_songs(
            &self,
            client_id: UserId,
            guild_id: GuildId,
        ) -> Result<Vec<crate::models::Song>, StoreError> {
            self.inner.get_all_songs(client_id, guild_id).await
        }

        async fn persist_songs(
            &self,
            client_id: UserId,
            guild_id: GuildId,
            songs: Vec<crate::models::Song>,
        ) -> Result<Vec<crate::models::Song>, StoreError> {
            self.inner.persist_songs(client_id, guild_id, songs).await
        }

        async fn remove_songs(
            &self,
            client_id: UserId,
            guild_id: GuildId,
            ids: &[i64],
        ) -> Result<(), StoreError> {
            self.inner.remove_songs(client_id, guild_id, ids).await
        }

        async fn persist_inactive_songs(
            &self,
            client_id: UserId,
            guild_id: GuildId,
            songs: Vec<crate::models::Song>,
        ) -> Result<(), StoreError> {
            self.inner
                .persist_inactive_songs(client_id, guild_id, songs)
                .await
        }

        async fn pop_latest_inactive_song(
            &self,
            client_id: UserId,
            guild_id: GuildId,
        ) -> Result<crate::models::Song, StoreError> {
            self.inner.pop_latest_inactive_song(client_id, guild_id).await
        }

        async fn inactive_song_count(
            &self,
            client_id: UserId,
            guild_id: GuildId,
        ) -> Result<i64, StoreError> {
            self.inner.inactive_song_count(client_id, guild_id).await
        }

        async fn song_count(
            &self,
            client_id: UserId,
            guild_id: GuildId,
        ) -> Result<i64, StoreError> {
            self.inner.song_count(client_id, guild_id).await
        }

        async fn remove_inactive_songs_before(
            &self,
            cutoff: std::time::SystemTime,
        ) -> Result<u64, StoreError> {
            self.inner.remove_inactive_songs_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn cleanup_sweep_removes_queues_that_vanished_after_listing() {
        let inner = MemoryStore::new();
        let stale_guild = GuildId(43);
        inner
            .persist_queue(&Queue::new(CLIENT, GUILD, ChannelId(7), MessageId(77)))
            .await
            .unwrap();
        inner
            .persist_queue(&Queue::new(CLIENT, stale_guild, ChannelId(8), MessageId(88)))
            .await
            .unwrap();
        let store = Arc::new(VanishingStore {
            inner,
            vanished: stale_guild,
            removed: std::sync::Mutex::new(Vec::new()),
        });

        let ack = Arc::new(RecordingAck::new());
        let (_ready_tx, ready_rx) = watch::channel(true);
        let coordinator = Coordinator::new(
            CLIENT,
            store.clone() as Arc<dyn PersistentStore>,
            Arc::new(GuildRegistry::new()),
            Arc::new(TestVoice::new()),
            ack.clone(),
            Arc::new(RecordingRenderer::new()),
            ready_rx,
            CancellationToken::new(),
        );

        coordinator.run_cleanup_sweep().await;

        assert_eq!(store.removed.lock().unwrap().clone(), vec![stale_guild]);
        assert!(store.inner.get_queue(CLIENT, stale_guild).await.is_err());
        // The healthy queue survives and is re-converged.
        assert!(store.inner.get_queue(CLIENT, GUILD).await.is_ok());
        assert_eq!(ack.edit_count(), 1);
    }
}
