use std::sync::Arc;

use serenity::model::id::{ChannelId, GuildId, UserId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{QueueOption, Song, TriggerKind};
use crate::registry::GuildRegistry;
use crate::store::PersistentStore;
use crate::transaction::{Coordinator, DEFAULT_UPDATE_TIMEOUT};
use crate::voice::{MediaResolver, VoiceSession, VoiceTransport};

/// Drives the audio lifecycle for one guild at a time: join, stream the head
/// song, run the post-play callback, repeat until the queue drains.
///
/// At most one playback loop is active per guild; the registry's player slot
/// is the check-and-set that makes concurrent `play` calls first-writer-wins.
pub struct PlaybackEngine<V, M>
where
    V: VoiceTransport,
    M: MediaResolver<Source = V::Source>,
{
    client_id: UserId,
    store: Arc<dyn PersistentStore>,
    registry: Arc<GuildRegistry>,
    voice: Arc<V>,
    resolver: Arc<M>,
    coordinator: Arc<Coordinator<V>>,
    cancel: CancellationToken,
}

impl<V, M> PlaybackEngine<V, M>
where
    V: VoiceTransport,
    M: MediaResolver<Source = V::Source>,
{
    pub fn new(
        client_id: UserId,
        store: Arc<dyn PersistentStore>,
        registry: Arc<GuildRegistry>,
        voice: Arc<V>,
        resolver: Arc<M>,
        coordinator: Arc<Coordinator<V>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client_id,
            store,
            registry,
            voice,
            resolver,
            coordinator,
            cancel,
        }
    }

    /// Starts (or joins) the guild's queue-draining loop. Returns when the
    /// queue is exhausted, another player already holds the slot, playback is
    /// force-stopped, or the root context is cancelled.
    pub async fn play(&self, guild_id: GuildId, channel_id: Option<ChannelId>) {
        let Some(channel_id) = channel_id else {
            debug!("play for guild {guild_id} without a voice target, ignoring");
            return;
        };

        loop {
            // First writer wins; a concurrent play call for this guild
            // returns immediately.
            let Some(mut token) = self.registry.try_register_player(guild_id) else {
                debug!("player already active for guild {guild_id}");
                return;
            };

            let queue = match self.store.get_queue(self.client_id, guild_id).await {
                Ok(queue) => queue,
                Err(err) => {
                    if !err.is_not_found() {
                        warn!("queue fetch before playback failed for guild {guild_id}: {err}");
                    }
                    return;
                }
            };
            let Some(head) = queue.head_song else {
                debug!("queue for guild {guild_id} is drained");
                return;
            };

            let session = match self.voice.join(guild_id, channel_id).await {
                Ok(session) => Arc::new(session),
                Err(err) => {
                    warn!("voice join failed for guild {guild_id}: {err}");
                    return;
                }
            };

            let source = match self.resolver.resolve(&head).await {
                Ok(source) => source,
                Err(err) => {
                    warn!("cannot stream \"{}\" in guild {guild_id}: {err}", head.name);
                    return;
                }
            };

            info!("streaming \"{}\" in guild {guild_id}", head.short_name);
            let stream = {
                let session = Arc::clone(&session);
                async move { session.stream(source).await }
            };
            tokio::pin!(stream);

            let finished = tokio::select! {
                result = &mut stream => result,
                _ = token.stop_signal().recv() => {
                    // Forced stop: the queue is being torn down, not
                    // advanced. Skip the completion callback.
                    debug!("playback force-stopped for guild {guild_id}");
                    session.stop().await;
                    return;
                }
                _ = self.cancel.cancelled() => {
                    session.stop().await;
                    return;
                }
            };

            if let Err(err) = finished {
                // The song is abandoned, not retried; the next convergence
                // re-triggers play.
                warn!("stream ended with an error in guild {guild_id}: {err}");
                return;
            }

            self.finish_song(guild_id, &head).await;

            // Free the slot before looping so an external play call may take
            // over between songs.
            drop(token);
            if self.cancel.is_cancelled() {
                return;
            }
        }
    }

    /// Forces the guild's active stream (if any) to unwind without its
    /// completion callback.
    pub fn stop(&self, guild_id: GuildId) {
        self.registry.stop_player(guild_id);
    }

    /// Post-play bookkeeping: drop the played song (or re-append it under
    /// Loop) and converge the visible message. Store failures here are
    /// logged and swallowed; the playback loop proceeds regardless.
    async fn finish_song(&self, guild_id: GuildId, played: &Song) {
        let queue = match self.store.get_queue(self.client_id, guild_id).await {
            Ok(queue) => queue,
            Err(err) => {
                warn!("post-play queue fetch failed for guild {guild_id}: {err}");
                return;
            }
        };

        let result = if queue.has_option(QueueOption::Loop) {
            let mut song = played.clone();
            song.position = 0; // store re-appends it after the current max
            self.store
                .persist_songs(self.client_id, guild_id, vec![song])
                .await
                .map(|_| ())
        } else {
            self.store
                .remove_songs(self.client_id, guild_id, &[played.id])
                .await
        };
        if let Err(err) = result {
            warn!("post-play bookkeeping failed for guild {guild_id}: {err}");
        }

        let transaction =
            self.coordinator
                .new_transaction(TriggerKind::VoiceStateUpdate, guild_id, None);
        if let Err(err) = transaction
            .update_queue(&self.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
        {
            debug!("post-play convergence failed for guild {guild_id}: {err}");
        }
    }
}
