use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serenity::model::id::GuildId;
use tokio::sync::broadcast;
use tracing::debug;

use crate::ack::AckHandle;

/// Buffered acknowledgment handles beyond this are silently dropped; the
/// message-edit fallback always exists, so overflow is an accepted lossy
/// condition.
pub const HANDLE_BUFFER_CAPACITY: usize = 10;

#[derive(Default)]
struct GuildState {
    stop_tx: Option<broadcast::Sender<()>>,
    handles: VecDeque<AckHandle>,
}

/// Per-guild shared mutable state: the single player slot and the bounded
/// acknowledgment-handle buffer.
///
/// The outer map lock only guards key lookup; every state mutation happens
/// under the per-guild lock, so guilds never contend with each other. All
/// operations are non-blocking.
#[derive(Default)]
pub struct GuildRegistry {
    guilds: Mutex<HashMap<GuildId, Arc<Mutex<GuildState>>>>,
}

impl GuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn guild(&self, guild_id: GuildId) -> Arc<Mutex<GuildState>> {
        let mut guilds = self.guilds.lock().unwrap();
        guilds.entry(guild_id).or_default().clone()
    }

    /// Atomic check-and-set for the guild's player slot. Returns `None` when
    /// a player is already active (first writer wins).
    pub fn try_register_player(self: &Arc<Self>, guild_id: GuildId) -> Option<PlayerToken> {
        let state = self.guild(guild_id);
        let mut state = state.lock().unwrap();
        if state.stop_tx.is_some() {
            return None;
        }
        let (stop_tx, stop_rx) = broadcast::channel(4);
        state.stop_tx = Some(stop_tx);
        Some(PlayerToken {
            registry: Arc::clone(self),
            guild_id,
            stop_rx,
        })
    }

    pub fn unregister_player(&self, guild_id: GuildId) {
        let state = self.guild(guild_id);
        state.lock().unwrap().stop_tx = None;
    }

    pub fn is_player_active(&self, guild_id: GuildId) -> bool {
        let state = self.guild(guild_id);
        let active = state.lock().unwrap().stop_tx.is_some();
        active
    }

    /// Fires the stop broadcast for the guild's active player, if any. The
    /// streaming loop unwinds without running its completion callback.
    pub fn stop_player(&self, guild_id: GuildId) {
        let state = self.guild(guild_id);
        let state = state.lock().unwrap();
        if let Some(stop_tx) = &state.stop_tx {
            let _ = stop_tx.send(());
        }
    }

    /// Bounded, non-blocking insert. Overflow drops the handle; its expiry
    /// watcher will still auto-acknowledge it in time.
    pub fn buffer_handle(&self, guild_id: GuildId, handle: AckHandle) {
        let state = self.guild(guild_id);
        let mut state = state.lock().unwrap();
        if state.handles.len() >= HANDLE_BUFFER_CAPACITY {
            debug!("handle buffer full for guild {guild_id}, dropping handle");
            return;
        }
        state.handles.push_back(handle);
    }

    /// Non-blocking FIFO pop of a buffered handle.
    pub fn drain_one_handle(&self, guild_id: GuildId) -> Option<AckHandle> {
        let state = self.guild(guild_id);
        let mut state = state.lock().unwrap();
        state.handles.pop_front()
    }
}

/// RAII registration for the guild's player slot; dropping it frees the slot.
pub struct PlayerToken {
    registry: Arc<GuildRegistry>,
    guild_id: GuildId,
    stop_rx: broadcast::Receiver<()>,
}

impl PlayerToken {
    pub fn stop_signal(&mut self) -> &mut broadcast::Receiver<()> {
        &mut self.stop_rx
    }
}

impl Drop for PlayerToken {
    fn drop(&mut self) {
        self.registry.unregister_player(self.guild_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn handle() -> AckHandle {
        AckHandle::new(1, "token", Instant::now() + Duration::from_secs(2))
    }

    #[test]
    fn second_registration_loses() {
        let registry = Arc::new(GuildRegistry::new());
        let token = registry.try_register_player(GuildId(1));
        assert!(token.is_some());
        assert!(registry.try_register_player(GuildId(1)).is_none());
        // Independent guilds do not interfere.
        assert!(registry.try_register_player(GuildId(2)).is_some());
    }

    #[test]
    fn dropping_the_token_frees_the_slot() {
        let registry = Arc::new(GuildRegistry::new());
        let token = registry.try_register_player(GuildId(1)).unwrap();
        assert!(registry.is_player_active(GuildId(1)));
        drop(token);
        assert!(!registry.is_player_active(GuildId(1)));
        assert!(registry.try_register_player(GuildId(1)).is_some());
    }

    #[tokio::test]
    async fn stop_player_reaches_the_token() {
        let registry = Arc::new(GuildRegistry::new());
        let mut token = registry.try_register_player(GuildId(1)).unwrap();
        registry.stop_player(GuildId(1));
        token.stop_signal().recv().await.unwrap();
    }

    #[test]
    fn handle_buffer_is_bounded_and_fifo() {
        let registry = Arc::new(GuildRegistry::new());
        for _ in 0..HANDLE_BUFFER_CAPACITY + 5 {
            registry.buffer_handle(GuildId(1), handle());
        }
        let mut drained = 0;
        while registry.drain_one_handle(GuildId(1)).is_some() {
            drained += 1;
        }
        assert_eq!(drained, HANDLE_BUFFER_CAPACITY);
    }

    #[test]
    fn drain_on_empty_guild_is_none() {
        let registry = Arc::new(GuildRegistry::new());
        assert!(registry.drain_one_handle(GuildId(9)).is_none());
    }
}
