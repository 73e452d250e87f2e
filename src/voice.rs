use std::time::Duration;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};

use crate::error::{MediaError, VoiceError};
use crate::models::Song;

/// Voice gateway boundary. `Source` is whatever the paired
/// [`MediaResolver`] produces (a songbird input in production, a unit value
/// in tests).
#[async_trait]
pub trait VoiceTransport: Send + Sync + 'static {
    type Source: Send + 'static;
    type Session: VoiceSession<Source = Self::Source>;

    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Self::Session, VoiceError>;

    fn is_connected(&self, guild_id: GuildId) -> bool;

    /// The voice channel the bot currently sits in, if any.
    async fn current_channel(&self, guild_id: GuildId) -> Option<ChannelId>;

    /// Pauses or resumes the guild's current track, if one is playing.
    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> Result<(), VoiceError>;
}

/// One joined voice connection. `stream` drives a single song to its natural
/// end; forced teardown goes through `stop` from the playback loop's stop
/// arm.
#[async_trait]
pub trait VoiceSession: Send + Sync + 'static {
    type Source: Send + 'static;

    async fn stream(&self, source: Self::Source) -> Result<(), VoiceError>;

    async fn position(&self) -> Duration;

    async fn set_paused(&self, paused: bool) -> Result<(), VoiceError>;

    async fn stop(&self);
}

/// Turns a persisted song into a playable stream source. Extraction details
/// (yt-dlp, search, scraping) live behind this boundary.
#[async_trait]
pub trait MediaResolver: Send + Sync + 'static {
    type Source: Send + 'static;

    async fn resolve(&self, song: &Song) -> Result<Self::Source, MediaError>;
}
