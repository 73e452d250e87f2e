use std::collections::HashSet;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};

/// Positions assigned by the store start here; `0` on a [`Song`] means
/// "unassigned, append at the back".
pub const FIRST_POSITION: i64 = 1;

/// How many songs (past the head) a single queue page shows by default.
pub const DEFAULT_PAGE_LIMIT: i64 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    /// Store-assigned identifier, `0` until persisted.
    pub id: i64,
    /// Ordering key within a queue. Gappy by design: removals leave holes.
    pub position: i64,
    pub name: String,
    pub short_name: String,
    pub duration_seconds: i64,
    pub color: i32,
}

impl Song {
    pub fn new(name: &str) -> Self {
        Self {
            id: 0,
            position: 0,
            name: name.to_string(),
            short_name: shorten_name(name),
            duration_seconds: 0,
            color: 0,
        }
    }

    /// Render-friendly `m:ss` form of the duration.
    pub fn duration_display(&self) -> String {
        let minutes = self.duration_seconds / 60;
        let seconds = self.duration_seconds % 60;
        format!("{minutes}:{seconds:02}")
    }
}

const SHORT_NAME_MAX: usize = 30;

fn shorten_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.chars().count() <= SHORT_NAME_MAX {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(SHORT_NAME_MAX - 3).collect();
    format!("{}...", cut.trim_end())
}

/// A song parked in the time-boxed holding area after a user action removed
/// it from the live queue (skip, shuffle replacement). The janitor purges
/// entries older than the configured TTL.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InactiveSong {
    pub song: Song,
    pub added_at: SystemTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueOption {
    /// Played songs are re-appended instead of removed.
    Loop,
    /// Playback is paused; the pause button renders toggled.
    Paused,
    /// The bot has no live voice connection for this queue.
    Inactive,
}

/// One guild's persisted queue, windowed for rendering.
///
/// `songs` is the page `[offset, offset + limit)` of the non-head songs in
/// ascending position order; `head_song` is always the minimum-position song
/// when any song exists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Queue {
    pub client_id: UserId,
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub offset: i64,
    pub limit: i64,
    pub options: HashSet<QueueOption>,
    pub head_song: Option<Song>,
    pub songs: Vec<Song>,
    pub size: i64,
    pub inactive_size: i64,
}

impl Queue {
    pub fn new(
        client_id: UserId,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Self {
        Self {
            client_id,
            guild_id,
            channel_id,
            message_id,
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
            options: HashSet::new(),
            head_song: None,
            songs: Vec::new(),
            size: 0,
            inactive_size: 0,
        }
    }

    pub fn has_option(&self, option: QueueOption) -> bool {
        self.options.contains(&option)
    }

    pub fn set_option(&mut self, option: QueueOption) {
        self.options.insert(option);
    }

    pub fn clear_option(&mut self, option: QueueOption) {
        self.options.remove(&option);
    }

    pub fn toggle_option(&mut self, option: QueueOption) {
        if !self.options.remove(&option) {
            self.options.insert(option);
        }
    }
}

/// Closed set of trigger sources a [`crate::transaction::Transaction`] can be
/// created for. Dispatch is always an explicit match on this tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerKind {
    ApplicationCommand,
    ButtonClick,
    ModalSubmit,
    VoiceStateUpdate,
    CleanupSweep,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::ApplicationCommand => "application-command",
            TriggerKind::ButtonClick => "button-click",
            TriggerKind::ModalSubmit => "modal-submit",
            TriggerKind::VoiceStateUpdate => "voice-state-update",
            TriggerKind::CleanupSweep => "cleanup-sweep",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_keeps_short_titles() {
        let song = Song::new("Short title");
        assert_eq!(song.short_name, "Short title");
    }

    #[test]
    fn short_name_truncates_long_titles() {
        let song = Song::new("An unreasonably long song title that would wreck the embed layout");
        assert!(song.short_name.chars().count() <= 30);
        assert!(song.short_name.ends_with("..."));
    }

    #[test]
    fn toggle_option_flips() {
        let mut queue = Queue::new(UserId(1), GuildId(2), ChannelId(3), MessageId(4));
        assert!(!queue.has_option(QueueOption::Loop));
        queue.toggle_option(QueueOption::Loop);
        assert!(queue.has_option(QueueOption::Loop));
        queue.toggle_option(QueueOption::Loop);
        assert!(!queue.has_option(QueueOption::Loop));
    }
}
