use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};

use crate::error::StoreError;
use crate::models::{InactiveSong, Queue, QueueOption, Song, FIRST_POSITION};

/// Persistence boundary for queues, songs and the inactive-song holding area.
///
/// Implementations back this with SQL in production; the crate ships
/// [`MemoryStore`] for the binary default and for tests. Single-entity writes
/// are assumed atomic; there are no cross-entity transactions.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Fetches the queue for `(client_id, guild_id)` with its head song,
    /// current page window, and size counters filled in.
    async fn get_queue(&self, client_id: UserId, guild_id: GuildId) -> Result<Queue, StoreError>;

    /// Creates (or overwrites) the queue entity itself; songs are persisted
    /// separately.
    async fn persist_queue(&self, queue: &Queue) -> Result<(), StoreError>;

    /// Updates the queue's mutable fields (offset, limit, options, owning
    /// message).
    async fn update_queue(&self, queue: &Queue) -> Result<(), StoreError>;

    async fn remove_queue(&self, client_id: UserId, guild_id: GuildId) -> Result<(), StoreError>;

    /// All queues owned by this client, one per guild.
    async fn list_queues(&self, client_id: UserId) -> Result<Vec<Queue>, StoreError>;

    /// The non-head page `[offset, offset + limit)` in ascending position
    /// order.
    async fn get_songs(
        &self,
        client_id: UserId,
        guild_id: GuildId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Song>, StoreError>;

    async fn get_all_songs(
        &self,
        client_id: UserId,
        guild_id: GuildId,
    ) -> Result<Vec<Song>, StoreError>;

    /// Upserts songs by id. A song with `id == 0` gets a fresh id; a song
    /// with `position == 0` is appended after the current maximum position.
    /// Explicit non-zero positions are honored as given.
    async fn persist_songs(
        &self,
        client_id: UserId,
        guild_id: GuildId,
        songs: Vec<Song>,
    ) -> Result<Vec<Song>, StoreError>;

    async fn remove_songs(
        &self,
        client_id: UserId,
        guild_id: GuildId,
        ids: &[i64],
    ) -> Result<(), StoreError>;

    /// Moves songs into the holding area, stamped with the current time.
    async fn persist_inactive_songs(
        &self,
        client_id: UserId,
        guild_id: GuildId,
        songs: Vec<Song>,
    ) -> Result<(), StoreError>;

    /// Removes and returns the most recently parked inactive song.
    async fn pop_latest_inactive_song(
        &self,
        client_id: UserId,
        guild_id: GuildId,
    ) -> Result<Song, StoreError>;

    async fn inactive_song_count(
        &self,
        client_id: UserId,
        guild_id: GuildId,
    ) -> Result<i64, StoreError>;

    async fn song_count(&self, client_id: UserId, guild_id: GuildId) -> Result<i64, StoreError>;

    /// Bulk-purges inactive songs parked at or before `cutoff`, across all
    /// queues. Returns the number of rows removed.
    async fn remove_inactive_songs_before(&self, cutoff: SystemTime) -> Result<u64, StoreError>;
}

type QueueKey = (u64, u64);

struct GuildRecord {
    channel_id: ChannelId,
    message_id: MessageId,
    offset: i64,
    limit: i64,
    options: HashSet<QueueOption>,
    songs: Vec<Song>,
    inactive: Vec<InactiveSong>,
}

/// In-memory [`PersistentStore`]. Keeps one record per `(client, guild)` key
/// behind a single mutex; every operation is a short critical section.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<QueueKey, GuildRecord>>,
    next_song_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            next_song_id: AtomicI64::new(1),
        }
    }

    fn key(client_id: UserId, guild_id: GuildId) -> QueueKey {
        (client_id.0, guild_id.0)
    }

    fn build_view(client_id: UserId, guild_id: GuildId, record: &GuildRecord) -> Queue {
        let mut sorted = record.songs.clone();
        sorted.sort_by_key(|song| song.position);

        let head_song = sorted.first().cloned();
        let size = sorted.len() as i64;

        let start = (record.offset + 1).min(size).max(0) as usize;
        let end = (record.offset + 1 + record.limit).min(size).max(0) as usize;
        let songs = sorted.get(start..end).map(<[Song]>::to_vec).unwrap_or_default();

        Queue {
            client_id,
            guild_id,
            channel_id: record.channel_id,
            message_id: record.message_id,
            offset: record.offset,
            limit: record.limit,
            options: record.options.clone(),
            head_song,
            songs,
            size,
            inactive_size: record.inactive.len() as i64,
        }
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Test hook: shifts a parked song's timestamp into the past.
    pub fn backdate_inactive_song(
        &self,
        client_id: UserId,
        guild_id: GuildId,
        name: &str,
        by: std::time::Duration,
    ) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(&Self::key(client_id, guild_id)) {
            for inactive in &mut record.inactive {
                if inactive.song.name == name {
                    inactive.added_at = SystemTime::now() - by;
                }
            }
        }
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get_queue(&self, client_id: UserId, guild_id: GuildId) -> Result<Queue, StoreError> {
        let records = self.records.lock().unwrap();
        let record = records
            .get(&Self::key(client_id, guild_id))
            .ok_or(StoreError::NotFound)?;
        Ok(Self::build_view(client_id, guild_id, record))
    }

    async fn persist_queue(&self, queue: &Queue) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        records.insert(
            Self::key(queue.client_id, queue.guild_id),
            GuildRecord {
                channel_id: queue.channel_id,
                message_id: queue.message_id,
                offset: queue.offset,
                limit: queue.limit,
                options: queue.options.clone(),
                songs: Vec::new(),
                inactive: Vec::new(),
            },
        );
        Ok(())
    }

    async fn update_queue(&self, queue: &Queue) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&Self::key(queue.client_id, queue.guild_id))
            .ok_or(StoreError::NotFound)?;
        record.channel_id = queue.channel_id;
        record.message_id = queue.message_id;
        record.offset = queue.offset;
        record.limit = queue.limit;
        record.options = queue.options.clone();
        Ok(())
    }

    async fn remove_queue(&self, client_id: UserId, guild_id: GuildId) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        records
            .remove(&Self::key(client_id, guild_id))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn list_queues(&self, client_id: UserId) -> Result<Vec<Queue>, StoreError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|((client, _), _)| *client == client_id.0)
            .map(|((_, guild), record)| Self::build_view(client_id, GuildId(*guild), record))
            .collect())
    }

    async fn get_songs(
        &self,
        client_id: UserId,
        guild_id: GuildId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Song>, StoreError> {
        let records = self.records.lock().unwrap();
        let record = records
            .get(&Self::key(client_id, guild_id))
            .ok_or(StoreError::NotFound)?;

        let mut sorted = record.songs.clone();
        sorted.sort_by_key(|song| song.position);
        let size = sorted.len() as i64;
        let start = (offset + 1).min(size).max(0) as usize;
        let end = (offset + 1 + limit).min(size).max(0) as usize;
        Ok(sorted.get(start..end).map(<[Song]>::to_vec).unwrap_or_default())
    }

    async fn get_all_songs(
        &self,
        client_id: UserId,
        guild_id: GuildId,
    ) -> Result<Vec<Song>, StoreError> {
        let records = self.records.lock().unwrap();
        let record = records
            .get(&Self::key(client_id, guild_id))
            .ok_or(StoreError::NotFound)?;
        let mut sorted = record.songs.clone();
        sorted.sort_by_key(|song| song.position);
        Ok(sorted)
    }

    async fn persist_songs(
        &self,
        client_id: UserId,
        guild_id: GuildId,
        songs: Vec<Song>,
    ) -> Result<Vec<Song>, StoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&Self::key(client_id, guild_id))
            .ok_or(StoreError::NotFound)?;

        let mut persisted = Vec::with_capacity(songs.len());
        for mut song in songs {
            if song.id == 0 {
                song.id = self.next_song_id.fetch_add(1, Ordering::Relaxed);
            }
            if song.position == 0 {
                let max = record
                    .songs
                    .iter()
                    .filter(|existing| existing.id != song.id)
                    .map(|existing| existing.position)
                    .max()
                    .unwrap_or(FIRST_POSITION - 1);
                song.position = max + 1;
            }
            record.songs.retain(|existing| existing.id != song.id);
            record.songs.push(song.clone());
            persisted.push(song);
        }
        Ok(persisted)
    }

    async fn remove_songs(
        &self,
        client_id: UserId,
        guild_id: GuildId,
        ids: &[i64],
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&Self::key(client_id, guild_id))
            .ok_or(StoreError::NotFound)?;
        record.songs.retain(|song| !ids.contains(&song.id));
        Ok(())
    }

    async fn persist_inactive_songs(
        &self,
        client_id: UserId,
        guild_id: GuildId,
        songs: Vec<Song>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&Self::key(client_id, guild_id))
            .ok_or(StoreError::NotFound)?;
        let now = SystemTime::now();
        for song in songs {
            record.inactive.push(InactiveSong {
                song,
                added_at: now,
            });
        }
        Ok(())
    }

    async fn pop_latest_inactive_song(
        &self,
        client_id: UserId,
        guild_id: GuildId,
    ) -> Result<Song, StoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&Self::key(client_id, guild_id))
            .ok_or(StoreError::NotFound)?;

        let latest = record
            .inactive
            .iter()
            .enumerate()
            .max_by_key(|(_, inactive)| inactive.added_at)
            .map(|(index, _)| index)
            .ok_or(StoreError::NotFound)?;
        Ok(record.inactive.remove(latest).song)
    }

    async fn inactive_song_count(
        &self,
        client_id: UserId,
        guild_id: GuildId,
    ) -> Result<i64, StoreError> {
        let records = self.records.lock().unwrap();
        let record = records
            .get(&Self::key(client_id, guild_id))
            .ok_or(StoreError::NotFound)?;
        Ok(record.inactive.len() as i64)
    }

    async fn song_count(&self, client_id: UserId, guild_id: GuildId) -> Result<i64, StoreError> {
        let records = self.records.lock().unwrap();
        let record = records
            .get(&Self::key(client_id, guild_id))
            .ok_or(StoreError::NotFound)?;
        Ok(record.songs.len() as i64)
    }

    async fn remove_inactive_songs_before(&self, cutoff: SystemTime) -> Result<u64, StoreError> {
        let mut records = self.records.lock().unwrap();
        let mut removed = 0u64;
        for record in records.values_mut() {
            let before = record.inactive.len();
            record.inactive.retain(|inactive| inactive.added_at > cutoff);
            removed += (before - record.inactive.len()) as u64;
        }
        Ok(removed)
    }
}
