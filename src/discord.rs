//! Serenity/songbird implementations of the engine's collaborator traits,
//! plus the gateway event handler that turns Discord triggers into
//! transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use serenity::client::{Context, EventHandler};
use serenity::http::Http;
use serenity::model::application::command::Command;
use serenity::model::application::component::ActionRowComponent;
use serenity::model::application::interaction::application_command::ApplicationCommandInteraction;
use serenity::model::application::interaction::message_component::MessageComponentInteraction;
use serenity::model::application::interaction::modal::ModalSubmitInteraction;
use serenity::model::application::interaction::Interaction;
use serenity::model::gateway::Ready;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use serenity::model::prelude::VoiceState;
use songbird::input::{ytdl, ytdl_search, Input};
use songbird::tracks::TrackHandle;
use songbird::{Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ack::{AckChannel, AckHandle, RESPONSE_DEADLINE};
use crate::error::{AckError, MediaError, StoreError, VoiceError};
use crate::janitor;
use crate::models::{Queue, QueueOption, Song, TriggerKind};
use crate::ordering;
use crate::player::PlaybackEngine;
use crate::registry::GuildRegistry;
use crate::render::{RenderVariant, RenderedView, Renderer};
use crate::store::PersistentStore;
use crate::transaction::{Coordinator, DEFAULT_UPDATE_TIMEOUT};
use crate::voice::{MediaResolver, VoiceSession, VoiceTransport};

pub const BTN_JOIN: &str = "queue-join";
pub const BTN_PAUSE: &str = "queue-pause";
pub const BTN_LOOP: &str = "queue-loop";
pub const BTN_SHUFFLE: &str = "queue-shuffle";
pub const BTN_FORWARD: &str = "queue-forward";
pub const BTN_BACKWARD: &str = "queue-backward";
pub const BTN_SKIP: &str = "queue-skip";
pub const BTN_PREVIOUS: &str = "queue-previous";
pub const BTN_ADD: &str = "queue-add";
pub const MODAL_ADD_SONGS: &str = "queue-add-songs";
const INPUT_SONG_NAMES: &str = "song-names";

// Discord component/interaction wire constants.
const COMPONENT_ACTION_ROW: u8 = 1;
const COMPONENT_BUTTON: u8 = 2;
const COMPONENT_TEXT_INPUT: u8 = 4;
const STYLE_PRIMARY: u8 = 1;
const STYLE_SECONDARY: u8 = 2;
const RESPONSE_MESSAGE: u8 = 4;
const RESPONSE_DEFERRED_UPDATE: u8 = 6;
const RESPONSE_UPDATE_MESSAGE: u8 = 7;
const RESPONSE_MODAL: u8 = 9;
const EPHEMERAL_FLAG: u8 = 64;

const DEFAULT_EMBED_COLOR: i32 = 0x5865F2;

/// Voice gateway backed by songbird.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    tracks: Arc<StdMutex<HashMap<GuildId, TrackHandle>>>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self {
            manager,
            tracks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn track(&self, guild_id: GuildId) -> Option<TrackHandle> {
        self.tracks.lock().unwrap().get(&guild_id).cloned()
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    type Source = Input;
    type Session = SongbirdSession;

    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<SongbirdSession, VoiceError> {
        let (call, result) = self.manager.join(guild_id, channel_id).await;
        result.map_err(|err| VoiceError::Join(format!("{err:?}")))?;

        {
            let mut handler = call.lock().await;
            if !handler.is_deaf() {
                if let Err(err) = handler.deafen(true).await {
                    debug!("deafen failed: {err:?}");
                }
            }
        }

        Ok(SongbirdSession {
            guild_id,
            call,
            tracks: Arc::clone(&self.tracks),
        })
    }

    fn is_connected(&self, guild_id: GuildId) -> bool {
        self.manager.get(guild_id).is_some()
    }

    async fn current_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        let call = self.manager.get(guild_id)?;
        let channel = call.lock().await.current_channel()?;
        Some(ChannelId(channel.0))
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> Result<(), VoiceError> {
        let Some(track) = self.track(guild_id) else {
            return Err(VoiceError::NotConnected);
        };
        let result = if paused { track.pause() } else { track.play() };
        result.map_err(|err| VoiceError::Stream(format!("{err:?}")))
    }
}

pub struct SongbirdSession {
    guild_id: GuildId,
    call: Arc<tokio::sync::Mutex<Call>>,
    tracks: Arc<StdMutex<HashMap<GuildId, TrackHandle>>>,
}

struct TrackEndNotifier {
    done: StdMutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        if let Some(done) = self.done.lock().unwrap().take() {
            let _ = done.send(());
        }
        None
    }
}

#[async_trait]
impl VoiceSession for SongbirdSession {
    type Source = Input;

    async fn stream(&self, source: Input) -> Result<(), VoiceError> {
        let (done_tx, done_rx) = oneshot::channel();
        let track = {
            let mut call = self.call.lock().await;
            call.play_only_source(source)
        };
        track
            .add_event(
                Event::Track(TrackEvent::End),
                TrackEndNotifier {
                    done: StdMutex::new(Some(done_tx)),
                },
            )
            .map_err(|err| VoiceError::Stream(format!("{err:?}")))?;
        self.tracks.lock().unwrap().insert(self.guild_id, track);

        // Held open until the track-end event fires.
        let _ = done_rx.await;
        self.tracks.lock().unwrap().remove(&self.guild_id);
        Ok(())
    }

    async fn position(&self) -> Duration {
        let track = self.tracks.lock().unwrap().get(&self.guild_id).cloned();
        match track {
            Some(track) => track
                .get_info()
                .await
                .map(|state| state.position)
                .unwrap_or_default(),
            None => Duration::ZERO,
        }
    }

    async fn set_paused(&self, paused: bool) -> Result<(), VoiceError> {
        let track = self
            .tracks
            .lock()
            .unwrap()
            .get(&self.guild_id)
            .cloned()
            .ok_or(VoiceError::NotConnected)?;
        let result = if paused { track.pause() } else { track.play() };
        result.map_err(|err| VoiceError::Stream(format!("{err:?}")))
    }

    async fn stop(&self) {
        if let Some(track) = self.tracks.lock().unwrap().remove(&self.guild_id) {
            let _ = track.stop();
        }
        self.call.lock().await.stop();
    }
}

/// Resolves songs to a playable input with yt-dlp, searching by name unless
/// the name is already a URL (the same split the prefix-command bots use).
#[derive(Default)]
pub struct YtdlResolver;

#[async_trait]
impl MediaResolver for YtdlResolver {
    type Source = Input;

    async fn resolve(&self, song: &Song) -> Result<Input, MediaError> {
        let result = if song.name.starts_with("http") {
            ytdl(&song.name).await
        } else {
            ytdl_search(&song.name).await
        };
        result.map_err(|err| MediaError::Resolve {
            name: song.name.clone(),
            reason: format!("{err:?}"),
        })
    }
}

/// Outbound delivery through Discord's HTTP API using raw JSON payloads, so
/// rendered views stay opaque all the way to the wire.
pub struct DiscordAckChannel {
    http: Arc<Http>,
}

impl DiscordAckChannel {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn view_payload(view: &RenderedView) -> Value {
    let mut map = serde_json::Map::new();
    if let Some(content) = &view.content {
        map.insert("content".to_string(), json!(content));
    }
    map.insert("embeds".to_string(), Value::Array(view.embeds.clone()));
    map.insert(
        "components".to_string(),
        Value::Array(view.components.clone()),
    );
    Value::Object(map)
}

#[async_trait]
impl AckChannel for DiscordAckChannel {
    async fn respond_via(&self, handle: &AckHandle, view: &RenderedView) -> Result<(), AckError> {
        let payload = json!({
            "type": RESPONSE_UPDATE_MESSAGE,
            "data": view_payload(view),
        });
        self.http
            .create_interaction_response(handle.interaction_id(), handle.token(), &payload)
            .await
            .map_err(|err| AckError::Respond(err.to_string()))
    }

    async fn defer(&self, handle: &AckHandle) -> Result<(), AckError> {
        let payload = json!({ "type": RESPONSE_DEFERRED_UPDATE });
        self.http
            .create_interaction_response(handle.interaction_id(), handle.token(), &payload)
            .await
            .map_err(|err| AckError::Respond(err.to_string()))
    }

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        view: &RenderedView,
    ) -> Result<(), AckError> {
        self.http
            .edit_message(channel_id.0, message_id.0, &view_payload(view))
            .await
            .map(|_| ())
            .map_err(|err| AckError::Edit(err.to_string()))
    }

    async fn create_message(
        &self,
        channel_id: ChannelId,
        view: &RenderedView,
    ) -> Result<MessageId, AckError> {
        self.http
            .send_message(channel_id.0, &view_payload(view))
            .await
            .map(|message| message.id)
            .map_err(|err| AckError::Send(err.to_string()))
    }
}

/// Renders the queue embed and its button rows.
#[derive(Default)]
pub struct QueueRenderer;

fn button(label: &str, custom_id: &str, style: u8, disabled: bool) -> Value {
    json!({
        "type": COMPONENT_BUTTON,
        "label": label,
        "custom_id": custom_id,
        "style": style,
        "disabled": disabled,
    })
}

fn row(buttons: Vec<Value>) -> Value {
    json!({ "type": COMPONENT_ACTION_ROW, "components": buttons })
}

fn queue_embed(queue: &Queue) -> Value {
    let mut description = String::new();
    match &queue.head_song {
        Some(head) => {
            description.push_str(&format!(
                "**Now playing**\n`[{}]` {}\n",
                head.duration_display(),
                head.name
            ));
        }
        None => description.push_str("The queue is empty, add some songs.\n"),
    }
    if !queue.songs.is_empty() {
        description.push_str("\n**Up next**\n");
        for (index, song) in queue.songs.iter().enumerate() {
            // The head is #1, the window starts after it.
            let ordinal = queue.offset + index as i64 + 2;
            description.push_str(&format!(
                "`{ordinal:>3}.` `[{}]` {}\n",
                song.duration_display(),
                song.short_name
            ));
        }
    }

    let others = (queue.size - 1).max(0);
    let pages = if others <= queue.limit {
        1
    } else {
        (others + queue.limit - 1) / queue.limit
    };
    let page = queue.offset / queue.limit + 1;
    let color = queue
        .head_song
        .as_ref()
        .map(|head| head.color)
        .filter(|color| *color != 0)
        .unwrap_or(DEFAULT_EMBED_COLOR);

    json!({
        "title": "Music queue",
        "description": description,
        "color": color,
        "footer": {
            "text": format!(
                "Page {page}/{pages} • {} queued • {} played",
                queue.size, queue.inactive_size
            ),
        },
    })
}

impl Renderer for QueueRenderer {
    fn render(&self, queue: &Queue, variant: RenderVariant) -> RenderedView {
        let components = match variant {
            RenderVariant::Disabled => {
                vec![row(vec![button("Offline", BTN_JOIN, STYLE_SECONDARY, true)])]
            }
            RenderVariant::JoinPrompt => {
                vec![row(vec![button("Join", BTN_JOIN, STYLE_PRIMARY, false)])]
            }
            RenderVariant::Interactive => {
                let paused = queue.has_option(QueueOption::Paused);
                let looping = queue.has_option(QueueOption::Loop);
                let style_for = |on: bool| if on { STYLE_PRIMARY } else { STYLE_SECONDARY };
                vec![
                    row(vec![
                        button("⏮", BTN_PREVIOUS, STYLE_SECONDARY, queue.inactive_size == 0),
                        button("⏯", BTN_PAUSE, style_for(paused), queue.head_song.is_none()),
                        button("⏭", BTN_SKIP, STYLE_SECONDARY, queue.head_song.is_none()),
                        button("🔁", BTN_LOOP, style_for(looping), false),
                    ]),
                    row(vec![
                        button("◀", BTN_BACKWARD, STYLE_SECONDARY, queue.size - 1 <= queue.limit),
                        button("▶", BTN_FORWARD, STYLE_SECONDARY, queue.size - 1 <= queue.limit),
                        button("🔀", BTN_SHUFFLE, STYLE_SECONDARY, queue.size < 3),
                        button("Add songs", BTN_ADD, STYLE_SECONDARY, false),
                    ]),
                ]
            }
        };

        RenderedView {
            content: None,
            embeds: vec![queue_embed(queue)],
            components,
        }
    }
}

/// Ordering position for a song revived from the holding area: strictly
/// ahead of the current head. A head at position 1 would yield 0, which the
/// store reads as its append sentinel, so drop below it instead; positions
/// may go negative, the store honors them as given. An empty queue appends.
fn revive_position(head: Option<&Song>) -> i64 {
    match head {
        Some(head) if head.position == 1 => -1,
        Some(head) => head.position - 1,
        None => 0,
    }
}

const SLOT_POLL_ATTEMPTS: u32 = 20;
const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Polls until the guild's player slot frees. `false` when it is still held
/// after the last attempt.
async fn wait_for_player_slot(registry: &GuildRegistry, guild_id: GuildId) -> bool {
    for _ in 0..SLOT_POLL_ATTEMPTS {
        if !registry.is_player_active(guild_id) {
            return true;
        }
        tokio::time::sleep(SLOT_POLL_INTERVAL).await;
    }
    !registry.is_player_active(guild_id)
}

/// Gateway event handler: every incoming trigger becomes a transaction and
/// flows through the coordinator and the engine.
pub struct Bot {
    pub client_id: UserId,
    pub store: Arc<dyn PersistentStore>,
    pub registry: Arc<GuildRegistry>,
    pub voice: Arc<SongbirdTransport>,
    pub renderer: Arc<dyn Renderer>,
    pub ack: Arc<dyn AckChannel>,
    pub coordinator: Arc<Coordinator<SongbirdTransport>>,
    pub engine: Arc<PlaybackEngine<SongbirdTransport, YtdlResolver>>,
    pub page_limit: i64,
    pub inactive_ttl: Duration,
    pub cancel: CancellationToken,
    pub ready_tx: watch::Sender<bool>,
    pub janitor_started: AtomicBool,
}

impl Bot {
    fn component_handle(component: &MessageComponentInteraction) -> AckHandle {
        AckHandle::new(
            component.id.0,
            &component.token,
            Instant::now() + RESPONSE_DEADLINE,
        )
    }

    async fn handle_command(&self, ctx: &Context, command: &ApplicationCommandInteraction) {
        if command.data.name != "music" {
            return;
        }
        let Some(guild_id) = command.guild_id else {
            return;
        };
        info!("creating queue message for guild {guild_id}");

        let mut queue = Queue::new(self.client_id, guild_id, command.channel_id, MessageId(0));
        queue.limit = self.page_limit.max(1);
        let view = self.renderer.render(&queue, RenderVariant::JoinPrompt);
        let message_id = match self.ack.create_message(command.channel_id, &view).await {
            Ok(message_id) => message_id,
            Err(err) => {
                warn!("could not create the queue message in guild {guild_id}: {err}");
                return;
            }
        };
        queue.message_id = message_id;
        if let Err(err) = self.store.persist_queue(&queue).await {
            warn!("could not persist the queue for guild {guild_id}: {err}");
            return;
        }

        let payload = json!({
            "type": RESPONSE_MESSAGE,
            "data": { "content": "Queue created.", "flags": EPHEMERAL_FLAG },
        });
        if let Err(err) = ctx
            .http
            .create_interaction_response(command.id.0, &command.token, &payload)
            .await
        {
            debug!("command acknowledgment failed: {err}");
        }

        let transaction =
            self.coordinator
                .new_transaction(TriggerKind::ApplicationCommand, guild_id, None);
        let _ = transaction
            .update_queue(&self.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await;
    }

    async fn handle_component(&self, ctx: &Context, component: &MessageComponentInteraction) {
        let Some(guild_id) = component.guild_id else {
            return;
        };
        let custom_id = component.data.custom_id.as_str();

        // The add button answers with a modal, which is its own response
        // type; it must not go through the handle/update machinery.
        if custom_id == BTN_ADD {
            self.open_add_songs_modal(ctx, component).await;
            return;
        }

        let handle = Self::component_handle(component);
        let transaction =
            self.coordinator
                .new_transaction(TriggerKind::ButtonClick, guild_id, Some(handle));

        let result = match custom_id {
            BTN_JOIN => self.join_voice(ctx, component, guild_id).await,
            BTN_PAUSE => self.toggle_pause(guild_id).await,
            BTN_LOOP => self.toggle_loop(guild_id).await,
            BTN_SHUFFLE => self.shuffle_songs(guild_id).await,
            BTN_FORWARD => self.turn_page(guild_id, true).await,
            BTN_BACKWARD => self.turn_page(guild_id, false).await,
            BTN_SKIP => self.skip_song(guild_id).await,
            BTN_PREVIOUS => self.play_previous(guild_id).await,
            other => {
                debug!("unknown queue control {other}");
                transaction.defer();
                return;
            }
        };
        if let Err(err) = result {
            warn!("{custom_id} failed for guild {guild_id}: {err}");
        }

        if let Err(err) = transaction
            .update_queue(&self.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
        {
            debug!("convergence after {custom_id} failed: {err}");
        }
    }

    async fn open_add_songs_modal(&self, ctx: &Context, component: &MessageComponentInteraction) {
        let payload = json!({
            "type": RESPONSE_MODAL,
            "data": {
                "custom_id": MODAL_ADD_SONGS,
                "title": "Add songs",
                "components": [{
                    "type": COMPONENT_ACTION_ROW,
                    "components": [{
                        "type": COMPONENT_TEXT_INPUT,
                        "custom_id": INPUT_SONG_NAMES,
                        "label": "One song name or URL per line",
                        "style": 2,
                        "required": true,
                    }],
                }],
            },
        });
        if let Err(err) = ctx
            .http
            .create_interaction_response(component.id.0, &component.token, &payload)
            .await
        {
            warn!("could not open the add-songs modal: {err}");
        }
    }

    async fn handle_modal(&self, modal: &ModalSubmitInteraction) {
        let Some(guild_id) = modal.guild_id else {
            return;
        };
        if modal.data.custom_id != MODAL_ADD_SONGS {
            return;
        }

        let mut names: Vec<String> = Vec::new();
        for action_row in &modal.data.components {
            for component in &action_row.components {
                if let ActionRowComponent::InputText(input) = component {
                    names.extend(
                        input
                            .value
                            .lines()
                            .map(str::trim)
                            .filter(|line| !line.is_empty())
                            .map(String::from),
                    );
                }
            }
        }

        let handle = AckHandle::new(modal.id.0, &modal.token, Instant::now() + RESPONSE_DEADLINE);
        let transaction =
            self.coordinator
                .new_transaction(TriggerKind::ModalSubmit, guild_id, Some(handle));

        if !names.is_empty() {
            info!("adding {} songs to guild {guild_id}", names.len());
            let songs = names.iter().map(|name| Song::new(name)).collect();
            if let Err(err) = self.store.persist_songs(self.client_id, guild_id, songs).await {
                warn!("persisting added songs failed for guild {guild_id}: {err}");
            } else if !self.registry.is_player_active(guild_id) {
                // Already in voice with an idle player: start playing.
                if let Some(channel_id) = self.voice.current_channel(guild_id).await {
                    let engine = Arc::clone(&self.engine);
                    tokio::spawn(async move { engine.play(guild_id, Some(channel_id)).await });
                }
            }
        }

        if let Err(err) = transaction
            .update_queue(&self.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await
        {
            debug!("convergence after adding songs failed: {err}");
        }
    }

    async fn join_voice(
        &self,
        ctx: &Context,
        component: &MessageComponentInteraction,
        guild_id: GuildId,
    ) -> Result<(), StoreError> {
        let user_id = component.user.id;
        let channel_id = ctx.cache.guild(guild_id).and_then(|guild| {
            guild
                .voice_states
                .get(&user_id)
                .and_then(|state| state.channel_id)
        });
        let Some(channel_id) = channel_id else {
            debug!("join requested by a user outside voice in guild {guild_id}");
            return Ok(());
        };

        let mut queue = self.store.get_queue(self.client_id, guild_id).await?;
        queue.clear_option(QueueOption::Inactive);
        self.store.update_queue(&queue).await?;

        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move { engine.play(guild_id, Some(channel_id)).await });
        Ok(())
    }

    async fn toggle_pause(&self, guild_id: GuildId) -> Result<(), StoreError> {
        let mut queue = self.store.get_queue(self.client_id, guild_id).await?;
        queue.toggle_option(QueueOption::Paused);
        let paused = queue.has_option(QueueOption::Paused);
        self.store.update_queue(&queue).await?;
        if let Err(err) = self.voice.set_paused(guild_id, paused).await {
            debug!("pause toggled without a live track in guild {guild_id}: {err}");
        }
        Ok(())
    }

    async fn toggle_loop(&self, guild_id: GuildId) -> Result<(), StoreError> {
        let mut queue = self.store.get_queue(self.client_id, guild_id).await?;
        queue.toggle_option(QueueOption::Loop);
        self.store.update_queue(&queue).await
    }

    async fn shuffle_songs(&self, guild_id: GuildId) -> Result<(), StoreError> {
        let mut songs = self.store.get_all_songs(self.client_id, guild_id).await?;
        ordering::shuffle(&mut songs);
        self.store
            .persist_songs(self.client_id, guild_id, songs)
            .await
            .map(|_| ())
    }

    async fn turn_page(&self, guild_id: GuildId, forward: bool) -> Result<(), StoreError> {
        let mut queue = self.store.get_queue(self.client_id, guild_id).await?;
        if forward {
            ordering::increment_offset(&mut queue);
        } else {
            ordering::decrement_offset(&mut queue);
        }
        self.store.update_queue(&queue).await
    }

    async fn skip_song(&self, guild_id: GuildId) -> Result<(), StoreError> {
        let queue = self.store.get_queue(self.client_id, guild_id).await?;
        let Some(head) = queue.head_song else {
            return Ok(());
        };
        // Park the skipped song so "previous" can bring it back.
        self.store
            .persist_inactive_songs(self.client_id, guild_id, vec![head.clone()])
            .await?;
        self.store
            .remove_songs(self.client_id, guild_id, &[head.id])
            .await?;
        self.restart_playback(guild_id).await;
        Ok(())
    }

    async fn play_previous(&self, guild_id: GuildId) -> Result<(), StoreError> {
        let mut song = match self
            .store
            .pop_latest_inactive_song(self.client_id, guild_id)
            .await
        {
            Ok(song) => song,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        let queue = self.store.get_queue(self.client_id, guild_id).await?;
        song.position = revive_position(queue.head_song.as_ref());
        self.store
            .persist_songs(self.client_id, guild_id, vec![song])
            .await?;
        self.restart_playback(guild_id).await;
        Ok(())
    }

    /// Stops the active stream and re-triggers `play` once the slot frees.
    async fn restart_playback(&self, guild_id: GuildId) {
        self.engine.stop(guild_id);
        let Some(channel_id) = self.voice.current_channel(guild_id).await else {
            return;
        };
        let engine = Arc::clone(&self.engine);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            // Give the stopped loop a moment to release the player slot.
            if !wait_for_player_slot(&registry, guild_id).await {
                debug!("player slot for guild {guild_id} did not free, handing off anyway");
            }
            engine.play(guild_id, Some(channel_id)).await;
        });
    }
}

#[async_trait]
impl EventHandler for Bot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected", ready.user.name);

        if let Err(err) = Command::create_global_application_command(&ctx.http, |command| {
            command
                .name("music")
                .description("Create the music queue message for this server")
        })
        .await
        {
            warn!("slash command registration failed: {err}");
        }

        let _ = self.ready_tx.send(true);

        if !self.janitor_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(janitor::run(
                Arc::clone(&self.store),
                self.inactive_ttl,
                self.cancel.clone(),
            ));
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move { coordinator.run_cleanup_sweep().await });
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        match interaction {
            Interaction::ApplicationCommand(command) => self.handle_command(&ctx, &command).await,
            Interaction::MessageComponent(component) => {
                self.handle_component(&ctx, &component).await
            }
            Interaction::ModalSubmit(modal) => self.handle_modal(&modal).await,
            _ => {}
        }
    }

    async fn voice_state_update(&self, _ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        if new.user_id != self.client_id || new.channel_id.is_some() {
            return;
        }
        info!("disconnected from voice in guild {guild_id}");
        self.engine.stop(guild_id);

        let transaction =
            self.coordinator
                .new_transaction(TriggerKind::VoiceStateUpdate, guild_id, None);
        match self.store.get_queue(self.client_id, guild_id).await {
            Ok(mut queue) => {
                queue.set_option(QueueOption::Inactive);
                queue.clear_option(QueueOption::Paused);
                if let Err(err) = self.store.update_queue(&queue).await {
                    warn!("marking the queue inactive failed for guild {guild_id}: {err}");
                }
            }
            Err(err) if err.is_not_found() => {
                transaction.defer();
                return;
            }
            Err(err) => warn!("queue fetch after disconnect failed: {err}"),
        }
        let _ = transaction
            .update_queue(&self.coordinator, DEFAULT_UPDATE_TIMEOUT)
            .await;
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        _channel_id: ChannelId,
        deleted_message_id: MessageId,
        guild_id: Option<GuildId>,
    ) {
        let Some(guild_id) = guild_id else {
            return;
        };
        match self.store.get_queue(self.client_id, guild_id).await {
            Ok(queue) if queue.message_id == deleted_message_id => {
                info!("queue message deleted in guild {guild_id}, tearing the queue down");
                self.engine.stop(guild_id);
                if let Err(err) = self.store.remove_queue(self.client_id, guild_id).await {
                    warn!("queue removal failed for guild {guild_id}: {err}");
                }
            }
            _ => {}
        }
    }
}
