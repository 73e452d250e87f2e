//! Hand-rolled fakes for the external collaborators, shared by the unit
//! tests.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, MessageId};

use crate::ack::{AckChannel, AckHandle};
use crate::error::{AckError, MediaError, VoiceError};
use crate::models::{Queue, Song};
use crate::render::{RenderVariant, RenderedView, Renderer};
use crate::voice::{MediaResolver, VoiceSession, VoiceTransport};

#[derive(Default)]
pub struct TestVoiceState {
    pub joins: AtomicUsize,
    pub stops: AtomicUsize,
    pub connected: AtomicBool,
    pub paused: AtomicBool,
    /// Streams finish immediately while this is positive; afterwards they
    /// hang until stopped or cancelled.
    pub completions: AtomicI64,
}

/// Fake voice gateway with a unit stream source.
#[derive(Default)]
pub struct TestVoice {
    state: Arc<TestVoiceState>,
    channel: Mutex<Option<ChannelId>>,
}

impl TestVoice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    /// Lets the next `n` streams complete immediately.
    pub fn allow_completions(&self, n: i64) {
        self.state.completions.store(n, Ordering::SeqCst);
    }

    pub fn joins(&self) -> usize {
        self.state.joins.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }
}

pub struct TestSession {
    state: Arc<TestVoiceState>,
}

#[async_trait]
impl VoiceTransport for TestVoice {
    type Source = ();
    type Session = TestSession;

    async fn join(
        &self,
        _guild_id: GuildId,
        _channel_id: ChannelId,
    ) -> Result<Self::Session, VoiceError> {
        self.state.joins.fetch_add(1, Ordering::SeqCst);
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(TestSession {
            state: Arc::clone(&self.state),
        })
    }

    fn is_connected(&self, _guild_id: GuildId) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn current_channel(&self, _guild_id: GuildId) -> Option<ChannelId> {
        *self.channel.lock().unwrap()
    }

    async fn set_paused(&self, _guild_id: GuildId, paused: bool) -> Result<(), VoiceError> {
        self.state.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl VoiceSession for TestSession {
    type Source = ();

    async fn stream(&self, _source: ()) -> Result<(), VoiceError> {
        if self.state.completions.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Ok(());
        }
        self.state.completions.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn position(&self) -> Duration {
        Duration::ZERO
    }

    async fn set_paused(&self, paused: bool) -> Result<(), VoiceError> {
        self.state.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Resolver producing unit sources, optionally failing every call.
#[derive(Default)]
pub struct TestResolver {
    pub fail: AtomicBool,
}

#[async_trait]
impl MediaResolver for TestResolver {
    type Source = ();

    async fn resolve(&self, song: &Song) -> Result<(), MediaError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MediaError::Resolve {
                name: song.name.clone(),
                reason: "test failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Records every outbound delivery; responses can be forced to fail to
/// exercise the edit fallback.
#[derive(Default)]
pub struct RecordingAck {
    responds: Mutex<Vec<u64>>,
    defers: Mutex<Vec<u64>>,
    edits: Mutex<Vec<(ChannelId, MessageId)>>,
    fail_responds: AtomicBool,
    next_message_id: AtomicI64,
}

impl RecordingAck {
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    pub fn fail_responds(&self, fail: bool) {
        self.fail_responds.store(fail, Ordering::SeqCst);
    }

    pub fn responds(&self) -> Vec<u64> {
        self.responds.lock().unwrap().clone()
    }

    pub fn defers(&self) -> Vec<u64> {
        self.defers.lock().unwrap().clone()
    }

    pub fn edit_count(&self) -> usize {
        self.edits.lock().unwrap().len()
    }
}

#[async_trait]
impl AckChannel for RecordingAck {
    async fn respond_via(&self, handle: &AckHandle, _view: &RenderedView) -> Result<(), AckError> {
        if self.fail_responds.load(Ordering::SeqCst) {
            return Err(AckError::Respond("forced failure".to_string()));
        }
        self.responds.lock().unwrap().push(handle.interaction_id());
        Ok(())
    }

    async fn defer(&self, handle: &AckHandle) -> Result<(), AckError> {
        self.defers.lock().unwrap().push(handle.interaction_id());
        Ok(())
    }

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        _view: &RenderedView,
    ) -> Result<(), AckError> {
        self.edits.lock().unwrap().push((channel_id, message_id));
        Ok(())
    }

    async fn create_message(
        &self,
        _channel_id: ChannelId,
        _view: &RenderedView,
    ) -> Result<MessageId, AckError> {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        Ok(MessageId(id as u64))
    }
}

/// Renderer that records which variant each convergence asked for.
#[derive(Default)]
pub struct RecordingRenderer {
    variants: Mutex<Vec<RenderVariant>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variants(&self) -> Vec<RenderVariant> {
        self.variants.lock().unwrap().clone()
    }
}

impl Renderer for RecordingRenderer {
    fn render(&self, _queue: &Queue, variant: RenderVariant) -> RenderedView {
        self.variants.lock().unwrap().push(variant);
        RenderedView::default()
    }
}
