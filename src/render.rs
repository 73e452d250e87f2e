use serde_json::Value;

use crate::models::Queue;

/// Which control surface the queue message should show.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderVariant {
    /// The bot is not ready yet; a single disabled placeholder control.
    Disabled,
    /// No live voice connection for the guild; a lone join control.
    JoinPrompt,
    /// The full interactive control set, with Loop/Pause visually toggled
    /// from the queue's option set.
    Interactive,
}

/// Opaque, already-rendered message payload. The coordinator never inspects
/// it; adapters turn it into the platform's wire format.
#[derive(Clone, Debug, Default)]
pub struct RenderedView {
    pub content: Option<String>,
    pub embeds: Vec<Value>,
    pub components: Vec<Value>,
}

/// Pure view builder over a queue snapshot.
pub trait Renderer: Send + Sync {
    fn render(&self, queue: &Queue, variant: RenderVariant) -> RenderedView;
}
