use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::AckError;
use crate::render::RenderedView;
use serenity::model::id::{ChannelId, MessageId};

/// How long after its trigger a handle stays usable. Kept strictly under the
/// platform's hard three-second response deadline.
pub const RESPONSE_DEADLINE: Duration = Duration::from_millis(2500);

/// A one-shot token for a pending interaction acknowledgment.
///
/// Clones share the claim flag: whoever `claim`s first owns the single
/// response. The deadline is absolute and strictly earlier than the
/// platform's hard response deadline, leaving the expiry watcher room to
/// auto-acknowledge.
#[derive(Clone)]
pub struct AckHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    interaction_id: u64,
    token: String,
    deadline: Instant,
    claimed: AtomicBool,
}

impl AckHandle {
    pub fn new(interaction_id: u64, token: &str, deadline: Instant) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                interaction_id,
                token: token.to_string(),
                deadline,
                claimed: AtomicBool::new(false),
            }),
        }
    }

    pub fn interaction_id(&self) -> u64 {
        self.inner.interaction_id
    }

    pub fn token(&self) -> &str {
        &self.inner.token
    }

    pub fn deadline(&self) -> Instant {
        self.inner.deadline
    }

    /// Takes single-use ownership of the handle. Only the first caller gets
    /// `true`; everyone else must use another delivery path.
    pub fn claim(&self) -> bool {
        self.inner
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.inner.claimed.load(Ordering::Acquire)
    }
}

/// Outbound delivery surface: interaction responses and the always-available
/// message channel.
#[async_trait]
pub trait AckChannel: Send + Sync {
    /// Responds through a claimed handle with the rendered queue view.
    async fn respond_via(&self, handle: &AckHandle, view: &RenderedView) -> Result<(), AckError>;

    /// Bare acknowledgment with no visible change, used by expiry watchers so
    /// an unused interaction never surfaces a failure to the user.
    async fn defer(&self, handle: &AckHandle) -> Result<(), AckError>;

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        view: &RenderedView,
    ) -> Result<(), AckError>;

    async fn create_message(
        &self,
        channel_id: ChannelId,
        view: &RenderedView,
    ) -> Result<MessageId, AckError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn only_the_first_claim_wins() {
        let handle = AckHandle::new(7, "t", Instant::now() + Duration::from_secs(2));
        let clone = handle.clone();
        assert!(handle.claim());
        assert!(!clone.claim());
        assert!(clone.is_claimed());
    }
}
