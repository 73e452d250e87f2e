use thiserror::Error;

/// Errors surfaced by [`crate::store::PersistentStore`] implementations.
///
/// `NotFound` is a domain signal ("nothing to do"), kept distinct from
/// transport-level backend failures so callers can branch on it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity not found")]
    NotFound,
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("failed to join voice channel: {0}")]
    Join(String),
    #[error("audio stream failed: {0}")]
    Stream(String),
    #[error("not connected to a voice channel")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("could not resolve a stream source for {name}: {reason}")]
    Resolve { name: String, reason: String },
}

/// Delivery failures on the acknowledgment/message-edit paths. Always
/// recoverable: the coordinator falls back to the alternate path or logs.
#[derive(Debug, Error)]
pub enum AckError {
    #[error("interaction response failed: {0}")]
    Respond(String),
    #[error("message edit failed: {0}")]
    Edit(String),
    #[error("message send failed: {0}")]
    Send(String),
}
