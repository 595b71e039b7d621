//! Notification transport port.

use async_trait::async_trait;

use crate::{OwnerId, SendError};

/// Delivers a text notification to a user.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Send `text` to `recipient`.
    ///
    /// `Ok` means the transport confirmed delivery.
    async fn send(&self, recipient: OwnerId, text: &str) -> Result<(), SendError>;
}
