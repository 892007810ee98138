pub mod telegram;

use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::NotifierError;

/// A reference to a previously-sent message, needed to later attach a chart
/// to it via `edit_media`.
#[derive(Debug, Clone)]
pub struct MessageRef {
    pub message_id: i64,
}

/// Sink for volume-surge signal notifications.
///
/// Uses `BoxFuture` instead of `async fn` in trait to keep the trait
/// object-safe (`dyn Notifier`).
pub trait Notifier: Send + Sync {
    /// Send a plain-text message. Returns `None` (rather than erroring) when
    /// the send genuinely produced no addressable message — callers treat
    /// that as "log and stop enriching", not as a hard failure.
    fn send_text<'a>(
        &'a self,
        token: &'a str,
        chat_id: i64,
        text: &'a str,
    ) -> BoxFuture<'a, Result<Option<MessageRef>, Report<NotifierError>>>;

    /// Attach a photo to a previously-sent message, replacing its caption.
    fn edit_media<'a>(
        &'a self,
        token: &'a str,
        chat_id: i64,
        message_ref: &'a MessageRef,
        photo_bytes: Vec<u8>,
        caption: &'a str,
    ) -> BoxFuture<'a, Result<(), Report<NotifierError>>>;

    fn close(&self) -> BoxFuture<'_, Result<(), Report<NotifierError>>>;
}
