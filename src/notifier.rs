pub mod terminal;

use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::NotifyError;

/// Sink for outbound messages to a subscriber.
///
/// `TerminalNotifier` is the only implementation shipped here. A
/// `TelegramNotifier` (chat-bot delivery) is a natural second
/// implementation of this trait but belongs to the peripheral chat-command
/// surface, not the core — wiring one in is a matter of implementing
/// `Notifier` against the Telegram Bot API and swapping it in at the
/// construction site in `main.rs`, nothing in the orchestrator changes.
pub trait Notifier: Send + Sync {
    /// Send `text` to `chat_id`. When `parse_markdown` is set the
    /// implementation should render Telegram-style markdown; plain text
    /// otherwise.
    fn send(
        &self,
        chat_id: i64,
        text: &str,
        parse_markdown: bool,
    ) -> BoxFuture<'_, Result<(), Report<NotifyError>>>;
}
