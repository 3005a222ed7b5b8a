use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::NotifyError;
use crate::notifier::Notifier;

/// Logs outbound messages instead of delivering them anywhere. Used for
/// local development and as a safe default when no chat backend is wired up.
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn send(
        &self,
        chat_id: i64,
        text: &str,
        parse_markdown: bool,
    ) -> BoxFuture<'_, Result<(), Report<NotifyError>>> {
        Box::pin(async move {
            tracing::info!(chat_id, parse_markdown, "{}", text);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminal_notifier_does_not_fail() {
        let notifier = TerminalNotifier;
        let result = notifier.send(1234, "RSI(14) dropped below 30 on BTCUSDT", true).await;
        assert!(result.is_ok());
    }
}
