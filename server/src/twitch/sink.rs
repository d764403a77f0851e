use super::types::ChatEvent;

/// Message and target every chat record is logged under; the tailer filters on it.
pub const CHAT_RECORD_MARKER: &str = "chat.message";

/// Receives every normalized chat event, in arrival order.
pub trait ChatSink: Send + Sync {
    fn emit(&self, event: &ChatEvent);
}

/// Emits chat events as structured `tracing` records.
#[derive(Debug, Clone, Default)]
pub struct TracingChatSink {
    echo: bool,
}

impl TracingChatSink {
    pub fn new(echo: bool) -> Self {
        Self { echo }
    }
}

impl ChatSink for TracingChatSink {
    fn emit(&self, event: &ChatEvent) {
        let tags = serde_json::to_string(&event.tags).unwrap_or_else(|_| "{}".to_string());
        tracing::info!(
            target: CHAT_RECORD_MARKER,
            channel = %event.channel,
            author = %event.author,
            author_id = event.author_id.as_deref(),
            content = %event.content,
            tags = %tags,
            "chat.message"
        );
        if self.echo {
            println!("[{}] {}: {}", event.channel, event.author, event.content);
        }
    }
}
