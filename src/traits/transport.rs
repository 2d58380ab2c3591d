use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

/// Chat transport — the narrow surface the core needs from whatever chat
/// client fronts the daemon. The core never sees the wire format.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()>;

    async fn edit_message(&self, chat_id: i64, message_id: i64, text: &str) -> anyhow::Result<()>;

    async fn send_typing(&self, chat_id: i64) -> anyhow::Result<()> {
        let _ = chat_id;
        Ok(())
    }
}

/// Injected send callback for subsystems (agents, reminders, cron payloads)
/// that must deliver messages without owning the transport.
pub type SendFn = Arc<
    dyn Fn(i64, String) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync,
>;

/// Wrap a transport into a [`SendFn`] for injection.
pub fn send_fn_for(transport: Arc<dyn ChatTransport>) -> SendFn {
    Arc::new(move |chat_id, text| {
        let transport = transport.clone();
        Box::pin(async move { transport.send_message(chat_id, &text).await })
    })
}
