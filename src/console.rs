//! Minimal line-based transport for running the daemon in a terminal.
//! Real deployments plug a chat client in behind [`ChatTransport`]; this
//! adapter exists so the binary is usable (and testable) standalone.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;

use crate::core::Daemon;
use crate::traits::ChatTransport;

/// The single console conversation id.
pub const CONSOLE_CHAT_ID: i64 = 0;

pub struct ConsoleTransport;

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        if chat_id == CONSOLE_CHAT_ID {
            println!("{}", text);
        } else {
            println!("[chat {}] {}", chat_id, text);
        }
        Ok(())
    }

    async fn edit_message(&self, chat_id: i64, _message_id: i64, text: &str) -> anyhow::Result<()> {
        self.send_message(chat_id, text).await
    }
}

/// Read stdin lines and run each as a turn until EOF.
pub async fn run_repl(daemon: Arc<Daemon>) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    println!("adjutant ready. Type a message (Ctrl-D to quit).");
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/health" {
            println!("{}", daemon.health());
            continue;
        }
        if let Err(e) = daemon.handle_incoming(CONSOLE_CHAT_ID, text).await {
            error!("turn failed: {}", e);
        }
    }
    Ok(())
}
