//! Shared domain types + core interfaces (traits) used across the codebase.
//!
//! Kept as a thin re-export layer so `crate::traits::*` stays stable for
//! call sites while the individual areas evolve independently.

mod message;
mod provider;
mod runner;
mod tools;
mod transport;

pub use message::{ContentBlock, Message, MessageContent, Role};
pub use provider::{
    ChatRequest, ModelProvider, ProviderResponse, StopReason, StreamChunkFn, TokenUsage,
};
pub use runner::TurnRunner;
pub use tools::Tool;
pub use transport::{send_fn_for, ChatTransport, SendFn};
