mod anthropic;
mod error;
mod retry;

pub use anthropic::AnthropicProvider;
pub use error::{is_transient, ProviderError, ProviderErrorKind};
pub use retry::{with_retry, RetryPolicy};
