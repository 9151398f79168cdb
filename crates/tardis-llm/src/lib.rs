//! Chat-completion providers and the fallback chain.

mod fallback;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
mod openai;

pub use fallback::{FallbackManager, FallbackOutcome, FallbackStrategy, StrategyStats};
pub use openai::OpenAiCompatibleProvider;
pub use tardis_types::{
    Attempt, ChatMessage, CompletionRequest, CompletionResponse, FallbackError, LlmError,
    LlmProvider, TokenUsage,
};

#[cfg(any(test, feature = "test-util"))]
pub use mock::MockProvider;
