//! LLM-driven lineage extraction.
//!
//! The model is treated as an unreliable oracle behind an OpenAI-compatible
//! chat endpoint: every response is fence-stripped, parsed and validated
//! against the enumerated document schema, with bounded re-prompting on
//! violations and bounded backoff on transport trouble. Calls are paced by a
//! token-bucket limiter on both requests/minute and tokens/minute.

pub mod client;
pub mod context;
pub mod extract;
pub mod limiter;
pub mod prompt;

pub use client::{ChatClient, ChatCompletion, ChatMessage, LlmError, LlmSettings, OpenAiCompatClient};
pub use context::{ContextAssembler, ContextError, ObjectContext, PromptContext};
pub use extract::{ExtractionOutcome, ExtractorSettings, LineageExtractor};
pub use limiter::RateLimiter;
