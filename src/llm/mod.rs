pub mod client;
pub mod models;
pub mod oracles;
pub mod prompts;

pub use client::OpenRouterClient;
pub use models::{Model, Usage, UsageMeter};
pub use oracles::{LlmImprover, LlmSpecResolver};
