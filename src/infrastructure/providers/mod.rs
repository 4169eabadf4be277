//! Provider adapters (spec Component A): one subprocess-spawning CLI
//! wrapper per backend, plus a scenario-driven mock.

pub mod claude;
pub mod cli_executor;
pub mod codex;
pub mod mock;
pub mod opencode;
pub mod registry;

pub use claude::{ClaudeProvider, ClaudeProviderConfig};
pub use codex::{CodexProvider, CodexProviderConfig};
pub use mock::{MockProvider, ScenarioEntry};
pub use opencode::{OpenCodeProvider, OpenCodeProviderConfig};
pub use registry::ProviderRegistry;
