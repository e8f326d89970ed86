pub mod agentic;
pub mod client;
pub mod diagnose;
pub mod fix;
pub mod models;
pub mod parse;
pub mod prompts;
pub mod recovery;
pub mod tools;

pub use agentic::{ToolLoop, ToolLoopConfig, ToolLoopError};
pub use client::{ChatBackend, ChatError, HttpChatBackend};
pub use diagnose::{diagnose, Category, Confidence, Diagnosis};
pub use fix::{apply_fix, generate_fix, ApplyOutcome, FixBundle};
pub use models::ModelProfile;
pub use tools::{ToolContext, ToolRegistry};
