use serde::Deserialize;

/// Context-size tier a model falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextTier {
    /// Small-context models (mini/nano/8b class) - aggressive truncation
    Small,
    /// General-purpose models with a mid-sized window
    Standard,
    /// Long-context models - generous limits
    Large,
}

/// Truncation limits tuned to a model's context window.
///
/// Resolved once from the model id when the configuration is built; the
/// tool loop and the tool executor only ever read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelProfile {
    pub tier: ContextTier,
    /// Hard cap on the characters of any single tool result fed back to the model
    pub max_tool_result_chars: usize,
    /// Log lines returned by `get_job_logs` when the model does not ask for a count
    pub default_tail_lines: usize,
    /// Upper bound on log lines returned by `get_job_logs`
    pub max_tail_lines: usize,
}

const SMALL_MARKERS: &[&str] = &[
    "mini", "nano", "small", "phi-", "-8b", "-7b", "-3b", "haiku",
];
const LARGE_MARKERS: &[&str] = &[
    "gpt-4.1", "gpt-5", "o3", "o4", "claude", "gemini", "llama-4", "-405b",
];

impl ModelProfile {
    pub const SMALL: ModelProfile = ModelProfile {
        tier: ContextTier::Small,
        max_tool_result_chars: 8_000,
        default_tail_lines: 100,
        max_tail_lines: 300,
    };

    pub const STANDARD: ModelProfile = ModelProfile {
        tier: ContextTier::Standard,
        max_tool_result_chars: 20_000,
        default_tail_lines: 200,
        max_tail_lines: 1_000,
    };

    pub const LARGE: ModelProfile = ModelProfile {
        tier: ContextTier::Large,
        max_tool_result_chars: 60_000,
        default_tail_lines: 200,
        max_tail_lines: 3_000,
    };

    /// Pick the profile for a model id such as `openai/gpt-4.1-mini`.
    ///
    /// Small markers win over large ones, so `gpt-4.1-mini` is treated as
    /// small even though `gpt-4.1` is a long-context family.
    pub fn for_model(model_id: &str) -> ModelProfile {
        let id = model_id.to_lowercase();
        let name = id.rsplit('/').next().unwrap_or(&id);

        if SMALL_MARKERS.iter().any(|marker| name.contains(marker)) {
            ModelProfile::SMALL
        } else if LARGE_MARKERS.iter().any(|marker| name.contains(marker)) {
            ModelProfile::LARGE
        } else {
            ModelProfile::STANDARD
        }
    }

    /// Clamp a requested tail length into `[default_tail_lines, max_tail_lines]`.
    pub fn clamp_tail_lines(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_tail_lines)
            .clamp(self.default_tail_lines, self.max_tail_lines)
    }
}

/// Token usage reported by the chat endpoint
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}
