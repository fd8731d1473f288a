//! Prompt moderation applied before any generation request is accepted.
//!
//! This is an advisory blocklist, a thin layer of defense in depth in front
//! of the model's own safety checker. It is not a content-safety system: it
//! only rejects prompts that literally name a handful of categories.

use std::sync::OnceLock;

use regex_lite::Regex;

pub const BLOCKED_MESSAGE: &str = "Prompt blocked by safety policy.";

const BLOCKLIST: &[&str] = &[r"(?i)gore|beheading|child\s*sexual|csam|rape|bestiality"];

/// Result of moderating a prompt pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationVerdict {
    pub allowed: bool,
    pub message: String,
}

impl ModerationVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            message: "ok".to_string(),
        }
    }

    fn block() -> Self {
        Self {
            allowed: false,
            message: BLOCKED_MESSAGE.to_string(),
        }
    }
}

fn compiled_blocklist() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        BLOCKLIST
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::error!("Invalid moderation pattern {:?}: {}", pattern, e);
                    None
                }
            })
            .collect()
    })
}

/// Check the prompt and the optional negative prompt. A match in either one
/// rejects the whole request; nothing is redacted.
pub fn moderate_prompt(prompt: &str, negative: Option<&str>) -> ModerationVerdict {
    let negative = negative.unwrap_or("");
    for re in compiled_blocklist() {
        if re.is_match(prompt) || re.is_match(negative) {
            tracing::warn!("Prompt rejected by moderation blocklist");
            return ModerationVerdict::block();
        }
    }
    ModerationVerdict::allow()
}
