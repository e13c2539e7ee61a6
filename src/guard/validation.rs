//! Input length validation guard stage.

use async_trait::async_trait;

use crate::error::GuardError;
use crate::guard::{GuardCommand, GuardResult, GuardStage, RejectCategory};

/// Bounds on request text length, plus an optional system prompt bound.
pub struct InputValidationStage {
    min_chars: usize,
    max_chars: usize,
    system_prompt_max_chars: Option<usize>,
}

impl InputValidationStage {
    pub fn new(min_chars: usize, max_chars: usize) -> Self {
        Self {
            min_chars,
            max_chars,
            system_prompt_max_chars: None,
        }
    }

    /// Also validate `metadata["systemPrompt"]` length when present.
    pub fn with_system_prompt_max(mut self, max_chars: usize) -> Self {
        self.system_prompt_max_chars = Some(max_chars);
        self
    }
}

impl Default for InputValidationStage {
    fn default() -> Self {
        Self::new(1, 10_000)
    }
}

#[async_trait]
impl GuardStage for InputValidationStage {
    fn name(&self) -> &'static str {
        "InputValidation"
    }

    fn order(&self) -> i32 {
        2
    }

    async fn check(&self, command: &GuardCommand) -> Result<GuardResult, GuardError> {
        let length = command.text.chars().count();
        if length < self.min_chars {
            return Ok(GuardResult::rejected(
                format!("input too short: {length} < {}", self.min_chars),
                RejectCategory::InvalidInput,
            ));
        }
        if length > self.max_chars {
            return Ok(GuardResult::rejected(
                format!("input too long: {length} > {}", self.max_chars),
                RejectCategory::InvalidInput,
            ));
        }

        if let Some(max) = self.system_prompt_max_chars {
            if let Some(prompt) = command.metadata.get("systemPrompt").and_then(|v| v.as_str()) {
                let prompt_len = prompt.chars().count();
                if prompt_len > max {
                    return Ok(GuardResult::rejected(
                        format!("system prompt too long: {prompt_len} > {max}"),
                        RejectCategory::InvalidInput,
                    ));
                }
            }
        }

        Ok(GuardResult::allowed())
    }
}
