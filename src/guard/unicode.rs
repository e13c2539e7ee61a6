//! Unicode normalization guard stage.
//!
//! Obfuscated injections often hide behind fullwidth letters, zero-width
//! joiners, or Cyrillic lookalikes. This stage folds the text to NFKC,
//! strips zero-width code points, maps configured homoglyphs to their ASCII
//! targets, and hands the cleaned text to later stages via a `normalized:`
//! hint. Inputs that are mostly zero-width characters are rejected outright.

use std::collections::HashMap;

use async_trait::async_trait;
use unicode_normalization::UnicodeNormalization;

use crate::error::GuardError;
use crate::guard::{GuardCommand, GuardResult, GuardStage, NORMALIZED_HINT_PREFIX, RejectCategory};

/// Zero-width and invisible code points stripped during normalization.
fn is_zero_width(c: char) -> bool {
    matches!(c,
        '\u{200B}'..='\u{200F}'
        | '\u{FEFF}'
        | '\u{00AD}'
        | '\u{2060}'..='\u{2064}'
        | '\u{180E}'
        | '\u{E0000}'..='\u{E007F}'
    )
}

/// Default Cyrillic-to-Latin homoglyph folding.
fn default_homoglyphs() -> HashMap<char, char> {
    [
        ('а', 'a'),
        ('е', 'e'),
        ('о', 'o'),
        ('р', 'p'),
        ('с', 'c'),
        ('у', 'y'),
        ('х', 'x'),
        ('і', 'i'),
        ('ѕ', 's'),
        ('ԁ', 'd'),
    ]
    .into_iter()
    .collect()
}

/// NFKC normalization, zero-width stripping, and homoglyph folding.
pub struct UnicodeNormalizationStage {
    max_zero_width_ratio: f64,
    homoglyphs: HashMap<char, char>,
}

impl UnicodeNormalizationStage {
    pub fn new(max_zero_width_ratio: f64) -> Self {
        Self {
            max_zero_width_ratio,
            homoglyphs: default_homoglyphs(),
        }
    }

    /// Replace the homoglyph table.
    pub fn with_homoglyphs(mut self, homoglyphs: HashMap<char, char>) -> Self {
        self.homoglyphs = homoglyphs;
        self
    }

    fn normalize(&self, text: &str) -> String {
        text.nfkc()
            .filter(|c| !is_zero_width(*c))
            .map(|c| *self.homoglyphs.get(&c).unwrap_or(&c))
            .collect()
    }
}

impl Default for UnicodeNormalizationStage {
    fn default() -> Self {
        Self::new(0.1)
    }
}

#[async_trait]
impl GuardStage for UnicodeNormalizationStage {
    fn name(&self) -> &'static str {
        "UnicodeNormalization"
    }

    fn order(&self) -> i32 {
        0
    }

    async fn check(&self, command: &GuardCommand) -> Result<GuardResult, GuardError> {
        let total = command.text.chars().count();
        if total > 0 {
            // Ratio is measured before stripping: a flood of invisible
            // characters is itself the signal.
            let zero_width = command.text.chars().filter(|c| is_zero_width(*c)).count();
            let ratio = zero_width as f64 / total as f64;
            if ratio > self.max_zero_width_ratio {
                return Ok(GuardResult::rejected(
                    format!(
                        "zero-width character ratio {:.0}% exceeds {:.0}%",
                        ratio * 100.0,
                        self.max_zero_width_ratio * 100.0
                    ),
                    RejectCategory::PromptInjection,
                ));
            }
        }

        let cleaned = self.normalize(&command.text);
        Ok(GuardResult::allowed_with_hint(format!(
            "{NORMALIZED_HINT_PREFIX}{cleaned}"
        )))
    }
}
