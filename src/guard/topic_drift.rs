//! Topic drift detection guard stage (opt-in).
//!
//! Multi-turn jailbreaks rarely open with the payload; they walk there.
//! This stage scores how far the user's recent turns have drifted from the
//! start of the window, weighting recent transitions more heavily and
//! boosting the score when pivot phrases appear. Scores above the threshold
//! reject the request.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::GuardError;
use crate::guard::{ChatTurn, GuardCommand, GuardResult, GuardStage, RejectCategory};

/// Phrases that mark a deliberate topic pivot.
const PIVOT_MARKERS: &[&str] = &[
    "new topic",
    "changing the subject",
    "forget that",
    "instead",
    "actually, let's",
    "now let's",
];

/// Windowed drift scorer over the conversation history.
pub struct TopicDriftStage {
    threshold: f64,
    window: usize,
    enabled: bool,
}

impl TopicDriftStage {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            window: 6,
            enabled: false,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(2);
        self
    }

    /// Drift score in `[0, 1]` for the user turns in the window plus the
    /// current text. Zero when there is not enough history to compare.
    pub fn score(&self, history: &[ChatTurn], current_text: &str) -> f64 {
        let mut user_turns: Vec<&str> = history
            .iter()
            .filter(|t| t.role.eq_ignore_ascii_case("user"))
            .map(|t| t.content.as_str())
            .collect();
        user_turns.push(current_text);

        let window_start = user_turns.len().saturating_sub(self.window);
        let window = &user_turns[window_start..];
        if window.len() < 2 {
            return 0.0;
        }

        // Weighted average of per-transition dissimilarity, recent
        // transitions counting more.
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (i, pair) in window.windows(2).enumerate() {
            let weight = (i + 1) as f64;
            weighted_sum += (1.0 - jaccard(pair[0], pair[1])) * weight;
            weight_total += weight;
        }
        let mut score = weighted_sum / weight_total;

        let lower = current_text.to_lowercase();
        if PIVOT_MARKERS.iter().any(|m| lower.contains(m)) {
            score = (score + 0.2).min(1.0);
        }
        score
    }
}

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &str, b: &str) -> f64 {
    let set_a = word_set(a);
    let set_b = word_set(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

impl Default for TopicDriftStage {
    fn default() -> Self {
        Self::new(0.7)
    }
}

#[async_trait]
impl GuardStage for TopicDriftStage {
    fn name(&self) -> &'static str {
        "TopicDriftDetection"
    }

    fn order(&self) -> i32 {
        6
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn check(&self, command: &GuardCommand) -> Result<GuardResult, GuardError> {
        let history = command.conversation_history();
        let score = self.score(&history, &command.text);
        if score > self.threshold {
            return Ok(GuardResult::rejected(
                format!("conversation drift score {score:.2} exceeds {:.2}", self.threshold),
                RejectCategory::OffTopic,
            ));
        }
        Ok(GuardResult::allowed())
    }
}
