//! Bank: the per-subject memory partition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Big-Five personality trait record, every field in `[0.0, 1.0]`.
///
/// Defaults to 0.5 across all six traits — personality-neutral until a
/// consolidation pass has evidence to shift them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalityTraits {
    pub openness: f32,
    pub conscientiousness: f32,
    pub extraversion: f32,
    pub agreeableness: f32,
    pub neuroticism: f32,
    pub bias_strength: f32,
}

impl Default for PersonalityTraits {
    fn default() -> Self {
        Self {
            openness: 0.5,
            conscientiousness: 0.5,
            extraversion: 0.5,
            agreeableness: 0.5,
            neuroticism: 0.5,
            bias_strength: 0.5,
        }
    }
}

impl PersonalityTraits {
    /// Clamps every trait into `[0.0, 1.0]`, used after an LLM-inferred
    /// personality update before persisting it.
    pub fn clamped(self) -> Self {
        Self {
            openness: self.openness.clamp(0.0, 1.0),
            conscientiousness: self.conscientiousness.clamp(0.0, 1.0),
            extraversion: self.extraversion.clamp(0.0, 1.0),
            agreeableness: self.agreeableness.clamp(0.0, 1.0),
            neuroticism: self.neuroticism.clamp(0.0, 1.0),
            bias_strength: self.bias_strength.clamp(0.0, 1.0),
        }
    }
}

/// A per-subject memory partition, auto-created on first reference with
/// neutral defaults (spec.md §3).
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bank {
    pub bank_id: String,
    pub name: String,
    pub personality: PersonalityTraits,
    pub background: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bank {
    /// A freshly auto-created bank: `name` defaults to `bank_id`, background
    /// empty, personality neutral.
    pub fn new_default(bank_id: impl Into<String>) -> Self {
        let bank_id = bank_id.into();
        let now = Utc::now();
        Self {
            name: bank_id.clone(),
            bank_id,
            personality: PersonalityTraits::default(),
            background: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_personality_is_neutral() {
        let traits = PersonalityTraits::default();
        assert_eq!(traits.openness, 0.5);
        assert_eq!(traits.bias_strength, 0.5);
    }

    #[test]
    fn clamp_bounds_out_of_range_values() {
        let traits = PersonalityTraits {
            openness: 1.4,
            conscientiousness: -0.2,
            ..PersonalityTraits::default()
        }
        .clamped();
        assert_eq!(traits.openness, 1.0);
        assert_eq!(traits.conscientiousness, 0.0);
    }

    #[test]
    fn new_default_bank_names_itself_after_id() {
        let bank = Bank::new_default("acme-corp");
        assert_eq!(bank.name, "acme-corp");
        assert_eq!(bank.background, "");
    }
}
