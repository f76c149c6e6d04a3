//! Extraction response fixtures
//!
//! Builds the JSON shape the Fact Extractor's completion schema expects, so
//! tests can queue a [`hindsight_core::llm::HeuristicCompletionClient`]
//! response that represents what a well-behaved extraction call would
//! return for a given input, without driving an actual language model.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// One fact entry for an extraction response.
pub struct FactFixture {
    pub text: String,
    pub fact_type: &'static str,
    pub occurred_start: DateTime<Utc>,
    pub occurred_end: DateTime<Utc>,
    pub entities: Vec<&'static str>,
}

impl FactFixture {
    pub fn point(text: impl Into<String>, fact_type: &'static str, at: DateTime<Utc>, entities: Vec<&'static str>) -> Self {
        Self { text: text.into(), fact_type, occurred_start: at, occurred_end: at, entities }
    }

    fn to_json(&self) -> Value {
        json!({
            "text": self.text,
            "fact_type": self.fact_type,
            "occurred_start": self.occurred_start.to_rfc3339(),
            "occurred_end": self.occurred_end.to_rfc3339(),
            "entities": self.entities,
        })
    }
}

/// Builds one `"memory"`-scoped extraction response with no causal
/// relations, matching `extract::extraction_schema`'s shape.
pub fn extraction_response(facts: &[FactFixture]) -> Value {
    json!({
        "facts": facts.iter().map(FactFixture::to_json).collect::<Vec<_>>(),
        "causal_relations": [],
    })
}

/// Generates `count` distinct, unrelated facts spread one hour apart
/// starting at `base`, for volume scenarios like the budget-monotonicity
/// test (spec.md §8 scenario 6: 200 facts about varied topics).
pub fn filler_facts(count: usize, base: DateTime<Utc>) -> Vec<FactFixture> {
    const TOPICS: [&str; 10] = [
        "cooking", "hiking", "astronomy", "chess", "gardening", "painting", "sailing", "cycling", "pottery", "birdwatching",
    ];
    (0..count)
        .map(|i| {
            let topic = TOPICS[i % TOPICS.len()];
            FactFixture::point(
                format!("Unrelated fact #{i} about {topic}"),
                "world",
                base + chrono::Duration::hours(i as i64),
                vec![],
            )
        })
        .collect()
}
