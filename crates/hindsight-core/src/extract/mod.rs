//! Fact Extractor (spec.md §4.5)
//!
//! Drives the completion gateway to turn raw text + conversation context
//! into a sequence of typed, dated, entity-tagged, optionally
//! causally-related facts, then re-validates the seven contracts the LLM
//! schema is supposed to already encode.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::EngineError;
use crate::llm::{CompletionClient, CompletionRequest, Message};
use crate::links::CausalRelation;
use crate::model::{FactType, LinkType, TemporalRange};

/// Input to one extraction call (spec.md §4.5 "Input").
#[derive(Debug, Clone)]
pub struct ExtractionInput {
    pub text: String,
    pub context: Option<String>,
    pub event_date: DateTime<Utc>,
    pub agent_name: String,
    pub hints: Option<String>,
}

/// One extracted fact, pre-persistence (spec.md §4.5 "Output").
#[derive(Debug, Clone)]
pub struct ExtractedFact {
    pub text: String,
    pub fact_type: FactType,
    pub occurred: TemporalRange,
    pub entity_surface_forms: Vec<String>,
}

/// Output of one extraction call: the facts plus the causal relations
/// referencing them by index within this call.
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub facts: Vec<ExtractedFact>,
    pub causal_relations: Vec<CausalRelation>,
}

#[derive(Debug, Deserialize)]
struct RawFact {
    text: String,
    fact_type: String,
    occurred_start: String,
    occurred_end: String,
    #[serde(default)]
    entities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawCausalRelation {
    source_index: usize,
    target_index: usize,
    link_type: String,
    strength: f32,
}

#[derive(Debug, Deserialize, Default)]
struct RawExtraction {
    #[serde(default)]
    facts: Vec<RawFact>,
    #[serde(default)]
    causal_relations: Vec<RawCausalRelation>,
}

const VAGUE_WORDS: [&str; 5] = ["recently", "soon", "lately", "just now", "a while ago"];

fn extraction_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "text": {"type": "string"},
                        "fact_type": {"type": "string", "enum": ["world", "agent", "opinion"]},
                        "occurred_start": {"type": "string"},
                        "occurred_end": {"type": "string"},
                        "entities": {"type": "array", "items": {"type": "string"}},
                    },
                    "required": ["text", "fact_type", "occurred_start", "occurred_end"],
                },
            },
            "causal_relations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "source_index": {"type": "integer"},
                        "target_index": {"type": "integer"},
                        "link_type": {"type": "string", "enum": ["causes", "caused_by", "enables", "prevents"]},
                        "strength": {"type": "number"},
                    },
                    "required": ["source_index", "target_index", "link_type", "strength"],
                },
            },
        },
        "required": ["facts"],
    })
}

pub struct FactExtractor {
    completion: Arc<dyn CompletionClient>,
}

impl FactExtractor {
    pub fn new(completion: Arc<dyn CompletionClient>) -> Self {
        Self { completion }
    }

    pub async fn extract(&self, input: &ExtractionInput) -> Result<ExtractionResult, EngineError> {
        if input.text.trim().is_empty() {
            return Ok(ExtractionResult::default());
        }

        let mut result = self.invoke(input, false).await?;

        if self.violates_bounds(input, &result) {
            tracing::warn!("extraction violated output-size discipline, re-invoking with a tightened prompt");
            result = self.invoke(input, true).await?;
        }
        self.enforce_output_discipline(input, &mut result);

        if result.facts.is_empty() {
            // Policy: never silently drop user-submitted content (spec.md
            // §7). One world-typed fact with the trimmed source text is
            // stored as a last resort.
            result.facts.push(ExtractedFact {
                text: input.text.trim().to_string(),
                fact_type: FactType::World,
                occurred: TemporalRange::point(input.event_date),
                entity_surface_forms: Vec::new(),
            });
        }

        Ok(result)
    }

    async fn invoke(&self, input: &ExtractionInput, tightened: bool) -> Result<ExtractionResult, EngineError> {
        let prompt = build_prompt(input, tightened);
        let request = CompletionRequest::new("memory", vec![Message::system(system_prompt()), Message::user(prompt)])
            .with_schema(extraction_schema())
            .with_temperature(0.2);

        let response = self.completion.complete(&request).await?;
        let raw: RawExtraction = serde_json::from_value(response).map_err(|e| EngineError::Schema(e.to_string()))?;
        convert(raw, input)
    }

    fn violates_bounds(&self, input: &ExtractionInput, result: &ExtractionResult) -> bool {
        let input_len = input.text.len();
        let max_total = input_len * 4;
        let max_sentences = input.text.split(['.', '!', '?']).filter(|s| !s.trim().is_empty()).count().max(1);
        let max_facts = max_sentences * 2;
        let total: usize = result.facts.iter().map(|f| f.text.len()).sum();
        result.facts.len() > max_facts || total > max_total || result.facts.iter().any(|f| f.text.len() > 1000)
    }

    /// Output-size discipline backstop: truncates to the bound if a
    /// tightened re-invocation still violates it (spec.md §4.5).
    fn enforce_output_discipline(&self, input: &ExtractionInput, result: &mut ExtractionResult) {
        let input_len = input.text.len();
        let max_total = input_len * 4;
        let max_sentences = input.text.split(['.', '!', '?']).filter(|s| !s.trim().is_empty()).count().max(1);
        let max_facts = max_sentences * 2;

        for fact in result.facts.iter_mut() {
            if fact.text.len() > 1000 {
                fact.text.truncate(1000);
            }
        }

        if result.facts.len() > max_facts {
            tracing::warn!(max_facts, actual = result.facts.len(), "extraction exceeded fact-count bound, truncating");
            result.facts.truncate(max_facts);
        }

        let mut total: usize = result.facts.iter().map(|f| f.text.len()).sum();
        if total > max_total {
            tracing::warn!(max_total, actual = total, "extraction exceeded output-size bound, truncating");
            while total > max_total && !result.facts.is_empty() {
                let last = result.facts.pop().unwrap();
                total -= last.text.len();
            }
        }
    }
}

fn system_prompt() -> &'static str {
    "You extract self-contained, dated, entity-tagged facts from text. \
     Resolve pronouns and relative dates against the given event date. \
     Never use vague temporal words like 'recently' or 'soon'. Attribute \
     the agent's own utterances to first person (agent facts); attribute \
     others' utterances to third person using their name (world facts). \
     Drop meta-commentary (intros, sign-offs, calls to subscribe). Preserve \
     emotional, sensory, certainty, capability, comparative, attitudinal, \
     intentional, and evaluative content. Join clearly related adjacent \
     statements into one fact when they share a referent."
}

fn build_prompt(input: &ExtractionInput, tightened: bool) -> String {
    let mut prompt = format!(
        "Agent identity: {agent}\nEvent date: {date}\nContext: {context}\n\nText:\n{text}",
        agent = input.agent_name,
        date = input.event_date.to_rfc3339(),
        context = input.context.as_deref().unwrap_or("(none)"),
        text = input.text,
    );
    if let Some(hints) = &input.hints {
        prompt.push_str(&format!("\n\nHints: {hints}"));
    }
    if tightened {
        prompt.push_str("\n\nPrevious output exceeded size bounds. Be more concise: fewer, shorter facts.");
    }
    prompt
}

fn convert(raw: RawExtraction, input: &ExtractionInput) -> Result<ExtractionResult, EngineError> {
    let mut facts = Vec::with_capacity(raw.facts.len());
    for fact in raw.facts {
        let fact_type: FactType = fact.fact_type.parse()?;
        let start = parse_or(&fact.occurred_start, input.event_date)?;
        let end = parse_or(&fact.occurred_end, start)?;
        let mut text = fact.text;
        for vague in VAGUE_WORDS {
            if text.to_lowercase().contains(vague) {
                tracing::warn!(fact = %text, word = vague, "extracted fact contains vague temporal diction");
            }
        }
        facts.push(ExtractedFact {
            text: std::mem::take(&mut text),
            fact_type,
            occurred: TemporalRange { start, end },
            entity_surface_forms: fact.entities,
        });
    }

    let mut causal_relations = Vec::with_capacity(raw.causal_relations.len());
    for relation in raw.causal_relations {
        causal_relations.push(CausalRelation {
            source_index: relation.source_index,
            target_index: relation.target_index,
            link_type: relation.link_type.parse::<LinkType>()?,
            strength: relation.strength.clamp(0.0, 1.0),
        });
    }

    Ok(ExtractionResult { facts, causal_relations })
}

fn parse_or(raw: &str, fallback: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
    if raw.trim().is_empty() {
        return Ok(fallback);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap().and_utc())
        })
        .map_err(|e| EngineError::Schema(format!("invalid date '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HeuristicCompletionClient;

    #[tokio::test]
    async fn empty_input_yields_no_facts() {
        let extractor = FactExtractor::new(Arc::new(HeuristicCompletionClient::new()));
        let input = ExtractionInput {
            text: "".to_string(),
            context: None,
            event_date: Utc::now(),
            agent_name: "TestUser".to_string(),
            hints: None,
        };
        let result = extractor.extract(&input).await.unwrap();
        assert!(result.facts.is_empty());
    }

    #[tokio::test]
    async fn zero_facts_from_nonempty_input_falls_back_to_world_fact() {
        let extractor = FactExtractor::new(Arc::new(HeuristicCompletionClient::new()));
        let input = ExtractionInput {
            text: "Some unparsed utterance.".to_string(),
            context: None,
            event_date: Utc::now(),
            agent_name: "TestUser".to_string(),
            hints: None,
        };
        let result = extractor.extract(&input).await.unwrap();
        assert_eq!(result.facts.len(), 1);
        assert_eq!(result.facts[0].fact_type, FactType::World);
        assert_eq!(result.facts[0].text, "Some unparsed utterance.");
    }

    #[tokio::test]
    async fn long_facts_are_truncated_to_1000_chars() {
        let long_response = serde_json::json!({
            "facts": [{
                "text": "a".repeat(1500),
                "fact_type": "world",
                "occurred_start": "2024-01-01T00:00:00Z",
                "occurred_end": "2024-01-01T00:00:00Z",
                "entities": [],
            }],
            "causal_relations": [],
        });
        let completion = HeuristicCompletionClient::new()
            .with_response("memory", long_response.clone())
            .with_response("memory", long_response);
        let extractor = FactExtractor::new(Arc::new(completion));
        let input = ExtractionInput {
            text: "a".repeat(400),
            context: None,
            event_date: Utc::now(),
            agent_name: "TestUser".to_string(),
            hints: None,
        };
        let result = extractor.extract(&input).await.unwrap();
        assert!(result.facts[0].text.len() <= 1000);
    }

    #[tokio::test]
    async fn invalid_causal_link_type_is_schema_error() {
        let completion = HeuristicCompletionClient::new().with_response(
            "memory",
            serde_json::json!({
                "facts": [{
                    "text": "Alice left.",
                    "fact_type": "world",
                    "occurred_start": "2024-01-01T00:00:00Z",
                    "occurred_end": "2024-01-01T00:00:00Z",
                    "entities": [],
                }],
                "causal_relations": [{"source_index": 0, "target_index": 0, "link_type": "bogus", "strength": 0.5}],
            }),
        );
        let extractor = FactExtractor::new(Arc::new(completion));
        let input = ExtractionInput {
            text: "Alice left because it rained.".to_string(),
            context: None,
            event_date: Utc::now(),
            agent_name: "TestUser".to_string(),
            hints: None,
        };
        let result = extractor.extract(&input).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
