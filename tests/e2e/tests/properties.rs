//! Quantified invariants and boundary behaviors that must hold across any
//! bank, independent of any one scenario's narrative.

use hindsight_core::llm::HeuristicCompletionClient;
use hindsight_core::model::unit::Budget;
use hindsight_core::{RecallRequest, RetainItem};
use hindsight_e2e_tests::harness::TestEngine;
use hindsight_e2e_tests::mocks::fixtures::{extraction_response, filler_facts, FactFixture};

#[tokio::test]
async fn retain_with_no_items_is_a_no_op() {
    let harness = TestEngine::with_default_completion().await;
    let outcome = harness.engine.retain("b1", Vec::new(), None).await.unwrap();
    assert_eq!(outcome.items_count, 0);
    assert!(outcome.operation_id.is_none());
}

#[tokio::test]
async fn recall_against_an_empty_bank_returns_no_results_not_an_error() {
    let harness = TestEngine::with_default_completion().await;
    let result = harness
        .engine
        .recall(RecallRequest::new("never-retained-into", "anything", Budget::High, 4000))
        .await
        .unwrap();
    assert!(result.results.is_empty());
    assert!(result.entities.is_none());
}

#[tokio::test]
async fn recall_budget_tiers_are_monotonically_non_decreasing() {
    let now = chrono::Utc::now();
    let completion = HeuristicCompletionClient::new().with_response(
        "memory",
        extraction_response(&filler_facts(40, now)),
    );
    let harness = TestEngine::new(completion).await;
    harness
        .engine
        .retain("b1", vec![RetainItem::new("forty unrelated facts arrive in one item")], None)
        .await
        .unwrap();

    let low = harness.engine.recall(RecallRequest::new("b1", "fact", Budget::Low, 100_000)).await.unwrap();
    let mid = harness.engine.recall(RecallRequest::new("b1", "fact", Budget::Mid, 100_000)).await.unwrap();
    let high = harness.engine.recall(RecallRequest::new("b1", "fact", Budget::High, 100_000)).await.unwrap();

    assert!(low.results.len() <= mid.results.len());
    assert!(mid.results.len() <= high.results.len());
}

#[tokio::test]
async fn recall_never_exceeds_its_token_budget() {
    let now = chrono::Utc::now();
    let completion = HeuristicCompletionClient::new().with_response(
        "memory",
        extraction_response(&filler_facts(60, now)),
    );
    let harness = TestEngine::new(completion).await;
    harness
        .engine
        .retain("b1", vec![RetainItem::new("sixty unrelated facts arrive in one item")], None)
        .await
        .unwrap();

    let max_tokens = 200u32;
    let result = harness.engine.recall(RecallRequest::new("b1", "fact", Budget::High, max_tokens)).await.unwrap();
    let spent: u32 = result.results.iter().map(|scored| (scored.unit.text.len() as u32 / 4).max(1)).sum();
    assert!(spent <= max_tokens, "spent {spent} tokens against a budget of {max_tokens}");
}

#[tokio::test]
async fn extracted_fact_text_does_not_balloon_past_the_source_text() {
    let now = chrono::Utc::now();
    let source = "Alice joined the team on Monday and has been leading the migration project since.";
    let completion = HeuristicCompletionClient::new().with_response(
        "memory",
        extraction_response(&[
            FactFixture::point("Alice joined the team on Monday.", "world", now, vec!["Alice"]),
            FactFixture::point("Alice has been leading the migration project.", "world", now, vec!["Alice"]),
        ]),
    );
    let harness = TestEngine::new(completion).await;
    let outcome = harness.engine.retain("b1", vec![RetainItem::new(source)], None).await.unwrap();
    assert_eq!(outcome.items_count, 1);

    let units = harness
        .engine
        .list_memories("b1", hindsight_core::store::UnitFilter::default(), 10, 0)
        .await
        .unwrap();
    let total_fact_chars: usize = units.iter().map(|u| u.text.len()).sum();
    assert!(
        total_fact_chars <= source.len() * 4,
        "facts ballooned to {total_fact_chars} chars from a {}-char source",
        source.len()
    );
}

#[tokio::test]
async fn entity_resolution_collapses_repeated_surface_forms_within_a_batch() {
    let now = chrono::Utc::now();
    let completion = HeuristicCompletionClient::new().with_response(
        "memory",
        extraction_response(&[
            FactFixture::point("Alice writes Python.", "world", now, vec!["Alice", "Python"]),
            FactFixture::point("Bob also writes Python.", "world", now, vec!["Bob", "Python"]),
        ]),
    );
    let harness = TestEngine::new(completion).await;
    harness
        .engine
        .retain("b1", vec![RetainItem::new("Alice writes Python. Bob also writes Python.")], None)
        .await
        .unwrap();

    let entities = harness.engine.list_entities("b1", 50, 0).await.unwrap();
    let python_entities = entities.iter().filter(|e| e.canonical_name.eq_ignore_ascii_case("python")).count();
    assert_eq!(python_entities, 1, "repeated surface form should collapse onto one entity");
}

#[tokio::test]
async fn entity_resolution_is_idempotent_across_retain_calls() {
    let now = chrono::Utc::now();
    let completion = HeuristicCompletionClient::new()
        .with_response("memory", extraction_response(&[FactFixture::point("Alice writes Python.", "world", now, vec!["Alice", "Python"])]))
        .with_response(
            "memory",
            extraction_response(&[FactFixture::point(
                "Alice writes more Python.",
                "world",
                now + chrono::Duration::days(1),
                vec!["Alice", "Python"],
            )]),
        );
    let harness = TestEngine::new(completion).await;
    harness.engine.retain("b1", vec![RetainItem::new("Alice writes Python.")], None).await.unwrap();
    harness.engine.retain("b1", vec![RetainItem::new("Alice writes more Python.")], None).await.unwrap();

    let entities = harness.engine.list_entities("b1", 50, 0).await.unwrap();
    let python_entities: Vec<_> = entities.iter().filter(|e| e.canonical_name.eq_ignore_ascii_case("python")).collect();
    assert_eq!(python_entities.len(), 1);
    assert_eq!(python_entities[0].mention_count, 2);
}

#[tokio::test]
async fn document_upsert_is_idempotent_on_unit_identity() {
    let now = chrono::Utc::now();
    let completion = HeuristicCompletionClient::new()
        .with_response("memory", extraction_response(&[FactFixture::point("Alice works at Acme.", "world", now, vec!["Alice", "Acme"])]))
        .with_response("memory", extraction_response(&[FactFixture::point("Alice works at Acme.", "world", now, vec!["Alice", "Acme"])]));
    let harness = TestEngine::new(completion).await;

    harness
        .engine
        .retain("b1", vec![RetainItem::new("Alice works at Acme.")], Some("doc-1".to_string()))
        .await
        .unwrap();
    let first_pass = harness
        .engine
        .list_memories("b1", hindsight_core::store::UnitFilter { document_id: Some("doc-1".to_string()), ..Default::default() }, 50, 0)
        .await
        .unwrap();

    harness
        .engine
        .retain("b1", vec![RetainItem::new("Alice works at Acme.")], Some("doc-1".to_string()))
        .await
        .unwrap();
    let second_pass = harness
        .engine
        .list_memories("b1", hindsight_core::store::UnitFilter { document_id: Some("doc-1".to_string()), ..Default::default() }, 50, 0)
        .await
        .unwrap();

    assert_eq!(first_pass.len(), second_pass.len());
    let first_ids: std::collections::HashSet<_> = first_pass.iter().map(|u| u.id).collect();
    let second_ids: std::collections::HashSet<_> = second_pass.iter().map(|u| u.id).collect();
    assert!(first_ids.is_disjoint(&second_ids), "re-ingesting a document must replace, not append to, its unit set");
}

#[tokio::test]
async fn every_link_endpoint_stays_within_its_own_bank_and_carries_a_valid_weight() {
    let now = chrono::Utc::now();
    let completion = HeuristicCompletionClient::new().with_response(
        "memory",
        extraction_response(&[
            FactFixture::point("Alice joined Acme yesterday.", "world", now, vec!["Alice", "Acme"]),
            FactFixture::point("Alice is leading a project at Acme.", "world", now, vec!["Alice", "Acme"]),
        ]),
    );
    let harness = TestEngine::new(completion).await;
    harness
        .engine
        .retain("b1", vec![RetainItem::new("Alice joined Acme yesterday. Alice is leading a project at Acme.")], None)
        .await
        .unwrap();

    let (units, links) = harness.engine.get_graph_data("b1", None).await.unwrap();
    let unit_ids: std::collections::HashSet<_> = units.iter().map(|u| u.id).collect();
    for link in &links {
        assert!(unit_ids.contains(&link.from_unit_id));
        assert!(unit_ids.contains(&link.to_unit_id));
        assert!((0.0..=1.0).contains(&link.weight));
    }
}

#[tokio::test]
async fn deleting_a_bank_leaves_no_orphaned_units_or_entities() {
    let now = chrono::Utc::now();
    let completion = HeuristicCompletionClient::new().with_response(
        "memory",
        extraction_response(&[FactFixture::point("Alice works at Acme.", "world", now, vec!["Alice", "Acme"])]),
    );
    let harness = TestEngine::new(completion).await;
    harness.engine.retain("b1", vec![RetainItem::new("Alice works at Acme.")], None).await.unwrap();

    harness.engine.delete_bank("b1").await.unwrap();

    let units = harness.engine.list_memories("b1", hindsight_core::store::UnitFilter::default(), 50, 0).await.unwrap();
    let entities = harness.engine.list_entities("b1", 50, 0).await.unwrap();
    assert!(units.is_empty());
    assert!(entities.is_empty());
}

#[tokio::test]
async fn cancelling_an_unknown_operation_id_is_not_an_error() {
    let harness = TestEngine::with_default_completion().await;
    // A caller racing a worker, or retrying a stale id, should not get an
    // error back just because the row is already gone.
    harness.engine.cancel_operation(uuid::Uuid::new_v4()).await.unwrap();
}
