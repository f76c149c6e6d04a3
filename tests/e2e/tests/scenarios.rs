//! Literal end-to-end scenarios. Extraction is the one step that genuinely
//! needs a language model's judgment (date resolution, speaker attribution),
//! so each scenario queues a [`hindsight_core::llm::HeuristicCompletionClient`]
//! response standing in for what a well-behaved extractor would return, then
//! asserts on what the engine does with it: persistence, dedup, linking, and
//! budget-constrained recall.

use chrono::{TimeZone, Utc};
use hindsight_core::llm::HeuristicCompletionClient;
use hindsight_core::model::unit::Budget;
use hindsight_core::{FactType, RecallRequest, RetainItem};
use hindsight_e2e_tests::harness::TestEngine;
use hindsight_e2e_tests::mocks::fixtures::{extraction_response, filler_facts, FactFixture};

#[tokio::test]
async fn yesterday_jogging_resolves_to_a_concrete_past_date_as_an_agent_fact() {
    let event_date = Utc.with_ymd_and_hms(2024, 11, 13, 9, 0, 0).unwrap();
    let resolved_date = Utc.with_ymd_and_hms(2024, 11, 12, 7, 0, 0).unwrap();

    let completion = HeuristicCompletionClient::new().with_response(
        "memory",
        extraction_response(&[FactFixture::point(
            "Went for a morning jog in a nearby park for the first time.",
            "agent",
            resolved_date,
            vec![],
        )]),
    );
    let harness = TestEngine::new(completion).await;

    let item = RetainItem { timestamp: Some(event_date), ..RetainItem::new("Yesterday I went for a morning jog for the first time in a nearby park.") };
    harness.engine.retain("b1", vec![item], None).await.unwrap();

    let units = harness
        .engine
        .list_memories("b1", hindsight_core::store::UnitFilter::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(units.len(), 1);
    let unit = &units[0];
    assert_eq!(unit.occurred.start.date_naive(), resolved_date.date_naive());
    assert_eq!(unit.fact_type, FactType::Agent);
    let lower = unit.text.to_lowercase();
    assert!(!lower.contains("recently"));
    assert!(!lower.contains("yesterday"));
    assert!(lower.contains("first"));
}

#[tokio::test]
async fn february_interval_resolves_to_a_full_month_range() {
    let event_date = Utc.with_ymd_and_hms(2024, 11, 17, 0, 0, 0).unwrap();
    let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap();

    let completion = HeuristicCompletionClient::new().with_response(
        "memory",
        serde_json::json!({
            "facts": [{
                "text": "Alice visited Paris.",
                "fact_type": "world",
                "occurred_start": start.to_rfc3339(),
                "occurred_end": end.to_rfc3339(),
                "entities": ["Alice", "Paris"],
            }],
            "causal_relations": [],
        }),
    );
    let harness = TestEngine::new(completion).await;

    let item = RetainItem { timestamp: Some(event_date), ..RetainItem::new("In February 2024, Alice visited Paris.") };
    harness.engine.retain("b1", vec![item], None).await.unwrap();

    let units = harness
        .engine
        .list_memories("b1", hindsight_core::store::UnitFilter::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(units.len(), 1);
    let unit = &units[0];
    assert_eq!(unit.occurred.start.date_naive(), start.date_naive());
    assert!(matches!(unit.occurred.end.date_naive().to_string().as_str(), "2024-02-28" | "2024-02-29"));
    assert_eq!(unit.fact_type, FactType::World);
}

#[tokio::test]
async fn document_upsert_replaces_prior_units_and_updates_text() {
    let now = Utc::now();
    let completion = HeuristicCompletionClient::new()
        .with_response("memory", extraction_response(&[FactFixture::point("Alice works at Google.", "world", now, vec!["Alice", "Google"])]))
        .with_response(
            "memory",
            extraction_response(&[
                FactFixture::point("Alice works at Microsoft.", "world", now, vec!["Alice", "Microsoft"]),
                FactFixture::point("Bob works at Apple.", "world", now, vec!["Bob", "Apple"]),
            ]),
        );
    let harness = TestEngine::new(completion).await;

    harness
        .engine
        .retain("b1", vec![RetainItem::new("Alice works at Google.")], Some("meeting-002".to_string()))
        .await
        .unwrap();
    let v1_document = harness.engine.get_document("b1", "meeting-002").await.unwrap();
    assert!(v1_document.unit_count >= 1);
    let v1_units = harness
        .engine
        .list_memories("b1", hindsight_core::store::UnitFilter { document_id: Some("meeting-002".to_string()), ..Default::default() }, 10, 0)
        .await
        .unwrap();
    let v1_ids: std::collections::HashSet<_> = v1_units.iter().map(|u| u.id).collect();

    harness
        .engine
        .retain("b1", vec![RetainItem::new("Alice works at Microsoft. Bob works at Apple.")], Some("meeting-002".to_string()))
        .await
        .unwrap();

    let v2_document = harness.engine.get_document("b1", "meeting-002").await.unwrap();
    assert!(v2_document.original_text.contains("Microsoft"));
    let v2_units = harness
        .engine
        .list_memories("b1", hindsight_core::store::UnitFilter { document_id: Some("meeting-002".to_string()), ..Default::default() }, 10, 0)
        .await
        .unwrap();
    assert!(v2_units.iter().all(|u| !v1_ids.contains(&u.id)), "no unit id from v1 should survive the upsert");
}

#[tokio::test]
async fn link_expansion_reaches_an_unqueried_fact_through_a_shared_entity() {
    let now = Utc::now();
    let mut facts = vec![
        FactFixture::point("Alice works with Python at TechCorp.", "world", now, vec!["Alice", "Python", "TechCorp"]),
        FactFixture::point("Bob uses Python at DataSoft.", "world", now, vec!["Bob", "Python", "DataSoft"]),
    ];
    facts.extend(filler_facts(8, now + chrono::Duration::hours(1)));

    let completion = HeuristicCompletionClient::new().with_response("memory", extraction_response(&facts));
    let harness = TestEngine::new(completion).await;
    harness
        .engine
        .retain(
            "b1",
            vec![RetainItem::new(
                "Alice works with Python at TechCorp. Bob uses Python at DataSoft. Plus eight unrelated facts.",
            )],
            None,
        )
        .await
        .unwrap();

    let entities = harness.engine.list_entities("b1", 50, 0).await.unwrap();
    let python_count = entities.iter().filter(|e| e.canonical_name.eq_ignore_ascii_case("python")).count();
    assert_eq!(python_count, 1, "both Python surfaces should collapse onto one entity");

    let mut request = RecallRequest::new("b1", "Alice", Budget::Mid, 4000);
    request.types = Some(vec![FactType::World]);
    request.trace = true;
    let result = harness.engine.recall(request).await.unwrap();

    let bob_unit = result.results.iter().find(|scored| scored.unit.text.contains("Bob") && scored.unit.text.contains("DataSoft"));
    assert!(bob_unit.is_some(), "recall should surface Bob's fact via the shared Python entity link, not just Alice's");

    let trace = result.trace.expect("trace was requested");
    assert!(!trace.edges_traversed.is_empty(), "graph expansion should have traversed at least one edge to reach Bob's fact");
}

#[tokio::test]
async fn speaker_attribution_splits_first_and_third_person_facts() {
    let now = Utc::now();
    let completion = HeuristicCompletionClient::new().with_response(
        "memory",
        extraction_response(&[
            FactFixture::point("I predict Rams 27-24.", "agent", now, vec!["Rams"]),
            FactFixture::point("Jamie predicts Niners 27-13.", "world", now, vec!["Jamie", "Niners"]),
        ]),
    );
    let harness = TestEngine::new(completion).await;

    let item = RetainItem {
        context: Some("podcast between you (Marcus) and Jamie".to_string()),
        ..RetainItem::new("Marcus: I predict Rams 27-24. Jamie: I predict Niners 27-13.")
    };
    harness.engine.retain("b1", vec![item], None).await.unwrap();

    let units = harness
        .engine
        .list_memories("b1", hindsight_core::store::UnitFilter::default(), 10, 0)
        .await
        .unwrap();

    let agent_facts: Vec<_> = units.iter().filter(|u| u.fact_type == FactType::Agent).collect();
    assert_eq!(agent_facts.len(), 1);
    assert!(agent_facts[0].text.contains("Rams 27-24"));
    assert!(!agent_facts.iter().any(|u| u.text.contains("Niners")));

    let world_facts: Vec<_> = units.iter().filter(|u| u.fact_type == FactType::World).collect();
    assert_eq!(world_facts.len(), 1);
    assert!(world_facts[0].text.contains("Niners 27-13"));
}

#[tokio::test]
async fn budget_tiers_nest_across_two_hundred_facts() {
    let now = Utc::now();
    let completion = HeuristicCompletionClient::new().with_response("memory", extraction_response(&filler_facts(200, now)));
    let harness = TestEngine::new(completion).await;
    harness
        .engine
        .retain("b1", vec![RetainItem::new("two hundred unrelated facts arrive in one item")], None)
        .await
        .unwrap();

    let low = harness.engine.recall(RecallRequest::new("b1", "fact", Budget::Low, 1_000_000)).await.unwrap();
    let mid = harness.engine.recall(RecallRequest::new("b1", "fact", Budget::Mid, 1_000_000)).await.unwrap();
    let high = harness.engine.recall(RecallRequest::new("b1", "fact", Budget::High, 1_000_000)).await.unwrap();

    let low_ids: std::collections::HashSet<_> = low.results.iter().map(|s| s.unit.id).collect();
    let mid_ids: std::collections::HashSet<_> = mid.results.iter().map(|s| s.unit.id).collect();
    let high_ids: std::collections::HashSet<_> = high.results.iter().map(|s| s.unit.id).collect();

    assert!(low_ids.is_subset(&mid_ids), "L ⊆ M must hold");
    assert!(mid_ids.is_subset(&high_ids), "M ⊆ H must hold");
    assert!(high_ids.len() <= 200, "|H| must not exceed the number of retained facts");
}
