//! Phase generation workflow: ask the reasoning service for the next
//! phase of a strategy and persist its decisions.
//!
//! Six steps in strict order, each safely re-runnable up to its own
//! commit point: load context, resolve candidates, generate the
//! suggestion, persist phase and content, dispatch writer tasks, queue
//! the initial snapshot. The whole run holds the per-strategy advisory
//! lock so two generations never interleave their decisions.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::batcher::TaskBatcher;
use crate::candidates::{self, CandidateDraft};
use crate::errors::WorkflowError;
use crate::models::{
    ContentDraft, DraftStatus, Phase, PhaseContent, PhaseStatus, Project, SnapshotTrigger,
    Strategy,
};
use crate::providers::{
    PhaseSuggestion, ReasoningService, SuggestionRequest, TaskRuntime, TaskSpec,
};
use crate::store::StoreHandle;

/// Upper bound on the reasoning service's internal tool loop.
pub const REASONING_MAX_STEPS: u32 = 40;
/// Extra days of target-completion runway granted per content decision.
pub const DAYS_PER_DECISION: i64 = 2;

pub const WRITER_WORKFLOW: &str = "content_writer";
pub const SNAPSHOT_WORKFLOW: &str = "performance_snapshot";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseGenerationInput {
    pub strategy_id: String,
    /// Recorded on dispatched task runs and used as the lock holder tag.
    pub requested_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseGenerationOutput {
    pub strategy_id: String,
    pub phase_id: String,
    /// Every draft the new phase references, updates and creations alike.
    pub draft_ids: Vec<String>,
}

/// One prior phase with its content decisions summarized for the prompt.
struct PhaseHistory {
    phase: Phase,
    /// `<action>:<title>:<keyword>` per decision.
    summaries: Vec<String>,
}

struct StrategyContext {
    strategy: Strategy,
    project: Project,
    history: Vec<PhaseHistory>,
}

/// What the persist step committed, consumed by the dispatch steps.
struct PersistOutcome {
    phase: Phase,
    touched: Vec<String>,
    /// Created drafts plus annotated updates, deduplicated — the set a
    /// writer task is dispatched for.
    writer_targets: Vec<String>,
}

/// Path pattern the reasoning service is told to match a slug against
/// when checking observed traffic for publish evidence. Trailing slash
/// optional.
pub fn slug_traffic_pattern(slug: &str) -> String {
    format!(r"/{}/?$", regex::escape(slug))
}

fn build_system_prompt(
    strategy: &Strategy,
    project: &Project,
    history: &[PhaseHistory],
    candidates: &BTreeMap<String, CandidateDraft>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are planning the next phase of a long-running content strategy.\n\n");

    prompt.push_str("## Strategy\n");
    prompt.push_str(&format!("Name: {}\n", strategy.name));
    prompt.push_str(&format!("Motivation: {}\n", strategy.motivation));
    prompt.push_str(&format!("Description: {}\n", strategy.description));
    prompt.push_str(&format!("Goal: {}\n", strategy.goal));
    prompt.push_str(&format!("Site: {}\n\n", project.base_url));

    prompt.push_str("## Phase history (oldest first)\n");
    if history.is_empty() {
        prompt.push_str("No phases yet. This will be the first phase.\n");
    }
    for entry in history {
        prompt.push_str(&format!(
            "- {} [{}, {}] cadence {}\n",
            entry.phase.name, entry.phase.phase_type, entry.phase.status, entry.phase.cadence
        ));
        for summary in &entry.summaries {
            prompt.push_str(&format!("    {}\n", summary));
        }
    }

    prompt.push_str("\n## Candidate drafts\n");
    if candidates.is_empty() {
        prompt.push_str("None. All decisions must be creations.\n");
    }
    for candidate in candidates.values() {
        prompt.push_str(&format!(
            "- {} [{}] slug={} title={} keyword={} status={}\n",
            candidate.draft.id,
            candidate.provenance,
            candidate.draft.slug,
            candidate.draft.title,
            candidate.draft.primary_keyword,
            candidate.draft.status,
        ));
    }

    prompt.push_str(
        "\n## Instructions\n\
         - Respond with a single JSON object with fields `phase`, `contentUpdates`, \
         and `contentCreations`.\n\
         - `contentDraftId` values must come from the candidate list above.\n\
         - Before deciding to improve an existing item, verify it is actually \
         published: match its slug against observed traffic page paths using the \
         pattern `/<slug>/?$` (trailing slash optional)",
    );
    if let Some(candidate) = candidates.values().next() {
        prompt.push_str(&format!(
            ", e.g. `{}` for slug `{}`",
            slug_traffic_pattern(&candidate.draft.slug),
            candidate.draft.slug
        ));
    }
    prompt.push_str(
        ".\n\
         - Never choose the `improve` action for an item with no traffic \
         evidence; prefer `update` or `expand` for those.\n",
    );
    prompt
}

pub struct PhaseGenerationWorkflow {
    store: StoreHandle,
    reasoning: Arc<dyn ReasoningService>,
    runtime: Arc<dyn TaskRuntime>,
    batcher: TaskBatcher,
}

impl PhaseGenerationWorkflow {
    pub fn new(
        store: StoreHandle,
        reasoning: Arc<dyn ReasoningService>,
        runtime: Arc<dyn TaskRuntime>,
        batcher: TaskBatcher,
    ) -> Self {
        Self {
            store,
            reasoning,
            runtime,
            batcher,
        }
    }

    pub async fn run(
        &self,
        input: PhaseGenerationInput,
    ) -> Result<PhaseGenerationOutput, WorkflowError> {
        let strategy_id = input.strategy_id.clone();
        let holder = input.requested_by.clone();
        let locked = self
            .store
            .call(move |s| s.try_lock_strategy(&strategy_id, &holder))
            .await
            .map_err(WorkflowError::Database)?;
        if !locked {
            return Err(WorkflowError::StrategyLocked {
                strategy_id: input.strategy_id,
            });
        }

        let result = self.run_locked(&input).await;

        let strategy_id = input.strategy_id.clone();
        if let Err(e) = self
            .store
            .call(move |s| s.unlock_strategy(&strategy_id))
            .await
        {
            warn!(
                strategy_id = %input.strategy_id,
                error = %format!("{:#}", e),
                "failed to release strategy lock"
            );
        }
        result
    }

    async fn run_locked(
        &self,
        input: &PhaseGenerationInput,
    ) -> Result<PhaseGenerationOutput, WorkflowError> {
        let context = self.load_context(&input.strategy_id).await?;
        let candidates = self.resolve_candidates(&context).await?;
        let suggestion = self.generate_suggestion(&context, &candidates).await?;
        let outcome = self.persist(&context, &candidates, suggestion).await?;
        self.dispatch_writer_tasks(input, &context, &outcome).await?;
        self.queue_initial_snapshot(&context, &outcome).await?;

        info!(
            strategy_id = %context.strategy.id,
            phase_id = %outcome.phase.id,
            drafts = outcome.touched.len(),
            writers = outcome.writer_targets.len(),
            "phase generated"
        );
        Ok(PhaseGenerationOutput {
            strategy_id: context.strategy.id,
            phase_id: outcome.phase.id,
            draft_ids: outcome.touched,
        })
    }

    /// Step 1: strategy, project, and the full phase history with per-phase
    /// decision summaries. Missing entities are permanent failures.
    async fn load_context(&self, strategy_id: &str) -> Result<StrategyContext, WorkflowError> {
        let id = strategy_id.to_string();
        let strategy = self
            .store
            .call(move |s| s.get_strategy(&id))
            .await
            .map_err(WorkflowError::Database)?
            .ok_or_else(|| WorkflowError::not_found("strategy", strategy_id))?;

        let project_id = strategy.project_id.clone();
        let lookup_id = project_id.clone();
        let project = self
            .store
            .call(move |s| s.get_project(&lookup_id))
            .await
            .map_err(WorkflowError::Database)?
            .ok_or_else(|| WorkflowError::not_found("project", project_id))?;

        let sid = strategy.id.clone();
        let history = self
            .store
            .call(move |s| {
                let mut history = Vec::new();
                for phase in s.list_phases(&sid)? {
                    let mut summaries = Vec::new();
                    for content in s.list_phase_contents(&phase.id)? {
                        let title = s
                            .get_draft(&content.draft_id)?
                            .map(|d| d.title)
                            .unwrap_or_default();
                        summaries.push(format!(
                            "{}:{}:{}",
                            content.action, title, content.planned_keyword
                        ));
                    }
                    history.push(PhaseHistory { phase, summaries });
                }
                Ok(history)
            })
            .await
            .map_err(WorkflowError::Database)?;

        Ok(StrategyContext {
            strategy,
            project,
            history,
        })
    }

    /// Step 2: pure read, retryable.
    async fn resolve_candidates(
        &self,
        context: &StrategyContext,
    ) -> Result<BTreeMap<String, CandidateDraft>, WorkflowError> {
        let project_id = context.project.id.clone();
        let phase_ids: Vec<String> = context.history.iter().map(|h| h.phase.id.clone()).collect();
        let phases: Vec<Phase> = context.history.iter().map(|h| h.phase.clone()).collect();

        let (unassigned, per_phase) = self
            .store
            .call(move |s| {
                let unassigned = s.list_unassigned_drafts(&project_id)?;
                let mut per_phase = Vec::with_capacity(phase_ids.len());
                for phase_id in &phase_ids {
                    per_phase.push(s.list_drafts_for_phase(phase_id)?);
                }
                Ok((unassigned, per_phase))
            })
            .await
            .map_err(WorkflowError::Database)?;

        let phases_with_drafts: Vec<(Phase, Vec<ContentDraft>)> =
            phases.into_iter().zip(per_phase).collect();
        Ok(candidates::resolve(&unassigned, &phases_with_drafts))
    }

    /// Step 3: one reasoning call, retried as a whole unit by the durable
    /// substrate. The service runs its own tool loop against live data.
    async fn generate_suggestion(
        &self,
        context: &StrategyContext,
        candidates: &BTreeMap<String, CandidateDraft>,
    ) -> Result<PhaseSuggestion, WorkflowError> {
        let request = SuggestionRequest {
            system_prompt: build_system_prompt(
                &context.strategy,
                &context.project,
                &context.history,
                candidates,
            ),
            max_steps: REASONING_MAX_STEPS,
        };
        self.reasoning
            .suggest_phase(&request)
            .await
            .map_err(|e| WorkflowError::Reasoning(format!("{:#}", e)))
    }

    /// Step 4: commit the phase and every decision in one transaction.
    /// Stale candidate references are skipped with a warning; a decision
    /// referencing a draft the service was never shown must not fail the
    /// run or touch unrelated rows.
    async fn persist(
        &self,
        context: &StrategyContext,
        candidates: &BTreeMap<String, CandidateDraft>,
        suggestion: PhaseSuggestion,
    ) -> Result<PersistOutcome, WorkflowError> {
        let strategy_id = context.strategy.id.clone();
        let project_id = context.project.id.clone();
        let status = if context.history.is_empty() {
            PhaseStatus::Planned
        } else {
            PhaseStatus::Suggestion
        };
        let candidates = candidates.clone();

        self.store
            .call(move |s| {
                s.with_transaction(|s| {
                    let now = Utc::now();
                    let decisions =
                        suggestion.content_updates.len() + suggestion.content_creations.len();
                    let runway = suggestion.phase.cadence.interval_days()
                        + DAYS_PER_DECISION * decisions as i64;

                    let phase = Phase {
                        id: Uuid::new_v4().to_string(),
                        strategy_id: strategy_id.clone(),
                        phase_type: suggestion.phase.phase_type.clone(),
                        name: suggestion.phase.name.clone(),
                        observation_weeks: suggestion.phase.observation_weeks,
                        success_criteria: suggestion.phase.success_criteria.clone(),
                        cadence: suggestion.phase.cadence,
                        status,
                        started_at: None,
                        target_completion: Some(now + Duration::days(runway)),
                        created_at: now,
                    };
                    s.insert_phase(&phase)?;

                    let mut touched = Vec::new();
                    let mut created = Vec::new();
                    let mut annotated = Vec::new();

                    for update in &suggestion.content_updates {
                        let Some(candidate) = candidates.get(&update.content_draft_id) else {
                            warn!(
                                draft_id = %update.content_draft_id,
                                phase_id = %phase.id,
                                "update references a draft outside the candidate set, skipping"
                            );
                            continue;
                        };
                        s.update_draft_fields(
                            &update.content_draft_id,
                            update.updated_title.as_deref(),
                            update.updated_description.as_deref(),
                            update.updated_primary_keyword.as_deref(),
                            update.updated_role.as_deref(),
                        )?;
                        s.insert_phase_content(&PhaseContent {
                            id: Uuid::new_v4().to_string(),
                            phase_id: phase.id.clone(),
                            draft_id: update.content_draft_id.clone(),
                            action: update.action,
                            planned_keyword: update
                                .updated_primary_keyword
                                .clone()
                                .unwrap_or_else(|| candidate.draft.primary_keyword.clone()),
                            role: update
                                .updated_role
                                .clone()
                                .or_else(|| candidate.draft.role.clone()),
                            notes: update.updated_notes.clone(),
                            planned_slug: None,
                            created_at: now,
                        })?;
                        touched.push(update.content_draft_id.clone());
                        if update.updated_notes.is_some() {
                            annotated.push(update.content_draft_id.clone());
                        }
                    }

                    for creation in &suggestion.content_creations {
                        let draft = ContentDraft {
                            id: Uuid::new_v4().to_string(),
                            project_id: project_id.clone(),
                            slug: creation.planned_slug.clone(),
                            title: String::new(),
                            description: String::new(),
                            primary_keyword: creation.planned_primary_keyword.clone(),
                            status: DraftStatus::Queued,
                            role: Some(creation.role.clone()),
                            strategy_id: Some(strategy_id.clone()),
                            created_at: now,
                            updated_at: now,
                        };
                        s.insert_draft(&draft)?;
                        s.insert_phase_content(&PhaseContent {
                            id: Uuid::new_v4().to_string(),
                            phase_id: phase.id.clone(),
                            draft_id: draft.id.clone(),
                            action: creation.action,
                            planned_keyword: creation.planned_primary_keyword.clone(),
                            role: Some(creation.role.clone()),
                            notes: creation.notes.clone(),
                            planned_slug: Some(creation.planned_slug.clone()),
                            created_at: now,
                        })?;
                        touched.push(draft.id.clone());
                        created.push(draft.id);
                    }

                    let mut seen: HashSet<String> = created.iter().cloned().collect();
                    let mut writer_targets = created;
                    for id in annotated {
                        if seen.insert(id.clone()) {
                            writer_targets.push(id);
                        }
                    }

                    Ok(PersistOutcome {
                        phase,
                        touched,
                        writer_targets,
                    })
                })
            })
            .await
            .map_err(WorkflowError::Database)
    }

    /// Step 5: one writer task per created or annotated draft, chunked.
    async fn dispatch_writer_tasks(
        &self,
        input: &PhaseGenerationInput,
        context: &StrategyContext,
        outcome: &PersistOutcome,
    ) -> Result<(), WorkflowError> {
        let specs: Vec<TaskSpec> = outcome
            .writer_targets
            .iter()
            .map(|draft_id| TaskSpec {
                id: format!("writer-{}-{}", outcome.phase.id, draft_id),
                workflow: WRITER_WORKFLOW.to_string(),
                params: serde_json::json!({
                    "draftId": draft_id,
                    "phaseId": outcome.phase.id,
                    "projectId": context.project.id,
                }),
            })
            .collect();
        self.batcher
            .dispatch(
                self.runtime.as_ref(),
                &self.store,
                &context.project.id,
                &input.requested_by,
                &specs,
            )
            .await?;
        Ok(())
    }

    /// Step 6: queue one snapshot of the new phase so its baseline exists
    /// before any writer finishes.
    async fn queue_initial_snapshot(
        &self,
        context: &StrategyContext,
        outcome: &PersistOutcome,
    ) -> Result<(), WorkflowError> {
        let spec = TaskSpec {
            id: format!("snapshot-{}", outcome.phase.id),
            workflow: SNAPSHOT_WORKFLOW.to_string(),
            params: serde_json::json!({
                "strategyId": context.strategy.id,
                "phaseId": outcome.phase.id,
                "trigger": SnapshotTrigger::PhaseComplete.as_str(),
            }),
        };
        self.runtime
            .create(spec)
            .await
            .map_err(|e| WorkflowError::Runtime(format!("{:#}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cadence, ContentAction};
    use crate::providers::{ContentCreation, ContentUpdate, SuggestedPhase, TaskInstance};
    use crate::store::Store;
    use async_trait::async_trait;
    use regex::Regex;
    use std::sync::Mutex;

    struct FakeReasoning {
        suggestion: Option<PhaseSuggestion>,
        last_prompt: Mutex<Option<String>>,
    }

    impl FakeReasoning {
        fn returning(suggestion: PhaseSuggestion) -> Self {
            Self {
                suggestion: Some(suggestion),
                last_prompt: Mutex::new(None),
            }
        }

        fn failing() -> Self {
            Self {
                suggestion: None,
                last_prompt: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl ReasoningService for FakeReasoning {
        async fn suggest_phase(
            &self,
            request: &SuggestionRequest,
        ) -> anyhow::Result<PhaseSuggestion> {
            *self.last_prompt.lock().unwrap() = Some(request.system_prompt.clone());
            match &self.suggestion {
                Some(s) => Ok(s.clone()),
                None => anyhow::bail!("reasoning service timed out"),
            }
        }
    }

    #[derive(Default)]
    struct FakeRuntime {
        created: Mutex<Vec<TaskSpec>>,
        batched: Mutex<Vec<TaskSpec>>,
    }

    #[async_trait]
    impl TaskRuntime for FakeRuntime {
        fn provider(&self) -> &str {
            "test_runtime"
        }

        async fn create(&self, spec: TaskSpec) -> anyhow::Result<TaskInstance> {
            let id = spec.id.clone();
            self.created.lock().unwrap().push(spec);
            Ok(TaskInstance { id })
        }

        async fn create_batch(&self, specs: &[TaskSpec]) -> anyhow::Result<Vec<TaskInstance>> {
            self.batched.lock().unwrap().extend(specs.iter().cloned());
            Ok(specs
                .iter()
                .map(|s| TaskInstance { id: s.id.clone() })
                .collect())
        }
    }

    fn suggested_phase() -> SuggestedPhase {
        SuggestedPhase {
            phase_type: "growth".to_string(),
            name: "Expand comparison cluster".to_string(),
            observation_weeks: 4,
            success_criteria: "Top-10 for 3 keywords".to_string(),
            cadence: Cadence::Weekly,
        }
    }

    fn creation(slug: &str) -> ContentCreation {
        ContentCreation {
            action: ContentAction::Create,
            planned_slug: slug.to_string(),
            planned_primary_keyword: slug.replace('-', " "),
            role: "supporting".to_string(),
            notes: None,
        }
    }

    fn update(draft_id: &str, notes: Option<&str>) -> ContentUpdate {
        ContentUpdate {
            content_draft_id: draft_id.to_string(),
            action: ContentAction::Improve,
            updated_title: Some("Refreshed Title".to_string()),
            updated_description: None,
            updated_primary_keyword: None,
            updated_role: None,
            updated_notes: notes.map(str::to_string),
        }
    }

    struct Fixture {
        store: StoreHandle,
        strategy_id: String,
    }

    fn fixture(existing_drafts: &[&str]) -> Fixture {
        let store = Store::new_in_memory().unwrap();
        let now = Utc::now();

        store
            .insert_project(&Project {
                id: "proj-1".to_string(),
                organization_id: "org-1".to_string(),
                name: "Example".to_string(),
                base_url: "https://example.com/blog".to_string(),
                created_at: now,
            })
            .unwrap();
        store
            .insert_strategy(&Strategy {
                id: "strat-1".to_string(),
                project_id: "proj-1".to_string(),
                organization_id: "org-1".to_string(),
                name: "CRM cluster".to_string(),
                motivation: "Own the comparison SERPs".to_string(),
                description: String::new(),
                goal: "1k monthly clicks".to_string(),
                created_at: now,
            })
            .unwrap();

        for slug in existing_drafts {
            store
                .insert_draft(&ContentDraft {
                    id: format!("d-{}", slug),
                    project_id: "proj-1".to_string(),
                    slug: slug.to_string(),
                    title: slug.replace('-', " "),
                    description: String::new(),
                    primary_keyword: slug.replace('-', " "),
                    status: DraftStatus::Published,
                    role: None,
                    strategy_id: None,
                    created_at: now,
                    updated_at: now,
                })
                .unwrap();
        }

        Fixture {
            store: StoreHandle::new(store),
            strategy_id: "strat-1".to_string(),
        }
    }

    fn workflow(
        fixture: &Fixture,
        reasoning: FakeReasoning,
        runtime: Arc<FakeRuntime>,
    ) -> PhaseGenerationWorkflow {
        PhaseGenerationWorkflow::new(
            fixture.store.clone(),
            Arc::new(reasoning),
            runtime,
            TaskBatcher::default(),
        )
    }

    fn input(strategy_id: &str) -> PhaseGenerationInput {
        PhaseGenerationInput {
            strategy_id: strategy_id.to_string(),
            requested_by: "user-1".to_string(),
        }
    }

    #[test]
    fn test_slug_traffic_pattern_matches_with_optional_slash() {
        let pattern = Regex::new(&slug_traffic_pattern("best-crm-tools")).unwrap();
        assert!(pattern.is_match("/blog/best-crm-tools"));
        assert!(pattern.is_match("/blog/best-crm-tools/"));
        assert!(!pattern.is_match("/blog/best-crm-tools-2026"));
    }

    #[tokio::test]
    async fn test_missing_strategy_is_non_retryable() {
        let f = fixture(&[]);
        let wf = workflow(
            &f,
            FakeReasoning::returning(PhaseSuggestion {
                phase: suggested_phase(),
                content_updates: vec![],
                content_creations: vec![],
            }),
            Arc::new(FakeRuntime::default()),
        );
        let err = wf.run(input("missing")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_first_phase_planned_then_suggestion() {
        let f = fixture(&[]);
        let runtime = Arc::new(FakeRuntime::default());

        let first = workflow(
            &f,
            FakeReasoning::returning(PhaseSuggestion {
                phase: suggested_phase(),
                content_updates: vec![],
                content_creations: vec![creation("crm-vs-spreadsheets")],
            }),
            runtime.clone(),
        );
        let out = first.run(input(&f.strategy_id)).await.unwrap();
        let phase_id = out.phase_id.clone();
        let phase = f
            .store
            .call(move |s| s.get_phase(&phase_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(phase.status, PhaseStatus::Planned);
        assert!(phase.target_completion.unwrap() > phase.created_at);

        let second = workflow(
            &f,
            FakeReasoning::returning(PhaseSuggestion {
                phase: suggested_phase(),
                content_updates: vec![],
                content_creations: vec![creation("crm-pricing-guide")],
            }),
            runtime,
        );
        let out = second.run(input(&f.strategy_id)).await.unwrap();
        let phase_id = out.phase_id.clone();
        let phase = f
            .store
            .call(move |s| s.get_phase(&phase_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(phase.status, PhaseStatus::Suggestion);
    }

    #[tokio::test]
    async fn test_stale_update_reference_skipped_others_persist() {
        let f = fixture(&["best-crm-tools"]);
        let runtime = Arc::new(FakeRuntime::default());
        let wf = workflow(
            &f,
            FakeReasoning::returning(PhaseSuggestion {
                phase: suggested_phase(),
                content_updates: vec![
                    update("d-best-crm-tools", None),
                    update("d-ghost", Some("does not exist")),
                ],
                content_creations: vec![creation("crm-vs-spreadsheets")],
            }),
            runtime,
        );

        let out = wf.run(input(&f.strategy_id)).await.unwrap();
        // Stale reference dropped: one update + one creation survive.
        assert_eq!(out.draft_ids.len(), 2);
        assert!(out.draft_ids.contains(&"d-best-crm-tools".to_string()));

        let phase_id = out.phase_id.clone();
        let contents = f
            .store
            .call(move |s| s.list_phase_contents(&phase_id))
            .await
            .unwrap();
        assert_eq!(contents.len(), 2);
        assert!(contents.iter().all(|c| c.draft_id != "d-ghost"));

        let updated = f
            .store
            .call(|s| s.get_draft("d-best-crm-tools"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.title, "Refreshed Title");
    }

    #[tokio::test]
    async fn test_writer_tasks_cover_created_and_annotated_updates() {
        let f = fixture(&["best-crm-tools", "crm-pricing"]);
        let runtime = Arc::new(FakeRuntime::default());
        let wf = workflow(
            &f,
            FakeReasoning::returning(PhaseSuggestion {
                phase: suggested_phase(),
                content_updates: vec![
                    update("d-best-crm-tools", Some("refresh pricing tables")),
                    update("d-crm-pricing", None),
                ],
                content_creations: vec![creation("crm-vs-spreadsheets")],
            }),
            runtime.clone(),
        );

        let out = wf.run(input(&f.strategy_id)).await.unwrap();
        assert_eq!(out.draft_ids.len(), 3);

        // Writer fan-out: the creation plus the annotated update only.
        let batched = runtime.batched.lock().unwrap().clone();
        assert_eq!(batched.len(), 2);
        assert!(batched.iter().all(|s| s.workflow == WRITER_WORKFLOW));
        assert!(
            batched
                .iter()
                .any(|s| s.params["draftId"] == "d-best-crm-tools")
        );
        assert!(
            batched
                .iter()
                .all(|s| s.params["draftId"] != "d-crm-pricing")
        );

        // One snapshot instance queued for the new phase.
        let created = runtime.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].workflow, SNAPSHOT_WORKFLOW);
        assert_eq!(created[0].params["trigger"], "phase_complete");
        assert_eq!(created[0].params["phaseId"], out.phase_id.as_str());

        // Tracking rows for each writer chunk.
        let rows = f
            .store
            .call(|s| s.list_task_runs("proj-1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].requested_by, "user-1");
    }

    #[tokio::test]
    async fn test_held_lock_rejects_concurrent_generation() {
        let f = fixture(&[]);
        f.store
            .lock_sync()
            .unwrap()
            .try_lock_strategy(&f.strategy_id, "other-run")
            .unwrap();

        let wf = workflow(
            &f,
            FakeReasoning::returning(PhaseSuggestion {
                phase: suggested_phase(),
                content_updates: vec![],
                content_creations: vec![],
            }),
            Arc::new(FakeRuntime::default()),
        );
        let err = wf.run(input(&f.strategy_id)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::StrategyLocked { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_lock_released_after_reasoning_failure() {
        let f = fixture(&[]);
        let wf = workflow(&f, FakeReasoning::failing(), Arc::new(FakeRuntime::default()));

        let err = wf.run(input(&f.strategy_id)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Reasoning(_)));
        assert!(err.is_retryable());

        // The lock must not leak past a failed run.
        assert!(
            f.store
                .lock_sync()
                .unwrap()
                .try_lock_strategy(&f.strategy_id, "next-run")
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_prompt_carries_history_and_candidates() {
        let f = fixture(&["best-crm-tools"]);
        let runtime = Arc::new(FakeRuntime::default());
        let reasoning = FakeReasoning::returning(PhaseSuggestion {
            phase: suggested_phase(),
            content_updates: vec![update("d-best-crm-tools", Some("add comparison table"))],
            content_creations: vec![],
        });
        let wf = PhaseGenerationWorkflow::new(
            f.store.clone(),
            Arc::new(reasoning),
            runtime,
            TaskBatcher::default(),
        );
        wf.run(input(&f.strategy_id)).await.unwrap();

        // Second run sees the first phase in its history block.
        let reasoning = FakeReasoning::returning(PhaseSuggestion {
            phase: suggested_phase(),
            content_updates: vec![],
            content_creations: vec![],
        });
        let reasoning = Arc::new(reasoning);
        let wf = PhaseGenerationWorkflow::new(
            f.store.clone(),
            reasoning.clone(),
            Arc::new(FakeRuntime::default()),
            TaskBatcher::default(),
        );
        wf.run(input(&f.strategy_id)).await.unwrap();

        let prompt = reasoning.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("CRM cluster"));
        assert!(prompt.contains("Expand comparison cluster"));
        assert!(prompt.contains("improve:Refreshed Title:best crm tools"));
        assert!(prompt.contains("d-best-crm-tools"));
        assert!(prompt.contains("[prior_phase]"));
        assert!(prompt.contains(r"/best\-crm\-tools/?$"));
    }
}
