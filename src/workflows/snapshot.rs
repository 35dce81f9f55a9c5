//! Performance snapshot workflow: measure how a strategy's published
//! content is actually doing and fold the result into its history.
//!
//! Two durable steps. Context loading fails non-retryably on missing
//! entities; everything after it is one compute-and-persist step — the
//! intermediate per-draft results are cheap to recompute, so the only
//! durability boundary worth paying for is the single terminal insert.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::WorkflowError;
use crate::metrics::aggregator;
use crate::models::{
    Aggregate, ContentDraft, KeywordRow, Project, SearchIntegration, Snapshot, SnapshotContent,
    SnapshotTrigger, Strategy,
};
use crate::providers::{DimensionFilter, ObservedMetrics, SearchQuery, SearchRow};
use crate::store::StoreHandle;

/// Observation window for every snapshot: the most recent week.
pub const SNAPSHOT_LOOKBACK_DAYS: i64 = 7;
/// Generous per-page row cap; one draft rarely ranks for more keywords.
pub const PER_PAGE_ROW_LIMIT: u32 = 1000;
/// Bound on the per-draft keyword drill-down kept in the snapshot.
pub const TOP_KEYWORDS_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInput {
    pub strategy_id: String,
    /// Scope to one phase's drafts; `None` snapshots the whole strategy.
    pub phase_id: Option<String>,
    pub trigger: SnapshotTrigger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotOutput {
    pub strategy_id: String,
    /// `None` when the project has no observed-metrics integration —
    /// a legitimate "not applicable" outcome, not a failure.
    pub snapshot_id: Option<String>,
}

/// Per-draft measurement before strategy-level aggregation.
struct DraftPerformance {
    draft_id: String,
    aggregate: Aggregate,
    top_keywords: Vec<KeywordRow>,
}

impl DraftPerformance {
    fn zero(draft_id: &str) -> Self {
        Self {
            draft_id: draft_id.to_string(),
            aggregate: Aggregate::default(),
            top_keywords: Vec::new(),
        }
    }
}

/// Build the public URL a draft is reachable at. The slug must be
/// URL-safe as stored; anything else came from a bad import and gets a
/// zero placeholder rather than aborting the batch.
fn page_url(base_url: &str, slug: &str) -> anyhow::Result<String> {
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        anyhow::bail!("Base URL {} is not absolute", base_url);
    }
    if slug.is_empty() {
        anyhow::bail!("Draft slug is empty");
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/'))
    {
        anyhow::bail!("Draft slug {:?} contains characters unsafe in a URL path", slug);
    }
    Ok(format!("{}/{}", base_url.trim_end_matches('/'), slug))
}

/// Collapse one draft's keyword rows into its aggregate plus the bounded
/// drill-down list, sorted by clicks descending.
fn summarize_rows(draft_id: &str, rows: &[SearchRow]) -> DraftPerformance {
    let clicks: f64 = rows.iter().map(|r| r.clicks).sum();
    let impressions: f64 = rows.iter().map(|r| r.impressions).sum();
    let avg_position = if impressions > 0.0 {
        rows.iter()
            .map(|r| r.position.unwrap_or(0.0) * r.impressions)
            .sum::<f64>()
            / impressions
    } else {
        0.0
    };

    let mut top_keywords: Vec<KeywordRow> = rows
        .iter()
        .map(|r| KeywordRow {
            keyword: r.keys.first().cloned().unwrap_or_default(),
            position: r.position.unwrap_or(0.0),
            clicks: r.clicks.round() as i64,
            impressions: r.impressions.round() as i64,
        })
        .collect();
    top_keywords.sort_by(|a, b| b.clicks.cmp(&a.clicks));
    top_keywords.truncate(TOP_KEYWORDS_LIMIT);

    DraftPerformance {
        draft_id: draft_id.to_string(),
        aggregate: Aggregate {
            clicks: clicks.round() as i64,
            impressions: impressions.round() as i64,
            avg_position,
        },
        top_keywords,
    }
}

pub struct SnapshotWorkflow {
    store: StoreHandle,
    observed: Arc<dyn ObservedMetrics>,
}

impl SnapshotWorkflow {
    pub fn new(store: StoreHandle, observed: Arc<dyn ObservedMetrics>) -> Self {
        Self { store, observed }
    }

    pub async fn run(&self, input: SnapshotInput) -> Result<SnapshotOutput, WorkflowError> {
        let (strategy, project) = self.load_context(&input.strategy_id).await?;
        let snapshot_id = self
            .compute_and_persist(&strategy, &project, &input)
            .await?;
        Ok(SnapshotOutput {
            strategy_id: strategy.id,
            snapshot_id,
        })
    }

    /// Step 1: resolve strategy and project. Missing ids are permanent
    /// failures — the entity was deleted or never existed.
    async fn load_context(&self, strategy_id: &str) -> Result<(Strategy, Project), WorkflowError> {
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

        Ok((strategy, project))
    }

    /// Step 2: measure, aggregate, delta, persist — retried as a unit.
    /// Only reads external state plus one terminal insert, so a retry
    /// recomputes from scratch safely.
    async fn compute_and_persist(
        &self,
        strategy: &Strategy,
        project: &Project,
        input: &SnapshotInput,
    ) -> Result<Option<String>, WorkflowError> {
        let Some(integration) = self.load_integration(&project.id).await? else {
            info!(
                strategy_id = %strategy.id,
                project_id = %project.id,
                "no observed-metrics integration configured, skipping snapshot"
            );
            return Ok(None);
        };

        let targets = self.resolve_targets(strategy, input).await?;

        let mut results = Vec::with_capacity(targets.len());
        for draft in &targets {
            results.push(self.measure_draft(project, &integration, draft).await);
        }

        let aggregate = aggregator::aggregate(
            &results.iter().map(|r| r.aggregate).collect::<Vec<_>>(),
        );

        let strategy_id = strategy.id.clone();
        let previous = self
            .store
            .call(move |s| s.latest_snapshot(&strategy_id))
            .await
            .map_err(WorkflowError::Database)?;
        let delta = aggregator::delta(&aggregate, previous.as_ref().map(|s| &s.aggregate));

        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            strategy_id: strategy.id.clone(),
            phase_id: input.phase_id.clone(),
            captured_at: Utc::now(),
            trigger: input.trigger,
            aggregate,
            delta,
            insights: None,
        };
        let contents: Vec<SnapshotContent> = results
            .into_iter()
            .map(|r| SnapshotContent {
                id: Uuid::new_v4().to_string(),
                snapshot_id: snapshot.id.clone(),
                draft_id: r.draft_id,
                aggregate: r.aggregate,
                top_keywords: r.top_keywords,
            })
            .collect();

        let snapshot_id = snapshot.id.clone();
        self.store
            .call(move |s| s.insert_snapshot_with_contents(&snapshot, &contents))
            .await
            .map_err(WorkflowError::Database)?;

        info!(
            strategy_id = %strategy.id,
            snapshot_id = %snapshot_id,
            drafts = targets.len(),
            "snapshot persisted"
        );
        Ok(Some(snapshot_id))
    }

    async fn load_integration(
        &self,
        project_id: &str,
    ) -> Result<Option<SearchIntegration>, WorkflowError> {
        let id = project_id.to_string();
        self.store
            .call(move |s| s.get_search_integration(&id))
            .await
            .map_err(WorkflowError::Database)
    }

    /// The drafts this snapshot measures. A phase scope that resolves to
    /// zero drafts is a caller configuration error, not something a retry
    /// can fix.
    async fn resolve_targets(
        &self,
        strategy: &Strategy,
        input: &SnapshotInput,
    ) -> Result<Vec<ContentDraft>, WorkflowError> {
        match &input.phase_id {
            Some(phase_id) => {
                let id = phase_id.clone();
                let drafts = self
                    .store
                    .call(move |s| s.list_drafts_for_phase(&id))
                    .await
                    .map_err(WorkflowError::Database)?;
                if drafts.is_empty() {
                    return Err(WorkflowError::EmptyPhaseScope {
                        phase_id: phase_id.clone(),
                    });
                }
                Ok(drafts)
            }
            None => {
                let id = strategy.id.clone();
                self.store
                    .call(move |s| s.list_drafts_for_strategy(&id))
                    .await
                    .map_err(WorkflowError::Database)
            }
        }
    }

    /// Measure one draft. Both failure modes here — a bad slug and a
    /// provider hiccup — degrade to a zero placeholder so one draft never
    /// blanks the whole snapshot.
    async fn measure_draft(
        &self,
        project: &Project,
        integration: &SearchIntegration,
        draft: &ContentDraft,
    ) -> DraftPerformance {
        let url = match page_url(&project.base_url, &draft.slug) {
            Ok(url) => url,
            Err(e) => {
                warn!(
                    draft_id = %draft.id,
                    slug = %draft.slug,
                    error = %e,
                    "URL construction failed, recording zero aggregate"
                );
                return DraftPerformance::zero(&draft.id);
            }
        };

        let end_date = Utc::now().date_naive();
        let query = SearchQuery {
            site_url: integration.site_url.clone(),
            site_type: integration.provider.clone(),
            start_date: end_date - Duration::days(SNAPSHOT_LOOKBACK_DAYS),
            end_date,
            dimensions: vec!["query".to_string()],
            filters: vec![DimensionFilter::page_equals(&url)],
            row_limit: PER_PAGE_ROW_LIMIT,
        };

        match self.observed.query(&query).await {
            Ok(rows) => summarize_rows(&draft.id, &rows),
            Err(e) => {
                warn!(
                    draft_id = %draft.id,
                    url = %url,
                    error = %format!("{:#}", e),
                    "observed-metrics query failed, recording zero aggregate"
                );
                DraftPerformance::zero(&draft.id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cadence, ContentAction, DraftStatus, Phase, PhaseContent, PhaseStatus};
    use crate::store::Store;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};

    struct FakeObserved {
        rows_by_page: HashMap<String, Vec<SearchRow>>,
        fail_pages: HashSet<String>,
    }

    impl FakeObserved {
        fn new() -> Self {
            Self {
                rows_by_page: HashMap::new(),
                fail_pages: HashSet::new(),
            }
        }

        fn with_rows(mut self, page: &str, rows: Vec<SearchRow>) -> Self {
            self.rows_by_page.insert(page.to_string(), rows);
            self
        }

        fn failing_on(mut self, page: &str) -> Self {
            self.fail_pages.insert(page.to_string());
            self
        }
    }

    #[async_trait]
    impl ObservedMetrics for FakeObserved {
        async fn query(&self, query: &SearchQuery) -> anyhow::Result<Vec<SearchRow>> {
            let page = query
                .filters
                .first()
                .map(|f| f.expression.clone())
                .unwrap_or_default();
            if self.fail_pages.contains(&page) {
                anyhow::bail!("provider returned 503");
            }
            Ok(self.rows_by_page.get(&page).cloned().unwrap_or_default())
        }
    }

    fn row(keyword: &str, clicks: f64, impressions: f64, position: f64) -> SearchRow {
        SearchRow {
            keys: vec![keyword.to_string()],
            clicks,
            impressions,
            ctr: None,
            position: Some(position),
        }
    }

    struct Fixture {
        store: StoreHandle,
        strategy_id: String,
        phase_id: String,
    }

    fn fixture(with_integration: bool, slugs: &[&str]) -> Fixture {
        let store = Store::new_in_memory().unwrap();
        let now = Utc::now();

        let project = Project {
            id: "proj-1".to_string(),
            organization_id: "org-1".to_string(),
            name: "Example".to_string(),
            base_url: "https://example.com/blog".to_string(),
            created_at: now,
        };
        store.insert_project(&project).unwrap();

        if with_integration {
            store
                .set_search_integration(&SearchIntegration {
                    project_id: project.id.clone(),
                    provider: "search_console".to_string(),
                    site_url: "sc-domain:example.com".to_string(),
                })
                .unwrap();
        }

        let strategy = Strategy {
            id: "strat-1".to_string(),
            project_id: project.id.clone(),
            organization_id: "org-1".to_string(),
            name: "CRM cluster".to_string(),
            motivation: String::new(),
            description: String::new(),
            goal: String::new(),
            created_at: now,
        };
        store.insert_strategy(&strategy).unwrap();

        let phase = Phase {
            id: "phase-1".to_string(),
            strategy_id: strategy.id.clone(),
            phase_type: "growth".to_string(),
            name: "Phase 1".to_string(),
            observation_weeks: 4,
            success_criteria: String::new(),
            cadence: Cadence::Weekly,
            status: PhaseStatus::Planned,
            started_at: None,
            target_completion: None,
            created_at: now,
        };
        store.insert_phase(&phase).unwrap();

        for (i, slug) in slugs.iter().enumerate() {
            let draft = ContentDraft {
                id: format!("d-{}", i),
                project_id: project.id.clone(),
                slug: slug.to_string(),
                title: slug.to_string(),
                description: String::new(),
                primary_keyword: slug.to_string(),
                status: DraftStatus::Published,
                role: None,
                strategy_id: Some(strategy.id.clone()),
                created_at: now,
                updated_at: now,
            };
            store.insert_draft(&draft).unwrap();
            store
                .insert_phase_content(&PhaseContent {
                    id: format!("pc-{}", i),
                    phase_id: phase.id.clone(),
                    draft_id: draft.id.clone(),
                    action: ContentAction::Create,
                    planned_keyword: slug.to_string(),
                    role: None,
                    notes: None,
                    planned_slug: Some(slug.to_string()),
                    created_at: now,
                })
                .unwrap();
        }

        Fixture {
            store: StoreHandle::new(store),
            strategy_id: strategy.id,
            phase_id: phase.id,
        }
    }

    fn input(strategy_id: &str, phase_id: Option<&str>) -> SnapshotInput {
        SnapshotInput {
            strategy_id: strategy_id.to_string(),
            phase_id: phase_id.map(str::to_string),
            trigger: SnapshotTrigger::Manual,
        }
    }

    #[test]
    fn test_page_url_joins_and_validates() {
        assert_eq!(
            page_url("https://example.com/blog/", "best-crm-tools").unwrap(),
            "https://example.com/blog/best-crm-tools"
        );
        assert!(page_url("https://example.com", "").is_err());
        assert!(page_url("https://example.com", "bad slug").is_err());
        assert!(page_url("example.com", "fine-slug").is_err());
    }

    #[test]
    fn test_summarize_rows_weighted_position_and_top_keywords() {
        let rows = vec![
            row("best crm tools", 10.0, 100.0, 3.0),
            row("crm pricing", 30.0, 300.0, 9.0),
        ];
        let perf = summarize_rows("d-1", &rows);
        assert_eq!(perf.aggregate.clicks, 40);
        assert_eq!(perf.aggregate.impressions, 400);
        // (3*100 + 9*300) / 400 = 7.5
        assert!((perf.aggregate.avg_position - 7.5).abs() < 1e-9);
        // Sorted by clicks descending.
        assert_eq!(perf.top_keywords[0].keyword, "crm pricing");
    }

    #[tokio::test]
    async fn test_missing_strategy_is_non_retryable() {
        let f = fixture(true, &[]);
        let workflow = SnapshotWorkflow::new(f.store.clone(), Arc::new(FakeObserved::new()));
        let err = workflow.run(input("nope", None)).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_no_integration_skips_with_null_snapshot() {
        let f = fixture(false, &["best-crm-tools"]);
        let workflow = SnapshotWorkflow::new(f.store.clone(), Arc::new(FakeObserved::new()));
        let out = workflow.run(input(&f.strategy_id, None)).await.unwrap();
        assert_eq!(out.snapshot_id, None);
    }

    #[tokio::test]
    async fn test_empty_phase_scope_is_config_error() {
        let f = fixture(true, &[]);
        let workflow = SnapshotWorkflow::new(f.store.clone(), Arc::new(FakeObserved::new()));
        let err = workflow
            .run(input(&f.strategy_id, Some("phase-1")))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::EmptyPhaseScope { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_bad_slug_degrades_to_zero_not_failure() {
        // Second draft's slug cannot form a URL; its contribution is zero.
        let f = fixture(true, &["best-crm-tools", "bad slug"]);
        let observed = FakeObserved::new().with_rows(
            "https://example.com/blog/best-crm-tools",
            vec![row("best crm tools", 10.0, 200.0, 4.0)],
        );
        let workflow = SnapshotWorkflow::new(f.store.clone(), Arc::new(observed));

        let out = workflow
            .run(input(&f.strategy_id, Some(&f.phase_id)))
            .await
            .unwrap();
        let snapshot_id = out.snapshot_id.unwrap();

        let snapshot = f
            .store
            .call(move |s| s.get_snapshot(&snapshot_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.aggregate.clicks, 10);
        assert_eq!(snapshot.aggregate.impressions, 200);
        assert!((snapshot.aggregate.avg_position - 4.0).abs() < 1e-9);

        let sid = snapshot.id.clone();
        let contents = f
            .store
            .call(move |s| s.list_snapshot_contents(&sid))
            .await
            .unwrap();
        assert_eq!(contents.len(), 2);
        let zero = contents.iter().find(|c| c.draft_id == "d-1").unwrap();
        assert_eq!(zero.aggregate, Aggregate::default());
        assert!(zero.top_keywords.is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_degrades_to_zero() {
        let f = fixture(true, &["best-crm-tools", "crm-pricing"]);
        let observed = FakeObserved::new()
            .with_rows(
                "https://example.com/blog/best-crm-tools",
                vec![row("best crm tools", 8.0, 80.0, 5.0)],
            )
            .failing_on("https://example.com/blog/crm-pricing");
        let workflow = SnapshotWorkflow::new(f.store.clone(), Arc::new(observed));

        let out = workflow
            .run(input(&f.strategy_id, Some(&f.phase_id)))
            .await
            .unwrap();
        let snapshot_id = out.snapshot_id.unwrap();
        let snapshot = f
            .store
            .call(move |s| s.get_snapshot(&snapshot_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.aggregate.clicks, 8);
        assert_eq!(snapshot.aggregate.impressions, 80);
    }

    #[tokio::test]
    async fn test_first_snapshot_has_no_delta_second_does() {
        let f = fixture(true, &["best-crm-tools"]);
        let observed = FakeObserved::new().with_rows(
            "https://example.com/blog/best-crm-tools",
            vec![row("best crm tools", 10.0, 100.0, 5.0)],
        );
        let workflow = SnapshotWorkflow::new(f.store.clone(), Arc::new(observed));

        let first = workflow
            .run(input(&f.strategy_id, Some(&f.phase_id)))
            .await
            .unwrap();
        let first_id = first.snapshot_id.unwrap();
        let first_snapshot = f
            .store
            .call(move |s| s.get_snapshot(&first_id))
            .await
            .unwrap()
            .unwrap();
        assert!(first_snapshot.delta.is_none());

        // Same measurements again; the delta against the first is zero.
        let second = workflow
            .run(input(&f.strategy_id, Some(&f.phase_id)))
            .await
            .unwrap();
        let second_id = second.snapshot_id.unwrap();
        let second_snapshot = f
            .store
            .call(move |s| s.get_snapshot(&second_id))
            .await
            .unwrap()
            .unwrap();
        let delta = second_snapshot.delta.unwrap();
        assert_eq!(delta.clicks, 0);
        assert_eq!(delta.impressions, 0);
        assert!(delta.avg_position.abs() < 1e-9);
    }
}
