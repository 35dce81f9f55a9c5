//! Boundary traits and payload shapes for the external collaborators:
//! the observed-metrics provider (search-console-like), the estimated
//! keyword-intelligence provider, the tool-augmented reasoning service,
//! and the durable task runtime. Concrete vendor clients live outside this
//! crate; only the response shapes matter here.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{Cadence, ContentAction};

/// One dimension filter on an observed-metrics query, e.g. page == URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionFilter {
    pub dimension: String,
    pub operator: String,
    pub expression: String,
}

impl DimensionFilter {
    pub fn page_equals(url: &str) -> Self {
        Self {
            dimension: "page".to_string(),
            operator: "equals".to_string(),
            expression: url.to_string(),
        }
    }
}

/// An observed-metrics query over a date range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub site_url: String,
    pub site_type: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub dimensions: Vec<String>,
    pub filters: Vec<DimensionFilter>,
    pub row_limit: u32,
}

/// One row of observed search performance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRow {
    /// One entry per requested dimension, in query order.
    pub keys: Vec<String>,
    pub clicks: f64,
    pub impressions: f64,
    pub ctr: Option<f64>,
    pub position: Option<f64>,
}

/// Authenticated source of real historical search performance.
#[async_trait]
pub trait ObservedMetrics: Send + Sync {
    async fn query(&self, query: &SearchQuery) -> anyhow::Result<Vec<SearchRow>>;
}

/// Monthly search-volume statistics for one keyword.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchVolume {
    pub monthly_average: f64,
    /// Oldest to newest; the last entry is the most recent month.
    pub monthly_breakdown: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerpDetails {
    pub estimated_traffic_volume: f64,
}

/// One keyword a site ranks for, per the estimated provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedKeyword {
    pub keyword: String,
    pub search_volume: SearchVolume,
    pub serp_details: SerpDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedKeywordsRequest {
    pub hostname: String,
    pub location: String,
    pub language: String,
    pub position_min: u32,
    pub position_max: u32,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedKeywordPage {
    pub keywords: Vec<RankedKeyword>,
}

/// Metrics source that infers performance from aggregate keyword statistics,
/// available without a per-site integration.
#[async_trait]
pub trait EstimatedMetrics: Send + Sync {
    async fn fetch_ranked_keywords(
        &self,
        request: &RankedKeywordsRequest,
    ) -> anyhow::Result<RankedKeywordPage>;
}

/// Request to the tool-augmented reasoning service. The service runs its own
/// tool loop (web search, both metrics providers, strategy detail lookup)
/// bounded by `max_steps` and returns a structured [`PhaseSuggestion`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionRequest {
    pub system_prompt: String,
    pub max_steps: u32,
}

/// The phase the reasoning service proposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedPhase {
    #[serde(rename = "type")]
    pub phase_type: String,
    pub name: String,
    pub observation_weeks: u32,
    pub success_criteria: String,
    pub cadence: Cadence,
}

/// One decision to change an existing draft. The referenced id must come
/// from the candidate set handed to the reasoning service; stale ids are
/// skipped during persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentUpdate {
    pub content_draft_id: String,
    pub action: ContentAction,
    pub updated_title: Option<String>,
    pub updated_description: Option<String>,
    pub updated_primary_keyword: Option<String>,
    pub updated_role: Option<String>,
    pub updated_notes: Option<String>,
}

/// One decision to create a net-new draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentCreation {
    pub action: ContentAction,
    pub planned_slug: String,
    pub planned_primary_keyword: String,
    pub role: String,
    pub notes: Option<String>,
}

/// Structured output of the reasoning step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSuggestion {
    pub phase: SuggestedPhase,
    #[serde(default)]
    pub content_updates: Vec<ContentUpdate>,
    #[serde(default)]
    pub content_creations: Vec<ContentCreation>,
}

impl PhaseSuggestion {
    /// Parse a suggestion from raw model output, tolerating markdown fences
    /// or prose around the JSON object.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let cleaned = match (raw.find('{'), raw.rfind('}')) {
            (Some(start), Some(end)) if end > start => &raw[start..=end],
            _ => raw,
        };
        serde_json::from_str(cleaned)
            .map_err(|e| anyhow::anyhow!("Failed to parse phase suggestion as JSON: {}", e))
    }
}

/// Tool-augmented reasoning over live ranking data. Treated as a pure
/// external function from context to decision.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn suggest_phase(&self, request: &SuggestionRequest) -> anyhow::Result<PhaseSuggestion>;
}

/// A unit of follow-on work to create on the durable runtime. The id is
/// caller-supplied so re-dispatching the same logical work is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub workflow: String,
    pub params: serde_json::Value,
}

/// Handle to a created workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: String,
}

/// Durable-execution substrate: creates workflow instances that outlive
/// this process. Retries, backoff, and step durability are its concern.
#[async_trait]
pub trait TaskRuntime: Send + Sync {
    /// Provider tag recorded on each task-run tracking row.
    fn provider(&self) -> &str;

    async fn create(&self, spec: TaskSpec) -> anyhow::Result<TaskInstance>;

    async fn create_batch(&self, specs: &[TaskSpec]) -> anyhow::Result<Vec<TaskInstance>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suggestion() {
        let json = r#"{
            "phase": {
                "type": "growth",
                "name": "Expand comparison cluster",
                "observationWeeks": 4,
                "successCriteria": "Top-10 positions for 3 comparison keywords",
                "cadence": "weekly"
            },
            "contentUpdates": [
                {
                    "contentDraftId": "d-1",
                    "action": "improve",
                    "updatedTitle": "Best CRM Tools in 2026",
                    "updatedNotes": "Refresh pricing tables"
                }
            ],
            "contentCreations": [
                {
                    "action": "create",
                    "plannedSlug": "crm-vs-spreadsheets",
                    "plannedPrimaryKeyword": "crm vs spreadsheets",
                    "role": "comparison"
                }
            ]
        }"#;

        let suggestion = PhaseSuggestion::parse(json).unwrap();
        assert_eq!(suggestion.phase.phase_type, "growth");
        assert_eq!(suggestion.phase.observation_weeks, 4);
        assert_eq!(suggestion.content_updates.len(), 1);
        assert_eq!(suggestion.content_updates[0].content_draft_id, "d-1");
        assert_eq!(suggestion.content_creations.len(), 1);
        assert_eq!(
            suggestion.content_creations[0].planned_slug,
            "crm-vs-spreadsheets"
        );
    }

    #[test]
    fn test_parse_suggestion_with_markdown_wrapping() {
        let wrapped = r#"Here is the next phase:
```json
{
    "phase": {
        "type": "foundation",
        "name": "Seed pillar pages",
        "observationWeeks": 6,
        "successCriteria": "Indexed and impressions > 0",
        "cadence": "biweekly"
    }
}
```
Let me know if you want changes."#;

        let suggestion = PhaseSuggestion::parse(wrapped).unwrap();
        assert_eq!(suggestion.phase.name, "Seed pillar pages");
        assert!(suggestion.content_updates.is_empty());
        assert!(suggestion.content_creations.is_empty());
    }

    #[test]
    fn test_parse_suggestion_rejects_garbage() {
        assert!(PhaseSuggestion::parse("not json at all").is_err());
    }

    #[test]
    fn test_page_equals_filter() {
        let f = DimensionFilter::page_equals("https://example.com/blog/best-crm-tools");
        assert_eq!(f.dimension, "page");
        assert_eq!(f.operator, "equals");
        assert_eq!(f.expression, "https://example.com/blog/best-crm-tools");
    }
}
