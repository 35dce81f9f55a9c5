use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A site the strategy publishes to, owned by an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    /// Base URL drafts are published under, e.g. `https://example.com/blog`.
    pub base_url: String,
    pub created_at: DateTime<Utc>,
}

/// A long-running content plan with a goal, composed of sequential phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub project_id: String,
    pub organization_id: String,
    pub name: String,
    pub motivation: String,
    pub description: String,
    pub goal: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Planned,
    Suggestion,
    Active,
    Completed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Suggestion => "suggestion",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "suggestion" => Ok(Self::Suggestion),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

/// How often the strategy publishes and re-observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Weekly,
    Biweekly,
    Monthly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Biweekly => "biweekly",
            Self::Monthly => "monthly",
        }
    }

    /// Length of one publishing cycle in days.
    pub fn interval_days(&self) -> i64 {
        match self {
            Self::Weekly => 7,
            Self::Biweekly => 14,
            Self::Monthly => 30,
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(Self::Weekly),
            "biweekly" => Ok(Self::Biweekly),
            "monthly" => Ok(Self::Monthly),
            _ => Err(format!("Invalid cadence: {}", s)),
        }
    }
}

/// One execution cycle of a strategy: a bounded set of content decisions
/// plus an observation period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub strategy_id: String,
    pub phase_type: String,
    pub name: String,
    pub observation_weeks: u32,
    pub success_criteria: String,
    pub cadence: Cadence,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub target_completion: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentAction {
    Create,
    Update,
    Improve,
    Expand,
}

impl ContentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Improve => "improve",
            Self::Expand => "expand",
        }
    }
}

impl std::fmt::Display for ContentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "improve" => Ok(Self::Improve),
            "expand" => Ok(Self::Expand),
            _ => Err(format!("Invalid content action: {}", s)),
        }
    }
}

/// Join row tying one content decision to a phase. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseContent {
    pub id: String,
    pub phase_id: String,
    pub draft_id: String,
    pub action: ContentAction,
    pub planned_keyword: String,
    pub role: Option<String>,
    pub notes: Option<String>,
    /// Set only for net-new items; existing drafts already carry a slug.
    pub planned_slug: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Queued,
    Writing,
    Review,
    Published,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Writing => "writing",
            Self::Review => "review",
            Self::Published => "published",
        }
    }
}

impl std::fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DraftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "writing" => Ok(Self::Writing),
            "review" => Ok(Self::Review),
            "published" => Ok(Self::Published),
            _ => Err(format!("Invalid draft status: {}", s)),
        }
    }
}

/// A single piece of content, published or planned, trackable by URL slug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentDraft {
    pub id: String,
    pub project_id: String,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub primary_keyword: String,
    pub status: DraftStatus,
    pub role: Option<String>,
    pub strategy_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where a candidate draft entered the candidate set from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Unassigned,
    PriorPhase,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::PriorPhase => "prior_phase",
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provenance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unassigned" => Ok(Self::Unassigned),
            "prior_phase" => Ok(Self::PriorPhase),
            _ => Err(format!("Invalid provenance: {}", s)),
        }
    }
}

/// The triple summarizing search performance over a window.
///
/// Deltas reuse this shape with signed fields, so clicks and impressions
/// are `i64` rather than unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Aggregate {
    pub clicks: i64,
    pub impressions: i64,
    pub avg_position: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Manual,
    Scheduled,
    PhaseComplete,
}

impl SnapshotTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::PhaseComplete => "phase_complete",
        }
    }
}

impl std::fmt::Display for SnapshotTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "phase_complete" => Ok(Self::PhaseComplete),
            _ => Err(format!("Invalid snapshot trigger: {}", s)),
        }
    }
}

/// A point-in-time performance measurement of a strategy. Immutable;
/// ordered by `captured_at` within a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub strategy_id: String,
    pub phase_id: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub trigger: SnapshotTrigger,
    pub aggregate: Aggregate,
    /// `None` when no prior snapshot existed for the strategy.
    pub delta: Option<Aggregate>,
    pub insights: Option<String>,
}

/// One keyword row in a snapshot's per-draft drill-down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRow {
    pub keyword: String,
    pub position: f64,
    pub clicks: i64,
    pub impressions: i64,
}

/// Per-draft breakdown of one snapshot. Created in bulk with its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotContent {
    pub id: String,
    pub snapshot_id: String,
    pub draft_id: String,
    pub aggregate: Aggregate,
    pub top_keywords: Vec<KeywordRow>,
}

/// Tracking row for an externally-created workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: String,
    pub project_id: String,
    pub requested_by: String,
    /// Caller-supplied instance id on the durable runtime.
    pub external_task_id: String,
    pub provider: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The observed-metrics account integration configured for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchIntegration {
    pub project_id: String,
    pub provider: String,
    pub site_url: String,
}
