//! Relational store for strategies, phases, drafts, snapshots, and task runs.
//!
//! Every operation returns an explicit `Result` so the workflow layer can
//! classify outcomes uniformly; nothing in here panics on bad data. Bulk
//! writes that must be all-or-nothing (snapshot + its per-draft rows, a
//! chunk of task runs) run inside one transaction.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::*;

/// Async-safe handle to the store.
///
/// Wraps [`Store`] behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Store task panicked")?
    }

    /// Acquire the store mutex synchronously. For startup seeding and tests;
    /// not for hot async paths.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))
    }
}

pub struct Store {
    conn: Connection,
}

fn conversion_err(message: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.to_string(),
        )),
    )
}

fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(conversion_err)
}

fn parse_ts_opt(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}

fn parse_tag<T>(raw: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    T::from_str(&raw).map_err(conversion_err)
}

fn parse_json(raw: String) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(&raw).map_err(conversion_err)
}

impl Store {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    organization_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    base_url TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS search_integrations (
                    project_id TEXT PRIMARY KEY REFERENCES projects(id) ON DELETE CASCADE,
                    provider TEXT NOT NULL,
                    site_url TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS strategies (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    organization_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    motivation TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    goal TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS phases (
                    id TEXT PRIMARY KEY,
                    strategy_id TEXT NOT NULL REFERENCES strategies(id) ON DELETE CASCADE,
                    phase_type TEXT NOT NULL,
                    name TEXT NOT NULL,
                    observation_weeks INTEGER NOT NULL,
                    success_criteria TEXT NOT NULL DEFAULT '',
                    cadence TEXT NOT NULL,
                    status TEXT NOT NULL,
                    started_at TEXT,
                    target_completion TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS content_drafts (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    slug TEXT NOT NULL,
                    title TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    primary_keyword TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL,
                    role TEXT,
                    strategy_id TEXT REFERENCES strategies(id),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS phase_contents (
                    id TEXT PRIMARY KEY,
                    phase_id TEXT NOT NULL REFERENCES phases(id) ON DELETE CASCADE,
                    draft_id TEXT NOT NULL REFERENCES content_drafts(id),
                    action TEXT NOT NULL,
                    planned_keyword TEXT NOT NULL DEFAULT '',
                    role TEXT,
                    notes TEXT,
                    planned_slug TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS snapshots (
                    id TEXT PRIMARY KEY,
                    strategy_id TEXT NOT NULL REFERENCES strategies(id) ON DELETE CASCADE,
                    phase_id TEXT REFERENCES phases(id),
                    captured_at TEXT NOT NULL,
                    trigger TEXT NOT NULL,
                    clicks INTEGER NOT NULL,
                    impressions INTEGER NOT NULL,
                    avg_position REAL NOT NULL,
                    delta_clicks INTEGER,
                    delta_impressions INTEGER,
                    delta_avg_position REAL,
                    insights TEXT
                );

                CREATE TABLE IF NOT EXISTS snapshot_contents (
                    id TEXT PRIMARY KEY,
                    snapshot_id TEXT NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
                    draft_id TEXT NOT NULL REFERENCES content_drafts(id),
                    clicks INTEGER NOT NULL,
                    impressions INTEGER NOT NULL,
                    avg_position REAL NOT NULL,
                    top_keywords TEXT NOT NULL DEFAULT '[]'
                );

                CREATE TABLE IF NOT EXISTS task_runs (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    requested_by TEXT NOT NULL,
                    external_task_id TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS strategy_locks (
                    strategy_id TEXT PRIMARY KEY REFERENCES strategies(id) ON DELETE CASCADE,
                    holder TEXT NOT NULL,
                    acquired_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_strategies_project ON strategies(project_id);
                CREATE INDEX IF NOT EXISTS idx_phases_strategy ON phases(strategy_id);
                CREATE INDEX IF NOT EXISTS idx_phase_contents_phase ON phase_contents(phase_id);
                CREATE INDEX IF NOT EXISTS idx_phase_contents_draft ON phase_contents(draft_id);
                CREATE INDEX IF NOT EXISTS idx_drafts_project ON content_drafts(project_id);
                CREATE INDEX IF NOT EXISTS idx_snapshots_strategy ON snapshots(strategy_id);
                CREATE INDEX IF NOT EXISTS idx_snapshot_contents_snapshot
                    ON snapshot_contents(snapshot_id);
                CREATE INDEX IF NOT EXISTS idx_task_runs_project ON task_runs(project_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Run several writes as one transaction. An error from the closure
    /// rolls everything back.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let result = f(self)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(result)
    }

    // ---- projects & integrations ----

    pub fn insert_project(&self, project: &Project) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO projects (id, organization_id, name, base_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    project.id,
                    project.organization_id,
                    project.name,
                    project.base_url,
                    project.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert project")?;
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, organization_id, name, base_url, created_at
                 FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        organization_id: row.get(1)?,
                        name: row.get(2)?,
                        base_url: row.get(3)?,
                        created_at: parse_ts(row.get(4)?)?,
                    })
                },
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn set_search_integration(&self, integration: &SearchIntegration) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO search_integrations (project_id, provider, site_url)
                 VALUES (?1, ?2, ?3)",
                params![
                    integration.project_id,
                    integration.provider,
                    integration.site_url,
                ],
            )
            .context("Failed to set search integration")?;
        Ok(())
    }

    pub fn get_search_integration(&self, project_id: &str) -> Result<Option<SearchIntegration>> {
        self.conn
            .query_row(
                "SELECT project_id, provider, site_url
                 FROM search_integrations WHERE project_id = ?1",
                params![project_id],
                |row| {
                    Ok(SearchIntegration {
                        project_id: row.get(0)?,
                        provider: row.get(1)?,
                        site_url: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to query search integration")
    }

    // ---- strategies ----

    pub fn insert_strategy(&self, strategy: &Strategy) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO strategies
                 (id, project_id, organization_id, name, motivation, description, goal, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    strategy.id,
                    strategy.project_id,
                    strategy.organization_id,
                    strategy.name,
                    strategy.motivation,
                    strategy.description,
                    strategy.goal,
                    strategy.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert strategy")?;
        Ok(())
    }

    pub fn get_strategy(&self, id: &str) -> Result<Option<Strategy>> {
        self.conn
            .query_row(
                "SELECT id, project_id, organization_id, name, motivation, description, goal,
                        created_at
                 FROM strategies WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Strategy {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        organization_id: row.get(2)?,
                        name: row.get(3)?,
                        motivation: row.get(4)?,
                        description: row.get(5)?,
                        goal: row.get(6)?,
                        created_at: parse_ts(row.get(7)?)?,
                    })
                },
            )
            .optional()
            .context("Failed to query strategy")
    }

    // ---- phases ----

    fn phase_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Phase> {
        Ok(Phase {
            id: row.get(0)?,
            strategy_id: row.get(1)?,
            phase_type: row.get(2)?,
            name: row.get(3)?,
            observation_weeks: row.get(4)?,
            success_criteria: row.get(5)?,
            cadence: parse_tag(row.get(6)?)?,
            status: parse_tag(row.get(7)?)?,
            started_at: parse_ts_opt(row.get(8)?)?,
            target_completion: parse_ts_opt(row.get(9)?)?,
            created_at: parse_ts(row.get(10)?)?,
        })
    }

    pub fn insert_phase(&self, phase: &Phase) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO phases
                 (id, strategy_id, phase_type, name, observation_weeks, success_criteria,
                  cadence, status, started_at, target_completion, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    phase.id,
                    phase.strategy_id,
                    phase.phase_type,
                    phase.name,
                    phase.observation_weeks,
                    phase.success_criteria,
                    phase.cadence.as_str(),
                    phase.status.as_str(),
                    phase.started_at.map(|t| t.to_rfc3339()),
                    phase.target_completion.map(|t| t.to_rfc3339()),
                    phase.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert phase")?;
        Ok(())
    }

    pub fn get_phase(&self, id: &str) -> Result<Option<Phase>> {
        self.conn
            .query_row(
                "SELECT id, strategy_id, phase_type, name, observation_weeks, success_criteria,
                        cadence, status, started_at, target_completion, created_at
                 FROM phases WHERE id = ?1",
                params![id],
                Self::phase_from_row,
            )
            .optional()
            .context("Failed to query phase")
    }

    /// Phases of one strategy, oldest to newest.
    pub fn list_phases(&self, strategy_id: &str) -> Result<Vec<Phase>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, strategy_id, phase_type, name, observation_weeks, success_criteria,
                    cadence, status, started_at, target_completion, created_at
             FROM phases WHERE strategy_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let phases = stmt
            .query_map(params![strategy_id], Self::phase_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list phases")?;
        Ok(phases)
    }

    pub fn count_phases(&self, strategy_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM phases WHERE strategy_id = ?1",
                params![strategy_id],
                |row| row.get(0),
            )
            .context("Failed to count phases")
    }

    pub fn insert_phase_content(&self, content: &PhaseContent) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO phase_contents
                 (id, phase_id, draft_id, action, planned_keyword, role, notes, planned_slug,
                  created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    content.id,
                    content.phase_id,
                    content.draft_id,
                    content.action.as_str(),
                    content.planned_keyword,
                    content.role,
                    content.notes,
                    content.planned_slug,
                    content.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert phase content")?;
        Ok(())
    }

    /// Content decisions of one phase, in decision order.
    pub fn list_phase_contents(&self, phase_id: &str) -> Result<Vec<PhaseContent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, phase_id, draft_id, action, planned_keyword, role, notes, planned_slug,
                    created_at
             FROM phase_contents WHERE phase_id = ?1 ORDER BY rowid ASC",
        )?;
        let contents = stmt
            .query_map(params![phase_id], |row| {
                Ok(PhaseContent {
                    id: row.get(0)?,
                    phase_id: row.get(1)?,
                    draft_id: row.get(2)?,
                    action: parse_tag(row.get(3)?)?,
                    planned_keyword: row.get(4)?,
                    role: row.get(5)?,
                    notes: row.get(6)?,
                    planned_slug: row.get(7)?,
                    created_at: parse_ts(row.get(8)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list phase contents")?;
        Ok(contents)
    }

    pub fn count_phase_contents(&self, phase_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM phase_contents WHERE phase_id = ?1",
                params![phase_id],
                |row| row.get(0),
            )
            .context("Failed to count phase contents")
    }

    // ---- content drafts ----

    fn draft_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContentDraft> {
        Ok(ContentDraft {
            id: row.get(0)?,
            project_id: row.get(1)?,
            slug: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            primary_keyword: row.get(5)?,
            status: parse_tag(row.get(6)?)?,
            role: row.get(7)?,
            strategy_id: row.get(8)?,
            created_at: parse_ts(row.get(9)?)?,
            updated_at: parse_ts(row.get(10)?)?,
        })
    }

    const DRAFT_COLUMNS: &'static str = "id, project_id, slug, title, description, \
         primary_keyword, status, role, strategy_id, created_at, updated_at";

    pub fn insert_draft(&self, draft: &ContentDraft) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO content_drafts
                 (id, project_id, slug, title, description, primary_keyword, status, role,
                  strategy_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    draft.id,
                    draft.project_id,
                    draft.slug,
                    draft.title,
                    draft.description,
                    draft.primary_keyword,
                    draft.status.as_str(),
                    draft.role,
                    draft.strategy_id,
                    draft.created_at.to_rfc3339(),
                    draft.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert content draft")?;
        Ok(())
    }

    pub fn get_draft(&self, id: &str) -> Result<Option<ContentDraft>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM content_drafts WHERE id = ?1",
                    Self::DRAFT_COLUMNS
                ),
                params![id],
                Self::draft_from_row,
            )
            .optional()
            .context("Failed to query content draft")
    }

    /// Apply an update decision's field overwrites. `None` fields keep their
    /// current value.
    pub fn update_draft_fields(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        primary_keyword: Option<&str>,
        role: Option<&str>,
    ) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE content_drafts SET
                     title = COALESCE(?2, title),
                     description = COALESCE(?3, description),
                     primary_keyword = COALESCE(?4, primary_keyword),
                     role = COALESCE(?5, role),
                     updated_at = ?6
                 WHERE id = ?1",
                params![
                    id,
                    title,
                    description,
                    primary_keyword,
                    role,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to update content draft")?;
        if updated == 0 {
            anyhow::bail!("Content draft {} not found", id);
        }
        Ok(())
    }

    /// Drafts of a project not referenced by any phase.
    pub fn list_unassigned_drafts(&self, project_id: &str) -> Result<Vec<ContentDraft>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM content_drafts
             WHERE project_id = ?1
               AND id NOT IN (SELECT draft_id FROM phase_contents)
             ORDER BY created_at ASC, rowid ASC",
            Self::DRAFT_COLUMNS
        ))?;
        let drafts = stmt
            .query_map(params![project_id], Self::draft_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list unassigned drafts")?;
        Ok(drafts)
    }

    /// Drafts attached to one phase, in attachment order.
    pub fn list_drafts_for_phase(&self, phase_id: &str) -> Result<Vec<ContentDraft>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM content_drafts d
             JOIN phase_contents pc ON pc.draft_id = d.id
             WHERE pc.phase_id = ?1
             ORDER BY pc.rowid ASC",
            "d.id, d.project_id, d.slug, d.title, d.description, d.primary_keyword, \
             d.status, d.role, d.strategy_id, d.created_at, d.updated_at"
        ))?;
        let drafts = stmt
            .query_map(params![phase_id], Self::draft_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list drafts for phase")?;
        Ok(drafts)
    }

    /// Distinct drafts attached to any phase of the strategy.
    pub fn list_drafts_for_strategy(&self, strategy_id: &str) -> Result<Vec<ContentDraft>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT d.id, d.project_id, d.slug, d.title, d.description,
                    d.primary_keyword, d.status, d.role, d.strategy_id, d.created_at, d.updated_at
             FROM content_drafts d
             JOIN phase_contents pc ON pc.draft_id = d.id
             JOIN phases p ON p.id = pc.phase_id
             WHERE p.strategy_id = ?1
             ORDER BY d.created_at ASC, d.rowid ASC",
        )?;
        let drafts = stmt
            .query_map(params![strategy_id], Self::draft_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list drafts for strategy")?;
        Ok(drafts)
    }

    // ---- snapshots ----

    fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snapshot> {
        let delta_clicks: Option<i64> = row.get(8)?;
        let delta = match delta_clicks {
            Some(clicks) => Some(Aggregate {
                clicks,
                impressions: row.get(9)?,
                avg_position: row.get(10)?,
            }),
            None => None,
        };
        Ok(Snapshot {
            id: row.get(0)?,
            strategy_id: row.get(1)?,
            phase_id: row.get(2)?,
            captured_at: parse_ts(row.get(3)?)?,
            trigger: parse_tag(row.get(4)?)?,
            aggregate: Aggregate {
                clicks: row.get(5)?,
                impressions: row.get(6)?,
                avg_position: row.get(7)?,
            },
            delta,
            insights: row.get(11)?,
        })
    }

    /// Insert a snapshot and its per-draft rows as one transaction. Either
    /// everything commits or nothing does.
    pub fn insert_snapshot_with_contents(
        &self,
        snapshot: &Snapshot,
        contents: &[SnapshotContent],
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin snapshot transaction")?;
        tx.execute(
            "INSERT INTO snapshots
             (id, strategy_id, phase_id, captured_at, trigger, clicks, impressions, avg_position,
              delta_clicks, delta_impressions, delta_avg_position, insights)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                snapshot.id,
                snapshot.strategy_id,
                snapshot.phase_id,
                snapshot.captured_at.to_rfc3339(),
                snapshot.trigger.as_str(),
                snapshot.aggregate.clicks,
                snapshot.aggregate.impressions,
                snapshot.aggregate.avg_position,
                snapshot.delta.map(|d| d.clicks),
                snapshot.delta.map(|d| d.impressions),
                snapshot.delta.map(|d| d.avg_position),
                snapshot.insights,
            ],
        )
        .context("Failed to insert snapshot")?;
        for content in contents {
            let top_keywords = serde_json::to_string(&content.top_keywords)
                .context("Failed to serialize top keywords")?;
            tx.execute(
                "INSERT INTO snapshot_contents
                 (id, snapshot_id, draft_id, clicks, impressions, avg_position, top_keywords)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    content.id,
                    content.snapshot_id,
                    content.draft_id,
                    content.aggregate.clicks,
                    content.aggregate.impressions,
                    content.aggregate.avg_position,
                    top_keywords,
                ],
            )
            .context("Failed to insert snapshot content")?;
        }
        tx.commit().context("Failed to commit snapshot transaction")
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        self.conn
            .query_row(
                "SELECT id, strategy_id, phase_id, captured_at, trigger, clicks, impressions,
                        avg_position, delta_clicks, delta_impressions, delta_avg_position, insights
                 FROM snapshots WHERE id = ?1",
                params![id],
                Self::snapshot_from_row,
            )
            .optional()
            .context("Failed to query snapshot")
    }

    /// The strategy's most recent snapshot by capture time.
    pub fn latest_snapshot(&self, strategy_id: &str) -> Result<Option<Snapshot>> {
        self.conn
            .query_row(
                "SELECT id, strategy_id, phase_id, captured_at, trigger, clicks, impressions,
                        avg_position, delta_clicks, delta_impressions, delta_avg_position, insights
                 FROM snapshots WHERE strategy_id = ?1
                 ORDER BY captured_at DESC, rowid DESC LIMIT 1",
                params![strategy_id],
                Self::snapshot_from_row,
            )
            .optional()
            .context("Failed to query latest snapshot")
    }

    pub fn list_snapshot_contents(&self, snapshot_id: &str) -> Result<Vec<SnapshotContent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, snapshot_id, draft_id, clicks, impressions, avg_position, top_keywords
             FROM snapshot_contents WHERE snapshot_id = ?1 ORDER BY rowid ASC",
        )?;
        let contents = stmt
            .query_map(params![snapshot_id], |row| {
                let top_keywords_raw: String = row.get(6)?;
                let top_keywords: Vec<KeywordRow> = serde_json::from_str(&top_keywords_raw)
                    .map_err(conversion_err)?;
                Ok(SnapshotContent {
                    id: row.get(0)?,
                    snapshot_id: row.get(1)?,
                    draft_id: row.get(2)?,
                    aggregate: Aggregate {
                        clicks: row.get(3)?,
                        impressions: row.get(4)?,
                        avg_position: row.get(5)?,
                    },
                    top_keywords,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list snapshot contents")?;
        Ok(contents)
    }

    // ---- task runs ----

    /// Insert one chunk of task-run tracking rows as a single transaction.
    /// A chunk either fully commits or leaves no rows behind.
    pub fn insert_task_runs(&self, runs: &[TaskRun]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin task-run transaction")?;
        for run in runs {
            let payload =
                serde_json::to_string(&run.payload).context("Failed to serialize payload")?;
            tx.execute(
                "INSERT INTO task_runs
                 (id, project_id, requested_by, external_task_id, provider, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.id,
                    run.project_id,
                    run.requested_by,
                    run.external_task_id,
                    run.provider,
                    payload,
                    run.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert task run")?;
        }
        tx.commit().context("Failed to commit task-run transaction")
    }

    pub fn list_task_runs(&self, project_id: &str) -> Result<Vec<TaskRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, requested_by, external_task_id, provider, payload, created_at
             FROM task_runs WHERE project_id = ?1 ORDER BY rowid ASC",
        )?;
        let runs = stmt
            .query_map(params![project_id], |row| {
                Ok(TaskRun {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    requested_by: row.get(2)?,
                    external_task_id: row.get(3)?,
                    provider: row.get(4)?,
                    payload: parse_json(row.get(5)?)?,
                    created_at: parse_ts(row.get(6)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list task runs")?;
        Ok(runs)
    }

    // ---- strategy locks ----

    /// Acquire the per-strategy advisory lock. Returns false when another
    /// holder already owns it.
    pub fn try_lock_strategy(&self, strategy_id: &str, holder: &str) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO strategy_locks (strategy_id, holder, acquired_at)
                 VALUES (?1, ?2, ?3)",
                params![strategy_id, holder, Utc::now().to_rfc3339()],
            )
            .context("Failed to acquire strategy lock")?;
        Ok(inserted == 1)
    }

    pub fn unlock_strategy(&self, strategy_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM strategy_locks WHERE strategy_id = ?1",
                params![strategy_id],
            )
            .context("Failed to release strategy lock")?;
        Ok(())
    }
}
