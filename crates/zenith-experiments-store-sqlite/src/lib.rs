#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use ulid::Ulid;
use zenith_experiments_core::{
    detect_winner, days_running, format_rfc3339, funnel, lift_percent, now_utc, parse_rfc3339_utc,
    pick_variant, progress_percent, sample_size, Allocation, AllocationId, Experiment,
    ExperimentDefinition, ExperimentError, ExperimentEvent, ExperimentId, ExperimentStatus,
    ExperimentType, ExperimentVariant, FunnelStage, SampleSizeAnalysis, SignificanceTest, Subject,
    VariantCounts, VariantId, WinnerAnalysis, BASELINE_CONVERSION_RATE, MAX_BATCH_EVENTS,
};

const SCHEMA_VERSION: i64 = 1;
const RECENT_EVENTS_LIMIT: usize = 50;
const DEFAULT_PAGE_LIMIT: u64 = 20;
const MAX_PAGE_LIMIT: u64 = 100;

const SCHEMA_EXPERIMENTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS experiments (
  experiment_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  status TEXT NOT NULL CHECK (
    status IN ('draft', 'running', 'paused', 'completed', 'archived')
  ),
  experiment_type TEXT NOT NULL CHECK (experiment_type IN ('ab_test', 'multivariate')),
  primary_metric TEXT NOT NULL,
  traffic_split_json TEXT NOT NULL,
  confidence_level REAL NOT NULL CHECK (confidence_level BETWEEN 0.8 AND 0.99),
  minimum_detectable_effect REAL NOT NULL CHECK (minimum_detectable_effect BETWEEN 0.01 AND 1.0),
  statistical_power REAL NOT NULL CHECK (statistical_power BETWEEN 0.7 AND 0.99),
  minimum_sample_size INTEGER NOT NULL CHECK (minimum_sample_size >= 100),
  minimum_runtime_days INTEGER NOT NULL CHECK (minimum_runtime_days BETWEEN 7 AND 365),
  max_runtime_days INTEGER NOT NULL CHECK (max_runtime_days >= minimum_runtime_days),
  targeting_rules_json TEXT NOT NULL DEFAULT '{}',
  created_by TEXT NOT NULL,
  winning_variant TEXT,
  created_at TEXT NOT NULL,
  started_at TEXT,
  completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_experiments_owner
  ON experiments(created_by, status, created_at DESC);

CREATE TABLE IF NOT EXISTS experiment_variants (
  variant_id TEXT PRIMARY KEY,
  experiment_id TEXT NOT NULL REFERENCES experiments(experiment_id),
  name TEXT NOT NULL,
  is_control INTEGER NOT NULL CHECK (is_control IN (0, 1)),
  configuration_json TEXT NOT NULL DEFAULT '{}',
  feature_flags_json TEXT NOT NULL DEFAULT '{}',
  traffic_weight REAL NOT NULL CHECK (traffic_weight BETWEEN 0.0 AND 1.0),
  participants INTEGER NOT NULL DEFAULT 0 CHECK (participants >= 0),
  conversions INTEGER NOT NULL DEFAULT 0 CHECK (conversions >= 0),
  conversion_rate REAL NOT NULL DEFAULT 0.0,
  UNIQUE(experiment_id, name)
);

CREATE TABLE IF NOT EXISTS experiment_allocations (
  allocation_id TEXT PRIMARY KEY,
  experiment_id TEXT NOT NULL REFERENCES experiments(experiment_id),
  variant_id TEXT NOT NULL REFERENCES experiment_variants(variant_id),
  subject_key TEXT NOT NULL,
  user_id TEXT,
  session_id TEXT,
  first_exposure TEXT NOT NULL,
  last_exposure TEXT NOT NULL,
  exposure_count INTEGER NOT NULL DEFAULT 1 CHECK (exposure_count >= 1),
  UNIQUE(experiment_id, subject_key)
);

CREATE INDEX IF NOT EXISTS idx_allocations_subject
  ON experiment_allocations(subject_key);
CREATE INDEX IF NOT EXISTS idx_allocations_user
  ON experiment_allocations(user_id);
CREATE INDEX IF NOT EXISTS idx_allocations_session
  ON experiment_allocations(session_id);

CREATE TABLE IF NOT EXISTS experiment_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  experiment_id TEXT NOT NULL REFERENCES experiments(experiment_id),
  variant_id TEXT NOT NULL,
  allocation_id TEXT NOT NULL,
  event_type TEXT NOT NULL,
  event_value REAL,
  event_data_json TEXT NOT NULL DEFAULT '{}',
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_experiment_events_no_update
BEFORE UPDATE ON experiment_events
BEGIN
  SELECT RAISE(FAIL, 'experiment_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_experiment_events_no_delete
BEFORE DELETE ON experiment_events
BEGIN
  SELECT RAISE(FAIL, 'experiment_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_events_experiment_seq
  ON experiment_events(experiment_id, event_seq);
CREATE INDEX IF NOT EXISTS idx_events_type_seq
  ON experiment_events(experiment_id, event_type, event_seq);
";

pub struct SqliteExperimentStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct CreateExperimentResult {
    pub experiment: Experiment,
    pub variants: Vec<ExperimentVariant>,
    pub sample_size_analysis: SampleSizeAnalysis,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ExperimentOverview {
    pub experiment: Experiment,
    pub variants: Vec<ExperimentVariant>,
    pub total_participants: u64,
    pub primary_metric_lift: f64,
    pub days_running: Option<u32>,
    pub progress_percent: f64,
    pub winning_variant: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ExperimentPage {
    pub experiments: Vec<ExperimentOverview>,
    pub page: u64,
    pub limit: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ExperimentFilter {
    pub status: Option<ExperimentStatus>,
    pub experiment_type: Option<ExperimentType>,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct AllocationOutcome {
    pub allocation: Allocation,
    pub variant: ExperimentVariant,
    pub newly_allocated: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct TrackEventInput {
    pub experiment_id: ExperimentId,
    #[serde(default)]
    pub allocation_id: Option<AllocationId>,
    #[serde(default)]
    pub subject: Subject,
    pub event_type: String,
    #[serde(default)]
    pub event_value: Option<f64>,
    #[serde(default = "default_event_data")]
    pub event_data: Value,
}

fn default_event_data() -> Value {
    Value::Object(serde_json::Map::default())
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct BatchTrackReport {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct VariantStatistics {
    pub name: String,
    pub is_control: bool,
    pub participants: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    pub events_in_window: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EventStatistics {
    pub experiment_id: ExperimentId,
    pub total_events: u64,
    pub counts_by_type: BTreeMap<String, u64>,
    pub variant_stats: Vec<VariantStatistics>,
    pub funnel: Vec<FunnelStage>,
    pub recent_events: Vec<ExperimentEvent>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub migrated: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventWindow {
    pub event_type: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

impl SqliteExperimentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_EXPERIMENTS_V1)
            .context("failed to apply experiment schema")?;

        let now = format_timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now],
            )
            .context("failed to register experiment schema migration")?;

        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let current_version = self
            .conn
            .query_row(
                "SELECT MAX(version) FROM schema_migrations",
                [],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .context("failed to query schema_migrations")?
            .flatten()
            .unwrap_or(0);

        Ok(SchemaStatus {
            current_version,
            target_version: SCHEMA_VERSION,
            migrated: current_version >= SCHEMA_VERSION,
        })
    }

    // -----------------------------------------------------------------------
    // Experiment service
    // -----------------------------------------------------------------------

    /// Validates and persists an experiment with its variants. The stored
    /// per-variant minimum sample size is the larger of the requested value
    /// and a power calculation over a fixed 10% baseline conversion rate.
    pub fn create_experiment(
        &mut self,
        definition: &ExperimentDefinition,
    ) -> Result<CreateExperimentResult> {
        definition.validate().map_err(anyhow::Error::new)?;

        let analysis = sample_size(
            BASELINE_CONVERSION_RATE,
            definition.minimum_detectable_effect,
            1.0 - definition.confidence_level,
            definition.statistical_power,
        )
        .map_err(anyhow::Error::new)?;

        let minimum_sample_size = definition
            .minimum_sample_size
            .max(analysis.minimum_sample_size_per_variant);

        let experiment_id = ExperimentId(Ulid::new());
        let created_at = now_utc();
        let control_index = definition.control_index();

        let tx = self
            .conn
            .transaction()
            .context("failed to start create transaction")?;

        tx.execute(
            "INSERT INTO experiments(
                experiment_id, name, status, experiment_type, primary_metric,
                traffic_split_json, confidence_level, minimum_detectable_effect,
                statistical_power, minimum_sample_size, minimum_runtime_days,
                max_runtime_days, targeting_rules_json, created_by,
                winning_variant, created_at, started_at, completed_at
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8,
                ?9, ?10, ?11,
                ?12, ?13, ?14,
                NULL, ?15, NULL, NULL
             )",
            params![
                experiment_id.to_string(),
                definition.name,
                ExperimentStatus::Draft.as_str(),
                definition.experiment_type.as_str(),
                definition.primary_metric,
                serde_json::to_string(&definition.traffic_split)
                    .context("failed to serialize traffic_split")?,
                definition.confidence_level,
                definition.minimum_detectable_effect,
                definition.statistical_power,
                to_i64(minimum_sample_size)?,
                i64::from(definition.minimum_runtime_days),
                i64::from(definition.max_runtime_days),
                serde_json::to_string(&definition.targeting_rules)
                    .context("failed to serialize targeting_rules")?,
                definition.created_by,
                format_timestamp(created_at)?,
            ],
        )
        .context("failed to insert experiment")?;

        let mut variants = Vec::with_capacity(definition.variants.len());
        for (index, variant) in definition.variants.iter().enumerate() {
            let variant_id = VariantId(Ulid::new());
            let is_control = index == control_index;
            let traffic_weight = definition
                .traffic_split
                .get(&variant.name)
                .copied()
                .unwrap_or(0.0);

            tx.execute(
                "INSERT INTO experiment_variants(
                    variant_id, experiment_id, name, is_control,
                    configuration_json, feature_flags_json, traffic_weight,
                    participants, conversions, conversion_rate
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, 0.0)",
                params![
                    variant_id.to_string(),
                    experiment_id.to_string(),
                    variant.name,
                    i64::from(is_control),
                    serde_json::to_string(&variant.configuration)
                        .context("failed to serialize variant configuration")?,
                    serde_json::to_string(&variant.feature_flags)
                        .context("failed to serialize variant feature flags")?,
                    traffic_weight,
                ],
            )
            .context("failed to insert experiment variant")?;

            variants.push(ExperimentVariant {
                variant_id,
                experiment_id,
                name: variant.name.clone(),
                is_control,
                configuration: variant.configuration.clone(),
                feature_flags: variant.feature_flags.clone(),
                traffic_weight,
                participants: 0,
                conversions: 0,
                conversion_rate: 0.0,
            });
        }

        tx.commit().context("failed to commit create transaction")?;

        Ok(CreateExperimentResult {
            experiment: Experiment {
                experiment_id,
                name: definition.name.clone(),
                status: ExperimentStatus::Draft,
                experiment_type: definition.experiment_type,
                primary_metric: definition.primary_metric.clone(),
                traffic_split: definition.traffic_split.clone(),
                confidence_level: definition.confidence_level,
                minimum_detectable_effect: definition.minimum_detectable_effect,
                statistical_power: definition.statistical_power,
                minimum_sample_size,
                minimum_runtime_days: definition.minimum_runtime_days,
                max_runtime_days: definition.max_runtime_days,
                targeting_rules: definition.targeting_rules.clone(),
                created_by: definition.created_by.clone(),
                winning_variant: None,
                created_at,
                started_at: None,
                completed_at: None,
            },
            variants,
            sample_size_analysis: analysis,
        })
    }

    pub fn get_experiment(&self, experiment_id: ExperimentId) -> Result<Experiment> {
        let mut stmt = self.conn.prepare(
            "SELECT
                experiment_id, name, status, experiment_type, primary_metric,
                traffic_split_json, confidence_level, minimum_detectable_effect,
                statistical_power, minimum_sample_size, minimum_runtime_days,
                max_runtime_days, targeting_rules_json, created_by,
                winning_variant, created_at, started_at, completed_at
             FROM experiments
             WHERE experiment_id = ?1",
        )?;

        stmt.query_row(params![experiment_id.to_string()], parse_experiment_row)
            .optional()?
            .ok_or_else(|| {
                anyhow::Error::new(ExperimentError::NotFound(format!(
                    "experiment {experiment_id}"
                )))
            })
    }

    pub fn list_variants(&self, experiment_id: ExperimentId) -> Result<Vec<ExperimentVariant>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                variant_id, experiment_id, name, is_control, configuration_json,
                feature_flags_json, traffic_weight, participants, conversions,
                conversion_rate
             FROM experiment_variants
             WHERE experiment_id = ?1
             ORDER BY is_control DESC, name ASC",
        )?;

        let rows = stmt.query_map(params![experiment_id.to_string()], parse_variant_row)?;
        collect_rows(rows)
    }

    /// Paginated experiment overviews for an owner, with the derived
    /// reporting fields the dashboard needs.
    pub fn list_experiments(
        &self,
        owner: &str,
        filter: &ExperimentFilter,
    ) -> Result<ExperimentPage> {
        let page = filter.page.unwrap_or(1).max(1);
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);
        let offset = (page - 1).saturating_mul(limit);

        let status_filter = filter.status.map(ExperimentStatus::as_str);
        let type_filter = filter.experiment_type.map(ExperimentType::as_str);

        let total: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM experiments
             WHERE created_by = ?1
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR experiment_type = ?3)",
            params![owner, status_filter, type_filter],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT
                experiment_id, name, status, experiment_type, primary_metric,
                traffic_split_json, confidence_level, minimum_detectable_effect,
                statistical_power, minimum_sample_size, minimum_runtime_days,
                max_runtime_days, targeting_rules_json, created_by,
                winning_variant, created_at, started_at, completed_at
             FROM experiments
             WHERE created_by = ?1
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR experiment_type = ?3)
             ORDER BY created_at DESC, experiment_id DESC
             LIMIT ?4 OFFSET ?5",
        )?;

        let rows = stmt.query_map(
            params![
                owner,
                status_filter,
                type_filter,
                to_i64(limit)?,
                to_i64(offset)?
            ],
            parse_experiment_row,
        )?;
        let experiments = collect_rows(rows)?;

        let now = now_utc();
        let mut overviews = Vec::with_capacity(experiments.len());
        for experiment in experiments {
            overviews.push(self.overview(experiment, now)?);
        }

        Ok(ExperimentPage {
            experiments: overviews,
            page,
            limit,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    fn overview(
        &self,
        experiment: Experiment,
        now: time::OffsetDateTime,
    ) -> Result<ExperimentOverview> {
        let variants = self.list_variants(experiment.experiment_id)?;
        let total_participants: u64 = variants.iter().map(|v| v.participants).sum();

        let control_rate = variants
            .iter()
            .find(|v| v.is_control)
            .map_or(0.0, |v| v.conversion_rate);
        let primary_metric_lift = variants
            .iter()
            .filter(|v| !v.is_control)
            .map(|v| lift_percent(control_rate, v.conversion_rate))
            .fold(0.0_f64, f64::max);

        let winning_variant = match (&experiment.winning_variant, experiment.status) {
            (Some(name), _) => Some(name.clone()),
            (None, ExperimentStatus::Completed) => self
                .winner_analysis(&experiment, &variants)?
                .winner
                .map(|w| w.variant_name),
            (None, _) => None,
        };

        Ok(ExperimentOverview {
            days_running: days_running(experiment.status, experiment.started_at, now),
            progress_percent: progress_percent(total_participants, experiment.minimum_sample_size),
            total_participants,
            primary_metric_lift,
            winning_variant,
            experiment,
            variants,
        })
    }

    fn winner_analysis(
        &self,
        experiment: &Experiment,
        variants: &[ExperimentVariant],
    ) -> Result<WinnerAnalysis> {
        let counts: Vec<VariantCounts> = variants
            .iter()
            .map(|v| VariantCounts {
                name: v.name.clone(),
                is_control: v.is_control,
                participants: v.participants,
                conversions: v.conversions,
            })
            .collect();

        detect_winner(
            &counts,
            experiment.confidence_level,
            experiment.minimum_sample_size,
            SignificanceTest::default(),
        )
        .map_err(anyhow::Error::new)
    }

    /// Explicit lifecycle transition. Completing an experiment stamps
    /// `completed_at` and persists the detected winner when there is one.
    pub fn set_status(
        &mut self,
        experiment_id: ExperimentId,
        next: ExperimentStatus,
    ) -> Result<Experiment> {
        let experiment = self.get_experiment(experiment_id)?;
        if !experiment.status.can_transition_to(next) {
            return Err(anyhow::Error::new(ExperimentError::Experiment(format!(
                "cannot transition experiment from {} to {}",
                experiment.status.as_str(),
                next.as_str()
            ))));
        }

        let now = now_utc();
        let now_text = format_timestamp(now)?;

        let winning_variant = if next == ExperimentStatus::Completed {
            let variants = self.list_variants(experiment_id)?;
            self.winner_analysis(&experiment, &variants)?
                .winner
                .map(|w| w.variant_name)
        } else {
            None
        };

        self.conn
            .execute(
                "UPDATE experiments SET
                    status = ?2,
                    started_at = CASE
                        WHEN ?2 = 'running' AND started_at IS NULL THEN ?3
                        ELSE started_at
                    END,
                    completed_at = CASE WHEN ?2 = 'completed' THEN ?3 ELSE completed_at END,
                    winning_variant = COALESCE(?4, winning_variant)
                 WHERE experiment_id = ?1",
                params![
                    experiment_id.to_string(),
                    next.as_str(),
                    now_text,
                    winning_variant,
                ],
            )
            .context("failed to update experiment status")?;

        self.get_experiment(experiment_id)
    }

    // -----------------------------------------------------------------------
    // Allocation engine
    // -----------------------------------------------------------------------

    /// Sticky, deterministic allocation. Read-or-create is a single
    /// conflict-aware INSERT against UNIQUE(experiment_id, subject_key);
    /// `participants` is bumped as an atomic SQL increment only when the
    /// row was actually created.
    pub fn allocate(
        &mut self,
        experiment_id: ExperimentId,
        subject: &Subject,
        force_variant: Option<&str>,
    ) -> Result<AllocationOutcome> {
        let experiment = self.get_experiment(experiment_id)?;
        if !experiment.status.is_allocatable() {
            return Err(anyhow::Error::new(ExperimentError::Experiment(format!(
                "experiment {experiment_id} is {} and not accepting allocations",
                experiment.status.as_str()
            ))));
        }

        let identity_key = subject
            .identity_key()
            .map_err(anyhow::Error::new)?
            .to_string();

        let variant_name = match force_variant {
            Some(name) => name.to_string(),
            None => pick_variant(experiment_id, &identity_key, &experiment.traffic_split)
                .map_err(anyhow::Error::new)?
                .to_string(),
        };

        let now = now_utc();
        let now_text = format_timestamp(now)?;
        let allocation_id = AllocationId(Ulid::new());

        let tx = self
            .conn
            .transaction()
            .context("failed to start allocation transaction")?;

        let variant_id: Option<String> = tx
            .query_row(
                "SELECT variant_id FROM experiment_variants
                 WHERE experiment_id = ?1 AND name = ?2",
                params![experiment_id.to_string(), variant_name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(variant_id) = variant_id else {
            return Err(anyhow::Error::new(ExperimentError::Allocation(format!(
                "variant {variant_name} does not belong to experiment {experiment_id}"
            ))));
        };

        let inserted = tx
            .execute(
                "INSERT INTO experiment_allocations(
                    allocation_id, experiment_id, variant_id, subject_key,
                    user_id, session_id, first_exposure, last_exposure, exposure_count
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1)
                 ON CONFLICT(experiment_id, subject_key) DO NOTHING",
                params![
                    allocation_id.to_string(),
                    experiment_id.to_string(),
                    variant_id,
                    identity_key,
                    subject.user_id,
                    subject.session_id,
                    now_text,
                ],
            )
            .context("failed to upsert allocation")?
            == 1;

        if inserted {
            tx.execute(
                "UPDATE experiment_variants SET
                    participants = participants + 1,
                    conversion_rate = CAST(conversions AS REAL) / (participants + 1)
                 WHERE variant_id = ?1",
                params![variant_id],
            )
            .context("failed to increment participants")?;

            if experiment.status == ExperimentStatus::Draft {
                // First exposure promotes a draft to running.
                tx.execute(
                    "UPDATE experiments SET status = 'running', started_at = ?2
                     WHERE experiment_id = ?1 AND status = 'draft'",
                    params![experiment_id.to_string(), now_text],
                )
                .context("failed to auto-start experiment")?;
            }
        } else {
            tx.execute(
                "UPDATE experiment_allocations SET
                    exposure_count = exposure_count + 1,
                    last_exposure = ?3
                 WHERE experiment_id = ?1 AND subject_key = ?2",
                params![experiment_id.to_string(), identity_key, now_text],
            )
            .context("failed to record repeat exposure")?;
        }

        let (allocation, variant) =
            fetch_allocation_with_variant(&tx, experiment_id, &identity_key)?.ok_or_else(
                || anyhow!("allocation row missing immediately after upsert"),
            )?;

        tx.commit().context("failed to commit allocation")?;

        Ok(AllocationOutcome {
            allocation,
            variant,
            newly_allocated: inserted,
        })
    }

    pub fn allocations_for_subject(&self, subject: &Subject) -> Result<Vec<Allocation>> {
        subject.identity_key().map_err(anyhow::Error::new)?;

        let mut stmt = self.conn.prepare(
            "SELECT
                a.allocation_id, a.experiment_id, a.variant_id, v.name,
                a.user_id, a.session_id, a.first_exposure, a.last_exposure,
                a.exposure_count
             FROM experiment_allocations a
             JOIN experiment_variants v ON v.variant_id = a.variant_id
             WHERE (?1 IS NOT NULL AND a.user_id = ?1)
                OR (?2 IS NOT NULL AND a.session_id = ?2)
             ORDER BY a.first_exposure ASC",
        )?;

        let rows = stmt.query_map(
            params![subject.user_id, subject.session_id],
            parse_allocation_row,
        )?;
        collect_rows(rows)
    }

    /// Removes a subject's binding. Only the subject itself or the
    /// experiment owner may do this.
    pub fn remove_allocation(
        &mut self,
        experiment_id: ExperimentId,
        subject: &Subject,
        actor: &str,
    ) -> Result<()> {
        let experiment = self.get_experiment(experiment_id)?;
        let identity_key = subject.identity_key().map_err(anyhow::Error::new)?;

        if experiment.created_by != actor && !subject.is_actor(actor) {
            return Err(anyhow::Error::new(ExperimentError::Forbidden(
                "only the subject or the experiment owner may remove an allocation".to_string(),
            )));
        }

        let removed = self
            .conn
            .execute(
                "DELETE FROM experiment_allocations
                 WHERE experiment_id = ?1 AND subject_key = ?2",
                params![experiment_id.to_string(), identity_key],
            )
            .context("failed to delete allocation")?;

        if removed == 0 {
            return Err(anyhow::Error::new(ExperimentError::NotFound(format!(
                "allocation for {identity_key} in experiment {experiment_id}"
            ))));
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event tracking
    // -----------------------------------------------------------------------

    /// Appends an event for a resolved allocation. Conversion events (the
    /// experiment's primary metric, or the literal `conversion` type) bump
    /// the variant's counter and rate in the same atomic statement.
    pub fn track_event(&mut self, input: &TrackEventInput) -> Result<ExperimentEvent> {
        if input.event_type.trim().is_empty() {
            return Err(anyhow::Error::new(ExperimentError::Experiment(
                "event_type MUST be provided".to_string(),
            )));
        }

        let experiment = self.get_experiment(input.experiment_id)?;
        let (allocation_id, variant_id) = self.resolve_allocation(input)?;

        let event_id = Ulid::new();
        let recorded_at = now_utc();
        let is_conversion =
            input.event_type == "conversion" || input.event_type == experiment.primary_metric;

        let tx = self
            .conn
            .transaction()
            .context("failed to start tracking transaction")?;

        tx.execute(
            "INSERT INTO experiment_events(
                event_id, experiment_id, variant_id, allocation_id,
                event_type, event_value, event_data_json, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event_id.to_string(),
                input.experiment_id.to_string(),
                variant_id.to_string(),
                allocation_id.to_string(),
                input.event_type,
                input.event_value,
                serde_json::to_string(&input.event_data)
                    .context("failed to serialize event_data")?,
                format_timestamp(recorded_at)?,
            ],
        )
        .context("failed to append experiment event")?;

        let event_seq = tx.last_insert_rowid();

        if is_conversion {
            tx.execute(
                "UPDATE experiment_variants SET
                    conversions = conversions + 1,
                    conversion_rate = CASE
                        WHEN participants = 0 THEN 0.0
                        ELSE CAST(conversions + 1 AS REAL) / participants
                    END
                 WHERE variant_id = ?1",
                params![variant_id.to_string()],
            )
            .context("failed to increment conversions")?;
        }

        tx.commit().context("failed to commit tracking transaction")?;

        Ok(ExperimentEvent {
            event_seq,
            event_id,
            experiment_id: input.experiment_id,
            variant_id,
            allocation_id,
            event_type: input.event_type.clone(),
            event_value: input.event_value,
            event_data: input.event_data.clone(),
            recorded_at,
        })
    }

    fn resolve_allocation(
        &self,
        input: &TrackEventInput,
    ) -> Result<(AllocationId, VariantId)> {
        if let Some(allocation_id) = input.allocation_id {
            let row: Option<(String, String)> = self
                .conn
                .query_row(
                    "SELECT allocation_id, variant_id FROM experiment_allocations
                     WHERE allocation_id = ?1 AND experiment_id = ?2",
                    params![allocation_id.to_string(), input.experiment_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            return match row {
                Some((allocation, variant)) => Ok((
                    AllocationId(parse_ulid_text(&allocation)?),
                    VariantId(parse_ulid_text(&variant)?),
                )),
                None => Err(anyhow::Error::new(ExperimentError::Experiment(format!(
                    "allocation {allocation_id} not found for experiment {}",
                    input.experiment_id
                )))),
            };
        }

        let identity_key = input.subject.identity_key().map_err(|_| {
            anyhow::Error::new(ExperimentError::Experiment(
                "event MUST reference an allocation_id or a subject identity".to_string(),
            ))
        })?;

        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT allocation_id, variant_id FROM experiment_allocations
                 WHERE experiment_id = ?1 AND subject_key = ?2",
                params![input.experiment_id.to_string(), identity_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((allocation, variant)) => Ok((
                AllocationId(parse_ulid_text(&allocation)?),
                VariantId(parse_ulid_text(&variant)?),
            )),
            None => Err(anyhow::Error::new(ExperimentError::Experiment(format!(
                "no allocation for {identity_key} in experiment {}",
                input.experiment_id
            )))),
        }
    }

    /// Processes each event independently; bad records fail individually
    /// instead of poisoning the batch.
    pub fn track_batch(&mut self, inputs: &[TrackEventInput]) -> Result<BatchTrackReport> {
        if inputs.len() > MAX_BATCH_EVENTS {
            return Err(anyhow::Error::new(ExperimentError::Configuration(format!(
                "batch MUST contain at most {MAX_BATCH_EVENTS} events (got {})",
                inputs.len()
            ))));
        }

        let mut successful = 0_usize;
        let mut errors = Vec::new();
        for (index, input) in inputs.iter().enumerate() {
            match self.track_event(input) {
                Ok(_) => successful += 1,
                Err(err) => errors.push(format!("event {index}: {err}")),
            }
        }

        Ok(BatchTrackReport {
            processed: inputs.len(),
            successful,
            failed: errors.len(),
            errors,
        })
    }

    /// Event counts, per-variant stats and the canonical funnel for a
    /// reporting window. The funnel always reads the full per-type counts;
    /// the `event_type` filter narrows only totals and recent events.
    pub fn event_statistics(
        &self,
        experiment_id: ExperimentId,
        window: &EventWindow,
    ) -> Result<EventStatistics> {
        self.get_experiment(experiment_id)?;

        let start = normalize_bound(window.start.as_deref())?;
        let end = normalize_bound(window.end.as_deref())?;

        let mut counts_by_type = BTreeMap::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT event_type, COUNT(*) FROM experiment_events
                 WHERE experiment_id = ?1
                   AND (?2 IS NULL OR recorded_at >= ?2)
                   AND (?3 IS NULL OR recorded_at <= ?3)
                 GROUP BY event_type",
            )?;
            let mut rows = stmt.query(params![experiment_id.to_string(), start, end])?;
            while let Some(row) = rows.next()? {
                let event_type: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                counts_by_type.insert(event_type, u64::try_from(count).unwrap_or(0));
            }
        }

        let total_events: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM experiment_events
             WHERE experiment_id = ?1
               AND (?2 IS NULL OR event_type = ?2)
               AND (?3 IS NULL OR recorded_at >= ?3)
               AND (?4 IS NULL OR recorded_at <= ?4)",
            params![
                experiment_id.to_string(),
                window.event_type,
                start,
                end
            ],
            |row| row.get(0),
        )?;

        let variant_stats = {
            let mut stmt = self.conn.prepare(
                "SELECT
                    v.name, v.is_control, v.participants, v.conversions,
                    v.conversion_rate,
                    (SELECT COUNT(*) FROM experiment_events e
                     WHERE e.variant_id = v.variant_id
                       AND (?2 IS NULL OR e.event_type = ?2)
                       AND (?3 IS NULL OR e.recorded_at >= ?3)
                       AND (?4 IS NULL OR e.recorded_at <= ?4))
                 FROM experiment_variants v
                 WHERE v.experiment_id = ?1
                 ORDER BY v.is_control DESC, v.name ASC",
            )?;
            let rows = stmt.query_map(
                params![experiment_id.to_string(), window.event_type, start, end],
                |row| {
                    Ok(VariantStatistics {
                        name: row.get(0)?,
                        is_control: row.get::<_, i64>(1)? == 1,
                        participants: u64::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
                        conversions: u64::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
                        conversion_rate: row.get(4)?,
                        events_in_window: u64::try_from(row.get::<_, i64>(5)?).unwrap_or(0),
                    })
                },
            )?;
            collect_rows(rows)?
        };

        let recent_events = {
            let mut stmt = self.conn.prepare(
                "SELECT
                    event_seq, event_id, experiment_id, variant_id, allocation_id,
                    event_type, event_value, event_data_json, recorded_at
                 FROM experiment_events
                 WHERE experiment_id = ?1
                   AND (?2 IS NULL OR event_type = ?2)
                   AND (?3 IS NULL OR recorded_at >= ?3)
                   AND (?4 IS NULL OR recorded_at <= ?4)
                 ORDER BY event_seq DESC
                 LIMIT ?5",
            )?;
            let rows = stmt.query_map(
                params![
                    experiment_id.to_string(),
                    window.event_type,
                    start,
                    end,
                    to_i64(RECENT_EVENTS_LIMIT as u64)?
                ],
                parse_event_row,
            )?;
            collect_rows(rows)?
        };

        Ok(EventStatistics {
            experiment_id,
            total_events: u64::try_from(total_events).unwrap_or(0),
            funnel: funnel(&counts_by_type),
            counts_by_type,
            variant_stats,
            recent_events,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn fetch_allocation_with_variant(
    conn: &Connection,
    experiment_id: ExperimentId,
    identity_key: &str,
) -> Result<Option<(Allocation, ExperimentVariant)>> {
    let mut stmt = conn.prepare(
        "SELECT
            a.allocation_id, a.experiment_id, a.variant_id, v.name,
            a.user_id, a.session_id, a.first_exposure, a.last_exposure,
            a.exposure_count,
            v.variant_id, v.experiment_id, v.name, v.is_control,
            v.configuration_json, v.feature_flags_json, v.traffic_weight,
            v.participants, v.conversions, v.conversion_rate
         FROM experiment_allocations a
         JOIN experiment_variants v ON v.variant_id = a.variant_id
         WHERE a.experiment_id = ?1 AND a.subject_key = ?2",
    )?;

    let row = stmt
        .query_row(params![experiment_id.to_string(), identity_key], |row| {
            let allocation = parse_allocation_row(row)?;
            let variant = parse_variant_row_at(row, 9)?;
            Ok((allocation, variant))
        })
        .optional()?;

    Ok(row)
}

fn parse_experiment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Experiment> {
    let experiment_id_raw: String = row.get(0)?;
    let status_raw: String = row.get(2)?;
    let type_raw: String = row.get(3)?;
    let traffic_split_json: String = row.get(5)?;
    let targeting_rules_json: String = row.get(12)?;

    let status = ExperimentStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(2, format!("invalid experiment status: {status_raw}"))
    })?;
    let experiment_type = ExperimentType::parse(&type_raw)
        .ok_or_else(|| invalid_column(3, format!("invalid experiment_type: {type_raw}")))?;

    let traffic_split: BTreeMap<String, f64> = serde_json::from_str(&traffic_split_json)
        .map_err(|err| invalid_column(5, format!("invalid traffic_split_json: {err}")))?;
    let targeting_rules: Value = serde_json::from_str(&targeting_rules_json)
        .map_err(|err| invalid_column(12, format!("invalid targeting_rules_json: {err}")))?;

    Ok(Experiment {
        experiment_id: ExperimentId(parse_ulid_column(&experiment_id_raw, 0)?),
        name: row.get(1)?,
        status,
        experiment_type,
        primary_metric: row.get(4)?,
        traffic_split,
        confidence_level: row.get(6)?,
        minimum_detectable_effect: row.get(7)?,
        statistical_power: row.get(8)?,
        minimum_sample_size: u64::try_from(row.get::<_, i64>(9)?).unwrap_or(0),
        minimum_runtime_days: u32::try_from(row.get::<_, i64>(10)?).unwrap_or(0),
        max_runtime_days: u32::try_from(row.get::<_, i64>(11)?).unwrap_or(0),
        targeting_rules,
        created_by: row.get(13)?,
        winning_variant: row.get(14)?,
        created_at: parse_timestamp_column(&row.get::<_, String>(15)?, 15)?,
        started_at: parse_optional_timestamp_column(row.get::<_, Option<String>>(16)?, 16)?,
        completed_at: parse_optional_timestamp_column(row.get::<_, Option<String>>(17)?, 17)?,
    })
}

fn parse_variant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExperimentVariant> {
    parse_variant_row_at(row, 0)
}

fn parse_variant_row_at(
    row: &rusqlite::Row<'_>,
    base: usize,
) -> rusqlite::Result<ExperimentVariant> {
    let variant_id_raw: String = row.get(base)?;
    let experiment_id_raw: String = row.get(base + 1)?;
    let configuration_json: String = row.get(base + 4)?;
    let feature_flags_json: String = row.get(base + 5)?;

    let configuration: Value = serde_json::from_str(&configuration_json)
        .map_err(|err| invalid_column(base + 4, format!("invalid configuration_json: {err}")))?;
    let feature_flags: Value = serde_json::from_str(&feature_flags_json)
        .map_err(|err| invalid_column(base + 5, format!("invalid feature_flags_json: {err}")))?;

    Ok(ExperimentVariant {
        variant_id: VariantId(parse_ulid_column(&variant_id_raw, base)?),
        experiment_id: ExperimentId(parse_ulid_column(&experiment_id_raw, base + 1)?),
        name: row.get(base + 2)?,
        is_control: row.get::<_, i64>(base + 3)? == 1,
        configuration,
        feature_flags,
        traffic_weight: row.get(base + 6)?,
        participants: u64::try_from(row.get::<_, i64>(base + 7)?).unwrap_or(0),
        conversions: u64::try_from(row.get::<_, i64>(base + 8)?).unwrap_or(0),
        conversion_rate: row.get(base + 9)?,
    })
}

fn parse_allocation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Allocation> {
    let allocation_id_raw: String = row.get(0)?;
    let experiment_id_raw: String = row.get(1)?;
    let variant_id_raw: String = row.get(2)?;

    Ok(Allocation {
        allocation_id: AllocationId(parse_ulid_column(&allocation_id_raw, 0)?),
        experiment_id: ExperimentId(parse_ulid_column(&experiment_id_raw, 1)?),
        variant_id: VariantId(parse_ulid_column(&variant_id_raw, 2)?),
        variant_name: row.get(3)?,
        user_id: row.get(4)?,
        session_id: row.get(5)?,
        first_exposure: parse_timestamp_column(&row.get::<_, String>(6)?, 6)?,
        last_exposure: parse_timestamp_column(&row.get::<_, String>(7)?, 7)?,
        exposure_count: u64::try_from(row.get::<_, i64>(8)?).unwrap_or(0),
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExperimentEvent> {
    let event_id_raw: String = row.get(1)?;
    let experiment_id_raw: String = row.get(2)?;
    let variant_id_raw: String = row.get(3)?;
    let allocation_id_raw: String = row.get(4)?;
    let event_data_json: String = row.get(7)?;

    let event_data: Value = serde_json::from_str(&event_data_json)
        .map_err(|err| invalid_column(7, format!("invalid event_data_json: {err}")))?;

    Ok(ExperimentEvent {
        event_seq: row.get(0)?,
        event_id: parse_ulid_column(&event_id_raw, 1)?,
        experiment_id: ExperimentId(parse_ulid_column(&experiment_id_raw, 2)?),
        variant_id: VariantId(parse_ulid_column(&variant_id_raw, 3)?),
        allocation_id: AllocationId(parse_ulid_column(&allocation_id_raw, 4)?),
        event_type: row.get(5)?,
        event_value: row.get(6)?,
        event_data,
        recorded_at: parse_timestamp_column(&row.get::<_, String>(8)?, 8)?,
    })
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_ulid_column(raw: &str, index: usize) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| invalid_column(index, format!("invalid ULID: {raw}")))
}

fn parse_ulid_text(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_timestamp_column(raw: &str, index: usize) -> rusqlite::Result<time::OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| invalid_column(index, err.to_string()))
}

fn parse_optional_timestamp_column(
    raw: Option<String>,
    index: usize,
) -> rusqlite::Result<Option<time::OffsetDateTime>> {
    raw.as_deref()
        .map(|value| parse_timestamp_column(value, index))
        .transpose()
}

fn format_timestamp(value: time::OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn normalize_bound(raw: Option<&str>) -> Result<Option<String>> {
    raw.map(|value| {
        parse_rfc3339_utc(value)
            .map_err(anyhow::Error::new)
            .and_then(format_timestamp)
    })
    .transpose()
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("value {value} does not fit in i64"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
