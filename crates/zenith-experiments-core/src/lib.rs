use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ExperimentError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("allocation error: {0}")]
    Allocation(String),
    #[error("experiment error: {0}")]
    Experiment(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ExperimentId(pub Ulid);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct VariantId(pub Ulid);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct AllocationId(pub Ulid);

impl Display for ExperimentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for VariantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for AllocationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Archived,
}

impl ExperimentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Whether new subjects may still be bucketed into the experiment.
    /// Draft counts: the first allocation promotes the experiment to running.
    #[must_use]
    pub fn is_allocatable(self) -> bool {
        matches!(self, Self::Draft | Self::Running)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Running)
                | (Self::Running, Self::Paused | Self::Completed)
                | (Self::Paused, Self::Running)
                | (
                    Self::Draft | Self::Running | Self::Paused | Self::Completed,
                    Self::Archived
                )
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    AbTest,
    Multivariate,
}

impl ExperimentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AbTest => "ab_test",
            Self::Multivariate => "multivariate",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ab_test" => Some(Self::AbTest),
            "multivariate" => Some(Self::Multivariate),
            _ => None,
        }
    }
}

/// Statistical test used for winner detection. The original system never
/// pinned this down, so the choice is an explicit parameter rather than a
/// buried assumption.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SignificanceTest {
    #[default]
    TwoProportionZ,
}

impl SignificanceTest {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TwoProportionZ => "two_proportion_z",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "two_proportion_z" => Some(Self::TwoProportionZ),
            _ => None,
        }
    }
}

pub const MIN_VARIANTS: usize = 2;
pub const MAX_VARIANTS: usize = 10;
pub const TRAFFIC_SUM_TOLERANCE: f64 = 0.001;
pub const MIN_SAMPLE_SIZE_FLOOR: u64 = 100;
pub const BASELINE_CONVERSION_RATE: f64 = 0.1;
/// Fixed-precision weight space the identity hash is reduced into.
pub const WEIGHT_SPACE: u64 = 10_000;
pub const MAX_BATCH_EVENTS: usize = 100;

/// Canonical funnel ordering used by event statistics.
pub const FUNNEL_STAGES: [&str; 5] = ["page_view", "click", "signup", "conversion", "purchase"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantDefinition {
    pub name: String,
    #[serde(default)]
    pub is_control: bool,
    #[serde(default = "empty_object")]
    pub configuration: Value,
    #[serde(default = "empty_object")]
    pub feature_flags: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentDefinition {
    pub name: String,
    #[serde(default = "default_experiment_type")]
    pub experiment_type: ExperimentType,
    pub primary_metric: String,
    pub variants: Vec<VariantDefinition>,
    pub traffic_split: BTreeMap<String, f64>,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default = "default_minimum_detectable_effect")]
    pub minimum_detectable_effect: f64,
    #[serde(default = "default_statistical_power")]
    pub statistical_power: f64,
    #[serde(default = "default_minimum_sample_size")]
    pub minimum_sample_size: u64,
    #[serde(default = "default_minimum_runtime_days")]
    pub minimum_runtime_days: u32,
    #[serde(default = "default_max_runtime_days")]
    pub max_runtime_days: u32,
    #[serde(default = "empty_object")]
    pub targeting_rules: Value,
    #[serde(default)]
    pub created_by: String,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::default())
}

fn default_experiment_type() -> ExperimentType {
    ExperimentType::AbTest
}

fn default_confidence_level() -> f64 {
    0.95
}

fn default_minimum_detectable_effect() -> f64 {
    0.05
}

fn default_statistical_power() -> f64 {
    0.8
}

fn default_minimum_sample_size() -> u64 {
    1000
}

fn default_minimum_runtime_days() -> u32 {
    14
}

fn default_max_runtime_days() -> u32 {
    90
}

impl ExperimentDefinition {
    /// Validates the full definition before anything is persisted.
    ///
    /// # Errors
    /// Returns [`ExperimentError::Configuration`] on the first violated rule.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if self.name.trim().is_empty() {
            return Err(ExperimentError::Configuration(
                "name MUST be provided".to_string(),
            ));
        }

        if self.primary_metric.trim().is_empty() {
            return Err(ExperimentError::Configuration(
                "primary_metric MUST be provided".to_string(),
            ));
        }

        if self.variants.len() < MIN_VARIANTS || self.variants.len() > MAX_VARIANTS {
            return Err(ExperimentError::Configuration(format!(
                "experiment MUST have between {MIN_VARIANTS} and {MAX_VARIANTS} variants (got {})",
                self.variants.len()
            )));
        }

        let mut seen = Vec::with_capacity(self.variants.len());
        for variant in &self.variants {
            if variant.name.trim().is_empty() {
                return Err(ExperimentError::Configuration(
                    "variant names MUST be non-empty".to_string(),
                ));
            }
            if seen.contains(&variant.name.as_str()) {
                return Err(ExperimentError::Configuration(format!(
                    "duplicate variant name: {}",
                    variant.name
                )));
            }
            seen.push(variant.name.as_str());
        }

        if self.variants.iter().filter(|v| v.is_control).count() > 1 {
            return Err(ExperimentError::Configuration(
                "at most one variant may be flagged is_control".to_string(),
            ));
        }

        if !(0.8..=0.99).contains(&self.confidence_level) {
            return Err(ExperimentError::Configuration(
                "confidence_level MUST be in [0.8, 0.99]".to_string(),
            ));
        }

        if !(0.01..=1.0).contains(&self.minimum_detectable_effect) {
            return Err(ExperimentError::Configuration(
                "minimum_detectable_effect MUST be in [0.01, 1]".to_string(),
            ));
        }

        if !(0.7..=0.99).contains(&self.statistical_power) {
            return Err(ExperimentError::Configuration(
                "statistical_power MUST be in [0.7, 0.99]".to_string(),
            ));
        }

        if self.minimum_sample_size < MIN_SAMPLE_SIZE_FLOOR {
            return Err(ExperimentError::Configuration(format!(
                "minimum_sample_size MUST be >= {MIN_SAMPLE_SIZE_FLOOR}"
            )));
        }

        if !(7..=365).contains(&self.minimum_runtime_days) {
            return Err(ExperimentError::Configuration(
                "minimum_runtime_days MUST be in [7, 365]".to_string(),
            ));
        }

        if self.max_runtime_days < self.minimum_runtime_days {
            return Err(ExperimentError::Configuration(
                "max_runtime_days MUST be >= minimum_runtime_days".to_string(),
            ));
        }

        self.validate_traffic_split()
    }

    fn validate_traffic_split(&self) -> Result<(), ExperimentError> {
        for variant in &self.variants {
            if !self.traffic_split.contains_key(&variant.name) {
                return Err(ExperimentError::Configuration(format!(
                    "traffic_split is missing an entry for variant {}",
                    variant.name
                )));
            }
        }

        for (name, weight) in &self.traffic_split {
            if !self.variants.iter().any(|v| &v.name == name) {
                return Err(ExperimentError::Configuration(format!(
                    "traffic_split references unknown variant {name}"
                )));
            }
            if !(0.0..=1.0).contains(weight) {
                return Err(ExperimentError::Configuration(format!(
                    "traffic_split weight for {name} MUST be in [0, 1]"
                )));
            }
        }

        let sum: f64 = self.traffic_split.values().sum();
        if (sum - 1.0).abs() > TRAFFIC_SUM_TOLERANCE {
            return Err(ExperimentError::Configuration(format!(
                "traffic_split MUST sum to 1.0 within {TRAFFIC_SUM_TOLERANCE} (got {sum})"
            )));
        }

        Ok(())
    }

    /// Index of the control variant; the first variant when none is flagged.
    #[must_use]
    pub fn control_index(&self) -> usize {
        self.variants
            .iter()
            .position(|v| v.is_control)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    pub experiment_id: ExperimentId,
    pub name: String,
    pub status: ExperimentStatus,
    pub experiment_type: ExperimentType,
    pub primary_metric: String,
    pub traffic_split: BTreeMap<String, f64>,
    pub confidence_level: f64,
    pub minimum_detectable_effect: f64,
    pub statistical_power: f64,
    pub minimum_sample_size: u64,
    pub minimum_runtime_days: u32,
    pub max_runtime_days: u32,
    pub targeting_rules: Value,
    pub created_by: String,
    pub winning_variant: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentVariant {
    pub variant_id: VariantId,
    pub experiment_id: ExperimentId,
    pub name: String,
    pub is_control: bool,
    pub configuration: Value,
    pub feature_flags: Value,
    pub traffic_weight: f64,
    pub participants: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
}

/// Identity a subject presents when asking to be bucketed. The stable key
/// is `user_id` when present, else `session_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Subject {
    /// # Errors
    /// Returns [`ExperimentError::Allocation`] when neither identifier is set.
    pub fn identity_key(&self) -> Result<&str, ExperimentError> {
        if let Some(user_id) = self.user_id.as_deref() {
            if !user_id.trim().is_empty() {
                return Ok(user_id);
            }
        }
        if let Some(session_id) = self.session_id.as_deref() {
            if !session_id.trim().is_empty() {
                return Ok(session_id);
            }
        }
        Err(ExperimentError::Allocation(
            "subject MUST carry a user_id or session_id".to_string(),
        ))
    }

    /// Whether `actor` is this subject (matches either identifier).
    #[must_use]
    pub fn is_actor(&self, actor: &str) -> bool {
        self.user_id.as_deref() == Some(actor) || self.session_id.as_deref() == Some(actor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    pub allocation_id: AllocationId,
    pub experiment_id: ExperimentId,
    pub variant_id: VariantId,
    pub variant_name: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_exposure: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_exposure: OffsetDateTime,
    pub exposure_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentEvent {
    pub event_seq: i64,
    pub event_id: Ulid,
    pub experiment_id: ExperimentId,
    pub variant_id: VariantId,
    pub allocation_id: AllocationId,
    pub event_type: String,
    pub event_value: Option<f64>,
    pub event_data: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Deterministic bucketing
// ---------------------------------------------------------------------------

/// Picks a variant for an identity using the experiment's traffic split.
///
/// The selection is a pure function of `(experiment_id, identity_key)`:
/// a stable FNV-1a hash reduced into [`WEIGHT_SPACE`] slots, so the same
/// identity always lands in the same bucket for a given split. Slot ranges
/// follow the split's iteration order and the final variant absorbs the
/// rounding remainder so the whole space is covered.
///
/// # Errors
/// Returns [`ExperimentError::Configuration`] for an empty split.
pub fn pick_variant<'a>(
    experiment_id: ExperimentId,
    identity_key: &str,
    traffic_split: &'a BTreeMap<String, f64>,
) -> Result<&'a str, ExperimentError> {
    if traffic_split.is_empty() {
        return Err(ExperimentError::Configuration(
            "traffic_split MUST NOT be empty".to_string(),
        ));
    }

    let slot = fnv1a64(&format!("{experiment_id}:{identity_key}")) % WEIGHT_SPACE;

    let last_index = traffic_split.len() - 1;
    let mut cumulative = 0_u64;
    for (index, (name, weight)) in traffic_split.iter().enumerate() {
        let width = if index == last_index {
            WEIGHT_SPACE.saturating_sub(cumulative)
        } else {
            weight_slots(*weight)
        };
        cumulative = cumulative.saturating_add(width);
        if slot < cumulative {
            return Ok(name.as_str());
        }
    }

    // Unreachable while the last variant absorbs the remainder; kept as a
    // defined fallback for a split whose rounded widths overflow the space.
    traffic_split
        .keys()
        .next_back()
        .map(String::as_str)
        .ok_or_else(|| ExperimentError::Configuration("traffic_split MUST NOT be empty".to_string()))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn weight_slots(weight: f64) -> u64 {
    #[allow(clippy::cast_precision_loss)]
    let scaled = (weight * WEIGHT_SPACE as f64).round();
    if scaled <= 0.0 {
        0
    } else {
        scaled as u64
    }
}

// Stable FNV-1a hash to avoid platform-randomized hashers.
fn fnv1a64(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleSizeAnalysis {
    pub baseline_rate: f64,
    pub treatment_rate: f64,
    pub minimum_detectable_effect: f64,
    pub alpha: f64,
    pub power: f64,
    pub z_alpha: f64,
    pub z_power: f64,
    pub minimum_sample_size_per_variant: u64,
}

/// Two-proportion power calculation for the per-variant sample size.
///
/// Uses a two-sided `alpha` and treats the minimum detectable effect as
/// relative: `treatment = baseline * (1 + mde)`.
///
/// # Errors
/// Returns [`ExperimentError::Configuration`] when the inputs are outside
/// their meaningful ranges or the implied treatment rate reaches 1.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn sample_size(
    baseline_rate: f64,
    minimum_detectable_effect: f64,
    alpha: f64,
    power: f64,
) -> Result<SampleSizeAnalysis, ExperimentError> {
    if !(baseline_rate > 0.0 && baseline_rate < 1.0) {
        return Err(ExperimentError::Configuration(
            "baseline_rate MUST be in (0, 1)".to_string(),
        ));
    }
    if !(0.01..=1.0).contains(&minimum_detectable_effect) {
        return Err(ExperimentError::Configuration(
            "minimum_detectable_effect MUST be in [0.01, 1]".to_string(),
        ));
    }
    if !(alpha > 0.0 && alpha < 0.5) {
        return Err(ExperimentError::Configuration(
            "alpha MUST be in (0, 0.5)".to_string(),
        ));
    }
    if !(power > 0.5 && power < 1.0) {
        return Err(ExperimentError::Configuration(
            "power MUST be in (0.5, 1)".to_string(),
        ));
    }

    let treatment_rate = baseline_rate * (1.0 + minimum_detectable_effect);
    if treatment_rate >= 1.0 {
        return Err(ExperimentError::Configuration(format!(
            "baseline_rate {baseline_rate} with effect {minimum_detectable_effect} implies a treatment rate >= 1"
        )));
    }

    let z_alpha = normal_quantile(1.0 - alpha / 2.0)?;
    let z_power = normal_quantile(power)?;

    let pooled = (baseline_rate + treatment_rate) / 2.0;
    let numerator = z_alpha * (2.0 * pooled * (1.0 - pooled)).sqrt()
        + z_power
            * (baseline_rate * (1.0 - baseline_rate) + treatment_rate * (1.0 - treatment_rate))
                .sqrt();
    let effect = treatment_rate - baseline_rate;
    let n = (numerator * numerator) / (effect * effect);

    Ok(SampleSizeAnalysis {
        baseline_rate,
        treatment_rate,
        minimum_detectable_effect,
        alpha,
        power,
        z_alpha,
        z_power,
        minimum_sample_size_per_variant: n.ceil() as u64,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantCounts {
    pub name: String,
    pub is_control: bool,
    pub participants: u64,
    pub conversions: u64,
}

impl VariantCounts {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn conversion_rate(&self) -> f64 {
        if self.participants == 0 {
            0.0
        } else {
            self.conversions as f64 / self.participants as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WinnerSummary {
    pub variant_name: String,
    pub control_rate: f64,
    pub variant_rate: f64,
    pub lift_percent: f64,
    pub z_score: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WinnerAnalysis {
    pub has_winner: bool,
    pub test: SignificanceTest,
    pub winner: Option<WinnerSummary>,
}

impl WinnerAnalysis {
    fn none(test: SignificanceTest) -> Self {
        Self {
            has_winner: false,
            test,
            winner: None,
        }
    }
}

/// Compares every non-control variant against control and reports the
/// statistically significant variant with the largest positive lift.
///
/// No winner is ever declared while any variant is below
/// `minimum_sample_size` participants, regardless of the apparent gap;
/// equal-lift ties also resolve to no winner rather than a coin flip.
///
/// # Errors
/// Returns [`ExperimentError::Configuration`] when the variant set has no
/// control or the confidence level is out of range.
pub fn detect_winner(
    variants: &[VariantCounts],
    confidence_level: f64,
    minimum_sample_size: u64,
    test: SignificanceTest,
) -> Result<WinnerAnalysis, ExperimentError> {
    if !(0.8..=0.99).contains(&confidence_level) {
        return Err(ExperimentError::Configuration(
            "confidence_level MUST be in [0.8, 0.99]".to_string(),
        ));
    }

    let control = variants
        .iter()
        .find(|v| v.is_control)
        .ok_or_else(|| {
            ExperimentError::Configuration("variant set MUST include a control".to_string())
        })?;

    if variants.len() < MIN_VARIANTS {
        return Ok(WinnerAnalysis::none(test));
    }

    // Peeking guard: do not even look at the rates while underpowered.
    if variants
        .iter()
        .any(|v| v.participants < minimum_sample_size)
    {
        return Ok(WinnerAnalysis::none(test));
    }

    let alpha = 1.0 - confidence_level;
    let control_rate = control.conversion_rate();

    let mut candidates: Vec<WinnerSummary> = Vec::new();
    for variant in variants.iter().filter(|v| !v.is_control) {
        let variant_rate = variant.conversion_rate();
        let (z_score, p_value) = match test {
            SignificanceTest::TwoProportionZ => two_proportion_z(control, variant),
        };
        if variant_rate > control_rate && p_value <= alpha {
            candidates.push(WinnerSummary {
                variant_name: variant.name.clone(),
                control_rate,
                variant_rate,
                lift_percent: lift_percent(control_rate, variant_rate),
                z_score,
                p_value,
            });
        }
    }

    candidates.sort_by(|lhs, rhs| {
        rhs.variant_rate
            .partial_cmp(&lhs.variant_rate)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    match candidates.as_slice() {
        [] => Ok(WinnerAnalysis::none(test)),
        [single] => Ok(WinnerAnalysis {
            has_winner: true,
            test,
            winner: Some(single.clone()),
        }),
        [first, second, ..] => {
            // A dead heat between the top candidates is not a winner.
            if (first.variant_rate - second.variant_rate).abs() < f64::EPSILON {
                return Ok(WinnerAnalysis::none(test));
            }
            Ok(WinnerAnalysis {
                has_winner: true,
                test,
                winner: Some(first.clone()),
            })
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn two_proportion_z(control: &VariantCounts, variant: &VariantCounts) -> (f64, f64) {
    let n1 = control.participants as f64;
    let n2 = variant.participants as f64;
    if n1 == 0.0 || n2 == 0.0 {
        return (0.0, 1.0);
    }

    let p1 = control.conversion_rate();
    let p2 = variant.conversion_rate();
    let pooled = (control.conversions + variant.conversions) as f64 / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se == 0.0 {
        return (0.0, 1.0);
    }

    let z = (p2 - p1) / se;
    // One-sided: the winner must beat control, not merely differ from it.
    let p_value = 1.0 - normal_cdf(z);
    (z, p_value)
}

/// Percentage lift of `variant_rate` over `control_rate`. Positive infinity
/// when control has never converted but the variant has.
#[must_use]
pub fn lift_percent(control_rate: f64, variant_rate: f64) -> f64 {
    if control_rate == 0.0 {
        if variant_rate > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        (variant_rate - control_rate) / control_rate * 100.0
    }
}

// Acklam's rational approximation to the standard normal quantile,
// |relative error| < 1.15e-9 over (0, 1).
fn normal_quantile(p: f64) -> Result<f64, ExperimentError> {
    if !(p > 0.0 && p < 1.0) {
        return Err(ExperimentError::Configuration(format!(
            "quantile probability MUST be in (0, 1), got {p}"
        )));
    }

    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;
    const P_HIGH: f64 = 1.0 - P_LOW;

    let value = if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= P_HIGH {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    Ok(value)
}

// Abramowitz & Stegun 7.1.26 erf approximation, |error| < 1.5e-7.
fn normal_cdf(z: f64) -> f64 {
    let x = z / std::f64::consts::SQRT_2;
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    let erf = sign * (1.0 - poly * (-x * x).exp());

    0.5 * (1.0 + erf)
}

// ---------------------------------------------------------------------------
// Derived reporting
// ---------------------------------------------------------------------------

/// Ceil of whole days since `started_at`, reported only while running.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn days_running(
    status: ExperimentStatus,
    started_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Option<u32> {
    if status != ExperimentStatus::Running {
        return None;
    }
    let started_at = started_at?;
    if now <= started_at {
        return Some(0);
    }
    let elapsed = now - started_at;
    let days = elapsed.as_seconds_f64() / Duration::DAY.as_seconds_f64();
    Some(days.ceil() as u32)
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn progress_percent(total_participants: u64, minimum_sample_size: u64) -> f64 {
    if minimum_sample_size == 0 {
        return 100.0;
    }
    (total_participants as f64 / minimum_sample_size as f64 * 100.0).min(100.0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunnelStage {
    pub stage: String,
    pub count: u64,
    /// Percent of the previous stage that reached this one; 100 for the top.
    pub step_rate_percent: f64,
}

/// Projects per-event-type counts onto the canonical funnel ordering.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn funnel(counts_by_event_type: &BTreeMap<String, u64>) -> Vec<FunnelStage> {
    let mut stages = Vec::with_capacity(FUNNEL_STAGES.len());
    let mut previous: Option<u64> = None;

    for stage in FUNNEL_STAGES {
        let count = counts_by_event_type.get(stage).copied().unwrap_or(0);
        let step_rate_percent = match previous {
            None => 100.0,
            Some(0) => 0.0,
            Some(prev) => count as f64 / prev as f64 * 100.0,
        };
        stages.push(FunnelStage {
            stage: stage.to_string(),
            count,
            step_rate_percent,
        });
        previous = Some(count);
    }

    stages
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ExperimentError::Experiment`] when parsing fails or the input
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ExperimentError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ExperimentError::Experiment(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ExperimentError::Experiment(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ExperimentError::Experiment`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ExperimentError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ExperimentError::Experiment(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
