//! Calculation and chunk records.
//!
//! Plain typed records with an explicit validation step
//! ([`NewCalculation::new`]). The status enums encode the forward-only
//! lifecycle: `pending → running → {completed | failed}` for calculations and
//! `pending → completed` for chunks.

use crate::{
    Error, Result,
    common::validate_points,
    sampler::{Sample, estimate_pi},
};
use chrono::{DateTime, Utc};
use core::{fmt, str::FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a calculation is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Sample the full budget in one pass on the calling task.
    #[default]
    Single,
    /// Split into chunks executed by queue workers.
    Distributed,
}

impl Mode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Distributed => "distributed",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(Self::Single),
            "distributed" => Ok(Self::Distributed),
            _ => Err(Error::invalid(
                "mode",
                "The mode must be either single or distributed.",
            )),
        }
    }
}

/// Lifecycle of a calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Status {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `completed` and `failed` are final; nothing mutates after them.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only
    /// lifecycle.
    pub const fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Storage {
                context: format!("unknown calculation status `{other}`"),
            }),
        }
    }
}

/// Lifecycle of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Completed,
}

impl ChunkStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for ChunkStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            other => Err(Error::Storage {
                context: format!("unknown chunk status `{other}`"),
            }),
        }
    }
}

/// A validated request to create a calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewCalculation {
    pub total_points: u64,
    pub mode: Mode,
}

impl NewCalculation {
    /// Validates `total_points` against the global bounds.
    pub fn new(total_points: u64, mode: Mode) -> Result<Self> {
        Ok(Self {
            total_points: validate_points(total_points)?,
            mode,
        })
    }
}

/// Final fields written once when a calculation completes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalculationResult {
    pub pi: f64,
    pub inside: u64,
    pub total: u64,
    pub duration_ms: u64,
}

impl CalculationResult {
    pub fn from_counts(inside: u64, total: u64, duration_ms: u64) -> Self {
        Self {
            pi: estimate_pi(inside, total),
            inside,
            total,
            duration_ms,
        }
    }
}

impl From<Sample> for CalculationResult {
    fn from(sample: Sample) -> Self {
        Self::from_counts(sample.inside, sample.total, sample.duration_ms)
    }
}

/// One user-requested estimation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Calculation {
    pub id: i64,
    pub uuid: Uuid,
    pub total_points: u64,
    pub mode: Mode,
    pub status: Status,
    pub result_pi: Option<f64>,
    pub result_inside: Option<u64>,
    pub result_total: Option<u64>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Calculation {
    /// The aggregate result, once the calculation has completed.
    pub fn result(&self) -> Option<CalculationResult> {
        match (self.result_pi, self.result_inside, self.result_total) {
            (Some(pi), Some(inside), Some(total)) => Some(CalculationResult {
                pi,
                inside,
                total,
                duration_ms: self.duration_ms.unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// Compact view returned by history queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub uuid: Uuid,
    pub total_points: u64,
    pub mode: Mode,
    pub result_pi: Option<f64>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl From<&Calculation> for HistoryEntry {
    fn from(c: &Calculation) -> Self {
        Self {
            id: c.id,
            uuid: c.uuid,
            total_points: c.total_points,
            mode: c.mode,
            result_pi: c.result_pi,
            duration_ms: c.duration_ms,
            created_at: c.created_at,
        }
    }
}

/// One unit of distributed work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub calculation_id: i64,
    pub chunk_index: u32,
    pub total_points: u64,
    pub result_inside: Option<u64>,
    pub result_total: Option<u64>,
    pub duration_ms: Option<u64>,
    pub status: ChunkStatus,
}

impl Chunk {
    pub fn pending(calculation_id: i64, chunk_index: u32, total_points: u64) -> Self {
        Self {
            calculation_id,
            chunk_index,
            total_points,
            result_inside: None,
            result_total: None,
            duration_ms: None,
            status: ChunkStatus::Pending,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ChunkStatus::Completed
    }
}

/// Identifies a calculation either by integer id or by its public token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculationRef {
    Id(i64),
    Token(Uuid),
}

impl fmt::Display for CalculationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Token(uuid) => write!(f, "{uuid}"),
        }
    }
}

impl FromStr for CalculationRef {
    type Err = Error;

    /// UUID-shaped references resolve by token, anything else by id.
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(uuid) = Uuid::parse_str(s) {
            return Ok(Self::Token(uuid));
        }
        s.parse::<i64>().map(Self::Id).map_err(|_| Error::NotFound {
            reference: s.to_string(),
        })
    }
}

impl From<i64> for CalculationRef {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<Uuid> for CalculationRef {
    fn from(uuid: Uuid) -> Self {
        Self::Token(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        use Status::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn mode_parses_known_values_only() {
        assert_eq!("single".parse::<Mode>(), Ok(Mode::Single));
        assert_eq!("distributed".parse::<Mode>(), Ok(Mode::Distributed));
        assert!(matches!(
            "invalid-mode".parse::<Mode>(),
            Err(Error::InvalidRequest { field: "mode", .. })
        ));
        assert_eq!(Mode::default(), Mode::Single);
    }

    #[test]
    fn reference_prefers_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(
            uuid.to_string().parse::<CalculationRef>(),
            Ok(CalculationRef::Token(uuid))
        );
        assert_eq!("17".parse::<CalculationRef>(), Ok(CalculationRef::Id(17)));
        assert!(matches!(
            "nope".parse::<CalculationRef>(),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn result_from_zero_counts_is_zero() {
        let result = CalculationResult::from_counts(0, 0, 0);
        assert_eq!(result.pi, 0.0);
    }

    #[test]
    fn serializes_lowercase_enums() {
        let json = serde_json::to_string(&(Mode::Distributed, Status::Completed)).unwrap();
        assert_eq!(json, r#"["distributed","completed"]"#);
    }
}
