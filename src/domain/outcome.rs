//! Result model
//!
//! Outbound answers published for every task: a safeguarded availability
//! count, a safeguarded distribution, or a categorized error. Suppressed cells
//! are always carried explicitly so requesters can tell "zero" from "hidden".

use crate::domain::errors::{ErrorCategory, TaskError};
use crate::domain::ids::{CollectionId, CorrelationId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single published count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CellRepr", into = "CellRepr")]
pub enum Cell {
    /// Count that passed disclosure control (possibly rounded)
    Count(u64),
    /// Count hidden by disclosure control
    Suppressed,
}

impl Cell {
    /// Returns the published count, if any
    pub fn count(&self) -> Option<u64> {
        match self {
            Self::Count(n) => Some(*n),
            Self::Suppressed => None,
        }
    }

    /// Whether the cell is hidden
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::Suppressed)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CellRepr {
    count: Option<u64>,
    suppressed: bool,
}

impl From<Cell> for CellRepr {
    fn from(cell: Cell) -> Self {
        match cell {
            Cell::Count(n) => Self {
                count: Some(n),
                suppressed: false,
            },
            Cell::Suppressed => Self {
                count: None,
                suppressed: true,
            },
        }
    }
}

impl TryFrom<CellRepr> for Cell {
    type Error = String;

    fn try_from(repr: CellRepr) -> Result<Self, Self::Error> {
        match (repr.count, repr.suppressed) {
            (Some(n), false) => Ok(Cell::Count(n)),
            (None, true) => Ok(Cell::Suppressed),
            (Some(_), true) => Err("a suppressed cell must not carry a count".to_string()),
            (None, false) => Err("an unsuppressed cell must carry a count".to_string()),
        }
    }
}

/// Safeguarded single count of matching subjects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AvailabilityResult(pub Cell);

/// Safeguarded counts per bucket of a dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionResult {
    /// Dimension name
    pub dimension: String,
    /// Bucket label to cell; suppressed buckets are kept
    pub buckets: BTreeMap<String, Cell>,
}

/// Error details published in place of a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Error category
    pub code: ErrorCategory,
    /// Human-readable detail
    pub detail: String,
}

impl From<&TaskError> for ErrorReport {
    fn from(err: &TaskError) -> Self {
        Self {
            code: err.category(),
            detail: err.to_string(),
        }
    }
}

/// Outcome status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// A result payload is attached
    Ok,
    /// An error report is attached
    Error,
}

/// Payload of a published result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum Payload {
    /// Single count
    Availability(AvailabilityResult),
    /// Counts per bucket
    Distribution(DistributionResult),
    /// Categorized failure
    Error(ErrorReport),
}

/// Message published for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TaskResultRepr")]
pub struct TaskResult {
    /// Correlation id of the answered task
    pub correlation_id: CorrelationId,
    /// Destination of the result
    pub reply_to: CollectionId,
    /// Outcome status, always consistent with the payload
    pub status: Status,
    /// Result or error payload
    pub payload: Payload,
}

#[derive(Deserialize)]
struct TaskResultRepr {
    correlation_id: CorrelationId,
    reply_to: CollectionId,
    status: Status,
    payload: Payload,
}

impl TryFrom<TaskResultRepr> for TaskResult {
    type Error = String;

    fn try_from(repr: TaskResultRepr) -> Result<Self, Self::Error> {
        let expected = status_of(&repr.payload);
        if repr.status != expected {
            return Err(format!(
                "status {:?} does not match the payload kind",
                repr.status
            ));
        }
        Ok(Self {
            correlation_id: repr.correlation_id,
            reply_to: repr.reply_to,
            status: repr.status,
            payload: repr.payload,
        })
    }
}

fn status_of(payload: &Payload) -> Status {
    match payload {
        Payload::Error(_) => Status::Error,
        Payload::Availability(_) | Payload::Distribution(_) => Status::Ok,
    }
}

impl TaskResult {
    /// Builds a result, deriving the status from the payload
    pub fn new(correlation_id: CorrelationId, reply_to: CollectionId, payload: Payload) -> Self {
        Self {
            correlation_id,
            reply_to,
            status: status_of(&payload),
            payload,
        }
    }

    /// Builds an error result for a task failure
    pub fn failure(correlation_id: CorrelationId, reply_to: CollectionId, err: &TaskError) -> Self {
        Self::new(correlation_id, reply_to, Payload::Error(ErrorReport::from(err)))
    }

    /// Error category, for error results
    pub fn error_code(&self) -> Option<ErrorCategory> {
        match &self.payload {
            Payload::Error(report) => Some(report.code),
            _ => None,
        }
    }

    /// Serializes the result to its JSON wire form
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids() -> (CorrelationId, CollectionId) {
        (
            CorrelationId::new("job-42").unwrap(),
            CollectionId::new("collection-7").unwrap(),
        )
    }

    #[test]
    fn test_suppressed_availability_wire_form() {
        let (id, to) = ids();
        let result = TaskResult::new(
            id,
            to,
            Payload::Availability(AvailabilityResult(Cell::Suppressed)),
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({
                "correlation_id": "job-42",
                "reply_to": "collection-7",
                "status": "OK",
                "payload": { "kind": "AVAILABILITY", "count": null, "suppressed": true }
            })
        );
    }

    #[test]
    fn test_distribution_round_trip_keeps_suppressed_buckets() {
        let (id, to) = ids();
        let mut buckets = BTreeMap::new();
        buckets.insert("male".to_string(), Cell::Count(10));
        buckets.insert("female".to_string(), Cell::Suppressed);
        let result = TaskResult::new(
            id,
            to,
            Payload::Distribution(DistributionResult {
                dimension: "SEX".to_string(),
                buckets,
            }),
        );

        let json = result.to_json().unwrap();
        let back: TaskResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
        let Payload::Distribution(distribution) = back.payload else {
            panic!("expected distribution");
        };
        assert!(distribution.buckets["female"].is_suppressed());
        assert_eq!(distribution.buckets["male"].count(), Some(10));
    }

    #[test]
    fn test_error_result() {
        let (id, to) = ids();
        let result = TaskResult::failure(id, to, &TaskError::MalformedQuery("no output".into()));
        assert_eq!(result.status, Status::Error);
        assert_eq!(result.error_code(), Some(ErrorCategory::MalformedQuery));

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["payload"]["kind"], "ERROR");
        assert_eq!(value["payload"]["code"], "MalformedQuery");
        assert_eq!(value["payload"]["detail"], "Malformed query: no output");
    }

    #[test]
    fn test_inconsistent_cell_rejected() {
        assert!(serde_json::from_str::<Cell>(r#"{"count":3,"suppressed":true}"#).is_err());
        assert!(serde_json::from_str::<Cell>(r#"{"count":null,"suppressed":false}"#).is_err());
        assert_eq!(
            serde_json::from_str::<Cell>(r#"{"count":0,"suppressed":false}"#).unwrap(),
            Cell::Count(0)
        );
    }

    #[test]
    fn test_status_must_match_payload() {
        let body = json!({
            "correlation_id": "job-1",
            "reply_to": "c",
            "status": "OK",
            "payload": { "kind": "ERROR", "code": "Timeout", "detail": "slow" }
        });
        assert!(serde_json::from_value::<TaskResult>(body).is_err());
    }
}
