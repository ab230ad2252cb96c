//! Domain models and types for Tally.
//!
//! # Overview
//!
//! The domain layer provides:
//! - **Strongly-typed identifiers** ([`CorrelationId`], [`CollectionId`], [`ConceptId`])
//! - **Query model** ([`QuerySpec`], [`Cohort`], [`Rule`]) with total validation
//! - **Result model** ([`TaskResult`], [`Cell`])
//! - **Error types** ([`TallyError`], [`TaskError`], [`ErrorCategory`])
//! - **Result type alias** ([`Result`])
//!
//! # Example
//!
//! ```rust
//! use tally::domain::query::{parse_query, OutputKind, QueryLimits};
//! use chrono::NaiveDate;
//! use serde_json::json;
//!
//! let body = json!({ "output": { "kind": "AVAILABILITY" } });
//! let today = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
//! let spec = parse_query(&body, today, &QueryLimits::default()).unwrap();
//! assert_eq!(spec.output, OutputKind::Availability);
//! assert!(spec.cohort.has_no_rules());
//! ```

pub mod errors;
pub mod ids;
pub mod outcome;
pub mod query;
pub mod result;

// Re-export commonly used types for convenience
pub use errors::{ErrorCategory, TallyError, TaskError};
pub use ids::{CollectionId, ConceptId, CorrelationId};
pub use outcome::{
    AvailabilityResult, Cell, DistributionResult, ErrorReport, Payload, Status, TaskResult,
};
pub use query::{Cohort, QuerySpec, Rule};
pub use result::Result;
