//! Query model
//!
//! Typed representation of inbound cohort queries. [`parse`] turns raw
//! payloads into [`model`] types, validating everything up front.

pub mod model;
pub mod parse;

pub use model::{
    AgeRange, BoolOperator, Cohort, Comparator, ConceptDomain, Dimension, EventFilter,
    FactDomain, OutputKind, PersonAttribute, QueryLimits, QuerySpec, Rule, RuleGroup,
};
pub use parse::{
    parse_envelope, parse_query, peek_correlation_id, peek_reply_to, Envelope, TaskMessage,
};
