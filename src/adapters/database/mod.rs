//! Database abstraction layer
//!
//! Trait-based access to the CDM database, so the resolver and daemon can be
//! exercised against in-memory executors.

pub mod factory;
pub mod traits;

pub use factory::create_executor;
pub use traits::{QueryExecutor, RawAggregate, UNKNOWN_BUCKET};
