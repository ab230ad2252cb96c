// Tally - Cohort discovery task-resolving daemon
// Copyright (c) 2025 Tally Contributors
// Licensed under the MIT License

//! # Tally - cohort discovery over OMOP CDM
//!
//! Tally is a long-running daemon that takes cohort-discovery questions from a
//! task API, answers them against an OMOP CDM PostgreSQL database and publishes
//! privacy-safeguarded counts back.
//!
//! ## Overview
//!
//! This library provides:
//! - **Validating** inbound query specifications up front
//! - **Compiling** them into parameterized aggregate SQL
//! - **Safeguarding** raw counts with suppression and rounding
//! - **Running** a bounded, retrying task lifecycle that never drops a task
//!
//! ## Architecture
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`core`] - Compiler, disclosure control, resolver and daemon
//! - [`adapters`] - External integrations (task API, PostgreSQL)
//! - [`domain`] - Query and result models, identifiers, errors
//! - [`config`] - Configuration management
//! - [`logging`] - Structured logging
//!
//! ## Quick Start
//!
//! ```rust
//! use tally::core::compiler::SqlCompiler;
//! use tally::core::disclosure::DisclosurePolicy;
//! use tally::domain::query::{parse_query, QueryLimits};
//! use tally::domain::outcome::Cell;
//! use chrono::NaiveDate;
//! use serde_json::json;
//!
//! let body = json!({
//!     "output": { "kind": "AVAILABILITY" },
//!     "cohort": {
//!         "groups_operator": "AND",
//!         "groups": [{
//!             "rules_operator": "AND",
//!             "rules": [{ "domain": "CONDITION", "concept_id": 201820, "comparator": "EQ" }]
//!         }]
//!     }
//! });
//! let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
//! let spec = parse_query(&body, today, &QueryLimits::default()).unwrap();
//!
//! let compiled = SqlCompiler::new("cdm").unwrap().compile(&spec).unwrap();
//! assert!(compiled.sql.starts_with("SELECT COUNT(DISTINCT p.person_id)"));
//!
//! let policy = DisclosurePolicy::new(10, 5);
//! assert_eq!(policy.apply(3), Cell::Suppressed);
//! assert_eq!(policy.apply(12), Cell::Count(10));
//! ```
//!
//! ## Error Handling
//!
//! Application failures use [`domain::TallyError`]; failures of a single task
//! use [`domain::TaskError`] and always end up as an error result published to
//! the requester.

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod logging;
