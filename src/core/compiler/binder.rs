//! Positional parameter binding
//!
//! Every literal from a query ends up here and is referenced from SQL text
//! only through a typed placeholder such as `$3::bigint`.

use chrono::NaiveDate;
use std::fmt;

/// A bound statement parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SqlParam {
    /// 64-bit integer, placeholder cast to `bigint`
    Int(i64),
    /// Double precision float, placeholder cast to `float8`
    Float(f64),
    /// Calendar date, placeholder cast to `date`
    Date(NaiveDate),
}

impl SqlParam {
    fn sql_type(&self) -> &'static str {
        match self {
            Self::Int(_) => "bigint",
            Self::Float(_) => "float8",
            Self::Date(_) => "date",
        }
    }
}

impl fmt::Display for SqlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{v}"),
        }
    }
}

/// Collects parameters while a statement is being built
#[derive(Debug)]
pub struct Binder {
    params: Vec<SqlParam>,
    reference_date: NaiveDate,
    reference_placeholder: Option<String>,
}

impl Binder {
    /// Creates a binder for a query anchored at `reference_date`
    pub fn new(reference_date: NaiveDate) -> Self {
        Self {
            params: Vec::new(),
            reference_date,
            reference_placeholder: None,
        }
    }

    /// Binds a parameter and returns its typed placeholder
    pub fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}::{}", self.params.len(), param.sql_type())
    }

    /// Placeholder of the reference date, bound once and reused
    pub fn reference_date(&mut self) -> String {
        if let Some(placeholder) = &self.reference_placeholder {
            return placeholder.clone();
        }
        let placeholder = self.bind(SqlParam::Date(self.reference_date));
        self.reference_placeholder = Some(placeholder.clone());
        placeholder
    }

    /// The date the query is anchored at
    pub fn reference_value(&self) -> NaiveDate {
        self.reference_date
    }

    /// Consumes the binder, returning parameters in placeholder order
    pub fn into_params(self) -> Vec<SqlParam> {
        self.params
    }
}
