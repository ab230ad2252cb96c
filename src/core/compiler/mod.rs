//! SQL compiler
//!
//! Translates a validated [`QuerySpec`] into a parameterized aggregate
//! statement over the OMOP CDM schema.
//!
//! Every rule becomes a predicate over the outer `person` row: fact rules are
//! `EXISTS` / `NOT EXISTS` subqueries, demographic and age rules compare
//! person columns. Row-level filters of a fact rule (age at the event, record
//! type) are further conditions inside its subquery. Groups combine those
//! predicates with `AND` / `OR`, so a
//! subject is counted once by `COUNT(DISTINCT p.person_id)` however many of
//! its rows satisfy the rules.
//!
//! # Example
//!
//! ```rust
//! use tally::core::compiler::SqlCompiler;
//! use tally::domain::query::{parse_query, QueryLimits};
//! use chrono::NaiveDate;
//! use serde_json::json;
//!
//! let body = json!({ "output": { "kind": "AVAILABILITY" } });
//! let today = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
//! let spec = parse_query(&body, today, &QueryLimits::default()).unwrap();
//!
//! let compiler = SqlCompiler::new("cdm").unwrap();
//! let compiled = compiler.compile(&spec).unwrap();
//! assert!(compiled.sql.starts_with("SELECT COUNT(DISTINCT p.person_id)"));
//! assert!(compiled.params.is_empty());
//! ```

pub mod binder;
pub mod mapping;

pub use binder::{Binder, SqlParam};

use crate::domain::errors::{TallyError, TaskError};
use crate::domain::query::{
    AgeRange, BoolOperator, Cohort, Comparator, ConceptDomain, Dimension, EventFilter,
    FactDomain, OutputKind, PersonAttribute, QuerySpec, Rule, RuleGroup,
};
use chrono::Days;
use mapping::{fact_table, person_column, FactTable, CONCEPT_TABLE, PERSON_ID, PERSON_TABLE};
use regex::Regex;
use std::sync::OnceLock;

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn identifier_regex() -> Option<&'static Regex> {
    static IDENTIFIER: OnceLock<Option<Regex>> = OnceLock::new();
    IDENTIFIER
        .get_or_init(|| Regex::new(IDENTIFIER_PATTERN).ok())
        .as_ref()
}

/// Checks that `name` is a plain SQL identifier safe to quote into statements
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

/// Shape of the rows a compiled statement returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// One row with one `bigint` column
    Count,
    /// Rows of (`text` bucket key, `bigint` count)
    Buckets(Dimension),
}

/// An executable statement with its bound parameters
///
/// Literal values never appear in `sql`; they are carried in `params` and
/// referenced by typed placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    /// Statement text
    pub sql: String,
    /// Parameters in placeholder order
    pub params: Vec<SqlParam>,
    /// Shape of the returned rows
    pub shape: ResultShape,
}

/// Compiles query specifications against one CDM schema
#[derive(Debug, Clone)]
pub struct SqlCompiler {
    schema: String,
}

impl SqlCompiler {
    /// Creates a compiler for the given schema
    ///
    /// The schema is always quoted in statements, so it must match the
    /// database name exactly, case included.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the schema name is not a plain identifier.
    pub fn new(schema: &str) -> Result<Self, TallyError> {
        if !is_valid_identifier(schema) {
            return Err(TallyError::Configuration(format!(
                "Invalid schema name '{schema}': must match {IDENTIFIER_PATTERN}"
            )));
        }
        Ok(Self {
            schema: schema.to_string(),
        })
    }

    /// Schema the compiler targets
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Compiles a query specification
    ///
    /// # Errors
    ///
    /// - `UnsupportedRule` if a rule's domain/comparator combination has no mapping
    /// - `Compilation` on internal inconsistencies (missing concept, non-finite number)
    pub fn compile(&self, spec: &QuerySpec) -> Result<CompiledQuery, TaskError> {
        let mut binder = Binder::new(spec.reference_date);
        let predicate = self.cohort_predicate(&spec.cohort, &mut binder)?;

        let (sql, shape) = match spec.output {
            OutputKind::Availability => (self.availability_sql(&predicate), ResultShape::Count),
            OutputKind::Distribution(dimension) => (
                self.distribution_sql(dimension, &predicate, &mut binder),
                ResultShape::Buckets(dimension),
            ),
        };

        Ok(CompiledQuery {
            sql,
            params: binder.into_params(),
            shape,
        })
    }

    fn table(&self, name: &str) -> String {
        format!("\"{}\".\"{}\"", self.schema, name)
    }

    fn availability_sql(&self, predicate: &str) -> String {
        format!(
            "SELECT COUNT(DISTINCT p.{PERSON_ID}) AS n FROM {} p WHERE {predicate}",
            self.table(PERSON_TABLE)
        )
    }

    fn distribution_sql(&self, dimension: Dimension, predicate: &str, binder: &mut Binder) -> String {
        let person = self.table(PERSON_TABLE);
        match dimension {
            Dimension::Sex | Dimension::Race | Dimension::Ethnicity => {
                let column = person_column(match dimension {
                    Dimension::Race => PersonAttribute::Race,
                    Dimension::Ethnicity => PersonAttribute::Ethnicity,
                    _ => PersonAttribute::Sex,
                });
                format!(
                    "SELECT COALESCE(c.concept_name, p.{column}::text) AS bucket, \
                     COUNT(DISTINCT p.{PERSON_ID}) AS n \
                     FROM {person} p LEFT JOIN {} c ON c.concept_id = p.{column} \
                     WHERE {predicate} GROUP BY 1 ORDER BY 1",
                    self.table(CONCEPT_TABLE)
                )
            }
            Dimension::YearOfBirthDecade => format!(
                "SELECT ((p.year_of_birth / 10) * 10)::text AS bucket, \
                 COUNT(DISTINCT p.{PERSON_ID}) AS n \
                 FROM {person} p WHERE {predicate} GROUP BY 1 ORDER BY 1"
            ),
            Dimension::AgeBand { width } => {
                let age = age_expression(binder);
                let width = binder.bind(SqlParam::Float(f64::from(width)));
                format!(
                    "SELECT (floor({age} / {width}) * {width})::bigint::text AS bucket, \
                     COUNT(DISTINCT p.{PERSON_ID}) AS n \
                     FROM {person} p WHERE {predicate} GROUP BY 1 ORDER BY 1"
                )
            }
            Dimension::Concept(domain) => {
                let mapping = fact_table(domain);
                format!(
                    "SELECT f.{concept}::text AS bucket, COUNT(DISTINCT p.{PERSON_ID}) AS n \
                     FROM {person} p JOIN {table} f ON f.{PERSON_ID} = p.{PERSON_ID} \
                     WHERE f.{concept} <> 0 AND ({predicate}) GROUP BY 1 ORDER BY 1",
                    concept = mapping.concept_column,
                    table = self.table(mapping.table),
                )
            }
        }
    }

    fn cohort_predicate(&self, cohort: &Cohort, binder: &mut Binder) -> Result<String, TaskError> {
        // A cohort without any rule selects every subject, whatever the operators say.
        if cohort.has_no_rules() {
            return Ok("TRUE".to_string());
        }
        let parts = cohort
            .groups
            .iter()
            .map(|group| self.group_predicate(group, binder))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(combine(cohort.groups_operator, &parts))
    }

    fn group_predicate(&self, group: &RuleGroup, binder: &mut Binder) -> Result<String, TaskError> {
        let parts = group
            .rules
            .iter()
            .map(|rule| self.rule_predicate(rule, binder))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(combine(group.operator, &parts))
    }

    fn rule_predicate(&self, rule: &Rule, binder: &mut Binder) -> Result<String, TaskError> {
        match rule.domain {
            ConceptDomain::Fact(domain) => self.fact_predicate(domain, rule, binder),
            ConceptDomain::Person(attribute) => person_predicate(attribute, rule, binder),
            ConceptDomain::Age => age_predicate(rule, binder),
        }
    }

    fn fact_predicate(
        &self,
        domain: FactDomain,
        rule: &Rule,
        binder: &mut Binder,
    ) -> Result<String, TaskError> {
        let mapping = fact_table(domain);
        let concept = required_concept(rule)?;
        let concept = binder.bind(SqlParam::Int(concept));

        let (negated, mut conditions) = match rule.comparator {
            Comparator::Eq(None) => (false, Vec::new()),
            Comparator::Ne(None) => (true, Vec::new()),
            Comparator::Gt(_)
            | Comparator::Ge(_)
            | Comparator::Lt(_)
            | Comparator::Le(_)
            | Comparator::Between { .. } => {
                let Some(column) = mapping.value_column else {
                    return Err(unsupported(rule));
                };
                let condition = numeric_condition(&format!("f.{column}"), &rule.comparator, binder)?;
                (false, vec![condition])
            }
            Comparator::Before(date) => {
                let bound = binder.bind(SqlParam::Date(date));
                (false, vec![format!("f.{} < {bound}", mapping.date_column)])
            }
            Comparator::After(date) => {
                let bound = binder.bind(SqlParam::Date(date));
                (false, vec![format!("f.{} > {bound}", mapping.date_column)])
            }
            Comparator::Within { days } => {
                let reference = binder.reference_value();
                let start = reference
                    .checked_sub_days(Days::new(u64::from(days)))
                    .ok_or_else(|| {
                        TaskError::Compilation(format!(
                            "WITHIN {days} days of {reference} is out of range"
                        ))
                    })?;
                let start = binder.bind(SqlParam::Date(start));
                let end = binder.reference_date();
                (
                    false,
                    vec![format!(
                        "f.{column} >= {start} AND f.{column} <= {end}",
                        column = mapping.date_column
                    )],
                )
            }
            Comparator::Eq(Some(_)) | Comparator::Ne(Some(_)) => {
                return Err(TaskError::Compilation(format!(
                    "{}: concept rules take no operand",
                    rule.describe()
                )))
            }
        };

        conditions.extend(event_conditions(&rule.filter, &mapping, binder));

        Ok(exists_clause(&self.table(mapping.table), &mapping, &concept, negated, &conditions))
    }
}

/// Row-level conditions of a fact rule, all against the fact alias `f`
fn event_conditions(filter: &EventFilter, mapping: &FactTable, binder: &mut Binder) -> Vec<String> {
    let mut conditions = Vec::new();

    if let Some(range) = filter.age_at_event {
        let age = age_on(&format!("f.{}", mapping.date_column));
        conditions.push(age_range_condition(&age, range, binder));
    }

    match filter.type_concepts.as_slice() {
        [] => {}
        [single] => {
            let id = binder.bind(SqlParam::Int(single.value()));
            conditions.push(format!("f.{} = {id}", mapping.type_column));
        }
        many => {
            let ids = many
                .iter()
                .map(|id| binder.bind(SqlParam::Int(id.value())))
                .collect::<Vec<_>>()
                .join(", ");
            conditions.push(format!("f.{} IN ({ids})", mapping.type_column));
        }
    }

    conditions
}

fn age_range_condition(age: &str, range: AgeRange, binder: &mut Binder) -> String {
    let mut bind = |years: u32| binder.bind(SqlParam::Float(f64::from(years)));
    match (range.min, range.max) {
        (Some(min), Some(max)) => {
            let min = bind(min);
            let max = bind(max);
            format!("{age} BETWEEN {min} AND {max}")
        }
        (Some(min), None) => format!("{age} >= {}", bind(min)),
        (None, Some(max)) => format!("{age} <= {}", bind(max)),
        (None, None) => "TRUE".to_string(),
    }
}

fn exists_clause(
    table: &str,
    mapping: &FactTable,
    concept: &str,
    negated: bool,
    conditions: &[String],
) -> String {
    let mut sql = format!(
        "{}EXISTS (SELECT 1 FROM {table} f WHERE f.{PERSON_ID} = p.{PERSON_ID} AND f.{} = {concept}",
        if negated { "NOT " } else { "" },
        mapping.concept_column
    );
    for condition in conditions {
        sql.push_str(" AND ");
        sql.push_str(condition);
    }
    sql.push(')');
    sql
}

fn person_predicate(
    attribute: PersonAttribute,
    rule: &Rule,
    binder: &mut Binder,
) -> Result<String, TaskError> {
    let column = person_column(attribute);
    let operator = match rule.comparator {
        Comparator::Eq(None) => "=",
        Comparator::Ne(None) => "IS DISTINCT FROM",
        _ => return Err(unsupported(rule)),
    };
    let concept = binder.bind(SqlParam::Int(required_concept(rule)?));
    Ok(format!("p.{column} {operator} {concept}"))
}

fn age_predicate(rule: &Rule, binder: &mut Binder) -> Result<String, TaskError> {
    match rule.comparator {
        Comparator::Eq(Some(value)) => {
            let age = age_expression(binder);
            let value = bind_number(value, binder)?;
            Ok(format!("{age} = {value}"))
        }
        Comparator::Ne(Some(value)) => {
            let age = age_expression(binder);
            let value = bind_number(value, binder)?;
            Ok(format!("{age} <> {value}"))
        }
        Comparator::Gt(_)
        | Comparator::Ge(_)
        | Comparator::Lt(_)
        | Comparator::Le(_)
        | Comparator::Between { .. } => {
            let age = age_expression(binder);
            numeric_condition(&age, &rule.comparator, binder)
        }
        Comparator::Eq(None) | Comparator::Ne(None) => Err(TaskError::Compilation(format!(
            "{}: age comparison without a value",
            rule.describe()
        ))),
        Comparator::Before(_) | Comparator::After(_) | Comparator::Within { .. } => {
            Err(unsupported(rule))
        }
    }
}

/// Age in whole years at the reference date, from the person's birth fields
fn age_expression(binder: &mut Binder) -> String {
    let reference = binder.reference_date();
    age_on(&reference)
}

/// Age in whole years on the date `date` evaluates to
fn age_on(date: &str) -> String {
    format!(
        "date_part('year', age({date}, make_date(p.year_of_birth, \
         COALESCE(p.month_of_birth, 1), COALESCE(p.day_of_birth, 1))))"
    )
}

fn numeric_condition(
    operand: &str,
    comparator: &Comparator,
    binder: &mut Binder,
) -> Result<String, TaskError> {
    let (operator, value) = match *comparator {
        Comparator::Gt(v) => (">", v),
        Comparator::Ge(v) => (">=", v),
        Comparator::Lt(v) => ("<", v),
        Comparator::Le(v) => ("<=", v),
        Comparator::Between { min, max } => {
            let min = bind_number(min, binder)?;
            let max = bind_number(max, binder)?;
            return Ok(format!("{operand} BETWEEN {min} AND {max}"));
        }
        _ => {
            return Err(TaskError::Compilation(format!(
                "{} is not a numeric comparator",
                comparator.name()
            )))
        }
    };
    let value = bind_number(value, binder)?;
    Ok(format!("{operand} {operator} {value}"))
}

fn bind_number(value: f64, binder: &mut Binder) -> Result<String, TaskError> {
    if !value.is_finite() {
        return Err(TaskError::Compilation(format!(
            "non-finite number {value} in query"
        )));
    }
    Ok(binder.bind(SqlParam::Float(value)))
}

fn required_concept(rule: &Rule) -> Result<i64, TaskError> {
    rule.concept
        .map(|c| c.value())
        .ok_or_else(|| TaskError::Compilation(format!("{}: missing concept id", rule.describe())))
}

fn unsupported(rule: &Rule) -> TaskError {
    TaskError::UnsupportedRule(format!(
        "{} does not support the {} comparator",
        rule.domain,
        rule.comparator.name()
    ))
}

fn combine(operator: BoolOperator, parts: &[String]) -> String {
    match parts {
        [] => {
            let vacuous = if operator.identity() { "TRUE" } else { "FALSE" };
            vacuous.to_string()
        }
        [single] => format!("({single})"),
        _ => {
            let joined = parts
                .iter()
                .map(|part| format!("({part})"))
                .collect::<Vec<_>>()
                .join(&format!(" {} ", operator.sql_keyword()));
            format!("({joined})")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::ConceptId;
    use chrono::NaiveDate;
    use test_case::test_case;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()
    }

    fn concept_rule(domain: ConceptDomain, id: i64, comparator: Comparator) -> Rule {
        Rule::new(domain, Some(ConceptId::new(id).unwrap()), comparator)
    }

    fn age_rule(comparator: Comparator) -> Rule {
        Rule::new(ConceptDomain::Age, None, comparator)
    }

    fn spec(groups_operator: BoolOperator, groups: Vec<RuleGroup>, output: OutputKind) -> QuerySpec {
        QuerySpec {
            cohort: Cohort {
                groups_operator,
                groups,
            },
            output,
            reference_date: reference(),
        }
    }

    fn single_rule(rule: Rule) -> QuerySpec {
        spec(
            BoolOperator::And,
            vec![RuleGroup {
                operator: BoolOperator::And,
                rules: vec![rule],
            }],
            OutputKind::Availability,
        )
    }

    fn compiler() -> SqlCompiler {
        SqlCompiler::new("cdm").unwrap()
    }

    #[test]
    fn test_schema_must_be_identifier() {
        assert!(SqlCompiler::new("cdm_5").is_ok());
        assert!(SqlCompiler::new("cdm; DROP TABLE person").is_err());
        assert!(SqlCompiler::new("\"quoted\"").is_err());
        assert!(SqlCompiler::new("").is_err());
    }

    #[test]
    fn test_identifier_regex_is_built_once() {
        let first = identifier_regex().unwrap();
        let second = identifier_regex().unwrap();
        assert!(std::ptr::eq(first, second));
        assert!(is_valid_identifier("CDM_Mixed"));
    }

    #[test]
    fn test_schema_is_quoted_verbatim() {
        let compiled = SqlCompiler::new("CDM")
            .unwrap()
            .compile(&spec(BoolOperator::And, vec![], OutputKind::Availability))
            .unwrap();
        assert!(compiled.sql.contains("FROM \"CDM\".\"person\" p"));
    }

    #[test]
    fn test_empty_cohort_counts_everyone() {
        let compiled = compiler()
            .compile(&spec(BoolOperator::And, vec![], OutputKind::Availability))
            .unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT COUNT(DISTINCT p.person_id) AS n FROM \"cdm\".\"person\" p WHERE TRUE"
        );
        assert!(compiled.params.is_empty());
        assert_eq!(compiled.shape, ResultShape::Count);
    }

    #[test]
    fn test_cohort_of_empty_groups_counts_everyone() {
        let groups = vec![RuleGroup {
            operator: BoolOperator::Or,
            rules: vec![],
        }];
        let compiled = compiler()
            .compile(&spec(BoolOperator::And, groups, OutputKind::Availability))
            .unwrap();
        assert!(compiled.sql.ends_with("WHERE TRUE"));
    }

    #[test]
    fn test_empty_groups_are_vacuous() {
        let rule = concept_rule(ConceptDomain::Fact(FactDomain::Condition), 201820, Comparator::Eq(None));
        let groups = vec![
            RuleGroup {
                operator: BoolOperator::And,
                rules: vec![rule],
            },
            RuleGroup {
                operator: BoolOperator::And,
                rules: vec![],
            },
            RuleGroup {
                operator: BoolOperator::Or,
                rules: vec![],
            },
        ];
        let compiled = compiler()
            .compile(&spec(BoolOperator::Or, groups, OutputKind::Availability))
            .unwrap();
        assert!(compiled.sql.contains(" OR (TRUE) OR (FALSE))"));
    }

    #[test]
    fn test_diabetic_adults() {
        let groups = vec![RuleGroup {
            operator: BoolOperator::And,
            rules: vec![
                concept_rule(ConceptDomain::Fact(FactDomain::Condition), 201820, Comparator::Eq(None)),
                age_rule(Comparator::Ge(18.0)),
            ],
        }];
        let compiled = compiler()
            .compile(&spec(BoolOperator::And, groups, OutputKind::Availability))
            .unwrap();

        assert!(compiled.sql.contains(
            "EXISTS (SELECT 1 FROM \"cdm\".\"condition_occurrence\" f \
             WHERE f.person_id = p.person_id AND f.condition_concept_id = $1::bigint)"
        ));
        assert!(compiled.sql.contains("age($2::date, make_date(p.year_of_birth"));
        assert!(compiled.sql.contains(">= $3::float8"));
        assert_eq!(
            compiled.params,
            vec![
                SqlParam::Int(201820),
                SqlParam::Date(reference()),
                SqlParam::Float(18.0)
            ]
        );
    }

    #[test]
    fn test_or_group_counts_each_subject_once() {
        let groups = vec![RuleGroup {
            operator: BoolOperator::Or,
            rules: vec![
                concept_rule(ConceptDomain::Fact(FactDomain::Condition), 201820, Comparator::Eq(None)),
                concept_rule(ConceptDomain::Fact(FactDomain::Drug), 1503297, Comparator::Eq(None)),
            ],
        }];
        let compiled = compiler()
            .compile(&spec(BoolOperator::And, groups, OutputKind::Availability))
            .unwrap();

        // Rules stay predicates on the person row; no fact table is joined.
        assert!(compiled.sql.starts_with(
            "SELECT COUNT(DISTINCT p.person_id) AS n FROM \"cdm\".\"person\" p WHERE"
        ));
        assert!(!compiled.sql.contains(" JOIN "));
        assert!(!compiled.sql.contains("UNION"));
        assert!(compiled.sql.contains(") OR (EXISTS"));
    }

    #[test]
    fn test_literals_are_never_inlined() {
        let groups = vec![RuleGroup {
            operator: BoolOperator::And,
            rules: vec![
                concept_rule(ConceptDomain::Fact(FactDomain::Measurement), 3004410, Comparator::Between { min: 6.5, max: 14.25 }),
                concept_rule(ConceptDomain::Fact(FactDomain::Procedure), 4012345, Comparator::After(NaiveDate::from_ymd_opt(2019, 7, 4).unwrap())),
                concept_rule(ConceptDomain::Person(PersonAttribute::Race), 8527, Comparator::Ne(None)),
            ],
        }];
        let compiled = compiler()
            .compile(&spec(BoolOperator::And, groups, OutputKind::Availability))
            .unwrap();
        for literal in ["3004410", "6.5", "14.25", "2019-07-04", "4012345", "8527"] {
            assert!(!compiled.sql.contains(literal), "{literal} inlined in {}", compiled.sql);
        }
        assert!(compiled.sql.contains("p.race_concept_id IS DISTINCT FROM $"));
        assert_eq!(compiled.params.len(), 6);
    }

    #[test]
    fn test_within_uses_reference_window() {
        let rule = concept_rule(ConceptDomain::Fact(FactDomain::Drug), 1, Comparator::Within { days: 30 });
        let compiled = compiler().compile(&single_rule(rule)).unwrap();
        assert!(compiled
            .sql
            .contains("f.drug_exposure_start_date >= $2::date AND f.drug_exposure_start_date <= $3::date"));
        assert_eq!(
            compiled.params[1],
            SqlParam::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        );
        assert_eq!(compiled.params[2], SqlParam::Date(reference()));
    }

    #[test]
    fn test_age_at_event_uses_event_date() {
        let mut rule = concept_rule(ConceptDomain::Fact(FactDomain::Condition), 201820, Comparator::Eq(None));
        rule.filter.age_at_event = Some(AgeRange {
            min: Some(18),
            max: Some(40),
        });
        let compiled = compiler().compile(&single_rule(rule)).unwrap();

        assert!(compiled.sql.contains(
            "AND f.condition_concept_id = $1::bigint \
             AND date_part('year', age(f.condition_start_date, make_date(p.year_of_birth"
        ));
        assert!(compiled.sql.contains("))) BETWEEN $2::float8 AND $3::float8)"));
        assert_eq!(
            compiled.params,
            vec![SqlParam::Int(201820), SqlParam::Float(18.0), SqlParam::Float(40.0)]
        );
    }

    #[test_case(Some(65), None, "))) >= $2::float8)" ; "lower bound only")]
    #[test_case(None, Some(2), "))) <= $2::float8)" ; "upper bound only")]
    fn test_open_age_at_event(min: Option<u32>, max: Option<u32>, expected: &str) {
        let mut rule = concept_rule(ConceptDomain::Fact(FactDomain::Drug), 7, Comparator::Eq(None));
        rule.filter.age_at_event = Some(AgeRange { min, max });
        let compiled = compiler().compile(&single_rule(rule)).unwrap();
        assert!(compiled.sql.contains("age(f.drug_exposure_start_date, make_date("));
        assert!(compiled.sql.contains(expected), "{}", compiled.sql);
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn test_type_concepts_are_bound() {
        let mut rule = concept_rule(ConceptDomain::Fact(FactDomain::Condition), 201820, Comparator::Eq(None));
        rule.filter.type_concepts = vec![ConceptId::new(32020).unwrap(), ConceptId::new(32817).unwrap()];
        let compiled = compiler().compile(&single_rule(rule.clone())).unwrap();
        assert!(compiled
            .sql
            .contains("AND f.condition_type_concept_id IN ($2::bigint, $3::bigint))"));
        assert!(!compiled.sql.contains("32020"));
        assert_eq!(
            compiled.params,
            vec![SqlParam::Int(201820), SqlParam::Int(32020), SqlParam::Int(32817)]
        );

        rule.filter.type_concepts.truncate(1);
        let compiled = compiler().compile(&single_rule(rule)).unwrap();
        assert!(compiled.sql.contains("AND f.condition_type_concept_id = $2::bigint)"));
    }

    #[test]
    fn test_negated_rule_keeps_event_filters_inside_subquery() {
        let mut rule = concept_rule(ConceptDomain::Fact(FactDomain::Condition), 201820, Comparator::Ne(None));
        rule.filter.age_at_event = Some(AgeRange {
            min: None,
            max: Some(30),
        });
        rule.filter.type_concepts = vec![ConceptId::new(32020).unwrap()];
        let compiled = compiler().compile(&single_rule(rule)).unwrap();

        assert!(compiled.sql.contains("(NOT EXISTS (SELECT 1 FROM \"cdm\".\"condition_occurrence\" f"));
        assert!(compiled.sql.contains(
            "<= $2::float8 AND f.condition_type_concept_id = $3::bigint)"
        ));
    }

    #[test]
    fn test_reference_date_bound_once() {
        let groups = vec![RuleGroup {
            operator: BoolOperator::And,
            rules: vec![age_rule(Comparator::Ge(18.0)), age_rule(Comparator::Lt(65.0))],
        }];
        let compiled = compiler()
            .compile(&spec(
                BoolOperator::And,
                groups,
                OutputKind::Distribution(Dimension::AgeBand { width: 10 }),
            ))
            .unwrap();
        let dates = compiled
            .params
            .iter()
            .filter(|p| matches!(p, SqlParam::Date(_)))
            .count();
        assert_eq!(dates, 1);
    }

    #[test_case(ConceptDomain::Fact(FactDomain::Condition), Comparator::Eq(None) => true ; "condition eq")]
    #[test_case(ConceptDomain::Fact(FactDomain::Condition), Comparator::Ne(None) => true ; "condition ne")]
    #[test_case(ConceptDomain::Fact(FactDomain::Condition), Comparator::Gt(1.0) => false ; "condition gt")]
    #[test_case(ConceptDomain::Fact(FactDomain::Condition), Comparator::Within { days: 7 } => true ; "condition within")]
    #[test_case(ConceptDomain::Fact(FactDomain::Drug), Comparator::Between { min: 1.0, max: 2.0 } => false ; "drug between")]
    #[test_case(ConceptDomain::Fact(FactDomain::Drug), Comparator::Before(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()) => true ; "drug before")]
    #[test_case(ConceptDomain::Fact(FactDomain::Measurement), Comparator::Gt(7.0) => true ; "measurement gt")]
    #[test_case(ConceptDomain::Fact(FactDomain::Measurement), Comparator::Between { min: 1.0, max: 2.0 } => true ; "measurement between")]
    #[test_case(ConceptDomain::Fact(FactDomain::Observation), Comparator::Le(3.0) => true ; "observation le")]
    #[test_case(ConceptDomain::Fact(FactDomain::Procedure), Comparator::Lt(3.0) => false ; "procedure lt")]
    #[test_case(ConceptDomain::Fact(FactDomain::Procedure), Comparator::After(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()) => true ; "procedure after")]
    #[test_case(ConceptDomain::Person(PersonAttribute::Sex), Comparator::Eq(None) => true ; "sex eq")]
    #[test_case(ConceptDomain::Person(PersonAttribute::Ethnicity), Comparator::Ne(None) => true ; "ethnicity ne")]
    #[test_case(ConceptDomain::Person(PersonAttribute::Sex), Comparator::Gt(1.0) => false ; "sex gt")]
    #[test_case(ConceptDomain::Person(PersonAttribute::Race), Comparator::Within { days: 1 } => false ; "race within")]
    fn test_concept_rule_support(domain: ConceptDomain, comparator: Comparator) -> bool {
        let rule = concept_rule(domain, 42, comparator);
        match compiler().compile(&single_rule(rule)) {
            Ok(_) => true,
            Err(TaskError::UnsupportedRule(_)) => false,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    #[test_case(Comparator::Eq(Some(40.0)) => true ; "age eq")]
    #[test_case(Comparator::Ne(Some(40.0)) => true ; "age ne")]
    #[test_case(Comparator::Ge(18.0) => true ; "age ge")]
    #[test_case(Comparator::Between { min: 18.0, max: 65.0 } => true ; "age between")]
    #[test_case(Comparator::Before(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()) => false ; "age before")]
    #[test_case(Comparator::Within { days: 3 } => false ; "age within")]
    fn test_age_rule_support(comparator: Comparator) -> bool {
        match compiler().compile(&single_rule(age_rule(comparator))) {
            Ok(_) => true,
            Err(TaskError::UnsupportedRule(_)) => false,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_internal_inconsistencies_are_compilation_errors() {
        let missing_concept = Rule::new(ConceptDomain::Fact(FactDomain::Drug), None, Comparator::Eq(None));
        assert!(matches!(
            compiler().compile(&single_rule(missing_concept)),
            Err(TaskError::Compilation(_))
        ));

        let non_finite = age_rule(Comparator::Gt(f64::NAN));
        assert!(matches!(
            compiler().compile(&single_rule(non_finite)),
            Err(TaskError::Compilation(_))
        ));

        let valueless_age = age_rule(Comparator::Eq(None));
        assert!(matches!(
            compiler().compile(&single_rule(valueless_age)),
            Err(TaskError::Compilation(_))
        ));
    }

    #[test]
    fn test_distribution_by_sex() {
        let compiled = compiler()
            .compile(&spec(
                BoolOperator::And,
                vec![],
                OutputKind::Distribution(Dimension::Sex),
            ))
            .unwrap();
        assert!(compiled.sql.contains("COALESCE(c.concept_name, p.gender_concept_id::text) AS bucket"));
        assert!(compiled.sql.contains("LEFT JOIN \"cdm\".\"concept\" c"));
        assert!(compiled.sql.ends_with("GROUP BY 1 ORDER BY 1"));
        assert_eq!(compiled.shape, ResultShape::Buckets(Dimension::Sex));
    }

    #[test]
    fn test_distribution_by_concept() {
        let compiled = compiler()
            .compile(&spec(
                BoolOperator::And,
                vec![],
                OutputKind::Distribution(Dimension::Concept(FactDomain::Drug)),
            ))
            .unwrap();
        assert!(compiled.sql.contains("JOIN \"cdm\".\"drug_exposure\" f ON f.person_id = p.person_id"));
        assert!(compiled.sql.contains("COUNT(DISTINCT p.person_id)"));
    }

    #[test]
    fn test_age_band_width_is_bound() {
        let compiled = compiler()
            .compile(&spec(
                BoolOperator::And,
                vec![],
                OutputKind::Distribution(Dimension::AgeBand { width: 5 }),
            ))
            .unwrap();
        assert!(compiled.sql.contains("/ $2::float8) * $2::float8)::bigint::text"));
        assert_eq!(compiled.params, vec![SqlParam::Date(reference()), SqlParam::Float(5.0)]);
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let rule = concept_rule(ConceptDomain::Fact(FactDomain::Observation), 7, Comparator::Ge(2.0));
        let query = single_rule(rule);
        assert_eq!(compiler().compile(&query).unwrap(), compiler().compile(&query).unwrap());
    }
}
