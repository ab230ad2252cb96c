//! Wire format and total validation of inbound task messages
//!
//! Payloads are first deserialized into loose wire structs (every field
//! optional) and then validated in one pass that visits every group and
//! rule, collecting all problems. Any problem yields a single
//! [`TaskError::MalformedQuery`] listing each offending path.

use super::model::{
    AgeRange, BoolOperator, Cohort, Comparator, ConceptDomain, Dimension, EventFilter,
    OutputKind, QueryLimits, QuerySpec, Rule, RuleGroup,
};
use crate::domain::errors::TaskError;
use crate::domain::ids::{CollectionId, ConceptId, CorrelationId};
use chrono::{Days, NaiveDate};
use serde::Deserialize;
use serde_json::Value;

const DATE_FORMAT: &str = "%Y-%m-%d";
const MAX_BAND_WIDTH: u32 = 50;
const MAX_WITHIN_DAYS: u32 = 54_750;
const MAX_AGE: u64 = 150;

/// Validated routing part of an inbound message
///
/// The query body is kept as raw JSON so that routing information survives
/// even when the query itself turns out to be malformed.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Correlation id echoed on the result
    pub correlation_id: CorrelationId,
    /// Destination the result is published to
    pub reply_to: CollectionId,
    /// Unvalidated query body
    pub query: Value,
}

/// A fully validated inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMessage {
    /// Correlation id echoed on the result
    pub correlation_id: CorrelationId,
    /// Destination the result is published to
    pub reply_to: CollectionId,
    /// Validated query
    pub query: QuerySpec,
}

impl TaskMessage {
    /// Parses and validates a complete inbound payload
    pub fn parse(
        payload: &[u8],
        received_on: NaiveDate,
        limits: &QueryLimits,
    ) -> Result<Self, TaskError> {
        let envelope = parse_envelope(payload)?;
        let query = parse_query(&envelope.query, received_on, limits)?;
        Ok(Self {
            correlation_id: envelope.correlation_id,
            reply_to: envelope.reply_to,
            query,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(default, alias = "uuid")]
    correlation_id: Option<String>,
    #[serde(default, alias = "collection")]
    reply_to: Option<String>,
    #[serde(default)]
    query: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireQuery {
    #[serde(default)]
    output: Option<WireOutput>,
    #[serde(default)]
    reference_date: Option<String>,
    #[serde(default)]
    cohort: Option<WireCohort>,
}

#[derive(Debug, Deserialize)]
struct WireOutput {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    dimension: Option<String>,
    #[serde(default)]
    band_width: Option<u32>,
    #[serde(default)]
    domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCohort {
    #[serde(default)]
    groups_operator: Option<String>,
    #[serde(default)]
    groups: Vec<WireGroup>,
}

#[derive(Debug, Deserialize)]
struct WireGroup {
    #[serde(default)]
    rules_operator: Option<String>,
    #[serde(default)]
    rules: Vec<WireRule>,
}

#[derive(Debug, Deserialize)]
struct WireRule {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    concept_id: Option<Value>,
    #[serde(default)]
    comparator: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    age_at_event: Option<Value>,
    #[serde(default)]
    type_concept_ids: Option<Value>,
}

/// Extracts the routing fields of an inbound payload
///
/// # Errors
///
/// Returns `MalformedQuery` if the payload is not a JSON object, or the
/// correlation id, destination or query body is missing or invalid.
pub fn parse_envelope(payload: &[u8]) -> Result<Envelope, TaskError> {
    let wire: WireEnvelope = serde_json::from_slice(payload)
        .map_err(|e| TaskError::MalformedQuery(format!("invalid message: {e}")))?;

    let mut problems = Problems::default();

    let correlation_id = match wire.correlation_id {
        Some(id) => CorrelationId::new(id).map_err(|e| problems.push("correlation_id", e)).ok(),
        None => {
            problems.push("correlation_id", "is required");
            None
        }
    };
    let reply_to = match wire.reply_to {
        Some(id) => CollectionId::new(id).map_err(|e| problems.push("reply_to", e)).ok(),
        None => {
            problems.push("reply_to", "is required");
            None
        }
    };
    if wire.query.is_none() {
        problems.push("query", "is required");
    }

    problems.finish()?;
    match (correlation_id, reply_to, wire.query) {
        (Some(correlation_id), Some(reply_to), Some(query)) => Ok(Envelope {
            correlation_id,
            reply_to,
            query,
        }),
        _ => Err(TaskError::MalformedQuery("incomplete message".to_string())),
    }
}

/// Best-effort extraction of the correlation id from a payload that may be
/// otherwise malformed
pub fn peek_correlation_id(payload: &[u8]) -> Option<CorrelationId> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let id = value
        .get("correlation_id")
        .or_else(|| value.get("uuid"))?
        .as_str()?;
    CorrelationId::new(id).ok()
}

/// Best-effort extraction of the destination from a payload that may be
/// otherwise malformed
pub fn peek_reply_to(payload: &[u8]) -> Option<CollectionId> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let id = value
        .get("reply_to")
        .or_else(|| value.get("collection"))?
        .as_str()?;
    CollectionId::new(id).ok()
}

/// Validates a query body into a [`QuerySpec`]
///
/// `received_on` is used as the reference date when the body does not set
/// one. A missing cohort matches every subject.
pub fn parse_query(
    body: &Value,
    received_on: NaiveDate,
    limits: &QueryLimits,
) -> Result<QuerySpec, TaskError> {
    let wire: WireQuery = serde_json::from_value(body.clone())
        .map_err(|e| TaskError::MalformedQuery(format!("query: {e}")))?;

    let mut problems = Problems::default();

    let output = match &wire.output {
        Some(output) => parse_output(output, &mut problems),
        None => {
            problems.push("query.output", "is required");
            None
        }
    };

    let reference_date = match &wire.reference_date {
        Some(raw) => match NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT) {
            Ok(date) => date,
            Err(_) => {
                problems.push(
                    "query.reference_date",
                    format!("'{raw}' is not a YYYY-MM-DD date"),
                );
                received_on
            }
        },
        None => received_on,
    };

    let cohort = match &wire.cohort {
        Some(cohort) => parse_cohort(cohort, limits, reference_date, &mut problems),
        None => Cohort::everyone(),
    };

    problems.finish()?;
    match output {
        Some(output) => Ok(QuerySpec {
            cohort,
            output,
            reference_date,
        }),
        None => Err(TaskError::MalformedQuery("query.output: is required".to_string())),
    }
}

fn parse_output(output: &WireOutput, problems: &mut Problems) -> Option<OutputKind> {
    let kind = match &output.kind {
        Some(kind) => kind.trim().to_ascii_uppercase(),
        None => {
            problems.push("query.output.kind", "is required");
            return None;
        }
    };

    match kind.as_str() {
        "AVAILABILITY" => Some(OutputKind::Availability),
        "DISTRIBUTION" => {
            let dimension = parse_dimension(output, problems)?;
            Some(OutputKind::Distribution(dimension))
        }
        other => {
            problems.push(
                "query.output.kind",
                format!("unknown output kind '{other}', expected AVAILABILITY or DISTRIBUTION"),
            );
            None
        }
    }
}

fn parse_dimension(output: &WireOutput, problems: &mut Problems) -> Option<Dimension> {
    let Some(name) = &output.dimension else {
        problems.push("query.output.dimension", "is required for DISTRIBUTION");
        return None;
    };

    match name.trim().to_ascii_uppercase().as_str() {
        "SEX" | "GENDER" => Some(Dimension::Sex),
        "RACE" => Some(Dimension::Race),
        "ETHNICITY" => Some(Dimension::Ethnicity),
        "YEAR_OF_BIRTH_DECADE" => Some(Dimension::YearOfBirthDecade),
        "AGE_BAND" => {
            let width = output.band_width.unwrap_or(Dimension::DEFAULT_BAND_WIDTH);
            if width == 0 || width > MAX_BAND_WIDTH {
                problems.push(
                    "query.output.band_width",
                    format!("must be between 1 and {MAX_BAND_WIDTH}, got {width}"),
                );
                return None;
            }
            Some(Dimension::AgeBand { width })
        }
        "CONCEPT" => {
            let Some(domain) = &output.domain else {
                problems.push("query.output.domain", "is required for the CONCEPT dimension");
                return None;
            };
            match domain.parse::<ConceptDomain>() {
                Ok(ConceptDomain::Fact(fact)) => Some(Dimension::Concept(fact)),
                Ok(other) => {
                    problems.push(
                        "query.output.domain",
                        format!("'{other}' is not a clinical fact domain"),
                    );
                    None
                }
                Err(e) => {
                    problems.push("query.output.domain", e);
                    None
                }
            }
        }
        other => {
            problems.push(
                "query.output.dimension",
                format!("unknown dimension '{other}'"),
            );
            None
        }
    }
}

fn parse_cohort(
    cohort: &WireCohort,
    limits: &QueryLimits,
    reference_date: NaiveDate,
    problems: &mut Problems,
) -> Cohort {
    let groups_operator = parse_operator(
        cohort.groups_operator.as_deref(),
        "cohort.groups_operator",
        problems,
    );

    if cohort.groups.len() > limits.max_groups {
        problems.push(
            "cohort.groups",
            format!(
                "{} groups exceed the limit of {}",
                cohort.groups.len(),
                limits.max_groups
            ),
        );
    }

    let groups = cohort
        .groups
        .iter()
        .enumerate()
        .map(|(index, group)| parse_group(index, group, limits, reference_date, problems))
        .collect();

    Cohort {
        groups_operator,
        groups,
    }
}

fn parse_group(
    index: usize,
    group: &WireGroup,
    limits: &QueryLimits,
    reference_date: NaiveDate,
    problems: &mut Problems,
) -> RuleGroup {
    let path = format!("cohort.groups[{index}]");
    let operator = parse_operator(
        group.rules_operator.as_deref(),
        &format!("{path}.rules_operator"),
        problems,
    );

    if group.rules.len() > limits.max_rules_per_group {
        problems.push(
            &format!("{path}.rules"),
            format!(
                "{} rules exceed the limit of {}",
                group.rules.len(),
                limits.max_rules_per_group
            ),
        );
    }

    let rules = group
        .rules
        .iter()
        .enumerate()
        .filter_map(|(rule_index, rule)| {
            let rule_path = format!("{path}.rules[{rule_index}]");
            parse_rule(&rule_path, rule, reference_date, problems)
        })
        .collect();

    RuleGroup { operator, rules }
}

fn parse_operator(raw: Option<&str>, path: &str, problems: &mut Problems) -> BoolOperator {
    match raw {
        Some(raw) => raw.parse().unwrap_or_else(|e: String| {
            problems.push(path, e);
            BoolOperator::And
        }),
        None => {
            problems.push(path, "is required");
            BoolOperator::And
        }
    }
}

fn parse_rule(
    path: &str,
    rule: &WireRule,
    reference_date: NaiveDate,
    problems: &mut Problems,
) -> Option<Rule> {
    let before = problems.len();

    let domain = match &rule.domain {
        Some(raw) => raw
            .parse::<ConceptDomain>()
            .map_err(|e| problems.push(&format!("{path}.domain"), e))
            .ok(),
        None => {
            problems.push(&format!("{path}.domain"), "is required");
            None
        }
    };

    let concept = match (&rule.concept_id, domain) {
        (Some(_), Some(ConceptDomain::Age)) => {
            problems.push(&format!("{path}.concept_id"), "is not allowed for AGE");
            None
        }
        (Some(raw), _) => parse_concept_id(raw)
            .map_err(|e| problems.push(&format!("{path}.concept_id"), e))
            .ok(),
        (None, Some(domain)) if domain.requires_concept() => {
            problems.push(
                &format!("{path}.concept_id"),
                format!("is required for {domain}"),
            );
            None
        }
        (None, _) => None,
    };

    let comparator = match &rule.comparator {
        Some(name) => parse_comparator(
            path,
            name,
            rule.value.as_ref(),
            domain,
            reference_date,
            problems,
        ),
        None => {
            problems.push(&format!("{path}.comparator"), "is required");
            None
        }
    };

    let filter = parse_event_filter(path, rule, domain, problems);

    if problems.len() > before {
        return None;
    }
    Some(Rule {
        domain: domain?,
        concept,
        comparator: comparator?,
        filter,
    })
}

fn parse_event_filter(
    path: &str,
    rule: &WireRule,
    domain: Option<ConceptDomain>,
    problems: &mut Problems,
) -> EventFilter {
    let mut filter = EventFilter::default();
    let on_fact = matches!(domain, Some(ConceptDomain::Fact(_)));

    if let Some(raw) = &rule.age_at_event {
        let field = format!("{path}.age_at_event");
        match (on_fact, domain) {
            (false, Some(domain)) => problems.push(&field, format!("is not allowed for {domain}")),
            (false, None) => {}
            (true, _) => {
                filter.age_at_event = age_range(raw).map_err(|e| problems.push(&field, e)).ok();
            }
        }
    }

    if let Some(raw) = &rule.type_concept_ids {
        let field = format!("{path}.type_concept_ids");
        match (on_fact, domain) {
            (false, Some(domain)) => problems.push(&field, format!("is not allowed for {domain}")),
            (false, None) => {}
            (true, _) => {
                filter.type_concepts = type_concepts(raw)
                    .map_err(|e| problems.push(&field, e))
                    .unwrap_or_default();
            }
        }
    }

    filter
}

fn parse_concept_id(raw: &Value) -> Result<ConceptId, String> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| format!("{n} is not an integer"))
            .and_then(ConceptId::new),
        Value::String(s) => s.parse(),
        other => Err(format!("expected an integer, got {other}")),
    }
}

fn parse_comparator(
    path: &str,
    name: &str,
    value: Option<&Value>,
    domain: Option<ConceptDomain>,
    reference_date: NaiveDate,
    problems: &mut Problems,
) -> Option<Comparator> {
    let value_path = format!("{path}.value");
    let upper = name.trim().to_ascii_uppercase();

    let result = match upper.as_str() {
        "EQ" | "NE" => {
            let operand = match (domain, value) {
                (Some(ConceptDomain::Age), Some(v)) => number(v).map(Some),
                (Some(ConceptDomain::Age), None) => Err("is required for AGE".to_string()),
                (_, Some(_)) => Err(format!("is not allowed for {upper} on a concept")),
                (_, None) => Ok(None),
            };
            operand.map(|v| {
                if upper == "EQ" {
                    Comparator::Eq(v)
                } else {
                    Comparator::Ne(v)
                }
            })
        }
        "GT" => required(value).and_then(number).map(Comparator::Gt),
        "GE" => required(value).and_then(number).map(Comparator::Ge),
        "LT" => required(value).and_then(number).map(Comparator::Lt),
        "LE" => required(value).and_then(number).map(Comparator::Le),
        "BETWEEN" => required(value).and_then(range),
        "BEFORE" => required(value).and_then(date).map(Comparator::Before),
        "AFTER" => required(value).and_then(date).map(Comparator::After),
        "WITHIN" => required(value)
            .and_then(|v| days(v, reference_date))
            .map(|days| Comparator::Within { days }),
        _ => {
            problems.push(
                &format!("{path}.comparator"),
                format!("unknown comparator '{}'", name.trim()),
            );
            return None;
        }
    };

    result.map_err(|e| problems.push(&value_path, e)).ok()
}

fn required(value: Option<&Value>) -> Result<&Value, String> {
    value.ok_or_else(|| "is required".to_string())
}

fn number(value: &Value) -> Result<f64, String> {
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("expected a number, got {value}"))
}

fn range(value: &Value) -> Result<Comparator, String> {
    let min = value
        .get("min")
        .ok_or_else(|| "BETWEEN requires {\"min\", \"max\"}".to_string())
        .and_then(number)?;
    let max = value
        .get("max")
        .ok_or_else(|| "BETWEEN requires {\"min\", \"max\"}".to_string())
        .and_then(number)?;
    if min > max {
        return Err(format!("min {min} is greater than max {max}"));
    }
    Ok(Comparator::Between { min, max })
}

fn date(value: &Value) -> Result<NaiveDate, String> {
    let raw = value
        .as_str()
        .ok_or_else(|| format!("expected a YYYY-MM-DD date, got {value}"))?;
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|_| format!("'{raw}' is not a YYYY-MM-DD date"))
}

fn days(value: &Value, reference_date: NaiveDate) -> Result<u32, String> {
    let days = value
        .as_u64()
        .and_then(|d| u32::try_from(d).ok())
        .ok_or_else(|| format!("expected a non-negative number of days, got {value}"))?;
    if days > MAX_WITHIN_DAYS {
        return Err(format!("window of {days} days exceeds {MAX_WITHIN_DAYS}"));
    }
    reference_date
        .checked_sub_days(Days::new(u64::from(days)))
        .map(|_| days)
        .ok_or_else(|| format!("window of {days} days before {reference_date} is out of range"))
}

fn age_range(value: &Value) -> Result<AgeRange, String> {
    let Value::Object(bounds) = value else {
        return Err(format!("expected {{\"min\", \"max\"}}, got {value}"));
    };
    let bound = |name: &str| -> Result<Option<u32>, String> {
        match bounds.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .filter(|age| *age <= MAX_AGE)
                .and_then(|age| u32::try_from(age).ok())
                .map(Some)
                .ok_or_else(|| format!("{name} must be a whole number of years up to {MAX_AGE}, got {v}")),
        }
    };
    let range = AgeRange {
        min: bound("min")?,
        max: bound("max")?,
    };
    match (range.min, range.max) {
        (None, None) => Err("requires min, max or both".to_string()),
        (Some(min), Some(max)) if min > max => {
            Err(format!("min {min} is greater than max {max}"))
        }
        _ => Ok(range),
    }
}

fn type_concepts(value: &Value) -> Result<Vec<ConceptId>, String> {
    let Value::Array(items) = value else {
        return Err(format!("expected an array of concept ids, got {value}"));
    };
    let mut ids = items
        .iter()
        .map(parse_concept_id)
        .collect::<Result<Vec<_>, _>>()?;
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

#[derive(Debug, Default)]
struct Problems(Vec<String>);

impl Problems {
    fn push(&mut self, path: &str, message: impl std::fmt::Display) {
        self.0.push(format!("{path}: {message}"));
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn finish(self) -> Result<(), TaskError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(TaskError::MalformedQuery(self.0.join("; ")))
        }
    }
}
