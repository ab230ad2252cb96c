//! Validated query specification types
//!
//! Instances of these types only come out of [`super::parse`], so everything
//! downstream (the SQL compiler in particular) can rely on them being
//! well-formed: operators are known, concept ids are present where required,
//! and every comparator carries a value of the right shape.

use crate::domain::ids::ConceptId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Boolean operator combining rules within a group, or groups within a cohort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BoolOperator {
    /// Every operand must hold
    And,
    /// At least one operand must hold
    Or,
}

impl BoolOperator {
    /// Value of the operator applied to zero operands
    ///
    /// AND over nothing is vacuously true, OR over nothing is vacuously false.
    pub fn identity(&self) -> bool {
        matches!(self, Self::And)
    }

    /// SQL keyword for the operator
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

impl FromStr for BoolOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AND" => Ok(Self::And),
            "OR" => Ok(Self::Or),
            other => Err(format!("unknown boolean operator '{other}', expected AND or OR")),
        }
    }
}

impl fmt::Display for BoolOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_keyword())
    }
}

/// Clinical fact domains, each backed by one OMOP CDM fact table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FactDomain {
    /// `condition_occurrence`
    Condition,
    /// `drug_exposure`
    Drug,
    /// `measurement`
    Measurement,
    /// `observation`
    Observation,
    /// `procedure_occurrence`
    Procedure,
}

impl FactDomain {
    /// Every fact domain, in declaration order
    pub const ALL: [FactDomain; 5] = [
        FactDomain::Condition,
        FactDomain::Drug,
        FactDomain::Measurement,
        FactDomain::Observation,
        FactDomain::Procedure,
    ];

    /// Wire name of the domain
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Condition => "CONDITION",
            Self::Drug => "DRUG",
            Self::Measurement => "MEASUREMENT",
            Self::Observation => "OBSERVATION",
            Self::Procedure => "PROCEDURE",
        }
    }

    /// Whether rows of this domain carry a numeric value (`value_as_number`)
    pub fn has_numeric_value(&self) -> bool {
        matches!(self, Self::Measurement | Self::Observation)
    }
}

impl fmt::Display for FactDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Demographic attributes stored as concept columns on the person table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PersonAttribute {
    /// `gender_concept_id`
    Sex,
    /// `race_concept_id`
    Race,
    /// `ethnicity_concept_id`
    Ethnicity,
}

impl PersonAttribute {
    /// Every person attribute, in declaration order
    pub const ALL: [PersonAttribute; 3] = [
        PersonAttribute::Sex,
        PersonAttribute::Race,
        PersonAttribute::Ethnicity,
    ];

    /// Wire name of the attribute
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sex => "SEX",
            Self::Race => "RACE",
            Self::Ethnicity => "ETHNICITY",
        }
    }
}

/// Concept domain a rule targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConceptDomain {
    /// A clinical fact table
    Fact(FactDomain),
    /// A demographic concept column on the person table
    Person(PersonAttribute),
    /// Age in whole years at the query's reference date
    Age,
}

impl ConceptDomain {
    /// Whether rules in this domain must name a concept
    pub fn requires_concept(&self) -> bool {
        !matches!(self, Self::Age)
    }

    /// Wire name of the domain
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact(domain) => domain.as_str(),
            Self::Person(attribute) => attribute.as_str(),
            Self::Age => "AGE",
        }
    }
}

impl FromStr for ConceptDomain {
    type Err = String;

    /// Accepts the wire names plus the OMOP `domain_id` spellings
    /// (`Condition`, `Gender`, ...), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let domain = match s.trim().to_ascii_uppercase().as_str() {
            "CONDITION" => Self::Fact(FactDomain::Condition),
            "DRUG" => Self::Fact(FactDomain::Drug),
            "MEASUREMENT" => Self::Fact(FactDomain::Measurement),
            "OBSERVATION" => Self::Fact(FactDomain::Observation),
            "PROCEDURE" => Self::Fact(FactDomain::Procedure),
            "SEX" | "GENDER" => Self::Person(PersonAttribute::Sex),
            "RACE" => Self::Person(PersonAttribute::Race),
            "ETHNICITY" => Self::Person(PersonAttribute::Ethnicity),
            "AGE" => Self::Age,
            _ => return Err(format!("unknown concept domain '{}'", s.trim())),
        };
        Ok(domain)
    }
}

impl fmt::Display for ConceptDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparator of a rule together with its operand
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Comparator {
    /// Subject has the concept, attribute equals the concept, or age equals
    /// the value (the operand is present only for [`ConceptDomain::Age`])
    Eq(Option<f64>),
    /// Negation of [`Comparator::Eq`]
    Ne(Option<f64>),
    /// Value strictly greater than
    Gt(f64),
    /// Value greater than or equal
    Ge(f64),
    /// Value strictly less than
    Lt(f64),
    /// Value less than or equal
    Le(f64),
    /// Value within the inclusive range
    Between {
        /// Lower bound (inclusive)
        min: f64,
        /// Upper bound (inclusive)
        max: f64,
    },
    /// Event date strictly before the date
    Before(NaiveDate),
    /// Event date strictly after the date
    After(NaiveDate),
    /// Event date within the given number of days before the reference date
    Within {
        /// Window length in days
        days: u32,
    },
}

impl Comparator {
    /// Wire name of the comparator
    pub fn name(&self) -> &'static str {
        match self {
            Self::Eq(_) => "EQ",
            Self::Ne(_) => "NE",
            Self::Gt(_) => "GT",
            Self::Ge(_) => "GE",
            Self::Lt(_) => "LT",
            Self::Le(_) => "LE",
            Self::Between { .. } => "BETWEEN",
            Self::Before(_) => "BEFORE",
            Self::After(_) => "AFTER",
            Self::Within { .. } => "WITHIN",
        }
    }
}

/// Whole-year age range, both bounds inclusive and at least one present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeRange {
    /// Lowest accepted age
    pub min: Option<u32>,
    /// Highest accepted age
    pub max: Option<u32>,
}

impl fmt::Display for AgeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (Some(min), Some(max)) => write!(f, "{min}-{max}"),
            (Some(min), None) => write!(f, "{min}+"),
            (None, Some(max)) => write!(f, "<={max}"),
            (None, None) => f.write_str("any"),
        }
    }
}

/// Restrictions on the individual fact rows a rule matches
///
/// Only meaningful for [`ConceptDomain::Fact`] rules; validation rejects
/// them elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Age the subject had on the event date
    pub age_at_event: Option<AgeRange>,
    /// Accepted record type concepts (`*_type_concept_id`); empty accepts any
    pub type_concepts: Vec<ConceptId>,
}

impl EventFilter {
    /// Whether the filter accepts every row
    pub fn is_empty(&self) -> bool {
        self.age_at_event.is_none() && self.type_concepts.is_empty()
    }
}

/// A single cohort rule
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Domain the rule targets
    pub domain: ConceptDomain,
    /// Concept matched by the rule (absent only for [`ConceptDomain::Age`])
    pub concept: Option<ConceptId>,
    /// Comparator and operand
    pub comparator: Comparator,
    /// Row-level restrictions for fact rules
    pub filter: EventFilter,
}

impl Rule {
    /// Creates a rule without row-level restrictions
    pub fn new(domain: ConceptDomain, concept: Option<ConceptId>, comparator: Comparator) -> Self {
        Self {
            domain,
            concept,
            comparator,
            filter: EventFilter::default(),
        }
    }

    /// Short human-readable description used in logs and error messages
    pub fn describe(&self) -> String {
        let mut description = match self.concept {
            Some(concept) => format!(
                "{} concept {} {}",
                self.domain,
                concept,
                self.comparator.name()
            ),
            None => format!("{} {}", self.domain, self.comparator.name()),
        };
        if let Some(age) = self.filter.age_at_event {
            description.push_str(&format!(" at age {age}"));
        }
        description
    }
}

/// Rules combined by one boolean operator
#[derive(Debug, Clone, PartialEq)]
pub struct RuleGroup {
    /// Operator between the rules of the group
    pub operator: BoolOperator,
    /// Rules of the group, in request order
    pub rules: Vec<Rule>,
}

/// Ordered groups combined by one boolean operator
#[derive(Debug, Clone, PartialEq)]
pub struct Cohort {
    /// Operator between groups
    pub groups_operator: BoolOperator,
    /// Groups, in request order
    pub groups: Vec<RuleGroup>,
}

impl Cohort {
    /// A cohort with no groups, matching every subject
    pub fn everyone() -> Self {
        Self {
            groups_operator: BoolOperator::And,
            groups: Vec::new(),
        }
    }

    /// Total number of rules across all groups
    pub fn rule_count(&self) -> usize {
        self.groups.iter().map(|g| g.rules.len()).sum()
    }

    /// Whether the cohort has no rules at all
    pub fn has_no_rules(&self) -> bool {
        self.rule_count() == 0
    }
}

/// Dimension a distribution query is broken down by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Person sex (gender concept)
    Sex,
    /// Person race concept
    Race,
    /// Person ethnicity concept
    Ethnicity,
    /// Decade of the year of birth, e.g. `1970-1979`
    YearOfBirthDecade,
    /// Age band at the reference date, e.g. `40-49`
    AgeBand {
        /// Band width in years
        width: u32,
    },
    /// Concepts recorded in one fact domain
    Concept(FactDomain),
}

impl Dimension {
    /// Default age band width in years
    pub const DEFAULT_BAND_WIDTH: u32 = 10;

    /// Name of the dimension as reported in distribution results
    pub fn name(&self) -> String {
        match self {
            Self::Sex => "SEX".to_string(),
            Self::Race => "RACE".to_string(),
            Self::Ethnicity => "ETHNICITY".to_string(),
            Self::YearOfBirthDecade => "YEAR_OF_BIRTH_DECADE".to_string(),
            Self::AgeBand { width } => format!("AGE_BAND_{width}"),
            Self::Concept(domain) => format!("CONCEPT_{domain}"),
        }
    }

    /// Turns a raw bucket key returned by the database into a bucket label
    ///
    /// Numeric band keys are the lower bound of the band; they are rendered as
    /// inclusive ranges. Concept keys get the `OMOP:` prefix. Keys that do not
    /// parse as expected are passed through unchanged.
    pub fn bucket_label(&self, key: &str) -> String {
        match self {
            Self::Sex | Self::Race | Self::Ethnicity => key.to_string(),
            Self::YearOfBirthDecade => band_label(key, 10),
            Self::AgeBand { width } => band_label(key, *width),
            Self::Concept(_) => format!("OMOP:{key}"),
        }
    }
}

fn band_label(key: &str, width: u32) -> String {
    match key.trim().parse::<i64>() {
        Ok(lower) => format!("{}-{}", lower, lower + i64::from(width) - 1),
        Err(_) => key.to_string(),
    }
}

/// Requested output shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Single count of matching subjects
    Availability,
    /// Counts of matching subjects per bucket of a dimension
    Distribution(Dimension),
}

impl OutputKind {
    /// Wire name of the output kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Availability => "AVAILABILITY",
            Self::Distribution(_) => "DISTRIBUTION",
        }
    }
}

/// A fully validated query specification
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    /// Cohort definition
    pub cohort: Cohort,
    /// Requested output
    pub output: OutputKind,
    /// Date anchoring ages and relative time windows
    pub reference_date: NaiveDate,
}

/// Bounds on query size, checked during validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    /// Maximum number of groups in a cohort
    pub max_groups: usize,
    /// Maximum number of rules in a single group
    pub max_rules_per_group: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_groups: 20,
            max_rules_per_group: 50,
        }
    }
}
