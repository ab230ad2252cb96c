//! Domain identifier types with validation
//!
//! Newtype wrappers keep correlation ids, collection ids and OMOP concept ids
//! from being mixed up with each other or with arbitrary strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Correlation identifier of a task
///
/// Every result published by the daemon carries the correlation id of the
/// task it answers, so the requester can always match answers to questions.
///
/// # Examples
///
/// ```
/// use tally::domain::ids::CorrelationId;
/// use std::str::FromStr;
///
/// let id = CorrelationId::from_str("job-42").unwrap();
/// assert_eq!(id.as_str(), "job-42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Creates a new CorrelationId
    ///
    /// # Returns
    ///
    /// Returns `Err` if the id is empty or only whitespace
    pub fn new(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("Correlation ID cannot be empty".to_string());
        }
        Ok(Self(id))
    }

    /// Generates a unique id for a task that arrived without one
    pub fn generate() -> Self {
        Self(format!("unidentified-{}", uuid::Uuid::new_v4()))
    }

    /// Returns the correlation id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes self and returns the inner String
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CorrelationId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Collection (response destination) identifier
///
/// Identifies the dataset collection a task was addressed to; results are
/// published back to the same collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionId(String);

impl CollectionId {
    /// Creates a new CollectionId
    ///
    /// Collection ids end up in URL paths, so `/`, `?` and `#` are rejected.
    pub fn new(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("Collection ID cannot be empty".to_string());
        }
        if id.contains(['/', '?', '#']) {
            return Err(format!(
                "Collection ID '{id}' must not contain '/', '?' or '#'"
            ));
        }
        Ok(Self(id))
    }

    /// Returns the collection id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CollectionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CollectionId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CollectionId> for String {
    fn from(id: CollectionId) -> Self {
        id.0
    }
}

/// OMOP concept identifier
///
/// OMOP concept ids are positive integers. Zero is the OMOP "no matching
/// concept" sentinel and is not accepted as a rule target.
///
/// # Examples
///
/// ```
/// use tally::domain::ids::ConceptId;
///
/// let diabetes = ConceptId::new(201820).unwrap();
/// assert_eq!(diabetes.value(), 201820);
/// assert!(ConceptId::new(0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct ConceptId(i64);

impl ConceptId {
    /// Creates a new ConceptId, rejecting zero and negative values
    pub fn new(id: i64) -> Result<Self, String> {
        if id <= 0 {
            return Err(format!("Concept ID must be a positive integer, got {id}"));
        }
        Ok(Self(id))
    }

    /// Returns the numeric concept id
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for ConceptId {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ConceptId> for i64 {
    fn from(id: ConceptId) -> Self {
        id.0
    }
}

impl FromStr for ConceptId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: i64 = s
            .trim()
            .parse()
            .map_err(|_| format!("Concept ID '{s}' is not an integer"))?;
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_rejects_blank() {
        assert!(CorrelationId::new("").is_err());
        assert!(CorrelationId::new("   ").is_err());
        assert_eq!(CorrelationId::new("abc").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_generated_correlation_ids_are_unique() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("unidentified-"));
    }

    #[test]
    fn test_correlation_id_serde_transparent() {
        let id = CorrelationId::new("job-1").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"job-1\"");

        let back: CorrelationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<CorrelationId>("\"\"").is_err());
    }

    #[test]
    fn test_collection_id_rejects_path_characters() {
        assert!(CollectionId::new("RQ-CC-1234").is_ok());
        assert!(CollectionId::new("a/b").is_err());
        assert!(CollectionId::new("a?b").is_err());
        assert!(CollectionId::new("").is_err());
    }

    #[test]
    fn test_concept_id_validation() {
        assert!(ConceptId::new(8507).is_ok());
        assert!(ConceptId::new(0).is_err());
        assert!(ConceptId::new(-4).is_err());
        assert_eq!(ConceptId::from_str(" 8532 ").unwrap().value(), 8532);
        assert!(ConceptId::from_str("OMOP:8532").is_err());
    }

    #[test]
    fn test_concept_id_serde_rejects_zero() {
        assert!(serde_json::from_str::<ConceptId>("0").is_err());
        assert_eq!(serde_json::from_str::<ConceptId>("201820").unwrap().value(), 201820);
    }
}
