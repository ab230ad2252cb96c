//! Closed mapping from query domains to OMOP CDM tables and columns
//!
//! Every domain is mapped by an exhaustive `match`, so adding a domain
//! without a mapping fails to build.

use crate::domain::query::{FactDomain, PersonAttribute};

/// Name of the subject table
pub const PERSON_TABLE: &str = "person";

/// Name of the vocabulary table used to label demographic buckets
pub const CONCEPT_TABLE: &str = "concept";

/// Subject key column, present on the person table and every fact table
pub const PERSON_ID: &str = "person_id";

/// Table and columns backing one fact domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactTable {
    /// Table name
    pub table: &'static str,
    /// Concept column matched by rules
    pub concept_column: &'static str,
    /// Event date column used by temporal comparators and event ages
    pub date_column: &'static str,
    /// Record type concept column (provenance of the row)
    pub type_column: &'static str,
    /// Numeric value column, for domains that record one
    pub value_column: Option<&'static str>,
}

/// Returns the table mapping for a fact domain
pub fn fact_table(domain: FactDomain) -> FactTable {
    match domain {
        FactDomain::Condition => FactTable {
            table: "condition_occurrence",
            concept_column: "condition_concept_id",
            date_column: "condition_start_date",
            type_column: "condition_type_concept_id",
            value_column: None,
        },
        FactDomain::Drug => FactTable {
            table: "drug_exposure",
            concept_column: "drug_concept_id",
            date_column: "drug_exposure_start_date",
            type_column: "drug_type_concept_id",
            value_column: None,
        },
        FactDomain::Measurement => FactTable {
            table: "measurement",
            concept_column: "measurement_concept_id",
            date_column: "measurement_date",
            type_column: "measurement_type_concept_id",
            value_column: Some("value_as_number"),
        },
        FactDomain::Observation => FactTable {
            table: "observation",
            concept_column: "observation_concept_id",
            date_column: "observation_date",
            type_column: "observation_type_concept_id",
            value_column: Some("value_as_number"),
        },
        FactDomain::Procedure => FactTable {
            table: "procedure_occurrence",
            concept_column: "procedure_concept_id",
            date_column: "procedure_date",
            type_column: "procedure_type_concept_id",
            value_column: None,
        },
    }
}

/// Returns the person column holding a demographic concept
pub fn person_column(attribute: PersonAttribute) -> &'static str {
    match attribute {
        PersonAttribute::Sex => "gender_concept_id",
        PersonAttribute::Race => "race_concept_id",
        PersonAttribute::Ethnicity => "ethnicity_concept_id",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_every_fact_domain_is_mapped() {
        let mut tables = HashSet::new();
        for domain in FactDomain::ALL {
            let mapping = fact_table(domain);
            assert!(tables.insert(mapping.table), "{domain} shares a table");
            assert!(mapping.concept_column.ends_with("_concept_id"));
            assert!(mapping.date_column.contains("date"));
            let prefix = domain_prefix(mapping.concept_column);
            assert_eq!(mapping.type_column, format!("{prefix}_type_concept_id"));
            assert_eq!(mapping.value_column.is_some(), domain.has_numeric_value());
        }
        assert_eq!(tables.len(), FactDomain::ALL.len());
    }

    fn domain_prefix(concept_column: &str) -> &str {
        concept_column.trim_end_matches("_concept_id")
    }

    #[test]
    fn test_every_person_attribute_is_mapped() {
        let columns: HashSet<_> = PersonAttribute::ALL
            .iter()
            .map(|a| person_column(*a))
            .collect();
        assert_eq!(columns.len(), PersonAttribute::ALL.len());
    }
}
