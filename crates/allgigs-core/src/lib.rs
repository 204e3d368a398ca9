//! Core domain model for the allGigs aggregation engine.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "allgigs-core";

/// Sentinel meaning "the source explicitly has no value here", as opposed to
/// an empty string which means "not yet populated".
pub const NOT_MENTIONED: &str = "Not mentioned";

/// Where a canonical field's value comes from in an adapter definition:
/// either a named raw column, or a literal default injected by the mapping.
/// Resolved once per adapter definition, never inferred at runtime from
/// string equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldProvenance {
    FromColumn(String),
    Literal(String),
}

impl FieldProvenance {
    pub fn is_literal(&self) -> bool {
        matches!(self, FieldProvenance::Literal(_))
    }
}

/// Normalized listing shape produced by source adapters and consumed by the
/// identity/sync core. All fields are free text; `title` and `url` are
/// guaranteed non-empty for any record admitted to the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Summary")]
    pub summary: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Start")]
    pub start: String,
    #[serde(rename = "Rate")]
    pub rate: String,
    #[serde(rename = "Hours")]
    pub hours: String,
    #[serde(rename = "Duration")]
    pub duration: String,
    #[serde(rename = "Company")]
    pub company: String,
    #[serde(rename = "Source")]
    pub source: String,
}

impl CanonicalRecord {
    /// Adapters drop records that fail this before handing off to the core.
    pub fn is_admissible(&self) -> bool {
        !self.title.trim().is_empty() && !self.url.trim().is_empty()
    }
}

/// Content-derived identity digests for one record. Each value is a
/// 32-character lowercase hex digest; masked/default fields collapse to the
/// digest of the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    #[serde(rename = "UNIQUE_ID")]
    pub unique_id: String,
    pub group_id: String,
    pub location_id: String,
    pub hours_id: String,
    pub duration_id: String,
    pub summary_id: String,
    pub source_id: String,
}

/// Composite similarity-class digests layered on top of [`IdentityKeys`].
/// Many records may legitimately share a cluster key; these drive reporting
/// and analytics, never upsert identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterKeys {
    pub true_duplicates: String,
    pub cross_platform_duplicates: String,
    pub location_clusters: String,
    pub recommendations: String,
    pub company_location_roles: String,
}

/// Output of the pure classifier collaborators; extra columns on the
/// dataset, not part of identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierLabels {
    pub industry: String,
    pub region: String,
    pub work_arrangement: String,
}

/// One fully derived row of a run's dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub record: CanonicalRecord,
    pub identity: IdentityKeys,
    pub clusters: ClusterKeys,
    pub labels: ClassifierLabels,
    /// Earliest date this listing was observed; starts as the run date and
    /// only ever moves backwards once historical data is consulted.
    pub date: NaiveDate,
}

/// Ordered collection of derived rows for a single pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub rows: Vec<DatasetRow>,
}

impl Dataset {
    pub fn new(rows: Vec<DatasetRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn unique_ids(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|r| r.identity.unique_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admissibility_requires_title_and_url() {
        let mut record = CanonicalRecord {
            title: "Developer".into(),
            url: "https://example.com/1".into(),
            ..Default::default()
        };
        assert!(record.is_admissible());

        record.url.clear();
        assert!(!record.is_admissible());

        record.url = "https://example.com/1".into();
        record.title = "   ".into();
        assert!(!record.is_admissible());
    }

    #[test]
    fn provenance_literal_flag() {
        assert!(FieldProvenance::Literal(NOT_MENTIONED.into()).is_literal());
        assert!(!FieldProvenance::FromColumn("Location".into()).is_literal());
    }
}
