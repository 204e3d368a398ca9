//! Source adapters: CSV ingestion, column mappings, and the pure text
//! classifiers consumed after identity derivation.
//!
//! Every adapter turns one scraper export into canonical records. The
//! mapping from canonical field to raw column (or literal default) is
//! resolved once per adapter definition via [`FieldProvenance`], never
//! inferred at runtime from string equality.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use allgigs_core::{CanonicalRecord, ClassifierLabels, FieldProvenance, NOT_MENTIONED};

pub const CRATE_NAME: &str = "allgigs-adapters";

/// Raw tabular scraper output, one stable row id per ingested row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name.trim()))
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("source {source_name}: raw export is empty")]
    EmptySource { source_name: String },
    #[error("source {source_name}: missing mapped column {column:?}")]
    MissingColumn {
        source_name: String,
        column: String,
    },
}

const CANDIDATE_SEPARATORS: &[u8] = &[b',', b';', b'\t'];

/// Read a scraper CSV export, sniffing the separator by trying comma,
/// semicolon and tab in turn and keeping the first parse that yields more
/// than one column.
pub fn read_raw_table(path: impl AsRef<Path>) -> Result<RawTable, AdapterError> {
    let path = path.as_ref();
    let shown = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| AdapterError::Io {
        path: shown.clone(),
        source,
    })?;

    let mut fallback: Option<RawTable> = None;
    for &separator in CANDIDATE_SEPARATORS {
        match parse_raw_table(&text, separator) {
            Ok(table) if table.headers.len() > 1 => return Ok(table),
            Ok(table) => {
                fallback.get_or_insert(table);
            }
            Err(source) => {
                debug!(path = %shown, separator = %(separator as char), error = %source, "separator attempt failed");
            }
        }
    }

    match fallback {
        Some(table) => Ok(table),
        None => Err(AdapterError::Csv {
            path: shown,
            source: csv::Error::from(std::io::Error::other("unreadable export")),
        }),
    }
}

fn parse_raw_table(text: &str, separator: u8) -> Result<RawTable, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(separator)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let mut row: Vec<String> = record.iter().map(|v| v.trim().to_string()).collect();
        // Short rows are padded so positional lookups stay in bounds.
        row.resize(headers.len().max(row.len()), String::new());
        rows.push(row);
    }

    Ok(RawTable { headers, rows })
}

/// Canonical-field → provenance mapping for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub title: FieldProvenance,
    pub location: FieldProvenance,
    pub summary: FieldProvenance,
    pub url: FieldProvenance,
    pub start: FieldProvenance,
    pub rate: FieldProvenance,
    pub hours: FieldProvenance,
    pub duration: FieldProvenance,
    pub company: FieldProvenance,
}

impl ColumnMapping {
    /// A mapping where every field defaults to the absent sentinel; sources
    /// override the columns they actually carry.
    pub fn all_not_mentioned() -> Self {
        let absent = || FieldProvenance::Literal(NOT_MENTIONED.to_string());
        Self {
            title: absent(),
            location: absent(),
            summary: absent(),
            url: absent(),
            start: absent(),
            rate: absent(),
            hours: absent(),
            duration: absent(),
            company: absent(),
        }
    }
}

/// Per-field text cleanup applied after column extraction. The default
/// cleaner trims and collapses internal whitespace.
pub type CleanFn = fn(&str) -> String;

pub fn clean_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate chatty scraped summaries at the first paragraph break.
pub fn clean_first_paragraph(value: &str) -> String {
    let first = value.split("\n\n").next().unwrap_or(value);
    clean_whitespace(first)
}

/// Strip a leading "Locatie:"/"Location:" label some scrapers include.
pub fn clean_location_label(value: &str) -> String {
    let trimmed = value.trim();
    let stripped = ["Locatie:", "locatie:", "Location:", "location:"]
        .iter()
        .find_map(|label| trimmed.strip_prefix(label))
        .unwrap_or(trimmed);
    clean_whitespace(stripped)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Cleaners {
    pub title: Option<CleanFn>,
    pub location: Option<CleanFn>,
    pub summary: Option<CleanFn>,
    pub rate: Option<CleanFn>,
    pub hours: Option<CleanFn>,
    pub duration: Option<CleanFn>,
}

/// One source definition: name, mapping, optional cleanup hooks.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: String,
    pub mapping: ColumnMapping,
    pub cleaners: Cleaners,
}

/// Adapter contract: raw rows in, admissible canonical records out. A
/// failed source contributes zero records and a recorded error, never an
/// aborted run.
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;
    fn adapt(&self, raw: &RawTable) -> Result<Vec<CanonicalRecord>, AdapterError>;
}

/// Mapping-driven adapter; covers every source that is a plain column
/// rename plus defaults plus per-field cleanup.
#[derive(Debug, Clone)]
pub struct MappedAdapter {
    spec: SourceSpec,
}

impl MappedAdapter {
    pub fn new(spec: SourceSpec) -> Self {
        Self { spec }
    }

    fn resolve(
        &self,
        raw: &RawTable,
        provenance: &FieldProvenance,
    ) -> Result<Resolved, AdapterError> {
        match provenance {
            FieldProvenance::Literal(value) => Ok(Resolved::Literal(value.clone())),
            FieldProvenance::FromColumn(name) => raw
                .column_index(name)
                .map(Resolved::Column)
                .ok_or_else(|| AdapterError::MissingColumn {
                    source_name: self.spec.name.clone(),
                    column: name.clone(),
                }),
        }
    }
}

enum Resolved {
    Column(usize),
    Literal(String),
}

impl Resolved {
    fn value(&self, row: &[String]) -> String {
        match self {
            Resolved::Column(idx) => row.get(*idx).cloned().unwrap_or_default(),
            Resolved::Literal(value) => value.clone(),
        }
    }
}

fn apply_clean(cleaner: Option<CleanFn>, value: String) -> String {
    match cleaner {
        Some(f) => f(&value),
        None => clean_whitespace(&value),
    }
}

impl SourceAdapter for MappedAdapter {
    fn source_name(&self) -> &str {
        &self.spec.name
    }

    fn adapt(&self, raw: &RawTable) -> Result<Vec<CanonicalRecord>, AdapterError> {
        if raw.rows.is_empty() {
            return Err(AdapterError::EmptySource {
                source_name: self.spec.name.clone(),
            });
        }

        // Resolve every mapped column to an index up front so each row is a
        // plain positional read.
        let mapping = &self.spec.mapping;
        let title = self.resolve(raw, &mapping.title)?;
        let location = self.resolve(raw, &mapping.location)?;
        let summary = self.resolve(raw, &mapping.summary)?;
        let url = self.resolve(raw, &mapping.url)?;
        let start = self.resolve(raw, &mapping.start)?;
        let rate = self.resolve(raw, &mapping.rate)?;
        let hours = self.resolve(raw, &mapping.hours)?;
        let duration = self.resolve(raw, &mapping.duration)?;
        let company = self.resolve(raw, &mapping.company)?;

        let cleaners = &self.spec.cleaners;
        let mut records = Vec::with_capacity(raw.rows.len());
        let mut seen = HashSet::new();
        let mut dropped = 0usize;
        let mut duplicates = 0usize;

        for row in &raw.rows {
            let record = CanonicalRecord {
                title: apply_clean(cleaners.title, title.value(row)),
                location: apply_clean(cleaners.location, location.value(row)),
                summary: apply_clean(cleaners.summary, summary.value(row)),
                url: clean_whitespace(&url.value(row)),
                start: clean_whitespace(&start.value(row)),
                rate: apply_clean(cleaners.rate, rate.value(row)),
                hours: apply_clean(cleaners.hours, hours.value(row)),
                duration: apply_clean(cleaners.duration, duration.value(row)),
                company: clean_whitespace(&company.value(row)),
                source: self.spec.name.clone(),
            };

            if !record.is_admissible() {
                dropped += 1;
                continue;
            }

            // Repeated rows within one export collapse to the first, keyed by
            // the same triple the primary identity hashes.
            let key = format!("{}|{}|{}", record.title, record.url, record.company);
            if !seen.insert(key) {
                duplicates += 1;
                continue;
            }
            records.push(record);
        }

        if dropped > 0 {
            warn!(
                source = %self.spec.name,
                dropped,
                kept = records.len(),
                "dropped rows without title or url"
            );
        }
        if duplicates > 0 {
            debug!(
                source = %self.spec.name,
                duplicates,
                "collapsed repeated rows within export"
            );
        }

        Ok(records)
    }
}

/// Representative built-in source definitions. Real deployments extend this
/// list; each entry is data, not code.
pub fn builtin_sources() -> Vec<SourceSpec> {
    let col = |name: &str| FieldProvenance::FromColumn(name.to_string());
    let lit = |value: &str| FieldProvenance::Literal(value.to_string());

    vec![
        SourceSpec {
            name: "LinkedIn".to_string(),
            mapping: ColumnMapping {
                title: col("Job Title"),
                location: col("Location"),
                summary: col("Description"),
                url: col("Job URL"),
                start: lit(NOT_MENTIONED),
                rate: lit(NOT_MENTIONED),
                hours: lit(NOT_MENTIONED),
                duration: lit(NOT_MENTIONED),
                company: col("Company Name"),
            },
            cleaners: Cleaners {
                summary: Some(clean_first_paragraph),
                ..Default::default()
            },
        },
        SourceSpec {
            name: "Hoofdkraan".to_string(),
            mapping: ColumnMapping {
                title: col("titel"),
                location: col("locatie"),
                summary: col("omschrijving"),
                url: col("link"),
                start: lit("ASAP"),
                rate: col("tarief"),
                hours: col("uren"),
                duration: lit(NOT_MENTIONED),
                company: lit("Hoofdkraan"),
            },
            cleaners: Cleaners {
                location: Some(clean_location_label),
                ..Default::default()
            },
        },
        SourceSpec {
            name: "Freelance.nl".to_string(),
            mapping: ColumnMapping {
                title: col("Title"),
                location: col("Location"),
                summary: col("Summary"),
                url: col("URL"),
                start: col("Start"),
                rate: col("Rate"),
                hours: col("Hours"),
                duration: col("Duration"),
                company: col("Company"),
            },
            cleaners: Cleaners::default(),
        },
        SourceSpec {
            name: "Indeed".to_string(),
            mapping: ColumnMapping {
                title: col("title"),
                location: col("location"),
                summary: col("snippet"),
                url: col("url"),
                start: lit(NOT_MENTIONED),
                rate: col("salary"),
                hours: lit(NOT_MENTIONED),
                duration: lit(NOT_MENTIONED),
                company: col("company"),
            },
            cleaners: Cleaners {
                summary: Some(clean_first_paragraph),
                ..Default::default()
            },
        },
    ]
}

pub fn adapter_for_source(name: &str) -> Option<MappedAdapter> {
    builtin_sources()
        .into_iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(name))
        .map(MappedAdapter::new)
}

// ---------------------------------------------------------------------------
// Pure classifier collaborators. Their output is additional columns on the
// dataset, never part of identity.

pub mod classify {
    use super::*;

    const INDUSTRY_KEYWORDS: &[(&str, &[&str])] = &[
        (
            "IT & Software",
            &[
                "developer", "software", "devops", "backend", "frontend", "fullstack", "cloud",
                "data engineer", "programmer", "security", "database",
            ],
        ),
        (
            "Finance",
            &["finance", "financial", "accounting", "controller", "audit", "banking"],
        ),
        (
            "Healthcare",
            &["healthcare", "nurse", "medical", "zorg", "clinical", "therapist"],
        ),
        (
            "Marketing & Communication",
            &["marketing", "communication", "content", "seo", "brand", "campaign"],
        ),
        (
            "Engineering & Construction",
            &["construction", "mechanical", "electrical", "civil", "installatie", "bouw"],
        ),
        (
            "HR & Recruitment",
            &["recruiter", "recruitment", "human resources", "hr "],
        ),
    ];

    const RANDSTAD_CITIES: &[&str] = &[
        "amsterdam", "rotterdam", "den haag", "the hague", "utrecht", "haarlem", "leiden",
        "amstelveen", "hilversum", "almere", "delft",
    ];
    const NORTH_EAST: &[&str] = &[
        "groningen", "leeuwarden", "assen", "zwolle", "enschede", "apeldoorn", "arnhem",
        "nijmegen", "gelderland", "overijssel", "drenthe", "friesland",
    ];
    const SOUTH: &[&str] = &[
        "eindhoven", "tilburg", "breda", "den bosch", "maastricht", "venlo", "brabant",
        "limburg", "zeeland",
    ];

    const REMOTE_TOKENS: &[&str] = &["remote", "work from home", "wfh", "thuiswerken"];
    const HYBRID_TOKENS: &[&str] = &["hybrid", "hybride"];
    const ONSITE_TOKENS: &[&str] = &["on-site", "onsite", "op locatie"];

    fn contains_any(haystack: &str, needles: &[&str]) -> bool {
        needles.iter().any(|needle| haystack.contains(needle))
    }

    /// Keyword-heuristic industry label over title + summary.
    pub fn industry(title: &str, summary: &str) -> &'static str {
        let text = format!("{} {}", title.to_lowercase(), summary.to_lowercase());
        for (label, keywords) in INDUSTRY_KEYWORDS {
            if contains_any(&text, keywords) {
                return label;
            }
        }
        "Other"
    }

    /// Coarse Dutch region bucket for a location string.
    pub fn region(location: &str) -> &'static str {
        let lowered = location.to_lowercase();
        if contains_any(&lowered, REMOTE_TOKENS) {
            return "Remote";
        }
        if contains_any(&lowered, RANDSTAD_CITIES) {
            return "Randstad";
        }
        if contains_any(&lowered, NORTH_EAST) {
            return "North & East";
        }
        if contains_any(&lowered, SOUTH) {
            return "South";
        }
        "Unknown"
    }

    /// Work-arrangement label over location, title and summary text.
    pub fn work_arrangement(location: &str, title: &str, summary: &str) -> &'static str {
        let text = format!(
            "{} {} {}",
            location.to_lowercase(),
            title.to_lowercase(),
            summary.to_lowercase()
        );
        if contains_any(&text, HYBRID_TOKENS) {
            return "Hybrid";
        }
        if contains_any(&text, REMOTE_TOKENS) {
            return "Remote";
        }
        if contains_any(&text, ONSITE_TOKENS) {
            return "On-site";
        }
        "Not specified"
    }

    /// All labels for one record.
    pub fn labels(record: &CanonicalRecord) -> ClassifierLabels {
        ClassifierLabels {
            industry: industry(&record.title, &record.summary).to_string(),
            region: region(&record.location).to_string(),
            work_arrangement: work_arrangement(&record.location, &record.title, &record.summary)
                .to_string(),
        }
    }
}

/// Lookup of adapters by lowercase source name, for registries loaded from
/// configuration.
pub fn adapter_index(specs: Vec<SourceSpec>) -> HashMap<String, MappedAdapter> {
    specs
        .into_iter()
        .map(|spec| (spec.name.to_lowercase(), MappedAdapter::new(spec)))
        .collect()
}
