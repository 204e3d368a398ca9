//! Canonicalization and content-identity derivation.
//!
//! Every digest here is a deterministic function of one record plus a fixed
//! [`StaticTables`] value: identical input always yields identical output,
//! independent of run order or of any other record in the dataset.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use allgigs_core::{CanonicalRecord, ClusterKeys, IdentityKeys};

pub const CRATE_NAME: &str = "allgigs-identity";

/// 32-character lowercase hex digest of a string.
pub fn digest(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Digest of the empty string: the shared sentinel for every masked or
/// default field value.
pub fn empty_digest() -> String {
    digest("")
}

/// Immutable configuration tables consumed by the canonicalizer. Built once
/// at process start and passed explicitly, so unit tests can substitute
/// alternate tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticTables {
    /// Values that are adapter-injected filler rather than genuine scraped
    /// content, across all fields. Lowercased.
    pub default_values: HashSet<String>,
    /// Additional filler values masked only for the Location field.
    pub location_default_values: HashSet<String>,
    /// Filler values masked for Hours, Duration and Summary.
    pub scalar_default_values: HashSet<String>,
    /// Source-name aliases, matched by substring against the normalized
    /// source; first hit wins, so order matters.
    pub source_aliases: Vec<(String, String)>,
    /// Generic job/role/skill vocabulary used for Summary term-set identity.
    pub job_terms: Vec<String>,
}

impl Default for StaticTables {
    fn default() -> Self {
        let default_values = [
            "not mentioned",
            "see vacancy",
            "asap",
            "remote",
            "hybrid",
            "on-site",
            "onsite",
            "amsterdam",
            "hilversum",
            "gelderland",
            "36",
            "price",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        let location_default_values = [
            "not mentioned",
            "see vacancy",
            "asap",
            "remote",
            "hybrid",
            "on-site",
            "onsite",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        let scalar_default_values = ["not mentioned", "see vacancy", "asap"]
            .into_iter()
            .map(str::to_string)
            .collect();

        let source_aliases = [
            ("linkedin", "linkedin"),
            ("indeed", "indeed"),
            ("freelance nl", "freelance_nl"),
            ("freelancer", "freelancer"),
            ("hoofdkraan", "hoofdkraan"),
            ("harvey nash", "harvey_nash"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            default_values,
            location_default_values,
            scalar_default_values,
            source_aliases,
            job_terms: generic_job_terms(),
        }
    }
}

/// Generic job terms covering all industries, excluding seniority levels.
fn generic_job_terms() -> Vec<String> {
    [
        // Core job roles
        "manager",
        "director",
        "coordinator",
        "specialist",
        "analyst",
        "consultant",
        "advisor",
        "assistant",
        "associate",
        "executive",
        "officer",
        "representative",
        "administrator",
        "supervisor",
        "lead",
        "head",
        "chief",
        "principal",
        // IT & development
        "developer",
        "programmer",
        "coder",
        "engineer",
        "architect",
        "designer",
        "technician",
        "software",
        "web",
        "mobile",
        "frontend",
        "backend",
        "fullstack",
        "devops",
        "database",
        "system",
        "network",
        "security",
        "cloud",
        "data",
        "qa",
        "testing",
        "scrum",
        "agile",
        "product owner",
        "tech lead",
        // Job functions
        "sales",
        "marketing",
        "finance",
        "accounting",
        "human resources",
        "operations",
        "project",
        "product",
        "business",
        "strategy",
        "planning",
        "development",
        "research",
        "design",
        "creative",
        "communication",
        "customer service",
        "support",
        "maintenance",
        "quality",
        "safety",
        "compliance",
        "legal",
        // Industries
        "healthcare",
        "education",
        "retail",
        "hospitality",
        "manufacturing",
        "construction",
        "transport",
        "logistics",
        "energy",
        "government",
        "nonprofit",
        "insurance",
        "banking",
        "real estate",
        "media",
        "technology",
        // Skills & competencies
        "leadership",
        "management",
        "teamwork",
        "problem solving",
        "analytical",
        "organizational",
        "interpersonal",
        "technical",
        "administrative",
        "operational",
        "strategic",
        "financial",
        "commercial",
        // Work types
        "full time",
        "part time",
        "contract",
        "temporary",
        "permanent",
        "freelance",
        "remote",
        "hybrid",
        "onsite",
        "flexible",
        "shift",
        "weekend",
        // Common job titles
        "mechanic",
        "driver",
        "operator",
        "worker",
        "clerk",
        "secretary",
        "receptionist",
        "cashier",
        "server",
        "cook",
        "nurse",
        "teacher",
        "trainer",
        "instructor",
        "counselor",
        "therapist",
        "writer",
        "editor",
        "photographer",
        "artist",
        "lawyer",
        "accountant",
        "auditor",
        "inspector",
        // Action words
        "manage",
        "coordinate",
        "supervise",
        "develop",
        "implement",
        "analyze",
        "evaluate",
        "monitor",
        "maintain",
        "operate",
        "assist",
        "serve",
        "deliver",
        "provide",
        "ensure",
        "improve",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

const SOURCE_SUFFIXES: &[&str] = &[
    ".com", ".nl", ".org", ".eu", " b.v.", " bv", " b.v", " ltd", " inc", " corp", " gmbh",
];
const SOURCE_PREFIXES: &[&str] = &["www.", "http://", "https://"];

/// Text canonicalizer: turns free-text fields into stable comparable forms
/// prior to hashing. All regexes are compiled once at construction.
pub struct Canonicalizer {
    tables: StaticTables,
    punctuation: Regex,
    whitespace: Regex,
    location_noise: Regex,
    digit_runs: Regex,
    date_range: Regex,
    non_slug: Regex,
    underscores: Regex,
    term_patterns: Vec<(String, Regex)>,
}

impl Canonicalizer {
    pub fn new(tables: StaticTables) -> Result<Self> {
        let term_patterns = tables
            .job_terms
            .iter()
            .map(|term| {
                let pattern = format!(r"\b{}\b", regex::escape(term));
                Regex::new(&pattern)
                    .map(|re| (term.clone(), re))
                    .with_context(|| format!("compiling job term pattern for {term:?}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tables,
            punctuation: Regex::new(r"[^\w\s]").context("compiling punctuation pattern")?,
            whitespace: Regex::new(r"\s+").context("compiling whitespace pattern")?,
            location_noise: Regex::new(
                r"\b(remote|hybrid|on-site|onsite|work from home|wfh|locatie:|location:)\b",
            )
            .context("compiling location noise pattern")?,
            digit_runs: Regex::new(r"\d+").context("compiling digit pattern")?,
            date_range: Regex::new(r"(\d{4}-\d{2}-\d{2})\s*(?:to|until|-)\s*(\d{4}-\d{2}-\d{2})")
                .context("compiling date range pattern")?,
            non_slug: Regex::new(r"[^a-z0-9]").context("compiling slug pattern")?,
            underscores: Regex::new(r"_+").context("compiling underscore pattern")?,
            term_patterns,
        })
    }

    pub fn tables(&self) -> &StaticTables {
        &self.tables
    }

    /// Lowercase, strip punctuation, collapse whitespace.
    pub fn normalize_title(&self, title: &str) -> String {
        let lowered = title.to_lowercase();
        let stripped = self.punctuation.replace_all(&lowered, "");
        self.whitespace.replace_all(&stripped, " ").trim().to_string()
    }

    /// Lowercase, drop standalone work-arrangement tokens, strip
    /// punctuation, collapse whitespace.
    pub fn normalize_location(&self, location: &str) -> String {
        let lowered = location.to_lowercase();
        let denoised = self.location_noise.replace_all(&lowered, "");
        let stripped = self.punctuation.replace_all(&denoised, "");
        self.whitespace.replace_all(&stripped, " ").trim().to_string()
    }

    /// Extract the last digit run in the input; ranges like "3-6" collapse
    /// to "6". Returns `None` when the input carries no digits.
    pub fn extract_last_number(&self, input: &str) -> Option<String> {
        self.digit_runs
            .find_iter(input.trim())
            .last()
            .map(|m| m.as_str().to_string())
    }

    /// Canonical duration value: a date range canonicalizes to its
    /// whole-month span, anything else to its last digit run.
    pub fn canonical_duration(&self, duration: &str) -> Option<String> {
        let trimmed = duration.trim();
        if let Some(caps) = self.date_range.captures(trimmed) {
            let start = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d");
            let end = NaiveDate::parse_from_str(&caps[2], "%Y-%m-%d");
            if let (Ok(start), Ok(end)) = (start, end) {
                return Some(months_between(start, end).to_string());
            }
            // Unparseable dates fall back to plain number extraction.
        }
        self.extract_last_number(trimmed)
    }

    /// Normalize a source/platform name to a stable slug.
    pub fn normalize_source(&self, source: &str) -> String {
        let mut normalized = source.to_lowercase().trim().to_string();

        for suffix in SOURCE_SUFFIXES {
            if let Some(prefix) = normalized.strip_suffix(suffix) {
                normalized = prefix.trim().to_string();
            }
        }
        for prefix in SOURCE_PREFIXES {
            if let Some(rest) = normalized.strip_prefix(prefix) {
                normalized = rest.trim().to_string();
            }
        }

        for (needle, canonical) in &self.tables.source_aliases {
            if normalized.contains(needle.as_str()) {
                normalized = canonical.clone();
                break;
            }
        }

        let slug = self.non_slug.replace_all(&normalized, "_");
        let slug = self
            .underscores
            .replace_all(&slug, "_")
            .trim_matches('_')
            .to_string();

        if slug.is_empty() {
            source.to_lowercase().trim().to_string()
        } else {
            slug
        }
    }

    /// Sorted, pipe-joined whole-word job-term matches in the summary.
    /// Summary identity is term-set similarity, not literal text similarity.
    pub fn summary_terms(&self, summary: &str) -> Vec<String> {
        let lowered = summary.to_lowercase();
        let mut found: Vec<String> = self
            .term_patterns
            .iter()
            .filter(|(_, re)| re.is_match(&lowered))
            .map(|(term, _)| term.clone())
            .collect();
        found.sort();
        found
    }

    /// Whether a value is genuine scraped content rather than an
    /// adapter-injected default. Filler must not be cryptographically
    /// distinguishing.
    pub fn is_from_input(&self, value: &str) -> bool {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return false;
        }
        !self
            .tables
            .default_values
            .contains(trimmed.to_lowercase().as_str())
    }

    fn is_location_default(&self, value: &str) -> bool {
        self.tables
            .location_default_values
            .contains(value.trim().to_lowercase().as_str())
    }

    fn is_scalar_default(&self, value: &str) -> bool {
        self.tables
            .scalar_default_values
            .contains(value.trim().to_lowercase().as_str())
    }
}

/// Whole months between two dates, counting a partial trailing month when
/// the end day has reached the start day.
fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    use chrono::Datelike;
    let mut months =
        (end.year() - start.year()) * 12 + (end.month() as i32 - start.month() as i32);
    if end.day() >= start.day() {
        months += 1;
    }
    months
}

/// Derives [`IdentityKeys`] and [`ClusterKeys`] from canonical records.
pub struct IdentityDeriver {
    canon: Canonicalizer,
}

impl IdentityDeriver {
    pub fn new(tables: StaticTables) -> Result<Self> {
        Ok(Self {
            canon: Canonicalizer::new(tables)?,
        })
    }

    pub fn canonicalizer(&self) -> &Canonicalizer {
        &self.canon
    }

    /// Primary identity: always computed from literal Title/URL/Company,
    /// never masked. Empty ones are dropped upstream.
    pub fn unique_id(&self, title: &str, url: &str, company: &str) -> String {
        digest(&format!("{title}|{url}|{company}"))
    }

    /// Grouping identity over the normalized title.
    pub fn group_id(&self, title: &str) -> String {
        digest(&self.canon.normalize_title(title))
    }

    pub fn location_id(&self, location: &str, from_input: bool) -> String {
        if !from_input || location.trim().is_empty() || self.canon.is_location_default(location) {
            return empty_digest();
        }
        let cleaned = self.canon.normalize_location(location);
        if cleaned.is_empty() {
            return empty_digest();
        }
        digest(&cleaned)
    }

    pub fn hours_id(&self, hours: &str, from_input: bool) -> String {
        if !from_input || hours.trim().is_empty() || self.canon.is_scalar_default(hours) {
            return empty_digest();
        }
        match self.canon.extract_last_number(hours) {
            Some(last) => digest(&last),
            None => empty_digest(),
        }
    }

    pub fn duration_id(&self, duration: &str, from_input: bool) -> String {
        if !from_input || duration.trim().is_empty() || self.canon.is_scalar_default(duration) {
            return empty_digest();
        }
        match self.canon.canonical_duration(duration) {
            Some(canonical) => digest(&canonical),
            None => empty_digest(),
        }
    }

    pub fn summary_id(&self, summary: &str, from_input: bool) -> String {
        if !from_input || summary.trim().is_empty() || self.canon.is_scalar_default(summary) {
            return empty_digest();
        }
        let terms = self.canon.summary_terms(summary);
        if terms.is_empty() {
            return empty_digest();
        }
        digest(&terms.join("|"))
    }

    pub fn source_id(&self, source: &str, from_input: bool) -> String {
        if !from_input || source.trim().is_empty() {
            return empty_digest();
        }
        digest(&self.canon.normalize_source(source))
    }

    /// Full identity-key derivation for one record.
    pub fn derive(&self, record: &CanonicalRecord) -> IdentityKeys {
        let keys = IdentityKeys {
            unique_id: self.unique_id(&record.title, &record.url, &record.company),
            group_id: self.group_id(&record.title),
            location_id: self
                .location_id(&record.location, self.canon.is_from_input(&record.location)),
            hours_id: self.hours_id(&record.hours, self.canon.is_from_input(&record.hours)),
            duration_id: self
                .duration_id(&record.duration, self.canon.is_from_input(&record.duration)),
            summary_id: self
                .summary_id(&record.summary, self.canon.is_from_input(&record.summary)),
            source_id: self.source_id(&record.source, self.canon.is_from_input(&record.source)),
        };
        debug!(
            unique_id = %keys.unique_id,
            group_id = %keys.group_id,
            title = %record.title,
            "derived identity keys"
        );
        keys
    }

    /// Similarity-class keys. Requires the record's identity keys to be
    /// fully derived first; the company name enters as raw literal text.
    pub fn derive_clusters(&self, record: &CanonicalRecord, keys: &IdentityKeys) -> ClusterKeys {
        ClusterKeys {
            true_duplicates: digest(&format!(
                "{}_{}_{}_{}",
                keys.source_id, keys.group_id, keys.summary_id, record.company
            )),
            cross_platform_duplicates: digest(&format!(
                "{}_{}_{}",
                keys.group_id, keys.summary_id, record.company
            )),
            location_clusters: digest(&format!("{}_{}", keys.group_id, keys.location_id)),
            recommendations: digest(&format!("{}_{}", keys.summary_id, keys.location_id)),
            company_location_roles: digest(&format!(
                "{}_{}_{}",
                keys.group_id, keys.source_id, keys.location_id
            )),
        }
    }
}
