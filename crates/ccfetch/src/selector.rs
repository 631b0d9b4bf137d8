//! Record admission
//!
//! A [`RecordSelector`] decides whether an index record is worth fetching.
//! [`FieldSelector`] is built from the `recordSelector` configuration block:
//!
//! ```json
//! {
//!   "must":     { "status": [{ "match": "200" }] },
//!   "must_not": { "mime": [{ "regex": "^image/" }] },
//!   "should":   { "mime_detected": [{ "match": "application/pdf" },
//!                                   { "match": "video/mp4" }] }
//! }
//! ```
//!
//! A field entry matches when any of its clauses matches. Every `must` entry
//! has to match, no `must_not` entry may match, and when `should` is present at
//! least one of its entries has to match.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

use crate::record::IndexRecord;

/// Capability: accept or reject a record. Must be pure.
pub trait RecordSelector: Send + Sync {
    fn accepts(&self, record: &IndexRecord) -> bool;
}

/// Selector used when no `recordSelector` is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl RecordSelector for AcceptAll {
    fn accepts(&self, _record: &IndexRecord) -> bool {
        true
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("unknown record field '{0}'")]
    UnknownField(String),

    #[error("clause on '{0}' must set exactly one of 'match' or 'regex'")]
    AmbiguousClause(String),

    #[error("invalid regex on '{field}': {message}")]
    InvalidRegex { field: String, message: String },
}

/// Record fields a clause can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Url,
    Mime,
    MimeDetected,
    Status,
    Languages,
    Charset,
    Truncated,
}

impl Field {
    fn value<'r>(&self, record: &'r IndexRecord) -> Option<&'r str> {
        match self {
            Field::Url => Some(record.url.as_str()),
            Field::Mime => record.mime.as_deref(),
            Field::MimeDetected => record.mime_detected.as_deref(),
            Field::Status => record.status.as_deref(),
            Field::Languages => record.languages.as_deref(),
            Field::Charset => record.charset.as_deref(),
            Field::Truncated => record.truncated.as_deref(),
        }
    }
}

impl FromStr for Field {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "url" => Ok(Field::Url),
            "mime" => Ok(Field::Mime),
            "mime_detected" => Ok(Field::MimeDetected),
            "status" => Ok(Field::Status),
            "languages" => Ok(Field::Languages),
            "charset" => Ok(Field::Charset),
            "truncated" => Ok(Field::Truncated),
            _ => Err(SelectorError::UnknownField(s.to_string())),
        }
    }
}

/// One clause as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClauseConfig {
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,

    /// Applies to `match` only
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
}

fn default_true() -> bool {
    true
}

/// The `recordSelector` configuration block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default)]
    pub must: BTreeMap<String, Vec<ClauseConfig>>,

    #[serde(default, alias = "mustNot")]
    pub must_not: BTreeMap<String, Vec<ClauseConfig>>,

    #[serde(default)]
    pub should: BTreeMap<String, Vec<ClauseConfig>>,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact { value: String, case_sensitive: bool },
    Pattern(Regex),
}

impl Matcher {
    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Exact {
                value: expected,
                case_sensitive: true,
            } => value == expected,
            Matcher::Exact { value: expected, .. } => value.eq_ignore_ascii_case(expected),
            Matcher::Pattern(re) => re.is_match(value),
        }
    }
}

#[derive(Debug, Clone)]
struct FieldTest {
    field: Field,
    matchers: Vec<Matcher>,
}

impl FieldTest {
    // A record without the field never matches.
    fn matches(&self, record: &IndexRecord) -> bool {
        self.field
            .value(record)
            .is_some_and(|v| self.matchers.iter().any(|m| m.matches(v)))
    }
}

/// Boolean selector over index record fields.
#[derive(Debug, Clone, Default)]
pub struct FieldSelector {
    must: Vec<FieldTest>,
    must_not: Vec<FieldTest>,
    should: Vec<FieldTest>,
}

impl FieldSelector {
    /// Compile a configuration block, rejecting unknown fields and bad regexes.
    pub fn compile(config: &SelectorConfig) -> Result<Self, SelectorError> {
        Ok(Self {
            must: compile_group(&config.must)?,
            must_not: compile_group(&config.must_not)?,
            should: compile_group(&config.should)?,
        })
    }
}

fn compile_group(
    group: &BTreeMap<String, Vec<ClauseConfig>>,
) -> Result<Vec<FieldTest>, SelectorError> {
    group
        .iter()
        .map(|(name, clauses)| {
            let field: Field = name.parse()?;
            let matchers = clauses
                .iter()
                .map(|clause| compile_clause(name, clause))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FieldTest { field, matchers })
        })
        .collect()
}

fn compile_clause(field: &str, clause: &ClauseConfig) -> Result<Matcher, SelectorError> {
    match (&clause.match_value, &clause.regex) {
        (Some(value), None) => Ok(Matcher::Exact {
            value: value.clone(),
            case_sensitive: clause.case_sensitive,
        }),
        (None, Some(pattern)) => Regex::new(pattern)
            .map(Matcher::Pattern)
            .map_err(|e| SelectorError::InvalidRegex {
                field: field.to_string(),
                message: e.to_string(),
            }),
        _ => Err(SelectorError::AmbiguousClause(field.to_string())),
    }
}

impl RecordSelector for FieldSelector {
    fn accepts(&self, record: &IndexRecord) -> bool {
        self.must.iter().all(|t| t.matches(record))
            && !self.must_not.iter().any(|t| t.matches(record))
            && (self.should.is_empty() || self.should.iter().any(|t| t.matches(record)))
    }
}
