//! Archived-page records
//!
//! A [`Record`] is one row of the external document index: a mapping from
//! field name to one-or-many scalar values. Records are schemaless on the
//! wire; typed accessors cover the essential fields the retrieval core
//! works with (`id`, `url`, `url_norm`, `crawl_date`, `status_code`,
//! `source_file_path`, `source_file_offset`, `content_type_norm`).

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// One scalar (or list of scalars) stored in a record field.
///
/// Deserialization is untagged: JSON integers become [`FieldValue::Int`],
/// floats [`FieldValue::Float`], RFC 3339 strings [`FieldValue::Time`] and
/// all other strings [`FieldValue::Str`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Time(DateTime<Utc>),
    Str(String),
    Multi(Vec<FieldValue>),
}

impl FieldValue {
    /// String content, for `Str` values only.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric content, widening `Int` only.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Timestamp content. `Str` values holding an ISO timestamp parse lazily,
    /// as backends commonly ship dates as plain strings.
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Time(t) => Some(*t),
            Self::Str(s) => parse_iso_timestamp(s),
            _ => None,
        }
    }

    /// Compare two values for sorting. Same-type comparisons are natural;
    /// mixed types fall back to comparing display forms so that a sort
    /// never panics on a heterogeneous field.
    pub fn compare(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
            (Self::Time(a), Self::Time(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => match (parse_iso_timestamp(a), parse_iso_timestamp(b)) {
                (Some(ta), Some(tb)) => ta.cmp(&tb),
                _ => a.cmp(b),
            },
            (Self::Time(_), Self::Str(_)) | (Self::Str(_), Self::Time(_)) => {
                match (self.as_time(), other.as_time()) {
                    (Some(ta), Some(tb)) => ta.cmp(&tb),
                    _ => self.to_string().cmp(&other.to_string()),
                }
            }
            _ => self.to_string().cmp(&other.to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Float(n) => write!(f, "{}", n),
            Self::Time(t) => write!(f, "{}", t.format("%Y-%m-%dT%H:%M:%SZ")),
            Self::Str(s) => write!(f, "{}", s),
            Self::Multi(vs) => {
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Time(t)
    }
}

/// Parse the strict backend timestamp form `YYYY-MM-DDTHH:MM:SSZ`
/// (fractional seconds allowed).
pub fn parse_iso_timestamp(s: &str) -> Option<DateTime<Utc>> {
    for format in ["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S%.fZ"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Opaque locator of the raw capture bytes: container path plus byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePointer {
    pub path: String,
    pub offset: u64,
}

/// One archived-page record.
///
/// Field names are ordered (BTreeMap) so that serialized forms are
/// canonical, which the caching layer relies on for signatures.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a field value.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Set a field value, replacing any previous value.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Builder-style variant of [`Record::set`].
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(field, value);
        self
    }

    /// Iterate over all fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Backend-assigned identity, unique within one index generation.
    pub fn id(&self) -> Option<&str> {
        self.get("id").and_then(FieldValue::as_str)
    }

    /// Original capture URL.
    pub fn url(&self) -> Option<&str> {
        self.get("url").and_then(FieldValue::as_str)
    }

    /// Canonicalized capture URL.
    pub fn url_norm(&self) -> Option<&str> {
        self.get("url_norm").and_then(FieldValue::as_str)
    }

    /// Capture timestamp.
    pub fn crawl_date(&self) -> Option<DateTime<Utc>> {
        self.get("crawl_date").and_then(FieldValue::as_time)
    }

    /// HTTP status code of the capture.
    pub fn status_code(&self) -> Option<i64> {
        match self.get("status_code") {
            Some(FieldValue::Int(n)) => Some(*n),
            Some(FieldValue::Str(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Normalized content type class (e.g. `html`, `image`).
    pub fn content_type_norm(&self) -> Option<&str> {
        self.get("content_type_norm").and_then(FieldValue::as_str)
    }

    /// Locator of the raw capture bytes, when both parts are present.
    pub fn source_pointer(&self) -> Option<SourcePointer> {
        let path = self.get("source_file_path")?.as_str()?.to_string();
        let offset = match self.get("source_file_offset")? {
            FieldValue::Int(n) => u64::try_from(*n).ok()?,
            FieldValue::Str(s) => s.parse().ok()?,
            _ => return None,
        };
        Some(SourcePointer { path, offset })
    }

    /// True when this record represents a page whose embedded resources
    /// can be expanded during streaming.
    pub fn is_page(&self) -> bool {
        self.content_type_norm() == Some("html")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let rec = Record::new()
            .with("id", "doc_1")
            .with("url", "https://example.org/foo")
            .with("url_norm", "http://example.org/foo")
            .with("status_code", 200)
            .with("crawl_date", "2022-11-04T13:51:00Z")
            .with("content_type_norm", "html")
            .with("source_file_path", "some.warc")
            .with("source_file_offset", 87);

        assert_eq!(rec.id(), Some("doc_1"));
        assert_eq!(rec.status_code(), Some(200));
        assert!(rec.is_page());
        assert_eq!(
            rec.crawl_date().unwrap(),
            parse_iso_timestamp("2022-11-04T13:51:00Z").unwrap()
        );
        let ptr = rec.source_pointer().unwrap();
        assert_eq!(ptr.path, "some.warc");
        assert_eq!(ptr.offset, 87);
    }

    #[test]
    fn test_iso_timestamp_rejects_garbage() {
        assert!(parse_iso_timestamp("2022-11-04T13:51:00Z").is_some());
        assert!(parse_iso_timestamp("2022-11-04T13:51:00.123Z").is_some());
        assert!(parse_iso_timestamp("last tuesday").is_none());
        assert!(parse_iso_timestamp("2022-11-04").is_none());
    }

    #[test]
    fn test_value_comparison_orders_timestamps_chronologically() {
        let a = FieldValue::from("2018-11-04T13:51:00Z");
        let b = FieldValue::from("2022-11-04T11:51:00Z");
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&a), Ordering::Greater);
    }

    #[test]
    fn test_json_round_trip_keeps_numbers() {
        let rec = Record::new().with("id", "a").with("source_file_offset", 42);
        let json = serde_json::to_string(&rec).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get("source_file_offset"), Some(&FieldValue::Int(42)));
    }
}
