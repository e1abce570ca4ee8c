//! Sort keys and record comparators
//!
//! The declared sort of a request is an ordered list of [`SortClause`]s
//! ending in a mandatory tie-break on `id`. Two kinds of keys exist: a
//! plain field sort and a time-distance sort (absolute distance between a
//! record's `crawl_date` and a fixed anchor), which powers nearest-in-time
//! resolution. The same comparator drives both local re-ranking and the
//! k-way merge across shard streams, so its ordering must be total for
//! any two records carrying the sorted fields.

use crate::error::WarcdexError;
use crate::record::{parse_iso_timestamp, Record};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// What a sort clause keys on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SortKey {
    /// Natural order of a record field.
    Field(String),
    /// Absolute time distance between `field` and `anchor`, in milliseconds.
    TimeDistance {
        field: String,
        anchor: DateTime<Utc>,
    },
}

/// One element of a declared sort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortClause {
    pub key: SortKey,
    pub order: SortOrder,
}

impl SortClause {
    /// Ascending sort on a field.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            key: SortKey::Field(field.into()),
            order: SortOrder::Asc,
        }
    }

    /// Descending sort on a field.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            key: SortKey::Field(field.into()),
            order: SortOrder::Desc,
        }
    }

    /// Ascending sort on absolute time distance to `anchor`.
    pub fn time_distance(field: impl Into<String>, anchor: DateTime<Utc>) -> Self {
        Self {
            key: SortKey::TimeDistance {
                field: field.into(),
                anchor,
            },
            order: SortOrder::Asc,
        }
    }

    /// Field name this clause reads from the record.
    pub fn field(&self) -> &str {
        match &self.key {
            SortKey::Field(f) => f,
            SortKey::TimeDistance { field, .. } => field,
        }
    }

    /// Compare two records under this clause alone.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let natural = match &self.key {
            SortKey::Field(field) => match (a.get(field), b.get(field)) {
                (Some(va), Some(vb)) => va.compare(vb),
                // Records missing the sorted field collate last.
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            SortKey::TimeDistance { field, anchor } => {
                let da = time_distance_ms(a, field, anchor);
                let db = time_distance_ms(b, field, anchor);
                match (da, db) {
                    (Some(da), Some(db)) => da.cmp(&db),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            }
        };
        match self.order {
            SortOrder::Asc => natural,
            SortOrder::Desc => natural.reverse(),
        }
    }
}

impl fmt::Display for SortClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.order {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        };
        match &self.key {
            SortKey::Field(field) => write!(f, "{} {}", field, dir),
            SortKey::TimeDistance { field, anchor } => write!(
                f,
                "abs(sub(ms({}), {})) {}",
                anchor.format("%Y-%m-%dT%H:%M:%SZ"),
                field,
                dir
            ),
        }
    }
}

/// Absolute distance in milliseconds between the record's timestamp field
/// and the anchor. `None` when the field is missing or unparseable.
pub fn time_distance_ms(record: &Record, field: &str, anchor: &DateTime<Utc>) -> Option<i64> {
    let t = record.get(field)?.as_time()?;
    Some((anchor.timestamp_millis() - t.timestamp_millis()).abs())
}

/// Comparator over a full sort clause list.
///
/// Clauses are applied in order; the first non-equal clause decides. With
/// the mandatory `id` tie-break in place the ordering is total, which the
/// merge frontier depends on.
#[derive(Debug, Clone)]
pub struct RecordComparator {
    clauses: Vec<SortClause>,
}

impl RecordComparator {
    pub fn new(clauses: Vec<SortClause>) -> Self {
        Self { clauses }
    }

    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for clause in &self.clauses {
            match clause.compare(a, b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// True when `records` is in non-decreasing comparator order.
    pub fn is_sorted(&self, records: &[Record]) -> bool {
        records
            .windows(2)
            .all(|w| self.compare(&w[0], &w[1]) != Ordering::Greater)
    }
}

/// Reserved anchor name resolving to the earliest representable capture time.
const ANCHOR_OLDEST: &str = "oldest";
/// Reserved anchor name resolving to the latest representable capture time.
const ANCHOR_NEWEST: &str = "newest";

/// Parse a time anchor: `oldest`, `newest` or a strict ISO timestamp
/// (`YYYY-MM-DDTHH:MM:SSZ`, fractional seconds allowed).
pub fn parse_time_anchor(anchor: &str) -> Result<DateTime<Utc>> {
    match anchor {
        ANCHOR_OLDEST => Ok(parse_iso_timestamp("0001-01-01T00:00:01Z").expect("static timestamp")),
        ANCHOR_NEWEST => Ok(parse_iso_timestamp("9999-12-31T23:59:59Z").expect("static timestamp")),
        other => parse_iso_timestamp(other).ok_or_else(|| {
            WarcdexError::invalid_request(
                "time anchor",
                format!(
                    "'{}' matches neither 'oldest', 'newest' nor 'YYYY-MM-DDTHH:MM:SSZ'",
                    other
                ),
                "Supply the anchor as a Zulu ISO timestamp, e.g. 2014-01-03T11:56:58Z",
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, date: &str) -> Record {
        Record::new().with("id", id).with("crawl_date", date)
    }

    #[test]
    fn test_field_comparator_asc_and_desc() {
        let asc = RecordComparator::new(vec![SortClause::asc("crawl_date"), SortClause::asc("id")]);
        let desc = RecordComparator::new(vec![SortClause::desc("crawl_date"), SortClause::asc("id")]);

        let doc1 = doc("1", "2021-03-15T12:31:51Z");
        let doc2 = doc("2", "2021-03-15T12:31:52Z");

        assert_eq!(asc.compare(&doc1, &doc2), Ordering::Less);
        assert_eq!(asc.compare(&doc2, &doc1), Ordering::Greater);
        assert_eq!(desc.compare(&doc1, &doc2), Ordering::Greater);
    }

    #[test]
    fn test_id_tie_break_makes_order_total() {
        let cmp = RecordComparator::new(vec![SortClause::asc("crawl_date"), SortClause::asc("id")]);
        let doc1 = doc("1", "2021-03-15T12:31:51Z");
        let doc2 = doc("2", "2021-03-15T12:31:51Z");
        assert_eq!(cmp.compare(&doc1, &doc2), Ordering::Less);
        assert_eq!(cmp.compare(&doc1, &doc1), Ordering::Equal);
    }

    #[test]
    fn test_time_distance_prefers_nearest() {
        let anchor = parse_time_anchor("2020-01-01T00:10:00Z").unwrap();
        let cmp = RecordComparator::new(vec![
            SortClause::time_distance("crawl_date", anchor),
            SortClause::asc("id"),
        ]);
        let near = doc("far_id", "2020-01-01T00:08:00Z"); // 2 minutes away
        let far = doc("aaa_id", "2020-01-01T00:15:00Z"); // 5 minutes away
        assert_eq!(cmp.compare(&near, &far), Ordering::Less);
    }

    #[test]
    fn test_anchor_parsing() {
        assert!(parse_time_anchor("2014-01-03T11:56:58Z").is_ok());
        assert!(parse_time_anchor("newest").unwrap() > parse_time_anchor("oldest").unwrap());
        assert!(parse_time_anchor("not-a-time").is_err());
    }

    #[test]
    fn test_sort_expression_rendering() {
        assert_eq!(SortClause::desc("score").to_string(), "score desc");
        let anchor = parse_time_anchor("2014-01-03T11:56:58Z").unwrap();
        assert_eq!(
            SortClause::time_distance("crawl_date", anchor).to_string(),
            "abs(sub(ms(2014-01-03T11:56:58Z), crawl_date)) asc"
        );
    }

    #[test]
    fn test_is_sorted_detects_violations() {
        let cmp = RecordComparator::new(vec![SortClause::asc("crawl_date"), SortClause::asc("id")]);
        let sorted = vec![doc("1", "2019-01-01T00:00:00Z"), doc("2", "2020-01-01T00:00:00Z")];
        let unsorted = vec![doc("2", "2020-01-01T00:00:00Z"), doc("1", "2019-01-01T00:00:00Z")];
        assert!(cmp.is_sorted(&sorted));
        assert!(!cmp.is_sorted(&unsorted));
    }
}
