//! In-memory search backend
//!
//! A self-contained [`SearchBackend`] over records held in memory,
//! partitioned into named shards. It implements the slice of the backend
//! query language the retrieval core emits: `*:*`, `field:value`,
//! `field:"phrase"` (exact or token-sequence containment), `AND`/`OR`
//! grouping with parentheses and `^boost` weights, with a simple
//! IDF-weighted score so lenient disjunctions rank rare matches first.
//!
//! The production system talks to a remote index; this backend exists for
//! tests and local experiments, plus fault hooks to exercise the failure
//! paths (per-shard page errors, failing generation probes).

use crate::error::WarcdexError;
use crate::record::{FieldValue, Record};
use crate::sort::RecordComparator;
use crate::transport::{Cursor, PageQuery, PageResponse, SearchBackend, ShardDescriptor};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

struct MemoryShard {
    name: String,
    records: Vec<Record>,
}

struct State {
    shards: Vec<MemoryShard>,
    failing_shards: Vec<String>,
}

/// In-memory implementation of [`SearchBackend`].
pub struct MemoryBackend {
    state: Mutex<State>,
    generation: AtomicU64,
    generation_probe_failing: AtomicBool,
    coarse_time_sort: AtomicBool,
    page_calls: AtomicU64,
    epoch: u64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                shards: Vec::new(),
                failing_shards: Vec::new(),
            }),
            generation: AtomicU64::new(1),
            generation_probe_failing: AtomicBool::new(false),
            coarse_time_sort: AtomicBool::new(false),
            page_calls: AtomicU64::new(0),
            epoch: 1,
        }
    }

    /// Add a record to `shard`, creating the shard on first use.
    pub fn add_record(&self, shard: &str, record: Record) {
        let mut state = self.state.lock();
        if let Some(existing) = state.shards.iter_mut().find(|s| s.name == shard) {
            existing.records.push(record);
            return;
        }
        state.shards.push(MemoryShard {
            name: shard.to_string(),
            records: vec![record],
        });
    }

    /// Advance the index generation, as a reindex would.
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Make [`SearchBackend::index_generation`] fail until reset.
    pub fn set_generation_probe_failing(&self, failing: bool) {
        self.generation_probe_failing.store(failing, Ordering::Relaxed);
    }

    /// Make page fetches restricted to `shard` fail with a transport
    /// error.
    pub fn fail_pages_for_shard(&self, shard: &str) {
        self.state.lock().failing_shards.push(shard.to_string());
    }

    /// Emulate the production backend's unstable distance sort: time
    /// distances compare at 10-minute granularity only, so near-tied
    /// candidates fall back to the id tie-break instead of exact order.
    pub fn set_coarse_time_sort(&self, coarse: bool) {
        self.coarse_time_sort.store(coarse, Ordering::Relaxed);
    }

    /// Number of page fetches served so far.
    pub fn page_calls(&self) -> u64 {
        self.page_calls.load(Ordering::Relaxed)
    }

    fn matches(&self, query: &PageQuery) -> Result<Vec<Record>> {
        let state = self.state.lock();
        for shard in &query.shards {
            if state.failing_shards.contains(shard) {
                return Err(WarcdexError::transport(
                    "page fetch",
                    format!("shard '{}' is unreachable", shard),
                ));
            }
        }
        let corpus: Vec<&Record> = state
            .shards
            .iter()
            .filter(|s| query.shards.is_empty() || query.shards.contains(&s.name))
            .flat_map(|s| s.records.iter())
            .collect();

        let predicate = QueryNode::parse(&query.query)?;
        let filters = query
            .filters
            .iter()
            .map(|f| QueryNode::parse(f))
            .collect::<Result<Vec<_>>>()?;
        let idf = predicate.idf_table(&corpus);

        let mut records: Vec<Record> = Vec::new();
        for record in corpus {
            let score = match predicate.evaluate(record, &idf) {
                Some(score) => score,
                None => continue,
            };
            if !filters.iter().all(|f| f.evaluate(record, &HashMap::new()).is_some()) {
                continue;
            }
            let mut matched = record.clone();
            matched.set("score", FieldValue::Float(score));
            records.push(matched);
        }

        // Sorting happens on the full records, like a real backend; field
        // projection only narrows the response. sort_by is stable, so
        // records comparing equal keep insertion order, which the id
        // tie-break makes irrelevant in practice.
        if self.coarse_time_sort.load(Ordering::Relaxed) {
            records.sort_by(|a, b| coarse_compare(&query.sort, a, b));
        } else {
            let comparator = RecordComparator::new(query.sort.to_vec());
            records.sort_by(|a, b| comparator.compare(a, b));
        }

        if !query.fields.is_empty() {
            records = records
                .into_iter()
                .map(|record| {
                    let mut projected = Record::new();
                    for field in &query.fields {
                        if let Some(value) = record.get(field) {
                            projected.set(field.clone(), value.clone());
                        }
                    }
                    if let Some(score) = record.get("score") {
                        projected.set("score", score.clone());
                    }
                    projected
                })
                .collect();
        }
        Ok(records)
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn page(&self, query: &PageQuery) -> Result<PageResponse> {
        self.page_calls.fetch_add(1, Ordering::Relaxed);
        let records = self.matches(query)?;
        let num_found = records.len() as u64;

        let offset = match query.cursor.as_token() {
            "*" => 0usize,
            token => token
                .strip_prefix("mark-")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| {
                    WarcdexError::transport("page fetch", format!("unknown cursor token '{}'", token))
                })?,
        };
        let end = records.len().min(offset.saturating_add(query.rows));
        let page: Vec<Record> = records
            .get(offset..end)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        // The cursor stops advancing once the result set is drained.
        let next = Cursor::from_token(format!("mark-{}", end.max(offset)));
        Ok(PageResponse {
            records: page,
            num_found,
            next_cursor: next,
        })
    }

    async fn count(&self, query: &str, filters: &[String]) -> Result<u64> {
        let probe = PageQuery {
            query: query.to_string(),
            filters: filters.to_vec(),
            fields: vec!["id".to_string()],
            sort: Vec::new(),
            rows: 0,
            cursor: Cursor::start(),
            shards: Vec::new(),
        };
        Ok(self.matches(&probe)?.len() as u64)
    }

    async fn shard_topology(&self) -> Result<Vec<ShardDescriptor>> {
        let state = self.state.lock();
        Ok(state
            .shards
            .iter()
            .map(|s| ShardDescriptor {
                endpoint: s.name.clone(),
                epoch: self.epoch,
            })
            .collect())
    }

    async fn index_generation(&self) -> Result<u64> {
        if self.generation_probe_failing.load(Ordering::Relaxed) {
            return Err(WarcdexError::transport(
                "index generation probe",
                "backend unreachable",
            ));
        }
        Ok(self.generation.load(Ordering::Relaxed))
    }
}

/// Parsed query predicate.
enum QueryNode {
    MatchAll,
    Term {
        field: String,
        value: String,
        boost: f64,
    },
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Term {
        field: String,
        value: String,
        boost: f64,
    },
}

impl QueryNode {
    fn parse(input: &str) -> Result<QueryNode> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let node = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parse_error(input, "trailing tokens"));
        }
        Ok(node)
    }

    /// Inverse document frequencies of every term in this predicate over
    /// `corpus`, so disjunctions rank rarer matches higher.
    fn idf_table(&self, corpus: &[&Record]) -> HashMap<(String, String), f64> {
        let mut table = HashMap::new();
        self.collect_terms(&mut |field, value| {
            let key = (field.to_string(), value.to_string());
            if table.contains_key(&key) {
                return;
            }
            let df = corpus
                .iter()
                .filter(|record| field_matches(record, field, value))
                .count();
            let idf = ((corpus.len() as f64 + 1.0) / (df as f64 + 1.0)).ln() + 1.0;
            table.insert(key, idf);
        });
        table
    }

    fn collect_terms(&self, visit: &mut impl FnMut(&str, &str)) {
        match self {
            Self::MatchAll => {}
            Self::Term { field, value, .. } => visit(field, value),
            Self::And(nodes) | Self::Or(nodes) => {
                for node in nodes {
                    node.collect_terms(visit);
                }
            }
        }
    }

    /// Score of `record` under this predicate; `None` when it does not
    /// match.
    fn evaluate(&self, record: &Record, idf: &HashMap<(String, String), f64>) -> Option<f64> {
        match self {
            Self::MatchAll => Some(0.0),
            Self::Term { field, value, boost } => {
                if field_matches(record, field, value) {
                    let weight = idf
                        .get(&(field.clone(), value.clone()))
                        .copied()
                        .unwrap_or(1.0);
                    Some(boost * weight)
                } else {
                    None
                }
            }
            Self::And(nodes) => {
                let mut total = 0.0;
                for node in nodes {
                    total += node.evaluate(record, idf)?;
                }
                Some(total)
            }
            Self::Or(nodes) => {
                let mut total = 0.0;
                let mut matched = false;
                for node in nodes {
                    if let Some(score) = node.evaluate(record, idf) {
                        total += score;
                        matched = true;
                    }
                }
                matched.then_some(total)
            }
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<QueryNode> {
        let mut nodes = vec![self.parse_and()?];
        while self.eat(&Token::Or) {
            nodes.push(self.parse_and()?);
        }
        Ok(if nodes.len() == 1 {
            nodes.pop().expect("one node")
        } else {
            QueryNode::Or(nodes)
        })
    }

    fn parse_and(&mut self) -> Result<QueryNode> {
        let mut nodes = vec![self.parse_unit()?];
        while self.eat(&Token::And) {
            nodes.push(self.parse_unit()?);
        }
        Ok(if nodes.len() == 1 {
            nodes.pop().expect("one node")
        } else {
            QueryNode::And(nodes)
        })
    }

    fn parse_unit(&mut self) -> Result<QueryNode> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let node = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(parse_error("", "missing closing parenthesis"));
                }
                Ok(node)
            }
            Some(Token::Term { field, value, boost }) => {
                self.pos += 1;
                if field == "*" && value == "*" {
                    Ok(QueryNode::MatchAll)
                } else {
                    Ok(QueryNode::Term { field, value, boost })
                }
            }
            other => Err(parse_error("", format!("unexpected token {:?}", other))),
        }
    }
}

fn parse_error(input: &str, reason: impl std::fmt::Display) -> WarcdexError {
    WarcdexError::transport("query parse", format!("{}: {}", reason, input))
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut chars = input.chars().peekable();
    let mut tokens = Vec::new();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '(' {
            chars.next();
            tokens.push(Token::LParen);
            continue;
        }
        if c == ')' {
            chars.next();
            tokens.push(Token::RParen);
            continue;
        }
        let mut word = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() || c == '(' || c == ')' || c == ':' {
                break;
            }
            word.push(c);
            chars.next();
        }
        if chars.peek() == Some(&':') {
            chars.next();
            let value = if chars.peek() == Some(&'"') {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err(parse_error(input, "dangling escape")),
                        },
                        Some('"') => break,
                        Some(c) => value.push(c),
                        None => return Err(parse_error(input, "unterminated phrase")),
                    }
                }
                value
            } else {
                let mut value = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == ')' || c == '^' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
                value
            };
            let boost = if chars.peek() == Some(&'^') {
                chars.next();
                let mut digits = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        digits.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                digits
                    .parse()
                    .map_err(|_| parse_error(input, "invalid boost"))?
            } else {
                1.0
            };
            tokens.push(Token::Term {
                field: word,
                value,
                boost,
            });
        } else {
            match word.as_str() {
                "AND" => tokens.push(Token::And),
                "OR" => tokens.push(Token::Or),
                other => return Err(parse_error(input, format!("bare word '{}'", other))),
            }
        }
    }
    Ok(tokens)
}

/// Sort with time distances truncated to 10-minute buckets, modelling a
/// backend whose timestamp precision step is too coarse for exact
/// distance ordering.
fn coarse_compare(
    clauses: &[crate::sort::SortClause],
    a: &Record,
    b: &Record,
) -> std::cmp::Ordering {
    use crate::sort::{time_distance_ms, SortKey, SortOrder};
    const BUCKET_MS: i64 = 10 * 60 * 1000;
    for clause in clauses {
        let ordering = match &clause.key {
            SortKey::TimeDistance { field, anchor } => {
                let da = time_distance_ms(a, field, anchor).map(|d| d / BUCKET_MS);
                let db = time_distance_ms(b, field, anchor).map(|d| d / BUCKET_MS);
                let natural = match (da, db) {
                    (Some(da), Some(db)) => da.cmp(&db),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                match clause.order {
                    SortOrder::Asc => natural,
                    SortOrder::Desc => natural.reverse(),
                }
            }
            SortKey::Field(_) => clause.compare(a, b),
        };
        if ordering != std::cmp::Ordering::Equal {
            return ordering;
        }
    }
    std::cmp::Ordering::Equal
}

/// Term match: exact equality on the rendered value, or containment of
/// the phrase as a whitespace token sequence (tokenized text fields).
fn field_matches(record: &Record, field: &str, value: &str) -> bool {
    match record.get(field) {
        Some(FieldValue::Multi(values)) => values
            .iter()
            .any(|v| value_matches(&v.to_string(), value)),
        Some(other) => value_matches(&other.to_string(), value),
        None => false,
    }
}

fn value_matches(text: &str, phrase: &str) -> bool {
    if text == phrase {
        return true;
    }
    let text_tokens: Vec<&str> = text.split_whitespace().collect();
    let phrase_tokens: Vec<&str> = phrase.split_whitespace().collect();
    if phrase_tokens.is_empty() || text_tokens.len() < phrase_tokens.len() {
        return false;
    }
    text_tokens
        .windows(phrase_tokens.len())
        .any(|window| window == phrase_tokens.as_slice())
}
