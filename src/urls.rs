//! URL canonicalization and query helpers
//!
//! Captures are indexed under a canonicalized URL (`url_norm`): lowercase
//! host, `www.` prefix stripped, `https` folded to `http`, default ports
//! and trailing slashes removed. Canonicalization is intentionally lossy;
//! the resolution engine re-applies protocol and trailing-slash rules on
//! the original URLs after the fact.
//!
//! Also here: phrase quoting for embedding URLs in query predicates and
//! the host/path/query token split used by the lenient fallback search.

/// Canonicalize a URL the way the index normalizes `url_norm`.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("http".to_string(), url),
    };
    let scheme = if scheme == "https" { "http".to_string() } else { scheme };

    let (authority, tail) = match rest.find(['/', '?', '#']) {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let mut host = authority.to_ascii_lowercase();
    if let Some(stripped) = host.strip_prefix("www.") {
        host = stripped.to_string();
    }
    for default_port in [":80", ":443"] {
        if let Some(stripped) = host.strip_suffix(default_port) {
            host = stripped.to_string();
        }
    }

    let mut tail = tail.to_string();
    // Fragments never reach the index.
    if let Some(idx) = tail.find('#') {
        tail.truncate(idx);
    }
    // A trailing slash and its absence normalize identically.
    if let Some(path_end) = tail.find('?') {
        let (path, query) = tail.split_at(path_end);
        tail = format!("{}{}", path.trim_end_matches('/'), query);
    } else {
        tail = tail.trim_end_matches('/').to_string();
    }

    format!("{}://{}{}", scheme, host, tail)
}

/// Quote a value as an exact-match phrase for a query predicate,
/// escaping embedded quotes and backslashes.
pub fn create_phrase(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('"');
    escaped
}

/// Host part of a URL, canonicalized like [`normalize_url`] does.
pub fn host_of(url: &str) -> Option<String> {
    let rest = url.trim().split_once("://").map(|(_, r)| r)?;
    let authority = match rest.find(['/', '?', '#']) {
        Some(idx) => &rest[..idx],
        None => rest,
    };
    if authority.is_empty() {
        return None;
    }
    let mut host = authority.to_ascii_lowercase();
    if let Some(stripped) = host.strip_prefix("www.") {
        host = stripped.to_string();
    }
    if let Some(idx) = host.find(':') {
        host.truncate(idx);
    }
    Some(host)
}

/// Significant path segments of a URL, in order.
pub fn path_tokens(url: &str) -> Vec<String> {
    let rest = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    };
    let tail = match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => return Vec::new(),
    };
    let path = match tail.find(['?', '#']) {
        Some(idx) => &tail[..idx],
        None => tail,
    };
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// `key=value` query parameters of a URL, in order.
pub fn query_tokens(url: &str) -> Vec<String> {
    let query = match url.split_once('?') {
        Some((_, query)) => query,
        None => return Vec::new(),
    };
    let query = match query.find('#') {
        Some(idx) => &query[..idx],
        None => query,
    };
    query
        .split('&')
        .filter(|param| !param.is_empty())
        .map(str::to_string)
        .collect()
}

/// True when both URLs use the same protocol (http vs https). Protocol is
/// not part of the canonical form, so mixed-protocol matches must be
/// filtered on the original URLs.
pub fn same_protocol(a: &str, b: &str) -> bool {
    (a.starts_with("http://") && b.starts_with("http://"))
        || (a.starts_with("https://") && b.starts_with("https://"))
}
