//! Request URI templates of REST operations.
//!
//! A template is a path made of literal segments, `{Label}` segments and at
//! most one trailing greedy `{Label+}` segment, optionally followed by
//! required query literals: `/{Bucket}/{Key+}?uploads`,
//! `/{Bucket}?list-type=2`.

use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;

use percent_encoding::percent_decode_str;

/// Malformed template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template {0:?}: unclosed label")]
    UnclosedLabel(String),
    #[error("template {0:?}: empty label")]
    EmptyLabel(String),
    #[error("template {0:?}: greedy label must be the last segment")]
    GreedyNotLast(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `prefix{name}suffix` matching exactly one non-empty segment.
    Label { name: String, prefix: String, suffix: String },
    /// `{name+}` matching one or more trailing segments.
    Greedy { name: String, prefix: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueryLiteral {
    key: String,
    value: Option<String>,
}

/// Specificity of a template; greater is more specific.
///
/// Ordered by literal prefix length, then fewer wildcard segments, then no
/// greedy segment over a greedy one, then more required query literals.
pub type Specificity = (usize, Reverse<usize>, Reverse<usize>, usize);

/// A parsed request URI template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    raw: String,
    segments: Vec<Segment>,
    query: Vec<QueryLiteral>,
    literal_prefix: usize,
}

impl UriTemplate {
    /// Parses a `requestUri`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] for unclosed or empty labels and for greedy
    /// labels that are not in the final segment.
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let (path, query) = raw.split_once('?').unwrap_or((raw, ""));
        let literal_prefix = path.find('{').unwrap_or(path.len());

        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let Some(open) = part.find('{') else {
                segments.push(Segment::Literal((*part).to_string()));
                continue;
            };
            let close = part
                .find('}')
                .ok_or_else(|| TemplateError::UnclosedLabel(raw.to_string()))?;
            if close < open {
                return Err(TemplateError::UnclosedLabel(raw.to_string()));
            }
            let label = &part[open + 1..close];
            let prefix = part[..open].to_string();
            let suffix = part[close + 1..].to_string();
            if let Some(name) = label.strip_suffix('+') {
                if i + 1 != parts.len() || !suffix.is_empty() {
                    return Err(TemplateError::GreedyNotLast(raw.to_string()));
                }
                if name.is_empty() {
                    return Err(TemplateError::EmptyLabel(raw.to_string()));
                }
                segments.push(Segment::Greedy { name: name.to_string(), prefix });
            } else {
                if label.is_empty() {
                    return Err(TemplateError::EmptyLabel(raw.to_string()));
                }
                segments.push(Segment::Label { name: label.to_string(), prefix, suffix });
            }
        }

        let query = query
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => QueryLiteral { key: k.to_string(), value: Some(v.to_string()) },
                None => QueryLiteral { key: p.to_string(), value: None },
            })
            .collect();

        Ok(Self {
            raw: raw.to_string(),
            segments,
            query,
            literal_prefix,
        })
    }

    /// The template text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of label and greedy segments.
    #[must_use]
    pub fn wildcards(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| !matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Number of greedy segments; zero or one.
    #[must_use]
    pub fn greedy(&self) -> usize {
        self.segments.iter().filter(|s| matches!(s, Segment::Greedy { .. })).count()
    }

    /// Ranking key among templates that match the same request.
    #[must_use]
    pub fn specificity(&self) -> Specificity {
        (
            self.literal_prefix,
            Reverse(self.wildcards()),
            Reverse(self.greedy()),
            self.query.len(),
        )
    }

    /// Matches a raw (still percent-encoded) path and decoded query pairs.
    ///
    /// Returns the decoded label values on success.
    #[must_use]
    pub fn matches(&self, path: &str, query: &[(String, String)]) -> Option<BTreeMap<String, String>> {
        let required_query = self.query.iter().all(|lit| {
            query
                .iter()
                .any(|(k, v)| *k == lit.key && lit.value.as_ref().map_or(true, |want| want == v))
        });
        if !required_query {
            return None;
        }

        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let mut params = BTreeMap::new();
        let mut i = 0;
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    let part = parts.get(i)?;
                    if decode(part) != *lit {
                        return None;
                    }
                    i += 1;
                }
                Segment::Label { name, prefix, suffix } => {
                    let part = parts.get(i)?;
                    let inner = part.strip_prefix(prefix.as_str())?.strip_suffix(suffix.as_str())?;
                    if inner.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), decode(inner));
                    i += 1;
                }
                Segment::Greedy { name, prefix } => {
                    let rest = parts.get(i..)?.join("/");
                    let inner = rest.strip_prefix(prefix.as_str())?;
                    if inner.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), decode(inner));
                    i = parts.len();
                }
            }
        }
        (i == parts.len()).then_some(params)
    }
}

fn decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Outcome of ranking several candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ranked<T> {
    None,
    Unique(T),
    /// Several candidates share the best specificity.
    Tie(Vec<T>),
}

/// Picks the most specific candidate. Candidates carry their template's
/// specificity.
pub fn rank<T>(candidates: Vec<(Specificity, T)>) -> Ranked<T> {
    let Some(best) = candidates.iter().map(|(s, _)| *s).max() else {
        return Ranked::None;
    };
    let mut top: Vec<T> = candidates
        .into_iter()
        .filter(|(s, _)| s.cmp(&best) == Ordering::Equal)
        .map(|(_, t)| t)
        .collect();
    if top.len() == 1 {
        top.pop().map_or(Ranked::None, Ranked::Unique)
    } else {
        Ranked::Tie(top)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
