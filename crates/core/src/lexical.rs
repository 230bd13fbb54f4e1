use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

pub(crate) type CachedPattern = OnceLock<Result<Regex, regex::Error>>;

/// Compiles `source` into `cell` on first use. A pattern that fails to
/// compile keeps failing with the same error on every call.
pub(crate) fn cached_pattern(
    cell: &'static CachedPattern,
    source: &str,
) -> Result<&'static Regex, regex::Error> {
    cell.get_or_init(|| Regex::new(source))
        .as_ref()
        .map_err(Clone::clone)
}

fn word_pattern() -> Result<&'static Regex, regex::Error> {
    static PATTERN: CachedPattern = OnceLock::new();
    cached_pattern(&PATTERN, r"\w+")
}

/// Distinct lower-cased word tokens of a query, in first-seen order.
pub fn query_tokens(query: &str) -> Result<Vec<String>, regex::Error> {
    let lowered = query.to_lowercase();
    let mut seen = BTreeSet::new();
    Ok(word_pattern()?
        .find_iter(&lowered)
        .map(|token| token.as_str().to_string())
        .filter(|token| seen.insert(token.clone()))
        .collect())
}

/// Number of distinct query tokens found as case-insensitive substrings of `text`.
pub fn keyword_score(text: &str, query: &str) -> Result<f64, regex::Error> {
    if text.is_empty() || query.is_empty() {
        return Ok(0.0);
    }

    let lowered = text.to_lowercase();
    Ok(query_tokens(query)?
        .iter()
        .filter(|token| lowered.contains(token.as_str()))
        .count() as f64)
}
