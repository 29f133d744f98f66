//! Predicate compilation and evaluation.
//!
//! Rules are validated and their patterns compiled once, through a
//! [`RegexCache`], before any series is looked at. Evaluation never sees a
//! malformed rule.

use crate::error::{BurrowError, Result};
use crate::index::key::SeriesKey;
use crate::index::tag::{Operator, TagRule};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Patterns kept before the cache is cleared.
pub const DEFAULT_REGEX_CACHE_CAPACITY: usize = 1024;

/// Series selection used by [`crate::Shard::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Predicate {
    /// Restricts the match to one measurement.
    pub measurement: Option<String>,
    /// Clauses that must all hold.
    pub rules: Vec<TagRule>,
    /// Restricts the rows to one field.
    pub field: Option<String>,
}

impl Predicate {
    /// Matches every series of `measurement`.
    pub fn measurement(measurement: impl Into<String>) -> Self {
        Self {
            measurement: Some(measurement.into()),
            ..Self::default()
        }
    }

    /// Adds a rule.
    pub fn with_rule(mut self, rule: TagRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Restricts the result to one field.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Compiled regular expressions keyed by pattern text.
#[derive(Debug)]
pub struct RegexCache {
    patterns: Mutex<HashMap<String, Arc<Regex>>>,
    capacity: usize,
}

impl Default for RegexCache {
    fn default() -> Self {
        Self::new(DEFAULT_REGEX_CACHE_CAPACITY)
    }
}

impl RegexCache {
    /// Creates a cache holding at most `capacity` patterns.
    pub fn new(capacity: usize) -> Self {
        Self {
            patterns: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns the compiled form of `pattern`, compiling it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::InvalidPattern`] if the pattern does not compile.
    pub fn get(&self, pattern: &str) -> Result<Arc<Regex>> {
        if let Some(regex) = self
            .patterns
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(pattern)
        {
            return Ok(Arc::clone(regex));
        }

        let regex = Arc::new(Regex::new(pattern).map_err(|e| BurrowError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?);

        let mut patterns = self.patterns.lock().unwrap_or_else(|err| err.into_inner());
        if patterns.len() >= self.capacity {
            patterns.clear();
        }
        patterns.insert(pattern.to_string(), Arc::clone(&regex));
        Ok(regex)
    }

    /// Number of cached patterns.
    pub fn len(&self) -> usize {
        self.patterns
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a compiled rule tests a tag value.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Exact equality.
    Equal(String),
    /// Exact inequality.
    NotEqual(String),
    /// Unanchored regex match.
    Regex(Arc<Regex>),
    /// Unanchored regex non-match.
    NotRegex(Arc<Regex>),
}

impl Matcher {
    /// Tests a present tag value.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Equal(expected) => value == expected,
            Matcher::NotEqual(expected) => value != expected,
            Matcher::Regex(regex) => regex.is_match(value),
            Matcher::NotRegex(regex) => !regex.is_match(value),
        }
    }

    /// Result for a series that does not carry the tag at all.
    pub fn matches_absent(&self) -> bool {
        matches!(self, Matcher::NotEqual(_) | Matcher::NotRegex(_))
    }

    /// Tests an optional tag value.
    pub fn matches_opt(&self, value: Option<&str>) -> bool {
        match value {
            Some(value) => self.matches(value),
            None => self.matches_absent(),
        }
    }
}

/// A validated rule ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// Tag key the rule reads.
    pub key: String,
    /// Comparison against the tag value.
    pub matcher: Matcher,
}

impl CompiledRule {
    /// Validates and compiles one rule.
    pub fn compile(rule: &TagRule, cache: &RegexCache) -> Result<Self> {
        rule.validate()?;
        let value = &rule.tag.value;
        let matcher = match rule.operator {
            Operator::Equal => Matcher::Equal(value.clone()),
            Operator::NotEqual => Matcher::NotEqual(value.clone()),
            Operator::RegexEqual => Matcher::Regex(cache.get(value)?),
            Operator::NotRegexEqual => Matcher::NotRegex(cache.get(value)?),
        };
        Ok(Self {
            key: rule.tag.key.clone(),
            matcher,
        })
    }

    /// Evaluates the rule against one series.
    pub fn matches(&self, series: &SeriesKey) -> bool {
        self.matcher.matches_opt(series.tag(&self.key))
    }
}

/// Compiles every rule, failing on the first invalid one.
pub fn compile_rules(rules: &[TagRule], cache: &RegexCache) -> Result<Vec<CompiledRule>> {
    rules
        .iter()
        .map(|rule| CompiledRule::compile(rule, cache))
        .collect()
}

/// Evaluates `measurement` and `rules` against one series without consulting
/// any posting list.
pub fn matches_series(
    series: &SeriesKey,
    measurement: Option<&str>,
    rules: &[CompiledRule],
) -> bool {
    if let Some(measurement) = measurement {
        if series.measurement() != measurement {
            return false;
        }
    }
    rules.iter().all(|rule| rule.matches(series))
}
