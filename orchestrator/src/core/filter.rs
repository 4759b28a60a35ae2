//! Test selection filters.
//!
//! A [`FilterSet`] combines include and exclude rules. The command builder
//! evaluates it once per test while computing the filtered closure.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::tree::{Test, TestTree};

/// Predicate over a single test.
#[derive(Clone)]
pub enum Filter {
    /// Matches every test.
    Any,
    Id(String),
    Name(String),
    FullName(String),
    NamePattern(Regex),
    Metadata { key: String, value: String },
    TestCase,
    Predicate(Arc<dyn Fn(&Test) -> bool + Send + Sync>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterParseError {
    #[error("empty filter expression")]
    Empty,
    #[error("unknown filter key '{0}'")]
    UnknownKey(String),
    #[error("filter '{0}' is missing a value")]
    MissingValue(String),
    #[error("metadata filter '{0}' must have the form metadata:KEY=VALUE")]
    MalformedMetadata(String),
    #[error("invalid regex in filter '{expr}': {message}")]
    InvalidRegex { expr: String, message: String },
}

impl Filter {
    pub fn id(id: impl Into<String>) -> Self {
        Filter::Id(id.into())
    }

    pub fn name(name: impl Into<String>) -> Self {
        Filter::Name(name.into())
    }

    pub fn full_name(full_name: impl Into<String>) -> Self {
        Filter::FullName(full_name.into())
    }

    pub fn metadata(key: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Metadata {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Test) -> bool + Send + Sync + 'static,
    {
        Filter::Predicate(Arc::new(predicate))
    }

    pub fn is_match(&self, tree: &TestTree, test: &Test) -> bool {
        match self {
            Filter::Any => true,
            Filter::Id(id) => test.id() == id,
            Filter::Name(name) => test.name() == name,
            Filter::FullName(full_name) => tree.full_name(test.index()) == *full_name,
            Filter::NamePattern(pattern) => pattern.is_match(test.name()),
            Filter::Metadata { key, value } => test.metadata().contains(key, value),
            Filter::TestCase => test.is_test_case(),
            Filter::Predicate(predicate) => predicate(test),
            Filter::And(filters) => filters.iter().all(|f| f.is_match(tree, test)),
            Filter::Or(filters) => filters.iter().any(|f| f.is_match(tree, test)),
            Filter::Not(inner) => !inner.is_match(tree, test),
        }
    }

    /// Parse a single `key:value` atom.
    ///
    /// Supported keys: `id`, `name`, `fullname`, `metadata` (`KEY=VALUE`) and
    /// the bare atoms `testcase` and `*`. A `name` value wrapped in slashes
    /// (`name:/^smoke/`) is a regex.
    pub fn parse(expr: &str) -> Result<Filter, FilterParseError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(FilterParseError::Empty);
        }
        if expr == "*" {
            return Ok(Filter::Any);
        }
        if expr.eq_ignore_ascii_case("testcase") {
            return Ok(Filter::TestCase);
        }

        let (key, value) = expr
            .split_once(':')
            .ok_or_else(|| FilterParseError::UnknownKey(expr.to_string()))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(FilterParseError::MissingValue(expr.to_string()));
        }

        match key.trim().to_ascii_lowercase().as_str() {
            "id" => Ok(Filter::id(value)),
            "fullname" => Ok(Filter::full_name(value)),
            "name" => match regex_literal(value) {
                Some(pattern) => Regex::new(pattern).map(Filter::NamePattern).map_err(|err| {
                    FilterParseError::InvalidRegex {
                        expr: expr.to_string(),
                        message: err.to_string(),
                    }
                }),
                None => Ok(Filter::name(value)),
            },
            "metadata" => {
                let (k, v) = value
                    .split_once('=')
                    .ok_or_else(|| FilterParseError::MalformedMetadata(expr.to_string()))?;
                Ok(Filter::metadata(k.trim(), v.trim()))
            }
            other => Err(FilterParseError::UnknownKey(other.to_string())),
        }
    }
}

fn regex_literal(value: &str) -> Option<&str> {
    value
        .strip_prefix('/')
        .and_then(|rest| rest.strip_suffix('/'))
        .filter(|pattern| !pattern.is_empty())
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Any => f.write_str("Any"),
            Filter::Id(id) => f.debug_tuple("Id").field(id).finish(),
            Filter::Name(name) => f.debug_tuple("Name").field(name).finish(),
            Filter::FullName(name) => f.debug_tuple("FullName").field(name).finish(),
            Filter::NamePattern(re) => f.debug_tuple("NamePattern").field(&re.as_str()).finish(),
            Filter::Metadata { key, value } => f
                .debug_struct("Metadata")
                .field("key", key)
                .field("value", value)
                .finish(),
            Filter::TestCase => f.write_str("TestCase"),
            Filter::Predicate(_) => f.write_str("Predicate(..)"),
            Filter::And(filters) => f.debug_tuple("And").field(filters).finish(),
            Filter::Or(filters) => f.debug_tuple("Or").field(filters).finish(),
            Filter::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
        }
    }
}

/// Result of evaluating a [`FilterSet`] against one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSetResult {
    Include,
    Exclude,
    Unmatched,
}

/// Include and exclude rules. Exclusion wins over inclusion.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    include: Vec<Filter>,
    exclude: Vec<Filter>,
}

impl FilterSet {
    /// Empty set: nothing is excluded and everything is implicitly included.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn including(filter: Filter) -> Self {
        Self::new().include(filter)
    }

    pub fn include(mut self, filter: Filter) -> Self {
        self.include.push(filter);
        self
    }

    pub fn exclude(mut self, filter: Filter) -> Self {
        self.exclude.push(filter);
        self
    }

    pub fn has_inclusion_rules(&self) -> bool {
        !self.include.is_empty()
    }

    pub fn evaluate(&self, tree: &TestTree, test: &Test) -> FilterSetResult {
        if self.exclude.iter().any(|f| f.is_match(tree, test)) {
            return FilterSetResult::Exclude;
        }
        if self.include.iter().any(|f| f.is_match(tree, test)) {
            return FilterSetResult::Include;
        }
        FilterSetResult::Unmatched
    }
}

/// Selection input for a run: filter rules plus the two selection flags.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub filter: FilterSet,
    /// Only matched tests run; descendants of a match are not auto-included.
    pub exact_filter: bool,
    /// Dynamic child steps started from test code are reported as skipped.
    pub skip_dynamic_tests: bool,
}

impl Selection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matching(filter: Filter) -> Self {
        Self {
            filter: FilterSet::including(filter),
            ..Self::default()
        }
    }

    pub fn exact(mut self, exact_filter: bool) -> Self {
        self.exact_filter = exact_filter;
        self
    }
}
