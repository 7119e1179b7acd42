//! Query evaluation shared by the bundled document backends.
//!
//! Queries are plain records: every key is an equality filter on a top-level
//! property, except the index options listed in `INDEX_OPTIONS`.

use super::{BackendError, BackendResult, Query};
use crate::model::entity_id::EntityId;
use crate::model::Record;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

pub const SORT_OPTION: &str = "_sort";
pub const LIMIT_OPTION: &str = "_limit";
pub const SKIP_OPTION: &str = "_skip";

/// Query keys interpreted by backends instead of being matched as filters.
pub const INDEX_OPTIONS: [&str; 3] = [SORT_OPTION, LIMIT_OPTION, SKIP_OPTION];

static FIELD_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("field name pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Parsed form of an index query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPlan {
    filters: Vec<(String, Value)>,
    sort: Vec<(String, SortDirection)>,
    limit: Option<usize>,
    skip: usize,
}

impl QueryPlan {
    /// Splits a query into filters and options.
    ///
    /// # Errors
    /// - `InvalidQuery` for filter keys that are not plain identifiers, and
    ///   for malformed `_sort`, `_limit` or `_skip` values.
    pub fn parse(query: &Query) -> BackendResult<Self> {
        let mut plan = Self::default();

        for (key, value) in query {
            match key.as_str() {
                SORT_OPTION => plan.sort = parse_sort(value)?,
                LIMIT_OPTION => plan.limit = Some(parse_count(LIMIT_OPTION, value)?),
                SKIP_OPTION => plan.skip = parse_count(SKIP_OPTION, value)?,
                field => {
                    check_field_name(field)?;
                    plan.filters.push((field.to_string(), value.clone()));
                }
            }
        }

        Ok(plan)
    }

    pub fn filters(&self) -> &[(String, Value)] {
        &self.filters
    }

    pub fn sort(&self) -> &[(String, SortDirection)] {
        &self.sort
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn skip(&self) -> usize {
        self.skip
    }

    /// Returns whether `record` satisfies every filter.
    pub fn matches(&self, record: &Record) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| value_matches(record.get(field), expected))
    }

    /// Filters, sorts and windows records given in default backend order.
    ///
    /// Sorting is stable, so ties keep the default order.
    pub fn apply(&self, records: Vec<Record>) -> Vec<Record> {
        let mut selected: Vec<Record> = records
            .into_iter()
            .filter(|record| self.matches(record))
            .collect();

        if !self.sort.is_empty() {
            selected.sort_by(|left, right| {
                for (field, direction) in &self.sort {
                    let ordering = compare_values(left.get(field), right.get(field));
                    let ordering = match direction {
                        SortDirection::Ascending => ordering,
                        SortDirection::Descending => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        let window = selected.into_iter().skip(self.skip);
        match self.limit {
            Some(limit) => window.take(limit).collect(),
            None => window.collect(),
        }
    }
}

/// Validates a property name used as filter, sort or distinct key.
pub fn check_field_name(field: &str) -> BackendResult<()> {
    if FIELD_NAME_PATTERN.is_match(field) {
        return Ok(());
    }
    Err(BackendError::InvalidQuery(format!(
        "`{field}` is not a valid property name"
    )))
}

/// Collects distinct values of `key`, flattening arrays, in first-seen order.
pub fn distinct_values<'a>(records: impl IntoIterator<Item = &'a Record>, key: &str) -> Vec<Value> {
    let mut values: Vec<Value> = Vec::new();
    let mut push = |value: &Value| {
        if !values.contains(value) {
            values.push(value.clone());
        }
    };

    for record in records {
        match record.get(key) {
            Some(Value::Array(items)) => items.iter().for_each(&mut push),
            Some(Value::Null) | None => {}
            Some(value) => push(value),
        }
    }
    values
}

/// Applies `$set` semantics: every property of `data` except `id`
/// overwrites the stored one.
pub fn merge_set(target: &mut Record, data: &Record) {
    for (key, value) in data {
        if key == "id" {
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

fn value_matches(actual: Option<&Value>, expected: &Value) -> bool {
    let Some(actual) = actual else {
        return expected.is_null();
    };
    if actual == expected {
        return true;
    }

    match actual {
        // Reference stored as `{id}` matches a bare id or an `{id}` filter.
        Value::Object(_) => match (
            EntityId::from_reference(actual),
            EntityId::from_reference(expected),
        ) {
            (Some(left), Some(right)) => left == right,
            _ => false,
        },
        Value::Array(items) => items.iter().any(|item| value_matches(Some(item), expected)),
        _ => false,
    }
}

fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(left), Some(right)) => match (left, right) {
            (Value::Number(a), Value::Number(b)) => {
                let a = a.as_f64().unwrap_or(0.0);
                let b = b.as_f64().unwrap_or(0.0);
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            _ => type_rank(left).cmp(&type_rank(right)),
        },
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

fn parse_sort(value: &Value) -> BackendResult<Vec<(String, SortDirection)>> {
    let invalid = || {
        BackendError::InvalidQuery(format!(
            "{SORT_OPTION} must be a list of [field, direction] pairs"
        ))
    };

    let Value::Array(entries) = value else {
        return Err(invalid());
    };

    let mut sort = Vec::with_capacity(entries.len());
    for entry in entries {
        let (field, direction) = match entry {
            Value::String(field) => (field.as_str(), SortDirection::Ascending),
            Value::Array(pair) if pair.len() == 2 => {
                let field = pair[0].as_str().ok_or_else(invalid)?;
                (field, parse_direction(&pair[1]).ok_or_else(invalid)?)
            }
            _ => return Err(invalid()),
        };
        if field != "id" {
            check_field_name(field)?;
        }
        sort.push((field.to_string(), direction));
    }
    Ok(sort)
}

fn parse_direction(value: &Value) -> Option<SortDirection> {
    match value {
        Value::String(text) => match text.to_ascii_lowercase().as_str() {
            "ascending" | "asc" => Some(SortDirection::Ascending),
            "descending" | "desc" => Some(SortDirection::Descending),
            _ => None,
        },
        Value::Number(number) => match number.as_i64() {
            Some(1) => Some(SortDirection::Ascending),
            Some(-1) => Some(SortDirection::Descending),
            _ => None,
        },
        _ => None,
    }
}

fn parse_count(option: &str, value: &Value) -> BackendResult<usize> {
    value
        .as_u64()
        .and_then(|count| usize::try_from(count).ok())
        .ok_or_else(|| {
            BackendError::InvalidQuery(format!("{option} must be a non-negative integer"))
        })
}
