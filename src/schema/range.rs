use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Engine-side date format used in mappings and range clauses
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Inclusive/exclusive bounds of a range filter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeFilter<T> {
    lower: Option<T>,
    upper: Option<T>,
    lower_inclusive: bool,
    upper_inclusive: bool,
}

pub struct RangeFilterBuilder<T> {
    lower: Option<T>,
    upper: Option<T>,
    lower_inclusive: Option<bool>,
    upper_inclusive: Option<bool>,
}

impl<T> Default for RangeFilterBuilder<T> {
    fn default() -> Self {
        Self {
            lower: None,
            upper: None,
            lower_inclusive: None,
            upper_inclusive: None,
        }
    }
}

impl<T> RangeFilterBuilder<T>
where
    T: Clone + PartialOrd,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lower(mut self, lower: Option<T>) -> Self {
        self.lower = lower;
        self
    }

    pub fn upper(mut self, upper: Option<T>) -> Self {
        self.upper = upper;
        self
    }

    pub fn lower_inclusive(mut self, lower_inclusive: bool) -> Self {
        self.lower_inclusive = Some(lower_inclusive);
        self
    }

    pub fn upper_inclusive(mut self, upper_inclusive: bool) -> Self {
        self.upper_inclusive = Some(upper_inclusive);
        self
    }

    /// Build the range; `None` when unbounded on both sides or inverted.
    pub fn build(self) -> Option<RangeFilter<T>> {
        if self.lower.is_none() && self.upper.is_none() {
            return None;
        }
        if let (Some(lower), Some(upper)) = (&self.lower, &self.upper) {
            if lower > upper {
                return None;
            }
        }
        Some(RangeFilter {
            lower: self.lower,
            upper: self.upper,
            lower_inclusive: self.lower_inclusive.unwrap_or(true),
            upper_inclusive: self.upper_inclusive.unwrap_or(true),
        })
    }
}

impl<T> RangeFilter<T> {
    pub fn lower(&self) -> Option<&T> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Option<&T> {
        self.upper.as_ref()
    }

    /// Render as an engine `range` clause on `field`.
    pub fn to_clause<F>(&self, field: &str, render: F) -> Value
    where
        F: Fn(&T) -> Value,
    {
        let mut bounds = serde_json::Map::new();
        if let Some(lower) = &self.lower {
            let key = if self.lower_inclusive { "gte" } else { "gt" };
            bounds.insert(key.to_string(), render(lower));
        }
        if let Some(upper) = &self.upper {
            let key = if self.upper_inclusive { "lte" } else { "lt" };
            bounds.insert(key.to_string(), render(upper));
        }
        json!({ "range": { field: bounds } })
    }
}

/// Parse `[from]` or `[from]-[to]` (either side may be left open).
///
/// Anything else, including inverted ranges, yields `None`.
pub fn parse_numeric_range(raw: &str) -> Option<RangeFilter<i64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (from, to) = match raw.split_once('-') {
        Some((from, to)) => (parse_bound(from)?, parse_bound(to)?),
        None => {
            let value = parse_bound(raw)?;
            (value, value)
        }
    };
    RangeFilterBuilder::new().lower(from).upper(to).build()
}

fn parse_bound(raw: &str) -> Option<Option<i64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(None);
    }
    if !raw.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok().map(Some)
}

/// Parse a date range: `<date>`, `<from>..<to>`, `<from> - <to>` or `<from>,<to>`.
///
/// A date without time covers the whole day. Unparsable input yields `None`.
pub fn parse_date_range(raw: &str) -> Option<RangeFilter<NaiveDateTime>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let split = ["..", " - ", ","]
        .iter()
        .find_map(|sep| raw.split_once(sep));

    let (lower, upper) = match split {
        Some((from, to)) => (
            parse_date_bound(from, DateSide::Lower)?,
            parse_date_bound(to, DateSide::Upper)?,
        ),
        None => (
            parse_date_bound(raw, DateSide::Lower)?,
            parse_date_bound(raw, DateSide::Upper)?,
        ),
    };
    RangeFilterBuilder::new().lower(lower).upper(upper).build()
}

#[derive(Clone, Copy)]
enum DateSide {
    Lower,
    Upper,
}

fn parse_date_bound(raw: &str, side: DateSide) -> Option<Option<NaiveDateTime>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(None);
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Some(dt));
        }
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(Some(dt.naive_utc()));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let time = match side {
        DateSide::Lower => NaiveTime::MIN,
        DateSide::Upper => NaiveTime::from_hms_opt(23, 59, 59)?,
    };
    Some(Some(date.and_time(time)))
}

pub fn render_date(dt: &NaiveDateTime) -> Value {
    Value::String(dt.format(DATE_FORMAT).to_string())
}
