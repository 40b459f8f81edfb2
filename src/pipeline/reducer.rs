// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The reducer catalog used by `GROUPBY ... REDUCE`.
//!
//! A closed set of variants dispatched through a match, the same shape as
//! `Aggregator` in this crate's ancestor: a `from_name` constructor, an
//! `accumulate` step invoked once per input row, and a `finalize` that produces
//! the group's output value.

use std::collections::HashSet;

use serde_json::Value;

use crate::{ErrorKind, Result};

#[derive(Clone, Debug)]
pub enum Reducer {
    Count {
        count: u64,
    },
    Sum {
        sum: f64,
    },
    Avg {
        sum: f64,
        count: u64,
    },
    Min {
        min: Option<f64>,
    },
    Max {
        max: Option<f64>,
    },
    CountDistinct {
        seen: HashSet<String>,
    },
    ToList {
        items: Vec<Value>,
    },
    FirstValue {
        value: Option<Value>,
    },
}

impl Reducer {
    /// Builds a fresh accumulator for `name` (case-insensitive). `args` is the
    /// reducer's own sub-argument list, reserved for reducers that need more than
    /// a single input value (none of the built-ins do today).
    pub fn from_name(name: &str, _args: &[String]) -> Result<Self> {
        if name.eq_ignore_ascii_case("COUNT") {
            Ok(Reducer::Count { count: 0 })
        } else if name.eq_ignore_ascii_case("SUM") {
            Ok(Reducer::Sum { sum: 0.0 })
        } else if name.eq_ignore_ascii_case("AVG") {
            Ok(Reducer::Avg { sum: 0.0, count: 0 })
        } else if name.eq_ignore_ascii_case("MIN") {
            Ok(Reducer::Min { min: None })
        } else if name.eq_ignore_ascii_case("MAX") {
            Ok(Reducer::Max { max: None })
        } else if name.eq_ignore_ascii_case("COUNT_DISTINCT") {
            Ok(Reducer::CountDistinct { seen: HashSet::new() })
        } else if name.eq_ignore_ascii_case("TOLIST") {
            Ok(Reducer::ToList { items: Vec::new() })
        } else if name.eq_ignore_ascii_case("FIRST_VALUE") {
            Ok(Reducer::FirstValue { value: None })
        } else {
            Err(ErrorKind::NoReducer.with_message(format!("unknown reducer: {name}")))
        }
    }

    /// Feeds one input value (the source-key value for the current row) into the accumulator.
    /// `COUNT` ignores the value entirely and just counts rows.
    pub fn accumulate(&mut self, value: Option<&Value>) {
        match self {
            Reducer::Count { count } => *count += 1,
            Reducer::Sum { sum } => {
                if let Some(n) = value.and_then(Value::as_f64) {
                    *sum += n;
                }
            }
            Reducer::Avg { sum, count } => {
                if let Some(n) = value.and_then(Value::as_f64) {
                    *sum += n;
                    *count += 1;
                }
            }
            Reducer::Min { min } => {
                if let Some(n) = value.and_then(Value::as_f64) {
                    *min = Some(min.map_or(n, |cur| cur.min(n)));
                }
            }
            Reducer::Max { max } => {
                if let Some(n) = value.and_then(Value::as_f64) {
                    *max = Some(max.map_or(n, |cur| cur.max(n)));
                }
            }
            Reducer::CountDistinct { seen } => {
                if let Some(v) = value {
                    seen.insert(v.to_string());
                }
            }
            Reducer::ToList { items } => {
                if let Some(v) = value {
                    items.push(v.clone());
                }
            }
            Reducer::FirstValue { value: stored } => {
                if stored.is_none() {
                    *stored = value.cloned();
                }
            }
        }
    }

    pub fn finalize(self) -> Value {
        match self {
            Reducer::Count { count } => serde_json::json!(count),
            Reducer::Sum { sum } => serde_json::json!(sum),
            Reducer::Avg { sum, count } => {
                serde_json::json!(if count == 0 { 0.0 } else { sum / count as f64 })
            }
            Reducer::Min { min } => min.map(|v| serde_json::json!(v)).unwrap_or(Value::Null),
            Reducer::Max { max } => max.map(|v| serde_json::json!(v)).unwrap_or(Value::Null),
            Reducer::CountDistinct { seen } => serde_json::json!(seen.len() as u64),
            Reducer::ToList { items } => Value::Array(items),
            Reducer::FirstValue { value } => value.unwrap_or(Value::Null),
        }
    }
}
