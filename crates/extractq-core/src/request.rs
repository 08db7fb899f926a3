//! Place requests and the chunks they are made of.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of an extract: an optional Overpass QL query and the cache key
/// its result is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oql: Option<String>,
    pub filename: String,
}

impl ChunkSpec {
    pub fn new(oql: Option<String>, filename: impl Into<String>) -> Self {
        Self {
            oql,
            filename: filename.into(),
        }
    }

    /// The query to run, if there is anything to fetch. An empty query is
    /// treated the same as a missing one.
    pub fn query(&self) -> Option<&str> {
        self.oql.as_deref().filter(|q| !q.is_empty())
    }
}

/// A client's request to fetch and cache every chunk of one place.
///
/// `place` is opaque to the relay apart from its `area` field, which sets
/// the request's priority. It is echoed back verbatim in progress messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceRequest {
    pub place: Value,
    pub chunks: Vec<ChunkSpec>,
}

impl PlaceRequest {
    /// Priority of this request: the place's area, smallest first.
    ///
    /// Accepts a JSON number or a numeric string. Anything else, including a
    /// missing field or NaN, yields `0.0`.
    pub fn priority(&self) -> f64 {
        area_priority(self.place.get("area"))
    }
}

fn area_priority(area: Option<&Value>) -> f64 {
    let parsed = match area {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|a| !a.is_nan()).unwrap_or(0.0)
}
