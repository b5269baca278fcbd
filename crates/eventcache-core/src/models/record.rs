use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names checked, in order, for a listing's start time.
/// Normalized scrapes use `start_datetime`; some sources send the others.
const START_TIME_FIELDS: [&str; 3] = ["start_datetime", "start_time", "startDate"];

/// One opaque listing as returned by the listing source.
///
/// The cache never interprets a record beyond its start time; everything
/// else is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Wrap a JSON value, returning `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// Raw start-time string, if the record carries a non-empty one
    pub fn start_time(&self) -> Option<&str> {
        START_TIME_FIELDS
            .iter()
            .filter_map(|field| self.0.get(*field).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    /// Listing title, for log messages
    pub fn title(&self) -> Option<&str> {
        self.0.get("title").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_time_prefers_normalized_field() {
        let record = Record::from_value(json!({
            "start_datetime": "2026-03-01T19:00:00+00:00",
            "startDate": "2026-01-01",
        }))
        .unwrap();
        assert_eq!(record.start_time(), Some("2026-03-01T19:00:00+00:00"));
    }

    #[test]
    fn test_start_time_falls_back_to_aliases() {
        let record = Record::from_value(json!({ "startDate": "2026-01-01" })).unwrap();
        assert_eq!(record.start_time(), Some("2026-01-01"));

        let blank = Record::from_value(json!({ "start_datetime": "  ", "start_time": "18:00" }))
            .unwrap();
        assert_eq!(blank.start_time(), Some("18:00"));
    }

    #[test]
    fn test_start_time_missing_or_not_a_string() {
        let record = Record::from_value(json!({ "title": "Jazz Night", "start_datetime": 42 }))
            .unwrap();
        assert_eq!(record.start_time(), None);
        assert_eq!(record.title(), Some("Jazz Night"));
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(Record::from_value(json!([1, 2])).is_none());
        assert!(Record::from_value(json!("event")).is_none());
    }

    #[test]
    fn test_serializes_transparently() {
        let record = Record::from_value(json!({ "title": "Open Mic" })).unwrap();
        assert_eq!(serde_json::to_value(&record).unwrap(), json!({ "title": "Open Mic" }));
    }
}
