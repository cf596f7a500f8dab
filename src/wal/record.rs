use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Compact handle standing in for a label set inside the WAL.
pub type SeriesRef = u64;

/// Label name to value. Kept sorted so equality and rendering never depend on
/// insertion order.
pub type LabelSet = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to decode record: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

impl Entry {
    pub fn new(timestamp: DateTime<Utc>, line: impl Into<String>) -> Self {
        Self {
            timestamp,
            line: line.into(),
        }
    }
}

/// Series definition: binds a reference to its label set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefSeries {
    #[serde(rename = "ref")]
    pub series_ref: SeriesRef,
    pub labels: LabelSet,
}

/// Entries that all belong to the series behind `series_ref`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefEntries {
    #[serde(rename = "ref")]
    pub series_ref: SeriesRef,
    pub entries: Vec<Entry>,
}

/// One decoded WAL record. Series are listed before the entries that may
/// reference them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub series: Vec<RefSeries>,
    #[serde(default)]
    pub entries: Vec<RefEntries>,
}

impl Record {
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        serde_json::from_slice(bytes).map_err(RecordError::Decode)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        serde_json::to_vec(self).map_err(RecordError::Encode)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.iter().map(|e| e.entries.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_series_and_entries() {
        let payload = br#"{
            "series": [{"ref": 7, "labels": {"app": "api", "env": "prod"}}],
            "entries": [{"ref": 7, "entries": [
                {"timestamp": "2026-01-28T10:00:00Z", "line": "hello"},
                {"timestamp": "2026-01-28T10:00:01Z", "line": "world"}
            ]}]
        }"#;

        let record = Record::decode(payload).unwrap();
        assert_eq!(record.series.len(), 1);
        assert_eq!(record.series[0].series_ref, 7);
        assert_eq!(record.series[0].labels["env"], "prod");
        assert_eq!(record.entry_count(), 2);
        assert_eq!(
            record.entries[0].entries[1].timestamp,
            Utc.with_ymd_and_hms(2026, 1, 28, 10, 0, 1).unwrap()
        );
    }

    #[test]
    fn test_decode_entries_only() {
        let record =
            Record::decode(br#"{"entries": [{"ref": 1, "entries": []}]}"#).unwrap();
        assert!(record.series.is_empty());
        assert_eq!(record.entries.len(), 1);
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            Record::decode(b"\x00\x01not json"),
            Err(RecordError::Decode(_))
        ));
        assert!(Record::decode(br#"{"series": "nope"}"#).is_err());
    }
}
