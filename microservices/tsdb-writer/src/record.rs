//! Inbound write records and their failure annotation

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key added to a record that could not be written
pub const FAILURE_KEY: &str = "failureInfo";

/// One write request from the upstream pipeline
///
/// Unknown keys are preserved so a failed record can be handed back
/// exactly as it arrived.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement: Option<String>,

    #[serde(default)]
    pub payload: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
}

/// A record annotated with the reason its write failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRecord {
    #[serde(flatten)]
    pub record: WriteRecord,

    #[serde(rename = "failureInfo")]
    pub failure_info: FailureInfo,
}

impl WriteRecord {
    pub fn new(measurement: Option<&str>, payload: Value) -> Self {
        Self {
            measurement: measurement.map(str::to_string),
            payload,
            extra: Map::new(),
        }
    }

    /// Attach a failure message, replacing any earlier annotation
    pub fn into_failed(mut self, message: impl Into<String>) -> FailedRecord {
        self.extra.remove(FAILURE_KEY);
        FailedRecord {
            record: self,
            failure_info: FailureInfo {
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failed_record_keeps_original_keys() {
        let record: WriteRecord = serde_json::from_value(json!({
            "measurement": "room",
            "payload": {"temp": 21.5},
            "topic": "sensors/room1"
        }))
        .unwrap();

        let failed = serde_json::to_value(record.into_failed("sink unreachable")).unwrap();

        assert_eq!(
            failed,
            json!({
                "measurement": "room",
                "payload": {"temp": 21.5},
                "topic": "sensors/room1",
                "failureInfo": {"message": "sink unreachable"}
            })
        );
    }

    #[test]
    fn test_reannotation_replaces_previous_failure() {
        let record: WriteRecord = serde_json::from_value(json!({
            "payload": 1,
            "failureInfo": {"message": "old"}
        }))
        .unwrap();

        let failed = serde_json::to_value(record.into_failed("new")).unwrap();
        assert_eq!(failed["failureInfo"]["message"], "new");
        assert!(failed.get("measurement").is_none());
    }
}
