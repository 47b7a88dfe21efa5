use serde_json::Value;

use crate::transport::Message;
use crate::types::Record;

/// Builds a record from a JSON object. Any other JSON value yields an empty record.
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => Record::from(map),
        _ => Record::new(),
    }
}

/// Builds a `RECORD` message of `stream` from a JSON object.
pub fn record_message(stream: &str, value: Value) -> Message {
    let record = match value {
        Value::Object(map) => map,
        _ => Default::default(),
    };

    Message::Record {
        stream: stream.to_string(),
        record,
    }
}

/// Renders messages as newline-delimited JSON.
pub fn ndjson(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|message| message.encode().ok())
        .map(|line| line + "\n")
        .collect()
}
