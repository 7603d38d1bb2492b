use ferrocall_core::{
    metadata::{Metadata, MetadataValue},
    tonic::Status,
};
use serde_json::{Value, json};
use std::fmt::Display;

/// A wrapper struct for a formatted string.
///
/// Implements `Display` so it can be printed directly.
pub struct FormattedString(pub String);

/// Everything observed while running a call.
pub struct CallOutcome {
    pub method: String,
    pub headers: Option<Metadata>,
    pub responses: Vec<String>,
    pub status: Status,
    pub trailers: Option<Metadata>,
}

pub struct GenericError<T: Display>(pub &'static str, pub T);

impl std::fmt::Display for FormattedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", self.0)?;
        Ok(())
    }
}

impl From<Value> for FormattedString {
    fn from(value: Value) -> Self {
        FormattedString(serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()))
    }
}

impl From<CallOutcome> for FormattedString {
    fn from(outcome: CallOutcome) -> Self {
        FormattedString::from(json!({
            "method": outcome.method,
            "headers": outcome.headers.as_ref().map(metadata_to_json),
            "responses": outcome.responses,
            "status": {
                "code": format!("{:?}", outcome.status.code()),
                "message": outcome.status.message(),
            },
            "trailers": outcome.trailers.as_ref().map(metadata_to_json),
        }))
    }
}

impl From<anyhow::Error> for FormattedString {
    fn from(err: anyhow::Error) -> Self {
        FormattedString(format!("Error:\n\n'{err:#}'"))
    }
}

impl<T: Display> From<GenericError<T>> for FormattedString {
    fn from(GenericError(msg, err): GenericError<T>) -> Self {
        FormattedString(format!("{msg}:\n\n'{err}'"))
    }
}

/// Renders metadata as a JSON object. Repeated keys become arrays, binary values are shown as
/// byte arrays.
fn metadata_to_json(metadata: &Metadata) -> Value {
    let mut object = serde_json::Map::new();

    for (key, value) in metadata {
        let value = match value {
            MetadataValue::Ascii(v) => Value::from(v.as_str()),
            MetadataValue::Binary(v) => Value::from(v.to_vec()),
        };

        match object.get_mut(key) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => *existing = Value::Array(vec![existing.take(), value]),
            None => {
                object.insert(key.to_string(), value);
            }
        }
    }

    Value::Object(object)
}
