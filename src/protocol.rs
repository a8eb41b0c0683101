//! Wire types for the editor command channel.
//!
//! Requests are `{ "id", "type", "params" }` objects. Replies come in a few
//! shapes depending on the editor package version; [`Reply::from_value`]
//! normalizes all of them into a [`Reply`] carrying an [`Outcome`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use thiserror::Error;

/// Correlation token for one request.
///
/// Ids are allocated from a monotonically increasing counter, so ordering
/// ids also orders requests by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Parse an id as echoed by the editor. Ids go out as decimal strings,
    /// but numeric echoes are accepted too.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse().ok().map(Self)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A command sent to the editor.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRequest {
    pub id: RequestId,
    #[serde(rename = "type")]
    pub command: String,
    pub params: Value,
}

impl CommandRequest {
    pub fn new(id: RequestId, command: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            command: command.into(),
            params,
        }
    }

    /// Serialize to the JSON body of a frame.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Result carried by a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The command ran; payload is the normalized result.
    Success(Value),
    /// The editor reported a logical failure.
    Failure {
        message: String,
        code: Option<String>,
    },
}

/// A decoded editor reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Raw correlation id, absent on some legacy replies.
    pub id: Option<String>,
    pub outcome: Outcome,
    /// Editor package version, when the reply advertises one.
    pub version: Option<String>,
}

/// A frame body that is not a usable reply.
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("reply is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("reply is not a JSON object")]
    NotAnObject,
}

/// Loose view of every envelope field the editor has used.
///
/// A field of the wrong type reads as absent instead of failing the whole
/// envelope.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default, deserialize_with = "lenient_string")]
    status: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    success: Option<bool>,
    result: Option<Value>,
    data: Option<Value>,
    error: Option<Value>,
    code: Option<Value>,
    editor_state: Option<Value>,
    version: Option<Value>,
}

impl Reply {
    /// Decode a frame body.
    pub fn from_slice(body: &[u8]) -> Result<Self, ReplyError> {
        let value: Value = serde_json::from_slice(body)?;
        Self::from_value(value)
    }

    /// Normalize a reply object.
    ///
    /// - `status: "success"` or `success: true` yields the `result` (else
    ///   `data`, else `{}`) payload
    /// - `status: "error"` or `success: false` yields a failure
    /// - any other object is passed through whole as a success payload
    pub fn from_value(value: Value) -> Result<Self, ReplyError> {
        if !value.is_object() {
            return Err(ReplyError::NotAnObject);
        }
        let envelope = Envelope::deserialize(&value).unwrap_or_default();

        // Read on its own so nothing else in the envelope can hide it.
        let id = value.get("id").and_then(scalar_text);
        let version = envelope
            .version
            .as_ref()
            .and_then(Value::as_str)
            .or_else(|| {
                envelope
                    .editor_state
                    .as_ref()
                    .and_then(|s| s.get("version"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string);

        let status = envelope.status.as_deref().map(str::to_ascii_lowercase);
        let succeeded = status.as_deref() == Some("success") || envelope.success == Some(true);
        let failed = status.as_deref() == Some("error")
            || envelope.success == Some(false)
            || (status.is_none() && envelope.success.is_none() && has_error_text(&envelope));

        let outcome = if succeeded {
            let mut payload = envelope
                .result
                .filter(|v| !v.is_null())
                .or_else(|| envelope.data.filter(|v| !v.is_null()))
                .map(parse_embedded_json)
                .unwrap_or_else(|| json!({}));

            if let Some(fields) = payload.as_object_mut() {
                if let Some(version) = &version {
                    fields
                        .entry("_version")
                        .or_insert_with(|| Value::String(version.clone()));
                }
                if let Some(state) = envelope.editor_state {
                    fields.insert("_editorState".to_string(), state);
                }
            }
            Outcome::Success(payload)
        } else if failed {
            Outcome::Failure {
                message: error_text(envelope.error.as_ref())
                    .unwrap_or_else(|| "Command failed".to_string()),
                code: envelope.code.as_ref().and_then(scalar_text),
            }
        } else {
            Outcome::Success(value)
        };

        Ok(Self {
            id,
            outcome,
            version,
        })
    }

    /// The correlation id, when it parses as one of ours.
    pub fn request_id(&self) -> Option<RequestId> {
        self.id.as_deref().and_then(RequestId::parse)
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Value::deserialize(deserializer)?.as_str().map(str::to_string))
}

/// Accepts `true`/`false` as booleans or strings.
fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(flag) => Some(flag),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}

fn has_error_text(envelope: &Envelope) -> bool {
    match &envelope.error {
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Object(_)) => true,
        _ => false,
    }
}

/// Render a string or number as text; anything else is absent.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn error_text(error: Option<&Value>) -> Option<String> {
    match error? {
        Value::String(s) => Some(s.clone()),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(Value::Object(fields.clone()).to_string())),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Some handlers return their result pre-serialized as a JSON string.
fn parse_embedded_json(value: Value) -> Value {
    match value {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_serializes_with_type_and_string_id() {
        let request = CommandRequest::new(RequestId::new(7), "ping", json!({}));
        let value: Value = serde_json::from_slice(&request.to_bytes().unwrap()).unwrap();

        assert_eq!(value, json!({"id": "7", "type": "ping", "params": {}}));
    }

    #[test]
    fn test_request_id_parse() {
        assert_eq!(RequestId::parse("42"), Some(RequestId::new(42)));
        assert_eq!(RequestId::parse(" 3 "), Some(RequestId::new(3)));
        assert_eq!(RequestId::parse("cmd-123"), None);
    }

    #[test]
    fn test_success_with_result() {
        let reply = Reply::from_value(json!({
            "id": "1",
            "status": "success",
            "result": {"message": "pong"}
        }))
        .unwrap();

        assert_eq!(reply.request_id(), Some(RequestId::new(1)));
        assert_eq!(reply.outcome, Outcome::Success(json!({"message": "pong"})));
    }

    #[test]
    fn test_success_falls_back_to_data_then_empty() {
        let reply = Reply::from_value(json!({"success": true, "data": [1, 2]})).unwrap();
        assert_eq!(reply.outcome, Outcome::Success(json!([1, 2])));

        let reply = Reply::from_value(json!({"status": "SUCCESS", "result": null})).unwrap();
        assert_eq!(reply.outcome, Outcome::Success(json!({})));
    }

    #[test]
    fn test_string_result_is_parsed_as_json() {
        let reply = Reply::from_value(json!({
            "status": "success",
            "result": "{\"count\":3}"
        }))
        .unwrap();
        assert_eq!(reply.outcome, Outcome::Success(json!({"count": 3})));

        let reply = Reply::from_value(json!({"status": "success", "result": "plain"})).unwrap();
        assert_eq!(reply.outcome, Outcome::Success(json!("plain")));
    }

    #[test]
    fn test_editor_state_and_version_are_attached() {
        let reply = Reply::from_value(json!({
            "id": "5",
            "status": "success",
            "result": {"state": {"isPlaying": false}},
            "editorState": {"isPlaying": true, "version": "2.4.0"}
        }))
        .unwrap();

        assert_eq!(reply.version.as_deref(), Some("2.4.0"));
        assert_eq!(
            reply.outcome,
            Outcome::Success(json!({
                "state": {"isPlaying": false},
                "_version": "2.4.0",
                "_editorState": {"isPlaying": true, "version": "2.4.0"}
            }))
        );
    }

    #[test]
    fn test_failure_by_status() {
        let reply = Reply::from_value(json!({
            "id": "2",
            "status": "error",
            "error": "GameObject not found",
            "code": "NOT_FOUND"
        }))
        .unwrap();

        assert_eq!(
            reply.outcome,
            Outcome::Failure {
                message: "GameObject not found".to_string(),
                code: Some("NOT_FOUND".to_string()),
            }
        );
    }

    #[test]
    fn test_failure_by_success_flag_without_message() {
        let reply = Reply::from_value(json!({"success": false, "code": 500})).unwrap();

        assert_eq!(
            reply.outcome,
            Outcome::Failure {
                message: "Command failed".to_string(),
                code: Some("500".to_string()),
            }
        );
    }

    #[test]
    fn test_bare_error_field_is_failure() {
        let reply = Reply::from_value(json!({"id": 9, "error": {"message": "boom"}})).unwrap();
        assert_eq!(reply.request_id(), Some(RequestId::new(9)));
        assert_eq!(
            reply.outcome,
            Outcome::Failure {
                message: "boom".to_string(),
                code: None
            }
        );

        let reply = Reply::from_value(json!({"error": ""})).unwrap();
        assert!(matches!(reply.outcome, Outcome::Success(_)));
    }

    #[test]
    fn test_mistyped_fields_keep_the_id() {
        let reply = Reply::from_value(json!({
            "id": "2",
            "success": "true",
            "status": 200,
            "version": 1,
            "result": {"which": "second"}
        }))
        .unwrap();

        assert_eq!(reply.request_id(), Some(RequestId::new(2)));
        assert_eq!(reply.version, None);
        assert_eq!(reply.outcome, Outcome::Success(json!({"which": "second"})));

        let reply = Reply::from_value(json!({"id": 3, "status": ["odd"], "success": "false"})).unwrap();
        assert_eq!(reply.request_id(), Some(RequestId::new(3)));
        assert!(matches!(reply.outcome, Outcome::Failure { .. }));
    }

    #[test]
    fn test_unknown_shape_passes_through() {
        let raw = json!({"isPlaying": true, "isPaused": false});
        let reply = Reply::from_value(raw.clone()).unwrap();

        assert_eq!(reply.id, None);
        assert_eq!(reply.outcome, Outcome::Success(raw));
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert!(matches!(
            Reply::from_value(json!([1, 2])),
            Err(ReplyError::NotAnObject)
        ));
        assert!(matches!(
            Reply::from_slice(b"not json"),
            Err(ReplyError::Json(_))
        ));
    }
}
