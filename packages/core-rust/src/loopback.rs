//! Loopback context: opaque plugin state handed from one verb phase to the next
//! (validate -> backup -> commit/rollback).
//!
//! The core never interprets the payload except for one field, `errorCode`, which
//! selects the branch of a commit-or-rollback verb.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names accepted for the error code. The second spelling is what
/// PascalCase-serializing plugins emit.
const ERROR_CODE_FIELDS: [&str; 2] = ["errorCode", "ErrorCode"];

/// Opaque loopback payload, carried verbatim on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoopbackContext(String);

impl LoopbackContext {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// The non-empty `errorCode` carried by a JSON-object payload, if any.
    ///
    /// Payloads that are not JSON objects never carry an error code.
    #[must_use]
    pub fn error_code(&self) -> Option<String> {
        let value: Value = serde_json::from_str(&self.0).ok()?;
        let object = value.as_object()?;
        ERROR_CODE_FIELDS
            .iter()
            .filter_map(|field| object.get(*field).and_then(Value::as_str))
            .find(|code| !code.trim().is_empty())
            .map(str::to_owned)
    }

    /// Returns `base` with `errorCode` set to `code`.
    ///
    /// A JSON-object base keeps its other fields. Any other base is preserved as a
    /// string under `context`.
    #[must_use]
    pub fn with_error_code(base: Option<&LoopbackContext>, code: &str) -> Self {
        let mut object = Map::new();
        if let Some(base) = base.filter(|b| !b.is_empty()) {
            match serde_json::from_str::<Value>(&base.0) {
                Ok(Value::Object(fields)) => object = fields,
                _ => {
                    object.insert("context".to_string(), Value::String(base.0.clone()));
                }
            }
        }
        object.insert("errorCode".to_string(), Value::String(code.to_string()));
        Self(Value::Object(object).to_string())
    }
}

impl From<String> for LoopbackContext {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Branch taken by a commit-or-rollback verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDecision {
    Commit,
    Rollback,
}

impl CommitDecision {
    /// Rollback when the loopback context carries an error code, commit otherwise
    /// (including when there is no context at all).
    #[must_use]
    pub fn from_loopback(context: Option<&LoopbackContext>) -> Self {
        match context.and_then(LoopbackContext::error_code) {
            Some(_) => Self::Rollback,
            None => Self::Commit,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_read_from_either_spelling() {
        let camel = LoopbackContext::new(r#"{"foo":"foo","errorCode":"E42"}"#);
        assert_eq!(camel.error_code().as_deref(), Some("E42"));

        let pascal = LoopbackContext::new(r#"{"Foo":"foo","ErrorCode":"E7"}"#);
        assert_eq!(pascal.error_code().as_deref(), Some("E7"));
    }

    #[test]
    fn blank_or_missing_error_code_is_none() {
        for raw in [
            r#"{"foo":"foo","bar":"bar"}"#,
            r#"{"errorCode":""}"#,
            r#"{"errorCode":"   "}"#,
            r#"{"errorCode":null}"#,
            r#"["errorCode"]"#,
            "not json at all",
            "",
        ] {
            assert_eq!(LoopbackContext::new(raw).error_code(), None, "payload {raw}");
        }
    }

    #[test]
    fn decision_follows_error_code() {
        let failed = LoopbackContext::new(r#"{"errorCode":"UserErrorSourceGone"}"#);
        assert_eq!(
            CommitDecision::from_loopback(Some(&failed)),
            CommitDecision::Rollback
        );

        let clean = LoopbackContext::new(r#"{"foo":"foo"}"#);
        assert_eq!(
            CommitDecision::from_loopback(Some(&clean)),
            CommitDecision::Commit
        );
        assert_eq!(CommitDecision::from_loopback(None), CommitDecision::Commit);
    }

    #[test]
    fn stamping_keeps_object_fields() {
        let base = LoopbackContext::new(r#"{"foo":"foo","bar":"bar"}"#);
        let stamped = LoopbackContext::with_error_code(Some(&base), "E1");

        let value: Value = serde_json::from_str(stamped.as_str()).unwrap();
        assert_eq!(value["foo"], "foo");
        assert_eq!(value["bar"], "bar");
        assert_eq!(stamped.error_code().as_deref(), Some("E1"));
    }

    #[test]
    fn stamping_wraps_non_object_base() {
        let base = LoopbackContext::new("opaque-token");
        let stamped = LoopbackContext::with_error_code(Some(&base), "E2");

        let value: Value = serde_json::from_str(stamped.as_str()).unwrap();
        assert_eq!(value["context"], "opaque-token");
        assert_eq!(stamped.error_code().as_deref(), Some("E2"));

        let fresh = LoopbackContext::with_error_code(None, "E3");
        assert_eq!(fresh.as_str(), r#"{"errorCode":"E3"}"#);
    }

    #[test]
    fn serializes_transparently() {
        let ctx = LoopbackContext::new("{\"a\":1}");
        let json = serde_json::to_string(&ctx).unwrap();
        assert_eq!(json, "\"{\\\"a\\\":1}\"");
        let back: LoopbackContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
    }
}
