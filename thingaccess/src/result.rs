//! Canonical results exchanged between drivers and the session client.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Property or argument mapping carried by results, reports and invocations.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Outcome code of a callback or invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    Failure,
}

impl ResultCode {
    /// Returns the string representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::Failure => "failure",
        }
    }

    /// Parses a code from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(ResultCode::Success),
            "failure" => Some(ResultCode::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for ResultCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResultCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ResultCode::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown result code: {}", s)))
    }
}

/// The value returned by every callback and carried back to the gateway.
///
/// A `Failure` never carries params; use the constructors (or [`normalize`])
/// to keep that invariant.
///
/// [`normalize`]: ThingResult::normalize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThingResult {
    pub code: ResultCode,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

impl ThingResult {
    /// Creates a successful result with the conventional `"success"` message.
    pub fn success(params: Params) -> Self {
        Self {
            code: ResultCode::Success,
            message: "success".to_string(),
            params: Some(params),
        }
    }

    /// Creates a successful result without params.
    pub fn ok() -> Self {
        Self {
            code: ResultCode::Success,
            message: "success".to_string(),
            params: None,
        }
    }

    /// Creates a failed result.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Failure,
            message: message.into(),
            params: None,
        }
    }

    /// Replaces the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == ResultCode::Success
    }

    pub fn is_failure(&self) -> bool {
        self.code == ResultCode::Failure
    }

    /// Returns the value of a single param, if present.
    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.as_ref().and_then(|p| p.get(key))
    }

    /// Strips params from failures.
    pub fn normalize(mut self) -> Self {
        if self.is_failure() {
            self.params = None;
        }
        self
    }

    /// Keeps only the params named in `keys` on a success.
    pub fn retain_keys(mut self, keys: &[String]) -> Self {
        if let Some(params) = self.params.as_mut() {
            params.retain(|k, _| keys.iter().any(|want| want == k));
        }
        self
    }
}

impl fmt::Display for ThingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod result_tests {
    use super::*;
    use serde_json::json;

    fn params(v: serde_json::Value) -> Params {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_result_code_string() {
        assert_eq!(ResultCode::Success.to_string(), "success");
        assert_eq!(ResultCode::Failure.to_string(), "failure");
        assert_eq!(ResultCode::parse("success"), Some(ResultCode::Success));
        assert_eq!(ResultCode::parse("pending"), None);
    }

    #[test]
    fn test_result_code_rejects_unknown() {
        let err = serde_json::from_str::<ResultCode>(r#""partial""#).unwrap_err();
        assert!(err.to_string().contains("partial"));
    }

    #[test]
    fn test_failure_has_no_params() {
        let result = ThingResult::failure("The property is read-only.");
        assert!(result.is_failure());
        assert!(result.params.is_none());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json, json!({"code": "failure", "message": "The property is read-only."}));
    }

    #[test]
    fn test_normalize_strips_failure_params() {
        let result = ThingResult {
            code: ResultCode::Failure,
            message: "nope".to_string(),
            params: Some(params(json!({"temperature": 41}))),
        };
        assert!(result.normalize().params.is_none());
    }

    #[test]
    fn test_retain_keys() {
        let result = ThingResult::success(params(json!({"temperature": 41, "humidity": 12})))
            .retain_keys(&["temperature".to_string()]);
        assert_eq!(result.param("temperature"), Some(&json!(41)));
        assert!(result.param("humidity").is_none());
    }

    #[test]
    fn test_deserialize_without_message() {
        let result: ThingResult = serde_json::from_str(r#"{"code":"success"}"#).unwrap();
        assert!(result.is_success());
        assert_eq!(result.message, "");
    }
}
