//! The policy evaluator contract: rules, decisions, and errors.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// The four phase rules a policy may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    OnRequestHeaders,
    OnRequestBody,
    OnResponseHeaders,
    OnResponseBody,
}

impl Rule {
    /// Rule name as it appears in the policy package.
    pub fn name(self) -> &'static str {
        match self {
            Rule::OnRequestHeaders => "on_request_headers",
            Rule::OnRequestBody => "on_request_body",
            Rule::OnResponseHeaders => "on_response_headers",
            Rule::OnResponseBody => "on_response_body",
        }
    }

    /// Fully qualified query path for the rule.
    pub fn query(self) -> String {
        format!("data.ccr.policy.{}", self.name())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Evaluator runtime failure: missing rule, bad input, engine error.
#[derive(Debug, Error)]
#[error("policy evaluation failed: {0}")]
pub struct EvalError(pub String);

/// Structured policy output for one phase.
///
/// Policies may return a bare boolean (shorthand for `{allowed: bool}`) or
/// an object with the fields below.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    /// Whether the phase may continue.
    pub allowed: bool,
    /// HTTP status for the immediate response when denied; defaults to 403.
    pub http_status: Option<u16>,
    /// Replacement body (body phases) or denial body (immediate responses).
    pub body: Option<String>,
    /// Entries merged into the stream context for subsequent phases.
    pub context: Option<serde_json::Map<String, Value>>,
    /// Additional headers to set on the allowed response.
    pub headers: Option<BTreeMap<String, String>>,
}

impl Decision {
    /// Parse an evaluator result value into a decision.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError`] when the value is neither a boolean nor an
    /// object with a boolean `allowed` field.
    pub fn from_value(value: &Value) -> Result<Self, EvalError> {
        match value {
            Value::Bool(allowed) => Ok(Self {
                allowed: *allowed,
                ..Default::default()
            }),
            Value::Object(map) => {
                let allowed = map
                    .get("allowed")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| {
                        EvalError("decision object is missing a boolean 'allowed' field".into())
                    })?;
                let http_status = map
                    .get("http_status")
                    .and_then(Value::as_u64)
                    .map(|v| v as u16);
                let body = map.get("body").and_then(Value::as_str).map(str::to_owned);
                let context = map.get("context").and_then(Value::as_object).cloned();
                let headers = map.get("headers").and_then(Value::as_object).map(|obj| {
                    obj.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                        .collect()
                });
                Ok(Self {
                    allowed,
                    http_status,
                    body,
                    context,
                    headers,
                })
            }
            other => Err(EvalError(format!(
                "unexpected decision value: {other}"
            ))),
        }
    }
}

/// A prepared policy evaluator.
///
/// Implementations are prepared once at factory time and must be safe to
/// call from many streams concurrently without extra synchronisation.
pub trait PolicyEvaluator: Send + Sync {
    fn eval(&self, rule: Rule, input: &Value) -> Result<Decision, EvalError>;
}
