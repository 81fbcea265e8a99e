//! Rego-backed policy evaluator.
//!
//! Modules and the static data document are compiled into a `regorus`
//! engine once, at factory time. The engine itself needs `&mut self` to
//! evaluate, so each evaluation works on a cheap clone of the prepared
//! engine; that keeps the evaluator lock-free under concurrent streams.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::ConfigError;
use crate::filter::decision::{Decision, EvalError, PolicyEvaluator, Rule};

/// Prepared Rego evaluator shared by all filter sessions.
#[derive(Debug)]
pub struct RegoEvaluator {
    engine: regorus::Engine,
}

impl RegoEvaluator {
    /// Compile `modules` (filename → contents) and commit the optional
    /// static `data` document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Policy`] when a module fails to parse or the
    /// data document is rejected.
    pub fn new(
        modules: &HashMap<String, String>,
        data: Option<&Value>,
    ) -> Result<Self, ConfigError> {
        let mut engine = regorus::Engine::new();
        for (filename, contents) in modules {
            engine
                .add_policy(filename.clone(), contents.clone())
                .map_err(|e| ConfigError::Policy(format!("{filename}: {e}")))?;
        }

        if let Some(data) = data {
            let value = regorus::Value::from_json_str(&data.to_string())
                .map_err(|e| ConfigError::Policy(format!("invalid data document: {e}")))?;
            engine
                .add_data(value)
                .map_err(|e| ConfigError::Policy(format!("failed to load data document: {e}")))?;
        }

        Ok(Self { engine })
    }
}

impl PolicyEvaluator for RegoEvaluator {
    fn eval(&self, rule: Rule, input: &Value) -> Result<Decision, EvalError> {
        let mut engine = self.engine.clone();
        let input = regorus::Value::from_json_str(&input.to_string())
            .map_err(|e| EvalError(format!("invalid input document: {e}")))?;
        engine.set_input(input);

        let value = engine
            .eval_rule(rule.query())
            .map_err(|e| EvalError(format!("{rule}: {e}")))?;
        if matches!(value, regorus::Value::Undefined) {
            return Err(EvalError(format!("rule {rule} evaluated to undefined")));
        }

        let json: Value = serde_json::from_str(
            &value
                .to_json_str()
                .map_err(|e| EvalError(format!("{rule}: unserialisable result: {e}")))?,
        )
        .map_err(|e| EvalError(format!("{rule}: invalid result document: {e}")))?;
        Decision::from_value(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one_module(contents: &str) -> HashMap<String, String> {
        HashMap::from([("test.rego".to_owned(), contents.to_owned())])
    }

    #[test]
    fn boolean_rule_evaluates() {
        let module = r#"
            package ccr.policy

            default on_request_headers = true
        "#;
        let eval = RegoEvaluator::new(&one_module(module), None).unwrap();
        let d = eval.eval(Rule::OnRequestHeaders, &json!({})).unwrap();
        assert!(d.allowed);
    }

    #[test]
    fn object_rule_evaluates_against_input() {
        let module = r#"
            package ccr.policy

            import future.keywords

            default on_request_headers = {"allowed": false, "http_status": 403}

            on_request_headers := {"allowed": true} if {
                input.subject == "trusted"
            }
        "#;
        let eval = RegoEvaluator::new(&one_module(module), None).unwrap();

        let allowed = eval
            .eval(Rule::OnRequestHeaders, &json!({"subject": "trusted"}))
            .unwrap();
        assert!(allowed.allowed);

        let denied = eval
            .eval(Rule::OnRequestHeaders, &json!({"subject": "other"}))
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.http_status, Some(403));
    }

    #[test]
    fn static_data_is_visible_to_policies() {
        let module = r#"
            package ccr.policy

            import future.keywords

            default on_request_headers = false

            on_request_headers := true if {
                data.settings.permitted == true
            }
        "#;
        let data = json!({"settings": {"permitted": true}});
        let eval = RegoEvaluator::new(&one_module(module), Some(&data)).unwrap();
        let d = eval.eval(Rule::OnRequestHeaders, &json!({})).unwrap();
        assert!(d.allowed);
    }

    #[test]
    fn missing_rule_is_an_eval_error() {
        let module = r#"
            package ccr.policy

            default on_request_headers = true
        "#;
        let eval = RegoEvaluator::new(&one_module(module), None).unwrap();
        assert!(eval.eval(Rule::OnResponseBody, &json!({})).is_err());
    }

    #[test]
    fn invalid_module_is_a_config_error() {
        let err = RegoEvaluator::new(&one_module("this is not rego"), None).unwrap_err();
        assert!(matches!(err, ConfigError::Policy(_)));
    }
}
