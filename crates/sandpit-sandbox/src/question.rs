//! Questions, test cases and per-case results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bundle::ExecutionMode;
use crate::verdict::deserialize_some;

/// Id of a legacy component question that predates declared modes.
const LEGACY_COMPONENT_IDS: &[&str] = &["id234"];

const REACT_HOOKS: &[&str] = &["useState", "useEffect", "useRef", "useReducer", "useMemo"];

/// One input/expected-output pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    /// Test case id.
    pub id: String,
    /// Input handed to the function or harness.
    #[serde(default)]
    pub input: Value,
    /// Expected output. Absent means `undefined`; `null` means null.
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_output: Option<Value>,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Hidden from the candidate.
    #[serde(default)]
    pub is_hidden: bool,
}

/// An assessment question with its test cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    /// Question id.
    pub id: String,
    /// Title.
    #[serde(default)]
    pub title: String,
    /// Prompt text.
    #[serde(default)]
    pub description: String,
    /// Starter code shown to the candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boilerplate: Option<String>,
    /// Declared execution mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    /// Template defining `executeTest(input)` for component questions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_harness: Option<String>,
    /// Test cases, run in order.
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

impl Question {
    /// The mode to grade in: the declared mode, else a legacy heuristic.
    pub fn infer_mode(&self) -> ExecutionMode {
        if let Some(mode) = self.execution_mode {
            return mode;
        }

        let title = self.title.to_lowercase();
        let description = self.description.to_lowercase();
        let mentions_component = ["react", "component"]
            .iter()
            .any(|word| title.contains(word) || description.contains(word));
        let uses_hooks = self
            .boilerplate
            .as_deref()
            .is_some_and(|code| REACT_HOOKS.iter().any(|hook| code.contains(hook)));

        if mentions_component || uses_hooks || LEGACY_COMPONENT_IDS.contains(&self.id.as_str()) {
            tracing::debug!(question_id = %self.id, "no declared mode, inferred react-component");
            ExecutionMode::ReactComponent
        } else {
            ExecutionMode::VanillaDom
        }
    }
}

/// Outcome of running one test case.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// The test case.
    pub test_case: TestCase,
    /// Verdict.
    pub passed: bool,
    /// Value produced; absent when the function returned `undefined` or failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Kind of the failure ([`SandboxError::kind`](crate::SandboxError::kind)),
    /// when the case did not run to a verdict.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    /// Wall-clock time spent on the case.
    pub duration_ms: u64,
}

impl TestResult {
    /// A failed result carrying `error`.
    pub fn failure(test_case: TestCase, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            test_case,
            passed: false,
            output: None,
            error: Some(error.into()),
            error_kind: None,
            duration_ms,
        }
    }

    /// Tags the failure with the kind of error that caused it.
    pub fn with_error_kind(mut self, kind: &'static str) -> Self {
        self.error_kind = Some(kind);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(json: &str) -> Question {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_cases_distinguish_null_from_absent() {
        let q = question(
            r#"{"id":"q1","testCases":[
                {"id":"a","input":1,"expectedOutput":null},
                {"id":"b","input":1},
                {"id":"c","input":1,"expectedOutput":[0,1],"isHidden":true}
            ]}"#,
        );
        assert_eq!(q.test_cases[0].expected_output, Some(Value::Null));
        assert_eq!(q.test_cases[1].expected_output, None);
        assert!(q.test_cases[2].is_hidden);
    }

    #[test]
    fn declared_mode_wins() {
        let q = question(r#"{"id":"q","title":"React counter","executionMode":"vanilla-dom"}"#);
        assert_eq!(q.infer_mode(), ExecutionMode::VanillaDom);
    }

    #[test]
    fn heuristic_fallbacks() {
        assert_eq!(
            question(r#"{"id":"q","title":"Build a Counter Component"}"#).infer_mode(),
            ExecutionMode::ReactComponent
        );
        assert_eq!(
            question(r#"{"id":"q","title":"Toggle","boilerplate":"const [on, setOn] = useState(false);"}"#)
                .infer_mode(),
            ExecutionMode::ReactComponent
        );
        assert_eq!(
            question(r#"{"id":"id234","title":"Widget"}"#).infer_mode(),
            ExecutionMode::ReactComponent
        );
        assert_eq!(
            question(r#"{"id":"q","title":"Two Sum"}"#).infer_mode(),
            ExecutionMode::VanillaDom
        );
    }

    #[test]
    fn result_serializes_camel_case() {
        let case = TestCase {
            id: "t".into(),
            input: Value::Null,
            expected_output: None,
            description: String::new(),
            is_hidden: false,
        };
        let value = serde_json::to_value(TestResult::failure(case, "boom", 3)).unwrap();
        assert_eq!(value["durationMs"], 3);
        assert_eq!(value["testCase"]["isHidden"], false);
        assert!(value.get("output").is_none());
    }
}
