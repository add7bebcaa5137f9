use serde::Serialize;

use super::{ConfigurationError, ExecutionContext};

/// Result of one test expression
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub index: usize,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct GradingResult {
    pub outcomes: Vec<TestOutcome>,
    pub all_correct: bool,
}

impl GradingResult {
    fn new(outcomes: Vec<TestOutcome>) -> Self {
        let all_correct = !outcomes.is_empty() && outcomes.iter().all(|o| o.passed);
        Self {
            outcomes,
            all_correct,
        }
    }

    pub fn passed(&self) -> Vec<bool> {
        self.outcomes.iter().map(|o| o.passed).collect()
    }

    pub fn actual(&self) -> Vec<String> {
        self.outcomes.iter().map(|o| o.actual.clone()).collect()
    }
}

pub struct Grader;

impl Grader {
    /// Evaluates every test against `ctx` in order. A failing test is
    /// recorded in its outcome and never stops the remaining ones.
    pub fn run(
        tests: &[String],
        expected: &[String],
        ctx: &mut ExecutionContext,
    ) -> Result<GradingResult, ConfigurationError> {
        if tests.len() != expected.len() {
            return Err(ConfigurationError {
                tests: tests.len(),
                expected: expected.len(),
            });
        }

        let outcomes = tests
            .iter()
            .zip(expected)
            .enumerate()
            .map(|(index, (test, expected))| match ctx.evaluate(test) {
                Ok(actual) => TestOutcome {
                    index,
                    passed: actual == *expected,
                    expected: expected.clone(),
                    actual,
                    error: None,
                },
                Err(err) => {
                    log::debug!("Test {index} failed: {err}");
                    TestOutcome {
                        index,
                        expected: expected.clone(),
                        actual: format!("Error: {err}"),
                        passed: false,
                        error: Some(err.to_string()),
                    }
                }
            })
            .collect();

        Ok(GradingResult::new(outcomes))
    }
}
