use std::sync::Arc;

use anyhow::anyhow;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::SandboxConfig;
use crate::exercise::{Exercise, ExerciseRepository};
use crate::sandbox::{
    CompilationFailure, ConfigurationError, Grader, GradingResult, PrepareError,
    RestrictedRuntime, SourceAuditor,
};

/// Body of a grading request as received. Fields are checked by
/// [`Submission::try_from`] so that every shape problem maps to
/// [`GradeError::RequestMalformed`].
#[derive(Deserialize, Debug, Clone, Default)]
pub struct SubmissionRequest {
    #[serde(alias = "exerciseId")]
    pub exercise_id: Option<Value>,
    pub answer: Option<Value>,
}

/// A validated grading request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub exercise_id: u32,
    pub source: String,
}

impl TryFrom<SubmissionRequest> for Submission {
    type Error = GradeError;

    fn try_from(request: SubmissionRequest) -> Result<Self, Self::Error> {
        let exercise_id = request
            .exercise_id
            .as_ref()
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .filter(|&id| id > 0)
            .ok_or_else(|| GradeError::RequestMalformed("invalid exercise id".to_string()))?;
        let source = match request.answer {
            Some(Value::String(source)) => source,
            _ => return Err(GradeError::RequestMalformed("missing answer".to_string())),
        };
        Ok(Self {
            exercise_id,
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum GradeError {
    #[error("{0}")]
    RequestMalformed(String),
    #[error("exercise {0} not found")]
    NotFound(u32),
    #[error("exercise {exercise_id} has {source}")]
    Configuration {
        exercise_id: u32,
        source: ConfigurationError,
    },
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    CompilationFailed(#[from] CompilationFailure),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Runs a submission through audit, definition pass and grading
pub struct GradingOrchestrator {
    repository: Arc<dyn ExerciseRepository>,
    runtime: Arc<RestrictedRuntime>,
}

impl GradingOrchestrator {
    pub fn new(repository: Arc<dyn ExerciseRepository>, config: SandboxConfig) -> Self {
        Self {
            repository,
            runtime: Arc::new(RestrictedRuntime::new(config)),
        }
    }

    pub async fn grade(&self, request: SubmissionRequest) -> Result<GradingResult, GradeError> {
        let submission = Submission::try_from(request)?;
        let id = submission.exercise_id;

        let exercise = self
            .repository
            .fetch_by_id(id)
            .await?
            .ok_or(GradeError::NotFound(id))?;

        if !exercise.is_consistent() {
            let err = GradeError::Configuration {
                exercise_id: id,
                source: ConfigurationError {
                    tests: exercise.test_cases.len(),
                    expected: exercise.solutions.len(),
                },
            };
            log::error!("Authoring defect: {err}");
            return Err(err);
        }

        let runtime = self.runtime.clone();
        tokio::task::spawn_blocking(move || execute(&runtime, &exercise, &submission.source))
            .await
            .map_err(|e| anyhow!("grading task for exercise {id} failed: {e}"))?
    }
}

fn execute(
    runtime: &RestrictedRuntime,
    exercise: &Exercise,
    source: &str,
) -> Result<GradingResult, GradeError> {
    let id = exercise.id;

    // A blank submission is graded against the bare builtins
    let source = if source.trim().is_empty() {
        ""
    } else {
        let verdict = SourceAuditor::audit(source);
        if verdict.syntax_error {
            let reason = verdict.reason.unwrap_or_default();
            log::info!("Submission for exercise {id} failed to compile: {reason}");
            return Err(CompilationFailure { reason }.into());
        }
        if !verdict.safe {
            let reason = verdict.reason.unwrap_or_default();
            log::warn!("Submission for exercise {id} rejected: {reason}");
            return Err(GradeError::Rejected(reason));
        }
        source
    };

    let mut ctx = runtime.prepare(source).map_err(|err| match err {
        PrepareError::Compilation(failure) => {
            log::info!("Submission for exercise {id} failed to compile: {failure}");
            GradeError::CompilationFailed(failure)
        }
        other => GradeError::Internal(anyhow::Error::new(other)),
    })?;

    let result = Grader::run(&exercise.test_cases, &exercise.solutions, &mut ctx).map_err(
        |source| GradeError::Configuration {
            exercise_id: id,
            source,
        },
    )?;
    log::info!(
        "Graded exercise {id}: {}/{} passed",
        result.outcomes.iter().filter(|o| o.passed).count(),
        result.outcomes.len()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::exercise::ConfigExerciseRepository;

    fn exercise(id: u32, tests: &[&str], solutions: &[&str]) -> Exercise {
        Exercise {
            id,
            title: format!("exercise {id}"),
            body: String::new(),
            difficulty: 1,
            test_cases: tests.iter().map(|s| s.to_string()).collect(),
            solutions: solutions.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn orchestrator() -> GradingOrchestrator {
        let repository = ConfigExerciseRepository::new(vec![
            exercise(1, &["1+1", "print(1)"], &["2", "1"]),
            exercise(2, &["square(3)", "square(-2)"], &["9", "4"]),
            exercise(3, &["1+1"], &[]),
        ]);
        GradingOrchestrator::new(Arc::new(repository), SandboxConfig::default())
    }

    fn request(body: Value) -> SubmissionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_submission_validation() {
        let ok = Submission::try_from(request(json!({"exerciseId": 4, "answer": ""}))).unwrap();
        assert_eq!(
            ok,
            Submission {
                exercise_id: 4,
                source: String::new()
            }
        );
        for body in [
            json!({"answer": "x = 1"}),
            json!({"exercise_id": 0, "answer": "x = 1"}),
            json!({"exercise_id": -3, "answer": "x = 1"}),
            json!({"exercise_id": "7", "answer": "x = 1"}),
            json!({"exercise_id": 4294967296u64, "answer": "x = 1"}),
            json!({"exercise_id": 1}),
            json!({"exercise_id": 1, "answer": 5}),
        ] {
            let err = Submission::try_from(request(body.clone())).unwrap_err();
            assert!(matches!(err, GradeError::RequestMalformed(_)), "{body}");
        }
    }

    #[tokio::test]
    async fn test_grades_correct_submission() {
        let result = orchestrator()
            .grade(request(json!({"exercise_id": 2, "answer": "def square(x):\n    return x * x\n"})))
            .await
            .unwrap();
        assert_eq!(result.passed(), vec![true, true]);
        assert!(result.all_correct);
    }

    #[tokio::test]
    async fn test_blank_submission_uses_builtins_only() {
        let result = orchestrator()
            .grade(request(json!({"exercise_id": 1, "answer": "  \n"})))
            .await
            .unwrap();
        assert_eq!(result.actual(), vec!["2", "1"]);
        assert!(result.all_correct);
    }

    #[tokio::test]
    async fn test_error_kinds() {
        let orchestrator = orchestrator();
        let grade = |body: Value| orchestrator.grade(request(body));

        assert!(matches!(
            grade(json!({"exercise_id": 99, "answer": ""})).await,
            Err(GradeError::NotFound(99))
        ));
        assert!(matches!(
            grade(json!({"exercise_id": 3, "answer": "import os"})).await,
            Err(GradeError::Configuration { exercise_id: 3, .. })
        ));
        match grade(json!({"exercise_id": 2, "answer": "import os\nos.system('ls')"})).await {
            Err(GradeError::Rejected(reason)) => assert!(reason.contains("'os'"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }
        match grade(json!({"exercise_id": 2, "answer": "def f("})).await {
            Err(GradeError::CompilationFailed(failure)) => {
                assert!(failure.reason.starts_with("SyntaxError: "), "{failure}");
                assert!(failure.reason.ends_with("(line 1)"), "{failure}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_grading_is_idempotent() {
        let orchestrator = orchestrator();
        let body = json!({"exercise_id": 2, "answer": "calls = []\ndef square(x):\n    calls.append(x)\n    return x * len(calls)\n"});
        let first = orchestrator.grade(request(body.clone())).await.unwrap();
        let second = orchestrator.grade(request(body)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.actual(), vec!["3", "-4"]);
    }
}
