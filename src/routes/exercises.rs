use actix_web::{HttpResponse, web};
use serde::Serialize;
use tokio::sync::oneshot;

use super::ErrorResponse;
use crate::grading::{GradeError, SubmissionRequest};
use crate::queue::GradingQueue;
use crate::sandbox::GradingResult;

/// A grading request waiting for a worker
pub struct GradingJob {
    pub request: SubmissionRequest,
    pub responder: oneshot::Sender<Result<GradingResult, GradeError>>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ValidateCodeResponse {
    pub status: &'static str,
    pub results: Vec<bool>,
    pub user_results: Vec<String>,
    pub all_correct: bool,
}

impl From<GradingResult> for ValidateCodeResponse {
    fn from(result: GradingResult) -> Self {
        Self {
            status: "success",
            results: result.passed(),
            user_results: result.actual(),
            all_correct: result.all_correct,
        }
    }
}

pub async fn validate_code_handler(
    queue: web::Data<GradingQueue>,
    body: web::Json<SubmissionRequest>,
) -> HttpResponse {
    let (tx, rx) = oneshot::channel();
    queue
        .push(GradingJob {
            request: body.into_inner(),
            responder: tx,
        })
        .await;
    log::debug!("Sent grading job to queue");

    match rx.await {
        Ok(Ok(result)) => HttpResponse::Ok().json(ValidateCodeResponse::from(result)),
        Ok(Err(err)) => error_response(err),
        Err(e) => {
            log::error!("Failed to receive grading result: {e}");
            internal_error()
        }
    }
}

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(ErrorResponse {
        status: "error",
        reason: "ERR_INTERNAL",
        message: "Internal server error".to_string(),
    })
}

fn fail(reason: &'static str, message: String) -> ErrorResponse {
    ErrorResponse {
        status: "fail",
        reason,
        message,
    }
}

pub fn error_response(err: GradeError) -> HttpResponse {
    match err {
        GradeError::RequestMalformed(detail) => HttpResponse::BadRequest().json(fail(
            "ERR_INVALID_ARGUMENT",
            format!("Invalid data: {detail}!"),
        )),
        GradeError::NotFound(_) => {
            HttpResponse::NotFound().json(fail("ERR_NOT_FOUND", "Exercise not found!".to_string()))
        }
        GradeError::Configuration { .. } => HttpResponse::InternalServerError().json(fail(
            "ERR_CONFIGURATION",
            "Tests and solutions length mismatch!".to_string(),
        )),
        GradeError::Rejected(reason) => HttpResponse::BadRequest().json(fail(
            "ERR_REJECTED",
            format!("Unsafe code rejected: {reason}"),
        )),
        GradeError::CompilationFailed(failure) => HttpResponse::BadRequest().json(fail(
            "ERR_COMPILATION",
            format!("Code compilation failed: {failure}!"),
        )),
        GradeError::Internal(e) => {
            log::error!("Error during code validation: {e:#}");
            internal_error()
        }
    }
}
