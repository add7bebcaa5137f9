mod exercises;

pub use exercises::*;

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse, web};
use serde::Serialize;

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub reason: &'static str,
    pub message: String,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    log::info!("Rejected malformed request body: {err}");
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        status: "fail",
        reason: "ERR_INVALID_ARGUMENT",
        message: "Invalid data!".to_string(),
    });
    InternalError::from_response(err, response).into()
}

/// Registers every route of the service
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route(
        "/exercises/validate_code",
        web::post().to(validate_code_handler),
    )
    .route(
        "/api/exercises/validate_code",
        web::post().to(validate_code_handler),
    );
}
