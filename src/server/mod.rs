//! The user-facing JSON web server that listens for captioning and analysis
//! requests. Every per-request failure is converted to an `{"error": ...}`
//! body here; nothing propagates far enough to take the process down.

use crate::imaging::DecodeError;
use crate::vision::VisionError;
use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub mod protocol;
pub mod routes;

/// Body shape shared by every error status
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no image data provided")]
    MissingImage,

    #[error("invalid request body: {0}")]
    Payload(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Vision(#[from] VisionError),
}

impl actix_web::error::ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        error!("request failed: {self}");
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(ErrorBody {
                error: self.to_string(),
            })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingImage | ApiError::Payload(_) => StatusCode::BAD_REQUEST,
            ApiError::Decode(_) | ApiError::Vision(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
