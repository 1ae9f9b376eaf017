use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{web, Error, HttpResponse};
use futures::TryStreamExt;
use log::{error, info, warn};
use uuid::Uuid;

use crate::pipeline::{Grader, GradingError};
use crate::vision::{ImageBytes, PreprocessError, Preprocessor};
use shared::{ErrorResponse, HealthResponse};

pub const SERVICE_NAME: &str = "Diabetic Retinopathy Detection API";
const UPLOAD_FIELD: &str = "file";

/// Shared state for every worker. `grader` is `None` when the service started
/// without a model.
pub struct AppState {
    preprocessor: Preprocessor,
    grader: Option<Grader>,
}

impl AppState {
    pub fn new(preprocessor: Preprocessor, grader: Option<Grader>) -> Self {
        Self {
            preprocessor,
            grader,
        }
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/predict").route(web::post().to(predict)))
        .service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/model-info").route(web::get().to(model_info)));
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(ErrorResponse::new(detail))
}

fn preprocess_status(err: &PreprocessError) -> StatusCode {
    match err {
        PreprocessError::ImageTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        PreprocessError::InvalidImageFormat(_) => StatusCode::BAD_REQUEST,
    }
}

fn model_not_loaded() -> HttpResponse {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "Model not loaded")
}

enum Upload {
    Complete(ImageBytes),
    TooLarge(PreprocessError),
    Missing,
}

/// Buffers the `file` field, giving up as soon as it passes `limit` bytes.
async fn read_upload(payload: &mut Multipart, limit: usize) -> Result<Upload, Error> {
    while let Some(mut field) = payload.try_next().await? {
        let is_upload = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .is_some_and(|name| name == UPLOAD_FIELD);
        if !is_upload {
            while field.try_next().await?.is_some() {}
            continue;
        }

        let mime_type = field.content_type().map(|m| m.essence_str().to_string());
        let file_name = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);

        let mut data = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            let size = data.len() + chunk.len();
            if size > limit {
                return Ok(Upload::TooLarge(PreprocessError::ImageTooLarge { size, limit }));
            }
            data.extend_from_slice(&chunk);
        }

        let mut image = ImageBytes::new(data);
        if let Some(mime_type) = mime_type {
            image = image.with_mime_type(mime_type);
        }
        if let Some(file_name) = file_name {
            image = image.with_file_name(file_name);
        }
        return Ok(Upload::Complete(image));
    }
    Ok(Upload::Missing)
}

async fn predict(state: web::Data<AppState>, mut payload: Multipart) -> Result<HttpResponse, Error> {
    let request_id = Uuid::new_v4();

    let image = match read_upload(&mut payload, state.preprocessor.max_bytes()).await? {
        Upload::Complete(image) => image,
        Upload::TooLarge(err) => {
            warn!("[{}] Rejected upload: {}", request_id, err);
            return Ok(error_response(preprocess_status(&err), err.to_string()));
        }
        Upload::Missing => {
            warn!("[{}] Request has no '{}' field", request_id, UPLOAD_FIELD);
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                format!("Missing multipart field '{}'", UPLOAD_FIELD),
            ));
        }
    };
    info!(
        "[{}] Received {} ({} bytes, {}, sha256 {})",
        request_id,
        image.file_name().unwrap_or("<unnamed>"),
        image.len(),
        image.mime_type().unwrap_or("no content type"),
        image.digest()
    );

    if let Err(err) = state.preprocessor.validate(&image) {
        warn!("[{}] Rejected upload: {}", request_id, err);
        return Ok(error_response(preprocess_status(&err), err.to_string()));
    }

    let Some(grader) = state.grader.clone() else {
        warn!("[{}] Prediction requested without a loaded model", request_id);
        return Ok(model_not_loaded());
    };

    let outcome = web::block(move || grader.grade(&image)).await;
    let response = match outcome {
        Ok(Ok(result)) => {
            info!(
                "[{}] Diagnosis {} ({})",
                request_id, result.diagnosis, result.severity
            );
            HttpResponse::Ok().json(result.to_response())
        }
        Ok(Err(GradingError::Preprocess(err))) => {
            warn!("[{}] Rejected upload: {}", request_id, err);
            error_response(preprocess_status(&err), err.to_string())
        }
        Ok(Err(err)) => {
            error!("[{}] Prediction failed: {}", request_id, err);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Prediction failed: {}", err),
            )
        }
        Err(err) => {
            error!("[{}] Grading task did not complete: {}", request_id, err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Prediction failed")
        }
    };
    Ok(response)
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        model_loaded: state.grader.is_some(),
        service: SERVICE_NAME.to_string(),
    })
}

async fn model_info(state: web::Data<AppState>) -> HttpResponse {
    match &state.grader {
        Some(grader) => HttpResponse::Ok().json(grader.model_info()),
        None => model_not_loaded(),
    }
}
