//! The JSON routes. Validation runs first so a malformed body is always a
//! client error, then the readiness check, so a not-ready service never
//! touches the image payload.

use super::protocol::{
    AnalyzeRequest, AnalyzeResponse, CaptionRequest, CaptionResponse, HealthResponse,
    ModelsResponse,
};
use super::ApiError;
use crate::config::{DEFAULT_MODEL_LABEL, KNOWN_MODELS, SERVICE_NAME};
use crate::imaging;
use crate::vision::ModelState;
use actix_web::{get, post, web, Responder};
use tracing::info;

type Result<T> = std::result::Result<T, ApiError>;

#[get("/health")]
pub async fn health(state: web::Data<ModelState>) -> impl Responder {
    web::Json(HealthResponse {
        status: "healthy",
        model_loaded: state.is_loaded(),
        service: SERVICE_NAME,
    })
}

#[get("/models")]
pub async fn models() -> impl Responder {
    web::Json(ModelsResponse {
        models: KNOWN_MODELS.to_vec(),
    })
}

#[post("/caption")]
pub async fn caption(
    req: web::Json<CaptionRequest>,
    state: web::Data<ModelState>,
) -> Result<impl Responder> {
    let req = req.into_inner();
    let payload = require_image(req.image.as_deref())?;
    let model = state.model()?;

    let image = imaging::decode(payload)?;
    let caption = model.caption(&image)?;

    info!("served caption request");
    Ok(web::Json(CaptionResponse {
        caption,
        model: req.model.unwrap_or_else(|| DEFAULT_MODEL_LABEL.to_string()),
    }))
}

#[post("/analyze")]
pub async fn analyze(
    req: web::Json<AnalyzeRequest>,
    state: web::Data<ModelState>,
) -> Result<impl Responder> {
    let req = req.into_inner();
    let payload = require_image(req.image.as_deref())?;
    let model = state.model()?;

    let image = imaging::decode(payload)?;
    let description = model.analyze(&image, &req.prompt, req.max_length)?;

    info!("served analyze request");
    Ok(web::Json(AnalyzeResponse {
        description,
        prompt: req.prompt,
        model: req.model.unwrap_or_else(|| DEFAULT_MODEL_LABEL.to_string()),
    }))
}

fn require_image(image: Option<&str>) -> Result<&str> {
    image.filter(|s| !s.is_empty()).ok_or(ApiError::MissingImage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::{json, Value};

    /// A service wired exactly like production, minus a loaded model
    macro_rules! unready_app {
        () => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new(ModelState::new()))
                    .service(health)
                    .service(models)
                    .service(caption)
                    .service(analyze),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn health_reports_unloaded_model() {
        let app = unready_app!();
        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model_loaded"], json!(false));
        assert_eq!(body["service"], "BLIP-2 Image Analysis");
    }

    #[actix_web::test]
    async fn models_lists_known_identifiers() {
        let app = unready_app!();
        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/models").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        let listed = body["models"].as_array().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.contains(&json!("Salesforce/blip2-opt-2.7b")));
    }

    #[actix_web::test]
    async fn caption_without_image_is_client_error() {
        let app = unready_app!();
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/caption")
                .set_json(json!({}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "no image data provided");
    }

    #[actix_web::test]
    async fn caption_with_empty_image_is_client_error() {
        let app = unready_app!();
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/caption")
                .set_json(json!({"image": ""}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn analyze_without_image_is_client_error() {
        let app = unready_app!();
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/analyze")
                .set_json(json!({"prompt": "What color is this?"}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "no image data provided");
    }

    #[actix_web::test]
    async fn caption_before_load_is_ready_error() {
        let app = unready_app!();
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/caption")
                .set_json(json!({"image": "aGVsbG8="}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "model not loaded");
    }

    #[actix_web::test]
    async fn analyze_before_load_is_ready_error() {
        let app = unready_app!();
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/analyze")
                .set_json(json!({"image": "aGVsbG8=", "max_length": 20}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "model not loaded");
    }
}
