mod common;

use actix_web::http::{header, StatusCode};
use actix_web::{test, web, App};
use common::{encode, fundus_image, multipart_body, multipart_content_type, random_handle};
use dr_backend::pipeline::Grader;
use dr_backend::routes::{configure_routes, AppState};
use dr_backend::vision::Preprocessor;
use image::ImageFormat;
use serde_json::Value;

fn state(with_model: bool) -> web::Data<AppState> {
    let preprocessor = Preprocessor::default();
    let grader = with_model.then(|| Grader::new(preprocessor.clone(), random_handle()));
    web::Data::new(AppState::new(preprocessor, grader))
}

fn upload(body: Vec<u8>) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/predict")
        .insert_header((header::CONTENT_TYPE, multipart_content_type()))
        .set_payload(body)
}

#[actix_web::test]
async fn health_reports_missing_model() {
    let app = test::init_service(App::new().app_data(state(false)).configure(configure_routes)).await;
    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["model_loaded"], false);
    assert_eq!(body["service"], "Diabetic Retinopathy Detection API");
}

#[actix_web::test]
async fn predict_without_model_is_unavailable() {
    let app = test::init_service(App::new().app_data(state(false)).configure(configure_routes)).await;
    let png = encode(&fundus_image(128, 128), ImageFormat::Png);
    let req = upload(multipart_body("file", "eye.png", "image/png", &png)).to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["detail"], "Model not loaded");

    let req = test::TestRequest::get().uri("/model-info").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[actix_web::test]
async fn oversized_upload_is_rejected_before_model_lookup() {
    let app = test::init_service(App::new().app_data(state(false)).configure(configure_routes)).await;
    let big = vec![0u8; 15 * 1024 * 1024];
    let req = upload(multipart_body("file", "huge.png", "image/png", &big)).to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["detail"].as_str().unwrap().contains("too large"));
}

#[actix_web::test]
async fn text_upload_is_bad_request() {
    let app = test::init_service(App::new().app_data(state(false)).configure(configure_routes)).await;
    let req = upload(multipart_body(
        "file",
        "notes.png",
        "image/png",
        b"definitely not an image",
    ))
    .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .starts_with("Invalid image format"));
}

#[actix_web::test]
async fn missing_file_field_is_bad_request() {
    let app = test::init_service(App::new().app_data(state(false)).configure(configure_routes)).await;
    let png = encode(&fundus_image(64, 64), ImageFormat::Png);
    let req = upload(multipart_body("image", "eye.png", "image/png", &png)).to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn predict_returns_graded_response() {
    let app = test::init_service(App::new().app_data(state(true)).configure(configure_routes)).await;
    let jpeg = encode(&fundus_image(300, 300), ImageFormat::Jpeg);
    let req = upload(multipart_body("file", "eye.jpg", "image/jpeg", &jpeg)).to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "success");
    let severity = body["severity"].as_str().unwrap();
    assert!(["Low Risk", "Medium Risk", "High Risk"].contains(&severity));
    let probs = body["probabilities"].as_object().unwrap();
    assert_eq!(probs.len(), 5);
    let total: f64 = probs.values().map(|v| v.as_f64().unwrap()).sum();
    assert!((total - 1.0).abs() < 1e-3);

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["model_loaded"], true);
}
