use axum::{
    Router,
    body::Body,
    extract::{Request, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    middleware::{Next, from_fn},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, info, warn};
use uuid::Uuid;

use crate::delivery::WorkerPool;
use crate::fallback::truncate_detail;
use crate::intake::{Directory, IntakeSubmission, compose_patient_text};
use crate::models::{AnalysisOutcome, AnalysisRequest};
use crate::wire::{AnalysisReport, ResponseFrame};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct AppState {
    pub workers: WorkerPool,
    pub directory: Arc<dyn Directory>,
}

#[derive(Debug, Deserialize)]
pub struct AnalysisBody {
    pub patient_text_data: String,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub stream: bool,
    pub patient_department: String,
}

#[derive(Debug, Deserialize)]
pub struct IntakeBody {
    pub questionnaire_id: String,
    pub department_id: String,
    pub user_id: String,
    #[serde(default)]
    pub answers: BTreeMap<String, Value>,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/analysis", post(analyze))
        .route("/intake/analysis", post(analyze_intake))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Middleware to add correlation ID to all requests
async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    let correlation_id = Uuid::new_v4().to_string();
    let header_value = HeaderValue::from_str(&correlation_id).ok();

    if let Some(value) = &header_value {
        request.headers_mut().insert(CORRELATION_HEADER, value.clone());
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    let mut response = next.run(request).instrument(span).await;

    if let Some(value) = header_value {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "Intake Triage Analysis Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Multi-stage AI pre-consultation analysis of patient intake data",
        "departments": state.workers.pipeline().validator().departments(),
        "endpoints": {
            "POST /analysis": "Analyse patient text and an optional image",
            "POST /intake/analysis": "Analyse a questionnaire submission",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let ready = state.workers.pipeline().is_ready();
    Json(json!({
        "status": if ready { "healthy" } else { "degraded" },
        "ready": ready,
        "idle_workers": state.workers.idle_workers(),
        "max_workers": state.workers.max_workers(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn analyze(
    State(state): State<AppState>,
    body: Result<Json<AnalysisBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection),
    };

    info!(
        department = %body.patient_department,
        stream = body.stream,
        text_chars = body.patient_text_data.chars().count(),
        has_image = body.image_base64.as_deref().is_some_and(|i| !i.is_empty()),
        "Received analysis request"
    );

    let image = match decode_image(body.image_base64.as_deref()) {
        Ok(image) => image,
        Err(outcome) => return single_frame(StatusCode::OK, outcome),
    };

    let mut request =
        AnalysisRequest::new(body.patient_text_data, body.patient_department).streaming(body.stream);
    if let Some(image) = image {
        request = request.with_image(image);
    }

    ndjson_response(StatusCode::OK, state.workers.spawn(request))
}

async fn analyze_intake(
    State(state): State<AppState>,
    body: Result<Json<IntakeBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection),
    };

    info!(
        questionnaire_id = %body.questionnaire_id,
        department_id = %body.department_id,
        stream = body.stream,
        answers = body.answers.len(),
        "Received intake analysis request"
    );

    let image = match decode_image(body.image_base64.as_deref()) {
        Ok(image) => image,
        Err(outcome) => return single_frame(StatusCode::OK, outcome),
    };

    let submission = IntakeSubmission {
        questionnaire_id: body.questionnaire_id,
        department_id: body.department_id,
        user_id: body.user_id,
        answers: body.answers,
    };
    let composed = match compose_patient_text(state.directory.as_ref(), &submission).await {
        Ok(composed) => composed,
        Err(e) => {
            warn!(error = %e, "Intake composition failed");
            return single_frame(StatusCode::OK, e.into());
        }
    };

    let mut request = composed.into_request().streaming(body.stream);
    if let Some(image) = image {
        request = request.with_image(image);
    }

    ndjson_response(StatusCode::OK, state.workers.spawn(request))
}

/// Decode an optional base64 image, accepting a `data:<mime>;base64,` prefix
pub fn decode_image(encoded: Option<&str>) -> Result<Option<Vec<u8>>, AnalysisOutcome> {
    let Some(encoded) = encoded.map(str::trim).filter(|e| !e.is_empty()) else {
        return Ok(None);
    };

    let data = match encoded.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, data)| data),
        None => encoded,
    };

    STANDARD.decode(data).map(Some).map_err(|e| {
        warn!(error = %e, "Undecodable image data");
        AnalysisOutcome::InternalError {
            detail: truncate_detail(&format!("图片数据解码失败: {e}")),
        }
    })
}

fn rejected(rejection: JsonRejection) -> Response {
    warn!(error = %rejection.body_text(), "Malformed request body");
    single_frame(
        rejection.status(),
        AnalysisOutcome::InternalError {
            detail: truncate_detail(&rejection.body_text()),
        },
    )
}

/// A response made of one final report frame
fn single_frame(status: StatusCode, outcome: AnalysisOutcome) -> Response {
    let (tx, rx) = mpsc::channel(1);
    let frame = ResponseFrame::report(&AnalysisReport::from_outcome(outcome));
    // Capacity 1 and a fresh channel: the send cannot fail
    let _ = tx.try_send(frame);
    ndjson_response(status, rx)
}

fn ndjson_response(status: StatusCode, frames: mpsc::Receiver<ResponseFrame>) -> Response {
    let stream = ReceiverStream::new(frames).map(|frame| Ok::<_, Infallible>(frame.to_ndjson()));
    (
        status,
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(stream),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::{ScriptedModel, ScriptedRetriever, THROAT_REPORT};
    use crate::department::DepartmentValidator;
    use crate::intake::InMemoryDirectory;
    use crate::models::END_OF_STREAM;
    use crate::pipeline::{Pipeline, Services};
    use crate::wire::AnalysisStatus;
    use axum::http::{self, Method};
    use tower::ServiceExt;

    fn app_with(services: Services) -> Router {
        let pipeline = Pipeline::new(services, DepartmentValidator::new(["耳鼻喉科", "呼吸内科"]));
        let directory = InMemoryDirectory::from_json(
            r#"{
                "questionnaires": {"q1": [{"id": "1", "label": "主要不适"}]},
                "departments": {"7": "耳鼻喉科", "9": "骨科"},
                "users": {"u1": {"name": "张同学", "gender": "男", "age": 20}}
            }"#,
        )
        .unwrap();
        build_router(AppState {
            workers: WorkerPool::new(Arc::new(pipeline), 4),
            directory: Arc::new(directory),
        })
    }

    fn app(model: ScriptedModel) -> Router {
        app_with(Services::new(
            Arc::new(model),
            Arc::new(ScriptedRetriever::new(&["急性咽炎", "扁桃体炎"])),
        ))
    }

    fn post(uri: &str, body: Value) -> Request {
        http::Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn frames(response: Response) -> Vec<ResponseFrame> {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| ResponseFrame::from_ndjson(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn sync_analysis_returns_success_report() {
        let response = app(ScriptedModel::new(THROAT_REPORT))
            .oneshot(post(
                "/analysis",
                json!({
                    "patient_text_data": "主诉：咽喉剧烈疼痛",
                    "image_base64": format!("data:image/png;base64,{}", STANDARD.encode([0x89, b'P', b'N', b'G'])),
                    "stream": false,
                    "patient_department": "耳鼻喉科"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], NDJSON_CONTENT_TYPE);
        assert!(response.headers().contains_key(CORRELATION_HEADER));

        let frames = frames(response).await;
        assert_eq!(frames.len(), 1);
        let report = frames[0].decode_report().unwrap();
        assert_eq!(report.status, AnalysisStatus::Success);
        assert_eq!(report.key_info.unwrap().suggested_department, "耳鼻喉科");
    }

    #[tokio::test]
    async fn streamed_analysis_ends_with_marker() {
        let response = app(ScriptedModel::new("").streaming(&["咽部", "充血"]))
            .oneshot(post(
                "/analysis",
                json!({
                    "patient_text_data": "主诉：咽喉剧烈疼痛",
                    "stream": true,
                    "patient_department": "耳鼻喉科"
                }),
            ))
            .await
            .unwrap();

        let frames = frames(response).await;
        assert_eq!(frames.len(), 3);
        assert!(frames[..2].iter().all(|f| !f.is_final));
        assert!(frames[2].is_final);
        assert_eq!(frames[2].payload.as_ref(), END_OF_STREAM.as_bytes());
    }

    #[tokio::test]
    async fn bad_image_is_an_internal_error_frame() {
        let response = app(ScriptedModel::new(THROAT_REPORT))
            .oneshot(post(
                "/analysis",
                json!({
                    "patient_text_data": "主诉：咽痛",
                    "image_base64": "not base64!!",
                    "patient_department": "耳鼻喉科"
                }),
            ))
            .await
            .unwrap();

        let frames = frames(response).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].decode_report().unwrap().status, AnalysisStatus::InternalError);
    }

    #[tokio::test]
    async fn unready_service_reports_unavailable() {
        let response = app_with(Services::unavailable())
            .oneshot(post(
                "/analysis",
                json!({ "patient_text_data": "咽痛", "patient_department": "耳鼻喉科" }),
            ))
            .await
            .unwrap();

        let report = frames(response).await[0].decode_report().unwrap();
        assert_eq!(report.status, AnalysisStatus::ServiceUnavailable);
        assert_eq!(report.text, "医疗分析服务未就绪，请检查初始化状态。");
    }

    #[tokio::test]
    async fn malformed_body_still_gets_a_final_frame() {
        let response = app(ScriptedModel::new(THROAT_REPORT))
            .oneshot(post("/analysis", json!({ "stream": true })))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        let frames = frames(response).await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_final);
    }

    #[tokio::test]
    async fn intake_submission_is_composed_and_analysed() {
        let response = app(ScriptedModel::new(THROAT_REPORT))
            .oneshot(post(
                "/intake/analysis",
                json!({
                    "questionnaire_id": "q1",
                    "department_id": "7",
                    "user_id": "u1",
                    "answers": { "1": "咽喉剧烈疼痛" }
                }),
            ))
            .await
            .unwrap();

        let report = frames(response).await[0].decode_report().unwrap();
        assert_eq!(report.status, AnalysisStatus::Success);
    }

    #[tokio::test]
    async fn intake_for_unserved_department_is_a_mismatch() {
        let response = app(ScriptedModel::new(THROAT_REPORT))
            .oneshot(post(
                "/intake/analysis",
                json!({
                    "questionnaire_id": "q1",
                    "department_id": "9",
                    "user_id": "u1",
                    "answers": { "1": "膝盖疼" }
                }),
            ))
            .await
            .unwrap();

        let report = frames(response).await[0].decode_report().unwrap();
        assert_eq!(report.status, AnalysisStatus::DepartmentMismatch);
    }

    #[tokio::test]
    async fn health_reports_readiness() {
        let response = app_with(Services::unavailable())
            .oneshot(http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(health["ready"], false);
        assert_eq!(health["status"], "degraded");
    }

    #[test]
    fn data_url_prefix_is_stripped() {
        let encoded = format!("data:image/jpeg;base64,{}", STANDARD.encode([0xff, 0xd8]));
        assert_eq!(decode_image(Some(&encoded)).unwrap(), Some(vec![0xff, 0xd8]));
        assert_eq!(decode_image(Some("  ")).unwrap(), None);
        assert_eq!(decode_image(None).unwrap(), None);
    }
}
