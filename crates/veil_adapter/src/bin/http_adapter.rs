#![forbid(unsafe_code)]

use std::{
    env,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use veil_adapter::{
    export_generated_key, AdapterFailure, AdapterHealthResponse, AdapterRuntime, DetectionAdapterRequest,
    DetectionResultAdapterResponse, DetectionStatusAdapterResponse, DetectorEventAdapterResponse,
    MetricsSubmitAdapterRequest,
};

type SharedRuntime = Arc<Mutex<AdapterRuntime>>;

const LOCK_POISONED: &str = "adapter runtime lock poisoned";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let bind = env::var("VEIL_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr: SocketAddr = bind.parse()?;

    let (runtime, generated_key) = AdapterRuntime::default_from_env()?;
    if let Some(key) = generated_key {
        let out_path = env::var("VEIL_SIM_FHE_KEY_OUT")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let note = export_generated_key(&key, out_path.as_deref())?;
        eprintln!("veil_adapter_http: {note}");
    }
    let runtime: SharedRuntime = Arc::new(Mutex::new(runtime));
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/metrics/submit", post(submit_metrics))
        .route("/v1/detection/evaluate", post(evaluate))
        .route("/v1/detection/result", post(fetch_result))
        .route("/v1/detection/status", post(status))
        .with_state(runtime);

    println!("veil_adapter_http listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz(State(runtime): State<SharedRuntime>) -> (StatusCode, Json<AdapterHealthResponse>) {
    let runtime = match runtime.lock() {
        Ok(runtime) => runtime,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(health_error_response(LOCK_POISONED.to_string())),
            );
        }
    };
    match runtime.health_report() {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(reason) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(health_error_response(reason)),
        ),
    }
}

fn health_error_response(reason: String) -> AdapterHealthResponse {
    AdapterHealthResponse {
        status: "error".to_string(),
        outcome: "UNHEALTHY".to_string(),
        reason: Some(reason),
        identities: 0,
        events: 0,
    }
}

fn event_error_response(failure: AdapterFailure) -> DetectorEventAdapterResponse {
    DetectorEventAdapterResponse {
        status: "error".to_string(),
        outcome: "REJECTED".to_string(),
        reason: Some(failure.reason),
        reason_code: failure.reason_code,
        event_id: None,
        fingerprint: None,
    }
}

fn poisoned() -> AdapterFailure {
    AdapterFailure {
        reason: LOCK_POISONED.to_string(),
        reason_code: None,
    }
}

async fn submit_metrics(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<MetricsSubmitAdapterRequest>,
) -> (StatusCode, Json<DetectorEventAdapterResponse>) {
    let mut runtime = match runtime.lock() {
        Ok(runtime) => runtime,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(event_error_response(poisoned())),
            )
        }
    };
    match runtime.run_metrics_submit(request) {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(failure) => (StatusCode::BAD_REQUEST, Json(event_error_response(failure))),
    }
}

async fn evaluate(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<DetectionAdapterRequest>,
) -> (StatusCode, Json<DetectorEventAdapterResponse>) {
    let mut runtime = match runtime.lock() {
        Ok(runtime) => runtime,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(event_error_response(poisoned())),
            )
        }
    };
    match runtime.run_evaluate(request) {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(failure) => (StatusCode::BAD_REQUEST, Json(event_error_response(failure))),
    }
}

async fn fetch_result(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<DetectionAdapterRequest>,
) -> (StatusCode, Json<DetectionResultAdapterResponse>) {
    let failed = |failure: AdapterFailure| DetectionResultAdapterResponse {
        status: "error".to_string(),
        outcome: "REJECTED".to_string(),
        reason: Some(failure.reason),
        reason_code: failure.reason_code,
        verdict: None,
        risk_score: None,
    };
    let runtime = match runtime.lock() {
        Ok(runtime) => runtime,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, Json(failed(poisoned()))),
    };
    match runtime.run_result_fetch(request) {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(failure) => (StatusCode::BAD_REQUEST, Json(failed(failure))),
    }
}

async fn status(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<DetectionAdapterRequest>,
) -> (StatusCode, Json<DetectionStatusAdapterResponse>) {
    let failed = |failure: AdapterFailure| DetectionStatusAdapterResponse {
        status: "error".to_string(),
        outcome: "REJECTED".to_string(),
        reason: Some(failure.reason),
        has_submitted_metrics: false,
        has_detection_result: false,
    };
    let runtime = match runtime.lock() {
        Ok(runtime) => runtime,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, Json(failed(poisoned()))),
    };
    match runtime.run_status(request) {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(failure) => (StatusCode::BAD_REQUEST, Json(failed(failure))),
    }
}
