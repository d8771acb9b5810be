//! Read-only diagnostics HTTP server. Not part of the cloud command channel
//! — a local-only window onto plant/valve/task state for debugging a unit in
//! the field, served alongside the transport adapter.

use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tracing::info;

use crate::engine::Engine;

#[derive(Clone)]
struct DiagnosticsState {
    engine: Arc<Engine>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct PlantSummary {
    plant_id: i64,
}

#[derive(Serialize)]
struct PlantDetail {
    plant_id: i64,
    valve: ValveView,
    is_task_running: bool,
}

#[derive(Serialize)]
struct ValveView {
    valve_id: u8,
    is_open: bool,
    is_blocked: bool,
    description: String,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

async fn list_plants(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    let ids = state.engine.plant_ids_snapshot().await;
    Json(ids.into_iter().map(|plant_id| PlantSummary { plant_id }).collect::<Vec<_>>())
}

async fn plant_detail(
    State(state): State<DiagnosticsState>,
    AxumPath(plant_id): AxumPath<i64>,
) -> impl IntoResponse {
    let status = match state.engine.get_valve_status(plant_id).await {
        Ok(status) => status,
        Err(e) => return (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": e.to_string() }))).into_response(),
    };
    let is_task_running = state.engine.task_registry().is_running(plant_id).await;

    let detail = PlantDetail {
        plant_id,
        valve: ValveView {
            valve_id: status.valve_id,
            is_open: status.is_open,
            is_blocked: status.is_blocked,
            description: status.description,
        },
        is_task_running,
    };
    (StatusCode::OK, Json(detail)).into_response()
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/plants", get(list_plants))
        .route("/plants/{plant_id}", get(plant_detail))
        .with_state(DiagnosticsState { engine })
}

/// Bind and serve the diagnostics router until the process exits. Intended
/// to be `tokio::spawn`-ed once at startup.
pub async fn serve(engine: Arc<Engine>, bind_addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(bind_addr, "diagnostics server listening");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmParams;
    use crate::engine::NewPlantParams;
    use crate::events::ChannelEventSink;
    use crate::managers::{SensorManager, ValveManager};
    use crate::plant::DripperType;
    use crate::relay::{RelayConfig, RelayDriver};
    use crate::scheduler::Scheduler;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_engine() -> Arc<Engine> {
        let relay = Arc::new(RelayDriver::open(RelayConfig::default(), true));
        let valves = ValveManager::new(2, relay);
        let sensors = SensorManager::new(vec!["P1".into(), "P2".into()], 1, true);
        let scheduler = Arc::new(Scheduler::new());
        let (sink, _rx) = ChannelEventSink::new();
        let params = AlgorithmParams {
            water_per_pulse_l: 0.03,
            pause_between_pulses: Duration::from_millis(5),
            overwater_margin_pp: 10.0,
            overwater_age_threshold: Duration::from_secs(24 * 3600),
        };
        let engine = Arc::new(Engine::new(valves, sensors, scheduler, Arc::new(sink), params));
        engine
            .add_plant(NewPlantParams {
                plant_id: 1,
                desired_moisture: 60.0,
                water_limit_liters: 0.5,
                dripper_type: DripperType::TwoLPerHour,
                schedule: vec![],
            })
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let engine = test_engine().await;
        let app = router(engine);
        let response = app
            .oneshot(axum::http::Request::builder().uri("/healthz").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn plants_lists_known_ids() {
        let engine = test_engine().await;
        let app = router(engine);
        let response = app
            .oneshot(axum::http::Request::builder().uri("/plants").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: Vec<PlantSummaryTest> = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].plant_id, 1);
    }

    #[derive(serde::Deserialize)]
    struct PlantSummaryTest {
        plant_id: i64,
    }

    #[tokio::test]
    async fn plant_detail_for_unknown_plant_is_not_found() {
        let engine = test_engine().await;
        let app = router(engine);
        let response = app
            .oneshot(axum::http::Request::builder().uri("/plants/999").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn plant_detail_for_known_plant_reports_valve() {
        let engine = test_engine().await;
        let app = router(engine);
        let response = app
            .oneshot(axum::http::Request::builder().uri("/plants/1").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
