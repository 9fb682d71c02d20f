//! Control API.
//!
//! Two routes on the loopback listener: `GET /v1/state` returns the latest
//! fleet snapshot, `POST /v1/scale` enqueues a new desired count. Handlers
//! only read the snapshot watch or enqueue commands — fleet state itself
//! stays with the reconciler, so both are safe mid-pass.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use virtscale_fleet::FleetSnapshot;
use virtscale_scaler::ScalerHandle;

#[derive(Clone)]
struct ApiState {
    handle: ScalerHandle,
}

/// Scale request body. The count is signed so a negative value can be
/// rejected as an invalid argument rather than a deserialization error.
#[derive(Debug, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Build the control router.
pub fn build_router(handle: ScalerHandle) -> Router {
    Router::new()
        .route("/v1/state", get(get_state))
        .route("/v1/scale", post(post_scale))
        .with_state(ApiState { handle })
}

async fn get_state(State(state): State<ApiState>) -> Json<FleetSnapshot> {
    Json(state.handle.snapshot())
}

async fn post_scale(
    State(state): State<ApiState>,
    Json(req): Json<ScaleRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    if req.count < 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: format!("invalid argument: count must be >= 0, got {}", req.count),
            }),
        ));
    }
    let count = u32::try_from(req.count).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: format!("invalid argument: count {} is out of range", req.count),
            }),
        )
    })?;

    info!(count, "scale requested via control API");
    state.handle.scale(count).await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                error: e.to_string(),
            }),
        )
    })?;
    Ok(StatusCode::ACCEPTED)
}
