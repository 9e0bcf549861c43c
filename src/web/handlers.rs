//! HTTP request handlers.

use super::AppState;
use crate::db::DeviceStatus;
use crate::devices::{DeviceSettings, ServiceError};
use crate::discovery::DiscoveryError;
use crate::scheduler::SchedulerError;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::net::Ipv4Addr;
use uuid::Uuid;

fn service_error(e: ServiceError) -> Response {
    let status = match &e {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Lifecycle(_) => StatusCode::CONFLICT,
        ServiceError::DeviceWrite { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", e);
    }
    (status, e.to_string()).into_response()
}

// ============================================================================
// API: Devices
// ============================================================================

pub async fn handle_get_devices(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.list() {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => service_error(e),
    }
}

pub async fn handle_get_device(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.service.get(id) {
        Ok(device) => Json(device).into_response(),
        Err(e) => service_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: DeviceStatus,
}

pub async fn handle_set_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusRequest>,
) -> impl IntoResponse {
    match state.service.set_status(id, req.status).await {
        Ok(device) => Json(device).into_response(),
        Err(e) => service_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct FrequencyRequest {
    pub frequency: u32,
}

pub async fn handle_set_frequency(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FrequencyRequest>,
) -> impl IntoResponse {
    match state.service.set_frequency(id, req.frequency).await {
        Ok(device) => Json(device).into_response(),
        Err(e) => service_error(e),
    }
}

pub async fn handle_update_settings(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<DeviceSettings>,
) -> impl IntoResponse {
    match state.service.apply_settings(id, req).await {
        Ok(device) => Json(device).into_response(),
        Err(e) => service_error(e),
    }
}

pub async fn handle_delete_device(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.service.archive(id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => service_error(e),
    }
}

// ============================================================================
// API: Discovery
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub address: Ipv4Addr,
    pub mask: Ipv4Addr,
}

pub async fn handle_start_discovery(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> impl IntoResponse {
    match state
        .discovery
        .schedule(&state.scheduler, req.address, req.mask)
        .await
    {
        Ok(handle) => (StatusCode::ACCEPTED, Json(json!({ "job": handle.key }))).into_response(),
        Err(e) => {
            let status = match &e {
                DiscoveryError::InvalidMask(_) | DiscoveryError::RangeTooLarge { .. } => {
                    StatusCode::BAD_REQUEST
                }
                DiscoveryError::Scheduler(SchedulerError::Duplicate(_)) => StatusCode::CONFLICT,
                DiscoveryError::Scheduler(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, e.to_string()).into_response()
        }
    }
}

pub async fn handle_get_discovery(State(state): State<AppState>) -> impl IntoResponse {
    match state.discovery.last_report().await {
        Some(report) => Json(report).into_response(),
        None => (StatusCode::NOT_FOUND, "No scan has completed").into_response(),
    }
}

// ============================================================================
// API: Jobs
// ============================================================================

pub async fn handle_get_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.jobs().await)
}
