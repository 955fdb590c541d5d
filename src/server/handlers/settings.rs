// 设置 API

use axum::{extract::State, response::Json};
use serde::Deserialize;
use tracing::info;

use super::ApiResponse;
use crate::config::CheckInterval;
use crate::server::error::ApiResult;
use crate::server::AppState;
use crate::updater::UpdaterSettings;

/// 设置修改请求，未提供的字段保持不变
#[derive(Debug, Default, Deserialize)]
pub struct UpdateSettingsRequest {
    pub check_interval: Option<CheckInterval>,
    pub performance_mode: Option<bool>,
    pub recovery_update: Option<bool>,
    pub has_seen_info_dialog: Option<bool>,
}

/// GET /api/v1/settings
pub async fn get_settings(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<UpdaterSettings>>> {
    Ok(Json(ApiResponse::success(state.controller.settings())))
}

/// PUT /api/v1/settings
pub async fn update_settings(
    State(state): State<AppState>,
    Json(req): Json<UpdateSettingsRequest>,
) -> ApiResult<Json<ApiResponse<UpdaterSettings>>> {
    info!("API: 修改设置 {:?}", req);
    let controller = &state.controller;

    if let Some(interval) = req.check_interval {
        controller.set_check_interval(interval)?;
    }
    if let Some(enabled) = req.performance_mode {
        controller.set_performance_mode(enabled).await?;
    }
    if let Some(enabled) = req.recovery_update {
        controller.set_recovery_update(enabled)?;
    }
    if let Some(seen) = req.has_seen_info_dialog {
        controller.set_has_seen_info_dialog(seen)?;
    }

    Ok(Json(ApiResponse::success(controller.settings())))
}
