// 更新管理 API

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Serialize;
use tracing::info;

use super::ApiResponse;
use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;
use crate::updater::{ActionOutcome, CheckTrigger, ControllerStatus, UpdateAction, UpdateView};

/// 检查更新响应
#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub new_updates: bool,
    pub updates: Vec<UpdateView>,
}

/// GET /api/v1/updates
/// 所有更新，从新到旧
pub async fn list_updates(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<Vec<UpdateView>>>> {
    Ok(Json(ApiResponse::success(state.controller.views().await)))
}

/// GET /api/v1/updates/:id
pub async fn get_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<UpdateView>>> {
    let view = state
        .controller
        .view(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("更新不存在: {}", id)))?;
    Ok(Json(ApiResponse::success(view)))
}

/// GET /api/v1/status
pub async fn get_status(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<ControllerStatus>>> {
    Ok(Json(ApiResponse::success(state.controller.status().await)))
}

/// POST /api/v1/updates/check
/// 手动检查更新
pub async fn check_updates(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<CheckResponse>>> {
    info!("API: 手动检查更新");
    let new_updates = state
        .controller
        .check_for_updates(CheckTrigger::Manual)
        .await?;
    Ok(Json(ApiResponse::success(CheckResponse {
        new_updates,
        updates: state.controller.views().await,
    })))
}

/// POST /api/v1/updates/:id/actions/:action
/// 对单个更新执行操作
pub async fn perform_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<Json<ApiResponse<ActionOutcome>>> {
    let action: UpdateAction = action.parse().map_err(ApiError::BadRequest)?;
    info!("API: 执行操作 {:?} id={}", action, id);
    let outcome = state.controller.perform(action, &id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// POST /api/v1/install/cancel
pub async fn cancel_install(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<ActionOutcome>>> {
    info!("API: 取消安装");
    state.controller.cancel_install().await?;
    Ok(Json(ApiResponse::success(ActionOutcome::Done)))
}

/// POST /api/v1/reboot
pub async fn reboot(State(state): State<AppState>) -> ApiResult<Json<ApiResponse<ActionOutcome>>> {
    info!("API: 重启设备");
    state.controller.reboot().await?;
    Ok(Json(ApiResponse::success(ActionOutcome::Done)))
}
