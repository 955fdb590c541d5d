// API 错误

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use super::handlers::ApiResponse;
use crate::error::UpdaterError;

/// API 错误
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Updater(UpdaterError),
    Internal(anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<UpdaterError> for ApiError {
    fn from(err: UpdaterError) -> Self {
        ApiError::Updater(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, 400, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, 404, msg),
            ApiError::Updater(err) => {
                let status = match &err {
                    UpdaterError::UnknownUpdate(_) => StatusCode::NOT_FOUND,
                    UpdaterError::AlreadyBusy(_)
                    | UpdaterError::InvalidState { .. }
                    | UpdaterError::InstallNotCancellable => StatusCode::CONFLICT,
                    UpdaterError::InstallNotEligible(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    UpdaterError::TransportFailure(_) | UpdaterError::ManifestParseFailure(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                    UpdaterError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if !err.is_rejection() {
                    error!("请求处理失败: {}", err);
                }
                (status, err.code(), err.to_string())
            }
            ApiError::Internal(err) => {
                error!("内部错误: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, 500, format!("{:#}", err))
            }
        };

        (status, Json(ApiResponse::<()>::error(code, message))).into_response()
    }
}
