//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::lock_node::LockSnapshot;
use crate::lock_path::LockPathError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(HeaderMap),
    /// 资源被锁定；携带冲突锁的路径与令牌。
    Locked { path: String, token: Option<String> },
}

impl ApiError {
    pub fn locked_by(lock: &LockSnapshot) -> Self {
        ApiError::Locked {
            path: lock.path.to_string(),
            token: Some(lock.token.clone()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Unauthorized(headers) => {
                (StatusCode::UNAUTHORIZED, headers, "unauthorized").into_response()
            }
            ApiError::Locked { path, token } => {
                let mut headers = HeaderMap::new();
                if let Some(token) = token
                    && let Ok(value) = HeaderValue::from_str(&format!("<{token}>"))
                {
                    headers.insert(header::HeaderName::from_static("lock-token"), value);
                }
                (StatusCode::LOCKED, headers, format!("resource locked: {path}")).into_response()
            }
        }
    }
}

impl From<LockPathError> for ApiError {
    fn from(error: LockPathError) -> Self {
        ApiError::BadRequest(error.to_string())
    }
}
