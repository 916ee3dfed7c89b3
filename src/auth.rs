//! Basic 认证：校验凭据并把请求主体写入请求扩展，作为锁的持有者身份。

use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::{body::Body as AxumBody, middleware, response::Response};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Basic};
use std::sync::Arc;
use tracing::warn;

use crate::error::ApiError;

/// 未启用认证时使用的主体名。
pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    pub enabled: bool,
}

/// Authenticated identity of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

impl Principal {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 根据配置与 Basic 凭据解析请求主体；凭据无效时返回 `None`。
pub fn resolve_principal(auth: &AuthConfig, credentials: Option<&Basic>) -> Option<Principal> {
    if !auth.enabled {
        return Some(Principal(ANONYMOUS.to_string()));
    }
    let credentials = credentials?;
    (credentials.username() == auth.username && credentials.password() == auth.password)
        .then(|| Principal(credentials.username().to_string()))
}

/// 认证中间件：通过后在请求扩展中放入 [`Principal`]。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    auth_header: Option<TypedHeader<Authorization<Basic>>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let credentials = auth_header.as_ref().map(|TypedHeader(header)| header.0.clone());
    if let Some(principal) = resolve_principal(&auth, credentials.as_ref()) {
        req.extensions_mut().insert(principal);
        return Ok(next.run(req).await);
    }

    if credentials.is_some() {
        warn!(path = req.uri().path(), "rejected credentials");
    }
    let mut headers = HeaderMap::new();
    headers.insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static(r#"Basic realm="AxoCal""#),
    );
    Err(ApiError::Unauthorized(headers))
}
