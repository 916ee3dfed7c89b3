//! WebDAV 请求处理：校验真实锁、持有请求级临时锁，再交给 dav-server 处理。

use axum::extract::Extension;
use axum::http::{HeaderMap, Method, Request, Uri};
use axum::response::{IntoResponse, Response};
use dav_server::davpath::DavPath;
use dav_server::{DavConfig, DavHandler};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::Principal;
use crate::dav_lock::{DavLockAdapter, LockTimeouts, lock_path_of};
use crate::error::ApiError;
use crate::if_header::submitted_tokens;
use crate::lock_guard::TemporaryLock;
use crate::lock_node::Depth;
use crate::lock_path::LockPath;
use crate::lock_space::LockSpace;

/// Routing prefix and lock policy shared by all WebDAV requests.
#[derive(Debug, Clone)]
pub struct WebDavSettings {
    pub prefix: String,
    pub request_lock_timeout: Duration,
    pub timeouts: LockTimeouts,
}

/// 会修改资源、需要持有临时锁的方法。
fn is_mutating(method: &Method) -> bool {
    matches!(
        method.as_str(),
        "PUT" | "DELETE" | "MKCOL" | "COPY" | "MOVE" | "PROPPATCH"
    )
}

/// DELETE/MOVE/COPY 作用于整个子树，需要检查目标下方的锁。
fn validation_depth(method: &Method) -> Depth {
    match method.as_str() {
        "DELETE" | "MOVE" | "COPY" => Depth::Infinity,
        _ => Depth::Zero,
    }
}

/// 将请求路径（含路由前缀）转换为锁路径。
pub fn resolve_lock_path(path: &str, prefix: &str) -> Result<LockPath, ApiError> {
    let relative = path
        .strip_prefix(prefix)
        .ok_or_else(|| ApiError::BadRequest(format!("path outside {prefix}: {path}")))?;
    if !relative.is_empty() && !relative.starts_with('/') {
        return Err(ApiError::BadRequest(format!("path outside {prefix}: {path}")));
    }
    let relative = if relative.is_empty() { "/" } else { relative };
    let dav_path = DavPath::new(relative)
        .map_err(|_| ApiError::BadRequest(format!("invalid path: {path}")))?;
    Ok(lock_path_of(&dav_path)?)
}

fn destination_path(headers: &HeaderMap, prefix: &str) -> Result<Option<LockPath>, ApiError> {
    let Some(value) = headers.get("destination") else {
        return Ok(None);
    };
    let uri = value
        .to_str()
        .ok()
        .and_then(|raw| raw.parse::<Uri>().ok())
        .ok_or_else(|| ApiError::BadRequest("invalid destination header".to_string()))?;
    resolve_lock_path(uri.path(), prefix).map(Some)
}

/// 代理 WebDAV 请求到 dav-server 处理器。
pub async fn webdav_handler(
    Extension(dav_handler): Extension<Arc<DavHandler>>,
    Extension(locks): Extension<Arc<LockSpace>>,
    Extension(settings): Extension<Arc<WebDavSettings>>,
    Extension(principal): Extension<Principal>,
    req: Request<axum::body::Body>,
) -> Result<Response, ApiError> {
    let config = DavConfig::new()
        .principal(principal.as_str())
        .locksystem(DavLockAdapter::new(
            locks.clone(),
            principal.as_str(),
            settings.timeouts,
        ));

    let method = req.method().clone();
    if !is_mutating(&method) {
        return Ok(dav_handler.handle_with(config, req).await.into_response());
    }

    let target = resolve_lock_path(req.uri().path(), &settings.prefix)?;
    let destination = destination_path(req.headers(), &settings.prefix)?;
    let tokens = submitted_tokens(req.headers());
    let tokens: Vec<&str> = tokens.iter().map(String::as_str).collect();

    let depth = validation_depth(&method);
    for path in std::iter::once(&target).chain(destination.as_ref()) {
        if let Err(blocking) = locks.validate(path, depth, &tokens) {
            debug!(
                method = %method,
                path = %path,
                lock = %blocking.path,
                "request blocked by lock"
            );
            return Err(ApiError::locked_by(&blocking));
        }
    }

    let Some(guard) = TemporaryLock::acquire(
        locks.clone(),
        target.clone(),
        method.as_str(),
        settings.request_lock_timeout,
    ) else {
        warn!(method = %method, path = %target, "temporary lock unavailable");
        return Err(ApiError::Locked {
            path: target.to_string(),
            token: None,
        });
    };
    debug!(method = %method, path = %target, owner = guard.owner(), "temporary lock held");

    let response = dav_handler.handle_with(config, req).await;
    drop(guard);
    Ok(response.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_space::Space;
    use axum::body::Body;
    use axum::http::StatusCode;
    use dav_server::localfs::LocalFs;
    use tempfile::tempdir;

    const PREFIX: &str = "/webdav";

    fn settings() -> Arc<WebDavSettings> {
        Arc::new(WebDavSettings {
            prefix: PREFIX.to_string(),
            request_lock_timeout: Duration::from_secs(10),
            timeouts: LockTimeouts {
                default: Duration::from_secs(600),
                max: Duration::from_secs(3600),
            },
        })
    }

    fn handler(root: &std::path::Path) -> Arc<DavHandler> {
        Arc::new(
            DavHandler::builder()
                .strip_prefix(PREFIX)
                .filesystem(LocalFs::new(root, false, false, false))
                .build_handler(),
        )
    }

    async fn send(
        dav: &Arc<DavHandler>,
        locks: &Arc<LockSpace>,
        user: &str,
        req: Request<Body>,
    ) -> Response {
        match webdav_handler(
            Extension(dav.clone()),
            Extension(locks.clone()),
            Extension(settings()),
            Extension(Principal(user.to_string())),
            req,
        )
        .await
        {
            Ok(response) => response,
            Err(error) => error.into_response(),
        }
    }

    fn put(path: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method(Method::PUT)
            .uri(path)
            .body(Body::from(body))
            .expect("request")
    }

    #[test]
    fn request_paths_map_to_lock_paths() {
        assert_eq!(
            resolve_lock_path("/webdav", PREFIX).expect("root").as_str(),
            "/"
        );
        assert_eq!(
            resolve_lock_path("/webdav/cal/", PREFIX).expect("cal").as_str(),
            "/cal"
        );
        assert!(resolve_lock_path("/webdavx/cal", PREFIX).is_err());
        assert!(resolve_lock_path("/other", PREFIX).is_err());
    }

    #[tokio::test]
    async fn put_is_blocked_by_foreign_exclusive_lock() {
        let temp = tempdir().expect("tempdir");
        let dav = handler(temp.path());
        let locks = Arc::new(LockSpace::new(1000));
        let target = LockPath::parse("/event1.ics").expect("path");
        assert!(locks.exclusive_lock(&target, "alice", Depth::Zero, Duration::from_secs(60)));
        let token = locks
            .get_by_path(Space::Real, &target)
            .expect("lock")
            .token;

        let blocked = put("/webdav/event1.ics", "BEGIN:VCALENDAR");
        let response = send(&dav, &locks, "bob", blocked).await;
        assert_eq!(response.status(), StatusCode::LOCKED);
        assert!(!temp.path().join("event1.ics").exists());

        let mut req = put("/webdav/event1.ics", "BEGIN:VCALENDAR");
        req.headers_mut()
            .insert("if", format!("(<{token}>)").parse().expect("header"));
        let response = send(&dav, &locks, "alice", req).await;
        assert!(response.status().is_success());
        assert!(temp.path().join("event1.ics").exists());
    }

    #[tokio::test]
    async fn temporary_lock_is_released_after_request() {
        let temp = tempdir().expect("tempdir");
        let dav = handler(temp.path());
        let locks = Arc::new(LockSpace::new(1000));

        let response = send(&dav, &locks, "alice", put("/webdav/todo.ics", "BEGIN:VTODO")).await;
        assert!(response.status().is_success());
        let path = LockPath::parse("/todo.ics").expect("path");
        assert!(locks.get_by_path(Space::Temporary, &path).is_none());
        assert!(locks.get_by_path(Space::Real, &path).is_none());
    }

    #[tokio::test]
    async fn move_checks_destination() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.ics"), b"BEGIN:VCALENDAR").expect("seed");
        let dav = handler(temp.path());
        let locks = Arc::new(LockSpace::new(1000));
        let held = LockPath::parse("/archive").expect("path");
        assert!(locks.exclusive_lock(&held, "alice", Depth::Infinity, Duration::from_secs(60)));

        let req = Request::builder()
            .method("MOVE")
            .uri("/webdav/a.ics")
            .header("destination", "http://localhost/webdav/archive/a.ics")
            .body(Body::empty())
            .expect("request");
        let response = send(&dav, &locks, "bob", req).await;
        assert_eq!(response.status(), StatusCode::LOCKED);
        assert!(temp.path().join("a.ics").exists());
    }

    #[tokio::test]
    async fn reads_ignore_locks() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.ics"), b"BEGIN:VCALENDAR").expect("seed");
        let dav = handler(temp.path());
        let locks = Arc::new(LockSpace::new(1000));
        let held = LockPath::parse("/a.ics").expect("path");
        assert!(locks.exclusive_lock(&held, "alice", Depth::Zero, Duration::from_secs(60)));

        let req = Request::builder()
            .method(Method::GET)
            .uri("/webdav/a.ics")
            .body(Body::empty())
            .expect("request");
        let response = send(&dav, &locks, "bob", req).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
