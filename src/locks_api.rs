//! 锁查询接口：以 JSON 返回客户端可见的锁信息。

use axum::Json;
use axum::extract::{Extension, Query};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiError;
use crate::lock_node::LockSnapshot;
use crate::lock_path::LockPath;
use crate::lock_space::{LockSpace, Space};

#[derive(Deserialize)]
pub struct LockQuery {
    pub path: Option<String>,
    pub token: Option<String>,
}

/// Client-visible metadata of one lock.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockView {
    pub path: String,
    pub token: String,
    pub owners: Vec<String>,
    pub exclusive: bool,
    pub depth: String,
    pub kind: &'static str,
    pub timeout_secs: u64,
    pub expires_at: String,
}

impl From<&LockSnapshot> for LockView {
    fn from(snapshot: &LockSnapshot) -> Self {
        let remaining = snapshot.timeout_remaining();
        let expires_at: DateTime<Utc> = Utc::now()
            + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            path: snapshot.path.to_string(),
            token: snapshot.token.clone(),
            owners: snapshot.owners.clone(),
            exclusive: snapshot.exclusive,
            depth: snapshot.depth.to_string(),
            kind: snapshot.kind.as_str(),
            timeout_secs: remaining.as_secs(),
            expires_at: expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// 按路径（含祖先覆盖）或令牌查询真实锁。
pub async fn list_locks(
    Extension(locks): Extension<Arc<LockSpace>>,
    Query(query): Query<LockQuery>,
) -> Result<Json<Vec<LockView>>, ApiError> {
    if let Some(token) = query.token.as_deref() {
        let snapshot = locks
            .get_by_token(Space::Real, token)
            .filter(|snapshot| snapshot.is_locked() && !snapshot.has_expired())
            .ok_or_else(|| ApiError::NotFound(format!("unknown lock token: {token}")))?;
        return Ok(Json(vec![LockView::from(&snapshot)]));
    }

    let path = match query.path.as_deref() {
        Some(raw) => LockPath::parse(raw)?,
        None => LockPath::root(),
    };
    let views = locks.discover(&path).iter().map(LockView::from).collect();
    Ok(Json(views))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_node::Depth;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::time::Duration;

    fn query(path: Option<&str>, token: Option<&str>) -> Query<LockQuery> {
        Query(LockQuery {
            path: path.map(str::to_string),
            token: token.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn lists_locks_covering_path() {
        let locks = Arc::new(LockSpace::new(1000));
        let cal = LockPath::parse("/cal").expect("path");
        assert!(locks.exclusive_lock(&cal, "alice", Depth::Infinity, Duration::from_secs(60)));

        let Json(views) = list_locks(Extension(locks.clone()), query(Some("/cal/event1.ics"), None))
            .await
            .expect("views");
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].path, "/cal");
        assert_eq!(views[0].owners, vec!["alice".to_string()]);
        assert_eq!(views[0].depth, "infinity");
        assert_eq!(views[0].kind, "write");
        assert!(views[0].timeout_secs <= 60);

        let json = serde_json::to_value(&views[0]).expect("json");
        assert!(json.get("timeoutSecs").is_some());
        assert!(json.get("expiresAt").is_some());
    }

    #[tokio::test]
    async fn lookup_by_token() {
        let locks = Arc::new(LockSpace::new(1000));
        let cal = LockPath::parse("/cal").expect("path");
        assert!(locks.shared_lock(&cal, "alice", Depth::Zero, Duration::from_secs(60)));
        let token = locks.get_by_path(Space::Real, &cal).expect("node").token;

        let Json(views) = list_locks(Extension(locks.clone()), query(None, Some(&token)))
            .await
            .expect("views");
        assert_eq!(views[0].token, token);
        assert!(!views[0].exclusive);

        let missing = list_locks(Extension(locks), query(None, Some("urn:uuid:nope")))
            .await
            .expect_err("unknown token");
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_path_is_bad_request() {
        let locks = Arc::new(LockSpace::new(1000));
        let error = list_locks(Extension(locks), query(Some("cal/../x"), None))
            .await
            .expect_err("bad path");
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
