//! WebDAV 锁系统适配：把 dav-server 的 LOCK/UNLOCK/检查请求转发到真实锁空间。

use dav_server::davpath::DavPath;
use dav_server::ls::{DavLock, DavLockSystem, LsFuture};
use std::future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use xmltree::Element;

use crate::lock_node::{Depth, LockSnapshot};
use crate::lock_path::{LockPath, LockPathError};
use crate::lock_space::{LockSpace, Space};

/// 客户端锁超时策略。
#[derive(Debug, Clone, Copy)]
pub struct LockTimeouts {
    pub default: Duration,
    pub max: Duration,
}

impl LockTimeouts {
    /// Clamps a client-requested timeout; absent or infinite requests get the default.
    pub fn clamp(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(timeout) if !timeout.is_zero() => timeout.min(self.max),
            _ => self.default,
        }
    }
}

/// Lock system handed to dav-server, bound to the owner of the current request.
#[derive(Debug, Clone)]
pub struct DavLockAdapter {
    space: Arc<LockSpace>,
    owner: String,
    timeouts: LockTimeouts,
}

impl DavLockAdapter {
    /// 创建绑定到 `owner` 的锁系统实例。
    pub fn new(
        space: Arc<LockSpace>,
        owner: impl Into<String>,
        timeouts: LockTimeouts,
    ) -> Box<Self> {
        Box::new(Self {
            space,
            owner: owner.into(),
            timeouts,
        })
    }

    fn create_lock(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        owner: Option<&Element>,
        timeout: Option<Duration>,
        shared: bool,
        deep: bool,
    ) -> Result<DavLock, DavLock> {
        let Ok(lock_path) = lock_path_of(path) else {
            return Err(placeholder_lock(path));
        };
        let holder = principal.unwrap_or(&self.owner);
        let depth = if deep { Depth::Infinity } else { Depth::Zero };
        let timeout = self.timeouts.clamp(timeout);
        let granted = if shared {
            self.space.shared_lock(&lock_path, holder, depth, timeout)
        } else {
            self.space.exclusive_lock(&lock_path, holder, depth, timeout)
        };

        if !granted {
            let blocking = self
                .space
                .find_blocking(Space::Real, &lock_path, !shared, depth);
            info!(path = %lock_path, owner = holder, shared, deep, "lock refused");
            return Err(blocking
                .map(|snapshot| to_dav_lock(&snapshot, path, None, None))
                .unwrap_or_else(|| placeholder_lock(path)));
        }

        info!(path = %lock_path, owner = holder, shared, deep, "lock granted");
        self.space
            .get_by_path(Space::Real, &lock_path)
            .map(|snapshot| to_dav_lock(&snapshot, path, Some(holder), owner))
            .ok_or_else(|| placeholder_lock(path))
    }

    /// The live lock named by `token`, if it applies to `path`.
    fn lock_applying_to(&self, path: &DavPath, token: &str) -> Option<LockSnapshot> {
        let lock_path = lock_path_of(path).ok()?;
        self.space
            .get_by_token(Space::Real, token)
            .filter(|snapshot| snapshot.is_locked() && !snapshot.has_expired())
            .filter(|snapshot| {
                snapshot
                    .path
                    .distance_to(&lock_path)
                    .is_some_and(|distance| snapshot.depth.covers(distance))
            })
    }

    fn release(&self, path: &DavPath, token: &str) -> Result<(), ()> {
        let snapshot = self.lock_applying_to(path, token).ok_or(())?;
        if !snapshot.owners.iter().any(|owner| owner == &self.owner) {
            debug!(token, owner = %self.owner, "unlock by non-owner rejected");
            return Err(());
        }
        if !self.space.unlock(token, &self.owner) {
            return Err(());
        }
        info!(path = %snapshot.path, owner = %self.owner, "lock released");
        Ok(())
    }
}

impl DavLockSystem for DavLockAdapter {
    fn lock(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        owner: Option<&Element>,
        timeout: Option<Duration>,
        shared: bool,
        deep: bool,
    ) -> LsFuture<'_, Result<DavLock, DavLock>> {
        let result = self.create_lock(path, principal, owner, timeout, shared, deep);
        Box::pin(future::ready(result))
    }

    fn unlock(&self, path: &DavPath, token: &str) -> LsFuture<'_, Result<(), ()>> {
        let result = self.release(path, token);
        Box::pin(future::ready(result))
    }

    fn refresh(
        &self,
        path: &DavPath,
        token: &str,
        timeout: Option<Duration>,
    ) -> LsFuture<'_, Result<DavLock, ()>> {
        let result = self
            .lock_applying_to(path, token)
            .and_then(|_| self.space.refresh(token, self.timeouts.clamp(timeout)))
            .map(|snapshot| to_dav_lock(&snapshot, path, Some(&self.owner), None))
            .ok_or(());
        Box::pin(future::ready(result))
    }

    fn check(
        &self,
        path: &DavPath,
        _principal: Option<&str>,
        _ignore_principal: bool,
        deep: bool,
        submitted_tokens: Vec<&str>,
    ) -> LsFuture<'_, Result<(), DavLock>> {
        let result = match lock_path_of(path) {
            Ok(lock_path) => {
                let depth = if deep { Depth::Infinity } else { Depth::Zero };
                self.space
                    .validate(&lock_path, depth, &submitted_tokens)
                    .map_err(|snapshot| to_dav_lock(&snapshot, path, None, None))
            }
            Err(_) => Err(placeholder_lock(path)),
        };
        Box::pin(future::ready(result))
    }

    fn discover(&self, path: &DavPath) -> LsFuture<'_, Vec<DavLock>> {
        let locks = match lock_path_of(path) {
            Ok(lock_path) => self
                .space
                .discover(&lock_path)
                .iter()
                .map(|snapshot| to_dav_lock(snapshot, path, None, None))
                .collect(),
            Err(_) => Vec::new(),
        };
        Box::pin(future::ready(locks))
    }

    fn delete(&self, path: &DavPath) -> LsFuture<'_, Result<(), ()>> {
        let result = lock_path_of(path)
            .map(|lock_path| {
                let removed = self.space.remove_subtree(Space::Real, &lock_path);
                debug!(path = %lock_path, removed, "locks dropped with resource");
            })
            .map_err(|_| ());
        Box::pin(future::ready(result))
    }
}

/// 将 dav-server 路径转换为锁路径（URL 编码形式，去掉结尾斜杠）。
pub fn lock_path_of(path: &DavPath) -> Result<LockPath, LockPathError> {
    LockPath::parse(&path.as_url_string())
}

/// `holder` names the principal the lock is reported to; other views fall
/// back to the first owner.
fn to_dav_lock(
    snapshot: &LockSnapshot,
    fallback: &DavPath,
    holder: Option<&str>,
    owner: Option<&Element>,
) -> DavLock {
    let path = DavPath::new(snapshot.path.as_str()).unwrap_or_else(|_| fallback.clone());
    let remaining = snapshot.timeout_remaining();
    let principal = holder
        .filter(|holder| snapshot.owners.iter().any(|owner| owner == holder))
        .map(str::to_string)
        .or_else(|| snapshot.owners.first().cloned());
    DavLock {
        token: snapshot.token.clone(),
        path,
        principal,
        owner: owner.cloned(),
        timeout_at: Some(SystemTime::now() + remaining),
        timeout: Some(remaining),
        shared: !snapshot.exclusive,
        deep: !snapshot.depth.is_zero(),
    }
}

fn placeholder_lock(path: &DavPath) -> DavLock {
    DavLock {
        token: String::new(),
        path: path.clone(),
        principal: None,
        owner: None,
        timeout_at: None,
        timeout: None,
        shared: false,
        deep: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUTS: LockTimeouts = LockTimeouts {
        default: Duration::from_secs(600),
        max: Duration::from_secs(3600),
    };

    fn dav_path(raw: &str) -> DavPath {
        DavPath::new(raw).expect("dav path")
    }

    fn adapter(space: &Arc<LockSpace>, owner: &str) -> Box<DavLockAdapter> {
        DavLockAdapter::new(space.clone(), owner, TIMEOUTS)
    }

    #[test]
    fn timeouts_are_clamped() {
        assert_eq!(TIMEOUTS.clamp(None), Duration::from_secs(600));
        assert_eq!(TIMEOUTS.clamp(Some(Duration::ZERO)), Duration::from_secs(600));
        assert_eq!(TIMEOUTS.clamp(Some(Duration::from_secs(30))), Duration::from_secs(30));
        assert_eq!(
            TIMEOUTS.clamp(Some(Duration::from_secs(86_400))),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn collection_paths_lose_trailing_slash() {
        let lock_path = lock_path_of(&dav_path("/cal/")).expect("lock path");
        assert_eq!(lock_path.as_str(), "/cal");
    }

    #[tokio::test]
    async fn exclusive_lock_conflicts_report_blocking_lock() {
        let space = Arc::new(LockSpace::new(1000));
        let alice = adapter(&space, "alice");
        let bob = adapter(&space, "bob");

        let granted = alice
            .lock(&dav_path("/cal/"), Some("alice"), None, None, false, true)
            .await
            .expect("granted");
        assert!(granted.token.starts_with("urn:uuid:"));
        assert!(granted.deep);
        assert!(!granted.shared);
        assert_eq!(granted.principal.as_deref(), Some("alice"));

        let refused = bob
            .lock(&dav_path("/cal/event1.ics"), Some("bob"), None, None, false, false)
            .await
            .expect_err("conflict");
        assert_eq!(refused.token, granted.token);
    }

    #[tokio::test]
    async fn check_requires_submitted_token() {
        let space = Arc::new(LockSpace::new(1000));
        let alice = adapter(&space, "alice");
        let lock = alice
            .lock(&dav_path("/cal/event1.ics"), None, None, None, false, false)
            .await
            .expect("granted");

        let target = dav_path("/cal/event1.ics");
        assert!(alice.check(&target, None, false, false, vec![]).await.is_err());
        assert!(
            alice
                .check(&target, None, false, false, vec![lock.token.as_str()])
                .await
                .is_ok()
        );
        assert!(alice.check(&dav_path("/cal/"), None, false, false, vec![]).await.is_ok());
        assert!(alice.check(&dav_path("/cal/"), None, false, true, vec![]).await.is_err());
    }

    #[tokio::test]
    async fn unlock_is_limited_to_owner() {
        let space = Arc::new(LockSpace::new(1000));
        let alice = adapter(&space, "alice");
        let bob = adapter(&space, "bob");
        let target = dav_path("/cal/event1.ics");
        let lock = alice
            .lock(&target, None, None, None, false, false)
            .await
            .expect("granted");

        assert!(bob.unlock(&target, &lock.token).await.is_err());
        assert!(alice.unlock(&dav_path("/other"), &lock.token).await.is_err());
        assert!(alice.unlock(&target, &lock.token).await.is_ok());
        assert!(alice.discover(&target).await.is_empty());
        assert!(alice.unlock(&target, &lock.token).await.is_err());
    }

    #[tokio::test]
    async fn shared_locks_are_discovered_from_children() {
        let space = Arc::new(LockSpace::new(1000));
        let alice = adapter(&space, "alice");
        let bob = adapter(&space, "bob");
        alice
            .lock(&dav_path("/cal/"), None, None, None, true, true)
            .await
            .expect("alice");
        bob.lock(&dav_path("/cal/"), None, None, None, true, true)
            .await
            .expect("bob");

        let found = bob.discover(&dav_path("/cal/event1.ics")).await;
        assert_eq!(found.len(), 1);
        assert!(found[0].shared);
        let node = space
            .get_by_path(Space::Real, &LockPath::parse("/cal").expect("path"))
            .expect("node");
        assert_eq!(node.owners, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn shared_grant_reports_the_requesting_principal() {
        let space = Arc::new(LockSpace::new(1000));
        let alice = adapter(&space, "alice");
        let bob = adapter(&space, "bob");
        let target = dav_path("/cal/");
        alice
            .lock(&target, None, None, None, true, false)
            .await
            .expect("alice");
        let granted = bob
            .lock(&target, None, None, None, true, false)
            .await
            .expect("bob");
        assert_eq!(granted.principal.as_deref(), Some("bob"));

        let refreshed = bob
            .refresh(&target, &granted.token, None)
            .await
            .expect("refreshed");
        assert_eq!(refreshed.principal.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn owner_element_is_echoed_on_grant() {
        let space = Arc::new(LockSpace::new(1000));
        let alice = adapter(&space, "alice");
        let owner = Element::new("owner");
        let granted = alice
            .lock(&dav_path("/cal/"), None, Some(&owner), None, false, true)
            .await
            .expect("granted");
        assert_eq!(granted.owner.map(|element| element.name), Some("owner".to_string()));
        assert_eq!(granted.path.as_url_string(), "/cal");
    }

    #[tokio::test]
    async fn refresh_and_delete() {
        let space = Arc::new(LockSpace::new(1000));
        let alice = adapter(&space, "alice");
        let target = dav_path("/cal/event1.ics");
        let lock = alice
            .lock(&target, None, None, Some(Duration::from_secs(30)), false, false)
            .await
            .expect("granted");
        assert!(lock.timeout.expect("timeout") <= Duration::from_secs(30));

        let refreshed = alice
            .refresh(&target, &lock.token, Some(Duration::from_secs(120)))
            .await
            .expect("refreshed");
        assert!(refreshed.timeout.expect("timeout") > Duration::from_secs(30));
        assert!(alice.refresh(&target, "urn:uuid:missing", None).await.is_err());

        assert!(alice.delete(&dav_path("/cal/")).await.is_ok());
        assert!(alice.discover(&target).await.is_empty());
        assert!(alice.check(&target, None, false, false, vec![]).await.is_ok());
    }
}
