//! 请求级临时锁：处理写请求期间持有，离开作用域时自动释放。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::lock_node::Depth;
use crate::lock_path::LockPath;
use crate::lock_space::{LockRequest, LockSpace, Space};

/// A shared, depth-0 lock in the temporary space. Dropping the guard
/// releases it, including on early returns and errors.
#[derive(Debug)]
pub struct TemporaryLock {
    space: Arc<LockSpace>,
    path: LockPath,
    owner: String,
}

impl TemporaryLock {
    /// 以 `"{method}:{uuid}"` 为持有者获取临时锁；存在冲突时返回 `None`。
    pub fn acquire(
        space: Arc<LockSpace>,
        path: LockPath,
        method: &str,
        timeout: Duration,
    ) -> Option<Self> {
        let owner = format!("{method}:{}", Uuid::new_v4());
        let request = LockRequest::shared(&owner, Depth::Zero, timeout);
        if !space.lock(Space::Temporary, &path, request) {
            debug!(path = %path, method, "temporary lock refused");
            return None;
        }
        Some(Self { space, path, owner })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for TemporaryLock {
    fn drop(&mut self) {
        self.space.release_temporary(&self.path, &self.owner);
    }
}
