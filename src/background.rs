//! 锁超时清扫与结构压缩的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::lock_space::{LockSpace, Space};

/// 按固定间隔清扫两棵锁树中的过期锁，并回收空闲的链节点。
pub fn spawn_lock_sweeper(locks: Arc<LockSpace>, interval: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        loop {
            interval.tick().await;
            sweep_once(&locks);
        }
    });
}

fn sweep_once(locks: &LockSpace) -> usize {
    let real = locks.sweep_expired(Space::Real);
    let temporary = locks.sweep_expired(Space::Temporary);
    let compacted = locks.compact(Space::Real) + locks.compact(Space::Temporary);
    if real + temporary + compacted > 0 {
        let stats = locks.stats();
        debug!(
            real,
            temporary,
            compacted,
            real_nodes = stats.real_nodes,
            temporary_nodes = stats.temporary_nodes,
            created = stats.created_since_cleanup,
            "expired locks swept"
        );
    }
    real + temporary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_node::Depth;
    use crate::lock_path::LockPath;
    use crate::lock_space::LockRequest;

    #[tokio::test]
    async fn sweeper_clears_both_spaces() {
        let locks = Arc::new(LockSpace::new(1000));
        let path = LockPath::parse("/cal/event1.ics").expect("path");
        assert!(locks.exclusive_lock(&path, "alice", Depth::Zero, Duration::from_millis(5)));
        let request = LockRequest::shared("PUT:1", Depth::Zero, Duration::from_millis(5));
        assert!(locks.lock(Space::Temporary, &path, request));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sweep_once(&locks) >= 2);
        assert!(locks.get_by_path(Space::Real, &path).is_none());
        assert!(locks.get_by_path(Space::Temporary, &path).is_none());
        assert!(
            locks
                .get_by_path(Space::Real, &LockPath::parse("/cal").expect("path"))
                .is_none()
        );
    }
}
