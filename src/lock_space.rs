//! 层级锁空间：真实锁（客户端可见）与临时锁（请求级互斥）两棵锁树。
//!
//! 节点按需惰性创建：第一次在某路径上加锁时，会沿父路径一路补齐节点，
//! 使祖先检查总能看到真实节点。节点通过三种方式回收：
//!
//! - 解锁后既无持有者也无子节点时立即摘除；
//! - 超时清扫（[`LockSpace::sweep_expired`]）回收过期的锁；
//! - 结构压缩（[`LockSpace::compact`]）在新建节点数超过阈值后回收空闲的链节点。
//!
//! 两棵树共用一把互斥锁，所有操作都是纯内存计算，不会跨越 `.await` 持锁。

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::lock_node::{Depth, LockKind, LockNode, LockSnapshot};
use crate::lock_path::LockPath;

/// Upper bound on a lock's lifetime; longer timeouts are cut to it.
pub const MAX_LOCK_LIFETIME: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline(now: Instant, timeout: Duration) -> Instant {
    let timeout = timeout.min(MAX_LOCK_LIFETIME);
    now.checked_add(timeout).unwrap_or(now)
}

/// Selects one of the two lock trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// Client-visible locks created by LOCK.
    Real,
    /// Request-scoped locks held while a handler runs.
    Temporary,
}

impl Space {
    fn kind(self) -> LockKind {
        match self {
            Space::Real => LockKind::Write,
            Space::Temporary => LockKind::Read,
        }
    }
}

/// 加锁请求参数。
#[derive(Debug, Clone, Copy)]
pub struct LockRequest<'a> {
    pub owner: &'a str,
    pub exclusive: bool,
    pub depth: Depth,
    pub timeout: Duration,
}

impl<'a> LockRequest<'a> {
    pub fn exclusive(owner: &'a str, depth: Depth, timeout: Duration) -> Self {
        Self {
            owner,
            exclusive: true,
            depth,
            timeout,
        }
    }

    pub fn shared(owner: &'a str, depth: Depth, timeout: Duration) -> Self {
        Self {
            owner,
            exclusive: false,
            depth,
            timeout,
        }
    }
}

/// 节点数量统计。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    pub real_nodes: usize,
    pub temporary_nodes: usize,
    pub created_since_cleanup: usize,
}

/// Process-wide lock table holding the real and temporary trees.
#[derive(Debug)]
pub struct LockSpace {
    tables: Mutex<LockTables>,
    cleanup_threshold: usize,
}

#[derive(Debug)]
struct LockTables {
    real: LockTree,
    temporary: LockTree,
    created_since_cleanup: usize,
}

impl LockTables {
    fn tree(&self, space: Space) -> &LockTree {
        match space {
            Space::Real => &self.real,
            Space::Temporary => &self.temporary,
        }
    }

    fn tree_mut(&mut self, space: Space) -> &mut LockTree {
        match space {
            Space::Real => &mut self.real,
            Space::Temporary => &mut self.temporary,
        }
    }
}

impl LockSpace {
    /// 创建锁空间；`cleanup_threshold` 为触发结构压缩的新建节点数。
    pub fn new(cleanup_threshold: usize) -> Self {
        let now = Instant::now();
        Self {
            tables: Mutex::new(LockTables {
                real: LockTree::new(Space::Real.kind(), now),
                temporary: LockTree::new(Space::Temporary.kind(), now),
                created_since_cleanup: 0,
            }),
            cleanup_threshold,
        }
    }

    fn tables(&self) -> MutexGuard<'_, LockTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tries to grant `request` on `path`. `false` means a conflicting lock
    /// exists; no lock state changes in that case.
    pub fn lock(&self, space: Space, path: &LockPath, request: LockRequest<'_>) -> bool {
        self.lock_at(Instant::now(), space, path, request)
    }

    pub fn exclusive_lock(
        &self,
        path: &LockPath,
        owner: &str,
        depth: Depth,
        timeout: Duration,
    ) -> bool {
        self.lock(Space::Real, path, LockRequest::exclusive(owner, depth, timeout))
    }

    pub fn shared_lock(
        &self,
        path: &LockPath,
        owner: &str,
        depth: Depth,
        timeout: Duration,
    ) -> bool {
        self.lock(Space::Real, path, LockRequest::shared(owner, depth, timeout))
    }

    fn lock_at(
        &self,
        now: Instant,
        space: Space,
        path: &LockPath,
        request: LockRequest<'_>,
    ) -> bool {
        let mut tables = self.tables();
        let tree = tables.tree_mut(space);
        tree.sweep_expired(now);
        let created = tree.materialize(path, now);
        let granted = tree.can_grant(path, request.exclusive, request.depth);
        if granted {
            tree.grant(path, &request, deadline(now, request.timeout));
        }
        tables.created_since_cleanup += created;
        granted
    }

    /// Removes `owner` from the real lock identified by `token`. Returns
    /// whether such a lock exists.
    pub fn unlock(&self, token: &str, owner: &str) -> bool {
        let mut tables = self.tables();
        let Some(path) = tables.real.tokens.get(token).cloned() else {
            return false;
        };
        tables.real.remove_owner(&path, owner);
        self.compact_if_due(&mut tables);
        true
    }

    /// 释放请求级临时锁，并顺带执行超时清扫与到期的结构压缩。
    pub fn release_temporary(&self, path: &LockPath, owner: &str) {
        self.release_temporary_at(Instant::now(), path, owner);
    }

    fn release_temporary_at(&self, now: Instant, path: &LockPath, owner: &str) {
        let mut tables = self.tables();
        tables.temporary.remove_owner(path, owner);
        tables.temporary.sweep_expired(now);
        self.compact_if_due(&mut tables);
    }

    /// 刷新真实锁的过期时间；令牌未知或锁已失效时返回 `None`。
    pub fn refresh(&self, token: &str, timeout: Duration) -> Option<LockSnapshot> {
        self.refresh_at(Instant::now(), token, timeout)
    }

    fn refresh_at(&self, now: Instant, token: &str, timeout: Duration) -> Option<LockSnapshot> {
        let mut tables = self.tables();
        let tree = &mut tables.real;
        tree.sweep_expired(now);
        let path = tree.tokens.get(token).cloned()?;
        if !tree.nodes.get(&path)?.is_locked() {
            return None;
        }
        tree.extend_expiry(&path, deadline(now, timeout));
        tree.nodes.get(&path).map(LockNode::snapshot)
    }

    /// Removes expired locks from the selected space only.
    pub fn sweep_expired(&self, space: Space) -> usize {
        self.sweep_expired_at(Instant::now(), space)
    }

    fn sweep_expired_at(&self, now: Instant, space: Space) -> usize {
        self.tables().tree_mut(space).sweep_expired(now)
    }

    /// 从根节点开始回收空闲节点，返回回收数量。
    pub fn compact(&self, space: Space) -> usize {
        self.tables().tree_mut(space).compact_from(&LockPath::root())
    }

    fn compact_if_due(&self, tables: &mut LockTables) {
        if tables.created_since_cleanup < self.cleanup_threshold {
            return;
        }
        let root = LockPath::root();
        let real = tables.real.compact_from(&root);
        let temporary = tables.temporary.compact_from(&root);
        info!(
            created = tables.created_since_cleanup,
            real, temporary, "lock tree compaction"
        );
        tables.created_since_cleanup = 0;
    }

    pub fn get_by_path(&self, space: Space, path: &LockPath) -> Option<LockSnapshot> {
        self.tables().tree(space).nodes.get(path).map(LockNode::snapshot)
    }

    pub fn get_by_token(&self, space: Space, token: &str) -> Option<LockSnapshot> {
        self.tables().tree(space).by_token(token).map(LockNode::snapshot)
    }

    /// Checks that no live exclusive real lock covering `path` (or, for a
    /// non-zero `depth`, lying below it) is held without one of
    /// `submitted_tokens`. Returns the offending lock on failure.
    pub fn validate(
        &self,
        path: &LockPath,
        depth: Depth,
        submitted_tokens: &[&str],
    ) -> Result<(), LockSnapshot> {
        self.validate_at(Instant::now(), path, depth, submitted_tokens)
    }

    fn validate_at(
        &self,
        now: Instant,
        path: &LockPath,
        depth: Depth,
        submitted_tokens: &[&str],
    ) -> Result<(), LockSnapshot> {
        let mut tables = self.tables();
        tables.real.sweep_expired(now);
        let tree = &tables.real;
        let unproven = |node: &LockNode| {
            node.is_locked() && node.exclusive && !submitted_tokens.contains(&node.token.as_str())
        };
        if let Some(node) = tree.find_ancestor(path, |node, distance| {
            unproven(node) && node.depth.covers(distance)
        }) {
            return Err(node.snapshot());
        }
        match tree.find_descendant(path, depth, &unproven) {
            Some(node) => Err(node.snapshot()),
            None => Ok(()),
        }
    }

    /// 返回作用于 `path` 的全部真实锁（自身及深度覆盖到它的祖先）。
    pub fn discover(&self, path: &LockPath) -> Vec<LockSnapshot> {
        self.discover_at(Instant::now(), path)
    }

    fn discover_at(&self, now: Instant, path: &LockPath) -> Vec<LockSnapshot> {
        let mut tables = self.tables();
        tables.real.sweep_expired(now);
        let mut found = Vec::new();
        let mut cursor = Some(path.clone());
        let mut distance = 0;
        while let Some(current) = cursor {
            if let Some(node) = tables.real.nodes.get(&current)
                && node.is_locked()
                && node.depth.covers(distance)
            {
                found.push(node.snapshot());
            }
            cursor = current.parent();
            distance += 1;
        }
        found
    }

    /// After a refused grant, reports which lock stood in the way.
    pub fn find_blocking(
        &self,
        space: Space,
        path: &LockPath,
        exclusive: bool,
        depth: Depth,
    ) -> Option<LockSnapshot> {
        self.tables()
            .tree(space)
            .blocking(path, exclusive, depth)
            .map(LockNode::snapshot)
    }

    /// 删除 `path` 及其子树上的全部锁节点（根节点只清空不删除）。
    pub fn remove_subtree(&self, space: Space, path: &LockPath) -> usize {
        self.tables().tree_mut(space).remove_subtree(path)
    }

    pub fn stats(&self) -> LockStats {
        let tables = self.tables();
        LockStats {
            real_nodes: tables.real.nodes.len(),
            temporary_nodes: tables.temporary.nodes.len(),
            created_since_cleanup: tables.created_since_cleanup,
        }
    }
}

/// One lock tree with its path and token indices.
#[derive(Debug)]
struct LockTree {
    kind: LockKind,
    nodes: HashMap<LockPath, LockNode>,
    tokens: HashMap<String, LockPath>,
}

impl LockTree {
    fn new(kind: LockKind, now: Instant) -> Self {
        let root = LockNode::new(LockPath::root(), kind, None, now);
        let mut tokens = HashMap::new();
        tokens.insert(root.token.clone(), root.path.clone());
        let mut nodes = HashMap::new();
        nodes.insert(root.path.clone(), root);
        Self { kind, nodes, tokens }
    }

    fn by_token(&self, token: &str) -> Option<&LockNode> {
        self.tokens.get(token).and_then(|path| self.nodes.get(path))
    }

    /// Ensures a node exists for `path` and each of its ancestors, reusing
    /// existing ones. Returns how many nodes were created.
    fn materialize(&mut self, path: &LockPath, now: Instant) -> usize {
        if self.nodes.contains_key(path) {
            return 0;
        }
        let Some(parent) = path.parent() else {
            return 0;
        };
        let created = self.materialize(&parent, now);
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.insert(path.clone());
        }
        let node = LockNode::new(path.clone(), self.kind, Some(parent), now);
        self.tokens.insert(node.token.clone(), path.clone());
        self.nodes.insert(path.clone(), node);
        created + 1
    }

    fn can_grant(&self, path: &LockPath, exclusive: bool, depth: Depth) -> bool {
        self.blocking(path, exclusive, depth).is_none()
    }

    fn blocking(&self, path: &LockPath, exclusive: bool, depth: Depth) -> Option<&LockNode> {
        self.blocking_ancestor(path, exclusive)
            .or_else(|| self.blocking_descendant(path, exclusive, depth))
    }

    /// An owned node at or above `path` blocks when its granted depth reaches
    /// `path` and either side is exclusive. Unowned ancestors are transparent.
    fn blocking_ancestor(&self, path: &LockPath, exclusive: bool) -> Option<&LockNode> {
        self.find_ancestor(path, |node, distance| node.conflicts_below(exclusive, distance))
    }

    /// An owned node at or below `path`, within the requested `depth`, blocks
    /// when either side is exclusive.
    fn blocking_descendant(
        &self,
        path: &LockPath,
        exclusive: bool,
        depth: Depth,
    ) -> Option<&LockNode> {
        self.find_descendant(path, depth, &|node: &LockNode| node.conflicts_with(exclusive))
    }

    fn find_ancestor<F>(&self, path: &LockPath, predicate: F) -> Option<&LockNode>
    where
        F: Fn(&LockNode, usize) -> bool,
    {
        let mut cursor = Some(path.clone());
        let mut distance = 0;
        while let Some(current) = cursor {
            if let Some(node) = self.nodes.get(&current)
                && predicate(node, distance)
            {
                return Some(node);
            }
            cursor = current.parent();
            distance += 1;
        }
        None
    }

    fn find_descendant<F>(
        &self,
        path: &LockPath,
        depth: Depth,
        predicate: &F,
    ) -> Option<&LockNode>
    where
        F: Fn(&LockNode) -> bool,
    {
        let node = self.nodes.get(path)?;
        if predicate(node) {
            return Some(node);
        }
        if depth.is_zero() {
            return None;
        }
        let below = depth.below();
        node.children
            .iter()
            .find_map(|child| self.find_descendant(child, below, predicate))
    }

    fn grant(&mut self, path: &LockPath, request: &LockRequest<'_>, expires_at: Instant) {
        let Some(node) = self.nodes.get_mut(path) else {
            return;
        };
        node.exclusive = request.exclusive;
        node.depth = request.depth;
        node.owners.insert(request.owner.to_string());
        self.extend_expiry(path, expires_at);
    }

    /// Sets the node's expiry and carries it up to the immediate parent,
    /// which never has its own expiry shortened.
    fn extend_expiry(&mut self, path: &LockPath, expires_at: Instant) {
        let Some(node) = self.nodes.get_mut(path) else {
            return;
        };
        node.expires_at = expires_at;
        if let Some(parent) = node.parent.clone()
            && let Some(parent_node) = self.nodes.get_mut(&parent)
        {
            parent_node.expires_at = parent_node.expires_at.max(expires_at);
        }
    }

    fn remove_owner(&mut self, path: &LockPath, owner: &str) -> bool {
        let removed = self
            .nodes
            .get_mut(path)
            .is_some_and(|node| node.owners.remove(owner));
        self.detach_if_idle(path);
        removed
    }

    /// Unlinks a node with neither owners nor children from both indices and
    /// from its parent. The root is never detached.
    fn detach_if_idle(&mut self, path: &LockPath) -> bool {
        if path.is_root() {
            return false;
        }
        let idle = self
            .nodes
            .get(path)
            .is_some_and(|node| !node.is_locked() && node.children.is_empty());
        if !idle {
            return false;
        }
        let Some(node) = self.nodes.remove(path) else {
            return false;
        };
        self.tokens.remove(&node.token);
        if let Some(parent) = node.parent.as_ref()
            && let Some(parent_node) = self.nodes.get_mut(parent)
        {
            parent_node.children.remove(path);
        }
        true
    }

    /// Drops the owners of every expired node, deepest first, and detaches
    /// those left idle. Nodes that still have children stay in place.
    fn sweep_expired(&mut self, now: Instant) -> usize {
        let mut expired: Vec<LockPath> = self
            .nodes
            .values()
            .filter(|node| node.has_expired(now))
            .filter(|node| node.is_locked() || node.children.is_empty())
            .filter(|node| node.is_locked() || !node.path.is_root())
            .map(|node| node.path.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }
        expired.sort_by_key(|path| Reverse(path.segment_count()));
        for path in &expired {
            if let Some(node) = self.nodes.get_mut(path) {
                if node.is_locked() {
                    debug!(path = %path, kind = node.kind.as_str(), "lock expired");
                }
                node.owners.clear();
            }
            self.detach_if_idle(path);
        }
        expired.len()
    }

    fn compact_from(&mut self, path: &LockPath) -> usize {
        let children: Vec<LockPath> = match self.nodes.get(path) {
            Some(node) => node.children.iter().cloned().collect(),
            None => return 0,
        };
        let mut reclaimed = 0;
        for child in &children {
            reclaimed += self.compact_from(child);
        }
        if self.detach_if_idle(path) {
            reclaimed += 1;
        }
        reclaimed
    }

    fn remove_subtree(&mut self, path: &LockPath) -> usize {
        let mut doomed: Vec<LockPath> = self
            .nodes
            .keys()
            .filter(|candidate| path.contains(candidate))
            .cloned()
            .collect();
        doomed.sort_by_key(|candidate| Reverse(candidate.segment_count()));
        let mut removed = 0;
        for candidate in &doomed {
            if let Some(node) = self.nodes.get_mut(candidate) {
                node.owners.clear();
            }
            if self.detach_if_idle(candidate) {
                removed += 1;
            }
        }
        removed
    }
}
