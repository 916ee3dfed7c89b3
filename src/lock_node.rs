//! 单个路径的锁记录。

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::lock_path::LockPath;

/// How far below the locked path a lock extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Depth {
    /// 向下一层后剩余的深度。
    pub fn below(self) -> Self {
        match self {
            Depth::Zero | Depth::One => Depth::Zero,
            Depth::Infinity => Depth::Infinity,
        }
    }

    /// Whether a lock of this depth reaches a path `distance` segments below it.
    pub fn covers(self, distance: usize) -> bool {
        match self {
            Depth::Zero => distance == 0,
            Depth::One => distance <= 1,
            Depth::Infinity => true,
        }
    }

    pub fn is_zero(self) -> bool {
        self == Depth::Zero
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        })
    }
}

/// 锁来源标记：临时空间为 `Read`，真实空间为 `Write`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

impl LockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LockKind::Read => "read",
            LockKind::Write => "write",
        }
    }
}

/// 锁树中的一个节点。`parent` 与 `children` 以路径作为索引键，不持有所有权。
#[derive(Debug)]
pub(crate) struct LockNode {
    pub(crate) path: LockPath,
    pub(crate) token: String,
    pub(crate) owners: BTreeSet<String>,
    pub(crate) exclusive: bool,
    pub(crate) kind: LockKind,
    pub(crate) depth: Depth,
    pub(crate) expires_at: Instant,
    pub(crate) parent: Option<LockPath>,
    pub(crate) children: BTreeSet<LockPath>,
}

impl LockNode {
    pub(crate) fn new(
        path: LockPath,
        kind: LockKind,
        parent: Option<LockPath>,
        now: Instant,
    ) -> Self {
        Self {
            path,
            token: Uuid::new_v4().urn().to_string(),
            owners: BTreeSet::new(),
            exclusive: false,
            kind,
            depth: Depth::Zero,
            expires_at: now,
            parent,
            children: BTreeSet::new(),
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        !self.owners.is_empty()
    }

    pub(crate) fn has_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// Granting `exclusive` here would clash with this node's own owners.
    pub(crate) fn conflicts_with(&self, exclusive: bool) -> bool {
        self.is_locked() && (self.exclusive || exclusive)
    }

    /// Same as [`Self::conflicts_with`] for a request `distance` segments below,
    /// limited to the depth this node was granted with.
    pub(crate) fn conflicts_below(&self, exclusive: bool, distance: usize) -> bool {
        self.conflicts_with(exclusive) && self.depth.covers(distance)
    }

    pub(crate) fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            path: self.path.clone(),
            token: self.token.clone(),
            owners: self.owners.iter().cloned().collect(),
            exclusive: self.exclusive,
            depth: self.depth,
            kind: self.kind,
            expires_at: self.expires_at,
        }
    }
}

/// Read-only copy of a lock node handed out by lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSnapshot {
    pub path: LockPath,
    pub token: String,
    pub owners: Vec<String>,
    pub exclusive: bool,
    pub depth: Depth,
    pub kind: LockKind,
    pub expires_at: Instant,
}

impl LockSnapshot {
    pub fn is_locked(&self) -> bool {
        !self.owners.is_empty()
    }

    pub fn has_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }

    /// 距离过期的剩余时间（已过期时为零）。
    pub fn timeout_remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}
