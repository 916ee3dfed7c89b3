//! 锁路径：资源路径的规范化形式。
//!
//! 所有锁操作都以 [`LockPath`] 为键。解析时拒绝相对路径与 `.`/`..` 片段，
//! 因此锁空间内部不会遇到格式错误的路径。

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 锁路径解析失败的原因。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockPathError {
    #[error("lock path must be absolute: {0:?}")]
    NotAbsolute(String),
    #[error("lock path contains a relative segment: {0:?}")]
    RelativeSegment(String),
    #[error("lock path contains a control character")]
    ControlCharacter,
}

/// Canonical absolute resource path. The root is `/`; every other path has
/// no trailing slash and no empty segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockPath(String);

impl LockPath {
    /// 根路径 `/`。
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// 解析并规范化路径（合并重复斜杠，去掉结尾斜杠）。
    pub fn parse(raw: &str) -> Result<Self, LockPathError> {
        if !raw.starts_with('/') {
            return Err(LockPathError::NotAbsolute(raw.to_string()));
        }
        if raw.chars().any(char::is_control) {
            return Err(LockPathError::ControlCharacter);
        }

        let mut normalized = String::with_capacity(raw.len());
        for segment in raw.split('/').filter(|segment| !segment.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(LockPathError::RelativeSegment(raw.to_string()));
            }
            normalized.push('/');
            normalized.push_str(segment);
        }
        if normalized.is_empty() {
            normalized.push('/');
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// 去掉最后一个片段后的路径；根路径没有父路径。
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(Self::root()),
            Some(index) => self.0.get(..index).map(|parent| Self(parent.to_string())),
        }
    }

    /// Number of segments below the root (`/` is 0, `/a/b` is 2).
    pub fn segment_count(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.matches('/').count()
        }
    }

    /// 判断 `self` 是否为 `other` 本身或其祖先。
    pub fn contains(&self, other: &LockPath) -> bool {
        self.distance_to(other).is_some()
    }

    /// 从 `self` 向下到 `descendant` 的片段数；不在子树内时返回 `None`。
    pub fn distance_to(&self, descendant: &LockPath) -> Option<usize> {
        if self == descendant {
            return Some(0);
        }
        let inside = if self.is_root() {
            true
        } else {
            descendant.0.starts_with(&self.0)
                && descendant.0.as_bytes().get(self.0.len()) == Some(&b'/')
        };
        inside.then(|| descendant.segment_count() - self.segment_count())
    }
}

impl fmt::Display for LockPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LockPath {
    type Err = LockPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
