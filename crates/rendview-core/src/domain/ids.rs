//! Ids - 型付き ID
//!
//! Task ID は発行元の task source が割り当て、LDR の wire 上では素の `u32`。
//! FileHandle は file registry のアリーナへの index。
//! どちらも共通の `Id<T>` を使い、取り違えをコンパイル時に防ぐ。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Marker trait for each ID flavour.
///
/// Provides the prefix used by `Display` ("task-", "file-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic 32-bit identifier.
///
/// `T` is a zero-sized marker; it costs nothing at runtime.
#[repr(transparent)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: u32,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub const fn new(value: u32) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }

    pub const fn get(self) -> u32 {
        self.value
    }
}

// Manual impls: derives would put bounds on `T`, which is uninhabited.
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T: IdMarker> From<u32> for Id<T> {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.value)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Marker for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Marker for file registry handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum File {}

impl IdMarker for File {
    fn prefix() -> &'static str {
        "file-"
    }
}

/// Identifier of a task, scoped to the source that issued it.
pub type TaskId = Id<Task>;

/// Stable handle into the file registry.
pub type FileHandle = Id<File>;

/// Monotonic task ID allocator for a single source.
///
/// Wraps on overflow and never hands out 0, which the wire uses as "none".
#[derive(Debug, Clone)]
pub struct TaskIdAllocator {
    next: u32,
}

impl TaskIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn allocate(&mut self) -> TaskId {
        let id = TaskId::new(self.next);
        self.next = self.next.checked_add(1).unwrap_or(1);
        id
    }
}

impl Default for TaskIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_prefix() {
        assert_eq!(TaskId::new(7).to_string(), "task-7");
        assert_eq!(FileHandle::new(3).to_string(), "file-3");
    }

    #[test]
    fn id_has_the_size_of_its_value() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskId>(), size_of::<u32>());
        assert_eq!(size_of::<FileHandle>(), size_of::<u32>());
    }

    #[test]
    fn ids_serialize_transparently() {
        let s = serde_json::to_string(&TaskId::new(42)).unwrap();
        assert_eq!(s, "42");
        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, TaskId::new(42));
    }

    #[test]
    fn allocator_is_monotonic_and_skips_zero() {
        let mut alloc = TaskIdAllocator { next: u32::MAX };
        assert_eq!(alloc.allocate().get(), u32::MAX);
        assert_eq!(alloc.allocate().get(), 1);
        assert_eq!(alloc.allocate().get(), 2);
    }
}
