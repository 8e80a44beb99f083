//! FileRegistry - パスをキーにした参照カウント付きアリーナ

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{DeletePolicy, FileAttrs, FileError, FileState, Released};
use crate::domain::FileHandle;

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    attrs: FileAttrs,
    refs: u32,
    /// Override used while the file is being downloaded.
    fixed: Option<FileState>,
    cached: Option<FileState>,
    /// Set once a download of this path ran to completion.
    fetched: bool,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<FileHandle, Entry>,
    by_path: HashMap<PathBuf, FileHandle>,
    next_handle: u32,
}

impl Inner {
    fn entry(&self, h: FileHandle) -> Result<&Entry, FileError> {
        self.entries.get(&h).ok_or(FileError::UnknownHandle(h))
    }

    fn entry_mut(&mut self, h: FileHandle) -> Result<&mut Entry, FileError> {
        self.entries.get_mut(&h).ok_or(FileError::UnknownHandle(h))
    }

    fn remove(&mut self, h: FileHandle) -> Option<Entry> {
        let entry = self.entries.remove(&h)?;
        self.by_path.remove(&entry.path);
        Some(entry)
    }

    /// Remove every unreferenced entry whose policy matches, deleting the file.
    fn sweep(&mut self, matches: impl Fn(DeletePolicy) -> bool) -> usize {
        let victims: Vec<FileHandle> = self
            .entries
            .iter()
            .filter(|(_, e)| e.refs == 0 && matches(e.attrs.policy))
            .map(|(h, _)| *h)
            .collect();
        let mut deleted = 0;
        for h in victims {
            if let Some(entry) = self.remove(h)
                && delete_from_disk(&entry.path)
            {
                deleted += 1;
            }
        }
        deleted
    }
}

fn delete_from_disk(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "deleted file");
            true
        }
        Err(e) if e.kind() == IoErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to delete file");
            false
        }
    }
}

/// Shared registry of every task file.
///
/// Cloning is cheap; all clones see the same table.
#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `path`, registering it on first use, and take one reference.
    ///
    /// Re-registering an existing path keeps the least destructive policy.
    pub fn acquire(&self, path: impl AsRef<Path>, attrs: FileAttrs) -> FileHandle {
        let path = path.as_ref();
        let mut inner = self.inner.lock();
        if let Some(&h) = inner.by_path.get(path)
            && let Some(entry) = inner.entries.get_mut(&h)
        {
            entry.refs += 1;
            if attrs.policy < entry.attrs.policy {
                entry.attrs.policy = attrs.policy;
            }
            return h;
        }

        inner.next_handle += 1;
        let h = FileHandle::new(inner.next_handle);
        inner.entries.insert(
            h,
            Entry {
                path: path.to_path_buf(),
                attrs,
                refs: 1,
                fixed: None,
                cached: None,
                fetched: false,
            },
        );
        inner.by_path.insert(path.to_path_buf(), h);
        h
    }

    /// Take an additional reference on an existing handle.
    pub fn retain(&self, h: FileHandle) -> Result<(), FileError> {
        let mut inner = self.inner.lock();
        inner.entry_mut(h)?.refs += 1;
        Ok(())
    }

    /// Drop one reference; on the last one, act according to the policy.
    pub fn release(&self, h: FileHandle) -> Result<Released, FileError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(h)?;
        if entry.refs == 0 {
            return Err(FileError::NotReferenced(h));
        }
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(Released::StillReferenced(entry.refs));
        }

        let policy = entry.attrs.policy;
        match policy {
            DeletePolicy::Never => {
                inner.remove(h);
                Ok(Released::Forgotten)
            }
            DeletePolicy::OnFrameDone => {
                if let Some(entry) = inner.remove(h) {
                    delete_from_disk(&entry.path);
                }
                Ok(Released::Deleted)
            }
            DeletePolicy::OnExit | DeletePolicy::OnRecoveryCycle => Ok(Released::Deferred),
        }
    }

    /// Release a batch of handles, logging instead of failing.
    pub fn release_all(&self, handles: impl IntoIterator<Item = FileHandle>) {
        for h in handles {
            if let Err(e) = self.release(h) {
                warn!(error = %e, "file release failed");
            }
        }
    }

    /// Delete every unreferenced file registered with the recovery-cycle policy.
    pub fn sweep_recovery(&self) -> usize {
        self.inner
            .lock()
            .sweep(|p| p == DeletePolicy::OnRecoveryCycle)
    }

    /// Final teardown: delete every unreferenced file whose policy allows it.
    pub fn shutdown(&self) -> usize {
        let mut inner = self.inner.lock();
        let leaked = inner.entries.values().filter(|e| e.refs > 0).count();
        if leaked > 0 {
            warn!(leaked, "files still referenced at shutdown");
        }
        inner.sweep(|p| p != DeletePolicy::Never)
    }

    pub fn path(&self, h: FileHandle) -> Option<PathBuf> {
        self.inner.lock().entries.get(&h).map(|e| e.path.clone())
    }

    pub fn attrs(&self, h: FileHandle) -> Option<FileAttrs> {
        self.inner.lock().entries.get(&h).map(|e| e.attrs)
    }

    pub fn lookup(&self, path: impl AsRef<Path>) -> Option<FileHandle> {
        self.inner.lock().by_path.get(path.as_ref()).copied()
    }

    pub fn refs(&self, h: FileHandle) -> Option<u32> {
        self.inner.lock().entries.get(&h).map(|e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size and mtime; the fixed override wins while set.
    pub fn stat(&self, h: FileHandle) -> Result<FileState, FileError> {
        let path = {
            let inner = self.inner.lock();
            let entry = inner.entry(h)?;
            if let Some(fixed) = entry.fixed {
                return Ok(fixed);
            }
            if let Some(cached) = entry.cached {
                return Ok(cached);
            }
            entry.path.clone()
        };

        // No lock across the syscall.
        let meta = std::fs::metadata(&path).map_err(|source| FileError::Stat {
            path: path.display().to_string(),
            source,
        })?;
        let state = FileState {
            size: meta.len(),
            mtime: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
        };

        let mut inner = self.inner.lock();
        if let Ok(entry) = inner.entry_mut(h) {
            entry.cached = Some(state);
        }
        Ok(state)
    }

    /// Pin the reported state while a transfer is writing the file.
    pub fn set_fixed_state(&self, h: FileHandle, state: FileState) -> Result<(), FileError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(h)?;
        entry.fixed = Some(state);
        entry.cached = None;
        Ok(())
    }

    pub fn clear_fixed_state(&self, h: FileHandle) -> Result<(), FileError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(h)?;
        entry.fixed = None;
        entry.cached = None;
        Ok(())
    }

    /// Record that the file's download completed.
    pub fn mark_fetched(&self, h: FileHandle) -> Result<(), FileError> {
        self.inner.lock().entry_mut(h)?.fetched = true;
        Ok(())
    }

    /// Whether the file is complete on disk. False for unknown handles and
    /// for entries whose download never finished.
    pub fn is_fetched(&self, h: FileHandle) -> bool {
        self.inner.lock().entries.get(&h).is_some_and(|e| e.fetched)
    }

    /// Forget the cached stat, e.g. after a worker rewrote the file.
    pub fn invalidate(&self, h: FileHandle) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&h) {
            entry.cached = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{Creator, FileKind, IoRole};
    use std::time::UNIX_EPOCH;

    fn attrs(policy: DeletePolicy) -> FileAttrs {
        FileAttrs::new(FileKind::Image, IoRole::RenderOutput, Creator::Ldr, policy)
    }

    fn touch(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, bytes).unwrap();
        p
    }

    #[test]
    fn same_path_shares_one_handle() {
        let reg = FileRegistry::new();
        let a = reg.acquire("/tmp/x.png", attrs(DeletePolicy::Never));
        let b = reg.acquire("/tmp/x.png", attrs(DeletePolicy::Never));
        assert_eq!(a, b);
        assert_eq!(reg.refs(a), Some(2));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn only_last_release_deletes_on_frame_done() {
        let dir = tempfile::tempdir().unwrap();
        let p = touch(dir.path(), "f1.png", b"img");
        let reg = FileRegistry::new();
        let h = reg.acquire(&p, attrs(DeletePolicy::OnFrameDone));
        reg.retain(h).unwrap();

        assert_eq!(reg.release(h).unwrap(), Released::StillReferenced(1));
        assert!(p.exists());
        assert_eq!(reg.release(h).unwrap(), Released::Deleted);
        assert!(!p.exists());
        assert!(reg.lookup(&p).is_none());
    }

    #[test]
    fn never_policy_forgets_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let p = touch(dir.path(), "keep.pov", b"scene");
        let reg = FileRegistry::new();
        let h = reg.acquire(&p, attrs(DeletePolicy::Never));
        assert_eq!(reg.release(h).unwrap(), Released::Forgotten);
        assert!(p.exists());
        assert!(reg.is_empty());
    }

    #[test]
    fn recovery_policy_defers_until_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let p = touch(dir.path(), "dl.pov", b"scene");
        let reg = FileRegistry::new();
        let h = reg.acquire(&p, attrs(DeletePolicy::OnRecoveryCycle));

        assert_eq!(reg.release(h).unwrap(), Released::Deferred);
        assert!(p.exists());
        assert_eq!(reg.len(), 1);

        assert_eq!(reg.sweep_recovery(), 1);
        assert!(!p.exists());
        assert!(reg.is_empty());
    }

    #[test]
    fn exit_policy_is_kept_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let p = touch(dir.path(), "out.png", b"img");
        let reg = FileRegistry::new();
        let h = reg.acquire(&p, attrs(DeletePolicy::OnExit));
        reg.release(h).unwrap();

        assert_eq!(reg.sweep_recovery(), 0);
        assert!(p.exists());
        assert_eq!(reg.shutdown(), 1);
        assert!(!p.exists());
    }

    #[test]
    fn reacquire_keeps_least_destructive_policy() {
        let reg = FileRegistry::new();
        let h = reg.acquire("/tmp/shared.tex", attrs(DeletePolicy::OnFrameDone));
        reg.acquire("/tmp/shared.tex", attrs(DeletePolicy::Never));
        assert_eq!(reg.attrs(h).unwrap().policy, DeletePolicy::Never);
    }

    #[test]
    fn release_past_zero_is_an_error() {
        let reg = FileRegistry::new();
        let h = reg.acquire("/tmp/y.png", attrs(DeletePolicy::OnExit));
        reg.release(h).unwrap();
        assert!(matches!(reg.release(h), Err(FileError::NotReferenced(_))));
        assert!(matches!(
            reg.release(FileHandle::new(999)),
            Err(FileError::UnknownHandle(_))
        ));
    }

    #[test]
    fn fetched_flag_survives_release_until_sweep() {
        let reg = FileRegistry::new();
        let h = reg.acquire("/tmp/common.inc", attrs(DeletePolicy::OnRecoveryCycle));
        assert!(!reg.is_fetched(h));
        reg.mark_fetched(h).unwrap();
        reg.release(h).unwrap();

        let again = reg.acquire("/tmp/common.inc", attrs(DeletePolicy::OnRecoveryCycle));
        assert_eq!(again, h);
        assert!(reg.is_fetched(again));
        reg.release(again).unwrap();
        reg.sweep_recovery();
        assert!(!reg.is_fetched(h));
    }

    #[test]
    fn fixed_state_overrides_stat() {
        let dir = tempfile::tempdir().unwrap();
        let p = touch(dir.path(), "partial.pov", b"ab");
        let reg = FileRegistry::new();
        let h = reg.acquire(&p, attrs(DeletePolicy::OnFrameDone));

        let fixed = FileState {
            size: 1000,
            mtime: UNIX_EPOCH,
        };
        reg.set_fixed_state(h, fixed).unwrap();
        assert_eq!(reg.stat(h).unwrap(), fixed);

        reg.clear_fixed_state(h).unwrap();
        assert_eq!(reg.stat(h).unwrap().size, 2);
    }
}
