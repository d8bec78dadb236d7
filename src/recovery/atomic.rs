use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::error;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::buffer::{BufferPool, PageKey};
use crate::error::BrambleResult;
use crate::recovery::wal::{WalManager, WalRecord};
use crate::storage::disk_manager::FileId;

#[derive(Debug, Default)]
struct CaptureState {
    /// Page preimages in first-touch order.
    preimages: Vec<(PageKey, Vec<u8>)>,
    captured: HashSet<PageKey>,
    created_files: Vec<FileId>,
}

/// One transactional envelope. Holds the component's exclusive registry
/// lock for its whole lifetime and records the preimage of every page the
/// operation writes, so the manager can undo all of them on rollback.
pub struct AtomicOperation {
    op_id: u64,
    component: String,
    capture: Mutex<CaptureState>,
    _component_lock: ArcRwLockWriteGuard<RawRwLock, ()>,
}

impl AtomicOperation {
    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    /// Remember the page image seen before the first write of this
    /// operation; later captures of the same page are ignored.
    pub(crate) fn capture_page(&self, key: PageKey, image: Vec<u8>) {
        let mut capture = self.capture.lock();
        if capture.captured.insert(key) {
            capture.preimages.push((key, image));
        }
    }

    pub(crate) fn register_created_file(&self, file_id: FileId) {
        self.capture.lock().created_files.push(file_id);
    }
}

impl std::fmt::Debug for AtomicOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicOperation")
            .field("op_id", &self.op_id)
            .field("component", &self.component)
            .finish()
    }
}

/// Read-side registration: excludes concurrent atomic operations on the
/// same component for as long as the guard lives.
pub struct ComponentReadGuard {
    _lock: ArcRwLockReadGuard<RawRwLock, ()>,
}

/// Begin/commit/rollback for atomic operations, plus the per-component
/// read/exclusive lock registry. Commit appends the full operation to the
/// WAL and fsyncs it; rollback restores every captured preimage.
#[derive(Debug)]
pub struct AtomicOperationsManager {
    wal: Arc<WalManager>,
    pool: Arc<BufferPool>,
    registry: DashMap<String, Arc<RwLock<()>>>,
    next_op_id: AtomicU64,
}

impl AtomicOperationsManager {
    pub fn new(wal: Arc<WalManager>, pool: Arc<BufferPool>) -> Self {
        AtomicOperationsManager {
            wal,
            pool,
            registry: DashMap::new(),
            next_op_id: AtomicU64::new(1),
        }
    }

    fn component_lock(&self, component: &str) -> Arc<RwLock<()>> {
        self.registry
            .entry(component.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Start an operation, taking the component's exclusive lock.
    pub fn start(&self, component: &str) -> AtomicOperation {
        let lock = self.component_lock(component).write_arc();
        AtomicOperation {
            op_id: self.next_op_id.fetch_add(1, Ordering::SeqCst),
            component: component.to_string(),
            capture: Mutex::new(CaptureState::default()),
            _component_lock: lock,
        }
    }

    /// Register a read on the component; released when the guard drops.
    pub fn read_lock(&self, component: &str) -> ComponentReadGuard {
        ComponentReadGuard {
            _lock: self.component_lock(component).read_arc(),
        }
    }

    /// Make the operation durable: Begin, one PageImage per touched page
    /// (preimage plus the page's current content), Commit, fsync.
    pub fn commit(&self, op: AtomicOperation) -> BrambleResult<()> {
        let capture = op.capture.into_inner();
        self.wal.append(&WalRecord::Begin {
            op_id: op.op_id,
            component: op.component.clone(),
        })?;
        for (key, before) in capture.preimages {
            let after = {
                let guard = self.pool.load_for_read(key.file_id, key.page_index)?;
                guard.data().to_vec()
            };
            self.wal.append(&WalRecord::PageImage {
                op_id: op.op_id,
                file_id: key.file_id,
                page_index: key.page_index,
                before,
                after,
            })?;
        }
        self.wal.append(&WalRecord::Commit { op_id: op.op_id })?;
        self.wal.flush()
    }

    /// Undo the operation: restore every preimage in reverse touch order
    /// and drop the files it created. Never fails; restore errors are
    /// logged because there is nothing better to do with them mid-unwind.
    pub fn rollback(&self, op: AtomicOperation) {
        let capture = op.capture.into_inner();
        for (key, before) in capture.preimages.iter().rev() {
            if let Err(e) = self.pool.restore_page(*key, before) {
                error!(
                    "rollback of op {} failed to restore page {:?}: {}",
                    op.op_id, key, e
                );
            }
        }
        for file_id in capture.created_files.iter().rev() {
            if let Err(e) = self.pool.delete_file(*file_id) {
                error!(
                    "rollback of op {} failed to drop created file {}: {}",
                    op.op_id, file_id, e
                );
            }
        }
        if let Err(e) = self
            .wal
            .append(&WalRecord::Rollback { op_id: op.op_id })
            .and_then(|_| self.wal.flush())
        {
            error!("rollback record of op {} was not logged: {}", op.op_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferPoolConfig;
    use crate::storage::disk_manager::DiskManager;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<BufferPool>, AtomicOperationsManager) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::try_new(dir.path()).unwrap());
        let pool = Arc::new(BufferPool::new(BufferPoolConfig { pool_size: 8 }, disk));
        let wal = Arc::new(WalManager::open(dir.path().join("tree.wal")).unwrap());
        let manager = AtomicOperationsManager::new(wal, Arc::clone(&pool));
        (dir, pool, manager)
    }

    #[test]
    fn rollback_restores_preimages() {
        let (_dir, pool, manager) = setup();
        let file_id = pool.add_file(None, "t.mvb").unwrap();
        {
            let mut guard = pool.add_page(None, file_id).unwrap();
            guard.data_mut()[0] = 1;
        }

        let op = manager.start("t");
        {
            let mut guard = pool.load_for_write(Some(&op), file_id, 0).unwrap();
            guard.data_mut()[0] = 99;
        }
        manager.rollback(op);

        let guard = pool.load_for_read(file_id, 0).unwrap();
        assert_eq!(guard.data()[0], 1);
    }

    #[test]
    fn rollback_removes_created_files() {
        let (_dir, pool, manager) = setup();
        let op = manager.start("t");
        pool.add_file(Some(&op), "doomed.mvb").unwrap();
        assert!(pool.file_exists("doomed.mvb"));
        manager.rollback(op);
        assert!(!pool.file_exists("doomed.mvb"));
    }

    #[test]
    fn commit_keeps_changes() {
        let (_dir, pool, manager) = setup();
        let file_id = pool.add_file(None, "t.mvb").unwrap();
        let op = manager.start("t");
        {
            let mut guard = pool.add_page(Some(&op), file_id).unwrap();
            guard.data_mut()[5] = 77;
        }
        manager.commit(op).unwrap();

        let guard = pool.load_for_read(file_id, 0).unwrap();
        assert_eq!(guard.data()[5], 77);
    }

    #[test]
    fn writers_exclude_each_other_per_component() {
        let (_dir, _pool, manager) = setup();
        let op = manager.start("a");
        // A different component is not blocked.
        let other = manager.start("b");
        drop(other);
        drop(op);
        // Same component can start again once the first op ended.
        let again = manager.start("a");
        drop(again);
    }
}
