use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::buffer::buffer_pool::{BufferPool, PageBuf, PageKey};

pub type PageIndex = u32;

/// Marker for "no such page" in sibling links and child pointers.
pub const NIL_PAGE: PageIndex = u32::MAX;

pub const PAGE_SIZE: usize = 4096;

/// Shared pin on a cached page. The page stays in its frame and cannot be
/// evicted until the guard is dropped.
pub struct ReadPageGuard {
    pool: Arc<BufferPool>,
    key: PageKey,
    data: ArcRwLockReadGuard<RawRwLock, PageBuf>,
}

impl ReadPageGuard {
    pub(crate) fn new(
        pool: Arc<BufferPool>,
        key: PageKey,
        data: ArcRwLockReadGuard<RawRwLock, PageBuf>,
    ) -> Self {
        ReadPageGuard { pool, key, data }
    }

    pub fn page_index(&self) -> PageIndex {
        self.key.page_index
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        self.pool.complete_unpin(self.key, false);
    }
}

/// Exclusive pin on a cached page. Mutating through `data_mut` marks the
/// page dirty; the dirtiness is published to the pool when the guard drops.
pub struct WritePageGuard {
    pool: Arc<BufferPool>,
    key: PageKey,
    data: ArcRwLockWriteGuard<RawRwLock, PageBuf>,
    dirtied: bool,
}

impl WritePageGuard {
    pub(crate) fn new(
        pool: Arc<BufferPool>,
        key: PageKey,
        data: ArcRwLockWriteGuard<RawRwLock, PageBuf>,
    ) -> Self {
        WritePageGuard {
            pool,
            key,
            data,
            dirtied: false,
        }
    }

    pub fn page_index(&self) -> PageIndex {
        self.key.page_index
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirtied = true;
        &mut self.data[..]
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        self.pool.complete_unpin(self.key, self.dirtied);
    }
}
