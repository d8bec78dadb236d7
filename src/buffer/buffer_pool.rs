use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use log::warn;
use parking_lot::{Mutex, RwLock};

use crate::buffer::page::{PageIndex, ReadPageGuard, WritePageGuard, PAGE_SIZE};
use crate::buffer::replacer::LruReplacer;
use crate::config::BufferPoolConfig;
use crate::error::{BrambleError, BrambleResult};
use crate::recovery::AtomicOperation;
use crate::storage::disk_manager::{DiskManager, FileId};

pub type FrameId = usize;
pub(crate) type PageBuf = Box<[u8; PAGE_SIZE]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file_id: FileId,
    pub page_index: PageIndex,
}

#[derive(Debug, Clone, Copy, Default)]
struct FrameMeta {
    key: Option<PageKey>,
    pin_count: u32,
    is_dirty: bool,
}

#[derive(Debug)]
struct PoolState {
    page_table: HashMap<PageKey, FrameId>,
    metas: Vec<FrameMeta>,
    free: Vec<FrameId>,
    replacer: LruReplacer,
}

/// Fixed-frame page cache shared by every tree file. Pages are pinned
/// through RAII guards; a pinned page is never evicted, a dirty page is
/// written back through the disk manager before its frame is reused.
pub struct BufferPool {
    disk: Arc<DiskManager>,
    frames: Vec<Arc<RwLock<PageBuf>>>,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.frames.len())
            .finish()
    }
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig, disk: Arc<DiskManager>) -> Self {
        let frames = (0..config.pool_size)
            .map(|_| Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]) as PageBuf)))
            .collect();
        let state = PoolState {
            page_table: HashMap::new(),
            metas: vec![FrameMeta::default(); config.pool_size],
            free: (0..config.pool_size).rev().collect(),
            replacer: LruReplacer::new(),
        };
        BufferPool {
            disk,
            frames,
            state: Mutex::new(state),
        }
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Append a fresh zeroed page to the file and return it pinned for write.
    pub fn add_page(
        self: &Arc<Self>,
        op: Option<&AtomicOperation>,
        file_id: FileId,
    ) -> BrambleResult<WritePageGuard> {
        let page_index = self.disk.allocate_page(file_id)?;
        let key = PageKey {
            file_id,
            page_index,
        };
        if let Some(op) = op {
            op.capture_page(key, vec![0u8; PAGE_SIZE]);
        }
        let frame_id = self.pin(key)?;
        let data = self.frames[frame_id].write_arc();
        Ok(WritePageGuard::new(Arc::clone(self), key, data))
    }

    pub fn load_for_read(
        self: &Arc<Self>,
        file_id: FileId,
        page_index: PageIndex,
    ) -> BrambleResult<ReadPageGuard> {
        let key = PageKey {
            file_id,
            page_index,
        };
        let frame_id = self.pin(key)?;
        let data = self.frames[frame_id].read_arc();
        Ok(ReadPageGuard::new(Arc::clone(self), key, data))
    }

    pub fn load_for_write(
        self: &Arc<Self>,
        op: Option<&AtomicOperation>,
        file_id: FileId,
        page_index: PageIndex,
    ) -> BrambleResult<WritePageGuard> {
        let key = PageKey {
            file_id,
            page_index,
        };
        let frame_id = self.pin(key)?;
        let data = self.frames[frame_id].write_arc();
        if let Some(op) = op {
            op.capture_page(key, data[..].to_vec());
        }
        Ok(WritePageGuard::new(Arc::clone(self), key, data))
    }

    /// Number of pages the file holds.
    pub fn filled_up_to(&self, file_id: FileId) -> BrambleResult<u32> {
        self.disk.page_count(file_id)
    }

    pub(crate) fn complete_unpin(&self, key: PageKey, dirty: bool) {
        let mut state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(&key) else {
            return;
        };
        let meta = &mut state.metas[frame_id];
        if meta.pin_count > 0 {
            meta.pin_count -= 1;
        }
        if dirty {
            meta.is_dirty = true;
        }
        if meta.pin_count == 0 {
            state.replacer.set_evictable(frame_id, true);
        }
    }

    fn pin(&self, key: PageKey) -> BrambleResult<FrameId> {
        let mut state = self.state.lock();
        if let Some(&frame_id) = state.page_table.get(&key) {
            state.metas[frame_id].pin_count += 1;
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            return Ok(frame_id);
        }

        let frame_id = self.allocate_frame(&mut state)?;
        let bytes = match self.disk.read_page(key.file_id, key.page_index) {
            Ok(bytes) => bytes,
            Err(e) => {
                state.free.push(frame_id);
                return Err(e);
            }
        };
        self.frames[frame_id].write()[..].copy_from_slice(&bytes);

        state.page_table.insert(key, frame_id);
        state.metas[frame_id] = FrameMeta {
            key: Some(key),
            pin_count: 1,
            is_dirty: false,
        };
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);
        Ok(frame_id)
    }

    fn allocate_frame(&self, state: &mut PoolState) -> BrambleResult<FrameId> {
        if let Some(frame_id) = state.free.pop() {
            return Ok(frame_id);
        }
        let victim = state.replacer.evict().ok_or_else(|| {
            BrambleError::Storage("cannot allocate frame: buffer pool is full".to_string())
        })?;
        let meta = state.metas[victim];
        if let Some(key) = meta.key {
            if meta.is_dirty {
                let bytes = Bytes::copy_from_slice(&self.frames[victim].read()[..]);
                self.disk.write_page(key.file_id, key.page_index, &bytes)?;
            }
            state.page_table.remove(&key);
        }
        state.metas[victim] = FrameMeta::default();
        Ok(victim)
    }

    /// Overwrite a page with the given image, bypassing guards. Used by
    /// rollback to restore preimages; the caller must hold the writer lock
    /// of the owning tree so no pins are outstanding.
    pub(crate) fn restore_page(&self, key: PageKey, image: &[u8]) -> BrambleResult<()> {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        let frame_id = {
            let state = self.state.lock();
            state.page_table.get(&key).copied()
        };
        match frame_id {
            Some(frame_id) => {
                self.frames[frame_id].write()[..].copy_from_slice(image);
                let mut state = self.state.lock();
                state.metas[frame_id].is_dirty = true;
                Ok(())
            }
            None => self.disk.write_page(key.file_id, key.page_index, image),
        }
    }

    /// Write every dirty page of the file back to disk.
    pub fn flush_file(&self, file_id: FileId) -> BrambleResult<()> {
        let targets = self.dirty_frames_of(Some(file_id));
        self.write_back(targets)
    }

    /// Write all dirty pages back and fsync the underlying files.
    pub fn flush_all(&self) -> BrambleResult<()> {
        let targets = self.dirty_frames_of(None);
        self.write_back(targets)?;
        self.disk.sync()
    }

    fn dirty_frames_of(&self, file_id: Option<FileId>) -> Vec<(PageKey, FrameId)> {
        let state = self.state.lock();
        state
            .metas
            .iter()
            .enumerate()
            .filter_map(|(frame_id, meta)| {
                let key = meta.key?;
                let wanted = file_id.map(|f| f == key.file_id).unwrap_or(true);
                (wanted && meta.is_dirty).then_some((key, frame_id))
            })
            .collect()
    }

    fn write_back(&self, targets: Vec<(PageKey, FrameId)>) -> BrambleResult<()> {
        for (key, frame_id) in targets {
            let bytes = Bytes::copy_from_slice(&self.frames[frame_id].read()[..]);
            self.disk.write_page(key.file_id, key.page_index, &bytes)?;
            let mut state = self.state.lock();
            if state.page_table.get(&key) == Some(&frame_id) {
                state.metas[frame_id].is_dirty = false;
            }
        }
        Ok(())
    }

    /// Drop every cached page of the file, optionally flushing dirty ones
    /// first. The caller must guarantee no pins are outstanding.
    pub fn drop_file_pages(&self, file_id: FileId, flush: bool) -> BrambleResult<()> {
        if flush {
            self.flush_file(file_id)?;
        }
        let mut state = self.state.lock();
        let doomed: Vec<(PageKey, FrameId)> = state
            .page_table
            .iter()
            .filter(|(key, _)| key.file_id == file_id)
            .map(|(key, frame_id)| (*key, *frame_id))
            .collect();
        for (key, frame_id) in doomed {
            if state.metas[frame_id].pin_count > 0 {
                warn!(
                    "dropping pinned page {:?} of file {}; pin leak upstream",
                    key.page_index, file_id
                );
            }
            state.page_table.remove(&key);
            state.metas[frame_id] = FrameMeta::default();
            state.replacer.remove(frame_id);
            state.free.push(frame_id);
        }
        Ok(())
    }

    // File lifecycle, delegated to the disk manager with the cache kept
    // coherent.

    pub fn add_file(&self, op: Option<&AtomicOperation>, name: &str) -> BrambleResult<FileId> {
        let file_id = self.disk.add_file(name)?;
        if let Some(op) = op {
            op.register_created_file(file_id);
        }
        Ok(file_id)
    }

    pub fn open_file(&self, name: &str) -> BrambleResult<FileId> {
        self.disk.open_file(name)
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.disk.file_exists(name)
    }

    pub fn delete_file(&self, file_id: FileId) -> BrambleResult<()> {
        self.drop_file_pages(file_id, false)?;
        self.disk.delete_file(file_id)
    }

    pub fn truncate_file(&self, file_id: FileId) -> BrambleResult<()> {
        self.drop_file_pages(file_id, false)?;
        self.disk.truncate_file(file_id)
    }

    pub fn close_file(&self, file_id: FileId, flush: bool) -> BrambleResult<()> {
        self.drop_file_pages(file_id, flush)?;
        self.disk.close_file(file_id)
    }
}
