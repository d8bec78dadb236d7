use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffer::{BufferPool, PageIndex, WritePageGuard, NIL_PAGE};
use crate::config::TreeConfig;
use crate::error::{BrambleError, BrambleResult};
use crate::recovery::{AtomicOperation, AtomicOperationsManager};
use crate::storage::disk_manager::FileId;
use crate::tree::bucket::{Bucket, BucketEntry};
use crate::tree::cursor::{KeyCursor, TreeCursor};
use crate::tree::key::{Encryption, IndexKey, KeyCodec, KeyType, PartialSearchMode};
use crate::tree::null_bucket::NullBucket;
use crate::tree::Rid;

pub const DATA_FILE_EXTENSION: &str = ".mvb";
pub const NULL_FILE_EXTENSION: &str = ".mvn";

pub(crate) const ROOT_INDEX: PageIndex = 0;

/// Shape of the keys a tree holds, fixed at create/load time.
#[derive(Debug, Default, Clone)]
pub struct TreeOptions {
    pub key_types: Option<Vec<KeyType>>,
    /// Number of key columns; 0 or 1 means a plain single-column key.
    pub key_size: usize,
    pub null_keys_supported: bool,
    pub encryption: Option<Arc<dyn Encryption>>,
}

#[derive(Debug, Clone)]
pub(crate) struct BucketSearchResult {
    /// Exact item index, or `-(insertion_point) - 1` when not found.
    pub item_index: isize,
    /// Page indexes from the root down to the bucket.
    pub path: Vec<PageIndex>,
}

impl BucketSearchResult {
    pub fn last_path_item(&self) -> PageIndex {
        *self.path.last().expect("search path is never empty")
    }
}

/// Persistent B+-tree mapping keys to multisets of RIDs.
///
/// All values live in leaf buckets chained by sibling links; inner buckets
/// hold separator keys only. Buckets are never merged after deletions, the
/// freed space is reused by later inserts. Every write runs inside an
/// atomic operation and under the tree's exclusive lock, so a failed
/// operation leaves the files untouched.
pub struct MultiValueTree {
    pub(crate) name: String,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) atomic_ops: Arc<AtomicOperationsManager>,
    pub(crate) codec: KeyCodec,
    pub(crate) config: TreeConfig,
    pub(crate) file_id: FileId,
    null_file_id: Option<FileId>,
    null_keys_supported: bool,
    pub(crate) lock: RwLock<()>,
}

impl MultiValueTree {
    /// Initialize the tree files: the data file with an empty leaf root at
    /// page 0, plus the one-page null file when null keys are enabled.
    pub fn create(
        name: &str,
        pool: Arc<BufferPool>,
        atomic_ops: Arc<AtomicOperationsManager>,
        config: TreeConfig,
        options: TreeOptions,
    ) -> BrambleResult<Self> {
        let codec = KeyCodec::new(
            options.key_types,
            options.key_size.max(1),
            options.encryption,
            config.max_key_size,
        );
        let op = atomic_ops.start(name);
        let created = (|| -> BrambleResult<(FileId, Option<FileId>)> {
            let file_id = pool.add_file(Some(&op), &format!("{}{}", name, DATA_FILE_EXTENSION))?;
            let null_file_id = if options.null_keys_supported {
                Some(pool.add_file(Some(&op), &format!("{}{}", name, NULL_FILE_EXTENSION))?)
            } else {
                None
            };
            {
                let mut root_guard = pool.add_page(Some(&op), file_id)?;
                let mut root = Bucket::new(root_guard.data_mut());
                root.init(true);
                root.set_tree_size(0);
            }
            Ok((file_id, null_file_id))
        })();

        match created {
            Ok((file_id, null_file_id)) => {
                atomic_ops
                    .commit(op)
                    .map_err(|e| BrambleError::tree(name, e))?;
                Ok(MultiValueTree {
                    name: name.to_string(),
                    pool,
                    atomic_ops,
                    codec,
                    config,
                    file_id,
                    null_file_id,
                    null_keys_supported: options.null_keys_supported,
                    lock: RwLock::new(()),
                })
            }
            Err(e) => {
                atomic_ops.rollback(op);
                Err(BrambleError::tree(name, e))
            }
        }
    }

    /// Reopen existing tree files.
    pub fn load(
        name: &str,
        pool: Arc<BufferPool>,
        atomic_ops: Arc<AtomicOperationsManager>,
        config: TreeConfig,
        options: TreeOptions,
    ) -> BrambleResult<Self> {
        let codec = KeyCodec::new(
            options.key_types,
            options.key_size.max(1),
            options.encryption,
            config.max_key_size,
        );
        let loaded = (|| -> BrambleResult<(FileId, Option<FileId>)> {
            let file_id = pool.open_file(&format!("{}{}", name, DATA_FILE_EXTENSION))?;
            let null_file_id = if options.null_keys_supported {
                Some(pool.open_file(&format!("{}{}", name, NULL_FILE_EXTENSION))?)
            } else {
                None
            };
            Ok((file_id, null_file_id))
        })();
        let (file_id, null_file_id) = loaded.map_err(|e| BrambleError::tree(name, e))?;
        Ok(MultiValueTree {
            name: name.to_string(),
            pool,
            atomic_ops,
            codec,
            config,
            file_id,
            null_file_id,
            null_keys_supported: options.null_keys_supported,
            lock: RwLock::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_null_keys_supported(&self) -> bool {
        let _tree_lock = self.lock.read();
        self.null_keys_supported
    }

    /// The RID multiset stored under the key, in insertion order. `None`
    /// addresses the null key.
    pub fn get(&self, key: Option<&IndexKey>) -> BrambleResult<Vec<Rid>> {
        let _op_lock = self.atomic_ops.read_lock(&self.name);
        let _tree_lock = self.lock.read();
        self.get_inner(key)
            .map_err(|e| BrambleError::tree(&self.name, e))
    }

    fn get_inner(&self, key: Option<&IndexKey>) -> BrambleResult<Vec<Rid>> {
        match key {
            Some(key) => {
                let key = self.codec.preprocess(key)?;
                let search = self.find_bucket(&key)?;
                if search.item_index < 0 {
                    return Ok(Vec::new());
                }
                let guard = self
                    .pool
                    .load_for_read(self.file_id, search.last_path_item())?;
                let bucket = Bucket::new(guard.data());
                Ok(bucket.values(search.item_index as usize))
            }
            None => {
                self.check_null_support()?;
                let null_file_id = self.null_file()?;
                if self.pool.filled_up_to(null_file_id)? == 0 {
                    return Ok(Vec::new());
                }
                let guard = self.pool.load_for_read(null_file_id, 0)?;
                Ok(NullBucket::new(guard.data()).values())
            }
        }
    }

    /// Insert one (key, value) pair. Duplicates of the same pair stack up
    /// in the key's multiset.
    pub fn put(&self, key: Option<&IndexKey>, value: Rid) -> BrambleResult<()> {
        let op = self.atomic_ops.start(&self.name);
        let _tree_lock = self.lock.write();
        match self.put_inner(&op, key, value) {
            Ok(()) => self
                .atomic_ops
                .commit(op)
                .map_err(|e| BrambleError::tree(&self.name, e)),
            Err(e) => {
                self.atomic_ops.rollback(op);
                Err(BrambleError::tree(&self.name, e))
            }
        }
    }

    fn put_inner(
        &self,
        op: &AtomicOperation,
        key: Option<&IndexKey>,
        value: Rid,
    ) -> BrambleResult<()> {
        match key {
            Some(key) => {
                let key = self.codec.preprocess(key)?;
                // Oversized keys fail here, before any page is touched.
                let raw_key = self.codec.serialize(&key)?;

                let mut search = self.find_bucket(&key)?;
                let (mut item_index, is_new) = if search.item_index >= 0 {
                    (search.item_index as usize, false)
                } else {
                    ((-search.item_index - 1) as usize, true)
                };

                let mut guard =
                    self.pool
                        .load_for_write(Some(op), self.file_id, search.last_path_item())?;
                loop {
                    let added = {
                        let mut bucket = Bucket::new(guard.data_mut());
                        if is_new {
                            bucket.add_new_leaf_entry(item_index, &raw_key, value)
                        } else {
                            bucket.append_leaf_value(item_index, value)
                        }
                    };
                    if added {
                        break;
                    }
                    let next = self.split_bucket(op, &mut guard, &search.path, item_index, &key)?;
                    search = next;
                    item_index = search.item_index as usize;
                    let page_index = search.last_path_item();
                    if page_index != guard.page_index() {
                        drop(guard);
                        guard = self.pool.load_for_write(Some(op), self.file_id, page_index)?;
                    }
                }
                drop(guard);
                self.update_size(op, 1)
            }
            None => {
                self.check_null_support()?;
                let null_file_id = self.null_file()?;
                let added = {
                    let mut guard = if self.pool.filled_up_to(null_file_id)? == 0 {
                        self.pool.add_page(Some(op), null_file_id)?
                    } else {
                        self.pool.load_for_write(Some(op), null_file_id, 0)?
                    };
                    NullBucket::new(guard.data_mut()).add_value(value)
                };
                if !added {
                    return Err(BrambleError::Storage(
                        "null key bucket is out of space".to_string(),
                    ));
                }
                self.update_size(op, 1)
            }
        }
    }

    /// Remove one occurrence of (key, value). Returns whether a pair was
    /// actually removed; removing an absent pair is a no-op.
    pub fn remove(&self, key: Option<&IndexKey>, value: Rid) -> BrambleResult<bool> {
        let op = self.atomic_ops.start(&self.name);
        let _tree_lock = self.lock.write();
        match self.remove_inner(&op, key, value) {
            Ok(removed) => {
                self.atomic_ops
                    .commit(op)
                    .map_err(|e| BrambleError::tree(&self.name, e))?;
                Ok(removed)
            }
            Err(e) => {
                self.atomic_ops.rollback(op);
                Err(BrambleError::tree(&self.name, e))
            }
        }
    }

    fn remove_inner(
        &self,
        op: &AtomicOperation,
        key: Option<&IndexKey>,
        value: Rid,
    ) -> BrambleResult<bool> {
        match key {
            Some(key) => {
                let key = self.codec.preprocess(key)?;
                let search = self.find_bucket(&key)?;
                if search.item_index < 0 {
                    return Ok(false);
                }
                let removed = {
                    let mut guard =
                        self.pool
                            .load_for_write(Some(op), self.file_id, search.last_path_item())?;
                    let mut bucket = Bucket::new(guard.data_mut());
                    bucket.remove_value(search.item_index as usize, value)
                };
                if removed {
                    self.update_size(op, -1)?;
                }
                Ok(removed)
            }
            None => {
                self.check_null_support()?;
                let null_file_id = self.null_file()?;
                if self.pool.filled_up_to(null_file_id)? == 0 {
                    return Ok(false);
                }
                let removed = {
                    let mut guard = self.pool.load_for_write(Some(op), null_file_id, 0)?;
                    NullBucket::new(guard.data_mut()).remove_value(value)
                };
                if removed {
                    self.update_size(op, -1)?;
                }
                Ok(removed)
            }
        }
    }

    /// Total number of (key, value) pairs, null-key pairs included.
    pub fn size(&self) -> BrambleResult<u64> {
        let _op_lock = self.atomic_ops.read_lock(&self.name);
        let _tree_lock = self.lock.read();
        (|| {
            let guard = self.pool.load_for_read(self.file_id, ROOT_INDEX)?;
            Ok(Bucket::new(guard.data()).tree_size())
        })()
        .map_err(|e: BrambleError| BrambleError::tree(&self.name, e))
    }

    pub fn first_key(&self) -> BrambleResult<Option<IndexKey>> {
        let _op_lock = self.atomic_ops.read_lock(&self.name);
        let _tree_lock = self.lock.read();
        (|| {
            let Some(search) = self.first_item()? else {
                return Ok(None);
            };
            let guard = self
                .pool
                .load_for_read(self.file_id, search.last_path_item())?;
            let bucket = Bucket::new(guard.data());
            Ok(Some(
                self.codec
                    .deserialize(bucket.raw_key_at(search.item_index as usize))?,
            ))
        })()
        .map_err(|e: BrambleError| BrambleError::tree(&self.name, e))
    }

    pub fn last_key(&self) -> BrambleResult<Option<IndexKey>> {
        let _op_lock = self.atomic_ops.read_lock(&self.name);
        let _tree_lock = self.lock.read();
        (|| {
            let Some(search) = self.last_item()? else {
                return Ok(None);
            };
            let guard = self
                .pool
                .load_for_read(self.file_id, search.last_path_item())?;
            let bucket = Bucket::new(guard.data());
            Ok(Some(
                self.codec
                    .deserialize(bucket.raw_key_at(search.item_index as usize))?,
            ))
        })()
        .map_err(|e: BrambleError| BrambleError::tree(&self.name, e))
    }

    /// Cursor over `(-inf, key]` (or `[key, -inf)` descending). A partial
    /// composite key is padded so the boundary covers every full key
    /// sharing the prefix.
    pub fn iterate_entries_minor(
        &self,
        key: &IndexKey,
        inclusive: bool,
        ascending: bool,
    ) -> BrambleResult<TreeCursor<'_>> {
        let _op_lock = self.atomic_ops.read_lock(&self.name);
        let _tree_lock = self.lock.read();
        (|| {
            let key = self.codec.preprocess(key)?;
            let mode = if inclusive {
                PartialSearchMode::HighestBoundary
            } else {
                PartialSearchMode::LowestBoundary
            };
            let key = self.codec.enhance_composite_key(&key, mode);
            Ok(if ascending {
                TreeCursor::forward(self, None, Some(key), false, inclusive)
            } else {
                TreeCursor::backward(self, None, Some(key), false, inclusive)
            })
        })()
        .map_err(|e: BrambleError| BrambleError::tree(&self.name, e))
    }

    /// Cursor over `[key, +inf)` (or `(+inf, key]` descending).
    pub fn iterate_entries_major(
        &self,
        key: &IndexKey,
        inclusive: bool,
        ascending: bool,
    ) -> BrambleResult<TreeCursor<'_>> {
        let _op_lock = self.atomic_ops.read_lock(&self.name);
        let _tree_lock = self.lock.read();
        (|| {
            let key = self.codec.preprocess(key)?;
            let mode = if inclusive {
                PartialSearchMode::LowestBoundary
            } else {
                PartialSearchMode::HighestBoundary
            };
            let key = self.codec.enhance_composite_key(&key, mode);
            Ok(if ascending {
                TreeCursor::forward(self, Some(key), None, inclusive, false)
            } else {
                TreeCursor::backward(self, Some(key), None, inclusive, false)
            })
        })()
        .map_err(|e: BrambleError| BrambleError::tree(&self.name, e))
    }

    /// Bounded range cursor in either direction.
    pub fn iterate_entries_between(
        &self,
        from: &IndexKey,
        from_inclusive: bool,
        to: &IndexKey,
        to_inclusive: bool,
        ascending: bool,
    ) -> BrambleResult<TreeCursor<'_>> {
        let _op_lock = self.atomic_ops.read_lock(&self.name);
        let _tree_lock = self.lock.read();
        (|| {
            let from = self.codec.preprocess(from)?;
            let to = self.codec.preprocess(to)?;
            let from_mode = if from_inclusive {
                PartialSearchMode::LowestBoundary
            } else {
                PartialSearchMode::HighestBoundary
            };
            let to_mode = if to_inclusive {
                PartialSearchMode::HighestBoundary
            } else {
                PartialSearchMode::LowestBoundary
            };
            let from = self.codec.enhance_composite_key(&from, from_mode);
            let to = self.codec.enhance_composite_key(&to, to_mode);
            Ok(if ascending {
                TreeCursor::forward(self, Some(from), Some(to), from_inclusive, to_inclusive)
            } else {
                TreeCursor::backward(self, Some(from), Some(to), from_inclusive, to_inclusive)
            })
        })()
        .map_err(|e: BrambleError| BrambleError::tree(&self.name, e))
    }

    /// Ascending cursor over every distinct stored key.
    pub fn key_cursor(&self) -> BrambleResult<KeyCursor<'_>> {
        let _op_lock = self.atomic_ops.read_lock(&self.name);
        let _tree_lock = self.lock.read();
        (|| {
            Ok(match self.first_item()? {
                Some(search) => KeyCursor::new(self, search.last_path_item()),
                None => KeyCursor::exhausted_cursor(self),
            })
        })()
        .map_err(|e: BrambleError| BrambleError::tree(&self.name, e))
    }

    /// Drop every entry, truncating the files and reinstalling an empty
    /// root leaf at page 0.
    pub fn clear(&self) -> BrambleResult<()> {
        let op = self.atomic_ops.start(&self.name);
        let _tree_lock = self.lock.write();
        let cleared = (|| -> BrambleResult<()> {
            self.pool.truncate_file(self.file_id)?;
            if let Some(null_file_id) = self.null_file_id {
                self.pool.truncate_file(null_file_id)?;
            }
            let mut root_guard = self.pool.add_page(Some(&op), self.file_id)?;
            debug_assert_eq!(root_guard.page_index(), ROOT_INDEX);
            let mut root = Bucket::new(root_guard.data_mut());
            root.init(true);
            root.set_tree_size(0);
            Ok(())
        })();
        match cleared {
            Ok(()) => self
                .atomic_ops
                .commit(op)
                .map_err(|e| BrambleError::tree(&self.name, e)),
            Err(e) => {
                self.atomic_ops.rollback(op);
                Err(BrambleError::tree(&self.name, e))
            }
        }
    }

    /// Destroy the tree files.
    pub fn delete(self) -> BrambleResult<()> {
        let op = self.atomic_ops.start(&self.name);
        let deleted = (|| -> BrambleResult<()> {
            let _tree_lock = self.lock.write();
            self.pool.delete_file(self.file_id)?;
            if let Some(null_file_id) = self.null_file_id {
                self.pool.delete_file(null_file_id)?;
            }
            Ok(())
        })();
        match deleted {
            Ok(()) => self
                .atomic_ops
                .commit(op)
                .map_err(|e| BrambleError::tree(&self.name, e)),
            Err(e) => {
                self.atomic_ops.rollback(op);
                Err(BrambleError::tree(&self.name, e))
            }
        }
    }

    /// Remove the files of a tree that was never loaded in this process.
    pub fn delete_without_load(
        name: &str,
        pool: &Arc<BufferPool>,
        atomic_ops: &AtomicOperationsManager,
    ) -> BrambleResult<()> {
        let op = atomic_ops.start(name);
        let deleted = (|| -> BrambleResult<()> {
            let data_name = format!("{}{}", name, DATA_FILE_EXTENSION);
            if pool.file_exists(&data_name) {
                let file_id = pool.open_file(&data_name)?;
                pool.delete_file(file_id)?;
            }
            let null_name = format!("{}{}", name, NULL_FILE_EXTENSION);
            if pool.file_exists(&null_name) {
                let file_id = pool.open_file(&null_name)?;
                pool.delete_file(file_id)?;
            }
            Ok(())
        })();
        match deleted {
            Ok(()) => atomic_ops
                .commit(op)
                .map_err(|e| BrambleError::tree(name, e)),
            Err(e) => {
                atomic_ops.rollback(op);
                Err(BrambleError::tree(name, e))
            }
        }
    }

    /// Close the tree files, flushing dirty pages unless told otherwise.
    pub fn close(self, flush: bool) -> BrambleResult<()> {
        let _tree_lock = self.lock.write();
        self.pool
            .close_file(self.file_id, flush)
            .map_err(|e| BrambleError::tree(&self.name, e))?;
        if let Some(null_file_id) = self.null_file_id {
            self.pool
                .close_file(null_file_id, flush)
                .map_err(|e| BrambleError::tree(&self.name, e))?;
        }
        Ok(())
    }

    /// Push every dirty page down to disk.
    pub fn flush(&self) -> BrambleResult<()> {
        let _op_lock = self.atomic_ops.read_lock(&self.name);
        let _tree_lock = self.lock.read();
        self.pool
            .flush_all()
            .map_err(|e| BrambleError::tree(&self.name, e))
    }

    fn check_null_support(&self) -> BrambleResult<()> {
        if self.null_keys_supported {
            Ok(())
        } else {
            Err(BrambleError::NullKeysNotSupported)
        }
    }

    fn null_file(&self) -> BrambleResult<FileId> {
        self.null_file_id
            .ok_or_else(|| BrambleError::Internal("null key file is not configured".to_string()))
    }

    fn update_size(&self, op: &AtomicOperation, diff: i64) -> BrambleResult<()> {
        let mut guard = self.pool.load_for_write(Some(op), self.file_id, ROOT_INDEX)?;
        let mut root = Bucket::new(guard.data_mut());
        let tree_size = root.tree_size().checked_add_signed(diff).ok_or_else(|| {
            BrambleError::Internal("tree size counter underflow".to_string())
        })?;
        root.set_tree_size(tree_size);
        Ok(())
    }

    /// Walk from the root to the leaf responsible for the key.
    pub(crate) fn find_bucket(&self, key: &IndexKey) -> BrambleResult<BucketSearchResult> {
        let mut page_index = ROOT_INDEX;
        let mut path = Vec::new();
        loop {
            if path.len() > self.config.max_depth {
                return Err(BrambleError::Corrupted(format!(
                    "reached max depth {} while still descending",
                    self.config.max_depth
                )));
            }
            path.push(page_index);
            let guard = self.pool.load_for_read(self.file_id, page_index)?;
            let bucket = Bucket::new(guard.data());
            let index = bucket.find(&self.codec, key)?;
            if bucket.is_leaf() {
                return Ok(BucketSearchResult {
                    item_index: index,
                    path,
                });
            }
            page_index = if index >= 0 {
                bucket.right_child(index as usize)
            } else {
                let insertion = (-index - 1) as usize;
                if insertion >= bucket.size() {
                    bucket.right_child(insertion - 1)
                } else {
                    bucket.left_child(insertion)
                }
            };
        }
    }

    /// Leftmost non-empty leaf, backtracking past branches whose subtrees
    /// turned out empty. `None` when the whole tree holds no entries.
    pub(crate) fn first_item(&self) -> BrambleResult<Option<BucketSearchResult>> {
        let mut stack: Vec<(PageIndex, usize)> = Vec::new();
        let mut bucket_index = ROOT_INDEX;
        let mut item_index = 0usize;
        loop {
            let guard = self.pool.load_for_read(self.file_id, bucket_index)?;
            let bucket = Bucket::new(guard.data());
            if !bucket.is_leaf() {
                if bucket.is_empty() || item_index > bucket.size() {
                    match stack.pop() {
                        Some((page, item)) => {
                            bucket_index = page;
                            item_index = item + 1;
                        }
                        None => return Ok(None),
                    }
                } else {
                    stack.push((bucket_index, item_index));
                    bucket_index = if item_index < bucket.size() {
                        bucket.left_child(item_index)
                    } else {
                        bucket.right_child(item_index - 1)
                    };
                    item_index = 0;
                }
            } else if bucket.is_empty() {
                match stack.pop() {
                    Some((page, item)) => {
                        bucket_index = page;
                        item_index = item + 1;
                    }
                    None => return Ok(None),
                }
            } else {
                let mut path: Vec<PageIndex> = stack.iter().map(|(page, _)| *page).collect();
                path.push(bucket_index);
                return Ok(Some(BucketSearchResult {
                    item_index: 0,
                    path,
                }));
            }
        }
    }

    /// Mirror of `first_item`: rightmost non-empty leaf. The sentinel item
    /// index is refreshed to `size - 1` once the child bucket is loaded.
    pub(crate) fn last_item(&self) -> BrambleResult<Option<BucketSearchResult>> {
        const REFRESH: i64 = i64::MAX;
        let mut stack: Vec<(PageIndex, i64)> = Vec::new();
        let mut bucket_index = ROOT_INDEX;
        let mut item_index = REFRESH;
        loop {
            let guard = self.pool.load_for_read(self.file_id, bucket_index)?;
            let bucket = Bucket::new(guard.data());
            if item_index == REFRESH {
                item_index = bucket.size() as i64 - 1;
            }
            if !bucket.is_leaf() {
                if item_index < -1 {
                    match stack.pop() {
                        Some((page, item)) => {
                            bucket_index = page;
                            item_index = item - 1;
                        }
                        None => return Ok(None),
                    }
                } else {
                    stack.push((bucket_index, item_index));
                    bucket_index = if item_index > -1 {
                        bucket.right_child(item_index as usize)
                    } else {
                        bucket.left_child(0)
                    };
                    item_index = REFRESH;
                }
            } else if bucket.is_empty() {
                match stack.pop() {
                    Some((page, item)) => {
                        bucket_index = page;
                        item_index = item - 1;
                    }
                    None => return Ok(None),
                }
            } else {
                let mut path: Vec<PageIndex> = stack.iter().map(|(page, _)| *page).collect();
                path.push(bucket_index);
                return Ok(Some(BucketSearchResult {
                    item_index: bucket.size() as isize - 1,
                    path,
                }));
            }
        }
    }

    /// Split the bucket behind `guard`. Returns the position where the
    /// pending key must be retried: the kept half when it sorts below the
    /// separator, the new right half otherwise.
    fn split_bucket(
        &self,
        op: &AtomicOperation,
        guard: &mut WritePageGuard,
        path: &[PageIndex],
        key_index: usize,
        key_to_insert: &IndexKey,
    ) -> BrambleResult<BucketSearchResult> {
        let (split_leaf, bucket_size) = {
            let bucket = Bucket::new(guard.data());
            (bucket.is_leaf(), bucket.size())
        };
        let index_to_split = bucket_size / 2;
        let raw_separation_key = {
            let bucket = Bucket::new(guard.data());
            bucket.raw_key_at(index_to_split).to_vec()
        };
        let separation_key = self.codec.deserialize(&raw_separation_key)?;

        // Leaf splits copy the separator up and keep it in the right half;
        // internal splits push it up and out of both halves.
        let start_right = if split_leaf {
            index_to_split
        } else {
            index_to_split + 1
        };
        let right_entries: Vec<BucketEntry> = {
            let bucket = Bucket::new(guard.data());
            (start_right..bucket_size)
                .map(|index| {
                    if split_leaf {
                        BucketEntry::Leaf(bucket.leaf_entry(index))
                    } else {
                        BucketEntry::Internal(bucket.internal_entry(index))
                    }
                })
                .collect()
        };

        if guard.page_index() != ROOT_INDEX {
            self.split_non_root_bucket(
                op,
                guard,
                path,
                key_index,
                key_to_insert,
                split_leaf,
                index_to_split,
                &separation_key,
                &raw_separation_key,
                right_entries,
            )
        } else {
            self.split_root_bucket(
                op,
                guard,
                key_index,
                key_to_insert,
                split_leaf,
                index_to_split,
                &separation_key,
                &raw_separation_key,
                right_entries,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_non_root_bucket(
        &self,
        op: &AtomicOperation,
        guard: &mut WritePageGuard,
        path: &[PageIndex],
        key_index: usize,
        key_to_insert: &IndexKey,
        split_leaf: bool,
        index_to_split: usize,
        separation_key: &IndexKey,
        raw_separation_key: &[u8],
        right_entries: Vec<BucketEntry>,
    ) -> BrambleResult<BucketSearchResult> {
        let page_index = guard.page_index();
        let mut right_guard = self.pool.add_page(Some(op), self.file_id)?;
        let right_index = right_guard.page_index();
        {
            let mut right = Bucket::new(right_guard.data_mut());
            right.init(split_leaf);
            right.add_all(&right_entries);
        }
        {
            let mut bucket = Bucket::new(guard.data_mut());
            bucket.shrink(index_to_split);
        }

        let old_right_sibling = Bucket::new(guard.data()).right_sibling();
        {
            let mut right = Bucket::new(right_guard.data_mut());
            right.set_left_sibling(page_index);
            right.set_right_sibling(old_right_sibling);
        }
        Bucket::new(guard.data_mut()).set_right_sibling(right_index);
        if old_right_sibling != NIL_PAGE {
            let mut sibling_guard =
                self.pool
                    .load_for_write(Some(op), self.file_id, old_right_sibling)?;
            Bucket::new(sibling_guard.data_mut()).set_left_sibling(right_index);
        }
        drop(right_guard);

        let mut parent_path: Vec<PageIndex> = path[..path.len() - 1].to_vec();
        let parent_index = *parent_path.last().ok_or_else(|| {
            BrambleError::Corrupted("non-root bucket has no parent in its path".to_string())
        })?;
        let mut parent_guard = self.pool.load_for_write(Some(op), self.file_id, parent_index)?;
        let mut insertion_index = {
            let parent = Bucket::new(parent_guard.data());
            let found = parent.find(&self.codec, separation_key)?;
            debug_assert!(found < 0);
            (-found - 1) as usize
        };
        loop {
            let added = Bucket::new(parent_guard.data_mut()).add_internal_entry(
                insertion_index,
                raw_separation_key,
                page_index,
                right_index,
                true,
            );
            if added {
                break;
            }
            let result = self.split_bucket(
                op,
                &mut parent_guard,
                &parent_path,
                insertion_index,
                separation_key,
            )?;
            insertion_index = result.item_index as usize;
            let next_parent = result.last_path_item();
            parent_path = result.path;
            if next_parent != parent_guard.page_index() {
                drop(parent_guard);
                parent_guard = self.pool.load_for_write(Some(op), self.file_id, next_parent)?;
            }
        }
        drop(parent_guard);

        let mut result_path: Vec<PageIndex> = path[..path.len() - 1].to_vec();
        if self.codec.compare(key_to_insert, separation_key) == Ordering::Less {
            result_path.push(page_index);
            return Ok(BucketSearchResult {
                item_index: key_index as isize,
                path: result_path,
            });
        }
        result_path.push(right_index);
        let item_index = if split_leaf {
            key_index - index_to_split
        } else {
            key_index - index_to_split - 1
        };
        Ok(BucketSearchResult {
            item_index: item_index as isize,
            path: result_path,
        })
    }

    /// The root never moves: its entries are copied out into two fresh
    /// children and page 0 is rewritten in place as an internal bucket
    /// with the single separator, preserving the tree size counter.
    #[allow(clippy::too_many_arguments)]
    fn split_root_bucket(
        &self,
        op: &AtomicOperation,
        guard: &mut WritePageGuard,
        key_index: usize,
        key_to_insert: &IndexKey,
        split_leaf: bool,
        index_to_split: usize,
        separation_key: &IndexKey,
        raw_separation_key: &[u8],
        right_entries: Vec<BucketEntry>,
    ) -> BrambleResult<BucketSearchResult> {
        let tree_size = Bucket::new(guard.data()).tree_size();
        let left_entries: Vec<BucketEntry> = {
            let bucket = Bucket::new(guard.data());
            (0..index_to_split)
                .map(|index| {
                    if split_leaf {
                        BucketEntry::Leaf(bucket.leaf_entry(index))
                    } else {
                        BucketEntry::Internal(bucket.internal_entry(index))
                    }
                })
                .collect()
        };

        let mut left_guard = self.pool.add_page(Some(op), self.file_id)?;
        let left_index = left_guard.page_index();
        let mut right_guard = self.pool.add_page(Some(op), self.file_id)?;
        let right_index = right_guard.page_index();
        {
            let mut left = Bucket::new(left_guard.data_mut());
            left.init(split_leaf);
            left.add_all(&left_entries);
            left.set_right_sibling(right_index);
        }
        {
            let mut right = Bucket::new(right_guard.data_mut());
            right.init(split_leaf);
            right.add_all(&right_entries);
            right.set_left_sibling(left_index);
        }
        drop(left_guard);
        drop(right_guard);

        {
            let mut root = Bucket::new(guard.data_mut());
            root.init(false);
            root.set_tree_size(tree_size);
            let added =
                root.add_internal_entry(0, raw_separation_key, left_index, right_index, true);
            debug_assert!(added);
        }

        let mut result_path = vec![ROOT_INDEX];
        if self.codec.compare(key_to_insert, separation_key) == Ordering::Less {
            result_path.push(left_index);
            return Ok(BucketSearchResult {
                item_index: key_index as isize,
                path: result_path,
            });
        }
        result_path.push(right_index);
        let item_index = if split_leaf {
            key_index - index_to_split
        } else {
            key_index - index_to_split - 1
        };
        Ok(BucketSearchResult {
            item_index: item_index as isize,
            path: result_path,
        })
    }
}
