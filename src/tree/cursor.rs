use std::collections::VecDeque;

use crate::buffer::{PageIndex, NIL_PAGE};
use crate::error::{BrambleError, BrambleResult};
use crate::tree::bucket::Bucket;
use crate::tree::key::IndexKey;
use crate::tree::multi_value_tree::MultiValueTree;
use crate::tree::Rid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Pull-based range cursor. Each `next` serves from an in-memory batch;
/// refills run under the atomic-operation read lock and the tree shared
/// lock, and restart from the last emitted key (exclusive) so a refill
/// never replays entries emitted before a concurrent writer ran.
pub struct TreeCursor<'a> {
    tree: &'a MultiValueTree,
    direction: Direction,
    from_key: Option<IndexKey>,
    to_key: Option<IndexKey>,
    from_inclusive: bool,
    to_inclusive: bool,
    cache: VecDeque<(IndexKey, Rid)>,
    exhausted: bool,
}

impl<'a> TreeCursor<'a> {
    pub(crate) fn forward(
        tree: &'a MultiValueTree,
        from_key: Option<IndexKey>,
        to_key: Option<IndexKey>,
        from_inclusive: bool,
        to_inclusive: bool,
    ) -> Self {
        let from_inclusive = from_inclusive || from_key.is_none();
        TreeCursor {
            tree,
            direction: Direction::Forward,
            from_key,
            to_key,
            from_inclusive,
            to_inclusive,
            cache: VecDeque::new(),
            exhausted: false,
        }
    }

    pub(crate) fn backward(
        tree: &'a MultiValueTree,
        from_key: Option<IndexKey>,
        to_key: Option<IndexKey>,
        from_inclusive: bool,
        to_inclusive: bool,
    ) -> Self {
        let to_inclusive = to_inclusive || to_key.is_none();
        TreeCursor {
            tree,
            direction: Direction::Backward,
            from_key,
            to_key,
            from_inclusive,
            to_inclusive,
            cache: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Next (key, rid) pair, or `None` when the range is exhausted.
    /// `prefetch_size` is clamped to the configured maximum.
    pub fn next(&mut self, prefetch_size: usize) -> BrambleResult<Option<(IndexKey, Rid)>> {
        if self.cache.is_empty() && !self.exhausted {
            self.fill(prefetch_size)
                .map_err(|e| BrambleError::tree(&self.tree.name, e))?;
        }
        match self.cache.pop_front() {
            Some((key, rid)) => {
                // Advance the restart bound past the emitted key.
                match self.direction {
                    Direction::Forward => {
                        self.from_key = Some(key.clone());
                        self.from_inclusive = false;
                    }
                    Direction::Backward => {
                        self.to_key = Some(key.clone());
                        self.to_inclusive = false;
                    }
                }
                Ok(Some((key, rid)))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    fn fill(&mut self, prefetch_size: usize) -> BrambleResult<()> {
        let prefetch = prefetch_size.clamp(1, self.tree.config.cursor_prefetch_size);
        let _op_lock = self.tree.atomic_ops.read_lock(&self.tree.name);
        let _tree_lock = self.tree.lock.read();
        match self.direction {
            Direction::Forward => self.fill_forward(prefetch),
            Direction::Backward => self.fill_backward(prefetch),
        }
    }

    fn fill_forward(&mut self, prefetch: usize) -> BrambleResult<()> {
        let tree = self.tree;
        let search = match &self.from_key {
            Some(key) => Some(tree.find_bucket(key)?),
            None => tree.first_item()?,
        };
        let Some(search) = search else {
            self.exhausted = true;
            return Ok(());
        };

        let mut item_index = if self.from_key.is_some() {
            if search.item_index >= 0 {
                let exact = search.item_index as usize;
                if self.from_inclusive {
                    exact
                } else {
                    exact + 1
                }
            } else {
                (-search.item_index - 1) as usize
            }
        } else {
            0
        };

        let mut page = Some(search.last_path_item());
        while self.cache.len() < prefetch {
            let Some(current) = page else {
                break;
            };
            let guard = tree.pool.load_for_read(tree.file_id, current)?;
            let bucket = Bucket::new(guard.data());
            if item_index >= bucket.size() {
                let next = bucket.right_sibling();
                page = (next != NIL_PAGE).then_some(next);
                item_index = 0;
                continue;
            }

            let entry = bucket.leaf_entry(item_index);
            item_index += 1;
            let key = tree.codec.deserialize(&entry.raw_key)?;

            if let Some(from) = &self.from_key {
                let below = if self.from_inclusive {
                    key < *from
                } else {
                    key <= *from
                };
                if below {
                    continue;
                }
            }
            if let Some(to) = &self.to_key {
                let above = if self.to_inclusive {
                    key > *to
                } else {
                    key >= *to
                };
                if above {
                    break;
                }
            }
            for rid in entry.values {
                self.cache.push_back((key.clone(), rid));
            }
        }

        if self.cache.is_empty() {
            self.exhausted = true;
        }
        Ok(())
    }

    fn fill_backward(&mut self, prefetch: usize) -> BrambleResult<()> {
        let tree = self.tree;
        let search = match &self.to_key {
            Some(key) => Some(tree.find_bucket(key)?),
            None => tree.last_item()?,
        };
        let Some(search) = search else {
            self.exhausted = true;
            return Ok(());
        };

        let mut item_index: i64 = if self.to_key.is_some() {
            if search.item_index >= 0 {
                let exact = search.item_index as i64;
                if self.to_inclusive {
                    exact
                } else {
                    exact - 1
                }
            } else {
                -search.item_index as i64 - 2
            }
        } else {
            search.item_index as i64
        };

        let mut page = Some(search.last_path_item());
        while self.cache.len() < prefetch {
            let Some(current) = page else {
                break;
            };
            let guard = tree.pool.load_for_read(tree.file_id, current)?;
            let bucket = Bucket::new(guard.data());
            if item_index >= bucket.size() as i64 {
                item_index = bucket.size() as i64 - 1;
            }
            if item_index < 0 {
                let previous = bucket.left_sibling();
                page = (previous != NIL_PAGE).then_some(previous);
                item_index = i64::MAX;
                continue;
            }

            let entry = bucket.leaf_entry(item_index as usize);
            item_index -= 1;
            let key = tree.codec.deserialize(&entry.raw_key)?;

            if let Some(to) = &self.to_key {
                let above = if self.to_inclusive {
                    key > *to
                } else {
                    key >= *to
                };
                if above {
                    continue;
                }
            }
            if let Some(from) = &self.from_key {
                let below = if self.from_inclusive {
                    key < *from
                } else {
                    key <= *from
                };
                if below {
                    break;
                }
            }
            for rid in entry.values {
                self.cache.push_back((key.clone(), rid));
            }
        }

        if self.cache.is_empty() {
            self.exhausted = true;
        }
        Ok(())
    }
}

/// Ascending cursor over distinct stored keys, walking the leaf chain.
pub struct KeyCursor<'a> {
    tree: &'a MultiValueTree,
    page: Option<PageIndex>,
    item_index: usize,
    cache: VecDeque<IndexKey>,
    exhausted: bool,
}

impl<'a> KeyCursor<'a> {
    pub(crate) fn new(tree: &'a MultiValueTree, start_page: PageIndex) -> Self {
        KeyCursor {
            tree,
            page: Some(start_page),
            item_index: 0,
            cache: VecDeque::new(),
            exhausted: false,
        }
    }

    pub(crate) fn exhausted_cursor(tree: &'a MultiValueTree) -> Self {
        KeyCursor {
            tree,
            page: None,
            item_index: 0,
            cache: VecDeque::new(),
            exhausted: true,
        }
    }

    pub fn next(&mut self, prefetch_size: usize) -> BrambleResult<Option<IndexKey>> {
        if self.cache.is_empty() && !self.exhausted {
            self.fill(prefetch_size)
                .map_err(|e| BrambleError::tree(&self.tree.name, e))?;
        }
        match self.cache.pop_front() {
            Some(key) => Ok(Some(key)),
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    fn fill(&mut self, prefetch_size: usize) -> BrambleResult<()> {
        let tree = self.tree;
        let prefetch = prefetch_size.clamp(1, tree.config.cursor_prefetch_size);
        let _op_lock = tree.atomic_ops.read_lock(&tree.name);
        let _tree_lock = tree.lock.read();

        while self.cache.len() < prefetch {
            let Some(current) = self.page else {
                break;
            };
            if current >= tree.pool.filled_up_to(tree.file_id)? {
                self.page = None;
                break;
            }
            let guard = tree.pool.load_for_read(tree.file_id, current)?;
            let bucket = Bucket::new(guard.data());
            if self.item_index >= bucket.size() {
                let next = bucket.right_sibling();
                self.page = (next != NIL_PAGE).then_some(next);
                self.item_index = 0;
                continue;
            }
            self.cache
                .push_back(tree.codec.deserialize(bucket.raw_key_at(self.item_index))?);
            self.item_index += 1;
        }

        if self.cache.is_empty() {
            self.exhausted = true;
        }
        Ok(())
    }
}
