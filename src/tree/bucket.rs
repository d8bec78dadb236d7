use crate::buffer::{PageIndex, NIL_PAGE, PAGE_SIZE};
use crate::error::BrambleResult;
use crate::tree::key::{IndexKey, KeyCodec};
use crate::tree::Rid;

// Page layout: fixed header, then a u16 offset table sorted by key order
// growing forward, then free space, then the raw entry heap growing
// backward from the page end. Entries are never moved on delete; dead heap
// bytes are reclaimed by compaction when a mutator would otherwise fail.
const IS_LEAF_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 2;
const LEFT_SIBLING_OFFSET: usize = 4;
const RIGHT_SIBLING_OFFSET: usize = 8;
const TREE_SIZE_OFFSET: usize = 12;
const FREE_PTR_OFFSET: usize = 20;
const POSITIONS_OFFSET: usize = 22;

#[derive(Debug, Clone)]
pub(crate) struct LeafEntry {
    pub raw_key: Vec<u8>,
    pub values: Vec<Rid>,
}

#[derive(Debug, Clone)]
pub(crate) struct InternalEntry {
    pub raw_key: Vec<u8>,
    pub left: PageIndex,
    pub right: PageIndex,
}

#[derive(Debug, Clone)]
pub(crate) enum BucketEntry {
    Leaf(LeafEntry),
    Internal(InternalEntry),
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

fn encode_leaf_entry(raw_key: &[u8], values: &[Rid]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + raw_key.len() + values.len() * Rid::ENCODED_SIZE);
    bytes.extend_from_slice(&(raw_key.len() as u16).to_be_bytes());
    bytes.extend_from_slice(raw_key);
    bytes.extend_from_slice(&(values.len() as u16).to_be_bytes());
    for rid in values {
        let mut buf = [0u8; Rid::ENCODED_SIZE];
        rid.encode_into(&mut buf);
        bytes.extend_from_slice(&buf);
    }
    bytes
}

fn encode_internal_entry(raw_key: &[u8], left: PageIndex, right: PageIndex) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10 + raw_key.len());
    bytes.extend_from_slice(&(raw_key.len() as u16).to_be_bytes());
    bytes.extend_from_slice(raw_key);
    bytes.extend_from_slice(&left.to_be_bytes());
    bytes.extend_from_slice(&right.to_be_bytes());
    bytes
}

/// View over one tree page, leaf or internal depending on the header flag.
/// Construct with `&[u8]` for reading or `&mut [u8]` for mutation.
pub(crate) struct Bucket<B> {
    page: B,
}

impl<B: AsRef<[u8]>> Bucket<B> {
    pub fn new(page: B) -> Self {
        Bucket { page }
    }

    fn bytes(&self) -> &[u8] {
        self.page.as_ref()
    }

    pub fn is_leaf(&self) -> bool {
        self.bytes()[IS_LEAF_OFFSET] != 0
    }

    pub fn size(&self) -> usize {
        read_u16(self.bytes(), SIZE_OFFSET) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn left_sibling(&self) -> PageIndex {
        read_u32(self.bytes(), LEFT_SIBLING_OFFSET)
    }

    pub fn right_sibling(&self) -> PageIndex {
        read_u32(self.bytes(), RIGHT_SIBLING_OFFSET)
    }

    /// Total (key, value) pair count of the whole tree; meaningful on the
    /// root page only.
    pub fn tree_size(&self) -> u64 {
        read_u64(self.bytes(), TREE_SIZE_OFFSET)
    }

    fn free_ptr(&self) -> usize {
        read_u16(self.bytes(), FREE_PTR_OFFSET) as usize
    }

    fn free_space(&self) -> usize {
        self.free_ptr() - (POSITIONS_OFFSET + 2 * self.size())
    }

    fn entry_offset(&self, index: usize) -> usize {
        debug_assert!(index < self.size());
        read_u16(self.bytes(), POSITIONS_OFFSET + 2 * index) as usize
    }

    fn key_len_at(&self, offset: usize) -> usize {
        read_u16(self.bytes(), offset) as usize
    }

    fn entry_len_at(&self, offset: usize) -> usize {
        let key_len = self.key_len_at(offset);
        if self.is_leaf() {
            let count = read_u16(self.bytes(), offset + 2 + key_len) as usize;
            4 + key_len + count * Rid::ENCODED_SIZE
        } else {
            10 + key_len
        }
    }

    pub fn raw_key_at(&self, index: usize) -> &[u8] {
        let offset = self.entry_offset(index);
        let key_len = self.key_len_at(offset);
        &self.bytes()[offset + 2..offset + 2 + key_len]
    }

    pub fn leaf_entry(&self, index: usize) -> LeafEntry {
        debug_assert!(self.is_leaf());
        let offset = self.entry_offset(index);
        let key_len = self.key_len_at(offset);
        LeafEntry {
            raw_key: self.bytes()[offset + 2..offset + 2 + key_len].to_vec(),
            values: self.values(index),
        }
    }

    pub fn internal_entry(&self, index: usize) -> InternalEntry {
        debug_assert!(!self.is_leaf());
        let offset = self.entry_offset(index);
        let key_len = self.key_len_at(offset);
        InternalEntry {
            raw_key: self.bytes()[offset + 2..offset + 2 + key_len].to_vec(),
            left: read_u32(self.bytes(), offset + 2 + key_len),
            right: read_u32(self.bytes(), offset + 6 + key_len),
        }
    }

    /// The RID multiset of a leaf entry, in insertion order.
    pub fn values(&self, index: usize) -> Vec<Rid> {
        debug_assert!(self.is_leaf());
        let offset = self.entry_offset(index);
        let key_len = self.key_len_at(offset);
        let count = read_u16(self.bytes(), offset + 2 + key_len) as usize;
        let mut values = Vec::with_capacity(count);
        let mut at = offset + 4 + key_len;
        for _ in 0..count {
            values.push(Rid::decode(&self.bytes()[at..at + Rid::ENCODED_SIZE]));
            at += Rid::ENCODED_SIZE;
        }
        values
    }

    pub fn left_child(&self, index: usize) -> PageIndex {
        self.internal_entry(index).left
    }

    pub fn right_child(&self, index: usize) -> PageIndex {
        self.internal_entry(index).right
    }

    /// Binary search over the offset table. Returns the exact item index,
    /// or `-(insertion_point) - 1` when the key is absent.
    pub fn find(&self, codec: &KeyCodec, key: &IndexKey) -> BrambleResult<isize> {
        let mut low = 0isize;
        let mut high = self.size() as isize - 1;
        while low <= high {
            let mid = (low + high) / 2;
            let mid_key = codec.deserialize(self.raw_key_at(mid as usize))?;
            match codec.compare(&mid_key, key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid - 1,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Ok(-low - 1)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Bucket<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.page.as_mut()
    }

    /// Reset the page to an empty bucket of the given kind. Sibling links
    /// and the tree size are cleared as well.
    pub fn init(&mut self, is_leaf: bool) {
        let bytes = self.bytes_mut();
        bytes[IS_LEAF_OFFSET] = is_leaf as u8;
        write_u16(bytes, SIZE_OFFSET, 0);
        write_u32(bytes, LEFT_SIBLING_OFFSET, NIL_PAGE);
        write_u32(bytes, RIGHT_SIBLING_OFFSET, NIL_PAGE);
        write_u64(bytes, TREE_SIZE_OFFSET, 0);
        write_u16(bytes, FREE_PTR_OFFSET, PAGE_SIZE as u16);
    }

    pub fn set_left_sibling(&mut self, page_index: PageIndex) {
        write_u32(self.bytes_mut(), LEFT_SIBLING_OFFSET, page_index);
    }

    pub fn set_right_sibling(&mut self, page_index: PageIndex) {
        write_u32(self.bytes_mut(), RIGHT_SIBLING_OFFSET, page_index);
    }

    pub fn set_tree_size(&mut self, size: u64) {
        write_u64(self.bytes_mut(), TREE_SIZE_OFFSET, size);
    }

    fn set_size(&mut self, size: usize) {
        write_u16(self.bytes_mut(), SIZE_OFFSET, size as u16);
    }

    fn set_free_ptr(&mut self, free_ptr: usize) {
        write_u16(self.bytes_mut(), FREE_PTR_OFFSET, free_ptr as u16);
    }

    /// Copy the entry bytes into the heap and return their offset.
    fn push_entry_bytes(&mut self, entry: &[u8]) -> usize {
        let offset = self.free_ptr() - entry.len();
        self.bytes_mut()[offset..offset + entry.len()].copy_from_slice(entry);
        self.set_free_ptr(offset);
        offset
    }

    fn insert_position(&mut self, index: usize, offset: usize) {
        let size = self.size();
        debug_assert!(index <= size);
        let start = POSITIONS_OFFSET + 2 * index;
        let end = POSITIONS_OFFSET + 2 * size;
        self.bytes_mut().copy_within(start..end, start + 2);
        write_u16(self.bytes_mut(), start, offset as u16);
        self.set_size(size + 1);
    }

    fn remove_position(&mut self, index: usize) {
        let size = self.size();
        debug_assert!(index < size);
        let start = POSITIONS_OFFSET + 2 * index;
        let end = POSITIONS_OFFSET + 2 * size;
        self.bytes_mut().copy_within(start + 2..end, start);
        self.set_size(size - 1);
    }

    /// Rewrite the heap keeping only live entries, reclaiming dead bytes
    /// left behind by removals and in-place growth.
    fn compact(&mut self) {
        let size = self.size();
        let mut entries = Vec::with_capacity(size);
        for index in 0..size {
            let offset = self.entry_offset(index);
            let len = self.entry_len_at(offset);
            entries.push(self.bytes()[offset..offset + len].to_vec());
        }
        self.set_free_ptr(PAGE_SIZE);
        for (index, entry) in entries.iter().enumerate() {
            let offset = self.push_entry_bytes(entry);
            write_u16(self.bytes_mut(), POSITIONS_OFFSET + 2 * index, offset as u16);
        }
    }

    /// Make room for `needed` more heap-plus-table bytes, compacting once
    /// if required. `false` means the page genuinely cannot fit them.
    fn ensure_fit(&mut self, needed: usize) -> bool {
        if self.free_space() >= needed {
            return true;
        }
        self.compact();
        self.free_space() >= needed
    }

    /// Insert a brand-new leaf entry holding a single value. `false` when
    /// the page is full and must be split.
    pub fn add_new_leaf_entry(&mut self, index: usize, raw_key: &[u8], rid: Rid) -> bool {
        debug_assert!(self.is_leaf());
        let entry = encode_leaf_entry(raw_key, &[rid]);
        if !self.ensure_fit(entry.len() + 2) {
            return false;
        }
        let offset = self.push_entry_bytes(&entry);
        self.insert_position(index, offset);
        true
    }

    /// Append one more value to an existing leaf entry's multiset.
    pub fn append_leaf_value(&mut self, index: usize, rid: Rid) -> bool {
        debug_assert!(self.is_leaf());
        let old_len = self.entry_len_at(self.entry_offset(index));
        // The grown entry is rewritten at the heap top; the old bytes die.
        if !self.ensure_fit(old_len + Rid::ENCODED_SIZE) {
            return false;
        }
        let offset = self.entry_offset(index);
        let len = self.entry_len_at(offset);
        let key_len = self.key_len_at(offset);
        let count = read_u16(self.bytes(), offset + 2 + key_len);

        let mut entry = self.bytes()[offset..offset + len].to_vec();
        write_u16(&mut entry, 2 + key_len, count + 1);
        let mut buf = [0u8; Rid::ENCODED_SIZE];
        rid.encode_into(&mut buf);
        entry.extend_from_slice(&buf);

        let new_offset = self.push_entry_bytes(&entry);
        write_u16(self.bytes_mut(), POSITIONS_OFFSET + 2 * index, new_offset as u16);
        true
    }

    /// Insert an internal entry. With `update_neighbors` the adjacent
    /// entries are rewired so the shared-child-pointer invariant holds.
    pub fn add_internal_entry(
        &mut self,
        index: usize,
        raw_key: &[u8],
        left: PageIndex,
        right: PageIndex,
        update_neighbors: bool,
    ) -> bool {
        debug_assert!(!self.is_leaf());
        let entry = encode_internal_entry(raw_key, left, right);
        if !self.ensure_fit(entry.len() + 2) {
            return false;
        }
        let offset = self.push_entry_bytes(&entry);
        self.insert_position(index, offset);

        if update_neighbors {
            if index > 0 {
                let prev = self.entry_offset(index - 1);
                let prev_key_len = self.key_len_at(prev);
                write_u32(self.bytes_mut(), prev + 6 + prev_key_len, left);
            }
            if index + 1 < self.size() {
                let next = self.entry_offset(index + 1);
                let next_key_len = self.key_len_at(next);
                write_u32(self.bytes_mut(), next + 2 + next_key_len, right);
            }
        }
        true
    }

    /// Remove one occurrence of `rid` from the leaf entry's multiset; the
    /// whole entry goes away when its multiset becomes empty. `false` when
    /// the value is not present.
    pub fn remove_value(&mut self, index: usize, rid: Rid) -> bool {
        debug_assert!(self.is_leaf());
        let offset = self.entry_offset(index);
        let key_len = self.key_len_at(offset);
        let count_offset = offset + 2 + key_len;
        let count = read_u16(self.bytes(), count_offset) as usize;
        let values_offset = count_offset + 2;

        let mut found = None;
        for position in 0..count {
            let at = values_offset + position * Rid::ENCODED_SIZE;
            if Rid::decode(&self.bytes()[at..at + Rid::ENCODED_SIZE]) == rid {
                found = Some(position);
                break;
            }
        }
        let Some(position) = found else {
            return false;
        };

        if count == 1 {
            self.remove_position(index);
        } else {
            let start = values_offset + position * Rid::ENCODED_SIZE;
            let end = values_offset + count * Rid::ENCODED_SIZE;
            self.bytes_mut()
                .copy_within(start + Rid::ENCODED_SIZE..end, start);
            write_u16(self.bytes_mut(), count_offset, (count - 1) as u16);
        }
        true
    }

    /// Keep only entries `[0, to)`; used by the splitter after the upper
    /// half moved to the new right page.
    pub fn shrink(&mut self, to: usize) {
        let is_leaf = self.is_leaf();
        let kept: Vec<BucketEntry> = (0..to)
            .map(|index| {
                if is_leaf {
                    BucketEntry::Leaf(self.leaf_entry(index))
                } else {
                    BucketEntry::Internal(self.internal_entry(index))
                }
            })
            .collect();
        let left_sibling = self.left_sibling();
        let right_sibling = self.right_sibling();
        let tree_size = self.tree_size();

        self.init(is_leaf);
        self.set_left_sibling(left_sibling);
        self.set_right_sibling(right_sibling);
        self.set_tree_size(tree_size);
        self.add_all(&kept);
    }

    /// Bulk-load presorted entries into an empty bucket.
    pub fn add_all(&mut self, entries: &[BucketEntry]) {
        debug_assert!(self.is_empty());
        for (index, entry) in entries.iter().enumerate() {
            let bytes = match entry {
                BucketEntry::Leaf(leaf) => encode_leaf_entry(&leaf.raw_key, &leaf.values),
                BucketEntry::Internal(internal) => {
                    encode_internal_entry(&internal.raw_key, internal.left, internal.right)
                }
            };
            debug_assert!(self.free_space() >= bytes.len() + 2);
            let offset = self.push_entry_bytes(&bytes);
            write_u16(self.bytes_mut(), POSITIONS_OFFSET + 2 * index, offset as u16);
            self.set_size(index + 1);
        }
    }
}
