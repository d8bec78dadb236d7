use crate::buffer::PAGE_SIZE;
use crate::tree::Rid;

// Single-page multiset of values bound to the null key, kept in its own
// one-page file so the tree proper never sees a null key.
const COUNT_OFFSET: usize = 0;
const VALUES_OFFSET: usize = 2;

const MAX_VALUES: usize = (PAGE_SIZE - VALUES_OFFSET) / Rid::ENCODED_SIZE;

pub(crate) struct NullBucket<B> {
    page: B,
}

impl<B: AsRef<[u8]>> NullBucket<B> {
    pub fn new(page: B) -> Self {
        NullBucket { page }
    }

    fn bytes(&self) -> &[u8] {
        self.page.as_ref()
    }

    fn count(&self) -> usize {
        u16::from_be_bytes(self.bytes()[COUNT_OFFSET..COUNT_OFFSET + 2].try_into().unwrap())
            as usize
    }

    pub fn values(&self) -> Vec<Rid> {
        let count = self.count();
        let mut values = Vec::with_capacity(count);
        for position in 0..count {
            let at = VALUES_OFFSET + position * Rid::ENCODED_SIZE;
            values.push(Rid::decode(&self.bytes()[at..at + Rid::ENCODED_SIZE]));
        }
        values
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> NullBucket<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.page.as_mut()
    }

    fn set_count(&mut self, count: usize) {
        self.bytes_mut()[COUNT_OFFSET..COUNT_OFFSET + 2]
            .copy_from_slice(&(count as u16).to_be_bytes());
    }

    /// Append one value. `false` when the page is out of slots.
    pub fn add_value(&mut self, rid: Rid) -> bool {
        let count = self.count();
        if count >= MAX_VALUES {
            return false;
        }
        let at = VALUES_OFFSET + count * Rid::ENCODED_SIZE;
        rid.encode_into(&mut self.bytes_mut()[at..at + Rid::ENCODED_SIZE]);
        self.set_count(count + 1);
        true
    }

    /// Remove one occurrence of `rid`, preserving the order of the rest.
    pub fn remove_value(&mut self, rid: Rid) -> bool {
        let count = self.count();
        for position in 0..count {
            let at = VALUES_OFFSET + position * Rid::ENCODED_SIZE;
            if Rid::decode(&self.bytes()[at..at + Rid::ENCODED_SIZE]) == rid {
                let end = VALUES_OFFSET + count * Rid::ENCODED_SIZE;
                self.bytes_mut().copy_within(at + Rid::ENCODED_SIZE..end, at);
                self.set_count(count - 1);
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiset_semantics() {
        let mut bucket = NullBucket::new(vec![0u8; PAGE_SIZE].into_boxed_slice());
        assert!(bucket.add_value(Rid::new(1, 1)));
        assert!(bucket.add_value(Rid::new(2, 2)));
        assert!(bucket.add_value(Rid::new(1, 1)));
        assert_eq!(
            bucket.values(),
            vec![Rid::new(1, 1), Rid::new(2, 2), Rid::new(1, 1)]
        );

        assert!(bucket.remove_value(Rid::new(1, 1)));
        assert_eq!(bucket.values(), vec![Rid::new(2, 2), Rid::new(1, 1)]);
        assert!(!bucket.remove_value(Rid::new(3, 3)));
    }

    #[test]
    fn capacity_is_bounded_by_the_page() {
        let mut bucket = NullBucket::new(vec![0u8; PAGE_SIZE].into_boxed_slice());
        for position in 0..MAX_VALUES {
            assert!(bucket.add_value(Rid::new(0, position as u64)));
        }
        assert!(!bucket.add_value(Rid::new(0, 0)));
    }
}
