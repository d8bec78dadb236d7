mod bucket;
mod cursor;
mod key;
mod multi_value_tree;
mod null_bucket;

pub use cursor::{KeyCursor, TreeCursor};
pub use key::{Encryption, IndexKey, KeyCodec, KeyItem, KeyType};
pub use multi_value_tree::{
    MultiValueTree, TreeOptions, DATA_FILE_EXTENSION, NULL_FILE_EXTENSION,
};

/// Record identifier: position of a record inside a cluster. Compared by
/// identity only; the tree never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rid {
    pub cluster_id: u32,
    pub cluster_position: u64,
}

impl Rid {
    pub const ENCODED_SIZE: usize = 12;

    pub fn new(cluster_id: u32, cluster_position: u64) -> Self {
        Rid {
            cluster_id,
            cluster_position,
        }
    }

    pub(crate) fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.cluster_id.to_be_bytes());
        buf[4..12].copy_from_slice(&self.cluster_position.to_be_bytes());
    }

    pub(crate) fn decode(buf: &[u8]) -> Rid {
        Rid {
            cluster_id: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            cluster_position: u64::from_be_bytes(buf[4..12].try_into().unwrap()),
        }
    }
}
