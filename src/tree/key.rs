use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{BrambleError, BrambleResult};

/// One component of an index key. The two boundary sentinels compare below
/// and above every real item and are only ever used in query keys; they
/// cannot be stored. Variant order carries the comparison semantics, so the
/// derived `Ord` is the index order: `AlwaysLess` first, then values ranked
/// by type, then `AlwaysGreater`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyItem {
    AlwaysLess,
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    AlwaysGreater,
}

/// Declared type of one key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Int,
    Str,
    Bytes,
}

impl KeyType {
    fn matches(&self, item: &KeyItem) -> bool {
        matches!(
            (self, item),
            (KeyType::Int, KeyItem::Int(_))
                | (KeyType::Str, KeyItem::Str(_))
                | (KeyType::Bytes, KeyItem::Bytes(_))
                // Sentinels stand in for any column type.
                | (_, KeyItem::AlwaysLess)
                | (_, KeyItem::AlwaysGreater)
        )
    }
}

/// An index key: an ordered list of items compared lexicographically.
/// Single-column keys are one-item keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey {
    items: Vec<KeyItem>,
}

impl IndexKey {
    pub fn new(items: Vec<KeyItem>) -> Self {
        IndexKey { items }
    }

    pub fn int(value: i64) -> Self {
        IndexKey {
            items: vec![KeyItem::Int(value)],
        }
    }

    pub fn str(value: impl Into<String>) -> Self {
        IndexKey {
            items: vec![KeyItem::Str(value.into())],
        }
    }

    pub fn items(&self) -> &[KeyItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<i64> for IndexKey {
    fn from(value: i64) -> Self {
        IndexKey::int(value)
    }
}

impl From<&str> for IndexKey {
    fn from(value: &str) -> Self {
        IndexKey::str(value)
    }
}

/// Symmetric key encryption supplied by the embedding system. `encrypt`
/// may change the payload length; `decrypt` must invert it exactly.
pub trait Encryption: Send + Sync + std::fmt::Debug {
    fn encrypt(&self, data: &[u8]) -> Vec<u8>;
    fn decrypt(&self, data: &[u8]) -> BrambleResult<Vec<u8>>;
}

/// How a partial composite key is extended before a boundary search:
/// pad with the smallest or the biggest matching key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartialSearchMode {
    LowestBoundary,
    HighestBoundary,
}

const ITEM_TAG_INT: u8 = 0;
const ITEM_TAG_STR: u8 = 1;
const ITEM_TAG_BYTES: u8 = 2;

/// Serializes typed keys to their on-page form and back, enforcing the key
/// size limit and wrapping the payload in encryption when configured.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    key_types: Option<Vec<KeyType>>,
    key_size: usize,
    encryption: Option<Arc<dyn Encryption>>,
    max_key_size: usize,
}

impl KeyCodec {
    pub fn new(
        key_types: Option<Vec<KeyType>>,
        key_size: usize,
        encryption: Option<Arc<dyn Encryption>>,
        max_key_size: usize,
    ) -> Self {
        KeyCodec {
            key_types,
            key_size,
            encryption,
            max_key_size,
        }
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Canonicalize a query key: check arity and column types against the
    /// declared key shape.
    pub fn preprocess(&self, key: &IndexKey) -> BrambleResult<IndexKey> {
        if key.is_empty() {
            return Err(BrambleError::Internal("empty index key".to_string()));
        }
        if key.len() > self.key_size {
            return Err(BrambleError::Internal(format!(
                "key has {} items but the index holds {}",
                key.len(),
                self.key_size
            )));
        }
        if let Some(key_types) = &self.key_types {
            for (item, key_type) in key.items().iter().zip(key_types.iter()) {
                if !key_type.matches(item) {
                    return Err(BrambleError::Internal(format!(
                        "key item {:?} does not match declared type {:?}",
                        item, key_type
                    )));
                }
            }
        }
        Ok(key.clone())
    }

    /// Serialized on-page form; `[u32 length][ciphertext]` when encryption
    /// is configured. Fails with `KeyTooBig` past the configured limit.
    pub fn serialize(&self, key: &IndexKey) -> BrambleResult<Vec<u8>> {
        let mut plain = Vec::new();
        plain.push(key.len() as u8);
        for item in key.items() {
            match item {
                KeyItem::Int(value) => {
                    plain.push(ITEM_TAG_INT);
                    plain.extend_from_slice(&value.to_be_bytes());
                }
                KeyItem::Str(value) => {
                    let bytes = value.as_bytes();
                    if bytes.len() > u16::MAX as usize {
                        return Err(BrambleError::KeyTooBig {
                            size: bytes.len(),
                            max: self.max_key_size,
                        });
                    }
                    plain.push(ITEM_TAG_STR);
                    plain.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                    plain.extend_from_slice(bytes);
                }
                KeyItem::Bytes(value) => {
                    if value.len() > u16::MAX as usize {
                        return Err(BrambleError::KeyTooBig {
                            size: value.len(),
                            max: self.max_key_size,
                        });
                    }
                    plain.push(ITEM_TAG_BYTES);
                    plain.extend_from_slice(&(value.len() as u16).to_be_bytes());
                    plain.extend_from_slice(value);
                }
                KeyItem::AlwaysLess | KeyItem::AlwaysGreater => {
                    return Err(BrambleError::Internal(
                        "boundary sentinels cannot be stored".to_string(),
                    ));
                }
            }
        }

        let raw = match &self.encryption {
            None => plain,
            Some(encryption) => {
                let encrypted = encryption.encrypt(&plain);
                let mut out = Vec::with_capacity(4 + encrypted.len());
                out.extend_from_slice(&(encrypted.len() as u32).to_be_bytes());
                out.extend_from_slice(&encrypted);
                out
            }
        };

        if raw.len() > self.max_key_size {
            return Err(BrambleError::KeyTooBig {
                size: raw.len(),
                max: self.max_key_size,
            });
        }
        Ok(raw)
    }

    pub fn deserialize(&self, raw: &[u8]) -> BrambleResult<IndexKey> {
        let plain;
        let bytes = match &self.encryption {
            None => raw,
            Some(encryption) => {
                if raw.len() < 4 {
                    return Err(BrambleError::Corrupted(
                        "encrypted key shorter than its length prefix".to_string(),
                    ));
                }
                let len = u32::from_be_bytes(raw[0..4].try_into().unwrap()) as usize;
                if raw.len() < 4 + len {
                    return Err(BrambleError::Corrupted(
                        "encrypted key is truncated".to_string(),
                    ));
                }
                plain = encryption.decrypt(&raw[4..4 + len])?;
                &plain[..]
            }
        };

        let corrupted = || BrambleError::Corrupted("malformed key payload".to_string());
        let count = *bytes.first().ok_or_else(corrupted)? as usize;
        let mut offset = 1usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = *bytes.get(offset).ok_or_else(corrupted)?;
            offset += 1;
            match tag {
                ITEM_TAG_INT => {
                    let end = offset + 8;
                    let slice = bytes.get(offset..end).ok_or_else(corrupted)?;
                    items.push(KeyItem::Int(i64::from_be_bytes(slice.try_into().unwrap())));
                    offset = end;
                }
                ITEM_TAG_STR | ITEM_TAG_BYTES => {
                    let len_slice = bytes.get(offset..offset + 2).ok_or_else(corrupted)?;
                    let len = u16::from_be_bytes(len_slice.try_into().unwrap()) as usize;
                    offset += 2;
                    let payload = bytes.get(offset..offset + len).ok_or_else(corrupted)?;
                    offset += len;
                    if tag == ITEM_TAG_STR {
                        let text = String::from_utf8(payload.to_vec()).map_err(|_| corrupted())?;
                        items.push(KeyItem::Str(text));
                    } else {
                        items.push(KeyItem::Bytes(payload.to_vec()));
                    }
                }
                _ => return Err(corrupted()),
            }
        }
        Ok(IndexKey::new(items))
    }

    pub fn compare(&self, a: &IndexKey, b: &IndexKey) -> Ordering {
        a.cmp(b)
    }

    /// Pad a partial composite key with boundary sentinels so a prefix
    /// query realizes the intended half-open interval.
    pub(crate) fn enhance_composite_key(
        &self,
        key: &IndexKey,
        mode: PartialSearchMode,
    ) -> IndexKey {
        if self.key_size == 1 || key.len() >= self.key_size {
            return key.clone();
        }
        let filler = match mode {
            PartialSearchMode::HighestBoundary => KeyItem::AlwaysGreater,
            PartialSearchMode::LowestBoundary => KeyItem::AlwaysLess,
        };
        let mut items = key.items().to_vec();
        items.resize(self.key_size, filler);
        IndexKey::new(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_codec() -> KeyCodec {
        KeyCodec::new(None, 1, None, 1024)
    }

    #[test]
    fn items_order_with_sentinels() {
        assert!(KeyItem::AlwaysLess < KeyItem::Int(i64::MIN));
        assert!(KeyItem::AlwaysGreater > KeyItem::Bytes(vec![0xFF; 8]));
        assert!(KeyItem::Int(10) < KeyItem::Int(20));
        assert!(KeyItem::Str("a".into()) < KeyItem::Str("b".into()));
    }

    #[test]
    fn composite_keys_compare_lexicographically() {
        let a = IndexKey::new(vec![KeyItem::Int(1), KeyItem::Str("b".into())]);
        let b = IndexKey::new(vec![KeyItem::Int(1), KeyItem::Str("c".into())]);
        let c = IndexKey::new(vec![KeyItem::Int(2), KeyItem::Str("a".into())]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn serialize_round_trip() {
        let codec = KeyCodec::new(None, 2, None, 1024);
        let key = IndexKey::new(vec![KeyItem::Int(-42), KeyItem::Str("hello".into())]);
        let raw = codec.serialize(&key).unwrap();
        assert_eq!(codec.deserialize(&raw).unwrap(), key);
    }

    #[test]
    fn oversized_key_is_rejected() {
        let codec = KeyCodec::new(None, 1, None, 16);
        let key = IndexKey::str("a".repeat(64));
        match codec.serialize(&key) {
            Err(BrambleError::KeyTooBig { size, max }) => {
                assert!(size > max);
            }
            other => panic!("expected KeyTooBig, got {:?}", other),
        }
    }

    #[test]
    fn sentinels_are_not_serializable() {
        let codec = plain_codec();
        let key = IndexKey::new(vec![KeyItem::AlwaysGreater]);
        assert!(codec.serialize(&key).is_err());
    }

    #[derive(Debug)]
    struct XorEncryption(u8);

    impl Encryption for XorEncryption {
        fn encrypt(&self, data: &[u8]) -> Vec<u8> {
            data.iter().map(|b| b ^ self.0).collect()
        }

        fn decrypt(&self, data: &[u8]) -> BrambleResult<Vec<u8>> {
            Ok(data.iter().map(|b| b ^ self.0).collect())
        }
    }

    #[test]
    fn encrypted_form_has_length_prefix_and_round_trips() {
        let codec = KeyCodec::new(None, 1, Some(Arc::new(XorEncryption(0x5A))), 1024);
        let key = IndexKey::str("secret");
        let raw = codec.serialize(&key).unwrap();
        let len = u32::from_be_bytes(raw[0..4].try_into().unwrap()) as usize;
        assert_eq!(raw.len(), 4 + len);
        assert_eq!(codec.deserialize(&raw).unwrap(), key);
    }

    #[test]
    fn partial_key_padding_respects_mode() {
        let codec = KeyCodec::new(None, 3, None, 1024);
        let partial = IndexKey::int(7);
        let low = codec.enhance_composite_key(&partial, PartialSearchMode::LowestBoundary);
        let high = codec.enhance_composite_key(&partial, PartialSearchMode::HighestBoundary);
        assert_eq!(low.items()[1..], [KeyItem::AlwaysLess, KeyItem::AlwaysLess]);
        assert_eq!(
            high.items()[1..],
            [KeyItem::AlwaysGreater, KeyItem::AlwaysGreater]
        );
        // Padded bounds bracket every real 3-part key sharing the prefix.
        let real = IndexKey::new(vec![KeyItem::Int(7), KeyItem::Int(0), KeyItem::Int(0)]);
        assert!(low < real && real < high);
    }

    #[test]
    fn preprocess_checks_declared_types() {
        let codec = KeyCodec::new(Some(vec![KeyType::Int, KeyType::Str]), 2, None, 1024);
        assert!(codec
            .preprocess(&IndexKey::new(vec![
                KeyItem::Int(1),
                KeyItem::Str("x".into())
            ]))
            .is_ok());
        assert!(codec
            .preprocess(&IndexKey::new(vec![
                KeyItem::Str("x".into()),
                KeyItem::Int(1)
            ]))
            .is_err());
        assert!(codec
            .preprocess(&IndexKey::new(vec![
                KeyItem::Int(1),
                KeyItem::Str("x".into()),
                KeyItem::Int(2)
            ]))
            .is_err());
    }
}
