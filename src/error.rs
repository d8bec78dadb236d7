use thiserror::Error;

pub type BrambleResult<T, E = BrambleError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum BrambleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Wal codec error: {0}")]
    WalCodec(#[from] bincode::Error),

    #[error("Key size {size} is more than allowed {max}, operation was canceled")]
    KeyTooBig { size: usize, max: usize },

    #[error("Null keys are not supported")]
    NullKeysNotSupported,

    #[error("Corrupted index: {0}. You should rebuild the index related to the given query")]
    Corrupted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Error in index `{name}`: {source}")]
    Tree {
        name: String,
        #[source]
        source: Box<BrambleError>,
    },
}

impl BrambleError {
    /// Wrap a failure with the name of the tree it happened in.
    pub fn tree(name: impl Into<String>, source: BrambleError) -> Self {
        BrambleError::Tree {
            name: name.into(),
            source: Box::new(source),
        }
    }
}
