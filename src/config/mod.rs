#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    /// Largest serialized (and possibly encrypted) key accepted by `put`.
    pub max_key_size: usize,
    /// Search paths longer than this mean the tree is corrupted.
    pub max_depth: usize,
    /// Upper clamp for the per-batch cursor prefetch.
    pub cursor_prefetch_size: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            max_key_size: 1024,
            max_depth: 64,
            cursor_prefetch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    pub pool_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig { pool_size: 1024 }
    }
}
