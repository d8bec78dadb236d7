use std::collections::{HashSet, VecDeque};

use crate::buffer::FrameId;

/// Least-recently-used victim selection over the pool's frames. Only frames
/// explicitly marked evictable (pin count zero) are eligible.
#[derive(Debug, Default)]
pub struct LruReplacer {
    queue: VecDeque<FrameId>,
    evictable: HashSet<FrameId>,
}

impl LruReplacer {
    pub fn new() -> Self {
        LruReplacer::default()
    }

    pub fn record_access(&mut self, frame_id: FrameId) {
        self.queue.retain(|f| *f != frame_id);
        self.queue.push_back(frame_id);
    }

    pub fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if evictable {
            self.evictable.insert(frame_id);
        } else {
            self.evictable.remove(&frame_id);
        }
    }

    pub fn evict(&mut self) -> Option<FrameId> {
        let pos = self
            .queue
            .iter()
            .position(|f| self.evictable.contains(f))?;
        let frame_id = self.queue.remove(pos).unwrap();
        self.evictable.remove(&frame_id);
        Some(frame_id)
    }

    pub fn remove(&mut self, frame_id: FrameId) {
        self.queue.retain(|f| *f != frame_id);
        self.evictable.remove(&frame_id);
    }
}
