//! Target id allocation.
//!
//! Ids from the target cache are even and ids from the sync engine (limbo
//! resolution) are odd, so the two never collide.

use crate::types::TargetId;

const CACHE_GENERATOR_ID: i32 = 0;
const SYNC_ENGINE_GENERATOR_ID: i32 = 1;

/// Generates increasing target ids within one parity class.
#[derive(Debug, Clone)]
pub struct TargetIdGenerator {
    next_id: i32,
}

impl TargetIdGenerator {
    /// Generator for target-cache targets: 2, 4, 6, ...
    #[must_use]
    pub fn for_target_cache() -> Self {
        Self::starting_after(TargetId(CACHE_GENERATOR_ID))
    }

    /// Generator for sync-engine targets: 1, 3, 5, ...
    #[must_use]
    pub fn for_sync_engine() -> Self {
        Self {
            next_id: SYNC_ENGINE_GENERATOR_ID,
        }
    }

    /// Generator whose first id is the next id of the same parity after `id`.
    #[must_use]
    pub fn starting_after(id: TargetId) -> Self {
        Self { next_id: id.0 + 2 }
    }

    /// Returns the next id.
    pub fn next_id(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        TargetId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_classes() {
        let mut cache = TargetIdGenerator::for_target_cache();
        assert_eq!(cache.next_id(), TargetId(2));
        assert_eq!(cache.next_id(), TargetId(4));

        let mut sync = TargetIdGenerator::for_sync_engine();
        assert_eq!(sync.next_id(), TargetId(1));
        assert_eq!(sync.next_id(), TargetId(3));

        let mut resumed = TargetIdGenerator::starting_after(TargetId(8));
        assert_eq!(resumed.next_id(), TargetId(10));
    }
}
