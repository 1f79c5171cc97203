//! Sliding-window replay filter (RFC 6479)
//!
//! A ring of 64-bit blocks. Moving the window forward only clears the blocks
//! that were skipped, so validation is O(1) amortised regardless of how far
//! the counter jumps.

const BLOCK_BIT_LOG: u64 = 6;
const BLOCK_BITS: u64 = 1 << BLOCK_BIT_LOG;
const RING_BLOCKS: u64 = 1 << 7;
const BLOCK_MASK: u64 = RING_BLOCKS - 1;
const BIT_MASK: u64 = BLOCK_BITS - 1;

/// Number of counters behind the highest one that are still tracked
pub const WINDOW_SIZE: u64 = (RING_BLOCKS - 1) * BLOCK_BITS;

#[derive(Debug, Clone)]
pub struct ReplayFilter {
    last: u64,
    ring: [u64; RING_BLOCKS as usize],
}

impl Default for ReplayFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayFilter {
    pub fn new() -> Self {
        Self {
            last: 0,
            ring: [0; RING_BLOCKS as usize],
        }
    }

    /// Accept `counter` if it is below `limit`, inside the window and unseen.
    ///
    /// Accepting marks the counter as seen.
    pub fn validate_counter(&mut self, counter: u64, limit: u64) -> bool {
        if counter >= limit {
            return false;
        }

        let mut index_block = counter >> BLOCK_BIT_LOG;
        if counter > self.last {
            let current = self.last >> BLOCK_BIT_LOG;
            let diff = (index_block - current).min(RING_BLOCKS);
            for i in current + 1..=current + diff {
                self.ring[(i & BLOCK_MASK) as usize] = 0;
            }
            self.last = counter;
        } else if self.last - counter > WINDOW_SIZE {
            return false;
        }

        index_block &= BLOCK_MASK;
        let bit = 1u64 << (counter & BIT_MASK);
        let old = self.ring[index_block as usize];
        self.ring[index_block as usize] = old | bit;
        old & bit == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u64 = crate::protocol::constants::REJECT_AFTER_MESSAGES;

    #[test]
    fn test_monotone_sequence_accepted_once() {
        let mut filter = ReplayFilter::new();
        for counter in 0..1000 {
            assert!(filter.validate_counter(counter, LIMIT), "counter {counter}");
        }
        for counter in 0..1000 {
            assert!(!filter.validate_counter(counter, LIMIT), "replayed {counter}");
        }
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut filter = ReplayFilter::new();
        assert!(filter.validate_counter(100, LIMIT));
        assert!(filter.validate_counter(50, LIMIT));
        assert!(filter.validate_counter(99, LIMIT));
        assert!(!filter.validate_counter(50, LIMIT));
        assert!(filter.validate_counter(0, LIMIT));
    }

    #[test]
    fn test_too_old_rejected() {
        let mut filter = ReplayFilter::new();
        let high = WINDOW_SIZE + 10;
        assert!(filter.validate_counter(high, LIMIT));
        assert!(!filter.validate_counter(9, LIMIT));
        assert!(filter.validate_counter(10, LIMIT));
        assert!(!filter.validate_counter(10, LIMIT));
    }

    #[test]
    fn test_large_jump_clears_ring() {
        let mut filter = ReplayFilter::new();
        for counter in 0..64 {
            assert!(filter.validate_counter(counter, LIMIT));
        }
        // Same ring slot as counter 5, a full ring later
        let far = 5 + RING_BLOCKS * BLOCK_BITS * 3;
        assert!(filter.validate_counter(far, LIMIT));
        assert!(filter.validate_counter(far - 64, LIMIT));
        assert!(!filter.validate_counter(far, LIMIT));
    }

    #[test]
    fn test_limit() {
        let mut filter = ReplayFilter::new();
        assert!(!filter.validate_counter(LIMIT, LIMIT));
        assert!(filter.validate_counter(LIMIT - 1, LIMIT));
        assert!(!filter.validate_counter(10, 10));
    }
}
