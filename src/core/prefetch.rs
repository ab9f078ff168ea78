//! Prefetch heuristic
//!
//! Decides whether the chunk after the current one should be requested
//! ahead of time. During playback the answer is always yes. Otherwise
//! prefetch is only worth it when the user is scanning forward: the recent
//! request history must be strictly increasing, the current frame must
//! continue that trend and sit in the second half of its chunk, and the
//! next chunk must not be decoded yet. Random seeks and backward scrubbing
//! never trigger it.
//!
//! Frames are identified by segment index (position in the job's frame list).

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct PrefetchAnalyzer {
    chunk_size: usize,
    capacity: usize,
    requested: VecDeque<usize>,
}

impl PrefetchAnalyzer {
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let capacity = chunk_size.div_ceil(2);
        Self {
            chunk_size,
            capacity,
            requested: VecDeque::with_capacity(capacity),
        }
    }

    /// Maximum number of remembered requests
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn history(&self) -> impl Iterator<Item = usize> + '_ {
        self.requested.iter().copied()
    }

    fn is_increasing(&self) -> bool {
        self.requested
            .iter()
            .zip(self.requested.iter().skip(1))
            .all(|(prev, next)| next > prev)
    }

    pub fn should_prefetch_next(
        &mut self,
        current: usize,
        is_playing: bool,
        is_chunk_cached: impl Fn(usize) -> bool,
    ) -> bool {
        if is_playing {
            return true;
        }

        let Some(&last) = self.requested.back() else {
            return false;
        };
        if !self.is_increasing() || current <= last {
            return false;
        }

        let past_middle = current % self.chunk_size >= self.chunk_size / 2;
        let next_chunk = current / self.chunk_size + 1;
        if past_middle && !is_chunk_cached(next_chunk) {
            self.requested.clear();
            return true;
        }
        false
    }

    /// Remember a request. Repeating a frame moves it to the end; going over
    /// capacity forgets the oldest.
    pub fn add_requested(&mut self, frame: usize) {
        if let Some(pos) = self.requested.iter().position(|f| *f == frame) {
            self.requested.remove(pos);
        }
        self.requested.push_back(frame);
        while self.requested.len() > self.capacity {
            self.requested.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer_with(chunk_size: usize, frames: &[usize]) -> PrefetchAnalyzer {
        let mut analyzer = PrefetchAnalyzer::new(chunk_size);
        for frame in frames {
            analyzer.add_requested(*frame);
        }
        analyzer
    }

    #[test]
    fn test_playing_always_prefetches() {
        let mut analyzer = PrefetchAnalyzer::new(8);
        assert!(analyzer.should_prefetch_next(0, true, |_| true));
    }

    #[test]
    fn test_forward_scan_past_middle() {
        let mut analyzer = analyzer_with(10, &[3, 4, 5]);
        assert!(analyzer.should_prefetch_next(6, false, |_| false));
        // history is reset after a positive decision
        assert_eq!(analyzer.history().count(), 0);
    }

    #[test]
    fn test_before_middle_does_not_prefetch() {
        let mut analyzer = analyzer_with(10, &[1, 2, 3]);
        assert!(!analyzer.should_prefetch_next(4, false, |_| false));
    }

    #[test]
    fn test_out_of_order_history_blocks_prefetch() {
        let mut analyzer = analyzer_with(10, &[5, 3, 6]);
        assert!(!analyzer.should_prefetch_next(7, false, |_| false));
    }

    #[test]
    fn test_backward_step_blocks_prefetch() {
        let mut analyzer = analyzer_with(10, &[5, 6, 8]);
        assert!(!analyzer.should_prefetch_next(7, false, |_| false));
    }

    #[test]
    fn test_cached_next_chunk_blocks_prefetch() {
        let mut analyzer = analyzer_with(10, &[5, 6]);
        assert!(!analyzer.should_prefetch_next(7, false, |chunk| chunk == 1));
        assert!(analyzer.should_prefetch_next(7, false, |chunk| chunk == 2));
    }

    #[test]
    fn test_empty_history_does_not_prefetch() {
        let mut analyzer = PrefetchAnalyzer::new(10);
        assert!(!analyzer.should_prefetch_next(9, false, |_| false));
    }

    #[test]
    fn test_history_bounded_and_bubbling() {
        let mut analyzer = analyzer_with(5, &[1, 2, 3, 4]);
        assert_eq!(analyzer.capacity(), 3);
        assert_eq!(analyzer.history().collect::<Vec<_>>(), vec![2, 3, 4]);

        analyzer.add_requested(2);
        assert_eq!(analyzer.history().collect::<Vec<_>>(), vec![3, 4, 2]);
    }
}
