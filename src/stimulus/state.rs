use std::sync::atomic::{AtomicU64, Ordering};

const ACTIVE_BIT: u64 = 1 << 32;
const UNTIMED: u64 = u64::MAX;

/// Active-stimulus flag and catalog id shared with the ingestion path.
///
/// Both values live in one atomic word so a reader never sees the flag of
/// one stimulus paired with the id of another. A timed activation counts
/// down one per emitted sample and clears the flag after its last sample.
#[derive(Debug)]
pub struct StimulusState {
    word: AtomicU64,
    remaining: AtomicU64,
}

impl Default for StimulusState {
    fn default() -> Self {
        Self::new()
    }
}

impl StimulusState {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(Self::pack(false, -1)),
            remaining: AtomicU64::new(UNTIMED),
        }
    }

    fn pack(active: bool, id: i32) -> u64 {
        let flag = if active { ACTIVE_BIT } else { 0 };
        flag | id as u32 as u64
    }

    fn unpack(word: u64) -> (bool, i32) {
        (word & ACTIVE_BIT != 0, (word & 0xFFFF_FFFF) as u32 as i32)
    }

    /// Publish a state that holds until changed
    pub fn set(&self, active: bool, id: i32) {
        self.remaining.store(UNTIMED, Ordering::Release);
        self.word.store(Self::pack(active, id), Ordering::Release);
    }

    /// Mark `id` active for the next `samples` emitted samples
    pub fn activate_for(&self, id: i32, samples: u64) {
        self.remaining.store(samples, Ordering::Release);
        self.word.store(Self::pack(samples > 0, id), Ordering::Release);
    }

    /// Id last published, active or not
    pub fn id(&self) -> i32 {
        Self::unpack(self.word.load(Ordering::Acquire)).1
    }

    pub fn clear(&self) {
        self.set(false, -1);
    }

    /// Returns `(active, id)`; the id is -1 whenever the flag is clear
    pub fn snapshot(&self) -> (bool, i32) {
        match Self::unpack(self.word.load(Ordering::Acquire)) {
            (true, id) => (true, id),
            (false, _) => (false, -1),
        }
    }

    /// State for one emitted sample, consuming a sample of a timed activation
    pub fn next_sample(&self) -> (bool, i32) {
        let word = self.word.load(Ordering::Acquire);
        let (active, id) = Self::unpack(word);
        if !active {
            return (false, -1);
        }

        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| match r {
                UNTIMED | 0 => None,
                r => Some(r - 1),
            });
        if previous == Ok(1) {
            // a newer publication wins over the expiry
            let _ = self.word.compare_exchange(
                word,
                Self::pack(false, id),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        (true, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_inactive() {
        assert_eq!(StimulusState::new().snapshot(), (false, -1));
    }

    #[test]
    fn test_set_and_clear() {
        let state = StimulusState::new();
        state.set(true, 7);
        assert_eq!(state.snapshot(), (true, 7));
        state.set(false, 7);
        assert_eq!(state.snapshot(), (false, -1));
        state.set(true, 0);
        state.clear();
        assert_eq!(state.snapshot(), (false, -1));
    }

    #[test]
    fn test_inactive_keeps_id() {
        let state = StimulusState::new();
        state.set(false, 4);
        assert_eq!(state.snapshot(), (false, -1));
        assert_eq!(state.id(), 4);
        assert_eq!(state.next_sample(), (false, -1));
    }

    #[test]
    fn test_timed_activation_expires() {
        let state = StimulusState::new();
        state.activate_for(2, 3);
        let samples: Vec<(bool, i32)> = (0..5).map(|_| state.next_sample()).collect();
        assert_eq!(
            samples,
            vec![(true, 2), (true, 2), (true, 2), (false, -1), (false, -1)]
        );
        assert_eq!(state.id(), 2);
    }

    #[test]
    fn test_untimed_never_expires() {
        let state = StimulusState::new();
        state.set(true, 1);
        for _ in 0..100 {
            assert_eq!(state.next_sample(), (true, 1));
        }
    }
}
