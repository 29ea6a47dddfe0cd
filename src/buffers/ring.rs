use crate::core::MultiProbeFrame;

/// One channel stored three times back to back.
///
/// Sample `n` lives at `n % size`, `n % size + size` and `n % size + 2 * size`,
/// so any window of up to `size` samples is a contiguous slice of the middle
/// copy and never wraps.
#[derive(Debug, Clone)]
pub struct MirroredChannel<T> {
    data: Vec<T>,
    size: usize,
}

impl<T: Copy + Default> MirroredChannel<T> {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![T::default(); size * 3],
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn write(&mut self, index: usize, value: T) {
        let i = index % self.size;
        self.data[i] = value;
        self.data[i + self.size] = value;
        self.data[i + 2 * self.size] = value;
    }

    pub fn get(&self, index: usize) -> T {
        self.data[self.size + index % self.size]
    }

    /// `len` samples starting at ring position `index`, taken from the middle copy
    pub fn slice(&self, index: usize, len: usize) -> &[T] {
        let start = self.size + index % self.size;
        &self.data[start..start + len.min(self.size)]
    }

    /// Full backing storage, all three copies
    pub fn raw(&self) -> &[T] {
        &self.data
    }
}

/// Multi-probe sample history with a running sample count.
///
/// Windows are addressed by absolute sample count; only the last `size`
/// samples are addressable.
#[derive(Debug, Clone)]
pub struct SampleRing {
    size: usize,
    count: u64,
    ac: Vec<MirroredChannel<f32>>,
    dc: Vec<MirroredChannel<f32>>,
    spikes: Vec<MirroredChannel<bool>>,
    stimulus: MirroredChannel<bool>,
    clock: MirroredChannel<u64>,
}

impl SampleRing {
    pub fn new(num_probes: usize, size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            count: 0,
            ac: (0..num_probes).map(|_| MirroredChannel::new(size)).collect(),
            dc: (0..num_probes).map(|_| MirroredChannel::new(size)).collect(),
            spikes: (0..num_probes).map(|_| MirroredChannel::new(size)).collect(),
            stimulus: MirroredChannel::new(size),
            clock: MirroredChannel::new(size),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num_probes(&self) -> usize {
        self.ac.len()
    }

    /// Samples written since creation
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Samples currently addressable
    pub fn filled(&self) -> usize {
        self.count.min(self.size as u64) as usize
    }

    pub fn push(&mut self, frame: &MultiProbeFrame) {
        let i = (self.count % self.size as u64) as usize;
        for (probe, ch) in self.ac.iter_mut().enumerate() {
            ch.write(i, frame.ac_uv.get(probe).copied().unwrap_or_default());
        }
        for (probe, ch) in self.dc.iter_mut().enumerate() {
            ch.write(i, frame.dc_mv.get(probe).copied().unwrap_or_default());
        }
        for (probe, ch) in self.spikes.iter_mut().enumerate() {
            ch.write(i, frame.spikes.get(probe).copied().unwrap_or_default());
        }
        self.stimulus.write(i, frame.stimulus_active);
        self.clock.write(i, frame.clock_ticks);
        self.count += 1;
    }

    fn in_range(&self, start_count: u64, len: usize) -> bool {
        let end = start_count + len as u64;
        len <= self.size && end <= self.count && start_count + self.size as u64 >= self.count
    }

    fn position(&self, count: u64) -> usize {
        (count % self.size as u64) as usize
    }

    /// AC window of `len` samples beginning at absolute sample `start_count`
    pub fn window(&self, probe: usize, start_count: u64, len: usize) -> Option<&[f32]> {
        let ch = self.ac.get(probe)?;
        self.in_range(start_count, len)
            .then(|| ch.slice(self.position(start_count), len))
    }

    pub fn dc_window(&self, probe: usize, start_count: u64, len: usize) -> Option<&[f32]> {
        let ch = self.dc.get(probe)?;
        self.in_range(start_count, len)
            .then(|| ch.slice(self.position(start_count), len))
    }

    pub fn clock_at(&self, count: u64) -> Option<u64> {
        self.in_range(count, 1).then(|| self.clock.get(self.position(count)))
    }

    pub fn stimulus_at(&self, count: u64) -> Option<bool> {
        self.in_range(count, 1).then(|| self.stimulus.get(self.position(count)))
    }

    pub fn spike_at(&self, probe: usize, count: u64) -> Option<bool> {
        let ch = self.spikes.get(probe)?;
        self.in_range(count, 1).then(|| ch.get(self.position(count)))
    }

    /// Flag a detected spike; ignored if the sample has been overwritten
    pub fn mark_spike(&mut self, probe: usize, count: u64) -> bool {
        if !self.in_range(count, 1) {
            return false;
        }
        let pos = self.position(count);
        match self.spikes.get_mut(probe) {
            Some(ch) => {
                ch.write(pos, true);
                true
            }
            None => false,
        }
    }
}
