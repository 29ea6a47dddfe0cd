use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Bijective hardware-probe to logical-electrode permutation.
///
/// `map[probe] = electrode` and `inverse[electrode] = probe`. Both vectors are
/// only ever replaced together, so they never disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMap {
    map: Vec<usize>,
    inverse: Vec<usize>,
}

impl ChannelMap {
    /// Create default 1:1 mapping
    pub fn identity(num_probes: usize) -> Self {
        let map: Vec<usize> = (0..num_probes).collect();
        Self {
            inverse: map.clone(),
            map,
        }
    }

    /// Build a map from a permutation, rejecting anything that is not bijective
    pub fn from_permutation(permutation: Vec<usize>) -> Result<Self, ConfigurationError> {
        let n = permutation.len();
        let mut inverse = vec![usize::MAX; n];

        for (probe, &electrode) in permutation.iter().enumerate() {
            if electrode >= n || inverse[electrode] != usize::MAX {
                return Err(ConfigurationError::NotAPermutation { electrode });
            }
            inverse[electrode] = probe;
        }

        Ok(Self {
            map: permutation,
            inverse,
        })
    }

    /// Replace the whole permutation; the size must not change
    pub fn set(&mut self, permutation: Vec<usize>) -> Result<(), ConfigurationError> {
        if permutation.len() != self.map.len() {
            return Err(ConfigurationError::ChannelMapSize {
                expected: self.map.len(),
                got: permutation.len(),
            });
        }
        *self = Self::from_permutation(permutation)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn electrode_for(&self, probe: usize) -> usize {
        self.map[probe]
    }

    pub fn probe_for(&self, electrode: usize) -> usize {
        self.inverse[electrode]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.map
    }

    pub fn inverse(&self) -> &[usize] {
        &self.inverse
    }

    /// Scatter hardware-ordered values into logical electrode order
    pub fn apply<T: Copy>(&self, hardware: &[T], logical: &mut [T]) {
        for (probe, value) in hardware.iter().enumerate().take(self.map.len()) {
            logical[self.map[probe]] = *value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let map = ChannelMap::identity(4);
        let mut out = [0.0; 4];
        map.apply(&[1.0, 2.0, 3.0, 4.0], &mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = ChannelMap::from_permutation(vec![0, 1, 1, 3]).unwrap_err();
        assert_eq!(err, ConfigurationError::NotAPermutation { electrode: 1 });
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(ChannelMap::from_permutation(vec![0, 4, 1, 2]).is_err());
    }

    #[test]
    fn test_failed_set_keeps_previous_map() {
        let mut map = ChannelMap::from_permutation(vec![1, 0, 2]).unwrap();
        assert!(map.set(vec![0, 0, 2]).is_err());
        assert_eq!(map.as_slice(), &[1, 0, 2]);
        assert_eq!(map.inverse(), &[1, 0, 2]);
    }
}
