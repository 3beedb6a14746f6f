//! Synthetic page traffic.
//!
//! The write side hands out strictly increasing versions paired with payloads
//! from a pre-built pool; the read side samples versions from a fixed range,
//! optionally with an owner hash that guarantees a miss.

pub mod generator;

pub use generator::{PayloadPool, ReadGenerator, WriteGenerator};

use thiserror::Error;

/// Number of pre-built payloads in the write pool
pub const DEFAULT_PAYLOAD_POOL_SIZE: usize = 50;

/// Smallest payload in the write pool
pub const DEFAULT_PAYLOAD_MIN_BYTES: usize = 10 * 1024;

/// Upper end of the payload size interpolation
pub const DEFAULT_PAYLOAD_MAX_BYTES: usize = 60 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkloadError {
    #[error("invalid read range [{start}, {end}): end must be greater than start")]
    EmptyRange { start: u64, end: u64 },

    #[error("worker count must be > 0")]
    ZeroWorkers,

    #[error("invalid payload size range: min {min} bytes, max {max} bytes")]
    InvalidPayloadRange { min: usize, max: usize },

    #[error("payload pool must hold at least one entry")]
    EmptyPayloadPool,

    #[error("page version counter exhausted at {0}")]
    VersionOverflow(u64),
}

/// Half-open `[start, end)` version range sampled by readers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRange {
    start: u64,
    end: u64,
}

impl ReadRange {
    pub fn new(start: u64, end: u64) -> Result<Self, WorkloadError> {
        if end <= start {
            return Err(WorkloadError::EmptyRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, version: u64) -> bool {
        (self.start..self.end).contains(&version)
    }
}

/// Shape of the payload pool built by the write generator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSpec {
    pub count: usize,
    pub min_bytes: usize,
    pub max_bytes: usize,
}

impl PayloadSpec {
    pub fn validate(&self) -> Result<(), WorkloadError> {
        if self.count == 0 {
            return Err(WorkloadError::EmptyPayloadPool);
        }
        if self.min_bytes == 0 || self.min_bytes > self.max_bytes {
            return Err(WorkloadError::InvalidPayloadRange {
                min: self.min_bytes,
                max: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Size of the `index`-th payload, linearly interpolated from `min_bytes`
    /// in steps of `(max_bytes - min_bytes) / count`.
    pub fn size_at(&self, index: usize) -> usize {
        let delta = (self.max_bytes - self.min_bytes) / self.count;
        self.min_bytes + delta * index
    }
}

impl Default for PayloadSpec {
    fn default() -> Self {
        Self {
            count: DEFAULT_PAYLOAD_POOL_SIZE,
            min_bytes: DEFAULT_PAYLOAD_MIN_BYTES,
            max_bytes: DEFAULT_PAYLOAD_MAX_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_range_rejects_empty() {
        assert_eq!(
            ReadRange::new(20, 20),
            Err(WorkloadError::EmptyRange { start: 20, end: 20 })
        );
        assert_eq!(
            ReadRange::new(20, 10),
            Err(WorkloadError::EmptyRange { start: 20, end: 10 })
        );

        let range = ReadRange::new(10, 20).unwrap();
        assert_eq!(range.len(), 10);
        assert!(range.contains(10));
        assert!(!range.contains(20));
    }

    #[test]
    fn test_default_payload_sizes() {
        let spec = PayloadSpec::default();
        spec.validate().unwrap();
        assert_eq!(spec.size_at(0), 10 * 1024);
        assert_eq!(spec.size_at(1), 10 * 1024 + 1024);
        assert_eq!(spec.size_at(49), 10 * 1024 + 49 * 1024);
    }

    #[test]
    fn test_payload_spec_validation() {
        let mut spec = PayloadSpec::default();
        spec.count = 0;
        assert_eq!(spec.validate(), Err(WorkloadError::EmptyPayloadPool));

        let spec = PayloadSpec {
            count: 4,
            min_bytes: 100,
            max_bytes: 10,
        };
        assert!(matches!(
            spec.validate(),
            Err(WorkloadError::InvalidPayloadRange { .. })
        ));
    }
}
