use super::{PayloadSpec, ReadRange, WorkloadError};
use crate::key::{OwnerHash, PageData, PageId};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Fixed set of random payloads, built once and shared read-only
#[derive(Debug, Clone)]
pub struct PayloadPool {
    entries: Vec<Bytes>,
}

impl PayloadPool {
    pub fn build(spec: PayloadSpec, rng: &mut StdRng) -> Result<Self, WorkloadError> {
        spec.validate()?;

        let entries = (0..spec.count)
            .map(|index| {
                let mut data = vec![0u8; spec.size_at(index)];
                rng.fill_bytes(&mut data);
                Bytes::from(data)
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.entries.iter()
    }
}

struct WriteCursor {
    current_version: u64,
    rng: StdRng,
}

/// Hands out strictly increasing page versions with payloads from the pool.
///
/// Safe to share between producers: the increment, the payload pick and the
/// return happen under one lock, so concurrent callers never observe the same
/// version and always see versions in the order they were issued.
pub struct WriteGenerator {
    cursor: Mutex<WriteCursor>,
    pool: PayloadPool,
}

impl WriteGenerator {
    /// The first `generate()` returns `start_version + 1`.
    pub fn new(
        start_version: u64,
        spec: PayloadSpec,
        seed: Option<u64>,
    ) -> Result<Self, WorkloadError> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let pool = PayloadPool::build(spec, &mut rng)?;

        Ok(Self {
            cursor: Mutex::new(WriteCursor {
                current_version: start_version,
                rng,
            }),
            pool,
        })
    }

    pub fn generate(&self) -> Result<(PageId, PageData), WorkloadError> {
        let mut cursor = self.cursor.lock();

        let version = cursor
            .current_version
            .checked_add(1)
            .ok_or(WorkloadError::VersionOverflow(cursor.current_version))?;
        cursor.current_version = version;

        let index = cursor.rng.gen_range(0..self.pool.len());
        let payload = self.pool.entries[index].clone();

        Ok((PageId::root(version), PageData::new(payload)))
    }

    /// Last version handed out (the start version before the first call)
    pub fn current_version(&self) -> u64 {
        self.cursor.lock().current_version
    }

    pub fn pool(&self) -> &PayloadPool {
        &self.pool
    }
}

/// Samples page versions uniformly from a range; one per read worker.
#[derive(Debug)]
pub struct ReadGenerator {
    range: ReadRange,
    owner: OwnerHash,
    rng: StdRng,
}

impl ReadGenerator {
    pub fn new(range: ReadRange, miss: bool, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            range,
            owner: if miss { OwnerHash::MISS } else { OwnerHash::ZERO },
            rng,
        }
    }

    pub fn generate(&mut self) -> PageId {
        let offset = self.rng.gen_range(0..self.range.len());
        PageId::new(self.range.start() + offset, self.owner, Vec::new())
    }

    pub fn is_miss_mode(&self) -> bool {
        self.owner == OwnerHash::MISS
    }

    pub fn range(&self) -> ReadRange {
        self.range
    }
}
