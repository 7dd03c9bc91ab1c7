use std::hash::{BuildHasher, RandomState};

use tokio::sync::{Mutex, MutexGuard};

use crate::types::RowId;

/// Serializes work on individual rows.
///
/// Rows are hashed onto a fixed number of shards, each guarded by its own mutex. Two rows
/// sharing a shard are serialized as well, which is safe since a holder never waits on a second
/// shard.
#[derive(Debug)]
pub struct RowLocks {
    shards: Vec<Mutex<()>>,
    hasher: RandomState,
}

impl RowLocks {
    /// Creates the locks. At least one shard is always allocated.
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Waits for exclusive access to `row`. Access is released when the guard drops.
    pub async fn lock(&self, row: &RowId) -> MutexGuard<'_, ()> {
        self.shards[self.shard_of(row)].lock().await
    }

    fn shard_of(&self, row: &RowId) -> usize {
        (self.hasher.hash_one(row) % self.shards.len() as u64) as usize
    }
}
