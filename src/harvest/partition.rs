use crate::error::{Result, SearchEngineError};
use serde::Serialize;

/// Inclusive id range fetched as one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdRange {
    pub from: i64,
    pub to: i64,
}

/// Slice of the source id space owned by one worker
///
/// Fork `i` of `F` takes batches starting at `min + i*B`, `min + (i+F)*B`, ...
/// so the forks interleave without overlapping and together cover
/// `[min_id, max_id]` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HarvestPartition {
    pub fork_index: usize,
    pub total_forks: usize,
    pub min_id: i64,
    pub max_id: i64,
    pub batch_size: u64,
}

impl HarvestPartition {
    pub fn new(
        fork_index: usize,
        total_forks: usize,
        min_id: i64,
        max_id: i64,
        batch_size: u64,
    ) -> Result<Self> {
        if total_forks == 0 || fork_index >= total_forks {
            return Err(SearchEngineError::argument(format!(
                "Invalid fork {} of {}",
                fork_index, total_forks
            )));
        }
        if batch_size == 0 {
            return Err(SearchEngineError::argument("Batch size must be positive"));
        }
        Ok(Self {
            fork_index,
            total_forks,
            min_id,
            max_id,
            batch_size,
        })
    }

    /// Partitions for all forks of one run.
    pub fn plan(total_forks: usize, min_id: i64, max_id: i64, batch_size: u64) -> Result<Vec<Self>> {
        (0..total_forks)
            .map(|fork| Self::new(fork, total_forks, min_id, max_id, batch_size))
            .collect()
    }

    /// Distance between two consecutive batches of this fork.
    pub fn step(&self) -> i64 {
        self.batch_size as i64 * self.total_forks as i64
    }

    pub fn first_id(&self) -> i64 {
        self.min_id + self.batch_size as i64 * self.fork_index as i64
    }

    /// Batches of this fork in increasing id order.
    ///
    /// Empty source ranges still yield their batch; the caller advances past
    /// them instead of stopping early.
    pub fn batches(&self) -> Batches {
        Batches {
            next: self.first_id(),
            max_id: self.max_id,
            width: self.batch_size as i64,
            step: self.step(),
        }
    }
}

pub struct Batches {
    next: i64,
    max_id: i64,
    width: i64,
    step: i64,
}

impl Iterator for Batches {
    type Item = IdRange;

    fn next(&mut self) -> Option<IdRange> {
        if self.next > self.max_id {
            return None;
        }
        let from = self.next;
        let to = from.saturating_add(self.width - 1).min(self.max_id);
        self.next = from.saturating_add(self.step);
        Some(IdRange { from, to })
    }
}
