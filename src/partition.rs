//! Partition of sample indices among independent worker processes.
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::SweepError;

/// A half-open interval [start, stop) of global sample indices assigned to one worker.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerRange {
    pub start: usize,
    pub stop: usize,
}

impl WorkerRange {
    pub fn new(start: usize, stop: usize) -> Self {
        WorkerRange { start, stop }
    }

    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.stop
    }

    pub fn as_range(&self) -> Range<usize> {
        self.start..self.stop
    }
}

/// Returns the range of sample indices processed by worker `rank` out of `workers`.
///
/// Every worker gets a block of `ceil(num_samples / workers)` consecutive indices, except
/// the last ones which may get fewer or none. A rank starting past the end receives the
/// empty range [num_samples, num_samples).
pub fn worker_range(num_samples: usize, rank: usize, workers: usize) -> Result<WorkerRange, SweepError> {
    if workers == 0 || rank >= workers {
        return Err(SweepError::InvalidWorker { rank, workers });
    }

    let block = num_samples.div_ceil(workers);
    let start = (block * rank).min(num_samples);
    let stop = (block * (rank + 1)).min(num_samples);
    Ok(WorkerRange::new(start, stop))
}

/// Returns the ranges of all workers, in rank order.
pub fn partition(num_samples: usize, workers: usize) -> Result<Vec<WorkerRange>, SweepError> {
    (0..workers.max(1))
        .map(|rank| worker_range(num_samples, rank, workers))
        .collect()
}

/// How the sweep is distributed, chosen once at startup.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// One process handles every sample.
    Single,
    /// This process is worker `rank` among `workers` independent processes.
    Multi { rank: usize, workers: usize },
}

impl ExecutionMode {
    /// Select the execution mode from an optional worker identity.
    pub fn build(rank: Option<usize>, workers: Option<usize>) -> Result<Self, SweepError> {
        match (rank, workers) {
            (None, None) | (Some(0), None) | (None, Some(1)) => Ok(ExecutionMode::Single),
            (Some(rank), None) => Err(SweepError::InvalidWorker { rank, workers: 1 }),
            (None, Some(workers)) => Err(SweepError::InvalidParameter(format!(
                "{} workers requested but no rank given, every worker needs its own rank",
                workers
            ))),
            (Some(rank), Some(workers)) => {
                if workers == 0 || rank >= workers {
                    return Err(SweepError::InvalidWorker { rank, workers });
                }
                if workers == 1 {
                    Ok(ExecutionMode::Single)
                } else {
                    Ok(ExecutionMode::Multi { rank, workers })
                }
            }
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            ExecutionMode::Single => 0,
            ExecutionMode::Multi { rank, .. } => *rank,
        }
    }

    pub fn workers(&self) -> usize {
        match self {
            ExecutionMode::Single => 1,
            ExecutionMode::Multi { workers, .. } => *workers,
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, ExecutionMode::Multi { .. })
    }

    /// Returns the range of sample indices this process is responsible for.
    pub fn range(&self, num_samples: usize) -> Result<WorkerRange, SweepError> {
        let range = worker_range(num_samples, self.rank(), self.workers())?;
        log::info!(
            "There are {} workers, so each worker gets up to {} parameter sets",
            self.workers(),
            num_samples.div_ceil(self.workers())
        );
        log::info!(
            "This worker (rank {}) is processing parameter sets {} through {}",
            self.rank(),
            range.start,
            range.stop
        );
        Ok(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_worker() {
        assert_eq!(worker_range(17, 0, 1).unwrap(), WorkerRange::new(0, 17));
        assert_eq!(ExecutionMode::Single.range(17).unwrap(), WorkerRange::new(0, 17));
    }

    #[test]
    fn test_uneven_split() {
        let ranges = partition(10, 3).unwrap();
        assert_eq!(
            ranges,
            vec![
                WorkerRange::new(0, 4),
                WorkerRange::new(4, 8),
                WorkerRange::new(8, 10)
            ]
        );
    }

    #[test]
    fn test_no_samples() {
        let ranges = partition(0, 4).unwrap();
        assert_eq!(ranges, vec![WorkerRange::new(0, 0); 4]);
    }

    #[test]
    fn test_more_workers_than_samples() {
        let ranges = partition(5, 10).unwrap();
        for (rank, range) in ranges.iter().enumerate() {
            if rank < 5 {
                assert_eq!(*range, WorkerRange::new(rank, rank + 1));
            } else {
                assert_eq!(*range, WorkerRange::new(5, 5));
                assert!(range.is_empty());
            }
        }
    }

    #[test]
    fn test_coverage() {
        for num_samples in 0..60 {
            for workers in 1..13 {
                let ranges = partition(num_samples, workers).unwrap();
                assert_eq!(ranges.len(), workers);
                assert_eq!(ranges[0].start, 0);
                assert_eq!(ranges[workers - 1].stop, num_samples);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].stop, pair[1].start);
                    assert!(pair[0].start <= pair[1].start);
                }
                assert_eq!(ranges.iter().map(|r| r.len()).sum::<usize>(), num_samples);
            }
        }
    }

    #[test]
    fn test_invalid_worker() {
        assert_eq!(
            worker_range(10, 3, 3),
            Err(SweepError::InvalidWorker { rank: 3, workers: 3 })
        );
        assert!(worker_range(10, 0, 0).is_err());
    }

    #[test]
    fn test_execution_mode() {
        assert_eq!(ExecutionMode::build(None, None).unwrap(), ExecutionMode::Single);
        assert_eq!(ExecutionMode::build(Some(0), Some(1)).unwrap(), ExecutionMode::Single);
        assert_eq!(
            ExecutionMode::build(Some(2), Some(4)).unwrap(),
            ExecutionMode::Multi { rank: 2, workers: 4 }
        );
        assert!(ExecutionMode::build(Some(4), Some(4)).is_err());
        assert!(ExecutionMode::build(Some(1), None).is_err());
        assert_eq!(ExecutionMode::build(None, Some(1)).unwrap(), ExecutionMode::Single);

        let mode = ExecutionMode::build(Some(1), Some(3)).unwrap();
        assert!(mode.is_parallel());
        assert_eq!(mode.range(10).unwrap(), WorkerRange::new(4, 8));
    }

    #[test]
    fn test_workers_without_rank() {
        assert!(matches!(
            ExecutionMode::build(None, Some(4)),
            Err(SweepError::InvalidParameter(_))
        ));
        assert!(ExecutionMode::build(None, Some(0)).is_err());
    }
}
