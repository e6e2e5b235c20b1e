//! Row decomposition and ring neighbours.
//!
//! Worker ranks here are 0-based over the N workers of a cohort. The ring is
//! open: rank 0 has no predecessor and rank N-1 has no successor, so the
//! first and last grid rows border nothing but the dead boundary.

use std::ops::Range;

use crate::{Error, Result};

/// Cohort rank of the coordinating member. Workers occupy ranks 1..=N.
pub const MANAGER_RANK: u32 = 0;

/// A contiguous block of grid rows `[from, from + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    pub from: usize,
    pub count: usize,
}

impl RowRange {
    pub fn end(&self) -> usize {
        self.from + self.count
    }

    pub fn rows(&self) -> Range<usize> {
        self.from..self.end()
    }
}

/// Assigns rows to workers in rank order starting at row 0. Every worker
/// gets `height / num_workers` rows and the first `height % num_workers`
/// workers get one extra.
pub fn partition_rows(height: usize, num_workers: usize) -> Result<Vec<RowRange>> {
    if num_workers == 0 {
        return Err(Error::config("a cohort needs at least one worker"));
    }
    if num_workers > height {
        return Err(Error::config(format!(
            "{num_workers} workers cannot share {height} rows"
        )));
    }

    let base = height / num_workers;
    let extra = height % num_workers;
    let mut from = 0;
    let ranges = (0..num_workers)
        .map(|rank| {
            let count = base + usize::from(rank < extra);
            let range = RowRange { from, count };
            from += count;
            range
        })
        .collect();
    Ok(ranges)
}

/// Position of one worker in the open ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub rank: usize,
    pub num_workers: usize,
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

impl Topology {
    pub fn resolve(rank: usize, num_workers: usize) -> Result<Self> {
        if rank >= num_workers {
            return Err(Error::config(format!(
                "worker rank {rank} is outside a cohort of {num_workers} workers"
            )));
        }
        Ok(Self {
            rank,
            num_workers,
            prev: rank.checked_sub(1),
            next: (rank + 1 < num_workers).then_some(rank + 1),
        })
    }

    /// Even ranks talk to their successor first and send before receiving;
    /// odd ranks start with their predecessor and receive first. Adjacent
    /// ranks always have opposite parity, so every send meets a receive.
    pub fn sends_first(&self) -> bool {
        self.rank % 2 == 0
    }

    pub fn is_edge(&self) -> bool {
        self.prev.is_none() || self.next.is_none()
    }
}
