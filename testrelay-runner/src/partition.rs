// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for partitioning test runs across several machines.
//!
//! Groups are the unit of sharding: a group is never split across shards. Groups are assigned
//! greedily, largest first, to whichever shard has the fewest tests so far. This is not optimal,
//! but the difference between the largest and smallest shard is bounded by the size of the
//! largest group.

use crate::{errors::ShardParseError, groups::TestGroup};
use std::{fmt, str::FromStr};

/// One shard out of several, counting up from 1.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Shard {
    current: u64,
    total: u64,
}

impl Shard {
    /// Creates a new shard. Returns an error unless `1 <= current <= total`.
    pub fn new(current: u64, total: u64) -> Result<Self, ShardParseError> {
        if !(1..=total).contains(&current) {
            return Err(ShardParseError::new(format!(
                "shard {current} must be a number between 1 and total shards {total}, inclusive"
            )));
        }
        Ok(Self { current, total })
    }

    /// The shard this is, counting up from 1.
    pub fn current(&self) -> u64 {
        self.current
    }

    /// The total number of shards.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.current, self.total)
    }
}

impl FromStr for Shard {
    type Err = ShardParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let Some((current_str, total_str)) = input.split_once('/') else {
            return Err(ShardParseError::new(format!(
                "expected input '{input}' to be in the format M/N"
            )));
        };

        let current: u64 = current_str.parse().map_err(|err| {
            ShardParseError::new(format!("failed to parse shard '{current_str}' as u64: {err}"))
        })?;
        let total: u64 = total_str.parse().map_err(|err| {
            ShardParseError::new(format!(
                "failed to parse total shards '{total_str}' as u64: {err}"
            ))
        })?;

        Self::new(current, total)
    }
}

/// Returns the groups assigned to `shard`, in their original order.
pub fn filter_for_shard(groups: Vec<TestGroup>, shard: &Shard) -> Vec<TestGroup> {
    let assignments = assign_shards(&groups, shard.total);
    groups
        .into_iter()
        .zip(assignments)
        .filter_map(|(group, assigned)| (assigned == shard.current - 1).then_some(group))
        .collect()
}

// Returns the zero-based shard for each group.
fn assign_shards(groups: &[TestGroup], total: u64) -> Vec<u64> {
    let mut order: Vec<usize> = (0..groups.len()).collect();
    // Stable, so ties keep their original order.
    order.sort_by(|&a, &b| groups[b].tests.len().cmp(&groups[a].tests.len()));

    let mut loads = vec![0usize; total as usize];
    let mut assignments = vec![0; groups.len()];
    for index in order {
        // The first least-loaded shard wins ties.
        let shard = (0..loads.len()).fold(0, |best, i| {
            if loads[i] < loads[best] { i } else { best }
        });
        loads[shard] += groups[index].tests.len();
        assignments[index] = shard as u64;
    }
    assignments
}
