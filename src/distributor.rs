use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::error::{HarvestError, Result};
use crate::selector::{load_targets, save_targets, TargetSet};
use crate::types::Target;

/// Static split of a target set over `worker_count` independent workers.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionAssignment {
    pub worker_count: usize,
    pub partitions: Vec<Vec<Target>>,
}

/// Round-robin over targets sorted by id.
///
/// Identical input always yields identical partitions, so separate machines
/// can each compute their own share without talking to each other.
pub fn partition(target_set: &TargetSet, worker_count: usize) -> Result<PartitionAssignment> {
    if worker_count == 0 {
        return Err(HarvestError::InvalidPartition(
            "worker count must be positive".to_string(),
        ));
    }
    let mut sorted: Vec<&Target> = target_set.targets.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut partitions = vec![Vec::new(); worker_count];
    let mut seen = HashSet::new();
    let mut slot = 0;
    for target in sorted {
        if !seen.insert(target.id.as_str()) {
            continue;
        }
        partitions[slot % worker_count].push(target.clone());
        slot += 1;
    }

    let assignment = PartitionAssignment {
        worker_count,
        partitions,
    };
    info!(
        "Partitioned {} targets over {} workers: {:?}",
        slot,
        worker_count,
        assignment.partitions.iter().map(Vec::len).collect::<Vec<_>>()
    );
    Ok(assignment)
}

pub fn partition_path(dir: &Path, worker: usize) -> PathBuf {
    dir.join(format!("partition-{}.csv", worker))
}

impl PartitionAssignment {
    pub fn for_worker(&self, worker: usize) -> Result<&[Target]> {
        self.partitions.get(worker).map(Vec::as_slice).ok_or_else(|| {
            HarvestError::InvalidPartition(format!(
                "worker {} out of range for {} workers",
                worker, self.worker_count
            ))
        })
    }

    /// Checks pairwise disjointness and exact coverage of `target_set`.
    pub fn verify(&self, target_set: &TargetSet) -> Result<()> {
        let mut seen = HashSet::new();
        for (worker, part) in self.partitions.iter().enumerate() {
            for target in part {
                if !seen.insert(target.id.as_str()) {
                    return Err(HarvestError::InvalidPartition(format!(
                        "'{}' assigned twice (again to worker {})",
                        target.id, worker
                    )));
                }
            }
        }
        let expected: HashSet<&str> = target_set.targets.iter().map(|t| t.id.as_str()).collect();
        if let Some(missing) = expected.iter().find(|id| !seen.contains(*id)) {
            return Err(HarvestError::InvalidPartition(format!(
                "'{}' not assigned to any worker",
                missing
            )));
        }
        if let Some(extra) = seen.iter().find(|id| !expected.contains(*id)) {
            return Err(HarvestError::InvalidPartition(format!(
                "'{}' assigned but not a target",
                extra
            )));
        }
        Ok(())
    }

    pub fn write_partitions(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        for (worker, part) in self.partitions.iter().enumerate() {
            save_targets(partition_path(dir, worker), part)?;
        }
        Ok(())
    }
}

pub fn load_partition(dir: &Path, worker: usize) -> Result<Vec<Target>> {
    let path = partition_path(dir, worker);
    if !path.exists() {
        return Err(HarvestError::InvalidPartition(format!(
            "no partition file {:?}; run `partition` first",
            path
        )));
    }
    load_targets(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Signal;

    fn targets(n: usize) -> TargetSet {
        TargetSet::from_targets(
            (0..n)
                .rev()
                .map(|i| Target {
                    id: format!("emp-{:03}", i),
                    name: format!("Employer {}", i),
                    score: 1.0,
                    review_count: 100,
                    signal: Signal::Negative,
                })
                .collect(),
        )
    }

    #[test]
    fn partition_is_deterministic_and_exact() {
        for workers in 1..=7 {
            let set = targets(23);
            let first = partition(&set, workers).unwrap();
            let second = partition(&set, workers).unwrap();
            assert_eq!(first, second);
            first.verify(&set).unwrap();
            let total: usize = first.partitions.iter().map(Vec::len).sum();
            assert_eq!(total, 23);
            let sizes: Vec<usize> = first.partitions.iter().map(Vec::len).collect();
            assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
        }
    }

    #[test]
    fn input_order_does_not_matter() {
        let set = targets(10);
        let mut shuffled = set.clone();
        shuffled.targets.reverse();
        assert_eq!(partition(&set, 3).unwrap(), partition(&shuffled, 3).unwrap());
    }

    #[test]
    fn more_workers_than_targets_leaves_idle_workers() {
        let set = targets(2);
        let assignment = partition(&set, 5).unwrap();
        assert_eq!(assignment.partitions.iter().filter(|p| p.is_empty()).count(), 3);
        assignment.verify(&set).unwrap();
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(
            partition(&targets(3), 0),
            Err(HarvestError::InvalidPartition(_))
        ));
    }

    #[test]
    fn verify_catches_overlap() {
        let set = targets(4);
        let mut assignment = partition(&set, 2).unwrap();
        let dup = assignment.partitions[0][0].clone();
        assignment.partitions[1].push(dup);
        assert!(assignment.verify(&set).is_err());
    }

    #[test]
    fn partitions_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let set = targets(5);
        let assignment = partition(&set, 2).unwrap();
        assignment.write_partitions(dir.path()).unwrap();
        assert_eq!(load_partition(dir.path(), 1).unwrap(), assignment.partitions[1]);
        assert!(load_partition(dir.path(), 2).is_err());
    }
}
