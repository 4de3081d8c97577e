use log::{info, warn};
use thiserror::Error;

use crate::dataset::{group_by_dataset, Snapshot};
use crate::machine::Machine;
use crate::retention::{apply_policy, KeepPolicy};

#[derive(Error, Debug)]
pub enum PruneError {
    #[error("refusing to destroy all snapshots")]
    RefuseDestroyAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Dataset,
    Nothing,
}

#[derive(Debug)]
pub struct PrunePlan {
    pub keep: Vec<Snapshot>,
    pub destroy: Vec<Snapshot>,
}

fn report_group(keep: &[Snapshot], destroy: &[Snapshot], group: Option<&str>) {
    let prefix = match group {
        Some(name) => format!("Dataset '{name}': "),
        None => String::new(),
    };
    if destroy.is_empty() {
        info!(
            "{prefix}Keeping all {} snapshots, not destroying any snapshots",
            keep.len()
        );
    } else {
        info!(
            "{prefix}Keeping {} snapshots, destroying these {} snapshots:",
            keep.len(),
            destroy.len()
        );
        for snap in destroy {
            info!(
                "    {}  {}",
                snap.timestamp.format("%Y-%m-%d %H:%M:%S"),
                snap.longname()
            );
        }
    }
}

/// Applies the keep policy per group and enforces the destroy-all guard.
/// Does not touch the store; the caller drives the actual destroys.
pub fn plan_prune(
    snapshots: &[Snapshot],
    policy: &KeepPolicy,
    group_by: GroupBy,
    allow_destroy_all: bool,
) -> Result<PrunePlan, PruneError> {
    let (keep, destroy) = match group_by {
        GroupBy::Nothing => {
            info!("Pruning {} snapshots without grouping", snapshots.len());
            let (keep, destroy) = apply_policy(snapshots, policy);
            report_group(&keep, &destroy, None);
            (keep, destroy)
        }
        GroupBy::Dataset => {
            info!("Pruning {} snapshots, grouped by dataset", snapshots.len());
            let mut keep = Vec::new();
            let mut destroy = Vec::new();
            for (name, group) in group_by_dataset(snapshots) {
                let (group_keep, group_destroy) = apply_policy(&group, policy);
                report_group(&group_keep, &group_destroy, Some(&name));
                keep.extend(group_keep);
                destroy.extend(group_destroy);
            }
            (keep, destroy)
        }
    };

    // A policy that keeps nothing is almost certainly a configuration
    // mistake; require the operator to name snapshots explicitly.
    if keep.is_empty() && !allow_destroy_all {
        return Err(PruneError::RefuseDestroyAll);
    }

    Ok(PrunePlan { keep, destroy })
}

/// Prunes the given snapshots according to the keep policy. Per-snapshot
/// destroy failures are logged and do not abort the loop.
pub fn prune_snapshots(
    machine: &Machine,
    snapshots: &[Snapshot],
    policy: &KeepPolicy,
    group_by: GroupBy,
    dry_run: bool,
    allow_destroy_all: bool,
) -> Result<(), PruneError> {
    if snapshots.is_empty() {
        info!("No snapshots, nothing to do");
        return Ok(());
    }

    let plan = plan_prune(snapshots, policy, group_by, allow_destroy_all)?;

    if plan.destroy.is_empty() {
        info!("No snapshots to prune");
        return Ok(());
    }
    if dry_run {
        info!("Dry-run enabled, not destroying any snapshots");
        return Ok(());
    }

    info!("Destroying...");
    let total = plan.destroy.len();
    for (i, snap) in plan.destroy.iter().enumerate() {
        if let Err(e) = machine.destroy_snapshots(&snap.dataset, &[snap.shortname.clone()]) {
            warn!("Failed to destroy snapshot '{}': {}", snap.longname(), e);
        }
        info!("    {}/{} destroyed", i + 1, total);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::fake_snapshot;

    #[test]
    fn refuses_to_destroy_all() {
        // a policy that keeps nothing must not wipe the dataset
        let snaps = vec![fake_snapshot("tank", "x", 1, 1000)];
        let err = plan_prune(&snaps, &KeepPolicy::default(), GroupBy::Dataset, false).unwrap_err();
        assert!(matches!(err, PruneError::RefuseDestroyAll));
    }

    #[test]
    fn explicit_shortnames_bypass_the_guard() {
        let snaps = vec![fake_snapshot("tank", "x", 1, 1000)];
        let plan = plan_prune(&snaps, &KeepPolicy::default(), GroupBy::Dataset, true).unwrap();
        assert!(plan.keep.is_empty());
        assert_eq!(plan.destroy.len(), 1);
    }

    #[test]
    fn grouping_applies_policy_per_dataset() {
        // last=1 keeps the newest snapshot of each dataset when grouped
        let snaps = vec![
            fake_snapshot("tank/a", "a-new", 1, 2000),
            fake_snapshot("tank/a", "a-old", 2, 1000),
            fake_snapshot("tank/b", "b-new", 3, 2000),
            fake_snapshot("tank/b", "b-old", 4, 1000),
        ];
        let policy = KeepPolicy { last: 1, ..Default::default() };

        let plan = plan_prune(&snaps, &policy, GroupBy::Dataset, false).unwrap();
        let kept: Vec<&str> = plan.keep.iter().map(|s| s.shortname.as_str()).collect();
        assert_eq!(kept, ["a-new", "b-new"]);

        let plan = plan_prune(&snaps, &policy, GroupBy::Nothing, false).unwrap();
        let kept: Vec<&str> = plan.keep.iter().map(|s| s.shortname.as_str()).collect();
        // ungrouped, only the globally newest survives; guid breaks the tie
        assert_eq!(kept, ["b-new"]);
    }
}
