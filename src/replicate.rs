use std::collections::{HashMap, HashSet};

use log::{debug, error, info};
use thiserror::Error;

use crate::dataset::{
    dataset_depth, group_by_dataset, Dataset, DatasetKind, Snapshot, Tags, PROP_ATIME,
    PROP_CANMOUNT, PROP_MOUNTPOINT, PROP_READONLY,
};
use crate::machine::{Machine, MachineError};
use crate::sendrecv;
use crate::sort::sort_snaps_by_time;
use crate::S;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("destination dataset '{0}' does not exist and will not be created")]
    DestinationMissing(String),
    #[error("destination '{0}' does not contain any snapshots")]
    DestinationEmpty(String),
    #[error("source '{0}' and destination '{1}' have no common snapshot")]
    NoCommonSnapshot(String, String),
    #[error("destination '{dataset}' has snapshots newer than latest common snapshot '{shortname}'")]
    DestinationDiverged { dataset: String, shortname: String },
    #[error("cannot transfer snapshots from '{src_dataset}' to '{dest}': snapshot '{snap}' shares timestamp with predecessor '{base}'")]
    SharedTimestamp {
        src_dataset: String,
        dest: String,
        snap: String,
        base: String,
    },
    #[error("`{cmdline}` exited with {status:?}")]
    ProcessFailed {
        status: subprocess::ExitStatus,
        cmdline: String,
    },
    #[error("failed to set up send/receive pipeline: {0}")]
    Pipeline(String),
    #[error("replication failed for one or more datasets")]
    MultipleFailures,
    #[error(transparent)]
    Store(#[from] MachineError),
}

/// Hold tag placed on the incremental base on the source side. It embeds the
/// destination dataset's guid so two replication targets of the same source
/// never collide on holds. The exact format is load-bearing for
/// interoperability with existing holds.
pub fn holdtag_src(dest_dataset: &Dataset) -> String {
    format!("zfsnappr-sendbase-{}", dest_dataset.guid)
}

/// Counterpart hold tag on the destination side, embedding the source
/// dataset's guid.
pub fn holdtag_dest(source_dataset: &Dataset) -> String {
    format!("zfsnappr-recvbase-{}", source_dataset.guid)
}

#[derive(Debug, Clone, Default)]
pub struct ReplicateOpts {
    pub recursive: bool,
    pub initialize: bool,
    pub rollback: bool,
    pub exclude_datasets: Vec<String>,
}

/// Replicates `source_dataset` on `source` into `dest_dataset` on `dest`,
/// transferring every snapshot missing from the destination in timestamp
/// order and keeping the incremental base pinned with holds on both sides.
pub fn replicate(
    source: &Machine,
    source_dataset: &str,
    dest: &Machine,
    dest_dataset: &str,
    opts: &ReplicateOpts,
) -> Result<(), ReplicationError> {
    let source_snaps = source.get_snapshots(
        Some(source_dataset),
        opts.recursive,
        &[],
        &opts.exclude_datasets,
    )?;
    let source_snaps = sort_snaps_by_time(source_snaps, true);

    let existing_dest: HashSet<String> = dest
        .get_all_datasets()?
        .into_iter()
        .map(|d| d.name)
        .collect();

    if opts.recursive {
        replicate_hierarchy(
            source,
            source_dataset,
            source_snaps,
            dest,
            dest_dataset,
            &existing_dest,
            opts.initialize,
            opts.rollback,
        )
    } else {
        replicate_snaps(
            source,
            source_snaps,
            dest,
            dest_dataset,
            &existing_dest,
            opts.initialize,
            opts.rollback,
        )
    }
}

/// Source snapshot groups in replication order: parents before children, so
/// a child's destination parent exists by the time the child is initialized.
fn ordered_groups(source_snaps: &[Snapshot]) -> Vec<(String, Vec<Snapshot>)> {
    let mut groups = group_by_dataset(source_snaps);
    groups.sort_by_key(|(name, _)| (dataset_depth(name), name.clone()));
    groups
}

/// Replicates a whole dataset tree, keeping the hierarchy below the
/// destination root. Per-dataset failures do not stop the remaining
/// datasets; the call fails at the end if any of them failed.
#[allow(clippy::too_many_arguments)]
fn replicate_hierarchy(
    source: &Machine,
    source_root: &str,
    source_snaps: Vec<Snapshot>,
    dest: &Machine,
    dest_root: &str,
    existing_dest: &HashSet<String>,
    initialize: bool,
    rollback: bool,
) -> Result<(), ReplicationError> {
    let mut failures = false;
    for (abs_source, snaps) in ordered_groups(&source_snaps) {
        let Some(rel) = abs_source.strip_prefix(source_root) else {
            continue;
        };
        let abs_dest = format!("{dest_root}{rel}");
        if let Err(e) = replicate_snaps(
            source,
            snaps,
            dest,
            &abs_dest,
            existing_dest,
            initialize,
            rollback,
        ) {
            failures = true;
            error!("{e}");
        }
    }
    if failures {
        return Err(ReplicationError::MultipleFailures);
    }
    Ok(())
}

/// Replicates the snapshots of one dataset.
///
/// With S and D the snapshots on source and destination (newest first),
/// D[0] = S[b] for some index b, the base index; S[..=b] reversed is the
/// transfer sequence and each element is sent incrementally against its
/// predecessor.
fn replicate_snaps(
    source: &Machine,
    source_snaps: Vec<Snapshot>,
    dest: &Machine,
    dest_dataset: &str,
    existing_dest: &HashSet<String>,
    initialize: bool,
    rollback: bool,
) -> Result<(), ReplicationError> {
    if source_snaps.is_empty() {
        info!("No source snapshots given, nothing to do");
        return Ok(());
    }
    let source_dataset = source_snaps[0].dataset.clone();

    // Phase 1: critical preparation, check for abort conditions.
    if !existing_dest.contains(dest_dataset) {
        if !initialize {
            return Err(ReplicationError::DestinationMissing(dest_dataset.to_owned()));
        }
        info!("Creating destination dataset '{dest_dataset}' by transferring the oldest snapshot");
        let source_kind = source.get_dataset(&source_dataset)?.kind;
        let oldest = source_snaps
            .last()
            .expect("source snapshot list is not empty");
        send_receive_initial(source, dest, oldest, dest_dataset, source_kind)?;
    }

    let dest_snaps = dest.get_snapshots(Some(dest_dataset), false, &[], &[])?;
    let dest_snaps = sort_snaps_by_time(dest_snaps, true);

    let source_tag = holdtag_src(&dest.get_dataset(dest_dataset)?);
    let dest_tag = holdtag_dest(&source.get_dataset(&source_dataset)?);

    let latest_common = determine_latest_common(&source_snaps, &dest_snaps);
    ensure_holds(
        (source, dest),
        (&source_snaps, &dest_snaps),
        (&source_tag, &dest_tag),
        (&source_dataset, dest_dataset),
        latest_common,
    )?;

    if dest_snaps.is_empty() {
        return Err(ReplicationError::DestinationEmpty(dest_dataset.to_owned()));
    }
    let Some((src_base, dest_base)) = latest_common else {
        return Err(ReplicationError::NoCommonSnapshot(
            source_dataset,
            dest_dataset.to_owned(),
        ));
    };
    if dest_base.guid != dest_snaps[0].guid {
        return Err(ReplicationError::DestinationDiverged {
            dataset: dest_dataset.to_owned(),
            shortname: dest_base.shortname.clone(),
        });
    }

    let transfer_sequence = plan_transfer_sequence(&source_snaps, src_base.guid);
    if transfer_sequence.len() <= 1 {
        info!("Source '{source_dataset}' has no new snapshots to transfer");
        return Ok(());
    }
    check_transfer_timestamps(&transfer_sequence, &source_dataset, dest_dataset)?;

    // Phase 2: technically good to go; optionally discard destination
    // divergence in the working tree before receiving.
    if rollback {
        info!("Rolling back destination '{dest_dataset}' to latest snapshot");
        dest.rollback(&dest_snaps[0].longname())?;
    }

    // Phase 3: transfer sequentially. Each step pins the newly received
    // snapshot before releasing the previous base, so at least one commonly
    // held snapshot exists on each side at any moment.
    let total = transfer_sequence.len() - 1;
    info!("Transferring {total} snapshots from '{source_dataset}' to '{dest_dataset}'");
    for (i, pair) in transfer_sequence.windows(2).enumerate() {
        let (base, snap) = (pair[0], pair[1]);
        send_receive_incremental(
            source,
            dest,
            dest_dataset,
            &source_tag,
            &dest_tag,
            snap,
            base,
            i > 0,
        )?;
        info!("{}/{} transferred", i + 1, total);
    }
    info!("Transfer complete");
    Ok(())
}

/// Finds the latest snapshot that exists on both sides, matching by guid.
/// Ties on timestamp are broken by guid; the winner must be the latest
/// common snapshot on both sides.
fn determine_latest_common<'a>(
    source_snaps: &'a [Snapshot],
    dest_snaps: &'a [Snapshot],
) -> Option<(&'a Snapshot, &'a Snapshot)> {
    let source_by_guid: HashMap<u64, &Snapshot> =
        source_snaps.iter().map(|s| (s.guid, s)).collect();
    let dest_by_guid: HashMap<u64, &Snapshot> = dest_snaps.iter().map(|s| (s.guid, s)).collect();

    let common: Vec<u64> = source_by_guid
        .keys()
        .filter(|g| dest_by_guid.contains_key(g))
        .copied()
        .collect();
    if common.is_empty() {
        return None;
    }

    let latest_src = common
        .iter()
        .copied()
        .max_by_key(|g| (source_by_guid[g].timestamp, *g))
        .unwrap();
    let latest_dest = common
        .iter()
        .copied()
        .max_by_key(|g| (dest_by_guid[g].timestamp, *g))
        .unwrap();
    assert_eq!(
        latest_src, latest_dest,
        "latest common snapshot differs between source and destination"
    );

    let pair = (source_by_guid[&latest_src], dest_by_guid[&latest_src]);
    debug!(
        "Latest common snapshot is '{}' on source, '{}' on destination",
        pair.0.longname(),
        pair.1.longname()
    );
    Some(pair)
}

/// The transfer sequence, oldest first: from the latest common snapshot up
/// to the newest source snapshot.
fn plan_transfer_sequence(source_snaps: &[Snapshot], base_guid: u64) -> Vec<&Snapshot> {
    let base_index = match source_snaps.iter().position(|s| s.guid == base_guid) {
        Some(i) => i,
        None => return Vec::new(),
    };
    source_snaps[..=base_index].iter().rev().collect()
}

/// Incremental sends require strictly increasing timestamps; two snapshots
/// sharing one second cannot be distinguished deterministically.
fn check_transfer_timestamps(
    sequence: &[&Snapshot],
    source_dataset: &str,
    dest_dataset: &str,
) -> Result<(), ReplicationError> {
    for pair in sequence.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if a.timestamp == b.timestamp {
            return Err(ReplicationError::SharedTimestamp {
                src_dataset: source_dataset.to_owned(),
                dest: dest_dataset.to_owned(),
                snap: b.shortname.clone(),
                base: a.shortname.clone(),
            });
        }
    }
    Ok(())
}

/// Ensures the latest common snapshot is held on both sides and removes the
/// system hold tag from every other snapshot. After completion either no
/// system holds exist on either side (no common snapshot), or exactly one
/// per side, on the latest common snapshot.
fn ensure_holds(
    machines: (&Machine, &Machine),
    snaps: (&[Snapshot], &[Snapshot]),
    holdtags: (&str, &str),
    datasets: (&str, &str),
    latest_common: Option<(&Snapshot, &Snapshot)>,
) -> Result<(), ReplicationError> {
    let (source, dest) = machines;
    let (source_tag, dest_tag) = holdtags;

    let source_holds = holds_by_snapshot(source, snaps.0)?;
    let dest_holds = holds_by_snapshot(dest, snaps.1)?;
    let has_tag = |holds: &HashMap<String, HashSet<String>>, name: &str, tag: &str| {
        holds.get(name).map_or(false, |tags| tags.contains(tag))
    };

    let keep_guids = match latest_common {
        None => (None, None),
        Some((src_snap, dest_snap)) => {
            if !has_tag(&source_holds, &src_snap.longname(), source_tag) {
                info!(
                    "Creating hold for latest common snapshot '{}' on source '{}'",
                    src_snap.shortname, src_snap.dataset
                );
                source.hold(&[src_snap.longname()], source_tag)?;
            }
            if !has_tag(&dest_holds, &dest_snap.longname(), dest_tag) {
                info!(
                    "Creating hold for latest common snapshot '{}' on destination '{}'",
                    dest_snap.shortname, dest_snap.dataset
                );
                dest.hold(&[dest_snap.longname()], dest_tag)?;
            }
            (Some(src_snap.guid), Some(dest_snap.guid))
        }
    };

    let release_src: Vec<String> = snaps
        .0
        .iter()
        .filter(|s| Some(s.guid) != keep_guids.0)
        .map(|s| s.longname())
        .filter(|n| has_tag(&source_holds, n, source_tag))
        .collect();
    let release_dest: Vec<String> = snaps
        .1
        .iter()
        .filter(|s| Some(s.guid) != keep_guids.1)
        .map(|s| s.longname())
        .filter(|n| has_tag(&dest_holds, n, dest_tag))
        .collect();

    if !release_src.is_empty() {
        info!(
            "Releasing {} obsolete holds in source '{}'",
            release_src.len(),
            datasets.0
        );
    }
    if !release_dest.is_empty() {
        info!(
            "Releasing {} obsolete holds in destination '{}'",
            release_dest.len(),
            datasets.1
        );
    }
    source.release_hold(&release_src, source_tag)?;
    dest.release_hold(&release_dest, dest_tag)?;
    Ok(())
}

fn holds_by_snapshot(
    machine: &Machine,
    snaps: &[Snapshot],
) -> Result<HashMap<String, HashSet<String>>, MachineError> {
    let longnames: Vec<String> = snaps.iter().map(|s| s.longname()).collect();
    let mut holds: HashMap<String, HashSet<String>> = longnames
        .iter()
        .map(|n| (n.clone(), HashSet::new()))
        .collect();
    for hold in machine.get_holds(&longnames)? {
        holds.entry(hold.snap_longname).or_default().insert(hold.tag);
    }
    Ok(holds)
}

/// Full send of the oldest snapshot to bring an absent destination dataset
/// into existence. The received properties keep the new copy inert: it must
/// not be mounted or modified behind the replication stream's back.
fn send_receive_initial(
    source: &Machine,
    dest: &Machine,
    snapshot: &Snapshot,
    dest_dataset: &str,
    source_kind: DatasetKind,
) -> Result<(), ReplicationError> {
    let mut properties: Vec<(&str, String)> = vec![(PROP_READONLY, S("on"))];
    if source_kind == DatasetKind::Filesystem {
        properties.push((PROP_ATIME, S("off")));
        properties.push((PROP_CANMOUNT, S("off")));
        properties.push((PROP_MOUNTPOINT, S("none")));
    }
    sendrecv::transfer(
        source,
        dest,
        &snapshot.longname(),
        None,
        dest_dataset,
        &properties,
    )?;

    copy_tags(dest, snapshot, dest_dataset)?;

    // The destination dataset exists only now, so its guid (and with it the
    // source-side hold tag) could not be resolved earlier.
    let source_tag = holdtag_src(&dest.get_dataset(dest_dataset)?);
    let dest_tag = holdtag_dest(&source.get_dataset(&snapshot.dataset)?);
    source.hold(&[snapshot.longname()], &source_tag)?;
    dest.hold(&[snapshot.with_dataset(dest_dataset).longname()], &dest_tag)?;
    Ok(())
}

/// One incremental step: send `snapshot` against `base`, copy its tags,
/// pin it on both sides, then release the previous base. With
/// `unsafe_release` the per-snapshot hold probe is skipped; the caller
/// knows the hold exists because it placed it in the previous step.
#[allow(clippy::too_many_arguments)]
fn send_receive_incremental(
    source: &Machine,
    dest: &Machine,
    dest_dataset: &str,
    source_tag: &str,
    dest_tag: &str,
    snapshot: &Snapshot,
    base: &Snapshot,
    unsafe_release: bool,
) -> Result<(), ReplicationError> {
    sendrecv::transfer(
        source,
        dest,
        &snapshot.longname(),
        Some(&base.longname()),
        dest_dataset,
        &[],
    )?;

    copy_tags(dest, snapshot, dest_dataset)?;
    source.hold(&[snapshot.longname()], source_tag)?;
    dest.hold(&[snapshot.with_dataset(dest_dataset).longname()], dest_tag)?;

    let base_name = base.longname();
    if unsafe_release || source.has_hold(&base_name, source_tag)? {
        source.release_hold(&[base_name], source_tag)?;
    }
    let base_name = base.with_dataset(dest_dataset).longname();
    if unsafe_release || dest.has_hold(&base_name, dest_tag)? {
        dest.release_hold(&[base_name], dest_tag)?;
    }
    Ok(())
}

/// Externally created snapshots (tags unset) stay unmanaged on the
/// destination as well.
fn copy_tags(dest: &Machine, snapshot: &Snapshot, dest_dataset: &str) -> Result<(), MachineError> {
    if let Tags::Set(tags) = &snapshot.tags {
        dest.set_tags(&snapshot.with_dataset(dest_dataset).longname(), tags)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::fake_snapshot;

    #[test]
    fn holdtags_embed_the_peer_dataset_guid() {
        let dest_ds = Dataset {
            name: "backup/web".to_owned(),
            guid: 111,
            kind: DatasetKind::Filesystem,
        };
        let src_ds = Dataset {
            name: "tank/web".to_owned(),
            guid: 222,
            kind: DatasetKind::Filesystem,
        };
        assert_eq!(holdtag_src(&dest_ds), "zfsnappr-sendbase-111");
        assert_eq!(holdtag_dest(&src_ds), "zfsnappr-recvbase-222");
    }

    #[test]
    fn latest_common_and_transfer_sequence() {
        // source {e,d,c,b,a} newest first, destination {c,b,a}: latest
        // common is c, and d then e get transferred
        let source: Vec<Snapshot> = [("e", 5u64), ("d", 4), ("c", 3), ("b", 2), ("a", 1)]
            .iter()
            .map(|(n, g)| fake_snapshot("tank/web", n, *g, 1000 + *g as i64))
            .collect();
        let dest: Vec<Snapshot> = [("c", 3u64), ("b", 2), ("a", 1)]
            .iter()
            .map(|(n, g)| fake_snapshot("backup/web", n, *g, 1000 + *g as i64))
            .collect();

        let (src_base, dest_base) = determine_latest_common(&source, &dest).unwrap();
        assert_eq!(src_base.shortname, "c");
        assert_eq!(dest_base.dataset, "backup/web");

        let sequence = plan_transfer_sequence(&source, src_base.guid);
        let names: Vec<&str> = sequence.iter().map(|s| s.shortname.as_str()).collect();
        assert_eq!(names, ["c", "d", "e"]);
        check_transfer_timestamps(&sequence, "tank/web", "backup/web").unwrap();
    }

    #[test]
    fn no_common_snapshot_when_guids_are_disjoint() {
        let source = vec![fake_snapshot("tank/web", "a", 1, 1000)];
        let dest = vec![fake_snapshot("backup/web", "b", 2, 1000)];
        assert!(determine_latest_common(&source, &dest).is_none());
    }

    #[test]
    fn latest_common_breaks_timestamp_ties_by_guid() {
        let source = vec![
            fake_snapshot("tank/web", "x", 9, 1000),
            fake_snapshot("tank/web", "y", 5, 1000),
        ];
        let dest = vec![
            fake_snapshot("backup/web", "x", 9, 1000),
            fake_snapshot("backup/web", "y", 5, 1000),
        ];
        let (src_base, _) = determine_latest_common(&source, &dest).unwrap();
        assert_eq!(src_base.guid, 9);
    }

    #[test]
    fn up_to_date_sequence_has_nothing_to_transfer() {
        let source = vec![
            fake_snapshot("tank/web", "b", 2, 2000),
            fake_snapshot("tank/web", "a", 1, 1000),
        ];
        let sequence = plan_transfer_sequence(&source, 2);
        assert_eq!(sequence.len(), 1);
    }

    #[test]
    fn shared_timestamps_fail_the_preflight_check() {
        let source = vec![
            fake_snapshot("tank/web", "c", 3, 2000),
            fake_snapshot("tank/web", "b", 2, 1000),
            fake_snapshot("tank/web", "a", 1, 1000),
        ];
        let sequence = plan_transfer_sequence(&source, 1);
        let err = check_transfer_timestamps(&sequence, "tank/web", "backup/web").unwrap_err();
        match err {
            ReplicationError::SharedTimestamp { snap, base, .. } => {
                assert_eq!(base, "a");
                assert_eq!(snap, "b");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn hierarchy_groups_order_parents_before_children() {
        let snaps = vec![
            fake_snapshot("tank/a/b", "s", 1, 3000),
            fake_snapshot("tank", "s", 2, 2000),
            fake_snapshot("tank/a", "s", 3, 1000),
            fake_snapshot("tank/a", "older", 4, 500),
        ];
        let groups = ordered_groups(&snaps);
        let names: Vec<&str> = groups.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["tank", "tank/a", "tank/a/b"]);
        // within a group the input (newest first) order is preserved
        let tank_a = &groups[1].1;
        assert_eq!(tank_a[0].shortname, "s");
        assert_eq!(tank_a[1].shortname, "older");
    }
}
