use std::collections::{BTreeSet, HashMap};

use anyhow::bail;
use itertools::Itertools;
use log::{info, warn};

use crate::dataset::{Snapshot, Tags, PROP_CUSTOM_TAGS};
use crate::filter::{filter_snaps, parse_shortnames, parse_tag_groups};
use crate::machine::{parse_spec, Machine, SpecParseError};
use crate::prune::{prune_snapshots, GroupBy};
use crate::replicate::{replicate, ReplicateOpts};
use crate::retention::KeepPolicy;
use crate::sort::sort_snaps_by_time;

const COLUMN_SEPARATOR: &str = " | ";
const TAG_SEPARATOR: char = '_';

/// No endpoint spec means the local host and no dataset restriction.
fn resolve(spec: Option<&str>) -> Result<(Machine, Option<String>), SpecParseError> {
    match spec {
        None => Ok((Machine::Local, None)),
        Some(spec) => parse_spec(spec),
    }
}

fn require_dataset(dataset: Option<String>) -> Result<String, SpecParseError> {
    dataset.ok_or(SpecParseError::NoDataset)
}

fn get_n_random_chars(n: usize) -> String {
    use rand::distributions::Alphanumeric;
    use rand::{thread_rng, Rng};

    thread_rng()
        .sample_iter(Alphanumeric)
        .map(char::from)
        .take(n)
        .collect()
}

pub struct ListArgs {
    pub spec: Option<String>,
    pub recursive: bool,
    pub tags: Vec<String>,
}

pub fn list(args: ListArgs) -> anyhow::Result<()> {
    let (machine, dataset) = resolve(args.spec.as_deref())?;

    let snaps = machine.get_snapshots(dataset.as_deref(), args.recursive, &[], &[])?;
    let mut snaps = filter_snaps(snaps, parse_tag_groups(&args.tags).as_deref(), None);
    snaps.sort_by(|a, b| (a.timestamp, a.guid).cmp(&(b.timestamp, b.guid)));

    // resolve hold tags for all snapshots in one batched call
    let longnames: Vec<String> = snaps.iter().map(|s| s.longname()).collect();
    let mut holdtags: HashMap<String, BTreeSet<String>> = longnames
        .iter()
        .map(|n| (n.clone(), BTreeSet::new()))
        .collect();
    for hold in machine.get_holds(&longnames)? {
        holdtags.entry(hold.snap_longname).or_default().insert(hold.tag);
    }

    type Getter = Box<dyn Fn(&Snapshot) -> String>;
    let fields: Vec<(&str, Getter)> = vec![
        ("DATASET", Box::new(|s: &Snapshot| s.dataset.clone())),
        ("SHORT NAME", Box::new(|s: &Snapshot| s.shortname.clone())),
        ("TAGS", Box::new(|s: &Snapshot| s.tags.join())),
        (
            "TIMESTAMP",
            Box::new(|s: &Snapshot| s.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
        ),
        (
            "HOLDS",
            Box::new(move |s: &Snapshot| {
                holdtags
                    .get(&s.longname())
                    .map(|tags| tags.iter().cloned().collect::<Vec<_>>().join(","))
                    .unwrap_or_default()
            }),
        ),
    ];

    let widths: Vec<usize> = fields
        .iter()
        .map(|(name, get)| {
            snaps
                .iter()
                .map(|s| get(s).len())
                .chain([name.len()])
                .max()
                .unwrap_or(0)
        })
        .collect();

    let header = fields
        .iter()
        .zip(&widths)
        .map(|((name, _), width)| format!("{:<width$}", name, width = *width))
        .join(COLUMN_SEPARATOR);
    let total_width = widths.iter().sum::<usize>()
        + COLUMN_SEPARATOR.len() * (fields.len().max(1) - 1);
    info!("{}", header);
    info!("{}", "-".repeat(total_width));
    for snap in &snaps {
        let row = fields
            .iter()
            .zip(&widths)
            .map(|((_, get), width)| format!("{:<width$}", get(snap), width = *width))
            .join(COLUMN_SEPARATOR);
        info!("{}", row);
    }
    Ok(())
}

pub struct CreateArgs {
    pub spec: Option<String>,
    pub recursive: bool,
    pub tags: Vec<String>,
}

pub fn create(args: CreateArgs) -> anyhow::Result<()> {
    let (machine, dataset) = resolve(args.spec.as_deref())?;
    let dataset = require_dataset(dataset)?;

    // 10 random alnum chars give about 59.5 bits, plenty within one dataset;
    // the 64-bit guid is the real identifier anyway
    let shortname = get_n_random_chars(10);
    let longname = format!("{dataset}@{shortname}");

    machine.create_snapshot(
        &longname,
        args.recursive,
        &[(PROP_CUSTOM_TAGS, args.tags.join(","))],
    )?;

    info!("Created snapshot {longname}");
    Ok(())
}

pub struct PruneArgs {
    pub spec: Option<String>,
    pub recursive: bool,
    pub dry_run: bool,
    pub tags: Vec<String>,
    pub shortnames: Vec<String>,
    pub policy: KeepPolicy,
    pub group_by: GroupBy,
}

pub fn prune(args: PruneArgs) -> anyhow::Result<()> {
    let (machine, dataset) = resolve(args.spec.as_deref())?;
    let dataset = require_dataset(dataset)?;

    let snaps = machine.get_snapshots(Some(&dataset), args.recursive, &[], &[])?;
    let snaps = filter_snaps(
        snaps,
        parse_tag_groups(&args.tags).as_deref(),
        parse_shortnames(&args.shortnames).as_ref(),
    );
    let snaps = sort_snaps_by_time(snaps, false);
    if snaps.is_empty() {
        info!("No matching snapshots, nothing to do");
        return Ok(());
    }

    prune_snapshots(
        &machine,
        &snaps,
        &args.policy,
        args.group_by,
        args.dry_run,
        // explicitly named snapshots may be destroyed down to the last one
        !args.shortnames.is_empty(),
    )?;
    Ok(())
}

pub struct ReplicateArgs {
    pub spec: Option<String>,
    pub remote: String,
    pub recursive: bool,
    pub dry_run: bool,
    pub init: bool,
    pub rollback: bool,
    pub exclude_datasets: Vec<String>,
}

impl ReplicateArgs {
    fn opts(&self) -> ReplicateOpts {
        ReplicateOpts {
            recursive: self.recursive,
            initialize: self.init,
            rollback: self.rollback,
            exclude_datasets: self.exclude_datasets.clone(),
        }
    }
}

pub fn push(args: ReplicateArgs) -> anyhow::Result<()> {
    let (source, source_dataset) = resolve(args.spec.as_deref())?;
    let source_dataset = require_dataset(source_dataset)?;
    let (dest, dest_dataset) = parse_spec(&args.remote)?;
    let dest_dataset = require_dataset(dest_dataset)?;

    if args.dry_run {
        warn!("Dry-run is not supported for replication, ignoring");
    }
    info!("Pushing from source dataset \"{source_dataset}\" to dest dataset \"{dest_dataset}\"");
    replicate(&source, &source_dataset, &dest, &dest_dataset, &args.opts())?;
    Ok(())
}

pub fn pull(args: ReplicateArgs) -> anyhow::Result<()> {
    let (dest, dest_dataset) = resolve(args.spec.as_deref())?;
    let dest_dataset = require_dataset(dest_dataset)?;
    let (source, source_dataset) = parse_spec(&args.remote)?;
    let source_dataset = require_dataset(source_dataset)?;

    if args.dry_run {
        warn!("Dry-run is not supported for replication, ignoring");
    }
    info!("Pulling from source dataset \"{source_dataset}\" to dest dataset \"{dest_dataset}\"");
    replicate(&source, &source_dataset, &dest, &dest_dataset, &args.opts())?;
    Ok(())
}

pub struct TagArgs {
    pub spec: Option<String>,
    pub recursive: bool,
    pub tags: Vec<String>,
    pub shortnames: Vec<String>,
    pub set_from_prop: Option<String>,
    pub set_from_name: bool,
    pub add_from_prop: Option<String>,
    pub add_from_name: bool,
}

enum TagSource {
    Name,
    Prop(String),
}

enum TagAction {
    Set,
    Add,
}

/// Tags encoded in the shortname, separated by `_`; the first component is
/// the name proper.
fn tags_from_name(snap: &Snapshot) -> Option<BTreeSet<String>> {
    let mut parts = snap.shortname.split(TAG_SEPARATOR).filter(|p| !p.is_empty());
    let _name = parts.next();
    let tags: BTreeSet<String> = parts.map(str::to_owned).collect();
    (!tags.is_empty()).then_some(tags)
}

fn tags_from_prop(snap: &Snapshot, property: &str) -> Option<BTreeSet<String>> {
    let value = snap.properties.get(property)?;
    if value == "-" {
        return None;
    }
    Some(
        value
            .split(',')
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect(),
    )
}

pub fn tag(args: TagArgs) -> anyhow::Result<()> {
    let (machine, dataset) = resolve(args.spec.as_deref())?;
    let dataset = require_dataset(dataset)?;

    // SET forces a managed tag set even when the source yields nothing;
    // ADD leaves unmanaged snapshots alone in that case
    let mut operations: Vec<(TagSource, TagAction)> = Vec::new();
    if args.set_from_name {
        operations.push((TagSource::Name, TagAction::Set));
    }
    if let Some(prop) = args.set_from_prop {
        operations.push((TagSource::Prop(prop), TagAction::Set));
    }
    if args.add_from_name {
        operations.push((TagSource::Name, TagAction::Add));
    }
    if let Some(prop) = args.add_from_prop {
        operations.push((TagSource::Prop(prop), TagAction::Add));
    }
    if operations.is_empty() {
        info!("No tag operations specified, nothing to do");
        return Ok(());
    }

    let extra_props: Vec<&str> = operations
        .iter()
        .filter_map(|(source, _)| match source {
            TagSource::Prop(prop) => Some(prop.as_str()),
            TagSource::Name => None,
        })
        .collect();

    let snaps = machine.get_snapshots(Some(&dataset), args.recursive, &extra_props, &[])?;
    let snaps = filter_snaps(
        snaps,
        parse_tag_groups(&args.tags).as_deref(),
        parse_shortnames(&args.shortnames).as_ref(),
    );
    if snaps.is_empty() {
        info!("No snapshots, nothing to do");
        return Ok(());
    }

    for snap in &snaps {
        // every operation starts over from the listed tags and writes on its
        // own; combining operations means the last write wins, they do not
        // compose
        for (source, action) in &operations {
            let new_tags = match source {
                TagSource::Name => tags_from_name(snap),
                TagSource::Prop(prop) => tags_from_prop(snap, prop),
            };
            let tags = match action {
                TagAction::Set => Tags::Set(new_tags.unwrap_or_default()),
                TagAction::Add => match new_tags {
                    Some(new_tags) => {
                        let mut merged = match &snap.tags {
                            Tags::Set(set) => set.clone(),
                            Tags::Unset => BTreeSet::new(),
                        };
                        merged.extend(new_tags);
                        Tags::Set(merged)
                    }
                    None => snap.tags.clone(),
                },
            };
            if tags != snap.tags {
                if let Tags::Set(set) = &tags {
                    machine.set_tags(&snap.longname(), set)?;
                }
            }
        }
    }
    Ok(())
}

pub struct UnholdArgs {
    pub spec: Option<String>,
    pub recursive: bool,
    pub shortnames: Vec<String>,
}

/// Releases every zfsnappr-owned hold on the matching snapshots. Escape
/// hatch for holds left behind by an interrupted replication; snapshots
/// released this way become prunable again.
pub fn unhold(args: UnholdArgs) -> anyhow::Result<()> {
    let (machine, dataset) = resolve(args.spec.as_deref())?;
    let dataset = require_dataset(dataset)?;

    let snaps = machine.get_snapshots(Some(&dataset), args.recursive, &[], &[])?;
    let snaps = filter_snaps(snaps, None, parse_shortnames(&args.shortnames).as_ref());
    let snaps = sort_snaps_by_time(snaps, false);
    if snaps.is_empty() {
        bail!("No matching snapshots");
    }

    let longnames: Vec<String> = snaps.iter().map(|s| s.longname()).collect();
    for hold in machine.get_holds(&longnames)? {
        if hold.tag.starts_with("zfsnappr") {
            info!(
                "Releasing hold '{}' on snapshot {}",
                hold.tag, hold.snap_longname
            );
            machine.release_hold(&[hold.snap_longname.clone()], &hold.tag)?;
        }
    }
    Ok(())
}

pub fn version() -> anyhow::Result<()> {
    info!("zfsnappr {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::fake_snapshot;

    #[test]
    fn random_shortnames_are_alphanumeric() {
        let name = get_n_random_chars(10);
        assert_eq!(name.len(), 10);
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn tags_in_shortname_follow_the_first_separator() {
        let snap = fake_snapshot("tank", "nightly_db_offsite", 1, 1000);
        let tags = tags_from_name(&snap).unwrap();
        let expected: BTreeSet<String> =
            ["db", "offsite"].iter().map(|s| s.to_string()).collect();
        assert_eq!(tags, expected);

        let plain = fake_snapshot("tank", "nightly", 2, 1000);
        assert_eq!(tags_from_name(&plain), None);

        // empty components are skipped
        let odd = fake_snapshot("tank", "_weekly__", 3, 1000);
        assert_eq!(tags_from_name(&odd), None);
    }

    #[test]
    fn property_tags_treat_dash_as_unset() {
        let mut snap = fake_snapshot("tank", "a", 1, 1000);
        snap.properties.insert("backup:labels".to_owned(), "-".to_owned());
        assert_eq!(tags_from_prop(&snap, "backup:labels"), None);

        snap.properties
            .insert("backup:labels".to_owned(), "x,,y".to_owned());
        let tags = tags_from_prop(&snap, "backup:labels").unwrap();
        let expected: BTreeSet<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        assert_eq!(tags, expected);

        assert_eq!(tags_from_prop(&snap, "missing:prop"), None);
    }

    #[test]
    fn resolve_without_spec_is_local() {
        let (machine, dataset) = resolve(None).unwrap();
        assert_eq!(machine, Machine::Local);
        assert_eq!(dataset, None);
        assert!(matches!(
            require_dataset(None),
            Err(SpecParseError::NoDataset)
        ));
    }
}
