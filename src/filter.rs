use std::collections::{BTreeSet, HashSet};

use crate::dataset::{Snapshot, Tags};

/// A tag group is one conjunction: a snapshot satisfies it iff it carries all
/// of the group's tags. Two special single-element groups exist: `{"UNSET"}`
/// matches snapshots whose tags were never managed, `{""}` matches snapshots
/// with a managed but empty tag set.
pub type TagGroup = BTreeSet<String>;

/// Each `--tag` argument is a comma-separated conjunction group; repeating
/// the option adds alternatives.
pub fn parse_tag_groups(args: &[String]) -> Option<Vec<TagGroup>> {
    if args.is_empty() {
        return None;
    }
    Some(
        args.iter()
            .map(|arg| arg.split(',').map(str::to_owned).collect())
            .collect(),
    )
}

pub fn parse_shortnames(args: &[String]) -> Option<HashSet<String>> {
    if args.is_empty() {
        return None;
    }
    Some(args.iter().cloned().collect())
}

fn matches_group(tags: &Tags, group: &TagGroup) -> bool {
    let single = (group.len() == 1).then(|| group.iter().next().unwrap().as_str());
    match tags {
        Tags::Unset => single == Some("UNSET"),
        Tags::Set(set) => {
            if set.is_empty() && single == Some("") {
                return true;
            }
            group.iter().all(|t| set.contains(t))
        }
    }
}

/// Keeps snapshots that satisfy at least one tag group (when given) and
/// whose shortname is in the shortname set (when given).
pub fn filter_snaps(
    snapshots: Vec<Snapshot>,
    tag_groups: Option<&[TagGroup]>,
    shortnames: Option<&HashSet<String>>,
) -> Vec<Snapshot> {
    snapshots
        .into_iter()
        .filter(|snap| {
            if let Some(groups) = tag_groups {
                if !groups.iter().any(|g| matches_group(&snap.tags, g)) {
                    return false;
                }
            }
            if let Some(shortnames) = shortnames {
                if !shortnames.contains(&snap.shortname) {
                    return false;
                }
            }
            true
        })
        .collect()
}

#[cfg(test)]
fn tagged(shortname: &str, guid: u64, tags: Tags) -> Snapshot {
    let mut snap = crate::dataset::fake_snapshot("tank", shortname, guid, 1000);
    snap.tags = tags;
    snap
}

#[cfg(test)]
fn tag_set(tags: &[&str]) -> Tags {
    Tags::Set(tags.iter().map(|t| t.to_string()).collect())
}

#[test]
fn test_tag_groups() {
    let snaps = vec![
        tagged("external", 1, Tags::Unset),
        tagged("bare", 2, tag_set(&[])),
        tagged("daily", 3, tag_set(&["daily"])),
        tagged("both", 4, tag_set(&["daily", "weekly"])),
    ];

    // one group: all tags required
    let groups = parse_tag_groups(&["daily,weekly".to_owned()]).unwrap();
    let kept = filter_snaps(snaps.clone(), Some(&groups), None);
    let names: Vec<&str> = kept.iter().map(|s| s.shortname.as_str()).collect();
    assert_eq!(names, ["both"]);

    // two groups: either suffices
    let groups = parse_tag_groups(&["daily".to_owned(), "UNSET".to_owned()]).unwrap();
    let kept = filter_snaps(snaps.clone(), Some(&groups), None);
    let names: Vec<&str> = kept.iter().map(|s| s.shortname.as_str()).collect();
    assert_eq!(names, ["external", "daily", "both"]);

    // empty tag value matches managed-but-empty only
    let groups = parse_tag_groups(&["".to_owned()]).unwrap();
    let kept = filter_snaps(snaps.clone(), Some(&groups), None);
    let names: Vec<&str> = kept.iter().map(|s| s.shortname.as_str()).collect();
    assert_eq!(names, ["bare"]);

    // UNSET never matches managed snapshots, and unset tags never match
    // ordinary groups
    let groups = parse_tag_groups(&["UNSET".to_owned()]).unwrap();
    let kept = filter_snaps(snaps, Some(&groups), None);
    let names: Vec<&str> = kept.iter().map(|s| s.shortname.as_str()).collect();
    assert_eq!(names, ["external"]);
}

#[test]
fn test_shortname_filter_conjunctive_with_tags() {
    let snaps = vec![
        tagged("a", 1, tag_set(&["daily"])),
        tagged("b", 2, tag_set(&["daily"])),
        tagged("c", 3, tag_set(&[])),
    ];
    let groups = parse_tag_groups(&["daily".to_owned()]).unwrap();
    let shortnames = parse_shortnames(&["b".to_owned(), "c".to_owned()]).unwrap();
    let kept = filter_snaps(snaps, Some(&groups), Some(&shortnames));
    let names: Vec<&str> = kept.iter().map(|s| s.shortname.as_str()).collect();
    assert_eq!(names, ["b"]);
}

#[test]
fn test_no_filters_keep_everything() {
    let snaps = vec![tagged("a", 1, Tags::Unset)];
    assert_eq!(parse_tag_groups(&[]), None);
    assert_eq!(parse_shortnames(&[]), None);
    let kept = filter_snaps(snaps, None, None);
    assert_eq!(kept.len(), 1);
}
