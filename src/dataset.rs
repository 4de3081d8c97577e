use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Property names understood by `zfs list`/`zfs get`.
pub const PROP_NAME: &str = "name";
pub const PROP_CREATION: &str = "creation";
pub const PROP_GUID: &str = "guid";
pub const PROP_USERREFS: &str = "userrefs";
pub const PROP_TYPE: &str = "type";
pub const PROP_READONLY: &str = "readonly";
pub const PROP_ATIME: &str = "atime";
pub const PROP_CANMOUNT: &str = "canmount";
pub const PROP_MOUNTPOINT: &str = "mountpoint";
/// The user property used to store and read tags.
pub const PROP_CUSTOM_TAGS: &str = "zfsnappr:tags";

/// Properties that are fetched on every snapshot listing.
pub const REQUIRED_PROPS: [&str; 6] = [
    PROP_NAME,
    PROP_CREATION,
    PROP_GUID,
    PROP_CUSTOM_TAGS,
    PROP_USERREFS,
    PROP_TYPE,
];

/// Tag sets distinguish "never managed" from "managed, none set".
/// A snapshot whose tag property reads `-` was created outside of zfsnappr
/// and its tags are `Unset`; an empty property value means `Set(∅)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tags {
    Unset,
    Set(BTreeSet<String>),
}

impl Tags {
    /// Parses the raw `zfsnappr:tags` property value. Empty items are ignored.
    pub fn parse(value: &str) -> Tags {
        if value == "-" {
            return Tags::Unset;
        }
        Tags::Set(
            value
                .split(',')
                .filter(|t| !t.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    pub fn join(&self) -> String {
        match self {
            Tags::Unset => "UNSET".to_owned(),
            Tags::Set(tags) => tags.iter().cloned().collect::<Vec<_>>().join(","),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub dataset: String,
    pub shortname: String,
    pub guid: u64,
    pub timestamp: DateTime<Utc>,
    pub tags: Tags,
    pub holds: u32,
    /// The full property bag as returned by the store; unset values are `-`.
    pub properties: HashMap<String, String>,
}

impl Snapshot {
    pub fn longname(&self) -> String {
        format!("{}@{}", self.dataset, self.shortname)
    }

    /// The same snapshot as it would appear under another dataset.
    pub fn with_dataset(&self, dataset: &str) -> Snapshot {
        let mut snap = self.clone();
        snap.dataset = dataset.to_owned();
        snap.properties.insert(PROP_NAME.to_owned(), snap.longname());
        snap
    }

    pub fn with_shortname(&self, shortname: &str) -> Snapshot {
        let mut snap = self.clone();
        snap.shortname = shortname.to_owned();
        snap.properties.insert(PROP_NAME.to_owned(), snap.longname());
        snap
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}@{}", self.dataset, self.shortname)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Filesystem,
    Volume,
    Snapshot,
    Bookmark,
}

#[derive(Error, Debug)]
#[error("unknown dataset type '{0}'")]
pub struct DatasetKindParseError(String);

impl FromStr for DatasetKind {
    type Err = DatasetKindParseError;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "filesystem" => DatasetKind::Filesystem,
            "volume" => DatasetKind::Volume,
            "snapshot" => DatasetKind::Snapshot,
            "bookmark" => DatasetKind::Bookmark,
            other => return Err(DatasetKindParseError(other.to_owned())),
        })
    }
}

/// A filesystem or volume in the storage tree.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub guid: u64,
    pub kind: DatasetKind,
}

/// A named reference preventing destruction of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hold {
    pub snap_longname: String,
    pub tag: String,
}

/// Number of `/`-separated segments; parents have smaller depth than children.
pub fn dataset_depth(dataset: &str) -> usize {
    dataset.split('/').count()
}

/// Splits snapshots into per-dataset groups, in order of first appearance.
/// The order of snapshots within each group is preserved.
pub fn group_by_dataset(snapshots: &[Snapshot]) -> Vec<(String, Vec<Snapshot>)> {
    let mut groups: Vec<(String, Vec<Snapshot>)> = Vec::new();
    for snap in snapshots {
        match groups.iter_mut().find(|(name, _)| *name == snap.dataset) {
            Some((_, group)) => group.push(snap.clone()),
            None => groups.push((snap.dataset.clone(), vec![snap.clone()])),
        }
    }
    groups
}

#[cfg(test)]
pub(crate) fn fake_snapshot(dataset: &str, shortname: &str, guid: u64, epoch: i64) -> Snapshot {
    use chrono::TimeZone;
    Snapshot {
        dataset: dataset.to_owned(),
        shortname: shortname.to_owned(),
        guid,
        timestamp: Utc.timestamp_opt(epoch, 0).unwrap(),
        tags: Tags::Unset,
        holds: 0,
        properties: HashMap::new(),
    }
}

#[test]
fn test_tags_parse() {
    assert_eq!(Tags::parse("-"), Tags::Unset);
    assert_eq!(Tags::parse(""), Tags::Set(BTreeSet::new()));
    let parsed = Tags::parse("b,a,,b");
    let expected: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
    assert_eq!(parsed, Tags::Set(expected));
    assert_eq!(parsed.join(), "a,b");
    assert_eq!(Tags::Unset.join(), "UNSET");
}

#[test]
fn test_with_dataset() {
    let snap = fake_snapshot("tank/webdata", "abc", 7, 1_600_000_000);
    assert_eq!(snap.longname(), "tank/webdata@abc");
    let moved = snap.with_dataset("backup/webdata");
    assert_eq!(moved.longname(), "backup/webdata@abc");
    assert_eq!(moved.guid, snap.guid);
    assert_eq!(moved.properties[PROP_NAME], "backup/webdata@abc");
    let renamed = snap.with_shortname("def");
    assert_eq!(renamed.longname(), "tank/webdata@def");
}

#[test]
fn test_dataset_depth() {
    assert_eq!(dataset_depth("tank"), 1);
    assert_eq!(dataset_depth("tank/a/b"), 3);
}
