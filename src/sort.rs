use crate::dataset::{dataset_depth, Snapshot};

/// Canonical snapshot order: by timestamp, then dataset depth (parents before
/// children taken at the same instant), then dataset name, then guid.
pub fn sort_snaps_by_time(mut snaps: Vec<Snapshot>, reverse: bool) -> Vec<Snapshot> {
    snaps.sort_by(|a, b| {
        let ka = (a.timestamp, dataset_depth(&a.dataset), a.dataset.as_str(), a.guid);
        let kb = (b.timestamp, dataset_depth(&b.dataset), b.dataset.as_str(), b.guid);
        ka.cmp(&kb)
    });
    if reverse {
        snaps.reverse();
    }
    snaps
}

#[test]
fn test_sort_snaps_by_time() {
    use crate::dataset::fake_snapshot;

    let snaps = vec![
        fake_snapshot("tank/a/b", "child", 4, 100),
        fake_snapshot("tank/a", "parent", 3, 100),
        fake_snapshot("tank", "newest", 1, 300),
        fake_snapshot("tank", "oldest", 2, 50),
    ];

    let sorted = sort_snaps_by_time(snaps.clone(), false);
    let names: Vec<&str> = sorted.iter().map(|s| s.shortname.as_str()).collect();
    assert_eq!(names, ["oldest", "parent", "child", "newest"]);

    let reversed = sort_snaps_by_time(snaps, true);
    let names: Vec<&str> = reversed.iter().map(|s| s.shortname.as_str()).collect();
    assert_eq!(names, ["newest", "child", "parent", "oldest"]);
}

#[test]
fn test_sort_breaks_timestamp_ties_by_guid() {
    use crate::dataset::fake_snapshot;

    let snaps = vec![
        fake_snapshot("tank", "b", 20, 100),
        fake_snapshot("tank", "a", 10, 100),
    ];
    let sorted = sort_snaps_by_time(snaps, false);
    assert_eq!(sorted[0].guid, 10);
    assert_eq!(sorted[1].guid, 20);
}
