use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, Timelike, Utc};
use log::warn;
use regex::Regex;
use thiserror::Error;

use crate::dataset::{Snapshot, Tags};

#[derive(Error, Debug, PartialEq, Eq)]
#[error("failed to parse duration \"{input}\": {message}")]
pub struct DurationParseError {
    pub input: String,
    pub message: String,
}

/// A calendar-aware duration, as written on the command line: `2y3m7d` is
/// two years, three months and seven days. Units are hours, days, weeks,
/// months and years; each may appear at most once.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelDuration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
}

impl RelDuration {
    pub fn is_zero(&self) -> bool {
        *self == RelDuration::default()
    }

    /// The instant this far before `t`. Months and years shift the calendar
    /// date; weeks, days and hours subtract wall-clock time.
    pub fn before(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let months = self.years * 12 + self.months;
        let t = t
            .checked_sub_months(Months::new(months))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let span = Duration::weeks(self.weeks as i64)
            + Duration::days(self.days as i64)
            + Duration::hours(self.hours as i64);
        t.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl FromStr for RelDuration {
    type Err = DurationParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let fail = |message: String| DurationParseError {
            input: input.to_owned(),
            message,
        };

        let mut result = RelDuration::default();
        let mut seen: Vec<char> = Vec::new();
        let mut number = String::new();

        for c in input.chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }
            if number.is_empty() {
                return Err(fail(format!("unit '{c}' is without number")));
            }
            let amount: u32 = number
                .parse()
                .map_err(|_| fail(format!("invalid number \"{number}\"")))?;
            if seen.contains(&c) {
                return Err(fail(format!("duplicate unit '{c}'")));
            }
            match c {
                'h' => result.hours = amount,
                'd' => result.days = amount,
                'w' => result.weeks = amount,
                'm' => result.months = amount,
                'y' => result.years = amount,
                _ => return Err(fail(format!("unknown unit '{c}'"))),
            }
            seen.push(c);
            number.clear();
        }

        if !number.is_empty() {
            return Err(fail(format!("number \"{number}\" is without unit")));
        }
        Ok(result)
    }
}

impl std::fmt::Display for RelDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (amount, unit) in [
            (self.years, 'y'),
            (self.months, 'm'),
            (self.weeks, 'w'),
            (self.days, 'd'),
            (self.hours, 'h'),
        ] {
            if amount != 0 {
                write!(f, "{}{}", amount, unit)?;
            }
        }
        Ok(())
    }
}

pub fn parse_duration(input: &str) -> Result<RelDuration, DurationParseError> {
    input.parse()
}

/// Which snapshots to keep. Counts select the newest snapshot of each
/// distinct bucket value, up to the count; -1 means unlimited, 0 disables
/// the bucket. `within_*` durations keep a representative of every bucket
/// value younger than the duration; zero disables. A snapshot kept by any
/// criterion is kept.
#[derive(Debug, Default, Clone)]
pub struct KeepPolicy {
    pub last: i64,
    pub hourly: i64,
    pub daily: i64,
    pub weekly: i64,
    pub monthly: i64,
    pub yearly: i64,

    pub within: RelDuration,
    pub within_hourly: RelDuration,
    pub within_daily: RelDuration,
    pub within_weekly: RelDuration,
    pub within_monthly: RelDuration,
    pub within_yearly: RelDuration,

    /// Pattern that must match the full shortname; anchor it when compiling.
    pub name: Option<Regex>,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy)]
enum BucketKind {
    Last,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl BucketKind {
    /// Maps a timestamp to its bucket value. `Last` never coalesces, so it
    /// has no value: every snapshot opens a fresh bucket.
    fn value(self, t: DateTime<Utc>) -> Option<i64> {
        let (y, m, d) = (t.year() as i64, t.month() as i64, t.day() as i64);
        Some(match self {
            BucketKind::Last => return None,
            BucketKind::Hourly => y * 1_000_000 + m * 10_000 + d * 100 + t.hour() as i64,
            BucketKind::Daily => y * 10_000 + m * 100 + d,
            BucketKind::Weekly => {
                let week = t.iso_week();
                week.year() as i64 * 100 + week.week() as i64
            }
            BucketKind::Monthly => y * 100 + m,
            BucketKind::Yearly => y,
        })
    }
}

struct CountBucket {
    kind: BucketKind,
    count: i64,
    last: Option<i64>,
}

struct WithinBucket {
    kind: BucketKind,
    cutoff: Option<DateTime<Utc>>,
    last: Option<i64>,
}

impl WithinBucket {
    fn new(kind: BucketKind, within: RelDuration, now: DateTime<Utc>) -> WithinBucket {
        WithinBucket {
            kind,
            cutoff: (!within.is_zero()).then(|| within.before(now)),
            last: None,
        }
    }
}

/// Partitions `snapshots` into those the policy keeps and those it allows to
/// be destroyed. Both lists preserve the input order. `now` is sampled once.
pub fn apply_policy(snapshots: &[Snapshot], policy: &KeepPolicy) -> (Vec<Snapshot>, Vec<Snapshot>) {
    apply_policy_at(snapshots, policy, Utc::now())
}

pub fn apply_policy_at(
    snapshots: &[Snapshot],
    policy: &KeepPolicy,
    now: DateTime<Utc>,
) -> (Vec<Snapshot>, Vec<Snapshot>) {
    // Evaluation must walk snapshots newest first so each bucket retains the
    // newest representative of each bucket value. Guid breaks timestamp ties.
    let mut ordered: Vec<&Snapshot> = snapshots.iter().collect();
    ordered.sort_by(|a, b| (b.timestamp, b.guid).cmp(&(a.timestamp, a.guid)));

    let mut count_buckets = [
        CountBucket { kind: BucketKind::Last, count: policy.last, last: None },
        CountBucket { kind: BucketKind::Hourly, count: policy.hourly, last: None },
        CountBucket { kind: BucketKind::Daily, count: policy.daily, last: None },
        CountBucket { kind: BucketKind::Weekly, count: policy.weekly, last: None },
        CountBucket { kind: BucketKind::Monthly, count: policy.monthly, last: None },
        CountBucket { kind: BucketKind::Yearly, count: policy.yearly, last: None },
    ];
    let mut within_buckets = [
        WithinBucket::new(BucketKind::Last, policy.within, now),
        WithinBucket::new(BucketKind::Hourly, policy.within_hourly, now),
        WithinBucket::new(BucketKind::Daily, policy.within_daily, now),
        WithinBucket::new(BucketKind::Weekly, policy.within_weekly, now),
        WithinBucket::new(BucketKind::Monthly, policy.within_monthly, now),
        WithinBucket::new(BucketKind::Yearly, policy.within_yearly, now),
    ];

    let mut keep_guids: HashSet<u64> = HashSet::new();

    for snap in ordered {
        let mut keep_snap = false;

        if let Some(pattern) = &policy.name {
            if pattern.is_match(&snap.shortname) {
                keep_snap = true;
            }
        }

        if !policy.tags.is_empty() {
            match &snap.tags {
                Tags::Unset => {
                    warn!(
                        "Snapshot {} was created externally and will be kept regardless of keep-tag policy",
                        snap.longname()
                    );
                    keep_snap = true;
                }
                Tags::Set(tags) => {
                    if policy.tags.iter().any(|t| tags.contains(t)) {
                        keep_snap = true;
                    }
                }
            }
        }

        for bucket in &mut count_buckets {
            if bucket.count == 0 {
                continue;
            }
            let value = bucket.kind.value(snap.timestamp);
            if value.is_none() || value != bucket.last {
                keep_snap = true;
                bucket.last = value;
                if bucket.count > 0 {
                    bucket.count -= 1;
                }
            }
        }

        for bucket in &mut within_buckets {
            let Some(cutoff) = bucket.cutoff else { continue };
            if snap.timestamp <= cutoff {
                continue;
            }
            let value = bucket.kind.value(snap.timestamp);
            if value.is_none() || value != bucket.last {
                keep_snap = true;
                bucket.last = value;
            }
        }

        if keep_snap {
            keep_guids.insert(snap.guid);
        }
    }

    let mut keep = Vec::new();
    let mut destroy = Vec::new();
    for snap in snapshots {
        if keep_guids.contains(&snap.guid) {
            keep.push(snap.clone());
        } else {
            destroy.push(snap.clone());
        }
    }
    (keep, destroy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::fake_snapshot;
    use chrono::TimeZone;

    fn hours_ago(now: DateTime<Utc>, guid: u64, hours: i64) -> Snapshot {
        fake_snapshot("tank", &format!("t-{hours}h"), guid, (now - Duration::hours(hours)).timestamp())
    }

    fn days_ago(now: DateTime<Utc>, guid: u64, days: i64) -> Snapshot {
        fake_snapshot("tank", &format!("t-{days}d"), guid, (now - Duration::days(days)).timestamp())
    }

    fn test_now() -> DateTime<Utc> {
        // a fixed mid-day instant so hour/day bucket edges stay away
        Utc.with_ymd_and_hms(2021, 10, 2, 12, 30, 0).unwrap()
    }

    fn shortnames(snaps: &[Snapshot]) -> Vec<&str> {
        snaps.iter().map(|s| s.shortname.as_str()).collect()
    }

    #[test]
    fn parse_duration_accepts_concatenated_units() {
        assert_eq!(
            parse_duration("2y3m5d").unwrap(),
            RelDuration { years: 2, months: 3, weeks: 0, days: 5, hours: 0 }
        );
        assert_eq!(parse_duration("").unwrap(), RelDuration::default());
        assert_eq!(parse_duration("24h").unwrap().hours, 24);
    }

    #[test]
    fn parse_duration_rejects_bad_input() {
        let err = parse_duration("2y3y").unwrap_err();
        assert!(err.message.contains("duplicate unit 'y'"), "{}", err.message);

        let err = parse_duration("5x").unwrap_err();
        assert!(err.message.contains("unknown unit"), "{}", err.message);

        let err = parse_duration("d").unwrap_err();
        assert!(err.message.contains("without number"), "{}", err.message);

        let err = parse_duration("2y3").unwrap_err();
        assert!(err.message.contains("without unit"), "{}", err.message);
    }

    #[test]
    fn duration_roundtrips_through_canonical_format() {
        for input in ["2y3m7d", "1w", "4h", "1y2m3w4d5h"] {
            let parsed = parse_duration(input).unwrap();
            assert_eq!(parsed.to_string(), input);
            assert_eq!(parse_duration(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn duration_subtracts_calendar_months() {
        let t = Utc.with_ymd_and_hms(2021, 3, 31, 0, 0, 0).unwrap();
        let d = parse_duration("1m").unwrap();
        // clamped to the end of February
        assert_eq!(d.before(t), Utc.with_ymd_and_hms(2021, 2, 28, 0, 0, 0).unwrap());
    }

    #[test]
    fn keep_daily_keeps_newest_of_each_day() {
        let now = test_now();
        let snaps: Vec<Snapshot> = (1..=10).map(|d| days_ago(now, d as u64, d)).collect();
        let policy = KeepPolicy { daily: 3, ..Default::default() };
        let (keep, destroy) = apply_policy_at(&snaps, &policy, now);
        assert_eq!(shortnames(&keep), ["t-1d", "t-2d", "t-3d"]);
        assert_eq!(destroy.len(), 7);
    }

    #[test]
    fn count_and_duration_criteria_union() {
        // last=1 keeps the newest; within_hourly=24h keeps one per hour
        // bucket younger than a day
        let now = test_now();
        let snaps = vec![
            hours_ago(now, 1, 1),
            hours_ago(now, 2, 2),
            hours_ago(now, 3, 25),
            hours_ago(now, 4, 26),
        ];
        let policy = KeepPolicy {
            last: 1,
            within_hourly: parse_duration("24h").unwrap(),
            ..Default::default()
        };
        let (keep, destroy) = apply_policy_at(&snaps, &policy, now);
        assert_eq!(shortnames(&keep), ["t-1h", "t-2h"]);
        assert_eq!(shortnames(&destroy), ["t-25h", "t-26h"]);
    }

    #[test]
    fn partition_is_exact_and_order_preserving() {
        let now = test_now();
        // deliberately unsorted input
        let snaps = vec![
            days_ago(now, 5, 3),
            days_ago(now, 9, 1),
            days_ago(now, 2, 7),
            days_ago(now, 7, 2),
        ];
        let policy = KeepPolicy { daily: 2, ..Default::default() };
        let (keep, destroy) = apply_policy_at(&snaps, &policy, now);

        assert_eq!(keep.len() + destroy.len(), snaps.len());
        let keep_guids: HashSet<u64> = keep.iter().map(|s| s.guid).collect();
        assert!(destroy.iter().all(|s| !keep_guids.contains(&s.guid)));

        // relative order within each list matches the input order
        assert_eq!(shortnames(&keep), ["t-1d", "t-2d"]);
        assert_eq!(shortnames(&destroy), ["t-3d", "t-7d"]);
    }

    #[test]
    fn empty_policy_destroys_everything() {
        let now = test_now();
        let snaps: Vec<Snapshot> = (1..=4).map(|d| days_ago(now, d as u64, d)).collect();
        let (keep, destroy) = apply_policy_at(&snaps, &KeepPolicy::default(), now);
        assert!(keep.is_empty());
        assert_eq!(destroy.len(), 4);
    }

    #[test]
    fn keep_last_all_keeps_everything() {
        let now = test_now();
        let snaps: Vec<Snapshot> = (1..=4).map(|d| days_ago(now, d as u64, d)).collect();
        let policy = KeepPolicy { last: snaps.len() as i64, ..Default::default() };
        let (keep, destroy) = apply_policy_at(&snaps, &policy, now);
        assert_eq!(keep.len(), 4);
        assert!(destroy.is_empty());
    }

    #[test]
    fn unlimited_bucket_keeps_every_distinct_value() {
        let now = test_now();
        let snaps: Vec<Snapshot> = (1..=6).map(|d| days_ago(now, d as u64, d)).collect();
        let policy = KeepPolicy { daily: -1, ..Default::default() };
        let (keep, destroy) = apply_policy_at(&snaps, &policy, now);
        assert_eq!(keep.len(), 6);
        assert!(destroy.is_empty());
    }

    #[test]
    fn empty_input_yields_empty_partition() {
        let (keep, destroy) = apply_policy_at(&[], &KeepPolicy::default(), test_now());
        assert!(keep.is_empty() && destroy.is_empty());
    }

    #[test]
    fn same_hour_snapshots_share_a_bucket() {
        let now = test_now();
        let mut a = hours_ago(now, 1, 1);
        let mut b = hours_ago(now, 2, 1);
        a.shortname = "a".to_owned();
        b.shortname = "b".to_owned();
        b.timestamp = b.timestamp - Duration::minutes(10);
        let snaps = vec![a, b];
        let policy = KeepPolicy { hourly: -1, ..Default::default() };
        let (keep, destroy) = apply_policy_at(&snaps, &policy, now);
        // only the newest of the shared hour survives
        assert_eq!(shortnames(&keep), ["a"]);
        assert_eq!(shortnames(&destroy), ["b"]);
    }

    #[test]
    fn identical_timestamps_disambiguated_by_guid() {
        let now = test_now();
        let a = fake_snapshot("tank", "low", 10, now.timestamp());
        let b = fake_snapshot("tank", "high", 20, now.timestamp());
        let policy = KeepPolicy { last: 1, ..Default::default() };
        let (keep, _) = apply_policy_at(&[a, b], &policy, now);
        // the higher guid ranks as newer
        assert_eq!(shortnames(&keep), ["high"]);
    }

    #[test]
    fn name_pattern_keeps_matching_snapshots() {
        let now = test_now();
        let mut keeper = days_ago(now, 1, 5);
        keeper.shortname = "baseline".to_owned();
        let snaps = vec![keeper, days_ago(now, 2, 6)];
        let policy = KeepPolicy {
            name: Some(Regex::new("^(?:base.*)$").unwrap()),
            ..Default::default()
        };
        let (keep, destroy) = apply_policy_at(&snaps, &policy, now);
        assert_eq!(shortnames(&keep), ["baseline"]);
        assert_eq!(destroy.len(), 1);
    }

    #[test]
    fn tag_policy_keeps_tagged_and_external_snapshots() {
        let now = test_now();
        let mut tagged = days_ago(now, 1, 5);
        tagged.tags = Tags::Set(["important".to_owned()].into_iter().collect());
        let mut external = days_ago(now, 2, 6);
        external.tags = Tags::Unset; // kept with a warning
        let mut managed = days_ago(now, 3, 7);
        managed.tags = Tags::Set(BTreeSet::new());

        let policy = KeepPolicy {
            tags: ["important".to_owned()].into_iter().collect(),
            ..Default::default()
        };
        let (keep, destroy) = apply_policy_at(&[tagged, external, managed], &policy, now);
        assert_eq!(shortnames(&keep), ["t-1d", "t-2d"]);
        assert_eq!(shortnames(&destroy), ["t-3d"]);
    }
}
