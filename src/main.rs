#![deny(unused_must_use)]

mod commands;
mod dataset;
mod filter;
mod logging;
mod machine;
mod prune;
mod replicate;
mod retention;
mod sendrecv;
mod sort;

use std::process::exit;

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::error;
use regex::Regex;

use crate::commands::{CreateArgs, ListArgs, PruneArgs, ReplicateArgs, TagArgs, UnholdArgs};
use crate::prune::GroupBy;
use crate::retention::{parse_duration, KeepPolicy, RelDuration};

#[allow(non_snake_case)]
#[inline(always)]
pub fn S(s: &str) -> String {
    s.to_owned()
}

const COUNT_OPTS: [&str; 6] = [
    "keep-last",
    "keep-hourly",
    "keep-daily",
    "keep-weekly",
    "keep-monthly",
    "keep-yearly",
];

const WITHIN_OPTS: [&str; 6] = [
    "keep-within",
    "keep-within-hourly",
    "keep-within-daily",
    "keep-within-weekly",
    "keep-within-monthly",
    "keep-within-yearly",
];

fn common_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("dataset")
            .short('d')
            .long("dataset")
            .value_name("DATASET")
            .help("Endpoint spec [user@]host[:port]/dataset; a leading slash selects a local dataset."),
    )
    .arg(
        Arg::new("recursive")
            .short('r')
            .long("recursive")
            .action(ArgAction::SetTrue)
            .help("Include snapshots of descendant datasets."),
    )
    .arg(
        Arg::new("dry-run")
            .short('n')
            .long("dry-run")
            .action(ArgAction::SetTrue)
            .help("Report what would be done without doing it."),
    )
}

fn tag_filter_arg() -> Arg {
    Arg::new("tag")
        .long("tag")
        .value_name("TAGS")
        .action(ArgAction::Append)
        .help("Only consider snapshots carrying all of these comma-separated tags; repeat for alternatives. 'UNSET' matches unmanaged snapshots, '' matches an empty tag set.")
}

fn build_cli() -> Command {
    let list = common_args(
        Command::new("list").about("List snapshots with their tags, timestamps and holds."),
    )
    .arg(tag_filter_arg());

    let create = common_args(
        Command::new("create").about("Create a snapshot with a random shortname."),
    )
    .arg(
        Arg::new("tag")
            .short('t')
            .long("tag")
            .value_name("TAG")
            .action(ArgAction::Append)
            .help("Initial tag for the new snapshot; may be repeated."),
    );

    let mut prune = common_args(
        Command::new("prune").about("Destroy snapshots not retained by the keep policy."),
    )
    .arg(tag_filter_arg())
    .arg(
        Arg::new("keep-name")
            .long("keep-name")
            .value_name("REGEX")
            .help("Keep snapshots whose full shortname matches this pattern."),
    )
    .arg(
        Arg::new("keep-tag")
            .long("keep-tag")
            .value_name("TAG")
            .action(ArgAction::Append)
            .help("Keep snapshots carrying this tag; may be repeated."),
    )
    .arg(
        Arg::new("group-by")
            .long("group-by")
            .value_name("GROUP")
            .value_parser(["dataset", ""])
            .default_value("dataset")
            .help("Apply the policy per dataset, or to all snapshots at once ('')."),
    )
    .arg(
        Arg::new("snapshot")
            .value_name("SHORTNAME")
            .action(ArgAction::Append)
            .help("Restrict pruning to these shortnames; also lifts the destroy-all guard."),
    );
    for opt in COUNT_OPTS {
        prune = prune.arg(
            Arg::new(opt)
                .long(opt)
                .value_name("N")
                .value_parser(clap::value_parser!(i64))
                .allow_hyphen_values(true)
                .default_value("0"),
        );
    }
    for opt in WITHIN_OPTS {
        prune = prune.arg(
            Arg::new(opt)
                .long(opt)
                .value_name("DURATION")
                .value_parser(parse_duration)
                .default_value(""),
        );
    }

    let push = common_args(
        Command::new("push").about("Replicate a local or remote dataset into a destination."),
    )
    .arg(
        Arg::new("destination")
            .value_name("[USER@]HOST[:PORT]/DATASET")
            .required(true),
    )
    .arg(
        Arg::new("init")
            .long("init")
            .action(ArgAction::SetTrue)
            .help("Create the destination dataset by transferring the oldest snapshot."),
    )
    .arg(
        Arg::new("rollback")
            .long("rollback")
            .action(ArgAction::SetTrue)
            .help("Roll the destination back to its latest snapshot before receiving."),
    )
    .arg(
        Arg::new("exclude-dataset")
            .long("exclude-dataset")
            .value_name("DATASET")
            .action(ArgAction::Append)
            .help("Skip this source dataset in recursive mode; may be repeated."),
    );

    let pull = common_args(
        Command::new("pull").about("Replicate a source dataset into a local or remote destination."),
    )
    .arg(
        Arg::new("source")
            .value_name("[USER@]HOST[:PORT]/DATASET")
            .required(true),
    )
    .arg(
        Arg::new("init")
            .long("init")
            .action(ArgAction::SetTrue)
            .help("Create the destination dataset by transferring the oldest snapshot."),
    )
    .arg(
        Arg::new("rollback")
            .long("rollback")
            .action(ArgAction::SetTrue)
            .help("Roll the destination back to its latest snapshot before receiving."),
    )
    .arg(
        Arg::new("exclude-dataset")
            .long("exclude-dataset")
            .value_name("DATASET")
            .action(ArgAction::Append)
            .help("Skip this source dataset in recursive mode; may be repeated."),
    );

    let tag = common_args(Command::new("tag").about("Set or extend snapshot tags."))
        .arg(tag_filter_arg())
        .arg(
            Arg::new("set-from-prop")
                .long("set-from-prop")
                .value_name("PROP")
                .conflicts_with("set-from-name")
                .help("Replace the tag set with the comma-separated value of this property."),
        )
        .arg(
            Arg::new("set-from-name")
                .long("set-from-name")
                .action(ArgAction::SetTrue)
                .help("Replace the tag set with the underscore-separated parts of the shortname."),
        )
        .arg(
            Arg::new("add-from-prop")
                .long("add-from-prop")
                .value_name("PROP")
                .help("Add the comma-separated value of this property to the tag set."),
        )
        .arg(
            Arg::new("add-from-name")
                .long("add-from-name")
                .action(ArgAction::SetTrue)
                .help("Add the underscore-separated parts of the shortname to the tag set."),
        )
        .arg(
            Arg::new("snapshot")
                .value_name("SHORTNAME")
                .action(ArgAction::Append)
                .help("Only operate on these shortnames."),
        );

    let unhold = common_args(
        Command::new("unhold").about("Release all zfsnappr-owned holds on the matching snapshots."),
    )
    .arg(
        Arg::new("snapshot")
            .value_name("SHORTNAME")
            .action(ArgAction::Append)
            .help("Only operate on these shortnames."),
    );

    let version = Command::new("version").about("Print the version.");

    Command::new("zfsnappr")
        .about("Snapshot lifecycle manager for ZFS: create, prune, replicate, tag.")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(list)
        .subcommand(create)
        .subcommand(prune)
        .subcommand(push)
        .subcommand(pull)
        .subcommand(tag)
        .subcommand(unhold)
        .subcommand(version)
}

fn spec(sub: &ArgMatches) -> Option<String> {
    sub.get_one::<String>("dataset").cloned()
}

fn strings(sub: &ArgMatches, name: &str) -> Vec<String> {
    sub.get_many::<String>(name)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn keep_policy(sub: &ArgMatches) -> anyhow::Result<KeepPolicy> {
    let count = |name: &str| *sub.get_one::<i64>(name).unwrap();
    let within = |name: &str| *sub.get_one::<RelDuration>(name).unwrap();

    // the keep-name pattern must match the whole shortname
    let name = match sub.get_one::<String>("keep-name") {
        None => None,
        Some(pattern) => Some(
            Regex::new(&format!("^(?:{pattern})$"))
                .with_context(|| format!("invalid --keep-name pattern '{pattern}'"))?,
        ),
    };

    Ok(KeepPolicy {
        last: count("keep-last"),
        hourly: count("keep-hourly"),
        daily: count("keep-daily"),
        weekly: count("keep-weekly"),
        monthly: count("keep-monthly"),
        yearly: count("keep-yearly"),
        within: within("keep-within"),
        within_hourly: within("keep-within-hourly"),
        within_daily: within("keep-within-daily"),
        within_weekly: within("keep-within-weekly"),
        within_monthly: within("keep-within-monthly"),
        within_yearly: within("keep-within-yearly"),
        name,
        tags: strings(sub, "keep-tag").into_iter().collect(),
    })
}

fn replicate_args(sub: &ArgMatches, remote_arg: &str) -> ReplicateArgs {
    ReplicateArgs {
        spec: spec(sub),
        remote: sub.get_one::<String>(remote_arg).unwrap().clone(),
        recursive: sub.get_flag("recursive"),
        dry_run: sub.get_flag("dry-run"),
        init: sub.get_flag("init"),
        rollback: sub.get_flag("rollback"),
        exclude_datasets: strings(sub, "exclude-dataset"),
    }
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("list", sub)) => commands::list(ListArgs {
            spec: spec(sub),
            recursive: sub.get_flag("recursive"),
            tags: strings(sub, "tag"),
        }),

        Some(("create", sub)) => commands::create(CreateArgs {
            spec: spec(sub),
            recursive: sub.get_flag("recursive"),
            tags: strings(sub, "tag"),
        }),

        Some(("prune", sub)) => commands::prune(PruneArgs {
            spec: spec(sub),
            recursive: sub.get_flag("recursive"),
            dry_run: sub.get_flag("dry-run"),
            tags: strings(sub, "tag"),
            shortnames: strings(sub, "snapshot"),
            policy: keep_policy(sub)?,
            group_by: match sub.get_one::<String>("group-by").unwrap().as_str() {
                "dataset" => GroupBy::Dataset,
                _ => GroupBy::Nothing,
            },
        }),

        Some(("push", sub)) => commands::push(replicate_args(sub, "destination")),

        Some(("pull", sub)) => commands::pull(replicate_args(sub, "source")),

        Some(("tag", sub)) => commands::tag(TagArgs {
            spec: spec(sub),
            recursive: sub.get_flag("recursive"),
            tags: strings(sub, "tag"),
            shortnames: strings(sub, "snapshot"),
            set_from_prop: sub.get_one::<String>("set-from-prop").cloned(),
            set_from_name: sub.get_flag("set-from-name"),
            add_from_prop: sub.get_one::<String>("add-from-prop").cloned(),
            add_from_name: sub.get_flag("add-from-name"),
        }),

        Some(("unhold", sub)) => commands::unhold(UnholdArgs {
            spec: spec(sub),
            recursive: sub.get_flag("recursive"),
            shortnames: strings(sub, "snapshot"),
        }),

        Some(("version", _)) => commands::version(),

        _ => unreachable!(),
    }
}

fn main() {
    logging::setup();
    let matches = build_cli().get_matches();
    if let Err(e) = run(&matches) {
        error!("{:#}", e);
        exit(1);
    }
}

#[test]
fn cli_definition_is_consistent() {
    build_cli().debug_assert();
}

#[test]
fn prune_policy_options_parse() {
    let matches = build_cli()
        .try_get_matches_from([
            "zfsnappr",
            "prune",
            "-d",
            "/tank/web",
            "--keep-last",
            "-1",
            "--keep-daily",
            "7",
            "--keep-within-hourly",
            "2d12h",
            "--keep-name",
            "night.*",
            "--keep-tag",
            "gold",
            "--group-by",
            "",
        ])
        .unwrap();
    let sub = matches.subcommand_matches("prune").unwrap();
    let policy = keep_policy(sub).unwrap();
    assert_eq!(policy.last, -1);
    assert_eq!(policy.daily, 7);
    assert_eq!(policy.within_hourly, parse_duration("2d12h").unwrap());
    assert!(policy.within.is_zero());
    assert!(policy.name.as_ref().unwrap().is_match("nightly"));
    assert!(!policy.name.as_ref().unwrap().is_match("xnightly"));
    assert!(policy.tags.contains("gold"));
}

#[test]
fn unhold_arguments_parse() {
    let matches = build_cli()
        .try_get_matches_from(["zfsnappr", "unhold", "-d", "/tank/web", "-r", "abc", "def"])
        .unwrap();
    let sub = matches.subcommand_matches("unhold").unwrap();
    assert!(sub.get_flag("recursive"));
    assert_eq!(strings(sub, "snapshot"), ["abc", "def"]);
}

#[test]
fn push_arguments_parse() {
    let matches = build_cli()
        .try_get_matches_from([
            "zfsnappr",
            "push",
            "backup@replica:2222/backup/web",
            "-d",
            "/tank/web",
            "-r",
            "--init",
            "--exclude-dataset",
            "tank/web/tmp",
        ])
        .unwrap();
    let sub = matches.subcommand_matches("push").unwrap();
    let args = replicate_args(sub, "destination");
    assert_eq!(args.remote, "backup@replica:2222/backup/web");
    assert_eq!(args.spec.as_deref(), Some("/tank/web"));
    assert!(args.recursive && args.init && !args.rollback);
    assert_eq!(args.exclude_datasets, ["tank/web/tmp"]);
}
