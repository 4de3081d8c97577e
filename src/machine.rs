use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use chrono::TimeZone;
use chrono::offset::Utc;
use log::info;
use subprocess::{Exec, Popen, PopenConfig, Redirection};
use thiserror::Error;

use crate::dataset::{
    Dataset, DatasetKind, Hold, Snapshot, Tags, PROP_CREATION, PROP_CUSTOM_TAGS, PROP_GUID,
    PROP_NAME, PROP_TYPE, PROP_USERREFS, REQUIRED_PROPS,
};
use crate::S;

/// `zfs holds` accepts many snapshot names per call; batching bounds argv length.
const HOLDS_BATCH: usize = 5000;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("failed to spawn `{cmdline}`: {source}")]
    Spawn {
        cmdline: String,
        source: subprocess::PopenError,
    },
    #[error("`{cmdline}` exited with {status:?}: {output}")]
    CommandFailed {
        status: subprocess::ExitStatus,
        cmdline: String,
        output: String,
    },
    #[error("unexpected output from `{cmdline}`: {message}")]
    BadOutput { cmdline: String, message: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SpecParseError {
    #[error("'{0}': empty component in endpoint spec")]
    EmptyComponent(String),
    #[error("'{0}': malformed endpoint spec")]
    Malformed(String),
    #[error("'{0}': port is not a number in 0..65536")]
    InvalidPort(String),
    #[error("'{0}': only ASCII alphanumeric, dash and underscore are allowed in user, host and dataset names")]
    IllegalCharacters(String),
    #[error("no dataset specified")]
    NoDataset,
}

/// An endpoint that can run `zfs`: either this host, or one reached over ssh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Machine {
    Local,
    Remote {
        host: String,
        user: Option<String>,
        port: Option<u16>,
    },
}

fn is_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Parses an endpoint spec `[user@]host[:port]/dataset`. A spec with no
/// netloc (leading slash) designates the local host. The dataset part is
/// optional; whether its absence is an error is up to the caller.
pub fn parse_spec(value: &str) -> Result<(Machine, Option<String>), SpecParseError> {
    let (netloc, dataset) = match value.split_once('/') {
        None => (Some(value), None),
        Some((netloc, dataset)) => (
            (!netloc.is_empty()).then_some(netloc),
            (!dataset.is_empty()).then_some(dataset),
        ),
    };

    let machine = match netloc {
        None => Machine::Local,
        Some(netloc) => {
            let parts: Vec<&str> = netloc.split('@').collect();
            if parts.iter().any(|p| p.is_empty()) {
                return Err(SpecParseError::EmptyComponent(value.to_owned()));
            }
            let (user, hostport) = match parts.as_slice() {
                [hostport] => (None, *hostport),
                [user, hostport] => (Some(*user), *hostport),
                _ => return Err(SpecParseError::Malformed(value.to_owned())),
            };

            let parts: Vec<&str> = hostport.split(':').collect();
            if parts.iter().any(|p| p.is_empty()) {
                return Err(SpecParseError::EmptyComponent(value.to_owned()));
            }
            let (host, port) = match parts.as_slice() {
                [host] => (*host, None),
                [host, port] => {
                    let port = port
                        .parse::<u16>()
                        .map_err(|_| SpecParseError::InvalidPort(value.to_owned()))?;
                    (*host, Some(port))
                }
                _ => return Err(SpecParseError::Malformed(value.to_owned())),
            };

            if !is_name(host) || !user.map_or(true, is_name) {
                return Err(SpecParseError::IllegalCharacters(value.to_owned()));
            }
            Machine::Remote {
                host: host.to_owned(),
                user: user.map(str::to_owned),
                port,
            }
        }
    };

    if let Some(dataset) = dataset {
        for segment in dataset.split('/') {
            if segment.is_empty() {
                return Err(SpecParseError::EmptyComponent(value.to_owned()));
            }
            if !is_name(segment) {
                return Err(SpecParseError::IllegalCharacters(value.to_owned()));
            }
        }
    }

    Ok((machine, dataset.map(str::to_owned)))
}

/// A spawned `zfs send`/`zfs receive`, together with the command line it was
/// started from (for error reporting).
pub struct ChildProc {
    pub popen: Popen,
    pub cmdline: String,
}

impl Machine {
    /// Wraps a command for execution on this machine; remote machines get an
    /// ssh prefix with optional login name and port.
    fn command(&self, args: Vec<String>) -> Vec<String> {
        match self {
            Machine::Local => args,
            Machine::Remote { host, user, port } => {
                let mut cmd = vec![S("ssh")];
                if let Some(user) = user {
                    cmd.push(S("-l"));
                    cmd.push(user.clone());
                }
                if let Some(port) = port {
                    cmd.push(S("-p"));
                    cmd.push(port.to_string());
                }
                cmd.push(host.clone());
                cmd.extend(args);
                cmd
            }
        }
    }

    fn run_text(&self, args: Vec<String>) -> Result<String, MachineError> {
        let argv = self.command(args);
        let cmdline = argv.join(" ");
        let captured = Exec::cmd(&argv[0])
            .args(&argv[1..])
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe)
            .capture()
            .map_err(|source| MachineError::Spawn {
                cmdline: cmdline.clone(),
                source,
            })?;
        if !captured.exit_status.success() {
            return Err(MachineError::CommandFailed {
                status: captured.exit_status,
                cmdline,
                output: captured.stderr_str().trim_end().to_owned(),
            });
        }
        Ok(captured.stdout_str())
    }

    fn spawn(
        &self,
        args: Vec<String>,
        stdin: Redirection,
        stdout: Redirection,
        stderr: Redirection,
    ) -> Result<ChildProc, MachineError> {
        let argv = self.command(args);
        let cmdline = argv.join(" ");
        let popen = Popen::create(
            &argv,
            PopenConfig {
                stdin,
                stdout,
                stderr,
                ..Default::default()
            },
        )
        .map_err(|source| MachineError::Spawn {
            cmdline: cmdline.clone(),
            source,
        })?;
        Ok(ChildProc { popen, cmdline })
    }

    /// Lists snapshots, optionally under a dataset and its descendants.
    /// `exclude_datasets` filtering happens on the listing output, as the
    /// backing tool has no flag for it.
    pub fn get_snapshots(
        &self,
        dataset: Option<&str>,
        recursive: bool,
        extra_props: &[&str],
        exclude_datasets: &[String],
    ) -> Result<Vec<Snapshot>, MachineError> {
        let cols = columns(extra_props);
        let mut args = vec![
            S("zfs"),
            S("list"),
            S("-Hp"),
            S("-t"),
            S("snapshot"),
            S("-o"),
            cols.join(","),
        ];
        if recursive {
            args.push(S("-r"));
        }
        if let Some(dataset) = dataset {
            args.push(S(dataset));
        }
        let cmdline = self.command(args.clone()).join(" ");
        let output = self.run_text(args)?;

        let mut snaps = Vec::new();
        for props in parse_table(&output, &cols, &cmdline)? {
            let snap = snapshot_from_props(props, &cmdline)?;
            if exclude_datasets.contains(&snap.dataset) {
                continue;
            }
            snaps.push(snap);
        }
        Ok(snaps)
    }

    pub fn get_all_datasets(&self) -> Result<Vec<Dataset>, MachineError> {
        let cols = [S(PROP_NAME), S(PROP_GUID), S(PROP_TYPE)];
        let args = vec![S("zfs"), S("list"), S("-Hp"), S("-o"), cols.join(",")];
        let cmdline = self.command(args.clone()).join(" ");
        let output = self.run_text(args)?;

        output
            .lines()
            .map(|line| {
                let fields: Vec<&str> = line.split('\t').collect();
                match fields.as_slice() {
                    [name, guid, kind] => Ok(Dataset {
                        name: (*name).to_owned(),
                        guid: parse_number(guid, PROP_GUID, &cmdline)?,
                        kind: parse_kind(kind, &cmdline)?,
                    }),
                    _ => Err(MachineError::BadOutput {
                        cmdline: cmdline.clone(),
                        message: format!("expected {} columns: {line}", cols.len()),
                    }),
                }
            })
            .collect()
    }

    pub fn get_dataset(&self, name: &str) -> Result<Dataset, MachineError> {
        let cols = [S(PROP_NAME), S(PROP_GUID), S(PROP_TYPE)];
        let args = vec![
            S("zfs"),
            S("get"),
            S("-Hp"),
            S("-o"),
            S("value"),
            cols.join(","),
            S(name),
        ];
        let cmdline = self.command(args.clone()).join(" ");
        let output = self.run_text(args)?;

        let values: Vec<&str> = output.lines().collect();
        match values.as_slice() {
            [name, guid, kind] => Ok(Dataset {
                name: (*name).to_owned(),
                guid: parse_number(guid, PROP_GUID, &cmdline)?,
                kind: parse_kind(kind, &cmdline)?,
            }),
            _ => Err(MachineError::BadOutput {
                cmdline,
                message: format!("expected {} property values", cols.len()),
            }),
        }
    }

    pub fn create_snapshot(
        &self,
        longname: &str,
        recursive: bool,
        properties: &[(&str, String)],
    ) -> Result<(), MachineError> {
        let mut args = vec![S("zfs"), S("snapshot")];
        if recursive {
            args.push(S("-r"));
        }
        for (key, value) in properties {
            args.push(S("-o"));
            args.push(format!("{key}={value}"));
        }
        args.push(S(longname));
        self.run_text(args)?;
        Ok(())
    }

    /// Destroys the given snapshots of one dataset in a single call, using
    /// the comma-batched `dataset@name1,name2` destroy syntax.
    pub fn destroy_snapshots(
        &self,
        dataset: &str,
        shortnames: &[String],
    ) -> Result<(), MachineError> {
        if shortnames.is_empty() {
            return Ok(());
        }
        let args = vec![
            S("zfs"),
            S("destroy"),
            format!("{dataset}@{}", shortnames.join(",")),
        ];
        self.run_text(args)?;
        Ok(())
    }

    pub fn rollback(&self, snap_longname: &str) -> Result<(), MachineError> {
        self.run_text(vec![S("zfs"), S("rollback"), S(snap_longname)])?;
        Ok(())
    }

    pub fn rename_snapshot(
        &self,
        longname: &str,
        new_shortname: &str,
    ) -> Result<(), MachineError> {
        self.run_text(vec![S("zfs"), S("rename"), S(longname), S(new_shortname)])?;
        Ok(())
    }

    pub fn set_tags(&self, snap_longname: &str, tags: &BTreeSet<String>) -> Result<(), MachineError> {
        let joined = tags.iter().cloned().collect::<Vec<_>>().join(",");
        let args = vec![
            S("zfs"),
            S("set"),
            format!("{PROP_CUSTOM_TAGS}={joined}"),
            S(snap_longname),
        ];
        self.run_text(args)?;
        Ok(())
    }

    pub fn get_holds(&self, longnames: &[String]) -> Result<Vec<Hold>, MachineError> {
        let mut holds = Vec::new();
        for batch in longnames.chunks(HOLDS_BATCH) {
            info!("Checking {} snapshot holds", batch.len());
            let mut args = vec![S("zfs"), S("holds"), S("-H")];
            args.extend(batch.iter().cloned());
            let cmdline = self.command(args.clone()).join(" ");
            let output = self.run_text(args)?;
            holds.extend(parse_holds_output(&output, &cmdline)?);
        }
        Ok(holds)
    }

    pub fn has_hold(&self, longname: &str, tag: &str) -> Result<bool, MachineError> {
        let holds = self.get_holds(&[longname.to_owned()])?;
        Ok(holds.iter().any(|h| h.tag == tag))
    }

    pub fn hold(&self, longnames: &[String], tag: &str) -> Result<(), MachineError> {
        if longnames.is_empty() {
            return Ok(());
        }
        let mut args = vec![S("zfs"), S("hold"), S(tag)];
        args.extend(longnames.iter().cloned());
        self.run_text(args)?;
        Ok(())
    }

    pub fn release_hold(&self, longnames: &[String], tag: &str) -> Result<(), MachineError> {
        if longnames.is_empty() {
            return Ok(());
        }
        let mut args = vec![S("zfs"), S("release"), S(tag)];
        args.extend(longnames.iter().cloned());
        self.run_text(args)?;
        Ok(())
    }

    /// Starts `zfs send -v` with stdout and stderr piped back to us.
    pub fn send_snapshot_async(
        &self,
        snap_longname: &str,
        base_longname: Option<&str>,
    ) -> Result<ChildProc, MachineError> {
        let mut args = vec![S("zfs"), S("send"), S("-v")];
        if let Some(base) = base_longname {
            args.push(S("-i"));
            args.push(S(base));
        }
        args.push(S(snap_longname));
        self.spawn(args, Redirection::None, Redirection::Pipe, Redirection::Pipe)
    }

    /// Starts `zfs receive -u`, reading the stream from `stdin` (the sending
    /// process's stdout). Passing the file moves our copy of the pipe end
    /// into the child, so the receiver sees EOF when the sender exits.
    pub fn receive_snapshot_async(
        &self,
        dataset: &str,
        stdin: std::fs::File,
        properties: &[(&str, String)],
    ) -> Result<ChildProc, MachineError> {
        let mut args = vec![S("zfs"), S("receive"), S("-u")];
        for (key, value) in properties {
            args.push(S("-o"));
            args.push(format!("{key}={value}"));
        }
        args.push(S(dataset));
        self.spawn(
            args,
            Redirection::File(stdin),
            Redirection::None,
            Redirection::None,
        )
    }
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Machine::Local => write!(f, "localhost"),
            Machine::Remote { host, user, port } => {
                if let Some(user) = user {
                    write!(f, "{}@", user)?;
                }
                write!(f, "{}", host)?;
                if let Some(port) = port {
                    write!(f, ":{}", port)?;
                }
                Ok(())
            }
        }
    }
}

fn columns(extra_props: &[&str]) -> Vec<String> {
    let mut cols: Vec<String> = REQUIRED_PROPS.iter().map(|p| S(p)).collect();
    for prop in extra_props {
        if !cols.iter().any(|c| c == prop) {
            cols.push(S(prop));
        }
    }
    cols
}

fn parse_table(
    output: &str,
    cols: &[String],
    cmdline: &str,
) -> Result<Vec<HashMap<String, String>>, MachineError> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != cols.len() {
            return Err(MachineError::BadOutput {
                cmdline: cmdline.to_owned(),
                message: format!("expected {} columns: {line}", cols.len()),
            });
        }
        rows.push(
            cols.iter()
                .cloned()
                .zip(fields.into_iter().map(str::to_owned))
                .collect(),
        );
    }
    Ok(rows)
}

fn parse_number<T: FromStr>(value: &str, what: &str, cmdline: &str) -> Result<T, MachineError> {
    value.parse().map_err(|_| MachineError::BadOutput {
        cmdline: cmdline.to_owned(),
        message: format!("cannot parse {what} '{value}'"),
    })
}

fn parse_kind(value: &str, cmdline: &str) -> Result<DatasetKind, MachineError> {
    value.parse().map_err(|_| MachineError::BadOutput {
        cmdline: cmdline.to_owned(),
        message: format!("unknown dataset type '{value}'"),
    })
}

fn snapshot_from_props(
    props: HashMap<String, String>,
    cmdline: &str,
) -> Result<Snapshot, MachineError> {
    let get = |key: &str| -> Result<&str, MachineError> {
        props
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| MachineError::BadOutput {
                cmdline: cmdline.to_owned(),
                message: format!("missing property '{key}'"),
            })
    };

    let name = get(PROP_NAME)?;
    let (dataset, shortname) = name.split_once('@').ok_or_else(|| MachineError::BadOutput {
        cmdline: cmdline.to_owned(),
        message: format!("'{name}' is not a snapshot name"),
    })?;
    let creation: i64 = parse_number(get(PROP_CREATION)?, PROP_CREATION, cmdline)?;
    let timestamp = Utc
        .timestamp_opt(creation, 0)
        .single()
        .ok_or_else(|| MachineError::BadOutput {
            cmdline: cmdline.to_owned(),
            message: format!("creation timestamp '{creation}' out of range"),
        })?;
    let guid: u64 = parse_number(get(PROP_GUID)?, PROP_GUID, cmdline)?;
    let holds: u32 = parse_number(get(PROP_USERREFS)?, PROP_USERREFS, cmdline)?;
    let tags = Tags::parse(get(PROP_CUSTOM_TAGS)?);

    Ok(Snapshot {
        dataset: dataset.to_owned(),
        shortname: shortname.to_owned(),
        guid,
        timestamp,
        tags,
        holds,
        properties: props,
    })
}

fn parse_holds_output(output: &str, cmdline: &str) -> Result<Vec<Hold>, MachineError> {
    output
        .lines()
        .map(|line| {
            let mut fields = line.splitn(3, '\t');
            match (fields.next(), fields.next()) {
                (Some(snapname), Some(tag)) => Ok(Hold {
                    snap_longname: snapname.to_owned(),
                    tag: tag.to_owned(),
                }),
                _ => Err(MachineError::BadOutput {
                    cmdline: cmdline.to_owned(),
                    message: format!("unexpected holds line: {line}"),
                }),
            }
        })
        .collect()
}

#[test]
fn test_parse_spec() {
    let (m, d) = parse_spec("/tank/webdata").unwrap();
    assert_eq!(m, Machine::Local);
    assert_eq!(d.as_deref(), Some("tank/webdata"));

    let (m, d) = parse_spec("u@h:22/tank/x").unwrap();
    assert_eq!(
        m,
        Machine::Remote {
            host: "h".to_owned(),
            user: Some("u".to_owned()),
            port: Some(22),
        }
    );
    assert_eq!(d.as_deref(), Some("tank/x"));

    let (m, d) = parse_spec("baal/tank").unwrap();
    assert_eq!(
        m,
        Machine::Remote {
            host: "baal".to_owned(),
            user: None,
            port: None,
        }
    );
    assert_eq!(d.as_deref(), Some("tank"));

    // a bare netloc carries no dataset at all
    let (m, d) = parse_spec("baal").unwrap();
    assert!(matches!(m, Machine::Remote { .. }));
    assert_eq!(d, None);

    assert!(matches!(
        parse_spec(""),
        Err(SpecParseError::EmptyComponent(_))
    ));
    assert!(matches!(
        parse_spec("u@/tank"),
        Err(SpecParseError::EmptyComponent(_))
    ));
    assert!(matches!(
        parse_spec("h:/tank"),
        Err(SpecParseError::EmptyComponent(_))
    ));
    assert!(matches!(
        parse_spec("h:abc/tank"),
        Err(SpecParseError::InvalidPort(_))
    ));
    assert!(matches!(
        parse_spec("a@b@c/tank"),
        Err(SpecParseError::Malformed(_))
    ));
    assert!(matches!(
        parse_spec("/tank//data"),
        Err(SpecParseError::EmptyComponent(_))
    ));
    assert!(matches!(
        parse_spec("/tank/dätä"),
        Err(SpecParseError::IllegalCharacters(_))
    ));
    assert!(matches!(
        parse_spec("sömehost/tank"),
        Err(SpecParseError::IllegalCharacters(_))
    ));
}

#[test]
fn test_ssh_command_prefix() {
    let machine = Machine::Remote {
        host: "baal".to_owned(),
        user: Some("backup".to_owned()),
        port: Some(2222),
    };
    let argv = machine.command(vec![S("zfs"), S("list")]);
    assert_eq!(
        argv,
        vec!["ssh", "-l", "backup", "-p", "2222", "baal", "zfs", "list"]
    );

    let local = Machine::Local;
    assert_eq!(local.command(vec![S("zfs")]), vec!["zfs"]);
}

#[test]
fn test_snapshot_from_props() {
    let cols = columns(&[]);
    let output = "tank/web@aB3x\t1633161540\t12345\tdaily,weekly\t1\tsnapshot\n\
                  tank/web@ext1\t1633161600\t12346\t-\t0\tsnapshot\n";
    let rows = parse_table(output, &cols, "zfs list").unwrap();
    let snaps: Vec<Snapshot> = rows
        .into_iter()
        .map(|props| snapshot_from_props(props, "zfs list").unwrap())
        .collect();

    assert_eq!(snaps.len(), 2);
    assert_eq!(snaps[0].dataset, "tank/web");
    assert_eq!(snaps[0].shortname, "aB3x");
    assert_eq!(snaps[0].guid, 12345);
    assert_eq!(snaps[0].holds, 1);
    assert_eq!(snaps[0].timestamp.timestamp(), 1633161540);
    assert_eq!(snaps[0].tags.join(), "daily,weekly");
    assert_eq!(snaps[1].tags, Tags::Unset);
}

#[test]
fn test_parse_table_column_mismatch() {
    let cols = columns(&[]);
    let err = parse_table("tank/web@a\t123\n", &cols, "zfs list").unwrap_err();
    assert!(matches!(err, MachineError::BadOutput { .. }));
}

#[test]
fn test_parse_holds_output() {
    let output = "tank/web@a\tzfsnappr-sendbase-99\tThu Sep 30 12:00 2021\n\
                  tank/web@a\tkeepme\tThu Sep 30 12:00 2021\n";
    let holds = parse_holds_output(output, "zfs holds").unwrap();
    assert_eq!(holds.len(), 2);
    assert_eq!(holds[0].snap_longname, "tank/web@a");
    assert_eq!(holds[0].tag, "zfsnappr-sendbase-99");
    assert_eq!(holds[1].tag, "keepme");
}
