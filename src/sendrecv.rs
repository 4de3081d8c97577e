use std::io::{BufRead, BufReader};
use std::thread;
use std::time::Duration;

use log::info;
use subprocess::{ExitStatus, Popen};

use crate::machine::{ChildProc, Machine};
use crate::replicate::ReplicationError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Streams one snapshot from `source` into `dest_dataset` on `dest`. The
/// sender's stdout feeds the receiver's stdin through an ordinary pipe, so
/// the receiver backpressures the sender via the kernel; the sender's stderr
/// (`zfs send -v` progress) is drained by a thread and forwarded as INFO.
pub fn transfer(
    source: &Machine,
    dest: &Machine,
    snap_longname: &str,
    base_longname: Option<&str>,
    dest_dataset: &str,
    properties: &[(&str, String)],
) -> Result<(), ReplicationError> {
    let mut send = source.send_snapshot_async(snap_longname, base_longname)?;

    let (send_stdout, send_stderr) = match (send.popen.stdout.take(), send.popen.stderr.take()) {
        (Some(out), Some(err)) => (out, err),
        _ => {
            shutdown(&mut send.popen);
            return Err(ReplicationError::Pipeline(format!(
                "`{}` was started without piped output",
                send.cmdline
            )));
        }
    };

    let drainer = thread::spawn(move || {
        for line in BufReader::new(send_stderr).lines() {
            match line {
                Ok(line) => info!("{}", line.trim_end()),
                Err(_) => break,
            }
        }
    });

    // Handing send_stdout over moves our copy of the pipe's read end into
    // the receiver, so EOF propagates when the sender exits.
    let mut recv = match dest.receive_snapshot_async(dest_dataset, send_stdout, properties) {
        Ok(child) => child,
        Err(e) => {
            shutdown(&mut send.popen);
            let _ = drainer.join();
            return Err(e.into());
        }
    };

    let result = supervise(&mut send, &mut recv);
    let _ = drainer.join();
    result
}

/// Polls sender and receiver until both have terminated. When one side dies
/// with an error while its peer is still running, the peer is terminated so
/// the pipeline cannot hang on a half-open pipe.
fn supervise(send: &mut ChildProc, recv: &mut ChildProc) -> Result<(), ReplicationError> {
    loop {
        let send_status = send.popen.poll();
        let recv_status = recv.popen.poll();
        if send_status.is_some() && recv_status.is_some() {
            break;
        }
        if failed(send_status) && recv_status.is_none() {
            let _ = recv.popen.terminate();
        }
        if failed(recv_status) && send_status.is_none() {
            let _ = send.popen.terminate();
        }
        thread::sleep(POLL_INTERVAL);
    }

    check(send)?;
    check(recv)?;
    Ok(())
}

fn failed(status: Option<ExitStatus>) -> bool {
    matches!(status, Some(ExitStatus::Exited(code)) if code != 0)
}

/// Only a real non-zero exit is an error; a process we terminated ourselves
/// reports a signal, not a failure of its own.
fn check(child: &mut ChildProc) -> Result<(), ReplicationError> {
    match child.popen.poll() {
        Some(ExitStatus::Exited(code)) if code != 0 => Err(ReplicationError::ProcessFailed {
            status: ExitStatus::Exited(code),
            cmdline: child.cmdline.clone(),
        }),
        _ => Ok(()),
    }
}

/// Terminate, grant a grace period, then kill.
fn shutdown(popen: &mut Popen) {
    if popen.poll().is_some() {
        return;
    }
    let _ = popen.terminate();
    match popen.wait_timeout(TERM_GRACE) {
        Ok(Some(_)) => {}
        _ => {
            let _ = popen.kill();
            let _ = popen.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subprocess::{PopenConfig, Redirection};

    fn shell(script: &str) -> ChildProc {
        let argv = ["sh", "-c", script];
        ChildProc {
            popen: Popen::create(
                &argv,
                PopenConfig {
                    stdout: Redirection::None,
                    ..Default::default()
                },
            )
            .unwrap(),
            cmdline: argv.join(" "),
        }
    }

    #[test]
    fn supervise_passes_when_both_sides_succeed() {
        let mut send = shell("exit 0");
        let mut recv = shell("exit 0");
        supervise(&mut send, &mut recv).unwrap();
    }

    #[test]
    fn supervise_terminates_the_surviving_peer() {
        let mut send = shell("sleep 30");
        let mut recv = shell("exit 3");
        let err = supervise(&mut send, &mut recv).unwrap_err();
        match err {
            ReplicationError::ProcessFailed { status, cmdline } => {
                assert_eq!(status, ExitStatus::Exited(3));
                assert!(cmdline.contains("exit 3"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // the sleeping sender must have been terminated, not left running
        assert!(send.popen.poll().is_some());
    }
}
