use std::io::Write;

use env_logger::{Builder, Env};
use log::Level;

/// Stderr logging in the format `[HH:MM:SS LVL]: message` with four-column
/// level names. The level defaults to info and can be overridden through
/// the `ZFSNAPPR_LOG` environment variable.
pub fn setup() {
    Builder::from_env(Env::new().filter_or("ZFSNAPPR_LOG", "info"))
        .format(|buf, record| {
            let level = match record.level() {
                Level::Trace | Level::Debug => "DBUG",
                Level::Info => "INFO",
                Level::Warn => "WARN",
                Level::Error => " ERR",
            };
            writeln!(
                buf,
                "[{} {}]: {}",
                chrono::Local::now().format("%H:%M:%S"),
                level,
                record.args()
            )
        })
        .init();

    // Panics are the one thing that bypasses the error path in main; report
    // them in the same shape, one level above ERR.
    std::panic::set_hook(Box::new(|info| {
        eprintln!(
            "[{} CRIT]: {}",
            chrono::Local::now().format("%H:%M:%S"),
            info
        );
    }));
}
