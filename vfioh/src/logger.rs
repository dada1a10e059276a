use std::env;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use env_logger::{Builder, Target};
use time::macros::format_description;
use time::OffsetDateTime;

const DEFAULT_FILTER: &str = "warn,vfioh=info,handoff=info,common=info";

fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Logs to stderr, or appended to `log_file` when hooks run without a terminal.
pub fn init(log_file: Option<&Path>) -> Result<()> {
    let mut builder = Builder::new();
    builder.format(|buf, record| {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let time = now.format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
            .unwrap_or_default();
        writeln!(buf, "[{},{:03}] {}: {}", time, now.millisecond(), record.level(), record.args())
    });
    let config = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_owned());
    builder.parse_filters(&config);
    if let Some(path) = log_file {
        builder.target(Target::Pipe(Box::new(open_log(path)?)));
    }
    builder.try_init()?;
    Ok(())
}
