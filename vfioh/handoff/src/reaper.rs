//! Finding and killing the processes that keep GPU device files open.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use itertools::Itertools;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::clock::Clock;

pub trait HolderScanner {
    /// PIDs with an open descriptor on any file matched by `patterns`.
    /// Patterns that match nothing are skipped.
    fn holders(&self, patterns: &[String]) -> io::Result<BTreeSet<i32>>;
    /// PIDs whose command name is one of `names`.
    fn by_name(&self, names: &[String]) -> io::Result<BTreeSet<i32>>;
    fn name_of(&self, pid: i32) -> Option<String>;
}

pub trait Signaller {
    /// Sends `signal` to `pid`. A process that is already gone is not an error.
    fn signal(&self, pid: i32, signal: Signal) -> io::Result<()>;
}

/// Expands device file patterns. A trailing `*` matches every non-directory entry
/// starting with the prefix; other patterns are kept if they exist.
pub fn expand_device_files(patterns: &[String]) -> Vec<PathBuf> {
    let mut files = BTreeSet::new();
    for pattern in patterns {
        let Some(prefix_pattern) = pattern.strip_suffix('*') else {
            let path = PathBuf::from(pattern);
            if path.exists() {
                files.insert(path);
            }
            continue;
        };
        let path = Path::new(prefix_pattern);
        let (dir, prefix) = if prefix_pattern.ends_with('/') {
            (path, "")
        } else {
            match (path.parent(), path.file_name().and_then(|x| x.to_str())) {
                (Some(dir), Some(prefix)) => (dir, prefix),
                _ => continue,
            }
        };
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(true);
            let matches = entry.file_name().to_str().map_or(false, |name| name.starts_with(prefix));
            if matches && !is_dir {
                files.insert(entry.path());
            }
        }
    }
    files.into_iter().collect()
}

/// Scans `/proc` for open descriptors and command names. Never reports its own process.
pub struct ProcScanner {
    root: PathBuf,
    own_pid: i32,
}

impl ProcScanner {
    pub fn new() -> ProcScanner {
        ProcScanner::with_root("/proc")
    }

    pub fn with_root<P: Into<PathBuf>>(root: P) -> ProcScanner {
        ProcScanner { root: root.into(), own_pid: process::id() as i32 }
    }

    fn pids(&self) -> io::Result<Vec<i32>> {
        Ok(fs::read_dir(&self.root)?
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse().ok()))
            .filter(|pid| *pid != self.own_pid)
            .collect())
    }
}

impl Default for ProcScanner {
    fn default() -> ProcScanner {
        ProcScanner::new()
    }
}

impl HolderScanner for ProcScanner {
    fn holders(&self, patterns: &[String]) -> io::Result<BTreeSet<i32>> {
        let mut targets = BTreeSet::new();
        for file in expand_device_files(patterns) {
            if let Ok(canonical) = fs::canonicalize(&file) {
                targets.insert(canonical);
            }
            targets.insert(file);
        }
        if targets.is_empty() {
            return Ok(BTreeSet::new());
        }

        let mut holders = BTreeSet::new();
        for pid in self.pids()? {
            // processes vanish and foreign ones are unreadable, both just mean "not a holder"
            let fds = match fs::read_dir(self.root.join(pid.to_string()).join("fd")) {
                Ok(fds) => fds,
                Err(_) => continue,
            };
            let holds = fds.flatten()
                .filter_map(|fd| fs::read_link(fd.path()).ok())
                .any(|target| targets.contains(&target));
            if holds {
                holders.insert(pid);
            }
        }
        Ok(holders)
    }

    fn by_name(&self, names: &[String]) -> io::Result<BTreeSet<i32>> {
        Ok(self.pids()?
            .into_iter()
            .filter(|pid| self.name_of(*pid).map_or(false, |name| names.contains(&name)))
            .collect())
    }

    fn name_of(&self, pid: i32) -> Option<String> {
        fs::read_to_string(self.root.join(pid.to_string()).join("comm"))
            .ok()
            .map(|comm| comm.trim_end().to_owned())
    }
}

pub struct KillSignaller;

impl Signaller for KillSignaller {
    fn signal(&self, pid: i32, sig: Signal) -> io::Result<()> {
        match signal::kill(Pid::from_raw(pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    /// Holders found on the first scan, all sent SIGTERM.
    pub terminated: BTreeSet<i32>,
    /// Holders still present after the grace window, sent SIGKILL.
    pub killed: BTreeSet<i32>,
    /// Holders still present after the forced kill.
    pub survivors: BTreeSet<i32>,
}

/// Two-phase signal escalation: SIGTERM, wait up to `grace`, SIGKILL what is left.
pub struct ProcessReaper<'a> {
    scanner: &'a dyn HolderScanner,
    signaller: &'a dyn Signaller,
    clock: &'a dyn Clock,
    grace: Duration,
    poll: Duration,
}

impl<'a> ProcessReaper<'a> {
    pub fn new(scanner: &'a dyn HolderScanner, signaller: &'a dyn Signaller, clock: &'a dyn Clock,
               grace: Duration, poll: Duration) -> ProcessReaper<'a> {
        ProcessReaper { scanner, signaller, clock, grace, poll }
    }

    fn send_all(&self, pids: &BTreeSet<i32>, sig: Signal) {
        for &pid in pids {
            if let Err(e) = self.signaller.signal(pid, sig) {
                warn!("Failed to send {:?} to {}: {}", sig, pid, e);
            }
        }
    }

    /// Bounded by `grace` plus one poll interval of sleeping.
    pub fn reap(&self, patterns: &[String]) -> io::Result<ReapReport> {
        let mut report = ReapReport {
            terminated: self.scanner.holders(patterns)?,
            ..ReapReport::default()
        };
        if report.terminated.is_empty() {
            debug!("no process holds the device files");
            return Ok(report);
        }

        info!("terminating device holders: {}", self.describe(&report.terminated));
        self.send_all(&report.terminated, Signal::SIGTERM);

        let deadline = self.clock.now() + self.grace;
        let mut remaining = self.scanner.holders(patterns)?;
        while !remaining.is_empty() {
            let now = self.clock.now();
            if now >= deadline {
                break;
            }
            self.clock.sleep(self.poll.min(deadline.saturating_sub(now)));
            remaining = self.scanner.holders(patterns)?;
        }
        if remaining.is_empty() {
            return Ok(report);
        }

        warn!("killing device holders that ignored SIGTERM: {}", self.describe(&remaining));
        self.send_all(&remaining, Signal::SIGKILL);
        report.killed = remaining;

        self.clock.sleep(self.poll);
        report.survivors = self.scanner.holders(patterns)?;
        Ok(report)
    }

    /// Sends SIGTERM to every process named in `names`, without escalating.
    pub fn terminate_named(&self, names: &[String]) -> io::Result<BTreeSet<i32>> {
        let pids = self.scanner.by_name(names)?;
        if !pids.is_empty() {
            info!("terminating session processes: {}", self.describe(&pids));
            self.send_all(&pids, Signal::SIGTERM);
        }
        Ok(pids)
    }

    fn describe(&self, pids: &BTreeSet<i32>) -> String {
        pids.iter()
            .map(|pid| match self.scanner.name_of(*pid) {
                Some(name) => format!("{} ({})", pid, name),
                None => pid.to_string(),
            })
            .join(", ")
    }
}
