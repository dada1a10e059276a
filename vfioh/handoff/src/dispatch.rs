//! Entry point for hypervisor lifecycle hooks.

use std::fmt::{self, Display, Formatter};

use common::config::Config;

use crate::diagnostics::Snapshot;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::reclaim::ReclaimController;
use crate::release::ReleaseController;
use crate::Outcome;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    PreStart,
    PostStop,
}

impl Phase {
    /// Accepts our own spellings as well as libvirt's `<operation> <sub-operation>` pairs.
    pub fn parse(phase: &str, sub_phase: Option<&str>) -> Result<Phase> {
        let squashed: String = phase.chars()
            .filter(|c| *c != '-' && *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        match (squashed.as_str(), sub_phase) {
            ("prestart", _) | ("prepare", Some("begin")) => Ok(Phase::PreStart),
            ("poststop", _) | ("release", Some("end")) => Ok(Phase::PostStop),
            _ => Err(Error::Configuration(match sub_phase {
                Some(sub) => format!("unsupported lifecycle phase '{} {}'", phase, sub),
                None => format!("unsupported lifecycle phase '{}'", phase),
            })),
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Phase::PreStart => "pre-start",
            Phase::PostStop => "post-stop",
        })
    }
}

pub struct Dispatcher<'a> {
    cfg: &'a Config,
    host: Host<'a>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(cfg: &'a Config, host: Host<'a>) -> Dispatcher<'a> {
        Dispatcher { cfg, host }
    }

    /// Handles one hook invocation. Unknown phases are rejected before anything else happens.
    pub fn dispatch(&self, vm: &str, phase: &str, sub_phase: Option<&str>) -> Result<Outcome> {
        let phase = Phase::parse(phase, sub_phase)?;
        if !self.cfg.manages(vm) {
            info!("{} is not set up for passthrough, nothing to do", vm);
            return Ok(Outcome::Skipped);
        }
        self.run_phase(Some(vm), phase)
    }

    /// Runs the controller for `phase` regardless of which VM asked.
    pub fn run_phase(&self, vm: Option<&str>, phase: Phase) -> Result<Outcome> {
        self.cfg.validate().map_err(Error::Configuration)?;
        info!("{} {}", vm.unwrap_or("manual"), phase);

        let result = match phase {
            Phase::PreStart => ReleaseController::new(self.cfg, self.host).run(),
            Phase::PostStop => ReclaimController::new(self.cfg, self.host).run(),
        };
        if let Err(ref e @ Error::Fatal { .. }) = result {
            self.report_failure(vm, phase, e);
        }
        result
    }

    fn report_failure(&self, vm: Option<&str>, phase: Phase, err: &Error) {
        error!("{} aborted: {}", phase, err);
        error!("Nothing was rolled back. Check loaded modules (lsmod) and device holders (vfioh status) \
                before starting the VM again.");

        let snapshot = Snapshot::collect(&self.host, self.cfg).with_failure(vm, &phase.to_string(), err);
        snapshot.log();
        if let Some(ref dir) = self.cfg.report_dir {
            match snapshot.write(dir) {
                Ok(path) => error!("Diagnostics written to {}", path.display()),
                Err(e) => warn!("Could not write diagnostics: {:#}", e),
            }
        }
    }
}
