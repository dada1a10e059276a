use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Command;

use crate::clock::Clock;
use crate::error::{Error, ModuleError, Step};
use crate::retry::{RetryError, RetryPolicy};

const MODPROBE: &str = "modprobe";
const RMMOD: &str = "rmmod";

/// Kernel module control, one module per call.
pub trait ModuleBackend {
    fn is_loaded(&self, name: &str) -> io::Result<bool>;
    fn load(&self, name: &str) -> Result<(), ModuleError>;
    fn unload(&self, name: &str) -> Result<(), ModuleError>;
}

/// Module names in `/proc/modules` always use underscores.
pub fn normalize(name: &str) -> String {
    name.replace('-', "_")
}

/// Maps the stderr of `modprobe`/`rmmod` to an error class.
pub fn classify(module: &str, stderr: &str) -> ModuleError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_owned();
    if lower.contains("in use") || lower.contains("resource busy") || lower.contains("temporarily unavailable") {
        ModuleError::Busy { module: module.to_owned(), message }
    } else if lower.contains("not found") {
        ModuleError::NotFound(module.to_owned())
    } else {
        ModuleError::Failed { module: module.to_owned(), message }
    }
}

pub fn loaded_modules(proc_modules: &std::path::Path) -> io::Result<BTreeSet<String>> {
    Ok(fs::read_to_string(proc_modules)?
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_owned)
        .collect())
}

/// Drives `modprobe` and `rmmod`.
pub struct Modprobe {
    proc_modules: PathBuf,
}

impl Modprobe {
    pub fn new() -> Modprobe {
        Modprobe { proc_modules: PathBuf::from("/proc/modules") }
    }

    fn run(&self, tool: &str, module: &str) -> Result<(), ModuleError> {
        debug!("running {} {}", tool, module);
        let output = Command::new(tool).arg(module).output().map_err(|e| ModuleError::Failed {
            module: module.to_owned(),
            message: format!("failed to run {}: {}", tool, e),
        })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify(module, &String::from_utf8_lossy(&output.stderr)))
        }
    }
}

impl Default for Modprobe {
    fn default() -> Modprobe {
        Modprobe::new()
    }
}

impl ModuleBackend for Modprobe {
    fn is_loaded(&self, name: &str) -> io::Result<bool> {
        Ok(loaded_modules(&self.proc_modules)?.contains(&normalize(name)))
    }

    fn load(&self, name: &str) -> Result<(), ModuleError> {
        self.run(MODPROBE, name)
    }

    fn unload(&self, name: &str) -> Result<(), ModuleError> {
        self.run(RMMOD, name)
    }
}

/// Applies the load/unload policy on top of a backend.
pub struct ModuleLoader<'a> {
    backend: &'a dyn ModuleBackend,
    clock: &'a dyn Clock,
    policy: RetryPolicy,
}

impl<'a> ModuleLoader<'a> {
    pub fn new(backend: &'a dyn ModuleBackend, clock: &'a dyn Clock, policy: RetryPolicy) -> ModuleLoader<'a> {
        ModuleLoader { backend, clock, policy }
    }

    /// Single attempt. A missing module means the host is misconfigured.
    pub fn load(&self, name: &str) -> Result<(), ModuleError> {
        info!("loading module {}", name);
        self.backend.load(name)
    }

    /// Unloads `name`, retrying busy errors within the policy.
    pub fn unload(&self, name: &str) -> Result<(), RetryError<ModuleError>> {
        self.unload_with(name, &self.policy)
    }

    pub fn unload_once(&self, name: &str) -> Result<(), RetryError<ModuleError>> {
        self.unload_with(name, &RetryPolicy::once())
    }

    fn unload_with(&self, name: &str, policy: &RetryPolicy) -> Result<(), RetryError<ModuleError>> {
        match self.backend.is_loaded(name) {
            Ok(false) => {
                debug!("module {} is not loaded", name);
                return Ok(());
            }
            Ok(true) => (),
            Err(e) => warn!("Could not check whether {} is loaded: {}", name, e),
        }
        info!("unloading module {}", name);
        policy.run(self.clock, || self.backend.unload(name), ModuleError::is_busy)
    }
}

/// Turns an exhausted or permanent unload failure into the fatal error for `step`.
pub fn unload_failure(step: Step, err: RetryError<ModuleError>) -> Error {
    if err.error.is_busy() {
        Error::fatal(step, format!("{} (gave up after {} attempts)", err.error, err.attempts))
    } else {
        Error::fatal(step, err.error)
    }
}
