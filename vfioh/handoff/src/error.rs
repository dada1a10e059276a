use std::fmt::{self, Display, Formatter};

use thiserror::Error;

/// One step of the release or reclaim sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    ReadState,
    StopSession,
    KillSession,
    ReapHolders,
    UnloadModeset,
    UnloadHostModules,
    UnbindConsoles,
    LoadPassthrough,
    BindDevices,
    UnbindDevices,
    UnloadPassthrough,
    LoadHostModules,
    ProbeDevices,
    RebindConsoles,
    StartSession,
    Verify,
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Step::ReadState => "reading device state",
            Step::StopSession => "stopping the display session",
            Step::KillSession => "terminating session processes",
            Step::ReapHolders => "killing device holders",
            Step::UnloadModeset => "unloading the modeset module",
            Step::UnloadHostModules => "unloading host modules",
            Step::UnbindConsoles => "unbinding consoles",
            Step::LoadPassthrough => "loading the passthrough driver",
            Step::BindDevices => "binding devices to the passthrough driver",
            Step::UnbindDevices => "unbinding devices from the passthrough driver",
            Step::UnloadPassthrough => "unloading the passthrough driver",
            Step::LoadHostModules => "loading host modules",
            Step::ProbeDevices => "probing host drivers",
            Step::RebindConsoles => "rebinding consoles",
            Step::StartSession => "starting the display session",
            Step::Verify => "verifying the host driver",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Bad input or configuration. Raised before any hardware is touched.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Aborts the sequence where it stands; nothing is rolled back.
    #[error("{step} failed: {reason}")]
    Fatal { step: Step, reason: String },
}

impl Error {
    pub fn fatal<R: Display>(step: Step, reason: R) -> Error {
        Error::Fatal { step, reason: reason.to_string() }
    }

    pub fn step(&self) -> Option<Step> {
        match self {
            Error::Configuration(_) => None,
            Error::Fatal { step, .. } => Some(*step),
        }
    }

    /// Process exit status reported back to the hypervisor.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Configuration(_) => 2,
            Error::Fatal { .. } => 1,
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ModuleError {
    #[error("module {module} is in use: {message}")]
    Busy { module: String, message: String },
    #[error("module {0} not found")]
    NotFound(String),
    #[error("module {module}: {message}")]
    Failed { module: String, message: String },
}

impl ModuleError {
    pub fn is_busy(&self) -> bool {
        matches!(self, ModuleError::Busy { .. })
    }
}
