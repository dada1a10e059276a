//! The display manager and other init-managed services.

use std::env;
use std::ffi::OsStr;
use std::process::Command;

use anyhow::{bail, Context, Result};

pub trait SessionControl {
    fn is_active(&self) -> Result<bool>;
    /// Returns false when the session was not running.
    fn stop(&self) -> Result<bool>;
    /// Returns false when the session was already running.
    fn start(&self) -> Result<bool>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InitTool {
    Systemctl,
    Service,
}

impl InitTool {
    fn detect() -> Result<InitTool> {
        InitTool::detect_in(env::var_os("PATH"))
    }

    /// Picks the first tool found as an executable in `paths`.
    fn detect_in<P: AsRef<OsStr>>(paths: Option<P>) -> Result<InitTool> {
        let found = |program: &str| which::which_in(program, paths.as_ref(), "/").is_ok();
        if found("systemctl") {
            Ok(InitTool::Systemctl)
        } else if found("service") {
            Ok(InitTool::Service)
        } else {
            bail!("Neither systemctl nor service found, cannot manage services on this init system")
        }
    }

    fn command(self, unit: &str, action: &str) -> Command {
        match self {
            InitTool::Systemctl => {
                let mut cmd = Command::new("systemctl");
                cmd.arg(action).arg(unit);
                cmd
            }
            InitTool::Service => {
                let mut cmd = Command::new("service");
                cmd.arg(unit).arg(action);
                cmd
            }
        }
    }

    fn run(self, unit: &str, action: &str) -> Result<()> {
        debug!("{:?}: {} {}", self, action, unit);
        let output = self.command(unit, action).output()
            .with_context(|| format!("Failed to run {:?} for {}", self, unit))?;
        if !output.status.success() {
            bail!("{} {} failed ({}): {}", action, unit, output.status,
                  String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }
}

/// Controls one unit through systemd, falling back to SysV `service`.
pub struct ServiceManager {
    unit: String,
}

impl ServiceManager {
    pub fn new<S: Into<String>>(unit: S) -> ServiceManager {
        ServiceManager { unit: unit.into() }
    }
}

impl SessionControl for ServiceManager {
    fn is_active(&self) -> Result<bool> {
        let tool = InitTool::detect()?;
        let action = if tool == InitTool::Systemctl { "is-active" } else { "status" };
        let status = tool.command(&self.unit, action).output()
            .with_context(|| format!("Failed to query {}", self.unit))?
            .status;
        Ok(status.success())
    }

    fn stop(&self) -> Result<bool> {
        if !self.is_active()? {
            return Ok(false);
        }
        InitTool::detect()?.run(&self.unit, "stop")?;
        Ok(true)
    }

    fn start(&self) -> Result<bool> {
        if self.is_active()? {
            return Ok(false);
        }
        InitTool::detect()?.run(&self.unit, "start")?;
        Ok(true)
    }
}

/// Restarts `unit` so it picks up changed configuration.
pub fn restart_service(unit: &str) -> Result<()> {
    info!("restarting {}", unit);
    InitTool::detect()?.run(unit, "restart")
}
