//! Guest to host: return the GPU to its host drivers and bring the desktop back.

use std::io;

use common::config::Config;
use common::pci_device::DriverState;

use crate::error::{Error, Result, Step};
use crate::host::Host;
use crate::retry::RetryPolicy;
use crate::Outcome;

pub struct ReclaimController<'a> {
    cfg: &'a Config,
    host: Host<'a>,
}

impl<'a> ReclaimController<'a> {
    pub fn new(cfg: &'a Config, host: Host<'a>) -> ReclaimController<'a> {
        ReclaimController { cfg, host }
    }

    pub fn run(&self) -> Result<Outcome> {
        let states = self.host.device_states(self.cfg)?;
        if states.iter().all(|(_, state)| state.is_host()) {
            info!("all devices are already bound to host drivers");
            return Ok(Outcome::AlreadyInState);
        }

        for (address, state) in &states {
            if state.is_host() {
                continue;
            }
            let fatal = |e: io::Error| Error::fatal(Step::UnbindDevices, format!("{}: {}", address, e));
            info!("releasing {} from {}", address, self.cfg.passthrough_driver);
            self.host.bus.set_override(address, None).map_err(fatal)?;
            if *state == DriverState::Passthrough {
                self.host.bus.unbind(address).map_err(fatal)?;
            }
        }

        if self.cfg.unload_passthrough_on_reclaim {
            self.unload_passthrough();
        }
        self.load_host_modules()?;

        for address in &self.cfg.devices {
            self.host.bus.probe(address)
                .map_err(|e| Error::fatal(Step::ProbeDevices, format!("{}: {}", address, e)))?;
        }

        self.restore_desktop();
        self.verify()?;
        info!("GPU returned to the host");
        Ok(Outcome::Completed)
    }

    /// Best-effort. A passthrough module someone else still uses is left loaded.
    fn unload_passthrough(&self) {
        let loader = self.host.module_loader(RetryPolicy::once());
        for module in self.cfg.passthrough_modules.iter().rev() {
            if let Err(e) = loader.unload(module) {
                warn!("{} failed, continuing: {}", Step::UnloadPassthrough, e.error);
                return;
            }
        }
    }

    fn load_host_modules(&self) -> Result<()> {
        let loader = self.host.module_loader(RetryPolicy::once());
        for module in self.cfg.reload_order() {
            loader.load(module).map_err(|e| Error::fatal(Step::LoadHostModules, e))?;
        }
        Ok(())
    }

    fn restore_desktop(&self) {
        let console = self.host.console;
        if let Err(e) = console.bind_vtconsoles() {
            warn!("{} failed, continuing: {}", Step::RebindConsoles, e);
        }
        if let Err(e) = console.bind_efifb() {
            warn!("rebinding the EFI framebuffer failed, continuing: {}", e);
        }
        match self.host.session.start() {
            Ok(true) => info!("started {}", self.cfg.display_manager),
            Ok(false) => debug!("{} was already running", self.cfg.display_manager),
            Err(e) => warn!("{} failed, continuing: {:#}", Step::StartSession, e),
        }
    }

    fn verify(&self) -> Result<()> {
        let stray: Vec<_> = self.host.device_states(self.cfg)?
            .into_iter()
            .filter(|(_, state)| !state.is_host())
            .map(|(address, state)| format!("{} is {}", address, state))
            .collect();
        if stray.is_empty() {
            Ok(())
        } else {
            Err(Error::fatal(Step::Verify, stray.join(", ")))
        }
    }
}
