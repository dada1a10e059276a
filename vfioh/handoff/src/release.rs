//! Host to guest: take the GPU away from the desktop and give it to the passthrough driver.

use std::io;

use common::config::Config;
use common::pci_device::DriverState;

use crate::error::{Error, Result, Step};
use crate::host::Host;
use crate::module::unload_failure;
use crate::retry::RetryPolicy;
use crate::Outcome;

pub struct ReleaseController<'a> {
    cfg: &'a Config,
    host: Host<'a>,
}

impl<'a> ReleaseController<'a> {
    pub fn new(cfg: &'a Config, host: Host<'a>) -> ReleaseController<'a> {
        ReleaseController { cfg, host }
    }

    pub fn run(&self) -> Result<Outcome> {
        let states = self.host.device_states(self.cfg)?;
        if states.iter().all(|(_, state)| *state == DriverState::Passthrough) {
            info!("all devices are already bound to {}", self.cfg.passthrough_driver);
            return Ok(Outcome::AlreadyInState);
        }
        self.host.check_iommu(self.cfg)?;
        for (address, state) in &states {
            debug!("{} is {}", address, state);
        }

        self.stop_session();
        self.reap();
        self.unload_host_modules()?;
        self.unbind_consoles();

        debug!("waiting {:?} for the GPU to settle", self.cfg.timing.settle());
        self.host.clock.sleep(self.cfg.timing.settle());

        self.load_passthrough()?;
        self.bind_devices()?;
        info!("GPU handed over to {}", self.cfg.passthrough_driver);
        Ok(Outcome::Completed)
    }

    fn stop_session(&self) {
        match self.host.session.stop() {
            Ok(true) => info!("stopped {}", self.cfg.display_manager),
            Ok(false) => debug!("{} was not running", self.cfg.display_manager),
            Err(e) => warn!("{} failed, continuing: {:#}", Step::StopSession, e),
        }

        let reaper = self.host.reaper(&self.cfg.timing);
        if let Err(e) = reaper.terminate_named(&self.cfg.session_processes) {
            warn!("{} failed, continuing: {}", Step::KillSession, e);
        }
    }

    fn reap(&self) {
        match self.host.reaper(&self.cfg.timing).reap(&self.cfg.device_files) {
            Ok(report) if !report.survivors.is_empty() => {
                warn!("{} processes still hold GPU device files, module unload will likely fail",
                      report.survivors.len());
            }
            Ok(_) => (),
            Err(e) => warn!("{} failed, continuing: {}", Step::ReapHolders, e),
        }
    }

    /// Modeset first with retries, everything else exactly once. Nothing after a failure.
    fn unload_host_modules(&self) -> Result<()> {
        let timing = &self.cfg.timing;
        let loader = self.host.module_loader(RetryPolicy::new(timing.unload_attempts, timing.unload_backoff()));
        loader.unload(&self.cfg.modeset_module)
            .map_err(|e| unload_failure(Step::UnloadModeset, e))?;
        for module in &self.cfg.host_modules {
            loader.unload_once(module)
                .map_err(|e| unload_failure(Step::UnloadHostModules, e))?;
        }
        Ok(())
    }

    fn unbind_consoles(&self) {
        match self.host.console.unbind_vtconsoles() {
            Ok(consoles) if !consoles.is_empty() => info!("unbound {}", consoles.join(", ")),
            Ok(_) => (),
            Err(e) => warn!("{} failed, continuing: {}", Step::UnbindConsoles, e),
        }
        match self.host.console.unbind_efifb() {
            Ok(true) => info!("unbound the EFI framebuffer"),
            Ok(false) => (),
            Err(e) => warn!("unbinding the EFI framebuffer failed, continuing: {}", e),
        }
    }

    fn load_passthrough(&self) -> Result<()> {
        let loader = self.host.module_loader(RetryPolicy::once());
        for module in &self.cfg.passthrough_modules {
            loader.load(module).map_err(|e| Error::fatal(Step::LoadPassthrough, e))?;
        }
        Ok(())
    }

    fn bind_devices(&self) -> Result<()> {
        let driver = self.cfg.passthrough_driver.as_str();
        let bus = self.host.bus;
        for address in &self.cfg.devices {
            let fatal = |e: io::Error| Error::fatal(Step::BindDevices, format!("{}: {}", address, e));
            if bus.driver(address).map_err(fatal)?.as_deref() == Some(driver) {
                continue;
            }
            info!("binding {} to {}", address, driver);
            bus.set_override(address, Some(driver)).map_err(fatal)?;
            bus.unbind(address).map_err(fatal)?;
            bus.probe(address).map_err(fatal)?;
        }

        for (address, state) in self.host.device_states(self.cfg)? {
            if state != DriverState::Passthrough {
                return Err(Error::fatal(Step::BindDevices, format!("{} is {} after binding", address, state)));
            }
        }
        Ok(())
    }
}
