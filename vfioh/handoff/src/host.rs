//! Everything the controllers touch outside their own process.

use std::io::ErrorKind;
use std::path::PathBuf;

use common::config::{Config, TimingConfig};
use common::pci_device::{DriverState, PciAddress};

use crate::bus::{DeviceBus, SysfsBus};
use crate::clock::{Clock, SystemClock};
use crate::console::{ConsoleControl, SysfsConsole};
use crate::error::{Error, Result, Step};
use crate::module::{ModuleBackend, ModuleLoader, Modprobe};
use crate::reaper::{HolderScanner, KillSignaller, ProcScanner, ProcessReaper, Signaller};
use crate::retry::RetryPolicy;
use crate::session::{ServiceManager, SessionControl};

pub const SYSFS: &str = "/sys";

#[derive(Clone, Copy)]
pub struct Host<'a> {
    pub bus: &'a dyn DeviceBus,
    pub console: &'a dyn ConsoleControl,
    pub modules: &'a dyn ModuleBackend,
    pub session: &'a dyn SessionControl,
    pub scanner: &'a dyn HolderScanner,
    pub signaller: &'a dyn Signaller,
    pub clock: &'a dyn Clock,
}

impl<'a> Host<'a> {
    /// Reads the binding of every configured function, in configuration order.
    pub fn device_states(&self, cfg: &Config) -> Result<Vec<(PciAddress, DriverState)>> {
        let mut states = Vec::with_capacity(cfg.devices.len());
        for address in &cfg.devices {
            let driver = self.bus.driver(address).map_err(|e| match e.kind() {
                ErrorKind::NotFound => Error::Configuration(format!("PCI device {} does not exist", address)),
                _ => Error::fatal(Step::ReadState, format!("{}: {}", address, e)),
            })?;
            states.push((address.clone(), DriverState::classify(driver.as_deref(), &cfg.passthrough_driver)));
        }
        Ok(states)
    }

    /// Every configured function has to sit in an IOMMU group, or vfio-pci cannot take it.
    pub fn check_iommu(&self, cfg: &Config) -> Result<()> {
        for address in &cfg.devices {
            match self.bus.iommu_group(address) {
                Ok(Some(group)) => debug!("{} is in IOMMU group {}", address, group),
                Ok(None) => {
                    return Err(Error::Configuration(format!(
                        "{} has no IOMMU group, enable the IOMMU first (intel_iommu=on or amd_iommu=on)",
                        address)));
                }
                Err(ref e) if e.kind() == ErrorKind::NotFound => {
                    return Err(Error::Configuration(format!("PCI device {} does not exist", address)));
                }
                Err(e) => return Err(Error::fatal(Step::ReadState, format!("{}: {}", address, e))),
            }
        }
        Ok(())
    }

    pub fn module_loader(&self, policy: RetryPolicy) -> ModuleLoader<'a> {
        ModuleLoader::new(self.modules, self.clock, policy)
    }

    pub fn reaper(&self, timing: &TimingConfig) -> ProcessReaper<'a> {
        ProcessReaper::new(self.scanner, self.signaller, self.clock, timing.grace(), timing.poll())
    }
}

/// The real machine.
pub struct System {
    bus: SysfsBus,
    console: SysfsConsole,
    modules: Modprobe,
    session: ServiceManager,
    scanner: ProcScanner,
    signaller: KillSignaller,
    clock: SystemClock,
}

impl System {
    pub fn new(cfg: &Config) -> System {
        let sysfs = PathBuf::from(SYSFS);
        System {
            bus: SysfsBus::new(sysfs.clone()),
            console: SysfsConsole::new(sysfs),
            modules: Modprobe::new(),
            session: ServiceManager::new(cfg.display_manager.clone()),
            scanner: ProcScanner::new(),
            signaller: KillSignaller,
            clock: SystemClock::new(),
        }
    }

    pub fn host(&self) -> Host<'_> {
        Host {
            bus: &self.bus,
            console: &self.console,
            modules: &self.modules,
            session: &self.session,
            scanner: &self.scanner,
            signaller: &self.signaller,
            clock: &self.clock,
        }
    }
}
