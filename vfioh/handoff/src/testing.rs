//! An in-memory machine for the controller tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, ErrorKind};
use std::time::Duration;

use nix::sys::signal::Signal;

use common::config::Config;
use common::pci_device::PciAddress;

use crate::bus::DeviceBus;
use crate::clock::{Clock, ManualClock};
use crate::console::ConsoleControl;
use crate::error::ModuleError;
use crate::host::Host;
use crate::module::ModuleBackend;
use crate::reaper::{HolderScanner, Signaller};
use crate::session::SessionControl;

pub const GPU: &str = "0000:01:00.0";
pub const AUDIO: &str = "0000:01:00.1";

pub fn addr(s: &str) -> PciAddress {
    s.parse().unwrap()
}

pub fn config() -> Config {
    Config {
        vms: vec!["win11".to_owned()],
        devices: vec![addr(GPU), addr(AUDIO)],
        report_dir: None,
        ..Config::default()
    }
}

pub struct FakeDevice {
    pub driver: Option<String>,
    pub driver_override: Option<String>,
    pub host_driver: String,
    pub iommu_group: Option<u32>,
}

/// Simulates just enough kernel: modules with users, drivers that need a module,
/// probing that honours driver_override, and processes that may ignore SIGTERM.
pub struct FakeHost {
    pub devices: RefCell<BTreeMap<PciAddress, FakeDevice>>,
    pub loaded: RefCell<BTreeSet<String>>,
    /// module -> modules that use it
    pub users: BTreeMap<String, Vec<String>>,
    /// driver -> module providing it
    pub driver_modules: BTreeMap<String, String>,
    pub unload_errors: RefCell<BTreeMap<String, VecDeque<ModuleError>>>,
    pub load_errors: RefCell<BTreeMap<String, ModuleError>>,
    pub session_active: Cell<bool>,
    pub vtconsoles_bound: Cell<bool>,
    pub efifb_bound: Cell<bool>,
    pub holders: RefCell<BTreeSet<i32>>,
    pub stubborn: RefCell<BTreeSet<i32>>,
    pub names: RefCell<BTreeMap<i32, String>>,
    /// Everything that changed, with the clock reading at the time.
    pub events: RefCell<Vec<(String, Duration)>>,
    pub clock: ManualClock,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

impl FakeHost {
    /// GPU on nvidia and its audio function on snd_hda_intel, desktop running.
    pub fn new() -> FakeHost {
        let mut devices = BTreeMap::new();
        for (address, driver) in [(GPU, "nvidia"), (AUDIO, "snd_hda_intel")] {
            devices.insert(addr(address), FakeDevice {
                driver: Some(driver.to_owned()),
                driver_override: None,
                host_driver: driver.to_owned(),
                iommu_group: Some(14),
            });
        }
        let users = [
            ("nvidia", strings(&["nvidia_modeset", "nvidia_uvm"])),
            ("nvidia_modeset", strings(&["nvidia_drm"])),
            ("vfio", strings(&["vfio_iommu_type1", "vfio_pci"])),
        ].into_iter().map(|(module, users)| (module.to_owned(), users)).collect();
        let driver_modules = [("nvidia", "nvidia"), ("vfio-pci", "vfio_pci")]
            .into_iter().map(|(d, m)| (d.to_owned(), m.to_owned())).collect();

        FakeHost {
            devices: RefCell::new(devices),
            loaded: RefCell::new(strings(&["nvidia_drm", "nvidia_modeset", "nvidia_uvm", "nvidia"])
                .into_iter().collect()),
            users,
            driver_modules,
            unload_errors: RefCell::new(BTreeMap::new()),
            load_errors: RefCell::new(BTreeMap::new()),
            session_active: Cell::new(true),
            vtconsoles_bound: Cell::new(true),
            efifb_bound: Cell::new(true),
            holders: RefCell::new(BTreeSet::new()),
            stubborn: RefCell::new(BTreeSet::new()),
            names: RefCell::new(BTreeMap::new()),
            events: RefCell::new(Vec::new()),
            clock: ManualClock::default(),
        }
    }

    pub fn host(&self) -> Host<'_> {
        Host {
            bus: self,
            console: self,
            modules: self,
            session: self,
            scanner: self,
            signaller: self,
            clock: &self.clock,
        }
    }

    pub fn driver_of(&self, address: &str) -> Option<String> {
        self.devices.borrow()[&addr(address)].driver.clone()
    }

    pub fn fail_unload(&self, module: &str, errors: Vec<ModuleError>) {
        self.unload_errors.borrow_mut().insert(module.to_owned(), errors.into());
    }

    pub fn add_process(&self, pid: i32, name: &str, holds_gpu: bool) {
        self.names.borrow_mut().insert(pid, name.to_owned());
        if holds_gpu {
            self.holders.borrow_mut().insert(pid);
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.borrow().iter().map(|(event, _)| event.clone()).collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.borrow().iter().filter(|(e, _)| e == event).count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.borrow().iter().position(|(e, _)| e == event)
    }

    /// Clock readings of every occurrence of `event`.
    pub fn times(&self, event: &str) -> Vec<Duration> {
        self.events.borrow().iter().filter(|(e, _)| e == event).map(|(_, at)| *at).collect()
    }

    fn log(&self, event: String) {
        self.events.borrow_mut().push((event, self.clock.now()));
    }

    fn driver_available(&self, driver: &str) -> bool {
        self.driver_modules.get(driver).map_or(true, |module| self.loaded.borrow().contains(module))
    }

    /// What the kernel does on probe or on module load for an unbound device.
    fn try_bind(&self, device: &mut FakeDevice) {
        if device.driver.is_some() {
            return;
        }
        let candidate = device.driver_override.clone().unwrap_or_else(|| device.host_driver.clone());
        if self.driver_available(&candidate) {
            device.driver = Some(candidate);
        }
    }

    fn device_error(address: &PciAddress) -> io::Error {
        io::Error::new(ErrorKind::NotFound, format!("no PCI device {}", address))
    }
}

impl DeviceBus for FakeHost {
    fn driver(&self, address: &PciAddress) -> io::Result<Option<String>> {
        let devices = self.devices.borrow();
        let device = devices.get(address).ok_or_else(|| FakeHost::device_error(address))?;
        Ok(device.driver.clone())
    }

    fn set_override(&self, address: &PciAddress, driver: Option<&str>) -> io::Result<()> {
        self.log(format!("override {} {}", address, driver.unwrap_or("-")));
        let mut devices = self.devices.borrow_mut();
        let device = devices.get_mut(address).ok_or_else(|| FakeHost::device_error(address))?;
        device.driver_override = driver.map(str::to_owned);
        Ok(())
    }

    fn unbind(&self, address: &PciAddress) -> io::Result<()> {
        self.log(format!("unbind {}", address));
        let mut devices = self.devices.borrow_mut();
        let device = devices.get_mut(address).ok_or_else(|| FakeHost::device_error(address))?;
        device.driver = None;
        Ok(())
    }

    fn probe(&self, address: &PciAddress) -> io::Result<()> {
        self.log(format!("probe {}", address));
        let mut devices = self.devices.borrow_mut();
        let device = devices.get_mut(address).ok_or_else(|| FakeHost::device_error(address))?;
        self.try_bind(device);
        Ok(())
    }

    fn iommu_group(&self, address: &PciAddress) -> io::Result<Option<u32>> {
        let devices = self.devices.borrow();
        let device = devices.get(address).ok_or_else(|| FakeHost::device_error(address))?;
        Ok(device.iommu_group)
    }
}

impl ConsoleControl for FakeHost {
    fn unbind_vtconsoles(&self) -> io::Result<Vec<String>> {
        self.log("unbind vtconsoles".to_owned());
        self.vtconsoles_bound.set(false);
        Ok(vec!["vtcon1".to_owned()])
    }

    fn bind_vtconsoles(&self) -> io::Result<Vec<String>> {
        self.log("bind vtconsoles".to_owned());
        self.vtconsoles_bound.set(true);
        Ok(vec!["vtcon1".to_owned()])
    }

    fn unbind_efifb(&self) -> io::Result<bool> {
        self.log("unbind efifb".to_owned());
        Ok(self.efifb_bound.replace(false))
    }

    fn bind_efifb(&self) -> io::Result<bool> {
        self.log("bind efifb".to_owned());
        Ok(!self.efifb_bound.replace(true))
    }
}

impl ModuleBackend for FakeHost {
    fn is_loaded(&self, name: &str) -> io::Result<bool> {
        Ok(self.loaded.borrow().contains(name))
    }

    fn load(&self, name: &str) -> Result<(), ModuleError> {
        self.log(format!("load {}", name));
        if let Some(err) = self.load_errors.borrow().get(name) {
            return Err(err.clone());
        }
        self.loaded.borrow_mut().insert(name.to_owned());
        for device in self.devices.borrow_mut().values_mut() {
            self.try_bind(device);
        }
        Ok(())
    }

    fn unload(&self, name: &str) -> Result<(), ModuleError> {
        self.log(format!("unload {}", name));
        if let Some(err) = self.unload_errors.borrow_mut().get_mut(name).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        let in_use = self.users.get(name).map_or(false, |users| {
            users.iter().any(|user| self.loaded.borrow().contains(user))
        });
        if in_use {
            return Err(ModuleError::Busy { module: name.to_owned(), message: format!("Module {} is in use", name) });
        }
        self.loaded.borrow_mut().remove(name);
        for device in self.devices.borrow_mut().values_mut() {
            let provided = device.driver.as_ref().and_then(|d| self.driver_modules.get(d));
            if provided.map_or(false, |module| module == name) {
                device.driver = None;
            }
        }
        Ok(())
    }
}

impl SessionControl for FakeHost {
    fn is_active(&self) -> anyhow::Result<bool> {
        Ok(self.session_active.get())
    }

    fn stop(&self) -> anyhow::Result<bool> {
        self.log("stop session".to_owned());
        Ok(self.session_active.replace(false))
    }

    fn start(&self) -> anyhow::Result<bool> {
        self.log("start session".to_owned());
        Ok(!self.session_active.replace(true))
    }
}

impl HolderScanner for FakeHost {
    fn holders(&self, patterns: &[String]) -> io::Result<BTreeSet<i32>> {
        if patterns.is_empty() {
            return Ok(BTreeSet::new());
        }
        Ok(self.holders.borrow().clone())
    }

    fn by_name(&self, names: &[String]) -> io::Result<BTreeSet<i32>> {
        Ok(self.names.borrow().iter()
            .filter(|(_, name)| names.contains(name))
            .map(|(pid, _)| *pid)
            .collect())
    }

    fn name_of(&self, pid: i32) -> Option<String> {
        self.names.borrow().get(&pid).cloned()
    }
}

impl Signaller for FakeHost {
    fn signal(&self, pid: i32, signal: Signal) -> io::Result<()> {
        self.log(format!("{:?} {}", signal, pid));
        if signal == Signal::SIGKILL || !self.stubborn.borrow().contains(&pid) {
            self.holders.borrow_mut().remove(&pid);
            self.names.borrow_mut().remove(&pid);
        }
        Ok(())
    }
}
