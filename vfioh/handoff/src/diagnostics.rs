//! Snapshots of the handoff-relevant host state, for `status` and after failures.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

use common::config::Config;
use common::pci_device::{DriverState, PciAddress};

use crate::error::{Error, Step};
use crate::host::Host;
use crate::reaper::HolderScanner;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Loaded,
    NotLoaded,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub address: PciAddress,
    pub driver: Option<String>,
    pub state: Option<DriverState>,
    pub iommu_group: Option<u32>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Holder {
    pub pid: i32,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub taken_at: String,
    pub vm: Option<String>,
    pub phase: Option<String>,
    pub failed_step: Option<Step>,
    pub error: Option<String>,
    pub session_active: Option<bool>,
    pub modules: BTreeMap<String, ModuleStatus>,
    pub devices: Vec<DeviceStatus>,
    pub passthrough_bound: Vec<PciAddress>,
    pub host_bound: Vec<PciAddress>,
    pub holders: Vec<Holder>,
    #[serde(skip)]
    file_stamp: String,
}

fn holders(scanner: &dyn HolderScanner, patterns: &[String]) -> Vec<Holder> {
    match scanner.holders(patterns) {
        Ok(pids) => pids.into_iter().map(|pid| Holder { pid, name: scanner.name_of(pid) }).collect(),
        Err(e) => {
            warn!("Could not scan for device holders: {}", e);
            Vec::new()
        }
    }
}

impl Snapshot {
    /// Reads everything it can. Nothing here fails: unreadable parts are recorded as unknown.
    pub fn collect(host: &Host, cfg: &Config) -> Snapshot {
        let now = OffsetDateTime::now_utc();
        let taken_at = now.format(&Rfc3339).unwrap_or_default();
        let file_stamp = now.format(format_description!("[year][month][day]_[hour][minute][second]"))
            .unwrap_or_default();

        let modules = cfg.passthrough_modules.iter()
            .chain(Some(&cfg.modeset_module))
            .chain(&cfg.host_modules)
            .map(|module| {
                let status = match host.modules.is_loaded(module) {
                    Ok(true) => ModuleStatus::Loaded,
                    Ok(false) => ModuleStatus::NotLoaded,
                    Err(_) => ModuleStatus::Unknown,
                };
                (module.clone(), status)
            })
            .collect();

        let devices: Vec<_> = cfg.devices.iter().map(|address| {
            let iommu_group = host.bus.iommu_group(address).ok().flatten();
            match host.bus.driver(address) {
                Ok(driver) => DeviceStatus {
                    address: address.clone(),
                    state: Some(DriverState::classify(driver.as_deref(), &cfg.passthrough_driver)),
                    driver,
                    iommu_group,
                    error: None,
                },
                Err(e) => DeviceStatus {
                    address: address.clone(),
                    driver: None,
                    state: None,
                    iommu_group,
                    error: Some(e.to_string()),
                },
            }
        }).collect();

        let bound = |want: fn(&DriverState) -> bool| -> Vec<PciAddress> {
            devices.iter()
                .filter(|d| d.state.as_ref().map_or(false, want))
                .map(|d| d.address.clone())
                .collect()
        };
        let passthrough_bound = bound(|s| *s == DriverState::Passthrough);
        let host_bound = bound(DriverState::is_host);

        let session_active = host.session.is_active()
            .map_err(|e| debug!("session state unknown: {:#}", e))
            .ok();

        Snapshot {
            taken_at,
            vm: None,
            phase: None,
            failed_step: None,
            error: None,
            session_active,
            modules,
            devices,
            passthrough_bound,
            host_bound,
            holders: holders(host.scanner, &cfg.device_files),
            file_stamp,
        }
    }

    pub fn with_failure(mut self, vm: Option<&str>, phase: &str, error: &Error) -> Snapshot {
        self.vm = vm.map(str::to_owned);
        self.phase = Some(phase.to_owned());
        self.failed_step = error.step();
        self.error = Some(error.to_string());
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Stores the snapshot as `diagnostic_<timestamp>.json` in `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("diagnostic_{}.json", self.file_stamp));
        let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Short human summary of the parts that usually explain a failure.
    pub fn log(&self) {
        for device in &self.devices {
            if device.state.is_some() && device.iommu_group.is_none() {
                info!("{}: no IOMMU group", device.address);
            }
            match (&device.state, &device.error) {
                (Some(state), _) => info!("{}: {}", device.address, state),
                (None, Some(e)) => info!("{}: {}", device.address, e),
                (None, None) => (),
            }
        }
        let loaded: Vec<_> = self.modules.iter()
            .filter(|(_, status)| **status == ModuleStatus::Loaded)
            .map(|(name, _)| name.as_str())
            .collect();
        info!("loaded modules: {}", if loaded.is_empty() { "none".to_owned() } else { loaded.join(", ") });
        for holder in &self.holders {
            info!("process {} ({}) holds a GPU device file", holder.pid,
                  holder.name.as_deref().unwrap_or("?"));
        }
    }
}
