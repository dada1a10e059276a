use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::pci_device::PciAddress;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// VMs whose lifecycle hooks hand the GPU over.
    pub vms: Vec<String>,
    // convention: gpu is first, companion functions follow
    pub devices: Vec<PciAddress>,

    pub passthrough_driver: String,
    // in load order
    pub passthrough_modules: Vec<String>,
    pub unload_passthrough_on_reclaim: bool,

    /// Host module holding the modeset, unloaded first and with retries.
    pub modeset_module: String,
    // most-dependent first, modeset_module excluded
    pub host_modules: Vec<String>,

    /// Device files whose holders get killed. A trailing `*` matches by prefix.
    pub device_files: Vec<String>,
    pub display_manager: String,
    pub session_processes: Vec<String>,

    pub report_dir: Option<PathBuf>,
    pub timing: TimingConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub grace_ms: u64,
    pub poll_ms: u64,
    pub unload_attempts: u32,
    pub unload_backoff_ms: u64,
    pub settle_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> TimingConfig {
        TimingConfig {
            grace_ms: 3000,
            poll_ms: 250,
            unload_attempts: 5,
            unload_backoff_ms: 1000,
            settle_ms: 2000,
        }
    }
}

impl TimingConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn unload_backoff(&self) -> Duration {
        Duration::from_millis(self.unload_backoff_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

impl Default for Config {
    fn default() -> Config {
        Config {
            vms: Vec::new(),
            devices: Vec::new(),
            passthrough_driver: "vfio-pci".to_owned(),
            passthrough_modules: strings(&["vfio", "vfio_iommu_type1", "vfio_pci"]),
            unload_passthrough_on_reclaim: true,
            modeset_module: "nvidia_drm".to_owned(),
            host_modules: strings(&["nvidia_modeset", "nvidia_uvm", "nvidia"]),
            device_files: strings(&["/dev/nvidia*", "/dev/dri/*", "/dev/fb0"]),
            display_manager: "display-manager".to_owned(),
            session_processes: strings(&["Xorg", "Xwayland", "gnome-shell", "kwin_wayland",
                                         "kwin_x11", "plasmashell", "sway", "Hyprland"]),
            report_dir: Some(PathBuf::from("/var/log/vfioh")),
            timing: TimingConfig::default(),
        }
    }
}

impl Config {
    pub const DEFAULT_PATH: &'static str = "/etc/vfioh.yml";

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to decode config file {}", path.display()))
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Config> {
        if path.as_ref().exists() {
            Config::load(path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let contents = serde_yaml::to_string(self)?;
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// Checks everything a handoff relies on. The message names the first problem found.
    /// `vms` may be empty, it only matters to hook invocations.
    pub fn validate(&self) -> ::std::result::Result<(), String> {
        if self.devices.is_empty() {
            return Err("no passthrough devices configured (run `vfioh detect --write`)".to_owned());
        }
        let unique: BTreeSet<_> = self.devices.iter().collect();
        if unique.len() != self.devices.len() {
            return Err("a PCI device is listed more than once".to_owned());
        }
        if self.passthrough_driver.is_empty() || self.passthrough_modules.is_empty() {
            return Err("passthrough driver and modules must be set".to_owned());
        }
        if self.modeset_module.is_empty() {
            return Err("modeset_module must be set".to_owned());
        }
        if self.timing.unload_attempts == 0 {
            return Err("timing.unload_attempts must be at least 1".to_owned());
        }
        Ok(())
    }

    pub fn manages(&self, vm: &str) -> bool {
        self.vms.iter().any(|x| x == vm)
    }

    /// Host modules in the order they get loaded back: least-dependent first.
    pub fn reload_order(&self) -> Vec<&str> {
        self.host_modules.iter().rev().map(String::as_str)
            .chain(Some(self.modeset_module.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn valid() -> Config {
        Config {
            vms: vec!["win11".to_owned()],
            devices: vec!["01:00.0".parse().unwrap(), "01:00.1".parse().unwrap()],
            ..Config::default()
        }
    }

    #[test]
    fn yaml_with_defaults() {
        let yaml = "vms: [win11]\ndevices: ['0000:01:00.0', '01:00.1']\ntiming:\n  grace_ms: 500\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.devices[1].as_str(), "0000:01:00.1");
        assert_eq!(cfg.timing.grace(), Duration::from_millis(500));
        assert_eq!(cfg.timing.unload_attempts, 5);
        assert_eq!(cfg.passthrough_driver, "vfio-pci");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_address_is_rejected() {
        let yaml = "vms: [win11]\ndevices: ['pci_0000_01_00_0']\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn validation() {
        assert!(Config::default().validate().unwrap_err().contains("no passthrough devices"));

        let mut cfg = valid();
        cfg.vms.clear();
        assert_eq!(cfg.validate(), Ok(()));

        let mut cfg = valid();
        cfg.devices.push(cfg.devices[0].clone());
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.timing.unload_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reload_reverses_unload_order() {
        let cfg = valid();
        assert_eq!(cfg.reload_order(), vec!["nvidia", "nvidia_uvm", "nvidia_modeset", "nvidia_drm"]);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vfioh.yml");
        let cfg = valid();
        cfg.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), cfg);
        assert_eq!(Config::load_or_default(dir.path().join("missing.yml")).unwrap(), Config::default());
        assert!(Config::load(dir.path().join("missing.yml")).is_err());
    }
}
