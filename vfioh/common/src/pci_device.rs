use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::util;

/// PCI devices relative to the sysfs mount point.
pub const PCI_DEVICES: &str = "bus/pci/devices";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{0}' is not a PCI address, expected dddd:bb:dd.f")]
pub struct PciAddressError(String);

/// Domain:Bus:Device.Function of a PCI function, always with an explicit domain.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress(String);

fn dbdf_regex() -> &'static Regex {
    static DBDF: OnceLock<Regex> = OnceLock::new();
    DBDF.get_or_init(|| {
        Regex::new(r"^(?:([[:xdigit:]]{4}):)?([[:xdigit:]]{2}:[[:xdigit:]]{2}\.[0-7])$")
            .expect("static PCI address regex")
    })
}

impl PciAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address without its function number, shared by all functions of one card.
    pub fn slot(&self) -> &str {
        match self.0.rfind('.') {
            Some(dot) => &self.0[..dot],
            None => &self.0,
        }
    }

    pub fn sysfs_path(&self, sysfs: &Path) -> PathBuf {
        sysfs.join(PCI_DEVICES).join(&self.0)
    }
}

impl FromStr for PciAddress {
    type Err = PciAddressError;

    fn from_str(s: &str) -> Result<PciAddress, PciAddressError> {
        let s = s.trim();
        let caps = dbdf_regex().captures(s).ok_or_else(|| PciAddressError(s.to_owned()))?;
        let domain = match caps.get(1) {
            Some(domain) => domain.as_str().to_owned(),
            None => {
                debug!("No PCI domain supplied for {}, assuming 0000", s);
                "0000".to_owned()
            }
        };
        Ok(PciAddress(format!("{}:{}", domain, &caps[2]).to_lowercase()))
    }
}

impl TryFrom<String> for PciAddress {
    type Error = PciAddressError;

    fn try_from(s: String) -> Result<PciAddress, PciAddressError> {
        s.parse()
    }
}

impl From<PciAddress> for String {
    fn from(address: PciAddress) -> String {
        address.0
    }
}

impl Display for PciAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which driver currently owns a PCI function, as read from sysfs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Host(String),
    Unbound,
    Passthrough,
}

impl DriverState {
    pub fn classify(driver: Option<&str>, passthrough: &str) -> DriverState {
        match driver {
            None => DriverState::Unbound,
            Some(name) if name == passthrough => DriverState::Passthrough,
            Some(name) => DriverState::Host(name.to_owned()),
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, DriverState::Host(_))
    }
}

impl Display for DriverState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            DriverState::Host(driver) => write!(f, "bound to host driver {}", driver),
            DriverState::Unbound => f.write_str("unbound"),
            DriverState::Passthrough => f.write_str("bound to the passthrough driver"),
        }
    }
}

/// Reads the name of the driver bound to `address`.
///
/// A missing device is `ErrorKind::NotFound`, a device without a driver is `Ok(None)`.
pub fn read_driver(sysfs: &Path, address: &PciAddress) -> io::Result<Option<String>> {
    let dev = address.sysfs_path(sysfs);
    if !dev.exists() {
        return Err(io::Error::new(ErrorKind::NotFound, format!("no PCI device {}", address)));
    }
    match fs::read_link(dev.join("driver")) {
        Ok(target) => Ok(target.file_name().map(|name| name.to_string_lossy().into_owned())),
        Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Reads the IOMMU group number of `address`. `Ok(None)` when the function has no
/// group, which means the IOMMU is off.
pub fn read_iommu_group(sysfs: &Path, address: &PciAddress) -> io::Result<Option<u32>> {
    let dev = address.sysfs_path(sysfs);
    if !dev.exists() {
        return Err(io::Error::new(ErrorKind::NotFound, format!("no PCI device {}", address)));
    }
    let target = match fs::read_link(dev.join("iommu_group")) {
        Ok(target) => target,
        Err(ref e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let group = target.file_name().and_then(|name| name.to_str()).and_then(|name| name.parse().ok());
    group.map(Some).ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidData, format!("odd IOMMU group link {}", target.display()))
    })
}

pub struct PciFunction {
    pub address: PciAddress,
    pub vendor: u16,
    pub device: u16,
    pub class: u32,
    pub driver: Option<String>,
    pub boot_vga: bool,
}

impl PartialEq for PciFunction {
    fn eq(&self, other: &PciFunction) -> bool {
        self.address == other.address
    }
}

impl Eq for PciFunction {}

impl PartialOrd for PciFunction {
    fn partial_cmp(&self, other: &PciFunction) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PciFunction {
    fn cmp(&self, other: &PciFunction) -> Ordering {
        self.address.cmp(&other.address)
    }
}

impl Display for PciFunction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} {} [{:04x}:{:04x}] ({})", self.address, self.kind(), self.vendor, self.device,
               self.driver.as_deref().unwrap_or("no driver"))
    }
}

fn read_hex(path: &Path) -> io::Result<u32> {
    let raw = fs::read_to_string(path)?;
    util::parse_hex(&raw).ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidData, format!("{} is not hex: {:?}", path.display(), raw.trim()))
    })
}

impl PciFunction {
    pub fn read(sysfs: &Path, address: &PciAddress) -> io::Result<PciFunction> {
        let dev = address.sysfs_path(sysfs);
        let driver = read_driver(sysfs, address)?;
        let boot_vga = fs::read_to_string(dev.join("boot_vga"))
            .map(|s| s.trim() == "1")
            .unwrap_or(false);

        Ok(PciFunction {
            address: address.clone(),
            vendor: read_hex(&dev.join("vendor"))? as u16,
            device: read_hex(&dev.join("device"))? as u16,
            class: read_hex(&dev.join("class"))?,
            driver,
            boot_vga,
        })
    }

    /// Display controller class (0x03xxxx).
    pub fn is_display(&self) -> bool {
        self.class >> 16 == 0x03
    }

    /// Functions that usually sit next to a GPU on the same card.
    pub fn is_companion(&self) -> bool {
        matches!(self.class >> 8, 0x0403 | 0x0c03 | 0x0c80)
    }

    pub fn kind(&self) -> &'static str {
        match self.class >> 8 {
            0x0300 => "VGA controller",
            0x0302 => "3D controller",
            0x0380 => "display controller",
            0x0403 => "audio device",
            0x0c03 => "USB controller",
            0x0c80 => "serial bus controller",
            _ => "PCI device",
        }
    }
}

/// All PCI functions known to sysfs, sorted by address.
pub fn scan(sysfs: &Path) -> io::Result<Vec<PciFunction>> {
    let mut functions = Vec::new();
    for entry in fs::read_dir(sysfs.join(PCI_DEVICES))? {
        let entry = entry?;
        let address = match entry.file_name().to_str().map(str::parse::<PciAddress>) {
            Some(Ok(address)) => address,
            _ => continue,
        };
        match PciFunction::read(sysfs, &address) {
            Ok(function) => functions.push(function),
            Err(e) => warn!("Skipping {}: {}", address, e),
        }
    }
    functions.sort();
    Ok(functions)
}
