use std::io;
use std::path::PathBuf;

use common::pci_device::{self, PciAddress};
use common::util::sysfs_write;

/// Driver binding of PCI functions.
pub trait DeviceBus {
    fn driver(&self, address: &PciAddress) -> io::Result<Option<String>>;
    /// Sets `driver_override`, `None` clears it.
    fn set_override(&self, address: &PciAddress, driver: Option<&str>) -> io::Result<()>;
    /// Detaches the function from whatever driver has it. No-op when unbound.
    fn unbind(&self, address: &PciAddress) -> io::Result<()>;
    /// Asks the kernel to find a driver for the function.
    fn probe(&self, address: &PciAddress) -> io::Result<()>;
    /// IOMMU group of the function, `None` when the IOMMU is not enabled.
    fn iommu_group(&self, address: &PciAddress) -> io::Result<Option<u32>>;
}

pub struct SysfsBus {
    root: PathBuf,
}

impl SysfsBus {
    pub fn new<P: Into<PathBuf>>(root: P) -> SysfsBus {
        SysfsBus { root: root.into() }
    }
}

impl DeviceBus for SysfsBus {
    fn driver(&self, address: &PciAddress) -> io::Result<Option<String>> {
        pci_device::read_driver(&self.root, address)
    }

    fn set_override(&self, address: &PciAddress, driver: Option<&str>) -> io::Result<()> {
        // a lone newline is what clears the override
        sysfs_write(&address.sysfs_path(&self.root).join("driver_override"), driver.unwrap_or("\n"))
    }

    fn unbind(&self, address: &PciAddress) -> io::Result<()> {
        if self.driver(address)?.is_none() {
            debug!("{} has no driver to unbind from", address);
            return Ok(());
        }
        sysfs_write(&address.sysfs_path(&self.root).join("driver/unbind"), address.as_str())
    }

    fn probe(&self, address: &PciAddress) -> io::Result<()> {
        sysfs_write(&self.root.join("bus/pci/drivers_probe"), address.as_str())
    }

    fn iommu_group(&self, address: &PciAddress) -> io::Result<Option<u32>> {
        pci_device::read_iommu_group(&self.root, address)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;

    fn fake_sysfs(driver: Option<&str>) -> (tempfile::TempDir, PciAddress) {
        let sysfs = tempfile::tempdir().unwrap();
        let address: PciAddress = "0000:01:00.0".parse().unwrap();
        let dev = address.sysfs_path(sysfs.path());
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("driver_override"), "(null)\n").unwrap();
        let group = sysfs.path().join("kernel/iommu_groups/1");
        fs::create_dir_all(&group).unwrap();
        symlink(&group, dev.join("iommu_group")).unwrap();
        fs::write(sysfs.path().join("bus/pci/drivers_probe"), "").unwrap();
        if let Some(driver) = driver {
            let driver_dir = sysfs.path().join("bus/pci/drivers").join(driver);
            fs::create_dir_all(&driver_dir).unwrap();
            fs::write(driver_dir.join("unbind"), "").unwrap();
            symlink(&driver_dir, dev.join("driver")).unwrap();
        }
        (sysfs, address)
    }

    #[test]
    fn override_and_unbind() {
        let (sysfs, address) = fake_sysfs(Some("nvidia"));
        let bus = SysfsBus::new(sysfs.path());
        assert_eq!(bus.driver(&address).unwrap().as_deref(), Some("nvidia"));
        assert_eq!(bus.iommu_group(&address).unwrap(), Some(1));

        bus.set_override(&address, Some("vfio-pci")).unwrap();
        bus.unbind(&address).unwrap();
        bus.probe(&address).unwrap();

        let dev = address.sysfs_path(sysfs.path());
        assert!(fs::read_to_string(dev.join("driver_override")).unwrap().starts_with("vfio-pci"));
        assert_eq!(fs::read_to_string(sysfs.path().join("bus/pci/drivers/nvidia/unbind")).unwrap(),
                   "0000:01:00.0");
        assert_eq!(fs::read_to_string(sysfs.path().join("bus/pci/drivers_probe")).unwrap(), "0000:01:00.0");

        bus.set_override(&address, None).unwrap();
        assert!(fs::read_to_string(dev.join("driver_override")).unwrap().starts_with('\n'));
    }

    #[test]
    fn unbinding_an_unbound_function_does_nothing() {
        let (sysfs, address) = fake_sysfs(None);
        let bus = SysfsBus::new(sysfs.path());
        assert_eq!(bus.driver(&address).unwrap(), None);
        bus.unbind(&address).unwrap();
    }
}
