//! Finding GPUs and the functions that have to travel with them.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::Path;

use common::pci_device::{self, PciAddress, PciFunction};

pub struct GpuGroup {
    pub gpu: PciFunction,
    /// Other functions on the same bus:device, passed through alongside the GPU.
    pub companions: Vec<PciFunction>,
}

impl GpuGroup {
    /// GPU first, then its companions in address order.
    pub fn addresses(&self) -> Vec<PciAddress> {
        Some(&self.gpu).into_iter()
            .chain(&self.companions)
            .map(|function| function.address.clone())
            .collect()
    }
}

impl Display for GpuGroup {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.gpu)?;
        if self.gpu.boot_vga {
            f.write_str(" [boot VGA]")?;
        }
        for companion in &self.companions {
            write!(f, "\n\t+ {}", companion)?;
        }
        Ok(())
    }
}

/// Every display controller with the functions sharing its slot.
pub fn detect(sysfs: &Path) -> io::Result<Vec<GpuGroup>> {
    let (gpus, others): (Vec<_>, Vec<_>) = pci_device::scan(sysfs)?
        .into_iter()
        .partition(PciFunction::is_display);

    let mut groups: Vec<GpuGroup> = gpus.into_iter()
        .map(|gpu| GpuGroup { gpu, companions: Vec::new() })
        .collect();
    for function in others {
        let slot = function.address.slot().to_owned();
        match groups.iter_mut().find(|group| group.gpu.address.slot() == slot) {
            Some(group) if function.is_companion() => group.companions.push(function),
            Some(_) => warn!("{} shares a slot with a GPU but is not a usual companion, leaving it out", function),
            None => (),
        }
    }
    Ok(groups)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;

    fn function(sysfs: &Path, address: &str, class: &str, driver: &str) {
        let dev = sysfs.join(pci_device::PCI_DEVICES).join(address);
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("vendor"), "0x10de\n").unwrap();
        fs::write(dev.join("device"), "0x1e84\n").unwrap();
        fs::write(dev.join("class"), format!("{}\n", class)).unwrap();
        let driver_dir = sysfs.join("bus/pci/drivers").join(driver);
        fs::create_dir_all(&driver_dir).unwrap();
        symlink(&driver_dir, dev.join("driver")).unwrap();
    }

    #[test]
    fn groups_functions_by_slot() {
        let sysfs = tempfile::tempdir().unwrap();
        function(sysfs.path(), "0000:00:02.0", "0x030000", "i915");
        function(sysfs.path(), "0000:00:1f.3", "0x040300", "snd_hda_intel");
        function(sysfs.path(), "0000:01:00.0", "0x030000", "nvidia");
        function(sysfs.path(), "0000:01:00.1", "0x040300", "snd_hda_intel");
        function(sysfs.path(), "0000:01:00.2", "0x0c0330", "xhci_hcd");
        function(sysfs.path(), "0000:01:00.3", "0x0c8000", "nvidia-gpu");
        fs::write(sysfs.path().join(pci_device::PCI_DEVICES).join("0000:00:02.0/boot_vga"), "1\n").unwrap();

        let groups = detect(sysfs.path()).unwrap();
        assert_eq!(groups.len(), 2);

        let igpu = &groups[0];
        assert!(igpu.gpu.boot_vga);
        assert!(igpu.companions.is_empty());

        let dgpu = &groups[1];
        let addresses: Vec<_> = dgpu.addresses().iter().map(|a| a.to_string()).collect();
        assert_eq!(addresses, ["0000:01:00.0", "0000:01:00.1", "0000:01:00.2", "0000:01:00.3"]);
        assert!(dgpu.to_string().contains("+ 0000:01:00.1 audio device"));
    }
}
