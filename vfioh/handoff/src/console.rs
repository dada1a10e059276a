use std::fs;
use std::io::{self, ErrorKind};
use std::path::PathBuf;

use common::util::sysfs_write;

const VTCONSOLES: &str = "class/vtconsole";
const EFIFB_DRIVER: &str = "bus/platform/drivers/efi-framebuffer";
const EFIFB_DEVICE: &str = "efi-framebuffer.0";

/// Consoles and framebuffers that pin the GPU while the host uses it.
pub trait ConsoleControl {
    /// Unbinds framebuffer-backed virtual consoles, returns their names.
    fn unbind_vtconsoles(&self) -> io::Result<Vec<String>>;
    fn bind_vtconsoles(&self) -> io::Result<Vec<String>>;
    /// Returns whether the EFI framebuffer was bound.
    fn unbind_efifb(&self) -> io::Result<bool>;
    fn bind_efifb(&self) -> io::Result<bool>;
}

pub struct SysfsConsole {
    root: PathBuf,
}

impl SysfsConsole {
    pub fn new<P: Into<PathBuf>>(root: P) -> SysfsConsole {
        SysfsConsole { root: root.into() }
    }

    /// `vtcon*` entries whose name says they sit on a frame buffer.
    fn framebuffer_consoles(&self) -> io::Result<Vec<(String, PathBuf)>> {
        let entries = match fs::read_dir(self.root.join(VTCONSOLES)) {
            Ok(entries) => entries,
            Err(ref e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut consoles = Vec::new();
        for entry in entries {
            let entry = entry?;
            let vtcon = entry.file_name().to_string_lossy().into_owned();
            if !vtcon.starts_with("vtcon") {
                continue;
            }
            let name = fs::read_to_string(entry.path().join("name")).unwrap_or_default();
            if name.contains("frame buffer") {
                consoles.push((vtcon, entry.path().join("bind")));
            }
        }
        consoles.sort();
        Ok(consoles)
    }

    fn set_vtconsoles(&self, bind: &str) -> io::Result<Vec<String>> {
        let mut changed = Vec::new();
        for (vtcon, attr) in self.framebuffer_consoles()? {
            sysfs_write(&attr, bind)?;
            changed.push(vtcon);
        }
        Ok(changed)
    }
}

impl ConsoleControl for SysfsConsole {
    fn unbind_vtconsoles(&self) -> io::Result<Vec<String>> {
        self.set_vtconsoles("0")
    }

    fn bind_vtconsoles(&self) -> io::Result<Vec<String>> {
        self.set_vtconsoles("1")
    }

    fn unbind_efifb(&self) -> io::Result<bool> {
        let driver = self.root.join(EFIFB_DRIVER);
        if !driver.join(EFIFB_DEVICE).exists() {
            return Ok(false);
        }
        sysfs_write(&driver.join("unbind"), EFIFB_DEVICE)?;
        Ok(true)
    }

    fn bind_efifb(&self) -> io::Result<bool> {
        let driver = self.root.join(EFIFB_DRIVER);
        if !driver.exists() || driver.join(EFIFB_DEVICE).exists() {
            return Ok(false);
        }
        sysfs_write(&driver.join("bind"), EFIFB_DEVICE)?;
        Ok(true)
    }
}
