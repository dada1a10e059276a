use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

pub fn parse_hex(s: &str) -> Option<u32> {
    let s = s.trim();
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(digits, 16).ok()
}

/// Writes `content` into a sysfs attribute without creating or truncating it.
pub fn sysfs_write(path: &Path, content: &str) -> io::Result<()> {
    debug!("writing {:?} into {}", content, path.display());
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(content.as_bytes())
}
