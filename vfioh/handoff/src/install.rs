//! libvirt hook installation.

use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub const HOOKS_DIR: &str = "/etc/libvirt/hooks";

const RELEASE_SCRIPT: &str = "vfioh-release.sh";
const RECLAIM_SCRIPT: &str = "vfioh-reclaim.sh";

const QEMU_DISPATCHER: &str = r#"#!/bin/sh
# runs every executable in qemu.d/<guest>/<operation>/<sub-operation>/ with the hook arguments
HOOKPATH="$(dirname "$0")/qemu.d/$1/$2/$3"
[ -d "$HOOKPATH" ] || exit 0
for hook in "$HOOKPATH"/*; do
    if [ -f "$hook" ] && [ -x "$hook" ]; then
        "$hook" "$@" || exit $?
    fi
done
"#;

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

fn check_vm_name(vm: &str) -> Result<()> {
    if vm.is_empty() || vm == "." || vm == ".." || vm.contains('/') || vm.chars().any(char::is_control) {
        bail!("'{}' is not a usable VM name", vm);
    }
    Ok(())
}

fn write_script(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    fs::set_permissions(path, Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to make {} executable", path.display()))
}

/// Installs the hooks that run `binary` when `vm` is prepared and released.
/// Returns the files written. An existing `qemu` hook is left alone.
pub fn install(hooks_dir: &Path, vm: &str, binary: &Path, config: &Path) -> Result<Vec<PathBuf>> {
    check_vm_name(vm)?;
    let mut written = Vec::new();

    let dispatcher = hooks_dir.join("qemu");
    if dispatcher.exists() {
        let existing = fs::read_to_string(&dispatcher).unwrap_or_default();
        if !existing.contains("qemu.d") {
            warn!("{} exists but does not look like it runs qemu.d hooks, the GPU hooks may never run",
                  dispatcher.display());
        }
    } else {
        write_script(&dispatcher, QEMU_DISPATCHER)?;
        written.push(dispatcher);
    }

    let command = format!("exec {} --config {} hook \"$1\" \"$2\" \"$3\" \"$4\"\n",
                          shell_quote(binary), shell_quote(config));
    let vm_dir = hooks_dir.join("qemu.d").join(vm);
    for (phase, script) in [("prepare/begin", RELEASE_SCRIPT), ("release/end", RECLAIM_SCRIPT)] {
        let path = vm_dir.join(phase).join(script);
        write_script(&path, &format!("#!/bin/sh\n{}", command))?;
        written.push(path);
    }

    for path in &written {
        info!("installed {}", path.display());
    }
    Ok(written)
}
