#[macro_use]
extern crate log;

mod logger;

use std::env;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nix::unistd;

use common::config::Config;
use handoff::detect::{self, GpuGroup};
use handoff::diagnostics::Snapshot;
use handoff::dispatch::{Dispatcher, Phase};
use handoff::host::{System, SYSFS};
use handoff::install::{self, HOOKS_DIR};
use handoff::session;
use handoff::Outcome;

#[derive(Parser)]
#[command(version, about = "Hands a single GPU between the host desktop and a VM")]
struct Cli {
    #[arg(long, default_value = Config::DEFAULT_PATH)]
    config: PathBuf,
    /// Append log output to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Entry point for libvirt: <vm> <operation> [sub-operation] [extra]
    Hook {
        vm: String,
        phase: String,
        sub_phase: Option<String>,
        extra: Option<String>,
    },
    /// Give the GPU to the passthrough driver now
    Release,
    /// Give the GPU back to the host now
    Reclaim,
    /// Print the current module, driver and device holder state as JSON
    Status,
    /// List GPUs and the functions that would go with them
    Detect {
        /// Store the selected GPU group in the config
        #[arg(long)]
        write: bool,
        /// Index from the listing, needed when there is more than one candidate
        #[arg(long)]
        gpu: Option<usize>,
    },
    /// Install the libvirt hooks for a VM
    Install {
        vm: String,
        #[arg(long, default_value = HOOKS_DIR)]
        hooks_dir: PathBuf,
        /// The vfioh binary the hooks run, defaults to this one
        #[arg(long)]
        binary: Option<PathBuf>,
        /// Do not restart libvirtd afterwards
        #[arg(long)]
        no_restart: bool,
    },
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load_or_default(path).map_err(|e| handoff::Error::Configuration(format!("{:#}", e)).into())
}

fn report(outcome: Outcome) {
    match outcome {
        Outcome::Completed => info!("done"),
        Outcome::AlreadyInState => info!("nothing to do, the devices are already where they belong"),
        Outcome::Skipped => debug!("skipped"),
    }
}

fn select(groups: &[GpuGroup], index: Option<usize>) -> Result<&GpuGroup> {
    if let Some(index) = index {
        return groups.get(index).with_context(|| format!("There is no GPU [{}]", index));
    }
    // the boot GPU usually drives the host console
    let candidates: Vec<_> = groups.iter().filter(|group| !group.gpu.boot_vga).collect();
    match candidates.as_slice() {
        [only] => Ok(*only),
        [] => bail!("No GPU besides the boot GPU found, pick one with --gpu"),
        _ => bail!("More than one GPU found, pick one with --gpu"),
    }
}

fn detect(cli: &Cli, write: bool, index: Option<usize>) -> Result<()> {
    let groups = detect::detect(Path::new(SYSFS)).context("Failed to scan PCI devices")?;
    if groups.is_empty() {
        bail!("No display controller found");
    }
    for (i, group) in groups.iter().enumerate() {
        println!("[{}]\t{}", i, group);
    }
    if !write {
        return Ok(());
    }

    let group = select(&groups, index)?;
    let mut cfg = Config::load_or_default(&cli.config)?;
    cfg.devices = group.addresses();
    cfg.save(&cli.config)?;
    info!("stored {} devices in {}", cfg.devices.len(), cli.config.display());
    Ok(())
}

fn install(cli: &Cli, vm: &str, hooks_dir: &Path, binary: Option<&Path>, no_restart: bool) -> Result<()> {
    let binary = match binary {
        Some(binary) => binary.to_owned(),
        None => env::current_exe().context("Failed to find the vfioh binary")?,
    };
    install::install(hooks_dir, vm, &binary, &cli.config)?;

    let mut cfg = Config::load_or_default(&cli.config)?;
    if !cfg.manages(vm) {
        cfg.vms.push(vm.to_owned());
        cfg.save(&cli.config)?;
    }
    if cfg.devices.is_empty() {
        warn!("No passthrough devices configured yet, run `vfioh detect --write`");
    }

    if !no_restart {
        if let Err(e) = session::restart_service("libvirtd") {
            warn!("{:#}. Restart libvirtd yourself so it picks up the new hooks.", e);
        }
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    match cli.command {
        Command::Hook { ref vm, ref phase, ref sub_phase, ref extra } => {
            debug!("hook {} {} {:?} {:?}", vm, phase, sub_phase, extra);
            let cfg = load_config(&cli.config)?;
            let system = System::new(&cfg);
            report(Dispatcher::new(&cfg, system.host()).dispatch(vm, phase, sub_phase.as_deref())?);
        }
        Command::Release | Command::Reclaim => {
            let phase = if let Command::Release = cli.command { Phase::PreStart } else { Phase::PostStop };
            let cfg = load_config(&cli.config)?;
            let system = System::new(&cfg);
            report(Dispatcher::new(&cfg, system.host()).run_phase(None, phase)?);
        }
        Command::Status => {
            let cfg = load_config(&cli.config)?;
            let system = System::new(&cfg);
            println!("{}", Snapshot::collect(&system.host(), &cfg).to_json()?);
        }
        Command::Detect { write, gpu } => detect(cli, write, gpu)?,
        Command::Install { ref vm, ref hooks_dir, ref binary, no_restart } => {
            install(cli, vm, hooks_dir, binary.as_deref(), no_restart)?
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = logger::init(cli.log_file.as_deref()) {
        eprintln!("Error initializing the logger: {:#}", e);
    }

    if !unistd::geteuid().is_root() {
        warn!("Not running as root, most operations will fail");
    }

    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        let code = e.downcast_ref::<handoff::Error>().map_or(1, handoff::Error::exit_code);
        process::exit(code);
    }
}
