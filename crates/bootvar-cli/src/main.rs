#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use bootvar_store::{BootStore, OpenOptions, StoreConfig};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;

/// Exit status of `check-status` once the failure threshold is reached,
/// signaling the caller to rotate boot slots.
const EXIT_BOOT_FAILURE_LIMIT: i32 = 77;

const DEFAULT_MAX_BOOT_FAILURES: u8 = 3;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "bootvar", version, about = "Boot variable store tool")]
struct Cli {
    /// Storage device to use instead of the built-in candidates.
    #[arg(long, global = true)]
    device: Option<PathBuf>,
    /// Runtime directory for the session lockfile.
    #[arg(long, global = true)]
    lock_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the on-device store.
    Init {
        /// Re-initialize even if a valid store is present.
        #[arg(long)]
        force: bool,
    },
    /// Show the store header: version, boot state, geometry.
    Show {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Record a successful boot and reset the failure counter.
    BootSuccess,
    /// Record a boot attempt and check it against the failure limit.
    ///
    /// Exits 77 once the limit is reached, after re-arming the check for
    /// the boot that follows the slot switch.
    CheckStatus {
        /// Failure count at which to signal a boot slot switch.
        #[arg(long, default_value_t = DEFAULT_MAX_BOOT_FAILURES)]
        max_failures: u8,
    },
    /// Print one variable, or all variables when NAME is omitted.
    Get {
        name: Option<String>,
        /// Print bare values without `name=`.
        #[arg(long)]
        omit_name: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Set a variable; an empty or missing value deletes it.
    ///
    /// The value may be given as a second argument, folded into the name
    /// as `name=value`, or read from a file.
    Set {
        name: String,
        value: Option<String>,
        /// Read the value from FILE; `-` reads standard input.
        #[arg(long, value_name = "FILE")]
        from_file: Option<PathBuf>,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ShowOutput {
    devinfo_version: u16,
    boot_in_progress: bool,
    failed_boots: u8,
    extension_sectors: u16,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(cli.device, cli.lock_dir);

    match cli.command {
        Command::Init { force } => init(&config, force),
        Command::Show { json } => show(&config, json),
        Command::BootSuccess => boot_success(&config),
        Command::CheckStatus { max_failures } => check_status(&config, max_failures),
        Command::Get {
            name,
            omit_name,
            json,
        } => get(&config, name.as_deref(), omit_name, json),
        Command::Set {
            name,
            value,
            from_file,
        } => set(&config, &name, value.as_deref(), from_file.as_deref()),
    }
}

fn build_config(device: Option<PathBuf>, lock_dir: Option<PathBuf>) -> StoreConfig {
    let mut config = StoreConfig::default();
    if let Some(device) = device {
        config.device_candidates = vec![device];
    }
    if let Some(lock_dir) = lock_dir {
        config.lock_dir = lock_dir;
    }
    config
}

fn init(config: &StoreConfig, force: bool) -> Result<()> {
    let opts = OpenOptions {
        read_only: false,
        force_init: force,
    };
    let store = BootStore::open(config, opts).context("failed to initialize boot variable store")?;
    store.close();
    Ok(())
}

fn show(config: &StoreConfig, json: bool) -> Result<()> {
    let store = BootStore::open(config, OpenOptions::read_only())
        .context("failed to open boot variable store")?;
    let output = ShowOutput {
        devinfo_version: store.devinfo_version(),
        boot_in_progress: store.is_in_progress(),
        failed_boots: store.failed_boot_count(),
        extension_sectors: store.extension_sectors(),
    };
    store.close();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        let sectors = output.extension_sectors;
        println!("devinfo version:  {}", output.devinfo_version);
        println!(
            "boot in progress: {}",
            if output.boot_in_progress { "YES" } else { "NO" }
        );
        println!("failed boots:     {}", output.failed_boots);
        println!(
            "extension space:  {} sector{}",
            sectors,
            if sectors == 1 { "" } else { "s" }
        );
    }
    Ok(())
}

fn boot_success(config: &StoreConfig) -> Result<()> {
    let mut store = BootStore::open(config, OpenOptions::default())
        .context("failed to open boot variable store")?;
    let failed = store
        .mark_successful()
        .context("failed to record successful boot")?;
    store.close();
    eprintln!("Failed boot count: {failed}");
    Ok(())
}

fn check_status(config: &StoreConfig, max_failures: u8) -> Result<()> {
    let mut store = BootStore::open(config, OpenOptions::default())
        .context("failed to open boot variable store")?;
    let failed = store
        .mark_in_progress()
        .context("failed to record boot attempt")?;
    if failed >= max_failures {
        eprintln!("Too many boot failures, exit with error to signal boot slot switch");
        // Clear the in-progress state so the first boot after the slot
        // switch starts a fresh count.
        store
            .mark_successful()
            .context("failed to re-arm boot check")?;
        store.close();
        std::process::exit(EXIT_BOOT_FAILURE_LIMIT);
    }
    store.close();
    Ok(())
}

fn get(config: &StoreConfig, name: Option<&str>, omit_name: bool, json: bool) -> Result<()> {
    let store = BootStore::open(config, OpenOptions::read_only())
        .context("failed to open boot variable store")?;

    if json {
        let mut map = serde_json::Map::new();
        match name {
            Some(name) => {
                let value = store.get(name)?;
                map.insert(name.to_owned(), value.into());
            }
            None => {
                for (name, value) in store.vars() {
                    map.insert(name.to_owned(), value.into());
                }
            }
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::Value::Object(map))
                .context("serialize variables")?
        );
        return Ok(());
    }

    match name {
        Some(name) => {
            let value = store.get(name)?;
            if omit_name {
                println!("{value}");
            } else {
                println!("{name}={value}");
            }
        }
        None => {
            for (name, value) in store.vars() {
                println!("{name}={value}");
            }
        }
    }
    Ok(())
}

fn set(
    config: &StoreConfig,
    name: &str,
    value: Option<&str>,
    from_file: Option<&std::path::Path>,
) -> Result<()> {
    let file_value;
    let mut value = value;

    if let Some(path) = from_file {
        if value.is_some() || name.contains('=') {
            bail!("cannot specify both a value and an input file");
        }
        let bytes = if path == std::path::Path::new("-") {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("error reading input")?;
            buf
        } else {
            std::fs::read(path).with_context(|| format!("error reading {}", path.display()))?
        };
        file_value = String::from_utf8(bytes)
            .ok()
            .filter(|s| !s.contains('\0'))
            .context("input value must be text without null characters")?;
        value = Some(file_value.as_str());
    }

    // Allow `name=value` as a single argument, and `name=` to delete.
    let (name, value) = match value {
        Some(value) => (name, value),
        None => match name.split_once('=') {
            Some(("", _)) => bail!("invalid variable name"),
            Some((name, value)) => (name, value),
            None => (name, ""),
        },
    };

    let mut store = BootStore::open(config, OpenOptions::default())
        .context("failed to open boot variable store")?;
    store
        .set(name, value)
        .with_context(|| format!("failed to set {name}"))?;
    store.update().context("failed to persist variables")?;
    store.close();
    Ok(())
}
