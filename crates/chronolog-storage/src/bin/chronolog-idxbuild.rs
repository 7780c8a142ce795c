//! chronolog-idxbuild
//!
//! Offline rebuild of archive indexes.
//!
//! ```bash
//! # Rebuild every registered property index of every device
//! chronolog-idxbuild ./history
//!
//! # One device, one property, one segment
//! chronolog-idxbuild ./history --device SA1/MOTOR/X --property position --segment 3
//! ```
//!
//! A missing `archive_index.txt` is recreated from the segments before any property
//! index is built. Set `RUST_LOG=debug` to see skipped lines.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chronolog_storage::segment::list_segments;
use chronolog_storage::{build_property_index, rebuild_segment_index, ArchiveLayout, PropertyRegistry};
use clap::Parser;

#[derive(Parser)]
#[command(name = "chronolog-idxbuild")]
#[command(about = "Rebuild chronolog archive indexes", long_about = None)]
struct Cli {
    /// Archive root directory
    directory: PathBuf,

    /// Only this device
    #[arg(short, long)]
    device: Option<String>,

    /// Only this property (default: every property in the registry)
    #[arg(short, long)]
    property: Option<String>,

    /// Only this segment (default: every segment on disk)
    #[arg(short, long)]
    segment: Option<u32>,
}

/// Device ids under `root`: every directory holding `raw/archive.last`.
fn find_devices(root: &Path, layout: &ArchiveLayout) -> Result<Vec<String>> {
    let mut devices = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let device = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if layout.last_segment(&device).exists() {
                devices.push(device);
            } else if !matches!(path.file_name().and_then(|n| n.to_str()), Some("raw" | "idx")) {
                pending.push(path);
            }
        }
    }
    devices.sort();
    Ok(devices)
}

fn rebuild_device(layout: &ArchiveLayout, device: &str, cli: &Cli) -> Result<usize> {
    if !layout.segment_index(device).exists() {
        let entries = rebuild_segment_index(layout, device)
            .with_context(|| format!("rebuilding segment index of {}", device))?;
        tracing::info!(device = %device, entries = entries, "Segment index recreated");
    }

    let properties = match &cli.property {
        Some(property) => vec![property.clone()],
        None => PropertyRegistry::open(layout.registry(device))?.properties().to_vec(),
    };
    let segments = match cli.segment {
        Some(segment) => vec![segment],
        None => list_segments(layout, device)?,
    };

    let mut built = 0;
    for property in &properties {
        for &segment in &segments {
            match build_property_index(layout, device, property, segment) {
                Ok(_) => built += 1,
                Err(e) => tracing::error!(
                    device = %device,
                    property = %property,
                    segment = segment,
                    error = %e,
                    "Index build failed"
                ),
            }
        }
    }
    Ok(built)
}

/// Rebuilds every device, logging failures and carrying on with the rest.
/// Returns the number of indexes built and of devices that failed.
fn rebuild_devices(layout: &ArchiveLayout, devices: &[String], cli: &Cli) -> (usize, usize) {
    let mut built = 0;
    let mut failed = 0;
    for device in devices {
        match rebuild_device(layout, device, cli) {
            Ok(count) => built += count,
            Err(e) => {
                failed += 1;
                tracing::error!(device = %device, error = %format!("{:#}", e), "Device rebuild failed");
            }
        }
    }
    (built, failed)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if !cli.directory.is_dir() {
        bail!("archive directory {} does not exist", cli.directory.display());
    }
    let layout = ArchiveLayout::new(&cli.directory);

    let devices = match &cli.device {
        Some(device) => vec![device.clone()],
        None => find_devices(&cli.directory, &layout)?,
    };
    tracing::info!(devices = devices.len(), "Rebuilding indexes");

    let (built, failed) = rebuild_devices(&layout, &devices, &cli);
    tracing::info!(
        devices = devices.len(),
        failed = failed,
        indexes = built,
        "Rebuild finished"
    );
    Ok(())
}
