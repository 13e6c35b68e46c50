/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fs::OpenOptions, path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    cli::status,
    repair::{self, Region},
};

pub fn repair_main(cli: &RepairCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cli.input)
        .with_context(|| format!("Failed to open file: {:?}", cli.input))?;

    let report = repair::repair(&mut file, cancel_signal)
        .with_context(|| format!("Failed to repair: {:?}", cli.input))?;

    match report.repaired_region {
        Some(Region::Parity) => status!("Repaired the parity data"),
        Some(Region::Stripe(index)) => status!("Repaired stripe #{}", index + 1),
        None => {}
    }
    for (copy, index) in &report.markers_rewritten {
        status!("Rewrote marker copy {copy} block {index} from its sibling");
    }
    if !report.changes_made() {
        status!("No changes made");
    }

    file.sync_all()
        .with_context(|| format!("Failed to sync file: {:?}", cli.input))?;

    Ok(())
}

/// Repair a protected disk image using its parity data.
///
/// A single corrupt region (one stripe or the parity itself) is
/// reconstructed in place; a corrupt marker block is restored from the
/// intact sibling copy.
#[derive(Debug, Parser)]
#[command(version)]
pub struct RepairCli {
    /// Device or image file to repair in place.
    #[arg(value_name = "FILE")]
    input: PathBuf,
}
