/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::{File, OpenOptions},
    path::PathBuf,
    sync::atomic::AtomicBool,
};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::{
    cli::{status, warning},
    rescue,
};

pub fn rescue_main(cli: &RescueCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut source = File::open(&cli.source)
        .with_context(|| format!("Failed to open source: {:?}", cli.source))?;
    let mut dest = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.output)
        .with_context(|| format!("Failed to create output: {:?}", cli.output))?;

    let report = rescue::rescue(&mut source, &mut dest, cancel_signal)
        .with_context(|| format!("Failed to rescue: {:?}", cli.source))?;

    dest.sync_all()
        .with_context(|| format!("Failed to sync output: {:?}", cli.output))?;

    status!(
        "Recovered {}/{} image blocks",
        report.blocks_recovered,
        report.image_blocks,
    );
    if report.residual_errors > 0 {
        warning!(
            "Parity residual has {} non-zero bytes (undetected corruption)",
            report.residual_errors,
        );
    }
    if report.blocks_missing > 0 {
        bail!("{} blocks could not be recovered", report.blocks_missing);
    }

    Ok(())
}

/// Rescue a damaged protected device onto a fresh output image.
///
/// Blocks that cannot be read from the source are reconstructed from the
/// parity where possible; the output is written as zeros where recovery
/// fails entirely.
#[derive(Debug, Parser)]
#[command(version)]
pub struct RescueCli {
    /// Source device or image with read errors.
    #[arg(value_name = "SOURCE")]
    source: PathBuf,

    /// Output image file to create.
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,
}
