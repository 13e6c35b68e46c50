/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    add::{add_parity, AddOptions},
    cli::{parse_size, status},
};

fn process_file(path: &Path, options: &AddOptions, cancel_signal: &AtomicBool) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open file: {path:?}"))?;

    let date_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("Current time is before the epoch")?
        .as_nanos() as u64;

    let summary = add_parity(&mut file, options, date_time, cancel_signal)
        .with_context(|| format!("Failed to add parity: {path:?}"))?;

    if summary.padded_bytes > 0 {
        status!("Padded image with {} zero bytes", summary.padded_bytes);
    }
    if summary.forced {
        status!("Existing parity found; adding another layer");
    }

    let layout = summary.layout;
    if layout.num_stripes > 1 {
        status!(
            "Divided {} image blocks into {} stripes of {} blocks (first stripe {})",
            layout.image_blocks,
            layout.num_stripes,
            layout.stripe_blocks,
            layout.first_blocks,
        );
    } else {
        status!("Image is 1 stripe of {} blocks", layout.stripe_blocks);
    }

    file.sync_all()
        .with_context(|| format!("Failed to sync file: {path:?}"))?;

    Ok(())
}

pub fn add_main(cli: &AddCli, cancel_signal: &AtomicBool) -> Result<()> {
    if cli.buffer_size.is_some() {
        status!("Custom buffer size ignored (not implemented)");
    }

    let options = AddOptions {
        final_bytes: cli.size,
        block_bytes: cli.block_size,
        pad: cli.pad,
        force: cli.force,
        strip: cli.strip,
    };

    for path in &cli.inputs {
        status!("Processing file: {path:?}");
        process_file(path, &options, cancel_signal)?;
    }

    Ok(())
}

/// Append parity and marker blocks to disk images.
///
/// The combined artifact (image, marker, parity, marker) fits the chosen
/// final size so it can be burned to standard media.
#[derive(Debug, Parser)]
#[command(version)]
pub struct AddCli {
    /// Final size of image plus parity (default: guess standard media size).
    #[arg(short = 's', long, value_name = "SIZE", value_parser = parse_size, default_value = "0")]
    size: u64,

    /// Block size in bytes (power of two, minimum 64).
    #[arg(short = 'b', long, value_name = "SIZE", value_parser = parse_size, default_value = "2k")]
    block_size: u64,

    /// I/O buffer size hint (accepted for compatibility and ignored).
    #[arg(short = 'B', long, value_name = "SIZE", value_parser = parse_size)]
    buffer_size: Option<u64>,

    /// Pad the image with zeros to a block boundary.
    #[arg(short, long)]
    pad: bool,

    /// Force adding another parity layer over existing parity.
    #[arg(short, long)]
    force: bool,

    /// Strip existing parity before starting.
    #[arg(short = 'S', long)]
    strip: bool,

    /// Image files to protect.
    #[arg(value_name = "FILE", required = true)]
    inputs: Vec<PathBuf>,
}
