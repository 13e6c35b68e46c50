/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fs::File, path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    cli::status,
    verify::{self, Generation},
};

pub fn verify_main(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut file = File::open(&cli.input)
        .with_context(|| format!("Failed to open file: {:?}", cli.input))?;

    let info = verify::verify(&mut file, cancel_signal)
        .with_context(|| format!("Failed to verify: {:?}", cli.input))?;

    let generation = match info.generation {
        Generation::V1 => "v1",
        Generation::V2 => "v2",
    };

    status!(
        "Valid parity ({generation}): {} image blocks in {} stripes of {} blocks ({} bytes each)",
        info.image_blocks,
        info.num_stripes,
        info.stripe_blocks,
        info.block_bytes,
    );

    Ok(())
}

/// Verify the parity of a protected disk image or device.
#[derive(Debug, Parser)]
#[command(version)]
pub struct VerifyCli {
    /// Device or image file to verify.
    #[arg(value_name = "FILE")]
    input: PathBuf,
}
