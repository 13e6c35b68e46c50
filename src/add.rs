/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! The parity-add operation: policy checks, optional zero padding, layout
//! computation, and the build-and-append of the parity tail. Always emits
//! the current (v2) format.

use std::{
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::debug;

use crate::{
    format::{
        layout::{self, Layout},
        marker,
        parity,
    },
    stream::WriteZerosExt,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image size is not a multiple of the block size (pass --pad to pad with zeros)")]
    NotBlockMultiple,
    #[error("Final size must be a multiple of the block size")]
    FinalSizeNotBlockMultiple,
    #[error("Parity data already present (pass --force to add another layer)")]
    AlreadyProtected,
    #[error("Stripping existing parity is not implemented")]
    StripNotImplemented,
    #[error("Layout error")]
    Layout(#[from] layout::Error),
    #[error("Marker error")]
    Marker(#[from] marker::Error),
    #[error("Parity error")]
    Parity(#[from] parity::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug)]
pub struct AddOptions {
    /// Target combined size in bytes; zero means "guess from standard media
    /// sizes". Must be a multiple of the block size.
    pub final_bytes: u64,
    pub block_bytes: u64,
    /// Pad a non-block-multiple image with zeros instead of failing.
    pub pad: bool,
    /// Add another parity layer on top of existing parity.
    pub force: bool,
    /// Strip existing parity first (not implemented, kept for compatibility).
    pub strip: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            final_bytes: 0,
            block_bytes: 2048,
            pad: false,
            force: false,
            strip: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AddSummary {
    pub layout: Layout,
    /// Zero bytes appended to reach a block boundary.
    pub padded_bytes: u64,
    /// An existing parity layer was detected and another one added.
    pub forced: bool,
}

/// Add parity to an image in place. `date_time` (nanoseconds since the
/// epoch) is recorded in the marker and keys every digest; it is a parameter
/// so callers and tests produce reproducible artifacts. The caller should
/// make the file durable afterwards; the format is only self-consistent once
/// the second marker copy is written.
pub fn add_parity<F: Read + Write + Seek>(
    file: &mut F,
    options: &AddOptions,
    date_time: u64,
    cancel_signal: &AtomicBool,
) -> Result<AddSummary> {
    if options.block_bytes < marker::MIN_BLOCK_BYTES || !options.block_bytes.is_power_of_two() {
        return Err(layout::Error::InvalidBlockSize(options.block_bytes).into());
    } else if options.final_bytes % options.block_bytes != 0 {
        return Err(Error::FinalSizeNotBlockMultiple);
    }

    let file_size = file.seek(SeekFrom::End(0))?;

    let mut padded_bytes = 0;
    if file_size % options.block_bytes != 0 {
        if !options.pad {
            return Err(Error::NotBlockMultiple);
        }

        padded_bytes = options.block_bytes - file_size % options.block_bytes;
        debug!(padded_bytes, "Padding image to a block boundary");
        file.write_zeros_exact(padded_bytes)?;
    }

    let image_bytes = file_size + padded_bytes;
    let image_blocks = image_bytes / options.block_bytes;

    // An existing layer means the image was already protected; with --force
    // the whole artifact, previous parity included, becomes the new image.
    let forced = match marker::scan_file_tail(file, cancel_signal)? {
        Some(_) if options.strip => return Err(Error::StripNotImplemented),
        Some(_) if !options.force => return Err(Error::AlreadyProtected),
        Some(_) => true,
        None => false,
    };

    let layout = Layout::compute(
        image_blocks,
        options.final_bytes / options.block_bytes,
        options.block_bytes,
    )?;

    file.seek(SeekFrom::Start(0))?;
    let set = {
        let reader = BufReader::with_capacity(1 << 20, &mut *file);
        parity::build(reader, &layout, date_time, cancel_signal)?
    };

    file.seek(SeekFrom::Start(image_bytes))?;
    parity::append(&mut *file, &set, cancel_signal)?;
    file.flush()?;

    Ok(AddSummary {
        layout,
        padded_bytes,
        forced,
    })
}
