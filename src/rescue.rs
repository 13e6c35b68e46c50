/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Streaming rescue of a damaged v1 source onto a freshly created output.
//!
//! A column (one block offset within a stripe) together with the parity row
//! forms an XOR set of `num_stripes + 1` members: any single missing member
//! can be reconstructed from the others. The rescuer tracks which members of
//! each column have been read in a 2D bitmap whose extra row is the parity,
//! sweeps the source with large reads first, and then iterates block-level
//! retries and reconstructions until it stops making progress.

use std::{
    io::{self, Read, Seek, SeekFrom, Write},
    sync::atomic::AtomicBool,
};

use num_traits::ToPrimitive;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    format::marker::{self, MarkerV1},
    stream::{self, WriteZerosExt},
    util::{count_nonzero, memxor},
};

/// Blocks checked by the fixed look-back marker search, in units of
/// [`LOOK_BACK_BYTES`].
const LOOK_BACK_BLOCKS: u64 = 1024;
const LOOK_BACK_BYTES: u64 = 2048;

/// Default size of the large sequential read buffer.
const SWEEP_BUF_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Marker not found")]
    MarkerNotFound,
    #[error("Marker error")]
    Marker(#[from] marker::Error),
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Outcome of a rescue run. The output image is complete iff
/// `blocks_missing` is zero; a non-zero `residual_errors` means the
/// recovered data is internally inconsistent (undetected source corruption).
#[derive(Clone, Copy, Debug)]
pub struct RescueReport {
    pub image_blocks: u64,
    pub blocks_recovered: u64,
    pub blocks_missing: u64,
    pub residual_errors: u64,
}

/// A bitmap with one row per stripe plus a parity row, one column per block
/// offset within a stripe.
struct BitMap2d {
    cols: usize,
    per_row: usize,
    bits: Vec<u64>,
}

impl BitMap2d {
    fn new(rows: usize, cols: usize) -> Self {
        let per_row = cols.div_ceil(64);
        Self {
            cols,
            per_row,
            bits: vec![0; rows * per_row],
        }
    }

    fn test(&self, row: usize, col: usize) -> bool {
        debug_assert!(col < self.cols);
        self.bits[row * self.per_row + col / 64] >> (col % 64) & 1 != 0
    }

    fn set(&mut self, row: usize, col: usize) {
        debug_assert!(col < self.cols);
        self.bits[row * self.per_row + col / 64] |= 1 << (col % 64);
    }
}

/// Seek and read, treating any failure as "these blocks are unreadable".
fn try_read_at<R: Read + Seek>(reader: &mut R, offset: u64, buf: &mut [u8]) -> bool {
    match reader.seek(SeekFrom::Start(offset)) {
        Ok(pos) if pos == offset => {}
        _ => return false,
    }

    reader.read_exact(buf).is_ok()
}

/// Locate a v1 marker near the end of the source with the fixed look-back
/// used for damaged media: one [`LOOK_BACK_BYTES`] window at a time, up to
/// [`LOOK_BACK_BLOCKS`] windows back. Read failures skip the window.
fn find_marker<R: Read + Seek>(
    reader: &mut R,
    cancel_signal: &AtomicBool,
) -> Result<MarkerV1> {
    let file_size = reader.seek(SeekFrom::End(0))?;
    let mut buf = vec![0u8; LOOK_BACK_BYTES as usize];

    for j in 1..=LOOK_BACK_BLOCKS {
        stream::check_cancel(cancel_signal)?;

        let Some(offset) = file_size.checked_sub(j * LOOK_BACK_BYTES) else {
            break;
        };
        if !try_read_at(reader, offset, &mut buf) {
            continue;
        }

        if let Some((_, m)) = marker::find_marker_v1(&buf) {
            m.validate()?;
            return Ok(m);
        }
    }

    Err(Error::MarkerNotFound)
}

/// The parity column fed by a given parity-region block. The on-disk parity
/// starts with the buffer's trailing `stripe_offset` blocks.
fn parity_col(m: &MarkerV1, block_num: u64) -> usize {
    ((block_num - m.image_blocks - 1 + m.stripe_blocks - m.stripe_offset) % m.stripe_blocks)
        as usize
}

/// Rescue a damaged v1 source into `dest`, which must be a freshly created,
/// writable, seekable output. Source read errors are recovery events, not
/// failures; output errors are always fatal.
pub fn rescue<R: Read + Seek, W: Write + Seek>(
    source: &mut R,
    dest: &mut W,
    cancel_signal: &AtomicBool,
) -> Result<RescueReport> {
    let m = find_marker(source, cancel_signal)?;

    let block_bytes = m
        .block_bytes
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("block_bytes"))?;
    let stripe_bytes = (m.stripe_blocks * m.block_bytes)
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("stripe_bytes"))?;
    let num_stripes = m.num_stripes as usize;
    let stripe_blocks = m.stripe_blocks as usize;

    // Combined image + marker + parity span, excluding the trailing marker.
    let total_blocks = m.image_blocks + m.stripe_blocks + 1;

    debug!(?m, "Rescuing v1 artifact");

    // XOR accumulator: one stripe's worth of columns.
    let mut acc = vec![0u8; stripe_bytes];
    let mut scratch = vec![0u8; block_bytes];

    // Large sweep buffer, shrunk until it holds no more than one stripe.
    let mut buf_bytes = SWEEP_BUF_BYTES.max(m.block_bytes);
    let mut blocks_per_buf = buf_bytes / m.block_bytes;
    while blocks_per_buf > m.stripe_blocks {
        blocks_per_buf /= 2;
        buf_bytes /= 2;
    }
    let mut buf = vec![
        0u8;
        buf_bytes
            .to_usize()
            .ok_or(Error::FieldOutOfBounds("buf_bytes"))?
    ];

    let mut seen = BitMap2d::new(num_stripes + 1, stripe_blocks);

    // Columns past the short last stripe have no member in the last row.
    for col in m.last_blocks() as usize..stripe_blocks {
        seen.set(num_stripes - 1, col);
    }

    let mut blocks_found = 0u64;
    let mut blocks_written = 0u64;

    // Pass A: sequential sweep in large buffers. A failed read leaves the
    // whole buffer's bitmap entries clear for pass B.
    let full_bufs = total_blocks / blocks_per_buf;
    for buf_num in 0..full_bufs {
        stream::check_cancel(cancel_signal)?;

        if !try_read_at(source, buf_num * buf_bytes, &mut buf) {
            continue;
        }

        // Keep the output dense: zero placeholders for every skipped block.
        if buf_num * blocks_per_buf <= m.image_blocks {
            while blocks_written < buf_num * blocks_per_buf {
                dest.write_zeros_exact(m.block_bytes)?;
                blocks_written += 1;
            }
        }

        for i in 0..blocks_per_buf {
            let block_num = buf_num * blocks_per_buf + i;
            let block = &buf[i as usize * block_bytes..(i as usize + 1) * block_bytes];

            if block_num < m.image_blocks {
                let stripe_num = (block_num / m.stripe_blocks) as usize;
                let col = (block_num % m.stripe_blocks) as usize;

                dest.write_all(block)?;
                blocks_written += 1;

                memxor(&mut acc[col * block_bytes..(col + 1) * block_bytes], block);
                seen.set(stripe_num, col);
                blocks_found += 1;
            } else if block_num > m.image_blocks {
                let col = parity_col(&m, block_num);
                seen.set(num_stripes, col);
                memxor(&mut acc[col * block_bytes..(col + 1) * block_bytes], block);
            }
            // block_num == image_blocks is the marker block.
        }
    }

    while blocks_written < m.image_blocks {
        dest.write_zeros_exact(m.block_bytes)?;
        blocks_written += 1;
    }

    // The sub-buffer remainder is entirely parity (the sweep buffer never
    // exceeds one stripe); retry it block by block.
    for block_num in full_bufs * blocks_per_buf..total_blocks {
        stream::check_cancel(cancel_signal)?;

        if !try_read_at(source, block_num * m.block_bytes, &mut scratch) {
            continue;
        }

        let col = parity_col(&m, block_num);
        seen.set(num_stripes, col);
        memxor(&mut acc[col * block_bytes..(col + 1) * block_bytes], &scratch);
    }

    // Pass B: reconstruct or re-read missing blocks until nothing improves.
    while blocks_found < m.image_blocks {
        let mut progressed = false;

        for block_num in 0..total_blocks {
            stream::check_cancel(cancel_signal)?;

            if block_num < m.image_blocks {
                let stripe_num = (block_num / m.stripe_blocks) as usize;
                let col = (block_num % m.stripe_blocks) as usize;
                if seen.test(stripe_num, col) {
                    continue;
                }

                // With every other member of the column known, the
                // accumulator holds the missing block.
                let rebuildable =
                    (0..=num_stripes).all(|r| r == stripe_num || seen.test(r, col));
                if rebuildable {
                    let region = &mut acc[col * block_bytes..(col + 1) * block_bytes];
                    dest.seek(SeekFrom::Start(block_num * m.block_bytes))?;
                    dest.write_all(region)?;
                    region.fill(0);
                    seen.set(stripe_num, col);
                    blocks_found += 1;
                    progressed = true;
                    continue;
                }
            } else if block_num > m.image_blocks {
                let col = parity_col(&m, block_num);
                if seen.test(num_stripes, col) {
                    continue;
                }

                // If every image member is known, the parity member is not
                // needed; folding the true parity in would zero the column.
                if (0..num_stripes).all(|r| seen.test(r, col)) {
                    acc[col * block_bytes..(col + 1) * block_bytes].fill(0);
                    seen.set(num_stripes, col);
                    progressed = true;
                    continue;
                }
            } else {
                // The leading marker block.
                continue;
            }

            if !try_read_at(source, block_num * m.block_bytes, &mut scratch) {
                continue;
            }

            if block_num < m.image_blocks {
                let stripe_num = (block_num / m.stripe_blocks) as usize;
                let col = (block_num % m.stripe_blocks) as usize;

                dest.seek(SeekFrom::Start(block_num * m.block_bytes))?;
                dest.write_all(&scratch)?;
                memxor(&mut acc[col * block_bytes..(col + 1) * block_bytes], &scratch);
                seen.set(stripe_num, col);
                blocks_found += 1;
            } else {
                let col = parity_col(&m, block_num);
                seen.set(num_stripes, col);
                memxor(&mut acc[col * block_bytes..(col + 1) * block_bytes], &scratch);
            }
            progressed = true;
        }

        if !progressed {
            break;
        }
    }

    let blocks_missing = m.image_blocks - blocks_found;
    if blocks_missing > 0 {
        warn!(blocks_missing, "Source has unrecoverable blocks");
    }

    let residual_errors = count_nonzero(&acc);
    if residual_errors > 0 {
        warn!(residual_errors, "Parity residual is not zero (image corrupt)");
    }

    Ok(RescueReport {
        image_blocks: m.image_blocks,
        blocks_recovered: blocks_found,
        blocks_missing,
        residual_errors,
    })
}
