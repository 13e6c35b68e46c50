/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Single-region repair of a v2 artifact. Unlike verification, every check
//! records its outcome instead of aborting, and the residual XOR accumulator
//! is then used to reconstruct the one corrupt region in place. A marker
//! block that is corrupt in one copy is rewritten from its intact sibling.

use std::{
    hash::Hasher,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::atomic::AtomicBool,
};

use num_traits::ToPrimitive;
use siphasher::sip::SipHasher24;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    format::marker::{self, MarkerV2, ScannedKind},
    stream::{self, ReadFillExt, ReadFixedSizeExt},
    util::{is_zero, memxor},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Marker not found")]
    MarkerNotFound,
    #[error("Legacy (v1) parity cannot be repaired")]
    LegacyMarker,
    #[error("Marker block {index} is corrupt in both copies")]
    MarkerBlockUnrecoverable { index: u32 },
    #[error("Marker copies disagree in block {index}")]
    MarkerBlockMismatch { index: u32 },
    #[error("Stored markers do not match the scanned marker")]
    MarkerScanMismatch,
    #[error("Cannot determine the location of the error")]
    CannotLocate,
    #[error("Too many errors")]
    TooManyErrors,
    #[error("Repaired data failed its hash check")]
    RepairMismatch,
    #[error("Marker error")]
    Marker(#[from] marker::Error),
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The region reconstructed by a successful repair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    /// The parity buffer itself.
    Parity,
    /// An image stripe (ordinal 0 is the short first stripe).
    Stripe(u32),
}

#[derive(Clone, Debug, Default)]
pub struct RepairReport {
    pub repaired_region: Option<Region>,
    /// Marker blocks rewritten from the sibling copy, as (copy, block index)
    /// pairs where copy 1 is the leading copy.
    pub markers_rewritten: Vec<(u8, u32)>,
}

impl RepairReport {
    pub fn changes_made(&self) -> bool {
        self.repaired_region.is_some() || !self.markers_rewritten.is_empty()
    }
}

/// Re-read a region, apply the residual as a correction, check the digest,
/// and rewrite the region in place. Short reads are tolerated (the corrupt
/// region may extend past a truncated end of the file); everything else is
/// fatal.
fn repair_region<F: Read + Write + Seek>(
    file: &mut F,
    offset: u64,
    diff: &[u8],
    mut hasher: SipHasher24,
    expected_hash: u64,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    stream::check_cancel(cancel_signal)?;

    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; diff.len()];
    file.read_fill(&mut buf)?;

    memxor(&mut buf, diff);

    hasher.write(&buf);
    if hasher.finish() != expected_hash {
        return Err(Error::RepairMismatch);
    }

    file.seek(SeekFrom::Start(offset))?;
    stream::write_all_chunked(&mut *file, &buf, cancel_signal)?;

    Ok(())
}

/// Attempt to repair a v2 artifact in place. At most one corrupt region
/// (a stripe or the parity buffer) can be reconstructed; marker blocks are
/// additionally healed from their sibling copy where possible.
pub fn repair<F: Read + Write + Seek>(
    file: &mut F,
    cancel_signal: &AtomicBool,
) -> Result<RepairReport> {
    let scanned = marker::scan_file_tail(file, cancel_signal)?.ok_or(Error::MarkerNotFound)?;

    let (header, scanned_block) = match scanned.kind {
        ScannedKind::V2 { header, block } => (header, block),
        ScannedKind::V1 { .. } => return Err(Error::LegacyMarker),
    };

    let block_bytes = header
        .block_bytes()
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("block_bytes"))?;
    let marker_bytes = header
        .marker_bytes()
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("marker_bytes"))?;
    let stripe_bytes = (u64::from(header.stripe_blocks) * header.block_bytes())
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("stripe_bytes"))?;
    let first_bytes = (u64::from(header.first_blocks) * header.block_bytes()) as usize;
    let first_offset_bytes = stripe_bytes - first_bytes;
    let image_bytes = u64::from(header.image_blocks) * header.block_bytes();

    let leading_offset = image_bytes;
    let parity_offset = image_bytes + header.marker_bytes();
    let trailing_offset = parity_offset + stripe_bytes as u64;

    debug!(?header, "Repairing v2 artifact");

    // Read both marker copies. The leading copy must be readable in full;
    // the trailing copy may be truncated (its blocks then simply fail their
    // checksums and are restored from the leading copy).
    file.seek(SeekFrom::Start(leading_offset))?;
    let mut merged = file.read_vec_exact(marker_bytes)?;

    file.seek(SeekFrom::Start(trailing_offset))?;
    let mut trailing = vec![0u8; marker_bytes];
    let n = file.read_fill(&mut trailing)?;
    if n < marker_bytes {
        warn!("Trailing marker copy is truncated");
    }

    let mut report = RepairReport::default();

    for i in 0..header.marker_blocks() as usize {
        let range = i * block_bytes..(i + 1) * block_bytes;
        let index = i as u32;

        let leading_good = marker::v2_block_swapped(&merged[range.clone()])
            .is_some_and(|sw| marker::block_checksum_ok(&merged[range.clone()], sw, i == 0));
        let trailing_good = marker::v2_block_swapped(&trailing[range.clone()])
            .is_some_and(|sw| marker::block_checksum_ok(&trailing[range.clone()], sw, i == 0));

        match (leading_good, trailing_good) {
            (false, false) => return Err(Error::MarkerBlockUnrecoverable { index }),
            (true, false) => {
                warn!(index, "Marker copy 2 block is corrupt");
                report.markers_rewritten.push((2, index));
            }
            (false, true) => {
                warn!(index, "Marker copy 1 block is corrupt");
                merged[range.clone()].copy_from_slice(&trailing[range.clone()]);
                report.markers_rewritten.push((1, index));
            }
            (true, true) => {
                if merged[range.clone()] != trailing[range] {
                    return Err(Error::MarkerBlockMismatch { index });
                }
            }
        }
    }

    // The merged marker must agree with what the scanner found, otherwise
    // the geometry itself is in doubt.
    if merged[..block_bytes] != scanned_block[..] {
        return Err(Error::MarkerScanMismatch);
    }

    let full = MarkerV2::from_bytes(&merged)?;

    // Read the parity buffer, tolerating a truncated tail.
    stream::check_cancel(cancel_signal)?;
    file.seek(SeekFrom::Start(parity_offset))?;
    let mut parity = vec![0u8; stripe_bytes];
    file.read_fill(&mut parity)?;

    let parity_good = {
        let mut hasher = header.stripe_hasher(header.num_stripes);
        hasher.write(&parity);
        hasher.finish() == header.parity_hash
    };
    if !parity_good {
        warn!("Parity data is corrupt");
    }

    // Stream the image, recording each stripe's validity while folding it
    // into the accumulator.
    let mut stripe_good = vec![false; header.num_stripes as usize];
    let mut bad_count = u64::from(!parity_good);

    file.seek(SeekFrom::Start(0))?;
    let mut stripe = vec![0u8; stripe_bytes];

    stream::check_cancel(cancel_signal)?;
    file.read_exact(&mut stripe[..first_bytes])?;
    stripe_good[0] = {
        let mut hasher = header.stripe_hasher(0);
        hasher.write(&stripe[..first_bytes]);
        hasher.finish() == full.stripe_hashes[0]
    };
    if !stripe_good[0] {
        warn!("Stripe 0 is corrupt");
        bad_count += 1;
    }
    memxor(&mut parity[first_offset_bytes..], &stripe[..first_bytes]);

    for index in 1..header.num_stripes {
        stream::check_cancel(cancel_signal)?;

        file.read_exact(&mut stripe)?;
        stripe_good[index as usize] = {
            let mut hasher = header.stripe_hasher(index);
            hasher.write(&stripe);
            hasher.finish() == full.stripe_hashes[index as usize]
        };
        if !stripe_good[index as usize] {
            warn!(index, "Stripe is corrupt");
            bad_count += 1;
        }
        memxor(&mut parity, &stripe);
    }

    // `parity` now holds the residual: zero everywhere except where exactly
    // the corrupt data differs from the truth.
    match bad_count {
        0 => {
            if !is_zero(&parity) {
                return Err(Error::CannotLocate);
            }
        }

        1 => {
            if is_zero(&parity) {
                return Err(Error::CannotLocate);
            }

            if !parity_good {
                repair_region(
                    file,
                    parity_offset,
                    &parity,
                    header.stripe_hasher(header.num_stripes),
                    header.parity_hash,
                    cancel_signal,
                )?;
                report.repaired_region = Some(Region::Parity);
            } else if !stripe_good[0] {
                // The short first stripe only covers the tail of the
                // accumulator; a difference elsewhere means the corruption
                // is not confined to it.
                if !is_zero(&parity[..first_offset_bytes]) {
                    return Err(Error::CannotLocate);
                }
                repair_region(
                    file,
                    0,
                    &parity[first_offset_bytes..],
                    header.stripe_hasher(0),
                    full.stripe_hashes[0],
                    cancel_signal,
                )?;
                report.repaired_region = Some(Region::Stripe(0));
            } else {
                let index = (1..header.num_stripes)
                    .find(|i| !stripe_good[*i as usize])
                    .ok_or(Error::CannotLocate)?;

                repair_region(
                    file,
                    first_bytes as u64 + u64::from(index - 1) * stripe_bytes as u64,
                    &parity,
                    header.stripe_hasher(index),
                    full.stripe_hashes[index as usize],
                    cancel_signal,
                )?;
                report.repaired_region = Some(Region::Stripe(index));
            }
        }

        _ => return Err(Error::TooManyErrors),
    }

    // Heal marker blocks from the intact sibling.
    for &(copy, index) in &report.markers_rewritten {
        stream::check_cancel(cancel_signal)?;

        let base = match copy {
            1 => leading_offset,
            _ => trailing_offset,
        };
        let offset = base + u64::from(index) * block_bytes as u64;
        let range = index as usize * block_bytes..(index as usize + 1) * block_bytes;

        debug!(copy, index, "Rewriting marker block");
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&merged[range])?;
    }

    Ok(report)
}
