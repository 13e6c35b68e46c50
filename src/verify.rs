/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Read-only verification of a protected artifact. Both format generations
//! are accepted; v2 additionally checks the per-stripe digests while v1 only
//! has the parity fold itself.

use std::{
    hash::Hasher,
    io::{self, Read, Seek, SeekFrom},
    sync::atomic::AtomicBool,
};

use num_traits::ToPrimitive;
use thiserror::Error;
use tracing::debug;

use crate::{
    format::marker::{self, MarkerV1, MarkerV2, ScannedKind, V2Header},
    stream::{self, ReadFixedSizeExt},
    util::{count_nonzero, memxor},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Marker not found")]
    MarkerNotFound,
    #[error("Marker copy {copy} is corrupt")]
    MarkerCopyCorrupt { copy: u8 },
    #[error("Stripe {index} is corrupt")]
    StripeCorrupt { index: u32 },
    #[error("Parity data is corrupt")]
    ParityCorrupt,
    #[error("Invalid parity ({errors} errors)")]
    InvalidParity { errors: u64 },
    #[error("Marker error")]
    Marker(#[from] marker::Error),
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Generation {
    V1,
    V2,
}

/// Geometry of a successfully verified artifact, for reporting.
#[derive(Clone, Copy, Debug)]
pub struct VerifyInfo {
    pub generation: Generation,
    pub block_bytes: u64,
    pub image_blocks: u64,
    pub stripe_blocks: u64,
    pub num_stripes: u64,
}

/// Verify a protected artifact. Returns the artifact's geometry on success
/// and the first failed check otherwise.
pub fn verify<R: Read + Seek>(reader: &mut R, cancel_signal: &AtomicBool) -> Result<VerifyInfo> {
    let scanned = marker::scan_file_tail(reader, cancel_signal)?.ok_or(Error::MarkerNotFound)?;

    match scanned.kind {
        ScannedKind::V1 { marker, record } => verify_v1(reader, &marker, &record, cancel_signal),
        ScannedKind::V2 { header, block } => verify_v2(reader, &header, &block, cancel_signal),
    }
}

fn verify_v2<R: Read + Seek>(
    reader: &mut R,
    header: &V2Header,
    scanned_block: &[u8],
    cancel_signal: &AtomicBool,
) -> Result<VerifyInfo> {
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
    let first_bytes = u64::from(header.first_blocks) * header.block_bytes();
    let image_bytes = u64::from(header.image_blocks) * header.block_bytes();
    let first_offset_bytes = stripe_bytes - first_bytes as usize;

    debug!(?header, "Verifying v2 artifact");

    // Trailing marker copy. It must match the scanned block bit for bit and
    // every block must pass its keyed checksum.
    reader.seek(SeekFrom::Start(
        image_bytes + header.marker_bytes() + stripe_bytes as u64,
    ))?;
    let trailing = reader.read_vec_exact(marker_bytes)?;
    if trailing[..block_bytes] != *scanned_block {
        return Err(Error::MarkerCopyCorrupt { copy: 1 });
    }
    let full = MarkerV2::from_bytes(&trailing).map_err(|e| match e {
        marker::Error::BlockChecksum { .. } | marker::Error::InconsistentBlock { .. } => {
            Error::MarkerCopyCorrupt { copy: 1 }
        }
        e => Error::Marker(e),
    })?;

    // Leading marker copy must equal the trailing one bit for bit.
    reader.seek(SeekFrom::Start(image_bytes))?;
    let leading = reader.read_vec_exact(marker_bytes)?;
    if leading != trailing {
        return Err(Error::MarkerCopyCorrupt { copy: 2 });
    }

    // Parity buffer.
    stream::check_cancel(cancel_signal)?;
    reader.seek(SeekFrom::Start(image_bytes + header.marker_bytes()))?;
    let mut parity = reader.read_vec_exact(stripe_bytes)?;

    let mut hasher = header.stripe_hasher(header.num_stripes);
    hasher.write(&parity);
    if hasher.finish() != header.parity_hash {
        return Err(Error::ParityCorrupt);
    }

    // Stream the image, folding every stripe back into the parity buffer.
    reader.seek(SeekFrom::Start(0))?;
    let mut stripe = vec![0u8; stripe_bytes];

    stream::check_cancel(cancel_signal)?;
    reader.read_exact(&mut stripe[..first_bytes as usize])?;
    let mut hasher = header.stripe_hasher(0);
    hasher.write(&stripe[..first_bytes as usize]);
    if hasher.finish() != full.stripe_hashes[0] {
        return Err(Error::StripeCorrupt { index: 0 });
    }
    memxor(
        &mut parity[first_offset_bytes..],
        &stripe[..first_bytes as usize],
    );

    for index in 1..header.num_stripes {
        stream::check_cancel(cancel_signal)?;

        reader.read_exact(&mut stripe)?;
        let mut hasher = header.stripe_hasher(index);
        hasher.write(&stripe);
        if hasher.finish() != full.stripe_hashes[index as usize] {
            return Err(Error::StripeCorrupt { index });
        }
        memxor(&mut parity, &stripe);
    }

    let errors = count_nonzero(&parity);
    if errors > 0 {
        return Err(Error::InvalidParity { errors });
    }

    Ok(VerifyInfo {
        generation: Generation::V2,
        block_bytes: header.block_bytes(),
        image_blocks: header.image_blocks.into(),
        stripe_blocks: header.stripe_blocks.into(),
        num_stripes: header.num_stripes.into(),
    })
}

fn verify_v1<R: Read + Seek>(
    reader: &mut R,
    marker: &MarkerV1,
    record: &[u8; marker::V1_RECORD_BYTES],
    cancel_signal: &AtomicBool,
) -> Result<VerifyInfo> {
    let block_bytes = marker
        .block_bytes
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("block_bytes"))?;
    let stripe_bytes = (marker.stripe_blocks * marker.block_bytes)
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("stripe_bytes"))?;
    let image_bytes = marker.image_blocks * marker.block_bytes;
    let main_bytes = (marker.last_blocks() * marker.block_bytes) as usize;
    let offset_bytes = stripe_bytes - main_bytes;

    debug!(?marker, "Verifying v1 artifact");

    // Both on-disk copies must consist of the scanned record repeated to
    // fill the block.
    let mut expected_block = vec![0u8; block_bytes];
    for chunk in expected_block.chunks_exact_mut(marker::V1_RECORD_BYTES) {
        chunk.copy_from_slice(record);
    }

    reader.seek(SeekFrom::Start(
        (marker.image_blocks + 1 + marker.stripe_blocks) * marker.block_bytes,
    ))?;
    let trailing = reader.read_vec_exact(block_bytes)?;
    if trailing != expected_block {
        return Err(Error::MarkerCopyCorrupt { copy: 1 });
    }

    reader.seek(SeekFrom::Start(image_bytes))?;
    let leading = reader.read_vec_exact(block_bytes)?;
    if leading != expected_block {
        return Err(Error::MarkerCopyCorrupt { copy: 2 });
    }

    // Parity: the on-disk order is buffer tail first, then the main body.
    stream::check_cancel(cancel_signal)?;
    reader.seek(SeekFrom::Start((marker.image_blocks + 1) * marker.block_bytes))?;
    let mut parity = vec![0u8; stripe_bytes];
    if offset_bytes > 0 {
        reader.read_exact(&mut parity[main_bytes..])?;
    }
    reader.read_exact(&mut parity[..main_bytes])?;

    // Fold the image back in: full stripes from the head of the buffer, the
    // short last stripe against the head as well.
    reader.seek(SeekFrom::Start(0))?;
    let mut stripe = vec![0u8; stripe_bytes];

    for _ in 1..marker.num_stripes {
        stream::check_cancel(cancel_signal)?;

        reader.read_exact(&mut stripe)?;
        memxor(&mut parity, &stripe);
    }

    let last_bytes = (image_bytes - (marker.num_stripes - 1) * marker.stripe_blocks * marker.block_bytes)
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("last_bytes"))?;
    stream::check_cancel(cancel_signal)?;
    reader.read_exact(&mut stripe[..last_bytes])?;
    memxor(&mut parity[..last_bytes], &stripe[..last_bytes]);

    let errors = count_nonzero(&parity);
    if errors > 0 {
        return Err(Error::InvalidParity { errors });
    }

    Ok(VerifyInfo {
        generation: Generation::V1,
        block_bytes: marker.block_bytes,
        image_blocks: marker.image_blocks,
        stripe_blocks: marker.stripe_blocks,
        num_stripes: marker.num_stripes,
    })
}
