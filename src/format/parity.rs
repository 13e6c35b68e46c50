/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Parity builder and writer: XOR-folds the image stripe-by-stripe into a
//! single parity buffer, computing the per-stripe digests along the way, and
//! appends the `marker | parity | marker` tail to the artifact.
//!
//! The two format generations place the short stripe differently and that
//! placement must be preserved for compatibility: v2 puts it first, aligned
//! against the tail of the parity buffer; v1 puts it last, aligned against
//! the head, and writes the parity buffer to disk tail-first.

use std::{
    hash::Hasher,
    io::{self, Read, Write},
    sync::atomic::AtomicBool,
};

use num_traits::ToPrimitive;
use siphasher::sip::SipHasher24;
use thiserror::Error;
use tracing::debug;

use crate::{
    format::{
        layout::{Layout, LayoutV1},
        marker::{self, MarkerV1, MarkerV2, V2Header},
    },
    stream,
    util::memxor,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Marker error")]
    Marker(#[from] marker::Error),
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A computed parity tail for the current format, ready to be appended.
#[derive(Clone, Debug)]
pub struct ParitySet {
    pub marker: MarkerV2,
    pub parity: Vec<u8>,
}

/// A computed parity tail for the legacy format.
#[derive(Clone, Debug)]
pub struct ParitySetV1 {
    pub marker: MarkerV1,
    pub parity: Vec<u8>,
}

/// Read `blocks` blocks and XOR them into `region`, feeding every byte into
/// `hasher` as well.
fn fold_stripe(
    mut reader: impl Read,
    region: &mut [u8],
    scratch: &mut [u8],
    blocks: u64,
    hasher: &mut SipHasher24,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let block_bytes = scratch.len();

    for b in 0..blocks as usize {
        stream::check_cancel(cancel_signal)?;

        reader.read_exact(scratch)?;
        hasher.write(scratch);
        memxor(&mut region[b * block_bytes..(b + 1) * block_bytes], scratch);
    }

    Ok(())
}

/// XOR `blocks` blocks into `region` without hashing.
fn fold_stripe_unhashed(
    mut reader: impl Read,
    region: &mut [u8],
    scratch: &mut [u8],
    blocks: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let block_bytes = scratch.len();

    for b in 0..blocks as usize {
        stream::check_cancel(cancel_signal)?;

        reader.read_exact(scratch)?;
        memxor(&mut region[b * block_bytes..(b + 1) * block_bytes], scratch);
    }

    Ok(())
}

/// Fold the image into a parity buffer and assemble the v2 marker. `reader`
/// must be positioned at the start of the image and supply exactly
/// `image_blocks` blocks. `date_time` (nanoseconds since the epoch) keys
/// every digest and must come from the caller so the marker is reproducible.
pub fn build(
    mut reader: impl Read,
    layout: &Layout,
    date_time: u64,
    cancel_signal: &AtomicBool,
) -> Result<ParitySet> {
    let block_bytes = layout
        .block_bytes
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("block_bytes"))?;
    let stripe_bytes = layout
        .stripe_bytes()
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("stripe_bytes"))?;
    let num_stripes = layout
        .num_stripes
        .to_u32()
        .ok_or(Error::FieldOutOfBounds("num_stripes"))?;

    let block_log2 = layout.block_log2();
    let mut parity = vec![0u8; stripe_bytes];
    let mut scratch = vec![0u8; block_bytes];
    let mut stripe_hashes = Vec::with_capacity(num_stripes as usize);

    // The short first stripe lands against the tail of the parity buffer.
    let first_offset_bytes = (layout.first_offset * layout.block_bytes) as usize;

    debug!(
        stripes = layout.num_stripes,
        stripe_blocks = layout.stripe_blocks,
        first_blocks = layout.first_blocks,
        "Folding image into parity",
    );

    let mut hasher = marker::stripe_hasher(block_log2, date_time, 0);
    fold_stripe(
        &mut reader,
        &mut parity[first_offset_bytes..],
        &mut scratch,
        layout.first_blocks,
        &mut hasher,
        cancel_signal,
    )?;
    stripe_hashes.push(hasher.finish());

    for index in 1..num_stripes {
        let mut hasher = marker::stripe_hasher(block_log2, date_time, index);
        fold_stripe(
            &mut reader,
            &mut parity,
            &mut scratch,
            layout.stripe_blocks,
            &mut hasher,
            cancel_signal,
        )?;
        stripe_hashes.push(hasher.finish());
    }

    let mut hasher = marker::stripe_hasher(block_log2, date_time, num_stripes);
    hasher.write(&parity);
    let parity_hash = hasher.finish();

    let header = V2Header {
        block_log2,
        date_time,
        num_stripes,
        first_blocks: layout
            .first_blocks
            .to_u32()
            .ok_or(Error::FieldOutOfBounds("first_blocks"))?,
        stripe_blocks: layout
            .stripe_blocks
            .to_u32()
            .ok_or(Error::FieldOutOfBounds("stripe_blocks"))?,
        image_blocks: layout
            .image_blocks
            .to_u32()
            .ok_or(Error::FieldOutOfBounds("image_blocks"))?,
        parity_hash,
    };

    Ok(ParitySet {
        marker: MarkerV2 {
            header,
            stripe_hashes,
        },
        parity,
    })
}

/// Fold the image into a parity buffer for the legacy format. No digests are
/// computed; the v1 marker only protects itself.
pub fn build_v1(
    mut reader: impl Read,
    layout: &LayoutV1,
    cancel_signal: &AtomicBool,
) -> Result<ParitySetV1> {
    let block_bytes = layout
        .block_bytes
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("block_bytes"))?;
    let stripe_bytes = layout
        .stripe_bytes()
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("stripe_bytes"))?;

    let mut parity = vec![0u8; stripe_bytes];
    let mut scratch = vec![0u8; block_bytes];

    // The first stripe is always full size; read it straight into the
    // buffer.
    fold_stripe_unhashed(
        &mut reader,
        &mut parity,
        &mut scratch,
        layout.stripe_blocks,
        cancel_signal,
    )?;

    for _ in 1..layout.num_stripes.saturating_sub(1) {
        fold_stripe_unhashed(
            &mut reader,
            &mut parity,
            &mut scratch,
            layout.stripe_blocks,
            cancel_signal,
        )?;
    }

    // The short last stripe lands against the head of the buffer.
    if layout.num_stripes > 1 {
        fold_stripe_unhashed(
            &mut reader,
            &mut parity,
            &mut scratch,
            layout.last_blocks,
            cancel_signal,
        )?;
    }

    let marker = MarkerV1 {
        block_bytes: layout.block_bytes,
        image_blocks: layout.image_blocks,
        stripe_blocks: layout.stripe_blocks,
        num_stripes: layout.num_stripes,
        stripe_offset: layout.stripe_offset,
    };

    Ok(ParitySetV1 { marker, parity })
}

/// Append `marker | parity | marker` to a writer positioned at the end of
/// the image body. The caller is responsible for making the result durable;
/// the format is only self-consistent once the second marker is on disk.
pub fn append(
    mut writer: impl Write,
    set: &ParitySet,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let marker_bytes = set.marker.to_bytes()?;

    debug!(
        marker_bytes = marker_bytes.len(),
        parity_bytes = set.parity.len(),
        "Appending parity tail",
    );

    stream::write_all_chunked(&mut writer, &marker_bytes, cancel_signal)?;
    stream::write_all_chunked(&mut writer, &set.parity, cancel_signal)?;
    stream::write_all_chunked(&mut writer, &marker_bytes, cancel_signal)?;

    Ok(())
}

/// Append a legacy parity tail. The parity buffer's trailing `stripe_offset`
/// blocks are written ahead of its main body.
pub fn append_v1(
    mut writer: impl Write,
    set: &ParitySetV1,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let marker_block = set.marker.to_block();
    let main_bytes = (set.marker.last_blocks() * set.marker.block_bytes) as usize;

    stream::write_all_chunked(&mut writer, &marker_block, cancel_signal)?;
    if main_bytes < set.parity.len() {
        stream::write_all_chunked(&mut writer, &set.parity[main_bytes..], cancel_signal)?;
    }
    stream::write_all_chunked(&mut writer, &set.parity[..main_bytes], cancel_signal)?;
    stream::write_all_chunked(&mut writer, &marker_block, cancel_signal)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{hash::Hasher, io::Cursor, sync::atomic::AtomicBool};

    use crate::util::{is_zero, memxor};

    use super::*;

    fn test_image(blocks: u64, block_bytes: u64) -> Vec<u8> {
        let len = (blocks * block_bytes) as usize;
        // Deterministic non-trivial content.
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(7)).collect()
    }

    const B: usize = 2048;

    #[test]
    fn v2_parity_is_column_xor() {
        let layout = Layout::compute(10, 10 + 2 + 4, B as u64).unwrap();
        assert_eq!(layout.stripe_blocks, 4);
        assert_eq!(layout.num_stripes, 3);
        assert_eq!(layout.first_blocks, 2);
        assert_eq!(layout.first_offset, 2);
        assert_eq!(layout.marker_blocks, 1);

        let image = test_image(10, B as u64);
        let cancel_signal = AtomicBool::new(false);
        let set = build(Cursor::new(&image), &layout, 12345, &cancel_signal).unwrap();

        // Reference fold: the short first stripe against the buffer tail,
        // full stripes from the start.
        let mut expected = vec![0u8; 4 * B];
        memxor(&mut expected[2 * B..], &image[..2 * B]);
        memxor(&mut expected, &image[2 * B..6 * B]);
        memxor(&mut expected, &image[6 * B..10 * B]);
        assert_eq!(set.parity, expected);

        // Folding the stripes back into the parity cancels it out.
        let mut residual = set.parity.clone();
        memxor(&mut residual[2 * B..], &image[..2 * B]);
        memxor(&mut residual, &image[2 * B..6 * B]);
        memxor(&mut residual, &image[6 * B..10 * B]);
        assert!(is_zero(&residual));

        // Stored digests match a recomputation under the header key.
        for (i, stored) in set.marker.stripe_hashes.iter().enumerate() {
            let range = match i {
                0 => 0..2 * B,
                i => (2 + (i - 1) * 4) * B..(2 + i * 4) * B,
            };
            let mut hasher = set.marker.header.stripe_hasher(i as u32);
            hasher.write(&image[range]);
            assert_eq!(hasher.finish(), *stored);
        }

        let mut hasher = set.marker.header.stripe_hasher(3);
        hasher.write(&set.parity);
        assert_eq!(hasher.finish(), set.marker.header.parity_hash);
    }

    #[test]
    fn v2_append_layout() {
        let layout = Layout::compute(10, 10 + 2 + 4, B as u64).unwrap();
        let image = test_image(10, B as u64);
        let cancel_signal = AtomicBool::new(false);
        let set = build(Cursor::new(&image), &layout, 12345, &cancel_signal).unwrap();

        let mut artifact = image.clone();
        append(&mut artifact, &set, &cancel_signal).unwrap();

        let marker_bytes = set.marker.to_bytes().unwrap();
        assert_eq!(artifact.len(), 10 * B + 2 * marker_bytes.len() + set.parity.len());
        assert_eq!(&artifact[10 * B..11 * B], &marker_bytes[..]);
        assert_eq!(&artifact[11 * B..15 * B], &set.parity[..]);
        assert_eq!(&artifact[15 * B..], &marker_bytes[..]);
    }

    #[test]
    fn v1_parity_fold_and_ordering() {
        let layout = LayoutV1::compute(10, 10 + 2 + 4, 64).unwrap();
        assert_eq!(layout.stripe_blocks, 4);
        assert_eq!(layout.num_stripes, 3);
        assert_eq!(layout.last_blocks, 2);
        assert_eq!(layout.stripe_offset, 2);

        let image = test_image(10, 64);
        let cancel_signal = AtomicBool::new(false);
        let set = build_v1(Cursor::new(&image), &layout, &cancel_signal).unwrap();

        // Short last stripe folds against the buffer head.
        let mut expected = vec![0u8; 4 * 64];
        memxor(&mut expected, &image[..4 * 64]);
        memxor(&mut expected, &image[4 * 64..8 * 64]);
        memxor(&mut expected[..2 * 64], &image[8 * 64..]);
        assert_eq!(set.parity, expected);

        let mut artifact = image.clone();
        append_v1(&mut artifact, &set, &cancel_signal).unwrap();

        // On disk: marker, buffer tail (stripe_offset blocks), buffer head
        // (last_blocks blocks), marker.
        let marker_block = set.marker.to_block();
        assert_eq!(artifact.len(), (10 + 1 + 4 + 1) * 64);
        assert_eq!(&artifact[10 * 64..11 * 64], &marker_block[..]);
        assert_eq!(&artifact[11 * 64..13 * 64], &set.parity[2 * 64..]);
        assert_eq!(&artifact[13 * 64..15 * 64], &set.parity[..2 * 64]);
        assert_eq!(&artifact[15 * 64..], &marker_block[..]);
    }
}
