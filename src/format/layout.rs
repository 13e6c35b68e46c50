/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Geometry calculator: given the image size, the target final size, and the
//! block size, decide how the image is divided into stripes and how many
//! marker blocks the stripe hashes need.

use thiserror::Error;

use crate::format::marker::{V2Header, MIN_BLOCK_BYTES};

const MIB: u64 = 1024 * 1024;

/// Media sizes tried when no final size is given, in MiB: CD-R (650/700),
/// single-layer DVD, single-layer BD.
const FINAL_SIZE_GUESSES: [u64; 4] = [650, 700, 4482, 23600];

/// Media sizes known to the legacy format: CD-R only.
const FINAL_SIZE_GUESSES_V1: [u64; 2] = [650, 700];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image is empty")]
    ImageEmpty,
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u64),
    #[error("Large image, must specify final size")]
    MustSpecifyFinalSize,
    #[error("Final size is too small for image")]
    FinalSizeTooSmall,
    #[error("Image too large for the marker geometry: {0} blocks")]
    ImageTooLarge(u64),
}

type Result<T> = std::result::Result<T, Error>;

fn guess_final_blocks(image_blocks: u64, block_bytes: u64, guesses: &[u64]) -> Result<u64> {
    for mib in guesses {
        let final_blocks = mib * MIB / block_bytes;
        if final_blocks >= image_blocks {
            return Ok(final_blocks);
        }
    }

    Err(Error::MustSpecifyFinalSize)
}

fn check_inputs(image_blocks: u64, block_bytes: u64) -> Result<()> {
    if image_blocks == 0 {
        return Err(Error::ImageEmpty);
    } else if block_bytes < MIN_BLOCK_BYTES || !block_bytes.is_power_of_two() {
        return Err(Error::InvalidBlockSize(block_bytes));
    }

    Ok(())
}

/// Stripe geometry for the current format. The short stripe comes first and
/// is aligned against the tail of the parity buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub block_bytes: u64,
    pub image_blocks: u64,
    pub final_blocks: u64,
    pub stripe_blocks: u64,
    pub num_stripes: u64,
    pub first_blocks: u64,
    pub first_offset: u64,
    pub marker_blocks: u64,
}

impl Layout {
    /// Compute the layout. A `final_blocks` of zero means "guess": the first
    /// standard media size at least as large as the image is used.
    pub fn compute(image_blocks: u64, final_blocks: u64, block_bytes: u64) -> Result<Self> {
        check_inputs(image_blocks, block_bytes)?;

        let final_blocks = if final_blocks == 0 {
            guess_final_blocks(image_blocks, block_bytes, &FINAL_SIZE_GUESSES)?
        } else {
            final_blocks
        };

        // The marker fields are 32 bits wide.
        if image_blocks > u64::from(u32::MAX) {
            return Err(Error::ImageTooLarge(image_blocks));
        }

        // Grow the marker until every stripe hash fits. Each extra marker
        // block shrinks the space left for the parity stripe, which can in
        // turn raise the stripe count, so this must iterate.
        let mut marker_blocks = 1;
        let (stripe_blocks, num_stripes) = loop {
            let available = final_blocks
                .checked_sub(image_blocks + 2 * marker_blocks)
                .unwrap_or_default();
            if available < 1 {
                return Err(Error::FinalSizeTooSmall);
            }

            let stripe_blocks = available.min(image_blocks);
            let num_stripes = image_blocks.div_ceil(stripe_blocks);

            if num_stripes <= u64::from(u32::MAX)
                && marker_blocks
                    >= V2Header::marker_blocks_for(num_stripes as u32, block_bytes)
            {
                break (stripe_blocks, num_stripes);
            }

            marker_blocks += 1;
        };

        let first_blocks = image_blocks - stripe_blocks * (num_stripes - 1);
        let first_offset = stripe_blocks - first_blocks;

        Ok(Self {
            block_bytes,
            image_blocks,
            final_blocks,
            stripe_blocks,
            num_stripes,
            first_blocks,
            first_offset,
            marker_blocks,
        })
    }

    pub fn block_log2(&self) -> u16 {
        self.block_bytes.trailing_zeros() as u16
    }

    pub fn stripe_bytes(&self) -> u64 {
        self.stripe_blocks * self.block_bytes
    }
}

/// Stripe geometry for the legacy format. The short stripe comes last and is
/// aligned against the head of the parity buffer; the marker is always a
/// single block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutV1 {
    pub block_bytes: u64,
    pub image_blocks: u64,
    pub final_blocks: u64,
    pub stripe_blocks: u64,
    pub num_stripes: u64,
    pub last_blocks: u64,
    pub stripe_offset: u64,
}

impl LayoutV1 {
    pub fn compute(image_blocks: u64, final_blocks: u64, block_bytes: u64) -> Result<Self> {
        check_inputs(image_blocks, block_bytes)?;

        let final_blocks = if final_blocks == 0 {
            guess_final_blocks(image_blocks, block_bytes, &FINAL_SIZE_GUESSES_V1)?
        } else {
            final_blocks
        };

        let available = final_blocks
            .checked_sub(image_blocks + 2)
            .unwrap_or_default();
        if available < 1 {
            return Err(Error::FinalSizeTooSmall);
        }

        let stripe_blocks = available.min(image_blocks);
        let num_stripes = image_blocks.div_ceil(stripe_blocks);
        let last_blocks = image_blocks - stripe_blocks * (num_stripes - 1);
        let stripe_offset = stripe_blocks - last_blocks;

        Ok(Self {
            block_bytes,
            image_blocks,
            final_blocks,
            stripe_blocks,
            num_stripes,
            last_blocks,
            stripe_offset,
        })
    }

    pub fn stripe_bytes(&self) -> u64 {
        self.stripe_blocks * self.block_bytes
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn tiny_one_stripe() {
        let layout = Layout::compute(1, 650 * MIB / 2048, 2048).unwrap();

        assert_eq!(layout.num_stripes, 1);
        assert_eq!(layout.stripe_blocks, 1);
        assert_eq!(layout.first_blocks, 1);
        assert_eq!(layout.first_offset, 0);
        assert_eq!(layout.marker_blocks, 1);
    }

    #[test]
    fn image_smaller_than_media() {
        // 200 image blocks fit entirely inside a CD-sized parity region, so
        // the whole image is a single stripe.
        let layout = Layout::compute(200, 650 * MIB / 2048, 2048).unwrap();

        assert_eq!(layout.num_stripes, 1);
        assert_eq!(layout.stripe_blocks, 200);
        assert_eq!(layout.first_blocks, 200);
        assert_eq!(layout.first_offset, 0);
        assert_eq!(layout.marker_blocks, 1);
    }

    #[test]
    fn multi_stripe_split() {
        // A 600 MiB image on 650 MiB media leaves a hair under 50 MiB for
        // parity, forcing multiple stripes.
        let image_blocks = 600 * MIB / 2048;
        let final_blocks = 650 * MIB / 2048;
        let layout = Layout::compute(image_blocks, final_blocks, 2048).unwrap();

        assert_eq!(layout.stripe_blocks, final_blocks - image_blocks - 2);
        assert_eq!(layout.num_stripes, 13);
        assert_eq!(
            layout.image_blocks,
            layout.first_blocks + layout.stripe_blocks * (layout.num_stripes - 1)
        );
        assert!(layout.first_blocks >= 1);
        assert!(layout.first_blocks <= layout.stripe_blocks);

        // The minimal stripe count for the available space.
        assert!(layout.num_stripes * layout.stripe_blocks >= layout.image_blocks);
        assert!((layout.num_stripes - 1) * layout.stripe_blocks < layout.image_blocks);
    }

    #[test]
    fn exact_stripe_boundary() {
        // image_blocks divisible by stripe_blocks: the first stripe is full
        // size and the parity alignment offset vanishes.
        let layout = Layout::compute(1000, 1000 + 2 + 500, 2048).unwrap();

        assert_eq!(layout.stripe_blocks, 500);
        assert_eq!(layout.num_stripes, 2);
        assert_eq!(layout.first_blocks, 500);
        assert_eq!(layout.first_offset, 0);
    }

    #[test]
    fn guessing() {
        // Small images round up to CD sizes, larger ones to DVD/BD.
        assert_eq!(
            Layout::compute(1, 0, 2048).unwrap().final_blocks,
            650 * MIB / 2048
        );
        assert_eq!(
            Layout::compute(660 * MIB / 2048, 0, 2048).unwrap().final_blocks,
            700 * MIB / 2048
        );
        assert_eq!(
            Layout::compute(800 * MIB / 2048, 0, 2048).unwrap().final_blocks,
            4482 * MIB / 2048
        );
        assert_eq!(
            Layout::compute(5000 * MIB / 2048, 0, 2048).unwrap().final_blocks,
            23600 * MIB / 2048
        );
        assert_matches!(
            Layout::compute(24000 * MIB / 2048, 0, 2048),
            Err(Error::MustSpecifyFinalSize)
        );

        // The legacy guesser only knows CD sizes.
        assert_matches!(
            LayoutV1::compute(800 * MIB / 2048, 0, 2048),
            Err(Error::MustSpecifyFinalSize)
        );
    }

    #[test]
    fn rejects_bad_inputs() {
        assert_matches!(Layout::compute(0, 1000, 2048), Err(Error::ImageEmpty));
        assert_matches!(
            Layout::compute(10, 1000, 1000),
            Err(Error::InvalidBlockSize(1000))
        );
        assert_matches!(
            Layout::compute(10, 1000, 32),
            Err(Error::InvalidBlockSize(32))
        );
        assert_matches!(Layout::compute(10, 12, 2048), Err(Error::FinalSizeTooSmall));
    }

    #[test]
    fn marker_growth() {
        // 64-byte blocks hold so few hashes that the marker must grow, and
        // every extra marker block shrinks the parity space.
        let layout = Layout::compute(100, 100 + 20, 64).unwrap();

        assert!(layout.marker_blocks > 1);
        assert_eq!(
            layout.stripe_blocks,
            layout.final_blocks - layout.image_blocks - 2 * layout.marker_blocks
        );
        assert_eq!(
            layout.num_stripes,
            layout.image_blocks.div_ceil(layout.stripe_blocks)
        );
        assert!(
            V2Header::marker_blocks_for(layout.num_stripes as u32, 64) <= layout.marker_blocks
        );
    }

    #[test]
    fn v1_layout() {
        let layout = LayoutV1::compute(1000, 1000 + 2 + 400, 2048).unwrap();

        assert_eq!(layout.stripe_blocks, 400);
        assert_eq!(layout.num_stripes, 3);
        assert_eq!(layout.last_blocks, 200);
        assert_eq!(layout.stripe_offset, 200);

        let layout = LayoutV1::compute(200, 650 * MIB / 2048, 2048).unwrap();
        assert_eq!(layout.num_stripes, 1);
        assert_eq!(layout.stripe_blocks, 200);
        assert_eq!(layout.stripe_offset, 0);
    }
}
