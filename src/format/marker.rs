/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! The marker is the self-describing geometry-and-integrity header written in
//! two identical copies bracketing the parity region. Two generations exist
//! on the wire:
//!
//! * v1 (legacy): a 64-byte record of eight u64 words protected by an XOR
//!   checksum, repeated to fill one block.
//! * v2 (current): one or more blocks carrying the geometry, a per-stripe
//!   SipHash-2-4 digest array, and a keyed checksum in the last word of every
//!   block.
//!
//! Markers are written little-endian. A byte-swapped marker (produced by a
//! foreign-endian writer, or a whole artifact whose fields were swapped in
//! place) is also accepted: the alternate signature selects swapped decoding
//! and all keyed-hash verification happens against the canonical
//! little-endian serialisation of the decoded fields.

use std::{
    hash::Hasher,
    io::{self, Read, Seek, SeekFrom},
    sync::atomic::AtomicBool,
};

use byteorder::{ByteOrder, LittleEndian};
use num_traits::ToPrimitive;
use siphasher::sip::SipHasher24;
use thiserror::Error;

use crate::stream::{self, ReadFixedSizeExt};

/// v1 signature pair.
pub const V1_SIG1: u64 = 0xc56a5d888149eee7;
pub const V1_SIG2: u64 = 0x4139ef05dda34f80;

/// v2 signature.
pub const V2_SIG: u32 = 0x972fae43;

/// Size of one v1 marker record.
pub const V1_RECORD_BYTES: usize = 64;

/// Smallest supported block size. A block must hold at least one v1 record
/// (equivalently, `block_log2 >= 6` for v2).
pub const MIN_BLOCK_BYTES: u64 = 64;

/// Exclusive upper bound for the v2 `block_log2` field.
const MAX_BLOCK_LOG2: u16 = 30;

/// How far back from the end of the media the scanners look for a marker.
pub const MAX_SCAN: u64 = 16 * 1024 * 1024;

const ZERO_KEY: [u8; 16] = [0u8; 16];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid marker signature: {0:#010x}")]
    InvalidSignature(u32),
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u64),
    #[error("Block size log2 field out of range: {0}")]
    InvalidBlockLog2(u16),
    #[error("Invalid first stripe size: {0}")]
    InvalidFirstBlocks(u32),
    #[error("Invalid stripe size: {0}")]
    InvalidStripeBlocks(u64),
    #[error("Invalid number of stripes: {0}")]
    InvalidNumStripes(u64),
    #[error("Invalid stripe offset: {0}")]
    InvalidStripeOffset(u64),
    #[error("Marker block {index} failed its checksum")]
    BlockChecksum { index: u32 },
    #[error("Marker block {index} has an inconsistent header")]
    InconsistentBlock { index: u32 },
    #[error("Marker is truncated: expected {expected} bytes, but have {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Keyed hasher for the checksum in the last word of every v2 marker block.
/// The key is all zeros and the digest covers the block minus its trailing
/// 8-byte checksum slot.
pub fn block_checksum(data: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_key(&ZERO_KEY);
    hasher.write(data);
    hasher.finish()
}

/// Keyed hasher for stripe and parity digests. The key is the canonical
/// serialisation of the leading v2 header fields with the mutable `index`
/// field set to the stripe ordinal (the parity buffer uses `num_stripes`).
/// The ordinal is truncated to the width of the wire field.
pub fn stripe_hasher(block_log2: u16, date_time: u64, index: u32) -> SipHasher24 {
    let mut key = [0u8; 16];
    key[0..4].copy_from_slice(&V2_SIG.to_le_bytes());
    key[4..6].copy_from_slice(&block_log2.to_le_bytes());
    key[6..8].copy_from_slice(&(index as u16).to_le_bytes());
    key[8..16].copy_from_slice(&date_time.to_le_bytes());

    SipHasher24::new_with_key(&key)
}

fn read_u16(buf: &[u8], swapped: bool) -> u16 {
    let v = LittleEndian::read_u16(buf);
    if swapped {
        v.swap_bytes()
    } else {
        v
    }
}

fn read_u32(buf: &[u8], swapped: bool) -> u32 {
    let v = LittleEndian::read_u32(buf);
    if swapped {
        v.swap_bytes()
    } else {
        v
    }
}

fn read_u64(buf: &[u8], swapped: bool) -> u64 {
    let v = LittleEndian::read_u64(buf);
    if swapped {
        v.swap_bytes()
    } else {
        v
    }
}

/// Legacy single-block marker. All fields are u64 words on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkerV1 {
    pub block_bytes: u64,
    pub image_blocks: u64,
    pub stripe_blocks: u64,
    pub num_stripes: u64,
    pub stripe_offset: u64,
}

impl MarkerV1 {
    /// Size of the short terminal stripe.
    pub fn last_blocks(&self) -> u64 {
        self.stripe_blocks - self.stripe_offset
    }

    fn words(&self) -> [u64; 8] {
        let mut words = [
            V1_SIG1,
            V1_SIG2,
            self.block_bytes,
            self.image_blocks,
            self.stripe_blocks,
            self.num_stripes,
            self.stripe_offset,
            0,
        ];
        words[7] = words[..7].iter().fold(0, |acc, w| acc ^ w);
        words
    }

    /// Serialise one 64-byte record.
    pub fn to_record(&self) -> [u8; V1_RECORD_BYTES] {
        let mut record = [0u8; V1_RECORD_BYTES];
        for (chunk, word) in record.chunks_exact_mut(8).zip(self.words()) {
            LittleEndian::write_u64(chunk, word);
        }
        record
    }

    /// Serialise a whole marker block: the record repeated until the block is
    /// full.
    pub fn to_block(&self) -> Vec<u8> {
        let record = self.to_record();
        let mut block = vec![0u8; self.block_bytes as usize];
        for chunk in block.chunks_exact_mut(V1_RECORD_BYTES) {
            chunk.copy_from_slice(&record);
        }
        block
    }

    /// Parse one record, accepting either byte order. Returns `None` unless
    /// the signature pair and the XOR checksum hold.
    pub fn parse_record(record: &[u8]) -> Option<Self> {
        if record.len() < V1_RECORD_BYTES {
            return None;
        }

        let sig1 = LittleEndian::read_u64(record);
        let sig2 = LittleEndian::read_u64(&record[8..]);

        let swapped = if sig1 == V1_SIG1 && sig2 == V1_SIG2 {
            false
        } else if sig1 == V1_SIG1.swap_bytes() && sig2 == V1_SIG2.swap_bytes() {
            true
        } else {
            return None;
        };

        let mut words = [0u64; 8];
        for (word, chunk) in words.iter_mut().zip(record.chunks_exact(8)) {
            *word = read_u64(chunk, swapped);
        }

        if words[..7].iter().fold(0, |acc, w| acc ^ w) != words[7] {
            return None;
        }

        Some(Self {
            block_bytes: words[2],
            image_blocks: words[3],
            stripe_blocks: words[4],
            num_stripes: words[5],
            stripe_offset: words[6],
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_bytes < MIN_BLOCK_BYTES || !self.block_bytes.is_power_of_two() {
            return Err(Error::InvalidBlockSize(self.block_bytes));
        } else if self.stripe_blocks == 0 || self.stripe_blocks > self.image_blocks {
            return Err(Error::InvalidStripeBlocks(self.stripe_blocks));
        } else if self.num_stripes != self.image_blocks.div_ceil(self.stripe_blocks) {
            return Err(Error::InvalidNumStripes(self.num_stripes));
        } else if self.stripe_offset >= self.stripe_blocks {
            return Err(Error::InvalidStripeOffset(self.stripe_offset));
        }

        Ok(())
    }
}

/// The geometry header carried in the first block of a v2 marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct V2Header {
    pub block_log2: u16,
    /// Nanoseconds since the epoch at parity creation time.
    pub date_time: u64,
    pub num_stripes: u32,
    pub first_blocks: u32,
    pub stripe_blocks: u32,
    pub image_blocks: u32,
    pub parity_hash: u64,
}

impl V2Header {
    pub fn block_bytes(&self) -> u64 {
        1 << self.block_log2
    }

    /// Stripe-hash slots in marker block 0: the header occupies five words
    /// and the checksum one.
    pub fn block0_hash_slots(block_bytes: u64) -> usize {
        (block_bytes / 8 - 6) as usize
    }

    /// Stripe-hash slots in each later marker block: one header word plus
    /// the checksum.
    pub fn later_hash_slots(block_bytes: u64) -> usize {
        (block_bytes / 8 - 2) as usize
    }

    /// Number of marker blocks needed to hold hashes for `num_stripes`
    /// stripes: the smallest count whose slots fit them all.
    pub fn marker_blocks_for(num_stripes: u32, block_bytes: u64) -> u64 {
        let m0 = Self::block0_hash_slots(block_bytes) as u64;
        let mi = Self::later_hash_slots(block_bytes) as u64;

        let mut extra = 0;
        while u64::from(num_stripes) > m0 + extra * mi {
            extra += 1;
        }

        extra + 1
    }

    pub fn marker_blocks(&self) -> u64 {
        Self::marker_blocks_for(self.num_stripes, self.block_bytes())
    }

    pub fn marker_bytes(&self) -> u64 {
        self.marker_blocks() * self.block_bytes()
    }

    /// Hasher for the stripe with the given ordinal. The parity buffer is
    /// hashed with ordinal `num_stripes`.
    pub fn stripe_hasher(&self, index: u32) -> SipHasher24 {
        stripe_hasher(self.block_log2, self.date_time, index)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_log2 < MIN_BLOCK_BYTES.trailing_zeros() as u16
            || self.block_log2 >= MAX_BLOCK_LOG2
        {
            return Err(Error::InvalidBlockLog2(self.block_log2));
        } else if self.num_stripes == 0 {
            return Err(Error::InvalidNumStripes(self.num_stripes.into()));
        } else if self.first_blocks == 0 || self.first_blocks > self.stripe_blocks {
            return Err(Error::InvalidFirstBlocks(self.first_blocks));
        } else if self.stripe_blocks > self.image_blocks {
            return Err(Error::InvalidStripeBlocks(self.stripe_blocks.into()));
        }

        let expected = u64::from(self.first_blocks)
            + u64::from(self.stripe_blocks) * u64::from(self.num_stripes - 1);
        if u64::from(self.image_blocks) != expected {
            return Err(Error::InvalidNumStripes(self.num_stripes.into()));
        }

        Ok(())
    }

    /// Parse the header from the leading bytes of marker block 0. Detects the
    /// byte order from the signature and validates the geometry. Does not
    /// check the block checksum; use [`block_checksum_ok`] or
    /// [`MarkerV2::from_bytes`] for that.
    pub fn parse(block: &[u8]) -> Result<(Self, bool)> {
        if block.len() < 40 {
            return Err(Error::Truncated {
                expected: 40,
                actual: block.len(),
            });
        }

        let sig = LittleEndian::read_u32(block);
        let swapped = if sig == V2_SIG {
            false
        } else if sig == V2_SIG.swap_bytes() {
            true
        } else {
            return Err(Error::InvalidSignature(sig));
        };

        let block_log2 = read_u16(&block[4..], swapped);
        let index = read_u16(&block[6..], swapped);
        if index != 0 {
            return Err(Error::InconsistentBlock {
                index: index.into(),
            });
        }

        let header = Self {
            block_log2,
            date_time: read_u64(&block[8..], swapped),
            num_stripes: read_u32(&block[16..], swapped),
            first_blocks: read_u32(&block[20..], swapped),
            stripe_blocks: read_u32(&block[24..], swapped),
            image_blocks: read_u32(&block[28..], swapped),
            parity_hash: read_u64(&block[32..], swapped),
        };
        header.validate()?;

        Ok((header, swapped))
    }
}

/// A complete v2 marker: the geometry header plus one hash per stripe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarkerV2 {
    pub header: V2Header,
    pub stripe_hashes: Vec<u64>,
}

impl MarkerV2 {
    /// Serialise the whole marker (`marker_blocks` blocks) in canonical
    /// little-endian byte order, with every block checksum filled in.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = &self.header;
        debug_assert_eq!(self.stripe_hashes.len() as u64, u64::from(header.num_stripes));

        let block_bytes = header
            .block_bytes()
            .to_usize()
            .ok_or(Error::FieldOutOfBounds("block_bytes"))?;
        let marker_blocks = header.marker_blocks();
        if marker_blocks > u64::from(u16::MAX) {
            return Err(Error::FieldOutOfBounds("marker_blocks"));
        }

        let mut buf = vec![0u8; marker_blocks as usize * block_bytes];
        let m0 = V2Header::block0_hash_slots(block_bytes as u64);
        let mi = V2Header::later_hash_slots(block_bytes as u64);

        let mut hashes = self.stripe_hashes.iter().copied();

        for (i, block) in buf.chunks_exact_mut(block_bytes).enumerate() {
            LittleEndian::write_u32(block, V2_SIG);
            LittleEndian::write_u16(&mut block[4..], header.block_log2);
            LittleEndian::write_u16(&mut block[6..], i as u16);

            let (slots, hash_area) = if i == 0 {
                LittleEndian::write_u64(&mut block[8..], header.date_time);
                LittleEndian::write_u32(&mut block[16..], header.num_stripes);
                LittleEndian::write_u32(&mut block[20..], header.first_blocks);
                LittleEndian::write_u32(&mut block[24..], header.stripe_blocks);
                LittleEndian::write_u32(&mut block[28..], header.image_blocks);
                LittleEndian::write_u64(&mut block[32..], header.parity_hash);
                (m0, &mut block[40..])
            } else {
                (mi, &mut block[8..])
            };

            for slot in hash_area.chunks_exact_mut(8).take(slots) {
                match hashes.next() {
                    Some(hash) => LittleEndian::write_u64(slot, hash),
                    None => break,
                }
            }

            let checksum = block_checksum(&block[..block_bytes - 8]);
            LittleEndian::write_u64(&mut block[block_bytes - 8..], checksum);
        }

        Ok(buf)
    }

    /// Parse and fully validate a marker from `buf`, which must start at
    /// marker block 0 and contain at least `marker_blocks` blocks. Every
    /// block's checksum and header words are verified.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (header, swapped) = V2Header::parse(buf)?;

        let block_bytes = header
            .block_bytes()
            .to_usize()
            .ok_or(Error::FieldOutOfBounds("block_bytes"))?;
        let marker_bytes = header
            .marker_bytes()
            .to_usize()
            .ok_or(Error::FieldOutOfBounds("marker_bytes"))?;
        if buf.len() < marker_bytes {
            return Err(Error::Truncated {
                expected: marker_bytes,
                actual: buf.len(),
            });
        }

        let m0 = V2Header::block0_hash_slots(block_bytes as u64);
        let mi = V2Header::later_hash_slots(block_bytes as u64);

        let mut stripe_hashes = Vec::with_capacity(header.num_stripes as usize);

        for (i, block) in buf[..marker_bytes].chunks_exact(block_bytes).enumerate() {
            let index = i as u32;

            if i > 0 {
                let sig = LittleEndian::read_u32(block);
                let expected = if swapped { V2_SIG.swap_bytes() } else { V2_SIG };
                if sig != expected
                    || read_u16(&block[4..], swapped) != header.block_log2
                    || read_u16(&block[6..], swapped) != i as u16
                {
                    return Err(Error::InconsistentBlock { index });
                }
            }

            if !block_checksum_ok(block, swapped, i == 0) {
                return Err(Error::BlockChecksum { index });
            }

            let (slots, hash_area) = if i == 0 {
                (m0, &block[40..])
            } else {
                (mi, &block[8..])
            };
            for slot in hash_area.chunks_exact(8).take(slots) {
                if stripe_hashes.len() == header.num_stripes as usize {
                    break;
                }
                stripe_hashes.push(read_u64(slot, swapped));
            }
        }

        Ok(Self {
            header,
            stripe_hashes,
        })
    }
}

/// Rewrite a marker block into canonical little-endian byte order by
/// reversing every multi-byte field. `is_block0` selects the field layout of
/// the leading block.
fn canonicalize_block(block: &[u8], is_block0: bool) -> Vec<u8> {
    let mut out = block.to_vec();

    // Signature, block_log2, index.
    out[0..4].reverse();
    out[4..6].reverse();
    out[6..8].reverse();

    let tail = if is_block0 {
        // date_time, then the four u32 geometry fields.
        out[8..16].reverse();
        out[16..20].reverse();
        out[20..24].reverse();
        out[24..28].reverse();
        out[28..32].reverse();
        32
    } else {
        8
    };

    // Everything after the header is u64 words (hashes and the checksum).
    for word in out[tail..].chunks_exact_mut(8) {
        word.reverse();
    }

    out
}

/// Detect a v2 block's byte order from its signature word. Returns `None`
/// when neither variant of the signature is present.
pub fn v2_block_swapped(block: &[u8]) -> Option<bool> {
    if block.len() < 4 {
        return None;
    }

    match LittleEndian::read_u32(block) {
        sig if sig == V2_SIG => Some(false),
        sig if sig == V2_SIG.swap_bytes() => Some(true),
        _ => None,
    }
}

/// Check the keyed checksum in the last word of a v2 marker block. For a
/// byte-swapped marker the check runs against the canonical serialisation,
/// so an artifact whose marker fields were swapped in place still passes.
pub fn block_checksum_ok(block: &[u8], swapped: bool, is_block0: bool) -> bool {
    if block.len() < 16 {
        return false;
    }

    if swapped {
        let canonical = canonicalize_block(block, is_block0);
        let computed = block_checksum(&canonical[..canonical.len() - 8]);
        computed == LittleEndian::read_u64(&canonical[canonical.len() - 8..])
    } else {
        let computed = block_checksum(&block[..block.len() - 8]);
        computed == LittleEndian::read_u64(&block[block.len() - 8..])
    }
}

/// Scan a buffer for a v2 marker, walking backwards from the high end in
/// 64-byte strides. Returns the offset of the hit closest to the end of the
/// buffer.
pub fn find_marker_v2(buf: &[u8]) -> Option<usize> {
    let mut i = buf.len() & !63;

    while i > 0 {
        i -= 64;
        let cand = &buf[i..];

        let sig = LittleEndian::read_u32(cand);
        let swapped = if sig == V2_SIG {
            false
        } else if sig == V2_SIG.swap_bytes() {
            true
        } else {
            continue;
        };

        // The index field is zero in either byte order.
        if LittleEndian::read_u16(&cand[6..]) != 0 {
            continue;
        }

        let block_log2 = read_u16(&cand[4..], swapped);
        if !(MIN_BLOCK_BYTES.trailing_zeros() as u16..MAX_BLOCK_LOG2).contains(&block_log2) {
            continue;
        }

        let block_bytes = 1usize << block_log2;
        if block_bytes <= cand.len() && block_checksum_ok(&cand[..block_bytes], swapped, true) {
            return Some(i);
        }
    }

    None
}

/// Scan a buffer for a v1 marker record, walking backwards from the high end
/// in record-sized strides.
pub fn find_marker_v1(buf: &[u8]) -> Option<(usize, MarkerV1)> {
    let mut i = buf.len() & !(V1_RECORD_BYTES - 1);

    while i > 0 {
        i -= V1_RECORD_BYTES;

        if let Some(marker) = MarkerV1::parse_record(&buf[i..]) {
            return Some((i, marker));
        }
    }

    None
}

/// A marker located by [`scan_file_tail`], along with the raw bytes it was
/// decoded from (needed for bit-exact comparison against the on-disk copies).
#[derive(Clone, Debug)]
pub struct ScannedMarker {
    /// Absolute file offset of the hit.
    pub offset: u64,
    pub kind: ScannedKind,
}

#[derive(Clone, Debug)]
pub enum ScannedKind {
    V1 {
        marker: MarkerV1,
        record: Box<[u8; V1_RECORD_BYTES]>,
    },
    V2 {
        header: V2Header,
        /// Raw marker block 0 as it appeared in the scan buffer.
        block: Vec<u8>,
    },
}

/// Scan the trailing [`MAX_SCAN`] bytes of a file for a marker of either
/// generation. When both scanners hit, v2 wins if it sits at or after v1's
/// position. Returns `None` when the scan budget is exhausted without a hit.
pub fn scan_file_tail<R: Read + Seek>(
    reader: &mut R,
    cancel_signal: &AtomicBool,
) -> Result<Option<ScannedMarker>> {
    stream::check_cancel(cancel_signal)?;

    let file_size = reader.seek(SeekFrom::End(0))?;
    let scan_len = file_size.min(MAX_SCAN);

    // Candidate offsets must stay 64-byte aligned in file coordinates.
    let mut start = file_size - scan_len;
    if start % 64 != 0 {
        start += 64 - start % 64;
    }

    let len = (file_size - start)
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("scan_len"))?;
    if len < V1_RECORD_BYTES {
        return Ok(None);
    }

    reader.seek(SeekFrom::Start(start))?;
    let buf = reader.read_vec_exact(len)?;

    let v2_hit = find_marker_v2(&buf);
    let v1_hit = find_marker_v1(&buf);

    // v2 wins unless a v1 hit sits strictly closer to the end.
    if let Some(offset) = v2_hit {
        if v1_hit.map_or(true, |(o1, _)| offset >= o1) {
            let (header, _) = V2Header::parse(&buf[offset..])?;
            let block_bytes = header.block_bytes() as usize;

            return Ok(Some(ScannedMarker {
                offset: start + offset as u64,
                kind: ScannedKind::V2 {
                    header,
                    block: buf[offset..offset + block_bytes].to_vec(),
                },
            }));
        }
    }

    if let Some((offset, marker)) = v1_hit {
        marker.validate()?;

        let mut record = [0u8; V1_RECORD_BYTES];
        record.copy_from_slice(&buf[offset..offset + V1_RECORD_BYTES]);

        return Ok(Some(ScannedMarker {
            offset: start + offset as u64,
            kind: ScannedKind::V1 {
                marker,
                record: Box::new(record),
            },
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::atomic::AtomicBool};

    use assert_matches::assert_matches;

    use super::*;

    fn sample_v1() -> MarkerV1 {
        MarkerV1 {
            block_bytes: 2048,
            image_blocks: 1000,
            stripe_blocks: 400,
            num_stripes: 3,
            stripe_offset: 200,
        }
    }

    fn sample_v2(num_stripes: u32, block_log2: u16) -> MarkerV2 {
        let stripe_blocks = 100;
        let first_blocks = 40;
        let header = V2Header {
            block_log2,
            date_time: 0x0123456789abcdef,
            num_stripes,
            first_blocks,
            stripe_blocks,
            image_blocks: first_blocks + stripe_blocks * (num_stripes - 1),
            parity_hash: 0xfeedface,
        };

        MarkerV2 {
            header,
            stripe_hashes: (0..num_stripes).map(|i| 0x1000 + u64::from(i)).collect(),
        }
    }

    fn swap_v1_block(block: &mut [u8]) {
        for word in block.chunks_exact_mut(8) {
            word.reverse();
        }
    }

    fn swap_v2_marker(buf: &mut [u8], block_bytes: usize) {
        for (i, block) in buf.chunks_exact_mut(block_bytes).enumerate() {
            block[0..4].reverse();
            block[4..6].reverse();
            block[6..8].reverse();

            let tail = if i == 0 {
                block[8..16].reverse();
                for field in block[16..32].chunks_exact_mut(4) {
                    field.reverse();
                }
                32
            } else {
                8
            };

            for word in block[tail..].chunks_exact_mut(8) {
                word.reverse();
            }
        }
    }

    #[test]
    fn v1_record_round_trip() {
        let marker = sample_v1();
        marker.validate().unwrap();

        let record = marker.to_record();
        assert_eq!(MarkerV1::parse_record(&record), Some(marker));

        // Wrong-endian variant parses to the same fields.
        let mut swapped = record;
        swap_v1_block(&mut swapped);
        assert_eq!(MarkerV1::parse_record(&swapped), Some(marker));

        // A flipped bit breaks the checksum.
        let mut corrupt = record;
        corrupt[20] ^= 1;
        assert_eq!(MarkerV1::parse_record(&corrupt), None);
    }

    #[test]
    fn v1_block_fill() {
        let marker = sample_v1();
        let block = marker.to_block();

        assert_eq!(block.len(), 2048);
        for chunk in block.chunks_exact(V1_RECORD_BYTES) {
            assert_eq!(chunk, marker.to_record());
        }
    }

    #[test]
    fn v1_validation() {
        let mut marker = sample_v1();
        marker.block_bytes = 100;
        assert_matches!(marker.validate(), Err(Error::InvalidBlockSize(100)));

        let mut marker = sample_v1();
        marker.stripe_blocks = 1001;
        assert_matches!(marker.validate(), Err(Error::InvalidStripeBlocks(_)));

        let mut marker = sample_v1();
        marker.num_stripes = 4;
        assert_matches!(marker.validate(), Err(Error::InvalidNumStripes(4)));

        let mut marker = sample_v1();
        marker.stripe_offset = 400;
        assert_matches!(marker.validate(), Err(Error::InvalidStripeOffset(400)));
    }

    #[test]
    fn v2_round_trip_single_block() {
        let marker = sample_v2(3, 11);
        marker.header.validate().unwrap();
        assert_eq!(marker.header.marker_blocks(), 1);

        let buf = marker.to_bytes().unwrap();
        assert_eq!(buf.len(), 2048);
        assert_eq!(MarkerV2::from_bytes(&buf).unwrap(), marker);
    }

    #[test]
    fn v2_round_trip_multi_block() {
        // With 64-byte blocks, block 0 holds 2 hashes and later blocks hold
        // 6, so 9 stripes need 3 marker blocks.
        let marker = sample_v2(9, 6);
        assert_eq!(marker.header.marker_blocks(), 3);

        let buf = marker.to_bytes().unwrap();
        assert_eq!(buf.len(), 3 * 64);

        let parsed = MarkerV2::from_bytes(&buf).unwrap();
        assert_eq!(parsed, marker);
        assert_eq!(parsed.stripe_hashes.len(), 9);
    }

    #[test]
    fn v2_swapped_decodes_identically() {
        let marker = sample_v2(9, 6);
        let mut buf = marker.to_bytes().unwrap();
        swap_v2_marker(&mut buf, 64);

        assert_eq!(MarkerV2::from_bytes(&buf).unwrap(), marker);
    }

    #[test]
    fn v2_checksum_detects_corruption() {
        let marker = sample_v2(9, 6);
        let mut buf = marker.to_bytes().unwrap();
        // A bit flip in one of block 2's hash slots.
        buf[144] ^= 0x40;

        assert_matches!(
            MarkerV2::from_bytes(&buf),
            Err(Error::BlockChecksum { index: 2 })
        );
    }

    #[test]
    fn v2_marker_block_sizing() {
        // 2048-byte blocks: 250 hashes fit in block 0.
        assert_eq!(V2Header::marker_blocks_for(1, 2048), 1);
        assert_eq!(V2Header::marker_blocks_for(250, 2048), 1);
        assert_eq!(V2Header::marker_blocks_for(251, 2048), 2);
        assert_eq!(V2Header::marker_blocks_for(250 + 254, 2048), 2);
        assert_eq!(V2Header::marker_blocks_for(250 + 255, 2048), 3);

        // 64-byte blocks: 2 in block 0, 6 per later block.
        assert_eq!(V2Header::marker_blocks_for(2, 64), 1);
        assert_eq!(V2Header::marker_blocks_for(8, 64), 2);
        assert_eq!(V2Header::marker_blocks_for(9, 64), 3);
    }

    #[test]
    fn scanner_finds_markers() {
        let marker = sample_v2(3, 11);
        let block = marker.to_bytes().unwrap();

        let mut buf = vec![0u8; 3 * 2048];
        buf[2048..4096].copy_from_slice(&block);

        assert_eq!(find_marker_v2(&buf), Some(2048));
        assert_eq!(find_marker_v1(&buf), None);

        let v1_block = sample_v1().to_block();
        buf[..2048].copy_from_slice(&v1_block);
        // The v1 scanner reports the record closest to the end of the buffer.
        assert_eq!(find_marker_v1(&buf), Some((2048 - 64, sample_v1())));
    }

    #[test]
    fn scanner_rejects_noise() {
        let mut buf = vec![0u8; 4096];
        // A signature with a bad checksum must not match.
        LittleEndian::write_u32(&mut buf[1024..], V2_SIG);
        LittleEndian::write_u16(&mut buf[1028..], 11);
        assert_eq!(find_marker_v2(&buf), None);

        LittleEndian::write_u64(&mut buf[2048..], V1_SIG1);
        LittleEndian::write_u64(&mut buf[2056..], V1_SIG2);
        assert_eq!(find_marker_v1(&buf), None);
    }

    #[test]
    fn tail_scan_prefers_v2() {
        let cancel_signal = AtomicBool::new(false);

        let v2 = sample_v2(3, 11);
        let v1 = sample_v1();

        let mut file = vec![0u8; 6 * 2048];
        let v1_block = v1.to_block();
        file[2048..4096].copy_from_slice(&v1_block);
        let v2_block = v2.to_bytes().unwrap();
        file[4096..6144].copy_from_slice(&v2_block);

        let mut reader = Cursor::new(file);
        let hit = scan_file_tail(&mut reader, &cancel_signal)
            .unwrap()
            .expect("Marker not found");

        assert_eq!(hit.offset, 4096);
        assert_matches!(hit.kind, ScannedKind::V2 { header, .. } if header == v2.header);
    }

    #[test]
    fn tail_scan_finds_v1() {
        let cancel_signal = AtomicBool::new(false);

        let v1 = sample_v1();
        let mut file = vec![0u8; 4 * 2048];
        let v1_block = v1.to_block();
        file[4096..6144].copy_from_slice(&v1_block);

        let mut reader = Cursor::new(file);
        let hit = scan_file_tail(&mut reader, &cancel_signal)
            .unwrap()
            .expect("Marker not found");

        // Record hits report the copy closest to the end of the block.
        assert_eq!(hit.offset, 6144 - 64);
        assert_matches!(hit.kind, ScannedKind::V1 { marker, .. } if marker == v1);
    }

    #[test]
    fn tail_scan_empty() {
        let cancel_signal = AtomicBool::new(false);
        let mut reader = Cursor::new(vec![0u8; 65536]);

        assert_matches!(scan_file_tail(&mut reader, &cancel_signal), Ok(None));
    }
}
