/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io::{self, Read, Write},
    sync::atomic::{AtomicBool, Ordering},
};

/// Individual write syscalls are capped at this size. Some systems refuse or
/// short-write larger requests; the split does not change the byte layout.
pub const MAX_WRITE_SIZE: usize = 1024 * 1024 * 1024;

// Covers padding and placeholder writes for the common block sizes in one
// write call.
const ZERO_BLOCK: [u8; 4096] = [0u8; 4096];

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    /// Read fixed-size array.
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    /// Read fixed-sized [`Vec`].
    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Extensions for readers to fill as much of a buffer as possible.
pub trait ReadFillExt {
    /// Read until `buf` is full or EOF is reached, returning the number of
    /// bytes read. Unlike [`Read::read_exact`], a short result is not an
    /// error and the unread tail of `buf` is left untouched.
    fn read_fill(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<R: Read> ReadFillExt for R {
    fn read_fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;

        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }

            filled += n;
        }

        Ok(filled)
    }
}

/// Extensions for writers to emit runs of zeros (padding, placeholder
/// blocks).
pub trait WriteZerosExt {
    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()>;
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros_exact(&mut self, mut size: u64) -> io::Result<()> {
        while size > 0 {
            let to_write = size.min(ZERO_BLOCK.len() as u64) as usize;
            self.write_all(&ZERO_BLOCK[..to_write])?;
            size -= to_write as u64;
        }

        Ok(())
    }
}

/// Write `buf` in chunks no larger than [`MAX_WRITE_SIZE`], checking for
/// cancellation between chunks.
pub fn write_all_chunked(
    mut writer: impl Write,
    buf: &[u8],
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    for chunk in buf.chunks(MAX_WRITE_SIZE) {
        check_cancel(cancel_signal)?;

        writer.write_all(chunk)?;
    }

    Ok(())
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in I/O loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}
