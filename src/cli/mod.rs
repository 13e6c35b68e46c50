/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod add;
pub mod repair;
pub mod rescue;
pub mod verify;

macro_rules! status {
    ($($arg:tt)*) => {
        println!("\x1b[1m[*] {}\x1b[0m", format!($($arg)*))
    }
}

macro_rules! warning {
    ($($arg:tt)*) => {
        println!("\x1b[1;31m[WARNING] {}\x1b[0m", format!($($arg)+))
    }
}

pub(crate) use status;
pub(crate) use warning;

/// Initialise logging for a CLI process. The filter defaults to warnings and
/// can be overridden with `RUST_LOG`.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Parse a size argument with an optional case-insensitive `k` (KiB) or `m`
/// (MiB) suffix. A bare number is bytes.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let (digits, multiplier) = match s.as_bytes().last() {
        Some(&b'k') | Some(&b'K') => (&s[..s.len() - 1], 1024),
        Some(&b'm') | Some(&b'M') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("Invalid size: {s:?}"))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("Size too large: {s:?}"))
}
