/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! cdrparity is primarily a set of command line tools and not a library.
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic so that the test
//! suite can run entirely against in-memory images.

pub mod add;
pub mod cli;
pub mod format;
pub mod repair;
pub mod rescue;
pub mod stream;
pub mod util;
pub mod verify;
