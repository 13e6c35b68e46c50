/*
 * SPDX-FileCopyrightText: 2024 cdrparity contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use tracing::error;

use cdrparity::cli::{self, add::AddCli};

fn main() -> ExitCode {
    cli::init_logging();

    // Set up a cancel signal so interrupted runs stop at a clean point.
    let cancel_signal = Arc::new(AtomicBool::new(false));
    {
        let signal = cancel_signal.clone();

        ctrlc::set_handler(move || {
            signal.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set signal handler");
    }

    let args = AddCli::parse();

    match cli::add::add_main(&args, &cancel_signal) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}
