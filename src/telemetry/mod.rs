// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! Logging and metrics wiring.
//!
//! Tracing goes to stderr with an env-filter (`RUST_LOG`); when a log file
//! is configured, a second JSON-formatted layer writes there. Metrics use
//! the `metrics` facade only - attaching an exporter is the embedder's
//! choice.

mod metrics;

pub use metrics::*;

use std::fs::OpenOptions;
use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global tracing subscriber. Call once at startup.
pub fn init(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(file)
                    .boxed(),
            ),
            Err(err) => {
                eprintln!("could not open log file {}: {err}", path.display());
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    init_metrics();
}
