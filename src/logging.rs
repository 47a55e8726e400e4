// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Logging setup built on `tracing`.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize logging from a `LoggingConfig`, honoring `RUST_LOG` if set.
pub fn init(config: &LoggingConfig) {
    match (&config.file, config.json) {
        (Some(path), _) => init_with_file(&config.level, path, config.json),
        (None, true) => init_json(&config.level),
        (None, false) => init_with_level(&config.level),
    }
}

/// Initialize console-only logging at the given level.
pub fn init_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .compact(),
        )
        .init();
}

/// Initialize console-only logging with structured JSON output.
pub fn init_json(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true))
        .init();
}

/// Initialize logging with both a console layer and a file layer.
pub fn init_with_file(level: &str, log_file: &Path, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if let Some(parent) = log_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file);

    let file = match file {
        Ok(file) => file,
        Err(_) => return init_with_level(level),
    };

    if json {
        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .json();
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .with(file_layer)
            .init();
    } else {
        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .with(file_layer)
            .init();
    }
}

/// Re-exported macros for convenience elsewhere in the crate.
pub use tracing::{debug, error, info, trace, warn};

#[macro_export]
macro_rules! span_transfer {
    ($path:expr) => {
        tracing::info_span!("transfer", path = %$path)
    };
}

#[macro_export]
macro_rules! span_segment {
    ($id:expr, $mirror:expr) => {
        tracing::info_span!("segment", id = $id, mirror = %$mirror)
    };
}
