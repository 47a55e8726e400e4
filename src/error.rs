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

//! Hierarchical error types with recovery strategies for the transfer pipeline.

use thiserror::Error;

/// Top-level error type for every fetch operation.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The artifact does not exist at any mirror.
    #[error("not found: {url}")]
    NotFound { url: String },

    /// `expected_size` disagreed with the size reported by HEAD.
    #[error("size mismatch for {url}: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },

    /// Measured crc32c did not match the expected digest.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// A 4xx response other than 404/416, or an adapter protocol violation.
    #[error("permanent error for {url}: {message}")]
    Permanent { url: String, message: String },

    /// Timeout, 5xx, connection reset, or a partial body. Retried by rotating mirrors.
    #[error("transient error for {url}: {message}")]
    Transient { url: String, message: String },

    /// Retry budget across mirror rotations was exhausted while the caller was waiting.
    #[error("transfer interrupted for {path}: {recent_errors:?}")]
    TransferInterrupted {
        path: String,
        recent_errors: Vec<String>,
    },

    /// The transfer was cancelled while the caller was waiting on it.
    #[error("transfer cancelled: {path}")]
    Cancelled { path: String },

    /// The caller's deadline expired before the transfer reached a terminal state.
    /// The transfer itself keeps running in the background.
    #[error("timed out waiting for {path}")]
    TimedOut { path: String },

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Sidecar status file could not be parsed or written.
    #[error("sidecar error for {path}: {message}")]
    Sidecar { path: String, message: String },

    /// I/O failure on the destination file or sidecar.
    #[error("I/O error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// No adapter recognizes this URL scheme.
    #[error("no adapter for url: {0}")]
    UnsupportedUrl(String),
}

/// Recommended recovery strategy for an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Retry by rotating mirrors; there is no fixed backoff, mirror cooldown governs it.
    RetryOtherMirror,
    /// Nothing left to try; the whole transfer must fail.
    Abort,
}

impl FetchError {
    /// The recovery strategy a `Client`/`Transfer` should apply for this error.
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            FetchError::Transient { .. } => RecoveryStrategy::RetryOtherMirror,
            _ => RecoveryStrategy::Abort,
        }
    }

    /// Whether this error should be retried against another mirror.
    pub fn is_retryable(&self) -> bool {
        matches!(self.recovery_strategy(), RecoveryStrategy::RetryOtherMirror)
    }

    /// Whether this error is permanent for the whole transfer (not just one range).
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            FetchError::NotFound { .. }
                | FetchError::SizeMismatch { .. }
                | FetchError::ChecksumMismatch { .. }
                | FetchError::Permanent { .. }
                | FetchError::UnsupportedUrl(_)
        )
    }
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;
