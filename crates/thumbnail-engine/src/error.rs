//! Failure classification for thumbnail production.

use thiserror::Error;

/// Why a thumbnail could not be produced for a path.
///
/// These never escape the service as errors — every failure is reduced to an
/// empty result, and the classification is kept for logging, diagnostics,
/// and failure short-circuiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    /// Path did not exist at stat time.
    #[error("file not found")]
    NotFound,
    /// Path exists but could not be read (permissions, I/O).
    #[error("file exists but is not readable")]
    Unreadable,
    /// Zero-byte file.
    #[error("file is empty")]
    Empty,
    /// Both decode strategies rejected the content, or the format is
    /// handled by a different collaborator (video).
    #[error("unsupported format or corrupt content")]
    Unsupported,
    /// Decoder reported non-positive dimensions.
    #[error("decoded image has invalid dimensions")]
    DimensionInvalid,
    /// Wall-clock decode budget was exhausted between stages.
    #[error("decode budget exhausted")]
    Timeout,
}

impl DecodeFailure {
    /// Short stable label used in statistics and diagnostic reports.
    pub fn label(&self) -> &'static str {
        match self {
            DecodeFailure::NotFound => "not_found",
            DecodeFailure::Unreadable => "unreadable",
            DecodeFailure::Empty => "empty",
            DecodeFailure::Unsupported => "unsupported",
            DecodeFailure::DimensionInvalid => "dimension_invalid",
            DecodeFailure::Timeout => "timeout",
        }
    }
}
