//! Error taxonomy for the clip pipeline.
//!
//! Two families of errors exist:
//!
//! | Family | Type | Effect |
//! |--------|------|--------|
//! | Fatal | [`DiceError`] | aborts the run before any output is produced or modified |
//! | Per-job | [`JobError`] | recorded in the [`BatchReport`](crate::models::BatchReport); sibling jobs continue |
//!
//! Fatal errors travel through `anyhow::Result` like every other error in
//! the crate. Callers that need to branch on the condition use
//! `err.downcast_ref::<DiceError>()`.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal preconditions. Any of these stops the pipeline.
#[derive(Debug, Error)]
pub enum DiceError {
    /// A polygon source or tile declares no coordinate reference system.
    #[error("UndefinedCRS: {origin} has no defined coordinate reference system")]
    UndefinedCrs { origin: PathBuf },

    /// Two inputs declare different coordinate reference systems.
    #[error(
        "MixedCRS: {first} is {first_crs} but {second} is {second_crs}; \
         align inputs before clipping (no reprojection is performed)"
    )]
    MixedCrs {
        first: PathBuf,
        first_crs: String,
        second: PathBuf,
        second_crs: String,
    },

    /// The tile index would be written into the polygon source container.
    #[error(
        "UnsafeIndexLocation: tile index {index} is the polygon source; \
         write the index to a different file"
    )]
    UnsafeIndexLocation { index: PathBuf },

    /// The index layer exists and overwrite was not requested.
    #[error("IndexExists: layer '{layer}' already exists in {path}; pass --overwrite to replace it")]
    IndexExists { path: PathBuf, layer: String },

    #[error("IndexNotFound: no layer '{layer}' in {path}")]
    IndexNotFound { path: PathBuf, layer: String },

    #[error("IndexUnreadable: {path}: {reason}")]
    IndexUnreadable { path: PathBuf, reason: String },

    /// The index holds no records, so no polygon could ever match.
    #[error("EmptyIndex: layer '{layer}' in {path} contains no tiles")]
    EmptyIndex { path: PathBuf, layer: String },

    /// Two polygons would write the same output file.
    #[error(
        "DuplicateOutputPath: features {first_fid} and {second_fid} both map to {path}; \
         choose a naming field with unique values"
    )]
    DuplicateOutputPath {
        path: PathBuf,
        first_fid: i64,
        second_fid: i64,
    },

    /// A tile met during index build disagrees with the governing CRS.
    #[error("InconsistentCRS: {path} is {found}, expected governing CRS {expected}")]
    InconsistentCrs {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("no LAS/LAZ tiles found under {}", roots.iter().map(|r| r.display().to_string()).collect::<Vec<_>>().join(", "))]
    NoTilesFound { roots: Vec<PathBuf> },

    #[error("polygon source {path}: {reason}")]
    PolygonSource { path: PathBuf, reason: String },
}

/// Recoverable failures attributed to a single polygon.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("MissingNamingValue: field '{field}' is null or empty")]
    MissingNamingValue { field: String },

    #[error("ClipExecutionFailure: {detail}")]
    ClipExecutionFailure { detail: String },

    /// The polygon matched tiles but no point fell inside it.
    #[error("EmptyClip: no points inside polygon")]
    EmptyClip,
}

impl JobError {
    /// Stable identifier used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::MissingNamingValue { .. } => "MissingNamingValue",
            JobError::ClipExecutionFailure { .. } => "ClipExecutionFailure",
            JobError::EmptyClip => "EmptyClip",
        }
    }
}

impl From<las::Error> for JobError {
    fn from(err: las::Error) -> Self {
        JobError::ClipExecutionFailure {
            detail: err.to_string(),
        }
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::ClipExecutionFailure {
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_crs_names_both_sides() {
        let err = DiceError::MixedCrs {
            first: PathBuf::from("a.las"),
            first_crs: "EPSG:2056".into(),
            second: PathBuf::from("b.las"),
            second_crs: "EPSG:21781".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("MixedCRS"));
        assert!(msg.contains("a.las") && msg.contains("EPSG:2056"));
        assert!(msg.contains("b.las") && msg.contains("EPSG:21781"));
    }

    #[test]
    fn job_error_kinds() {
        assert_eq!(
            JobError::MissingNamingValue { field: "name".into() }.kind(),
            "MissingNamingValue"
        );
        assert_eq!(JobError::EmptyClip.kind(), "EmptyClip");
    }
}
