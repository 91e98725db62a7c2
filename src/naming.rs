//! Output file naming.
//!
//! Each polygon's output file is named after one of its attribute values:
//! `<output_dir>/<sanitized value>[_<suffix>].<extension>`.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::JobError;
use crate::models::{AttributeValue, PolygonFeature};

/// Used when a value sanitizes down to nothing (e.g. `"///"`).
const FALLBACK_STEM: &str = "unnamed";

#[derive(Debug, Clone)]
pub struct NamingOptions {
    pub field: String,
    pub suffix: Option<String>,
    /// Without the leading dot: `las` or `laz`.
    pub extension: String,
}

fn unsafe_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("static regex"))
}

/// Reduce a value to a filesystem-safe stem.
///
/// Runs of characters outside `[A-Za-z0-9_-]` collapse to a single `_`,
/// and leading/trailing underscores are trimmed.
pub fn sanitize(value: &str) -> String {
    let replaced = unsafe_run().replace_all(value.trim(), "_");
    let trimmed = replaced.trim_matches('_');
    if trimmed.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        trimmed.to_string()
    }
}

/// File name (not path) for a feature.
pub fn file_name(feature: &PolygonFeature, options: &NamingOptions) -> Result<String, JobError> {
    let missing = || JobError::MissingNamingValue {
        field: options.field.clone(),
    };
    let raw = match feature.attribute(&options.field) {
        None | Some(AttributeValue::Null) => return Err(missing()),
        Some(AttributeValue::Text(s)) if s.trim().is_empty() => return Err(missing()),
        Some(value) => value.to_string(),
    };

    let mut stem = sanitize(&raw);
    if let Some(suffix) = options.suffix.as_deref().filter(|s| !s.is_empty()) {
        stem.push('_');
        stem.push_str(&sanitize(suffix));
    }
    Ok(format!("{}.{}", stem, options.extension.trim_start_matches('.')))
}

/// Full output path for a feature.
pub fn output_path(
    feature: &PolygonFeature,
    output_dir: &Path,
    options: &NamingOptions,
) -> Result<PathBuf, JobError> {
    Ok(output_dir.join(file_name(feature, options)?))
}
