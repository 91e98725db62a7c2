//! Clip execution: filter the points of the matched tiles by a polygon.
//!
//! The output header (version, point format, scale/offset, VLRs and EVLRs)
//! is taken from the first source tile, so the output declares the same CRS
//! as its inputs. Compression follows the output extension.
//!
//! Output is written to a hidden sibling (`.<name>.partial.<ext>`) and
//! renamed into place only after the writer has been closed, so a failed
//! or interrupted job never leaves a truncated file at the target path.

use geo::{BoundingRect, Coord, Intersects, MultiPolygon, Rect};
use std::path::{Path, PathBuf};

use crate::crs::Crs;
use crate::error::JobError;
use crate::tiles;

/// Clips a set of tiles against one polygon into one output file.
pub trait ClipExecutor: Send + Sync {
    /// Returns the number of points written. Zero points is
    /// [`JobError::EmptyClip`] and leaves no file behind.
    fn clip(&self, tiles: &[PathBuf], polygon: &MultiPolygon<f64>, output: &Path) -> Result<u64, JobError>;
}

/// [`ClipExecutor`] backed by the `las` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LasClipExecutor;

fn failure(detail: impl Into<String>) -> JobError {
    JobError::ClipExecutionFailure {
        detail: detail.into(),
    }
}

/// Hidden sibling path that keeps the output extension.
pub fn partial_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let ext = output
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "las".to_string());
    output.with_file_name(format!(".{}.partial.{}", name, ext))
}

fn is_compressed(output: &Path) -> bool {
    output
        .extension()
        .map(|e| e.eq_ignore_ascii_case("laz"))
        .unwrap_or(false)
}

/// Output header derived from the first tile.
fn output_header(source: &las::Header, compressed: bool) -> Result<las::Header, JobError> {
    let mut builder = las::Builder::from(source.version());
    builder.point_format = *source.point_format();
    builder.point_format.is_compressed = compressed;
    builder.transforms = *source.transforms();
    builder.vlrs = source.vlrs().clone();
    builder.evlrs = source.evlrs().clone();
    Ok(builder.into_header()?)
}

/// Inclusive point-in-polygon test with an envelope short-circuit.
struct PointFilter<'a> {
    polygon: &'a MultiPolygon<f64>,
    envelope: Rect<f64>,
}

impl<'a> PointFilter<'a> {
    fn new(polygon: &'a MultiPolygon<f64>) -> Option<Self> {
        polygon
            .bounding_rect()
            .map(|envelope| Self { polygon, envelope })
    }

    fn keeps(&self, c: Coord<f64>) -> bool {
        let min = self.envelope.min();
        let max = self.envelope.max();
        if c.x < min.x || c.x > max.x || c.y < min.y || c.y > max.y {
            return false;
        }
        // Boundary points are kept.
        self.polygon.intersects(&c)
    }

    fn overlaps(&self, bounds: &Rect<f64>) -> bool {
        !(bounds.max().x < self.envelope.min().x
            || bounds.min().x > self.envelope.max().x
            || bounds.max().y < self.envelope.min().y
            || bounds.min().y > self.envelope.max().y)
    }
}

impl LasClipExecutor {
    /// Checks every tile's CRS from its header first, then streams the
    /// tiles one reader at a time.
    fn write_clip(
        &self,
        tiles: &[PathBuf],
        filter: &PointFilter<'_>,
        partial: &Path,
        output: &Path,
    ) -> Result<u64, JobError> {
        let mut headers = Vec::with_capacity(tiles.len());
        for tile in tiles {
            let header = tiles::read_header(tile)
                .map_err(|e| failure(format!("{}: {:#}", tile.display(), e)))?;
            headers.push(header);
        }

        let first = &headers[0];
        for other in &headers[1..] {
            if other.crs != first.crs {
                return Err(failure(format!(
                    "{} declares {} but {} declares {}",
                    first.path.display(),
                    describe(first.crs.as_ref()),
                    other.path.display(),
                    describe(other.crs.as_ref()),
                )));
            }
        }

        let template = las::Reader::from_path(&first.path)
            .map_err(|e| failure(format!("{}: {}", first.path.display(), e)))?
            .header()
            .clone();
        let header = output_header(&template, is_compressed(output))?;
        let mut writer = las::Writer::from_path(partial, header)?;
        let mut written = 0u64;

        for tile in headers.iter().filter(|h| filter.overlaps(&h.bounds)) {
            let mut reader = las::Reader::from_path(&tile.path)
                .map_err(|e| failure(format!("{}: {}", tile.path.display(), e)))?;
            for point in reader.points() {
                let point = point.map_err(|e| failure(format!("{}: {}", tile.path.display(), e)))?;
                if filter.keeps(Coord {
                    x: point.x,
                    y: point.y,
                }) {
                    writer.write_point(point)?;
                    written += 1;
                }
            }
        }
        writer.close()?;
        Ok(written)
    }
}

fn describe(crs: Option<&Crs>) -> String {
    crs.map(|c| c.to_string()).unwrap_or_else(|| "no CRS".into())
}

impl ClipExecutor for LasClipExecutor {
    fn clip(&self, tiles: &[PathBuf], polygon: &MultiPolygon<f64>, output: &Path) -> Result<u64, JobError> {
        if tiles.is_empty() {
            return Err(failure("no source tiles"));
        }
        let filter = PointFilter::new(polygon).ok_or(JobError::EmptyClip)?;

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let partial = partial_path(output);

        match self.write_clip(tiles, &filter, &partial, output) {
            Ok(0) => {
                let _ = std::fs::remove_file(&partial);
                Err(JobError::EmptyClip)
            }
            Ok(count) => {
                std::fs::rename(&partial, output).map_err(|e| {
                    let _ = std::fs::remove_file(&partial);
                    failure(format!("rename into {}: {}", output.display(), e))
                })?;
                tracing::debug!(output = %output.display(), points = count, "clip written");
                Ok(count)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                Err(e)
            }
        }
    }
}
