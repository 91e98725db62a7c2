//! TOML configuration.
//!
//! A config file captures every input of a run so `run` never prompts:
//!
//! ```toml
//! [polygons]
//! path = "parcels.gpkg"
//! name_field = "name"
//!
//! [tiles]
//! roots = ["/data/lidar"]
//!
//! [tindex]
//! path = "work/tindex.gpkg"
//!
//! [output]
//! dir = "clips"
//! ```
//!
//! Relative paths are used as written (relative to the working directory).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::BoundaryMode;
use crate::naming::NamingOptions;
use crate::tiles::{self, DiscoveryOptions};
use crate::tindex;

pub const DEFAULT_CONFIG_PATH: &str = "las_dice.toml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub polygons: PolygonsConfig,
    pub tiles: TilesConfig,
    pub tindex: TindexConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PolygonsConfig {
    pub path: PathBuf,
    /// Required when the GeoPackage holds more than one feature layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    pub name_field: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TilesConfig {
    pub roots: Vec<PathBuf>,
    #[serde(default = "tiles::default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl TilesConfig {
    pub fn discovery(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            include_globs: self.include_globs.clone(),
            exclude_globs: self.exclude_globs.clone(),
            follow_symlinks: self.follow_symlinks,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TindexConfig {
    pub path: PathBuf,
    #[serde(default = "default_layer")]
    pub layer: String,
    #[serde(default)]
    pub boundary: BoundaryMode,
}

fn default_layer() -> String {
    tindex::DEFAULT_LAYER.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutputConfig {
    pub dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_extension() -> String {
    "laz".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunConfig {
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub fail_on_job_error: bool,
    /// `.csv` selects CSV; anything else is JSON Lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            overwrite: false,
            concurrency: default_concurrency(),
            fail_on_job_error: false,
            report: None,
        }
    }
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Config {
    pub fn naming(&self) -> NamingOptions {
        NamingOptions {
            field: self.polygons.name_field.clone(),
            suffix: self.output.suffix.clone(),
            extension: self.output.extension.clone(),
        }
    }

    /// Check the invariants `load_config` enforces.
    pub fn validate(&self) -> Result<()> {
        if self.polygons.name_field.trim().is_empty() {
            bail!("polygons.name_field must not be empty");
        }

        if self.tiles.roots.is_empty() {
            bail!("tiles.roots must list at least one directory");
        }

        if self.run.concurrency == 0 {
            bail!("run.concurrency must be >= 1");
        }

        if self.tindex.layer.trim().is_empty() {
            bail!("tindex.layer must not be empty");
        }

        match self.output.extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "las" | "laz" => {}
            other => bail!("Unknown output extension: '{}'. Must be las or laz.", other),
        }

        if self.tindex.path == self.polygons.path {
            bail!(
                "tindex.path must differ from polygons.path ({}); the tile index is never written into the polygon source",
                self.polygons.path.display()
            );
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.output.extension = config
        .output
        .extension
        .trim_start_matches('.')
        .to_ascii_lowercase();
    config.validate()?;

    Ok(config)
}

/// Write `config` as TOML. Refuses to replace an existing file unless `force`.
pub fn save_config(config: &Config, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Config file already exists: {} (pass --force to overwrite)",
            path.display()
        );
    }
    config.validate()?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
[polygons]
path = "parcels.gpkg"
name_field = "name"

[tiles]
roots = ["tiles"]

[tindex]
path = "tindex.gpkg"

[output]
dir = "clips"
"#;

    fn write(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("las_dice.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&write(&tmp, MINIMAL)).unwrap();
        assert_eq!(config.tindex.layer, "las_tiles");
        assert_eq!(config.tindex.boundary, BoundaryMode::Fast);
        assert_eq!(config.output.extension, "laz");
        assert!(config.run.concurrency >= 1);
        assert!(!config.run.overwrite);
        assert_eq!(config.tiles.include_globs, vec!["**/*.las", "**/*.laz"]);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let tmp = TempDir::new().unwrap();
        let content = format!("{}\n[run]\nconcurrency = 0\n", MINIMAL);
        let err = load_config(&write(&tmp, &content)).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn rejects_unknown_extension() {
        let tmp = TempDir::new().unwrap();
        let content = MINIMAL.replace("dir = \"clips\"", "dir = \"clips\"\nextension = \"e57\"");
        let err = load_config(&write(&tmp, &content)).unwrap_err();
        assert!(err.to_string().contains("e57"));
    }

    #[test]
    fn rejects_index_inside_polygon_source() {
        let tmp = TempDir::new().unwrap();
        let content = MINIMAL.replace("path = \"tindex.gpkg\"", "path = \"parcels.gpkg\"");
        let err = load_config(&write(&tmp, &content)).unwrap_err();
        assert!(err.to_string().contains("tindex.path"));
    }

    #[test]
    fn extension_is_normalized() {
        let tmp = TempDir::new().unwrap();
        let content = MINIMAL.replace("dir = \"clips\"", "dir = \"clips\"\nextension = \".LAS\"");
        let config = load_config(&write(&tmp, &content)).unwrap();
        assert_eq!(config.output.extension, "las");
    }

    #[test]
    fn save_then_load_preserves_values() {
        let tmp = TempDir::new().unwrap();
        let src = write(&tmp, MINIMAL);
        let mut config = load_config(&src).unwrap();
        config.output.suffix = Some("2024".into());
        config.tindex.boundary = BoundaryMode::Exact;

        let saved = tmp.path().join("out/saved.toml");
        save_config(&config, &saved, false).unwrap();
        let reloaded = load_config(&saved).unwrap();
        assert_eq!(reloaded.output.suffix.as_deref(), Some("2024"));
        assert_eq!(reloaded.tindex.boundary, BoundaryMode::Exact);

        assert!(save_config(&config, &saved, false).is_err());
        save_config(&config, &saved, true).unwrap();
    }
}
