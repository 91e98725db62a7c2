//! Coordinate reference system handling and the CRS validator.
//!
//! Every run is governed by exactly one CRS, taken from the polygon source.
//! All point-cloud tiles must declare the same CRS; any disagreement is fatal
//! and nothing is ever reprojected.
//!
//! Tile CRSs are read from the LAS header records only (no point decoding):
//!
//! | VLR | Record id | Interpretation |
//! |-----|-----------|----------------|
//! | `LASF_Projection` | 2112 | OGC WKT |
//! | `LASF_Projection` | 34735 | GeoTIFF GeoKeyDirectory |
//!
//! The WKT record wins when both are present.

use anyhow::Result;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::DiceError;
use crate::polygons;
use crate::tiles::{self, DiscoveryOptions, TileWarning};

const PROJECTION_USER_ID: &str = "LASF_Projection";
const WKT_RECORD_ID: u16 = 2112;
const GEOKEY_RECORD_ID: u16 = 34735;

const GT_MODEL_TYPE_KEY: u16 = 1024;
const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;
const USER_DEFINED: u16 = 32767;

/// A coordinate reference system as declared by a data source.
#[derive(Debug, Clone)]
pub enum Crs {
    Epsg(u32),
    /// WKT without a resolvable EPSG authority.
    Wkt(String),
}

impl Crs {
    /// Parse a WKT definition, resolving it to an EPSG code when the
    /// top-level authority names one. Returns `None` for blank input.
    pub fn from_wkt(wkt: &str) -> Option<Crs> {
        let wkt = wkt.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if wkt.is_empty() || wkt.eq_ignore_ascii_case("undefined") {
            return None;
        }
        match top_level_epsg(wkt) {
            Some(code) => Some(Crs::Epsg(code)),
            None => Some(Crs::Wkt(wkt.to_string())),
        }
    }

    pub fn epsg(&self) -> Option<u32> {
        match self {
            Crs::Epsg(code) => Some(*code),
            Crs::Wkt(_) => None,
        }
    }

    /// Normalized comparison key.
    pub fn key(&self) -> String {
        match self {
            Crs::Epsg(code) => format!("EPSG:{}", code),
            Crs::Wkt(wkt) => wkt.split_whitespace().collect::<Vec<_>>().join(" "),
        }
    }
}

impl PartialEq for Crs {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Crs {}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for Crs {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let code = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        if let Ok(code) = code.parse::<u32>() {
            return Ok(Crs::Epsg(code));
        }
        Crs::from_wkt(trimmed).ok_or_else(|| anyhow::anyhow!("empty CRS definition"))
    }
}

fn authority_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:AUTHORITY|ID)\[\s*"EPSG"\s*,\s*"?(\d+)"?\s*\]"#)
            .expect("static regex")
    })
}

/// Keyword of the outermost WKT node and the slices of its direct child
/// nodes (`KEYWORD[...]`), in order. Quoted text is skipped.
fn wkt_children(wkt: &str) -> Option<(&str, Vec<&str>)> {
    let open = wkt.find(['[', '('])?;
    let keyword = wkt[..open].trim();
    let mut children = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut token_start = open + 1;
    let mut child_start = None;

    for (i, c) in wkt.char_indices().skip_while(|(i, _)| *i < open) {
        if in_quote {
            if c == '"' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '"' => in_quote = true,
            '[' | '(' => {
                depth += 1;
                if depth == 2 {
                    child_start = Some(token_start);
                }
            }
            ']' | ')' => {
                if depth == 2 {
                    if let Some(start) = child_start.take() {
                        children.push(wkt[start..=i].trim());
                    }
                }
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            }
            ',' if depth == 1 => token_start = i + 1,
            _ => {}
        }
    }
    Some((keyword, children))
}

fn is_authority(node: &str) -> bool {
    let keyword = node.split(['[', '(']).next().unwrap_or("").trim();
    keyword.eq_ignore_ascii_case("AUTHORITY") || keyword.eq_ignore_ascii_case("ID")
}

/// EPSG code of the outermost CRS node, read only from its own
/// `AUTHORITY`/`ID` child. Compound CRSs resolve to their horizontal
/// (first) component.
fn top_level_epsg(wkt: &str) -> Option<u32> {
    let (keyword, children) = wkt_children(wkt)?;

    if keyword.eq_ignore_ascii_case("COMPD_CS") || keyword.eq_ignore_ascii_case("COMPOUNDCRS") {
        return children
            .iter()
            .find(|node| !is_authority(node))
            .and_then(|horizontal| top_level_epsg(horizontal));
    }

    children
        .iter()
        .filter(|node| is_authority(node))
        .find_map(|node| authority_regex().captures(node))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Resolve the CRS declared by a set of LAS VLRs/EVLRs.
pub fn crs_from_vlrs<'a, I>(vlrs: I) -> Option<Crs>
where
    I: IntoIterator<Item = &'a las::Vlr>,
{
    let mut geokeys = None;
    for vlr in vlrs {
        if vlr.user_id.trim_end_matches('\0') != PROJECTION_USER_ID {
            continue;
        }
        match vlr.record_id {
            WKT_RECORD_ID => {
                let text = String::from_utf8_lossy(&vlr.data);
                if let Some(crs) = Crs::from_wkt(&text) {
                    return Some(crs);
                }
            }
            GEOKEY_RECORD_ID => geokeys = epsg_from_geokeys(&vlr.data).map(Crs::Epsg),
            _ => {}
        }
    }
    geokeys
}

/// Read the horizontal EPSG code out of a GeoKeyDirectoryTag payload.
fn epsg_from_geokeys(data: &[u8]) -> Option<u32> {
    let shorts: Vec<u16> = data
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    if shorts.len() < 4 {
        return None;
    }
    let key_count = shorts[3] as usize;
    let mut projected = None;
    let mut geographic = None;
    for entry in shorts[4..].chunks_exact(4).take(key_count) {
        let (key, location, value) = (entry[0], entry[1], entry[3]);
        // Location 0 means the value is stored inline.
        if location != 0 || value == 0 || value == USER_DEFINED {
            continue;
        }
        match key {
            PROJECTED_CS_TYPE_KEY => projected = Some(value as u32),
            GEOGRAPHIC_TYPE_KEY => geographic = Some(value as u32),
            _ => {}
        }
    }
    projected.or(geographic)
}

/// Build a GeoKeyDirectory VLR declaring `epsg`.
///
/// Codes in the 4000 range are written as geographic, everything else as
/// projected.
pub fn geokey_vlr(epsg: u16) -> las::Vlr {
    let geographic = (4000..5000).contains(&epsg);
    let (model_type, cs_key) = if geographic {
        (2, GEOGRAPHIC_TYPE_KEY)
    } else {
        (1, PROJECTED_CS_TYPE_KEY)
    };
    let shorts: [u16; 12] = [
        1, 1, 0, 2, // directory header: version, revision, minor, key count
        GT_MODEL_TYPE_KEY, 0, 1, model_type,
        cs_key, 0, 1, epsg,
    ];
    las::Vlr {
        user_id: PROJECTION_USER_ID.to_string(),
        record_id: GEOKEY_RECORD_ID,
        description: "GeoKeyDirectoryTag".to_string(),
        data: shorts.iter().flat_map(|s| s.to_le_bytes()).collect(),
    }
}

/// Build an OGC WKT VLR (record 2112), null-terminated.
pub fn wkt_vlr(wkt: &str) -> las::Vlr {
    las::Vlr {
        user_id: PROJECTION_USER_ID.to_string(),
        record_id: WKT_RECORD_ID,
        description: "OGC WKT".to_string(),
        data: format!("{}\0", wkt).into_bytes(),
    }
}

/// Result of a successful CRS validation.
#[derive(Debug, Clone)]
pub struct GoverningCrs {
    pub crs: Crs,
    /// Number of tiles whose header was inspected.
    pub tiles_checked: usize,
    /// Tiles that could not be opened; they are excluded downstream.
    pub warnings: Vec<TileWarning>,
}

/// Validate that the polygon source and every tile under `tile_roots`
/// share one defined CRS.
pub async fn validate(
    polygon_source: &Path,
    layer: Option<&str>,
    tile_roots: &[PathBuf],
    discovery: &DiscoveryOptions,
) -> Result<GoverningCrs> {
    let polygon_crs = polygons::read_layer_crs(polygon_source, layer).await?;
    if polygon_crs.is_none() {
        return Err(DiceError::UndefinedCrs {
            origin: polygon_source.to_path_buf(),
        }
        .into());
    }

    let paths = tiles::discover_tiles(tile_roots, discovery)?;
    if paths.is_empty() {
        return Err(DiceError::NoTilesFound {
            roots: tile_roots.to_vec(),
        }
        .into());
    }

    let (headers, warnings) = tokio::task::spawn_blocking(move || tiles::read_headers(&paths)).await?;
    for warning in &warnings {
        tracing::warn!(path = %warning.path.display(), reason = %warning.reason, "skipping unreadable tile");
    }

    let declared: Vec<(PathBuf, Option<Crs>)> = headers
        .into_iter()
        .map(|h| (h.path, h.crs))
        .collect();
    let crs = check_consistency(polygon_source, polygon_crs.as_ref(), &declared)?;
    tracing::info!(crs = %crs, tiles = declared.len(), "CRS validated");

    Ok(GoverningCrs {
        crs,
        tiles_checked: declared.len(),
        warnings,
    })
}

/// Pure consistency check over already-read CRS declarations.
pub fn check_consistency(
    polygon_source: &Path,
    polygon_crs: Option<&Crs>,
    tiles: &[(PathBuf, Option<Crs>)],
) -> Result<Crs, DiceError> {
    let polygon_crs = polygon_crs.ok_or_else(|| DiceError::UndefinedCrs {
        origin: polygon_source.to_path_buf(),
    })?;

    let mut reference: Option<(&Path, &Crs)> = None;
    for (path, crs) in tiles {
        let crs = crs.as_ref().ok_or_else(|| DiceError::UndefinedCrs {
            origin: path.clone(),
        })?;
        match reference {
            None => reference = Some((path.as_path(), crs)),
            Some((first_path, first_crs)) if first_crs != crs => {
                return Err(DiceError::MixedCrs {
                    first: first_path.to_path_buf(),
                    first_crs: first_crs.to_string(),
                    second: path.clone(),
                    second_crs: crs.to_string(),
                });
            }
            Some(_) => {}
        }
    }

    if let Some((tile_path, tile_crs)) = reference {
        if tile_crs != polygon_crs {
            return Err(DiceError::MixedCrs {
                first: polygon_source.to_path_buf(),
                first_crs: polygon_crs.to_string(),
                second: tile_path.to_path_buf(),
                second_crs: tile_crs.to_string(),
            });
        }
    }

    Ok(polygon_crs.clone())
}
