//! # LAS Dice CLI (`las-dice`)
//!
//! ## Usage
//!
//! ```bash
//! las-dice --config ./las_dice.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `las-dice init` | Capture inputs from flags and write the config file |
//! | `las-dice run` | Validate, index and clip (preview unless `--execute`) |
//! | `las-dice build-tindex` | Build the tile index only |
//! | `las-dice validate-tindex` | Inspect an existing tile index |
//! | `las-dice validate-crs` | Check that polygons and tiles share one CRS |
//! | `las-dice clip` | Clip from explicit paths, without a config file |
//! | `las-dice list-layers <source>` | List feature layers of a polygon source |
//! | `las-dice list-fields <source>` | Geometry, feature count, CRS and fields of a layer |
//! | `las-dice completions <shell>` | Print a shell completion script |

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use las_dice::config::{self, Config, OutputConfig, PolygonsConfig, RunConfig, TilesConfig, TindexConfig};
use las_dice::models::{BatchReport, BoundaryMode};
use las_dice::naming::NamingOptions;
use las_dice::orchestrator::CancelFlag;
use las_dice::pipeline::{self, DirectClip, PipelineOptions};
use las_dice::progress::{ProgressMode, ProgressReporter};
use las_dice::tiles::TileWarning;
use las_dice::{crs, polygons, report, tiles, tindex};

/// LAS Dice: clip LAS/LAZ tiles by polygon footprints through a tile index.
///
/// Most commands read a TOML config file written by `las-dice init`.
#[derive(Parser)]
#[command(name = "las-dice", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Progress output on stderr.
    #[arg(long, global = true, value_enum, default_value_t = ProgressMode::Auto)]
    progress: ProgressMode,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace). `RUST_LOG` wins.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file from flags.
    ///
    /// The file is validated before it is written and is never replaced
    /// unless `--force` is given.
    Init {
        /// Polygon source (GeoPackage or shapefile).
        #[arg(long)]
        polygons: PathBuf,

        /// Polygon layer; required when the GeoPackage holds several.
        #[arg(long)]
        layer: Option<String>,

        /// Attribute used to name output files.
        #[arg(long)]
        name_field: String,

        /// Directory searched recursively for tiles. Repeatable.
        #[arg(long = "tiles", required = true)]
        tile_roots: Vec<PathBuf>,

        /// Glob of tiles to skip. Repeatable.
        #[arg(long = "exclude")]
        exclude_globs: Vec<String>,

        /// Tile index GeoPackage.
        #[arg(long)]
        tindex: PathBuf,

        #[arg(long, default_value = tindex::DEFAULT_LAYER)]
        tindex_layer: String,

        #[arg(long, value_enum, default_value_t = BoundaryMode::Fast)]
        boundary: BoundaryMode,

        /// Output directory for clips.
        #[arg(long)]
        output: PathBuf,

        /// Appended to every output name as `_<suffix>`.
        #[arg(long)]
        suffix: Option<String>,

        #[arg(long, default_value = "laz", value_parser = ["las", "laz"])]
        extension: String,

        #[arg(long)]
        concurrency: Option<usize>,

        /// Replace an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// Run the pipeline: validate CRS, build or reuse the index, clip.
    ///
    /// Without `--execute` nothing is clipped; the planned actions are
    /// reported instead.
    Run {
        /// Write clip outputs.
        #[arg(long)]
        execute: bool,

        /// Replace existing outputs instead of skipping them.
        #[arg(long)]
        overwrite: bool,

        /// Rebuild the tile index even if it exists.
        #[arg(long)]
        rebuild_index: bool,

        /// Per-polygon report (`.csv` for CSV, otherwise JSON Lines).
        #[arg(long)]
        report: Option<PathBuf>,

        /// Concurrent clip jobs.
        #[arg(long)]
        jobs: Option<usize>,

        /// Exit with status 2 when any job failed.
        #[arg(long)]
        strict: bool,
    },

    /// Build the tile index from the configured tile roots.
    BuildTindex {
        /// Overrides `tindex.boundary`.
        #[arg(long, value_enum)]
        boundary: Option<BoundaryMode>,

        /// Replace an existing index layer.
        #[arg(long)]
        overwrite: bool,
    },

    /// Inspect a tile index.
    ValidateTindex {
        /// Index GeoPackage; defaults to `tindex.path`.
        #[arg(long)]
        path: Option<PathBuf>,

        /// Index layer; defaults to `tindex.layer`.
        #[arg(long)]
        layer: Option<String>,
    },

    /// Check that the polygon source and every tile share one CRS.
    ValidateCrs,

    /// Clip with explicit paths from an existing tile index.
    Clip {
        #[arg(long)]
        polygons: PathBuf,

        #[arg(long)]
        layer: Option<String>,

        /// Tile index GeoPackage.
        #[arg(long)]
        index: PathBuf,

        #[arg(long, default_value = tindex::DEFAULT_LAYER)]
        index_layer: String,

        /// Output directory.
        #[arg(long)]
        output: PathBuf,

        #[arg(long)]
        name_field: String,

        #[arg(long)]
        suffix: Option<String>,

        #[arg(long, default_value = "laz", value_parser = ["las", "laz"])]
        extension: String,

        #[arg(long)]
        execute: bool,

        #[arg(long)]
        overwrite: bool,

        #[arg(long)]
        jobs: Option<usize>,

        #[arg(long)]
        report: Option<PathBuf>,

        #[arg(long)]
        strict: bool,
    },

    /// List the feature layers of a polygon source.
    ListLayers { path: PathBuf },

    /// Describe a polygon layer: geometry type, feature count, CRS, fields.
    ListFields {
        path: PathBuf,
        #[arg(long)]
        layer: Option<String>,
    },

    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Cancel flag set by Ctrl-C. Running jobs finish; pending ones are skipped.
fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted: finishing running jobs, skipping the rest");
            flag.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let reporter = cli.progress.reporter();

    // Commands that don't require config
    match cli.command {
        Commands::Init {
            polygons,
            layer,
            name_field,
            tile_roots,
            exclude_globs,
            tindex,
            tindex_layer,
            boundary,
            output,
            suffix,
            extension,
            concurrency,
            force,
        } => {
            let cfg = Config {
                polygons: PolygonsConfig {
                    path: polygons,
                    layer,
                    name_field,
                },
                tiles: TilesConfig {
                    roots: tile_roots,
                    include_globs: tiles::default_include_globs(),
                    exclude_globs,
                    follow_symlinks: false,
                },
                tindex: TindexConfig {
                    path: tindex,
                    layer: tindex_layer,
                    boundary,
                },
                output: OutputConfig {
                    dir: output,
                    suffix,
                    extension,
                },
                run: RunConfig {
                    concurrency: concurrency.unwrap_or_else(config::default_concurrency),
                    ..RunConfig::default()
                },
            };
            config::save_config(&cfg, &cli.config, force)?;
            println!("Wrote {}", cli.config.display());
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Clip {
            polygons,
            layer,
            index,
            index_layer,
            output,
            name_field,
            suffix,
            extension,
            execute,
            overwrite,
            jobs,
            report: report_path,
            strict,
        } => {
            let request = DirectClip {
                polygons,
                layer,
                index,
                index_layer,
                output_dir: output,
                naming: NamingOptions {
                    field: name_field,
                    suffix,
                    extension,
                },
                overwrite,
                execute,
                concurrency: jobs.unwrap_or_else(config::default_concurrency).max(1),
            };
            let cancel = cancel_on_ctrl_c();
            let (_, batch) = pipeline::run_direct(&request, reporter, &cancel).await?;
            return finish(&batch, &[], report_path.as_deref(), strict);
        }
        Commands::ListLayers { path } => {
            for layer in polygons::list_layers(&path).await? {
                println!("{}", layer);
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::ListFields { path, layer } => {
            let summary = polygons::describe_layer(&path, layer.as_deref()).await?;
            println!("layer: {}", summary.name);
            println!("geometry: {}", summary.geometry_type);
            println!("features: {}", summary.feature_count);
            match &summary.crs {
                Some(crs) => println!("crs: {}", crs),
                None => println!("crs: None (undefined)"),
            }
            for field in summary.fields {
                println!("{}", field);
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "las-dice", &mut std::io::stdout());
            return Ok(ExitCode::SUCCESS);
        }
        command => {
            let cfg = config::load_config(&cli.config)?;
            run_configured(command, &cfg, reporter).await
        }
    }
}

async fn run_configured(
    command: Commands,
    cfg: &Config,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<ExitCode> {
    match command {
        Commands::Run {
            execute,
            overwrite,
            rebuild_index,
            report: report_path,
            jobs,
            strict,
        } => {
            let options = PipelineOptions {
                execute,
                overwrite,
                rebuild_index,
                concurrency: jobs.map(|j| j.max(1)),
            };
            let cancel = cancel_on_ctrl_c();
            let outcome = pipeline::run_pipeline(cfg, &options, reporter, &cancel).await?;

            println!("crs: {}", outcome.governing.crs);
            match &outcome.build {
                Some(build) => println!(
                    "tile index: built {} tiles into {} ({})",
                    build.indexed,
                    build.location.display(),
                    build.boundary_mode.as_str()
                ),
                None => println!(
                    "tile index: reused {} ({} tiles)",
                    outcome.index.location.display(),
                    outcome.index.record_count
                ),
            }
            let report_path = report_path.or_else(|| cfg.run.report.clone());
            finish(
                &outcome.report,
                &outcome.warnings(),
                report_path.as_deref(),
                strict || cfg.run.fail_on_job_error,
            )
        }
        Commands::BuildTindex {
            boundary,
            overwrite,
        } => {
            let governing = crs::validate(
                &cfg.polygons.path,
                cfg.polygons.layer.as_deref(),
                &cfg.tiles.roots,
                &cfg.tiles.discovery(),
            )
            .await?;
            let mut request = pipeline::build_request(cfg, &governing, overwrite);
            if let Some(mode) = boundary {
                request.boundary_mode = mode;
            }
            let summary = tindex::build(&request, reporter).await?;

            println!("build-tindex");
            println!("  location: {}", summary.location.display());
            println!("  layer: {}", summary.layer);
            println!("  boundary: {}", summary.boundary_mode.as_str());
            println!("  indexed: {}", summary.indexed);
            print_warnings(&summary.warnings);
            println!("ok");
            Ok(ExitCode::SUCCESS)
        }
        Commands::ValidateTindex { path, layer } => {
            let location = path.unwrap_or_else(|| cfg.tindex.path.clone());
            let layer = layer.unwrap_or_else(|| cfg.tindex.layer.clone());
            let metadata = tindex::inspect(&location, &layer).await?;

            println!("validate-tindex");
            println!("  location: {}", metadata.location.display());
            println!("  layer: {}", metadata.layer);
            println!("  geometry: {}", metadata.geometry_type);
            println!(
                "  crs: {}",
                metadata.crs.as_deref().unwrap_or("undefined")
            );
            println!(
                "  boundary: {}",
                metadata.boundary_mode.map(|m| m.as_str()).unwrap_or("unknown")
            );
            println!("  records: {}", metadata.record_count);
            for sample in &metadata.sample_paths {
                println!("    {}", sample);
            }
            metadata.require_records()?;
            println!("ok");
            Ok(ExitCode::SUCCESS)
        }
        Commands::ValidateCrs => {
            let governing = crs::validate(
                &cfg.polygons.path,
                cfg.polygons.layer.as_deref(),
                &cfg.tiles.roots,
                &cfg.tiles.discovery(),
            )
            .await?;
            println!("validate-crs");
            println!("  crs: {}", governing.crs);
            println!("  tiles checked: {}", governing.tiles_checked);
            print_warnings(&governing.warnings);
            println!("ok");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init { .. }
        | Commands::Clip { .. }
        | Commands::ListLayers { .. }
        | Commands::ListFields { .. }
        | Commands::Completions { .. } => {
            // Handled before config loading
            unreachable!()
        }
    }
}

fn print_warnings(warnings: &[TileWarning]) {
    for warning in warnings {
        println!("  ? {}: {}", warning.path.display(), warning.reason);
    }
}

/// Print the summary, write the report file and pick the exit status.
fn finish(batch: &BatchReport, warnings: &[TileWarning], report_path: Option<&Path>, strict: bool) -> Result<ExitCode> {
    if let Some(path) = report_path {
        report::write_report(batch, path)?;
        println!("report: {}", path.display());
    }
    report::print_summary(batch, warnings);
    if strict && batch.failed() > 0 {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}
