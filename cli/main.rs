#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;

use irrimap::calibrate::data::{ObservationTable, load_observations};
use irrimap::calibrate::ensemble::train_ensemble;
use irrimap::calibrate::model::TrainedEnsemble;
use irrimap::frame::{generate_frame, write_frame};
use irrimap::map::grid::{Grid, GridFileSet, GridFileSource, RasterStack, RowBlockSource};
use irrimap::map::mask::RoiMask;
use irrimap::map::progress::ConsoleScoreProgress;
use irrimap::map::scorer::{ScoreOptions, output_names, score_stream};
use irrimap::map::zonal::zonal_summary;
use irrimap::mrp::hierarchical::{
    AreaDesign, FitReliability, FittedHierarchicalModel, RandomEffects, fit_hierarchical,
};
use irrimap::mrp::posterior::sample_posterior;
use irrimap::mrp::poststrat::{
    AdjustmentMethod, CoefficientSource, PoststratReport, PoststratTable, Weighting,
    load_poststrat_table, poststratify,
};
use irrimap::mrp::selection::select_model;
use irrimap::shared::config::PipelineConfig;
use irrimap::shared::files::{self, TsvWriter, format_value};

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn parse_band(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected NAME=PATH, got '{raw}'")),
    }
}

#[derive(Args)]
struct ConfigArgs {
    /// Pipeline configuration file (TOML); defaults apply when omitted
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct TrainArgs {
    /// Observation table (TSV) with id, lon, lat, x, y, label, area_id and covariates
    observations: PathBuf,

    /// Where to write the trained ensemble
    #[arg(long, default_value = "ensemble.toml")]
    out: PathBuf,

    /// Optional validation diagnostics table
    #[arg(long, value_name = "PATH")]
    diagnostics: Option<PathBuf>,

    /// Optional ROC curve of the stacked model on the validation rows
    #[arg(long, value_name = "PATH")]
    roc: Option<PathBuf>,

    /// Overrides ensemble.seed
    #[arg(long)]
    seed: Option<u64>,

    /// Overrides ensemble.folds
    #[arg(long)]
    folds: Option<usize>,
}

#[derive(Args)]
struct ScoreArgs {
    /// Trained ensemble (.toml)
    #[arg(long)]
    model: PathBuf,

    /// Covariate band as NAME=PATH (GeoTIFF or ESRI ASCII grid); repeat per covariate
    #[arg(long = "band", value_name = "NAME=PATH", value_parser = parse_band, required = true)]
    bands: Vec<(String, PathBuf)>,

    /// Region-of-interest grid; zero and no-data cells are skipped
    #[arg(long, value_name = "PATH")]
    mask: Option<PathBuf>,

    /// Directory receiving one grid per learner plus the stacked surface
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Grid rows read per block
    #[arg(long, default_value_t = 64)]
    block_rows: usize,

    /// Encoding of the output surfaces
    #[arg(long, value_enum, default_value_t = GridFormatCli::Tif)]
    format: GridFormatCli,
}

#[derive(Clone, Copy, ValueEnum)]
enum GridFormatCli {
    /// GeoTIFF
    Tif,
    /// ESRI ASCII grid
    Asc,
}

impl GridFormatCli {
    fn extension(self) -> &'static str {
        match self {
            GridFormatCli::Tif => "tif",
            GridFormatCli::Asc => "asc",
        }
    }
}

#[derive(Args)]
struct ExtractArgs {
    /// Point table (TSV) with id, x and y columns in the grid's coordinates
    points: PathBuf,

    /// Covariate band as NAME=PATH; repeat per covariate
    #[arg(long = "band", value_name = "NAME=PATH", value_parser = parse_band, required = true)]
    bands: Vec<(String, PathBuf)>,

    #[arg(long, default_value = "covariates.tsv")]
    out: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum EffectsCli {
    /// Fit both variants and select
    Auto,
    Intercept,
    Slope,
}

#[derive(Args)]
struct FitArgs {
    /// Observation table (TSV); needs a spatial_score column unless --ensemble is given
    observations: PathBuf,

    /// Score the observations' covariates with this ensemble instead of reading spatial_score
    #[arg(long, value_name = "PATH")]
    ensemble: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = EffectsCli::Auto)]
    effects: EffectsCli,

    /// Replace the Laplace estimates with posterior means from the Metropolis sampler
    #[arg(long)]
    posterior: bool,

    #[arg(long, default_value = "hierarchical.toml")]
    out: PathBuf,

    /// Optional per-area coefficient table
    #[arg(long, value_name = "PATH")]
    areas: Option<PathBuf>,
}

#[derive(Args)]
struct TabulateArgs {
    /// Observation table supplying surveyed counts per area
    observations: PathBuf,

    /// Integer small-area code grid
    #[arg(long)]
    zones: PathBuf,

    /// Cropland grid; non-zero cells are cropland
    #[arg(long)]
    cropland: PathBuf,

    /// Stacked probability surface
    #[arg(long)]
    surface: PathBuf,

    /// Reference irrigated-cropland grid for the direct ratio estimator
    #[arg(long, value_name = "PATH")]
    irrigated: Option<PathBuf>,

    #[arg(long, default_value = "poststrat.tsv")]
    out: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodCli {
    /// Survey rate reweighted by the raster ratio
    Direct,
    /// Fitted hierarchical model coefficients
    Mrp,
    /// Precomputed intercept/slope columns of the table
    MrpTable,
}

#[derive(Clone, Copy, ValueEnum)]
enum WeightingCli {
    Unweighted,
    Area,
}

#[derive(Args)]
struct PoststratifyArgs {
    /// Poststratification table (TSV)
    table: PathBuf,

    #[arg(long, value_enum, default_value_t = MethodCli::Mrp)]
    method: MethodCli,

    /// Fitted hierarchical model (.toml), required by --method mrp
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,

    /// Overrides poststrat.confidence_level
    #[arg(long)]
    level: Option<f64>,

    /// Overrides poststrat.weighting
    #[arg(long, value_enum)]
    weighting: Option<WeightingCli>,

    /// Optional per-area breakdown table
    #[arg(long, value_name = "PATH")]
    areas: Option<PathBuf>,
}

#[derive(Args)]
struct SampleArgs {
    /// Region-of-interest grid; non-zero cells are eligible
    #[arg(long)]
    mask: PathBuf,

    /// Number of locations to draw
    #[arg(long)]
    n: usize,

    /// Optional integer zone grid used to attribute each location
    #[arg(long, value_name = "PATH")]
    zones: Option<PathBuf>,

    /// Overrides frame.seed
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value = "frame.tsv")]
    out: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "irrimap",
    about = "Small-area irrigation mapping: stacked prediction, multilevel poststratification and balanced sampling"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the stacked ensemble
    #[command(about = "Train the stacked ensemble (outputs: ensemble.toml)")]
    Train(TrainArgs),

    /// Score covariate grids
    #[command(about = "Score covariate grids (outputs: one grid per learner plus stacked)")]
    Score(ScoreArgs),

    /// Extract covariates at point locations
    #[command(about = "Extract covariate values at points (outputs: covariates.tsv)")]
    Extract(ExtractArgs),

    /// Fit the hierarchical model
    #[command(about = "Fit the two-level model (outputs: hierarchical.toml)")]
    Fit(FitArgs),

    /// Build a poststratification table from grids
    #[command(about = "Summarize grids per small area (outputs: poststrat.tsv)")]
    Tabulate(TabulateArgs),

    /// Produce the poststratified estimate
    #[command(about = "Poststratify per-area rates into a regional estimate")]
    Poststratify(PoststratifyArgs),

    /// Draw a spatially balanced sampling frame
    #[command(about = "Draw a balanced sample from a mask (outputs: frame.tsv)")]
    Sample(SampleArgs),

    /// Display version information
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { config, command } = Cli::parse();

    let result = PipelineConfig::load_or_default(config.config.as_deref())
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
        .and_then(|pipeline| match command {
            Some(Commands::Train(args)) => run_train(args, pipeline),
            Some(Commands::Score(args)) => run_score(args),
            Some(Commands::Extract(args)) => run_extract(args),
            Some(Commands::Fit(args)) => run_fit(args, pipeline),
            Some(Commands::Tabulate(args)) => run_tabulate(args, pipeline),
            Some(Commands::Poststratify(args)) => run_poststratify(args, pipeline),
            Some(Commands::Sample(args)) => run_sample(args, pipeline),
            Some(Commands::Version) => {
                println!("irrimap {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
            None => {
                Cli::command().print_help()?;
                println!();
                Ok(())
            }
        });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_train(args: TrainArgs, mut pipeline: PipelineConfig) -> CliResult {
    if let Some(seed) = args.seed {
        pipeline.ensemble.seed = seed;
    }
    if let Some(folds) = args.folds {
        pipeline.ensemble.folds = folds;
    }
    pipeline.validate()?;
    let table = load_observations(&args.observations, &pipeline.store)?;
    let ensemble = train_ensemble(
        table.covariates.view(),
        table.labels.view(),
        &table.covariate_names,
        &pipeline.ensemble,
    )?;
    ensemble.save(&args.out)?;

    println!("Validation diagnostics ({} held-out units):", ensemble.meta_labels.len());
    for d in &ensemble.validation {
        println!(
            "  {:<22} AUC {}  log-loss {:.4}  Brier {:.4}",
            d.name,
            d.auc.map_or_else(|| "NA".to_string(), |a| format!("{a:.4}")),
            d.log_loss,
            d.brier
        );
    }
    if let Some(path) = &args.diagnostics {
        let mut writer = TsvWriter::create(path, &["learner", "auc", "log_loss", "brier"])?;
        for d in &ensemble.validation {
            writer.write_row(&[
                d.name.clone(),
                format_value(d.auc),
                format_value(Some(d.log_loss)),
                format_value(Some(d.brier)),
            ])?;
        }
        writer.finish()?;
    }
    if let Some(path) = &args.roc {
        let mut writer = TsvWriter::create(path, &["threshold", "true_positive_rate", "false_positive_rate"])?;
        for point in ensemble.validation_roc() {
            writer.write_row(&[
                format_value(Some(point.threshold)),
                format_value(Some(point.true_positive_rate)),
                format_value(Some(point.false_positive_rate)),
            ])?;
        }
        writer.finish()?;
    }
    println!("Ensemble written to {}", args.out.display());
    Ok(())
}

fn run_score(args: ScoreArgs) -> CliResult {
    let ensemble = TrainedEnsemble::load(&args.model)?;
    let mut source = GridFileSource::open(&args.bands)?;
    let geometry = source.geometry();
    let mask = args
        .mask
        .as_deref()
        .map(Grid::read)
        .transpose()?
        .map(|grid| RoiMask::from_grid(&grid));
    std::fs::create_dir_all(&args.out_dir)?;
    let paths: Vec<PathBuf> = output_names(&ensemble)
        .iter()
        .map(|name| args.out_dir.join(format!("{name}.{}", args.format.extension())))
        .collect();
    let mut sink = GridFileSet::create(&paths, geometry)?;
    let options = ScoreOptions {
        block_rows: args.block_rows.max(1),
        ..ScoreOptions::default()
    };
    let summary = score_stream(
        &ensemble,
        &mut source,
        &mut sink,
        mask.as_ref(),
        options,
        &mut ConsoleScoreProgress::default(),
    )?;
    println!(
        "Scored {} cells ({} no-data, {} masked); surfaces in {}",
        summary.scored_cells,
        summary.nodata_cells,
        summary.masked_cells,
        args.out_dir.display()
    );
    Ok(())
}

fn run_extract(args: ExtractArgs) -> CliResult {
    let df = files::read_tsv(&args.points)?;
    files::require_columns(&df, &["id", "x", "y"])?;
    let ids = files::string_column(&df, "id")?;
    let xs = files::numeric_column(&df, "x")?;
    let ys = files::numeric_column(&df, "y")?;
    let points: Vec<(f64, f64)> = xs.into_iter().zip(ys).collect();

    let stack = RasterStack::read(&args.bands)?;
    let values = stack.extract(&points);
    let mut header = vec!["id".to_string(), "x".to_string(), "y".to_string()];
    header.extend(stack.names().iter().cloned());
    let mut writer = TsvWriter::create(&args.out, &header)?;
    let mut outside = 0;
    for (i, row) in values.rows().into_iter().enumerate() {
        if row.iter().any(|v| v.is_nan()) {
            outside += 1;
        }
        let mut fields = vec![
            ids[i].clone().unwrap_or_else(|| "NA".to_string()),
            points[i].0.to_string(),
            points[i].1.to_string(),
        ];
        fields.extend(row.iter().map(|&v| format_value(Some(v))));
        writer.write_row(&fields)?;
    }
    writer.finish()?;
    println!(
        "Extracted {} bands at {} points ({} with missing values) into {}",
        stack.names().len(),
        points.len(),
        outside,
        args.out.display()
    );
    Ok(())
}

fn attach_scores(table: &mut ObservationTable, ensemble_path: &Path) -> CliResult {
    let ensemble = TrainedEnsemble::load(ensemble_path)?;
    let features = ensemble.align_features(table.covariates.view(), &table.covariate_names)?;
    let prediction = ensemble.predict(features.view())?;
    table.spatial_score = Some(prediction.stacked);
    Ok(())
}

fn write_area_coefficients(model: &FittedHierarchicalModel, path: &Path) -> CliResult {
    let mut writer = TsvWriter::create(
        path,
        &[
            "area_id",
            "units",
            "intercept",
            "slope",
            "intercept_offset",
            "intercept_offset_se",
            "slope_offset",
            "slope_offset_se",
        ],
    )?;
    for area in &model.areas {
        let (intercept, slope) = model
            .area_coefficients(&area.area_id)
            .unwrap_or((f64::NAN, f64::NAN));
        writer.write_row(&[
            area.area_id.clone(),
            area.units.to_string(),
            format_value(Some(intercept)),
            format_value(Some(slope)),
            format_value(Some(area.intercept_offset.value)),
            format_value(area.intercept_offset.std_error),
            format_value(area.slope_offset.map(|e| e.value)),
            format_value(area.slope_offset.and_then(|e| e.std_error)),
        ])?;
    }
    writer.finish()?;
    Ok(())
}

fn run_fit(args: FitArgs, pipeline: PipelineConfig) -> CliResult {
    let mut table = load_observations(&args.observations, &pipeline.store)?;
    if let Some(path) = &args.ensemble {
        attach_scores(&mut table, path)?;
    }
    let design = AreaDesign::from_observations(&table)?;
    let config = &pipeline.hierarchical;
    let mut model = match args.effects {
        EffectsCli::Auto => {
            let outcome = select_model(&design, config)?;
            println!("Model selection: {}", outcome.reason);
            if let (Some(delta), Some(lrt)) = (outcome.delta_aic, outcome.lrt_statistic) {
                println!(
                    "  ΔAIC {delta:.3}, LRT {lrt:.3} (p = {})",
                    outcome.lrt_p_value.map_or_else(|| "NA".to_string(), |p| format!("{p:.4}"))
                );
            }
            outcome.chosen
        }
        EffectsCli::Intercept => fit_hierarchical(&design, RandomEffects::Intercept, config)?,
        EffectsCli::Slope => fit_hierarchical(&design, RandomEffects::InterceptAndSlope, config)?,
    };
    if args.posterior {
        let summary = sample_posterior(&design, &model, &config.posterior)?;
        model = summary.to_model(&design, config)?;
    }

    println!(
        "{} model: β0 = {:.4}, β1 = {:.4}, τ = {:.4}, logL = {:.3}, AIC = {:.3}",
        model.effects,
        model.intercept.value,
        model.slope.value,
        model.random_intercept_sd,
        model.log_likelihood,
        model.aic
    );
    if let FitReliability::Degenerate(reason) = &model.reliability {
        println!("Warning: the fit is unreliable: {reason}");
    }
    model.save(&args.out)?;
    if let Some(path) = &args.areas {
        write_area_coefficients(&model, path)?;
    }
    println!("Hierarchical model written to {}", args.out.display());
    Ok(())
}

fn run_tabulate(args: TabulateArgs, pipeline: PipelineConfig) -> CliResult {
    let observations = load_observations(&args.observations, &pipeline.store)?;
    let zones = Grid::read(&args.zones)?;
    let cropland = RoiMask::from_grid(&Grid::read(&args.cropland)?);
    let surface = Grid::read(&args.surface)?;
    let irrigated = args
        .irrigated
        .as_deref()
        .map(Grid::read)
        .transpose()?
        .map(|grid| RoiMask::from_grid(&grid));
    let summaries = zonal_summary(&zones, &cropland, &surface, irrigated.as_ref())?;
    let table = PoststratTable::from_zones(&summaries, &observations)?;
    table.write(&args.out)?;
    println!("Poststratification table with {} areas written to {}", table.len(), args.out.display());
    Ok(())
}

fn print_report(report: &PoststratReport) {
    println!("Method: {} ({:?})", report.method, report.weighting);
    println!(
        "Estimate: {:.4}  SE {:.4}  {:.0}% CI [{:.4}, {:.4}]",
        report.estimate,
        report.standard_error,
        report.confidence_level * 100.0,
        report.lower,
        report.upper
    );
    println!(
        "Area total: {:.1} of {:.1} cropland [{:.1}, {:.1}]",
        report.total, report.cropland_area, report.total_lower, report.total_upper
    );
    println!(
        "Areas estimated: {}  surveyed units: {}  omitted: {}",
        report.areas.len(),
        report.surveyed_units,
        report.omissions.len()
    );
    for omission in &report.omissions {
        println!("  omitted {}: {}", omission.area_id, omission.reason);
    }
}

fn run_poststratify(args: PoststratifyArgs, mut pipeline: PipelineConfig) -> CliResult {
    if let Some(level) = args.level {
        pipeline.poststrat.confidence_level = level;
    }
    if let Some(weighting) = args.weighting {
        pipeline.poststrat.weighting = match weighting {
            WeightingCli::Unweighted => Weighting::Unweighted,
            WeightingCli::Area => Weighting::AreaWeighted,
        };
    }
    let table = load_poststrat_table(&args.table)?;
    let model = args
        .model
        .as_deref()
        .map(FittedHierarchicalModel::load)
        .transpose()?;
    let method = match args.method {
        MethodCli::Direct => AdjustmentMethod::DirectRatio,
        MethodCli::Mrp => AdjustmentMethod::Multilevel(CoefficientSource::Model),
        MethodCli::MrpTable => AdjustmentMethod::Multilevel(CoefficientSource::Table),
    };
    let report = poststratify(&table, method, model.as_ref(), &pipeline.poststrat)?;
    print_report(&report);
    if let Some(path) = &args.areas {
        report.write_areas(path)?;
    }
    Ok(())
}

fn run_sample(args: SampleArgs, mut pipeline: PipelineConfig) -> CliResult {
    if let Some(seed) = args.seed {
        pipeline.frame.seed = seed;
    }
    let mask = RoiMask::from_grid(&Grid::read(&args.mask)?);
    let zones = args.zones.as_deref().map(Grid::read).transpose()?;
    let frame = generate_frame(&mask, args.n, zones.as_ref(), &pipeline.frame)?;
    write_frame(&args.out, &frame, &pipeline.frame.resolutions)?;
    println!("Sampling frame with {} locations written to {}", frame.len(), args.out.display());
    Ok(())
}
