#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use graphnet::config::PipelineConfig;
use graphnet::crossval::{CancellationToken, FoldOutcome};
use graphnet::gridsearch::GridSearcher;
use graphnet::io::NiftiVolumeSource;
use graphnet::pipeline::{self, PreparedData};
use graphnet::progress::BarGridProgress;
use graphnet::solver::PenaltyParams;

#[derive(Parser)]
#[command(
    name = "graphnet",
    about = "Sparse, graph-smoothed classifiers for trial-aligned fMRI",
    long_about = "Builds trial-by-voxel design matrices from subject functional runs and marker \
                 files, trains GraphNet classifiers, cross-validates them across subjects and \
                 tunes their penalties with a zooming grid search."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on all subjects and write the coefficient map
    Train(RunArgs),
    /// Subject-level k-fold cross-validation of one penalty setting
    Crossvalidate(RunArgs),
    /// Zoom grid search over the penalties, scored by cross-validation
    Gridsearch(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// TOML run configuration
    #[arg(long, value_name = "TOML")]
    config: PathBuf,

    /// Stop starting new folds or grid points after this many seconds
    #[arg(long, value_name = "SECONDS")]
    deadline_secs: Option<u64>,

    #[command(flatten)]
    penalty: PenaltyOverrides,
}

#[derive(Args)]
struct PenaltyOverrides {
    #[arg(long)]
    l1: Option<f64>,
    #[arg(long)]
    l2: Option<f64>,
    #[arg(long)]
    l3: Option<f64>,
    #[arg(long)]
    delta: Option<f64>,
    /// Reweight the l1 penalty from the previous solution
    #[arg(long, conflicts_with = "no_adaptive")]
    adaptive: bool,
    #[arg(long)]
    no_adaptive: bool,
}

impl PenaltyOverrides {
    fn apply(&self, params: &mut PenaltyParams) {
        if let Some(l1) = self.l1 {
            params.l1 = l1;
        }
        if let Some(l2) = self.l2 {
            params.l2 = l2;
        }
        if let Some(l3) = self.l3 {
            params.l3 = l3;
        }
        if let Some(delta) = self.delta {
            params.delta = delta;
        }
        if self.adaptive {
            params.adaptive = true;
        }
        if self.no_adaptive {
            params.adaptive = false;
        }
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

type Loaded = (PipelineConfig, PreparedData, CancellationToken);

fn load(args: &RunArgs) -> Result<Loaded, Box<dyn std::error::Error>> {
    let mut config = PipelineConfig::from_toml_file(&args.config)?;
    args.penalty.apply(&mut config.penalty);
    config.validate()?;

    let cancel = match args.deadline_secs {
        Some(secs) => CancellationToken::after(Duration::from_secs(secs)),
        None => CancellationToken::new(),
    };

    println!("Preparing data under {}", config.data.subject_top_dir.display());
    let prepared = pipeline::prepare(&config, &NiftiVolumeSource)?;
    for (subject, reason) in &prepared.skipped_subjects {
        println!("  skipped {subject}: {reason}");
    }
    println!(
        "Base matrix: {} trials from {} subjects, {} features; training matrix {} rows",
        prepared.base.num_rows(),
        prepared.base.num_subjects(),
        prepared.base.x.ncols(),
        prepared.sampled.x.nrows()
    );
    Ok((config, prepared, cancel))
}

fn train(args: RunArgs) -> CliResult {
    let (config, prepared, _) = load(&args)?;
    let (fit, path) =
        pipeline::train_and_export(&config, &prepared, &config.penalty, &config.data.output_name)?;
    let primary = fit.primary();
    println!(
        "Trained: {} non-zero coefficients of {}, {} iterations, {} reweighting rounds",
        primary.count_nonzero(),
        primary.len(),
        fit.iterations[0],
        fit.reweighting_rounds[0]
    );
    println!(
        "Training accuracy: {:.4}",
        fit.accuracy(prepared.sampled.x.view(), prepared.sampled.y.view())
    );
    println!("Coefficient map written to {}", path.display());
    Ok(())
}

fn crossvalidate(args: RunArgs) -> CliResult {
    let (config, prepared, cancel) = load(&args)?;
    let cv = prepared.cross_validator(&config)?;
    let report = cv.crossvalidate_until(&config.penalty, &cancel)?;

    for (fold, outcome) in report.outcomes.iter().enumerate() {
        match outcome {
            FoldOutcome::Evaluated { accuracy, nonzero } => println!(
                "Fold {}: accuracy {accuracy:.4}, {nonzero} non-zero coefficients",
                fold + 1
            ),
            FoldOutcome::Failed { reason } => println!("Fold {}: failed ({reason})", fold + 1),
            FoldOutcome::Skipped => println!("Fold {}: skipped", fold + 1),
        }
    }
    match report.mean_accuracy() {
        Some(mean) => println!("Mean accuracy: {mean:.4}"),
        None => println!("Mean accuracy: n/a (no fold completed)"),
    }
    if report.partial {
        println!("Deadline reached: results are partial.");
    }
    Ok(())
}

fn gridsearch(args: RunArgs) -> CliResult {
    let (config, prepared, cancel) = load(&args)?;
    let cv = prepared.cross_validator(&config)?;
    let searcher = GridSearcher::new(config.gridsearch.clone(), config.penalty);
    let name = config.gridsearch.name.clone();
    let report = searcher.zoom_gridsearch_with(
        &cv,
        &name,
        config.penalty.adaptive,
        &cancel,
        &BarGridProgress::new(),
    )?;

    let table = PathBuf::from(format!("{name}.tsv"));
    report.write_tsv(&table)?;
    println!(
        "{} grid points evaluated, table written to {}",
        report.evaluations.len(),
        table.display()
    );
    match &report.best {
        Some(best) => println!(
            "Best: l1={} l2={} l3={} delta={} accuracy={:.4} mean non-zero={:.1}",
            best.params.l1,
            best.params.l2,
            best.params.l3,
            best.params.delta,
            best.accuracy.unwrap_or(f64::NAN),
            best.mean_nonzero.unwrap_or(f64::NAN)
        ),
        None => println!("No grid point was evaluated successfully."),
    }
    if report.partial {
        println!("Deadline reached: results are partial.");
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Crossvalidate(args)) => crossvalidate(args),
        Some(Commands::Gridsearch(args)) => gridsearch(args),
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
