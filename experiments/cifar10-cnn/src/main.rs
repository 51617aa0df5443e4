mod augment;
mod data;
mod model;
mod notebook;
mod training;

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use convlab_core::{
    ensure_report_file, load_or_init, render_loss_curve, write_score_report, ExperimentArgs,
    HyperParameters, OutputPaths, Topology, DEFAULT_REPORT_TEMPLATE, USAGE,
};
use log::LevelFilter;

use data::CifarBatcher;
use notebook::NotebookEntry;

const SAMPLE_COUNT: usize = 3;

struct ExperimentPaths {
    config: PathBuf,
    report: PathBuf,
}

fn main() -> Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = ExperimentArgs::parse_from_env()?;
    if args.help_requested() {
        print!("{USAGE}");
        return Ok(());
    }

    let experiment_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("experiments/cifar10_cnn");
    run(args, &experiment_dir)
}

fn run(args: ExperimentArgs, experiment_dir: &Path) -> Result<()> {
    // Flag conflicts must surface before anything is read or written.
    let config = args.into_config()?;

    for (name, value) in config.settings_summary() {
        log::info!("{name}: {value}");
    }

    let paths = initialize_paths(experiment_dir)?;
    let params: HyperParameters = load_or_init(&paths.config, HyperParameters::default)?;
    params
        .validate()
        .with_context(|| format!("invalid hyper-parameters in {}", paths.config.display()))?;
    data::ensure_compatible(&params)?;

    let topology = Topology::build(&config, &params)?;
    let topology_table = topology.describe();
    log::info!(
        "topology: {} layers, {} parameters",
        topology.len(),
        topology.parameter_count()
    );
    log::debug!("layers: {:?}", topology.layer_names());

    ensure_report_file(&paths.report, DEFAULT_REPORT_TEMPLATE)?;

    let splits = data::load_dir(&params.data_dir)?.split(params.validation_split);
    log::info!(
        "X_train shape: ({}, {}, {}, {})",
        splits.train.items().len() + splits.validation.items().len(),
        data::CHANNELS,
        data::HEIGHT,
        data::WIDTH
    );

    let device = training::default_device();
    let outcome = training::run(topology, &config, &params, &splits, &device)?;

    println!("Test score: {}", outcome.test.loss);
    println!("Test accuracy: {}", outcome.test.accuracy);

    let outputs = OutputPaths::new(&params.output_dir, &config);
    println!("{}", outputs.score.display());
    write_score_report(&outputs.score, &outcome.test)?;
    render_loss_curve(
        &outputs.plot,
        &outcome.history,
        params.plot_width,
        params.plot_height,
    )?;

    let samples = notebook::sample_predictions(
        &outcome.model,
        &splits.test,
        &CifarBatcher::new(params.num_classes),
        &device,
        SAMPLE_COUNT,
    )?;
    notebook::write_notebook(
        &paths.report,
        &NotebookEntry {
            config: &config,
            params: &params,
            topology: &topology_table,
            history: &outcome.history,
            test: &outcome.test,
            outputs: &outputs,
            samples: &samples,
        },
    )?;
    log::info!("updated notebook at {}", paths.report.display());

    Ok(())
}

fn initialize_paths(dir: &Path) -> Result<ExperimentPaths> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create experiment directory {}", dir.display()))?;

    Ok(ExperimentPaths {
        config: dir.join("config.json"),
        report: dir.join("report.md"),
    })
}
