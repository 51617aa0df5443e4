use std::{fmt::Write, path::Path};

use anyhow::{anyhow, Result};
use burn::tensor::backend::Backend;
use convlab_core::{
    encode_planar_rgb_png_data_url, update_sections, EpochMetrics, EvaluationMetrics,
    ExperimentConfig, HyperParameters, OutputPaths, ReportSection, TrainingHistory,
};

use crate::{
    data::{CifarBatcher, CifarDataset, CifarItem, CLASS_NAMES, HEIGHT, WIDTH},
    model::CifarCnn,
};

#[derive(Clone, Debug)]
pub struct SamplePrediction {
    pub index: usize,
    pub label: usize,
    pub prediction: usize,
    pub image_data_url: String,
}

pub struct NotebookEntry<'a> {
    pub config: &'a ExperimentConfig,
    pub params: &'a HyperParameters,
    pub topology: &'a str,
    pub history: &'a TrainingHistory,
    pub test: &'a EvaluationMetrics,
    pub outputs: &'a OutputPaths,
    pub samples: &'a [SamplePrediction],
}

pub fn write_notebook(path: &Path, entry: &NotebookEntry<'_>) -> Result<()> {
    let sections = [
        ReportSection::new(
            "configuration",
            render_configuration_section(entry.config, entry.params),
        ),
        ReportSection::new("topology", entry.topology),
        ReportSection::new(
            "metrics",
            render_metrics_section(entry.history, entry.test, entry.outputs),
        ),
        ReportSection::new("samples", render_samples_section(entry.samples)),
    ];

    update_sections(path, &sections)
}

fn render_configuration_section(config: &ExperimentConfig, params: &HyperParameters) -> String {
    let mut output = String::new();
    for (name, value) in config.settings_summary() {
        let _ = writeln!(&mut output, "- {name}: {value}");
    }
    let _ = writeln!(
        &mut output,
        "- Batch size: {}\n- Learning rate: {} (decay {:e}, momentum {}, nesterov {})\n- Noise sigma: {}\n- L1 / L2 weight: {} / {}\n- Validation split: {}\n- Seed: {}",
        params.batch_size,
        params.learning_rate,
        params.decay,
        params.momentum,
        params.nesterov,
        params.noise_sigma,
        params.l1_weight,
        params.l2_weight,
        params.validation_split,
        params.seed
    );
    output
}

fn render_metrics_section(
    history: &TrainingHistory,
    test: &EvaluationMetrics,
    outputs: &OutputPaths,
) -> String {
    let mut output = String::new();

    if let Some(last) = history.last() {
        let _ = writeln!(
            &mut output,
            "- Final train loss: {:.4}\n- Final train accuracy: {:.2}%\n- Final validation loss: {:.4}\n- Final validation accuracy: {:.2}%",
            last.train_loss,
            last.train_accuracy * 100.0,
            last.val_loss,
            last.val_accuracy * 100.0
        );
    }

    let _ = writeln!(
        &mut output,
        "- Test loss: {:.4}\n- Test accuracy: {:.2}%\n- Score file: `{}`\n- Loss plot: `{}`\n",
        test.loss,
        test.accuracy * 100.0,
        outputs.score.display(),
        outputs.plot.display()
    );

    if !history.is_empty() {
        let _ = writeln!(
            &mut output,
            "| Epoch | Train Loss | Train Accuracy (%) | Val Loss | Val Accuracy (%) |"
        );
        let _ = writeln!(&mut output, "| --- | --- | --- | --- | --- |");

        for metrics in summarize_history(history.epochs()) {
            let _ = writeln!(
                &mut output,
                "| {} | {:.4} | {:.2} | {:.4} | {:.2} |",
                metrics.epoch,
                metrics.train_loss,
                metrics.train_accuracy * 100.0,
                metrics.val_loss,
                metrics.val_accuracy * 100.0
            );
        }
    }

    output
}

fn render_samples_section(samples: &[SamplePrediction]) -> String {
    if samples.is_empty() {
        return "No test samples available.".to_string();
    }

    let mut output = String::new();
    for (i, sample) in samples.iter().enumerate() {
        let _ = writeln!(
            &mut output,
            "#### Sample {} (test index {})\n- True label: {}\n- Predicted: {}\n\n![Sample image]({})\n",
            i + 1,
            sample.index,
            class_name(sample.label),
            class_name(sample.prediction),
            sample.image_data_url
        );
    }
    output
}

fn class_name(index: usize) -> &'static str {
    CLASS_NAMES.get(index).copied().unwrap_or("unknown")
}

/// A handful of epochs worth reading: early checkpoints plus the last one.
fn summarize_history(history: &[EpochMetrics]) -> Vec<&EpochMetrics> {
    let Some(last) = history.last() else {
        return Vec::new();
    };

    let mut checkpoints = vec![1, 2, 5, 10, 25, 50, 75, 100, last.epoch];
    checkpoints.retain(|&epoch| epoch <= last.epoch);
    checkpoints.sort_unstable();
    checkpoints.dedup();

    checkpoints
        .into_iter()
        .filter_map(|target| history.iter().find(|m| m.epoch == target))
        .collect()
}

pub fn sample_predictions<B: Backend>(
    model: &CifarCnn<B>,
    dataset: &CifarDataset,
    batcher: &CifarBatcher,
    device: &B::Device,
    count: usize,
) -> Result<Vec<SamplePrediction>> {
    let available = count.min(dataset.items().len());
    if available == 0 {
        return Ok(Vec::new());
    }

    let items: Vec<&CifarItem> = dataset.items()[..available].iter().collect();
    let batch = batcher.batch::<B>(&items, device);
    let predictions = model
        .forward(batch.images)
        .argmax(1)
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| anyhow!("failed to decode predictions: {err:?}"))?;

    items
        .iter()
        .zip(predictions)
        .enumerate()
        .map(|(index, (item, prediction))| {
            Ok(SamplePrediction {
                index,
                label: item.label as usize,
                prediction: prediction as usize,
                image_data_url: encode_planar_rgb_png_data_url(
                    WIDTH as u32,
                    HEIGHT as u32,
                    &item.image,
                )?,
            })
        })
        .collect()
}
