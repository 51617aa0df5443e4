use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};

use crate::{experiment::ExperimentConfig, metrics::EvaluationMetrics};

pub const DEFAULT_REPORT_TEMPLATE: &str = r"# CIFAR-10 Regularization Notebook

<!-- SECTION:overview start -->
<!-- Describe which regularizer combinations this notebook tracks. -->
<!-- SECTION:overview end -->

## Configuration

<!-- SECTION:configuration start -->
<!-- Populated automatically with the flags and hyper-parameters of the latest run. -->
<!-- SECTION:configuration end -->

## Topology

<!-- SECTION:topology start -->
<!-- Populated automatically with the layer stack of the latest run. -->
<!-- SECTION:topology end -->

## Metrics

<!-- SECTION:metrics start -->
<!-- Populated automatically with per-epoch losses and the final test score. -->
<!-- SECTION:metrics end -->

## Samples

<!-- SECTION:samples start -->
<!-- Populated automatically with a few test images and their predictions. -->
<!-- SECTION:samples end -->

> Keep the `<!-- SECTION:name start/end -->` markers around any region that should be rewritten after each run.
";

#[derive(Clone, Debug)]
pub struct ReportSection {
    id: String,
    content: String,
}

impl ReportSection {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }

    fn start_marker(&self) -> String {
        format!("<!-- SECTION:{} start -->", self.id)
    }

    fn end_marker(&self) -> String {
        format!("<!-- SECTION:{} end -->", self.id)
    }
}

pub fn ensure_report_file(path: &Path, template: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    if !path.exists() {
        fs::write(path, template)
            .with_context(|| format!("failed to write report template to {}", path.display()))?;
    }

    Ok(())
}

pub fn update_sections(path: &Path, sections: &[ReportSection]) -> Result<()> {
    let mut content = fs::read_to_string(path)
        .with_context(|| format!("failed to read report at {}", path.display()))?;

    for section in sections {
        content = replace_section(&content, section)?;
    }

    fs::write(path, content)
        .with_context(|| format!("failed to write updated report to {}", path.display()))?;
    log::debug!("updated {} notebook sections in {}", sections.len(), path.display());
    Ok(())
}

fn replace_section(content: &str, section: &ReportSection) -> Result<String> {
    let start_marker = section.start_marker();
    let end_marker = section.end_marker();

    let start_idx = content
        .find(&start_marker)
        .ok_or_else(|| anyhow!("missing start marker: {}", start_marker))?;
    let after_start = start_idx + start_marker.len();
    let end_relative = content[after_start..]
        .find(&end_marker)
        .ok_or_else(|| anyhow!("missing end marker: {}", end_marker))?;
    let end_idx = after_start + end_relative;

    let mut updated = String::with_capacity(content.len() + section.content.len());
    updated.push_str(&content[..start_idx]);
    updated.push_str(&start_marker);

    let trimmed = section.content.trim_matches('\n');
    updated.push('\n');
    if !trimmed.is_empty() {
        updated.push_str(trimmed);
        updated.push('\n');
    }

    updated.push_str(&content[end_idx..]);
    Ok(updated)
}

/// File stem shared by the score report and the loss plot of one run.
///
/// Every flag appears in the name, booleans spelled `True`/`False`.
pub fn output_stem(config: &ExperimentConfig) -> String {
    format!(
        "train_val_loss_with_dropout_epochs_{}_data_augmentation_{}_noise_{}_maxout_{}_dropout_{}_l1_{}_l2_{}",
        config.epochs(),
        flag(config.data_augmentation()),
        flag(config.noise()),
        flag(config.maxout()),
        flag(config.dropout()),
        flag(config.l1()),
        flag(config.l2()),
    )
}

fn flag(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Where one run writes its artefacts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputPaths {
    pub score: PathBuf,
    pub plot: PathBuf,
}

impl OutputPaths {
    pub fn new(output_dir: &Path, config: &ExperimentConfig) -> Self {
        let stem = output_stem(config);
        Self {
            score: output_dir.join(format!("{stem}.txt")),
            plot: output_dir.join(format!("{stem}.png")),
        }
    }
}

pub fn render_score_report(score: &EvaluationMetrics) -> String {
    format!(
        "Test score: {}\nTest accuracy: {}",
        score.loss, score.accuracy
    )
}

/// Write the two-line score file. The parent directory must already exist.
pub fn write_score_report(path: &Path, score: &EvaluationMetrics) -> Result<()> {
    fs::write(path, render_score_report(score))
        .with_context(|| format!("failed to write score report to {}", path.display()))?;
    log::debug!("wrote score report to {}", path.display());
    Ok(())
}
