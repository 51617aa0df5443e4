pub mod config;
pub mod experiment;
pub mod metrics;
pub mod report;
pub mod rng;
pub mod topology;
pub mod visualization;

pub use config::{load_or_init, HyperParameters};
pub use experiment::{
    ConfigError, ExperimentArgs, ExperimentConfig, ExperimentFlags, Regularization, USAGE,
};
pub use metrics::{EpochMetrics, EvaluationMetrics, TrainingHistory};
pub use report::{
    ensure_report_file, output_stem, update_sections, write_score_report, OutputPaths,
    ReportSection, DEFAULT_REPORT_TEMPLATE,
};
pub use rng::{seeded_rng, stream_rng};
pub use topology::{
    Activation, Layer, Padding, Regularizer, Shape, ShapeError, Topology, TopologyError,
};
pub use visualization::{encode_planar_rgb_png_data_url, render_loss_curve};
