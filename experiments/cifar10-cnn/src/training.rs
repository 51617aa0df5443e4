use anyhow::{ensure, Result};
use burn::{
    module::AutodiffModule,
    optim::{momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig},
    tensor::{backend::Backend, ElementConversion, Int, Tensor},
};
use burn_autodiff::Autodiff;
use burn_candle::{Candle, CandleDevice};
use convlab_core::{
    stream_rng, EpochMetrics, EvaluationMetrics, ExperimentConfig, HyperParameters, Topology,
    TrainingHistory,
};
use rand::seq::SliceRandom;

use crate::{
    augment::Augmentation,
    data::{Cifar10Splits, CifarBatcher, CifarDataset, CifarItem},
    model::CifarCnn,
};

pub type InferenceBackend = Candle<f32, i64>;
pub type TrainingBackend = Autodiff<InferenceBackend>;

const INIT_STREAM: u64 = 0;
const SHUFFLE_STREAM: u64 = 1;
const AUGMENT_STREAM: u64 = 2;
const LOG_EPSILON: f32 = 1e-7;

pub struct TrainingOutcome {
    pub model: CifarCnn<InferenceBackend>,
    pub history: TrainingHistory,
    pub test: EvaluationMetrics,
}

#[cfg(not(feature = "cuda"))]
pub fn default_device() -> CandleDevice {
    CandleDevice::Cpu
}

#[cfg(feature = "cuda")]
pub fn default_device() -> CandleDevice {
    CandleDevice::cuda(0)
}

/// SGD with Nesterov momentum, as configured.
pub fn optimizer_config(params: &HyperParameters) -> SgdConfig {
    SgdConfig::new().with_momentum(Some(
        MomentumConfig::new()
            .with_momentum(params.momentum)
            .with_dampening(0.0)
            .with_nesterov(params.nesterov),
    ))
}

/// Time-based decay: `lr / (1 + decay * iteration)`.
pub fn learning_rate(params: &HyperParameters, iteration: usize) -> f64 {
    params.learning_rate / (1.0 + params.decay * iteration as f64)
}

/// Mean categorical cross-entropy between predicted probabilities and one-hot targets.
pub fn categorical_crossentropy<B: Backend>(probs: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    probs
        .clamp(LOG_EPSILON, 1.0 - LOG_EPSILON)
        .log()
        .mul(targets)
        .sum_dim(1)
        .mean()
        .neg()
}

fn accuracy_counts<B: Backend>(probs: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> (usize, usize) {
    let predictions: Tensor<B, 1, Int> = probs.argmax(1).squeeze(1);
    let correct = predictions
        .equal(labels.clone())
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize;
    let total = labels.dims()[0];

    (correct, total)
}

/// Train a freshly materialized topology and score it on the test split.
pub fn run(
    topology: Topology,
    config: &ExperimentConfig,
    params: &HyperParameters,
    data: &Cifar10Splits,
    device: &CandleDevice,
) -> Result<TrainingOutcome> {
    ensure!(!data.train.items().is_empty(), "training split is empty");
    ensure!(!data.validation.items().is_empty(), "validation split is empty");

    let mut init_rng = stream_rng(params.seed, INIT_STREAM);
    let mut model = CifarCnn::<TrainingBackend>::from_topology(topology, &mut init_rng, device)?;
    let mut optimizer = optimizer_config(params).init();
    let batcher = CifarBatcher::new(params.num_classes);
    let augmentation = config
        .data_augmentation()
        .then(|| Augmentation::from_params(params));

    let mut shuffle_rng = stream_rng(params.seed, SHUFFLE_STREAM);
    let mut augment_rng = stream_rng(params.seed, AUGMENT_STREAM);
    let mut indices: Vec<usize> = (0..data.train.items().len()).collect();
    let mut iteration = 0usize;
    let mut history = TrainingHistory::with_capacity(config.epochs());

    log::info!(
        "training on {} samples, validating on {} samples",
        data.train.items().len(),
        data.validation.items().len()
    );

    for epoch in 1..=config.epochs() {
        indices.shuffle(&mut shuffle_rng);

        let mut total_loss = 0.0f32;
        let mut total_correct = 0usize;
        let mut total_samples = 0usize;

        for chunk in indices.chunks(params.batch_size) {
            let items: Vec<&CifarItem> = chunk.iter().map(|&i| &data.train.items()[i]).collect();
            let batch = match &augmentation {
                Some(augmentation) => batcher.augmented_batch::<TrainingBackend, _>(
                    &items,
                    augmentation,
                    &mut augment_rng,
                    device,
                ),
                None => batcher.batch::<TrainingBackend>(&items, device),
            };

            let probs = model.forward(batch.images);
            let mut loss = categorical_crossentropy(probs.clone(), batch.targets);
            if let Some(penalty) = model.penalty() {
                loss = loss + penalty;
            }
            let (correct, total) = accuracy_counts(probs, batch.labels);

            total_loss += loss.clone().into_scalar().elem::<f32>() * total as f32;
            total_correct += correct;
            total_samples += total;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(learning_rate(params, iteration), model, grads);
            iteration += 1;
        }

        let validation = evaluate(&model.valid(), &data.validation, &batcher, params, device);
        let metrics = EpochMetrics {
            epoch,
            train_loss: total_loss / total_samples as f32,
            train_accuracy: total_correct as f32 / total_samples as f32,
            val_loss: validation.loss,
            val_accuracy: validation.accuracy,
        };

        log::info!(
            "epoch {:03}/{:03}: loss {:.4}, acc {:.4}, val_loss {:.4}, val_acc {:.4}",
            epoch,
            config.epochs(),
            metrics.train_loss,
            metrics.train_accuracy,
            metrics.val_loss,
            metrics.val_accuracy
        );
        history.push(metrics);
    }

    let model = model.valid();
    let test = evaluate(&model, &data.test, &batcher, params, device);
    log::info!("test: loss {:.4}, accuracy {:.4}", test.loss, test.accuracy);

    Ok(TrainingOutcome {
        model,
        history,
        test,
    })
}

/// Loss (cross-entropy plus weight penalty) and accuracy over a whole split.
pub fn evaluate<B: Backend>(
    model: &CifarCnn<B>,
    dataset: &CifarDataset,
    batcher: &CifarBatcher,
    params: &HyperParameters,
    device: &B::Device,
) -> EvaluationMetrics {
    let mut total_loss = 0.0f32;
    let mut total_correct = 0usize;
    let mut total_samples = 0usize;

    for chunk in dataset.items().chunks(params.batch_size) {
        let items: Vec<&CifarItem> = chunk.iter().collect();
        let batch = batcher.batch::<B>(&items, device);
        let probs = model.forward(batch.images);
        let loss = categorical_crossentropy(probs.clone(), batch.targets);
        let (correct, total) = accuracy_counts(probs, batch.labels);

        total_loss += loss.into_scalar().elem::<f32>() * total as f32;
        total_correct += correct;
        total_samples += total;
    }

    if total_samples == 0 {
        return EvaluationMetrics {
            loss: f32::NAN,
            accuracy: 0.0,
        };
    }

    let penalty = model
        .penalty()
        .map(|penalty| penalty.into_scalar().elem::<f32>())
        .unwrap_or(0.0);

    EvaluationMetrics {
        loss: total_loss / total_samples as f32 + penalty,
        accuracy: total_correct as f32 / total_samples as f32,
    }
}
