use anyhow::{bail, Result};
use burn::{
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Initializer, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Distribution, Tensor, TensorData},
};
use convlab_core::{Activation, Layer, Padding, Regularizer, Shape, Topology};
use rand::{rngs::StdRng, Rng};

/// Additive gaussian noise on the inputs, active only while training.
#[derive(Module, Clone, Debug)]
pub struct GaussianNoise {
    sigma: f64,
}

impl GaussianNoise {
    pub fn new(sigma: f64) -> Self {
        Self { sigma }
    }

    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        if !B::ad_enabled() || self.sigma == 0.0 {
            return input;
        }
        let noise = Tensor::random(
            input.shape(),
            Distribution::Normal(0.0, self.sigma),
            &input.device(),
        );
        input + noise
    }
}

/// Dense layer whose output is the max over `pieces` linear projections per unit.
#[derive(Module, Debug)]
pub struct MaxoutDense<B: Backend> {
    linear: Linear<B>,
    units: usize,
    pieces: usize,
}

impl<B: Backend> MaxoutDense<B> {
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, _] = input.dims();
        self.linear
            .forward(input)
            .reshape([batch, self.units, self.pieces])
            .max_dim(2)
            .reshape([batch, self.units])
    }
}

/// Fully connected layer with optional L1/L2 weight penalties.
#[derive(Module, Debug)]
pub struct Dense<B: Backend> {
    linear: Linear<B>,
    l1: f64,
    l2: f64,
}

impl<B: Backend> Dense<B> {
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(input)
    }

    /// `l1 * sum(|W|) + l2 * sum(W^2)`, or `None` when unregularized.
    pub fn penalty(&self) -> Option<Tensor<B, 1>> {
        let weight = self.linear.weight.val();
        let l1 = (self.l1 > 0.0).then(|| weight.clone().abs().sum().mul_scalar(self.l1));
        let l2 = (self.l2 > 0.0).then(|| weight.powf_scalar(2.0).sum().mul_scalar(self.l2));
        match (l1, l2) {
            (Some(l1), Some(l2)) => Some(l1 + l2),
            (l1, l2) => l1.or(l2),
        }
    }
}

/// Turns scores along `dim` into a probability distribution.
#[derive(Module, Clone, Debug)]
pub struct Softmax {
    dim: usize,
}

impl Softmax {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        softmax(input, self.dim)
    }
}

/// Stages that run on `[batch, channels, height, width]` activations.
#[derive(Module, Debug)]
pub enum ImageStage<B: Backend> {
    Noise(GaussianNoise),
    Conv(Conv2d<B>),
    Relu(Relu),
    Pool(MaxPool2d),
    Dropout(Dropout),
}

impl<B: Backend> ImageStage<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Noise(noise) => noise.forward(input),
            Self::Conv(conv) => conv.forward(input),
            Self::Relu(relu) => relu.forward(input),
            Self::Pool(pool) => pool.forward(input),
            Self::Dropout(dropout) => dropout.forward(input),
        }
    }
}

/// Stages that run on flattened `[batch, features]` activations.
#[derive(Module, Debug)]
pub enum HeadStage<B: Backend> {
    Noise(GaussianNoise),
    Maxout(MaxoutDense<B>),
    Dense(Dense<B>),
    Relu(Relu),
    Dropout(Dropout),
    Softmax(Softmax),
}

impl<B: Backend> HeadStage<B> {
    fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Self::Noise(noise) => noise.forward(input),
            Self::Maxout(maxout) => maxout.forward(input),
            Self::Dense(dense) => dense.forward(input),
            Self::Relu(relu) => relu.forward(input),
            Self::Dropout(dropout) => dropout.forward(input),
            Self::Softmax(softmax) => softmax.forward(input),
        }
    }
}

/// A feed-forward classifier materialized from a [`Topology`].
///
/// Layers up to `Flatten` form the body, everything after it the head.
#[derive(Module, Debug)]
pub struct CifarCnn<B: Backend> {
    body: Vec<ImageStage<B>>,
    head: Vec<HeadStage<B>>,
}

impl<B: Backend> CifarCnn<B> {
    /// Weights are drawn from `rng`, so the same seed gives the same initial model.
    pub fn from_topology(
        topology: Topology,
        rng: &mut StdRng,
        device: &B::Device,
    ) -> Result<Self> {
        let inputs: Vec<Shape> = std::iter::once(topology.input_shape())
            .chain(topology.shapes().iter().copied())
            .collect();
        let (_, layers) = topology.into_layers();

        let mut body = Vec::new();
        let mut head = Vec::new();
        let mut flattened = false;

        for (index, (layer, input)) in layers.into_iter().zip(inputs).enumerate() {
            let name = layer.name();
            match (flattened, layer, input) {
                (_, Layer::Flatten, _) if flattened => bail!("layer {index}: flattened twice"),
                (false, Layer::Flatten, _) => flattened = true,
                (false, Layer::GaussianNoise { sigma }, _) => {
                    body.push(ImageStage::Noise(GaussianNoise::new(sigma)))
                }
                (true, Layer::GaussianNoise { sigma }, _) => {
                    head.push(HeadStage::Noise(GaussianNoise::new(sigma)))
                }
                (false, Layer::Activation(Activation::Relu), _) => {
                    body.push(ImageStage::Relu(Relu::new()))
                }
                (true, Layer::Activation(Activation::Relu), _) => {
                    head.push(HeadStage::Relu(Relu::new()))
                }
                (true, Layer::Activation(Activation::Softmax), _) => {
                    head.push(HeadStage::Softmax(Softmax::new(1)))
                }
                (false, Layer::Dropout { rate }, _) => {
                    body.push(ImageStage::Dropout(DropoutConfig::new(rate).init()))
                }
                (true, Layer::Dropout { rate }, _) => {
                    head.push(HeadStage::Dropout(DropoutConfig::new(rate).init()))
                }
                (
                    false,
                    Layer::Conv2d {
                        filters,
                        kernel,
                        padding,
                    },
                    Shape::Image { channels, .. },
                ) => {
                    let padding = match padding {
                        Padding::Same => PaddingConfig2d::Same,
                        Padding::Valid => PaddingConfig2d::Valid,
                    };
                    let mut conv = Conv2dConfig::new([channels, filters], kernel)
                        .with_padding(padding)
                        .with_initializer(Initializer::Zeros)
                        .init(device);
                    let receptive = kernel[0] * kernel[1];
                    conv.weight = Param::from_tensor(glorot_uniform(
                        rng,
                        [filters, channels, kernel[0], kernel[1]],
                        channels * receptive,
                        filters * receptive,
                        device,
                    ));
                    body.push(ImageStage::Conv(conv));
                }
                (false, Layer::MaxPool2d { pool }, _) => {
                    let pool = MaxPool2dConfig::new(pool).with_strides(pool).init();
                    body.push(ImageStage::Pool(pool));
                }
                (true, Layer::MaxoutDense { units, pieces }, Shape::Vector(features)) => {
                    let linear = linear_from_rng(rng, device, features, units * pieces);
                    head.push(HeadStage::Maxout(MaxoutDense {
                        linear,
                        units,
                        pieces,
                    }));
                }
                (true, Layer::Dense { units, regularizer }, Shape::Vector(features)) => {
                    let linear = linear_from_rng(rng, device, features, units);
                    let (l1, l2) = match regularizer {
                        None => (0.0, 0.0),
                        Some(Regularizer::L1(weight)) => (weight, 0.0),
                        Some(Regularizer::L2(weight)) => (0.0, weight),
                    };
                    head.push(HeadStage::Dense(Dense { linear, l1, l2 }));
                }
                (_, _, input) => bail!("layer {index} ({name}) cannot run on input {input}"),
            }
        }

        if !flattened {
            bail!("topology never flattens its image input");
        }

        Ok(Self { body, head })
    }

    /// Class probabilities, `[batch, classes]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self
            .body
            .iter()
            .fold(images, |x, stage| stage.forward(x))
            .flatten::<2>(1, 3);
        self.head.iter().fold(features, |x, stage| stage.forward(x))
    }

    /// Sum of the weight penalties of every regularized dense layer.
    pub fn penalty(&self) -> Option<Tensor<B, 1>> {
        self.head
            .iter()
            .filter_map(|stage| match stage {
                HeadStage::Dense(dense) => dense.penalty(),
                _ => None,
            })
            .reduce(|total, penalty| total + penalty)
    }
}

/// Glorot-uniform weights with zero bias.
fn linear_from_rng<B: Backend>(
    rng: &mut StdRng,
    device: &B::Device,
    fan_in: usize,
    fan_out: usize,
) -> Linear<B> {
    let mut linear = LinearConfig::new(fan_in, fan_out)
        .with_initializer(Initializer::Zeros)
        .init(device);
    let weight = glorot_uniform(rng, [fan_in, fan_out], fan_in, fan_out, device);
    linear.weight = Param::from_tensor(weight);
    linear
}

fn glorot_uniform<B: Backend, const D: usize>(
    rng: &mut StdRng,
    shape: [usize; D],
    fan_in: usize,
    fan_out: usize,
    device: &B::Device,
) -> Tensor<B, D> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let total: usize = shape.iter().product();
    let values: Vec<f32> = (0..total)
        .map(|_| rng.gen::<f32>() * 2.0 * limit - limit)
        .collect();

    Tensor::<B, D>::from_floats(TensorData::new(values, shape), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::ElementConversion;
    use burn_autodiff::Autodiff;
    use burn_candle::{Candle, CandleDevice};
    use convlab_core::{seeded_rng, ExperimentConfig, HyperParameters, Regularization};

    type TestBackend = Candle<f32, i64>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn model_with_seed(config: &ExperimentConfig, seed: u64) -> CifarCnn<TestBackend> {
        let topology = Topology::build(config, &HyperParameters::default()).unwrap();
        CifarCnn::from_topology(topology, &mut seeded_rng(seed), &CandleDevice::Cpu).unwrap()
    }

    fn model(config: &ExperimentConfig) -> CifarCnn<TestBackend> {
        model_with_seed(config, 1337)
    }

    #[test]
    fn produces_a_distribution_per_image() {
        let device = CandleDevice::Cpu;
        let config = ExperimentConfig::new(1, false, true, true, true, Regularization::L2).unwrap();
        let images = Tensor::<TestBackend, 4>::ones([2, 3, 32, 32], &device).mul_scalar(0.5);

        let probs = model(&config).forward(images);
        assert_eq!(probs.dims(), [2, 10]);

        let sums = probs.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-4, "row sums to {sum}");
        }
    }

    #[test]
    fn stages_mirror_the_topology() {
        let config = ExperimentConfig::new(1, false, true, true, true, Regularization::None).unwrap();
        let cnn = model(&config);
        // noise + 2 * (conv, relu, conv, relu, pool, dropout)
        assert_eq!(cnn.body.len(), 13);
        // maxout, dense, relu, dropout, dense, softmax
        assert_eq!(cnn.head.len(), 6);
        assert!(matches!(cnn.head[0], HeadStage::Maxout(_)));
        assert!(matches!(cnn.head[5], HeadStage::Softmax(_)));
    }

    #[test]
    fn penalty_only_with_regularization() {
        assert!(model(&ExperimentConfig::default()).penalty().is_none());

        for regularization in [Regularization::L1, Regularization::L2] {
            let config = ExperimentConfig::new(1, false, false, false, false, regularization).unwrap();
            let penalty = model(&config)
                .penalty()
                .unwrap()
                .into_scalar()
                .elem::<f32>();
            assert!(penalty > 0.0);
        }
    }

    #[test]
    fn l1_penalty_scales_the_absolute_weights() {
        let device = CandleDevice::Cpu;
        let linear = LinearConfig::new(2, 2)
            .with_initializer(Initializer::Constant { value: -0.5 })
            .init::<TestBackend>(&device);
        let dense = Dense {
            linear,
            l1: 0.5,
            l2: 0.0,
        };
        let penalty = dense.penalty().unwrap().into_scalar().elem::<f32>();
        assert!((penalty - 1.0).abs() < 1e-6);
    }

    #[test]
    fn maxout_takes_the_largest_piece() {
        let device = CandleDevice::Cpu;
        let linear = LinearConfig::new(1, 4)
            .with_initializer(Initializer::Constant { value: 1.0 })
            .with_bias(false)
            .init::<TestBackend>(&device);
        let maxout = MaxoutDense {
            linear,
            units: 2,
            pieces: 2,
        };
        let input = Tensor::<TestBackend, 2>::from_floats([[3.0]], &device);
        let output = maxout.forward(input).into_data().to_vec::<f32>().unwrap();
        assert_eq!(output, vec![3.0, 3.0]);
    }

    #[test]
    fn noise_is_inert_without_autodiff() {
        let device = CandleDevice::Cpu;
        let input = Tensor::<TestBackend, 2>::ones([4, 4], &device);
        let output = GaussianNoise::new(1.0).forward(input.clone());
        let diff = (output - input).abs().sum().into_scalar().elem::<f32>();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn noise_perturbs_inputs_under_autodiff() {
        let device = CandleDevice::Cpu;
        let input = Tensor::<TestAutodiffBackend, 2>::ones([4, 4], &device);
        let output = GaussianNoise::new(1.0).forward(input.clone());
        let diff = (output - input).abs().sum().into_scalar().elem::<f32>();
        assert!(diff > 0.0);
    }

    #[test]
    fn dropout_zeroes_activations_under_autodiff() {
        let device = CandleDevice::Cpu;
        let input = Tensor::<TestAutodiffBackend, 2>::ones([64, 64], &device);
        let output = DropoutConfig::new(0.5).init().forward(input);
        let dropped = output.equal_elem(0.0).int().sum().into_scalar().elem::<i64>();
        assert!(dropped > 0);
    }

    #[test]
    fn same_seed_gives_same_weights() {
        let device = CandleDevice::Cpu;
        let config = ExperimentConfig::new(1, false, false, true, false, Regularization::None).unwrap();
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device).mul_scalar(0.5);

        let forward = |seed| {
            model_with_seed(&config, seed)
                .forward(images.clone())
                .into_data()
                .to_vec::<f32>()
                .unwrap()
        };
        assert_eq!(forward(7), forward(7));
        assert_ne!(forward(7), forward(8));
    }

    #[test]
    fn conv_weights_stay_within_the_glorot_limit() {
        let weights = glorot_uniform::<TestBackend, 4>(
            &mut seeded_rng(0),
            [32, 3, 3, 3],
            27,
            288,
            &CandleDevice::Cpu,
        )
        .into_data()
        .to_vec::<f32>()
        .unwrap();
        let limit = (6.0f32 / 315.0).sqrt();
        assert_eq!(weights.len(), 32 * 27);
        assert!(weights.iter().all(|w| w.abs() <= limit));
        assert!(weights.iter().any(|&w| w != 0.0));
    }

    #[test]
    fn rejects_layers_in_the_wrong_place() {
        let topology = Topology::new(
            Shape::Vector(4),
            vec![Layer::Dense {
                units: 2,
                regularizer: None,
            }],
        )
        .unwrap();
        let built =
            CifarCnn::<TestBackend>::from_topology(topology, &mut seeded_rng(0), &CandleDevice::Cpu);
        assert!(built.is_err());
    }
}
