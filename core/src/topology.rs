//! Layer topologies for the CIFAR-10 classifier.
//!
//! A [`Topology`] is plain data: an input [`Shape`] plus an ordered list of
//! [`Layer`] descriptors. It is derived from an [`ExperimentConfig`] without
//! touching any tensor library, checked by shape inference, and then handed to
//! whichever backend materializes it.

use std::fmt::{self, Write};

use thiserror::Error;

use crate::{
    config::HyperParameters,
    experiment::{ExperimentConfig, Regularization},
};

const BLOCK_A_FILTERS: usize = 32;
const BLOCK_B_FILTERS: usize = 64;
const KERNEL: [usize; 2] = [3, 3];
const POOL: [usize; 2] = [2, 2];
const CONV_DROPOUT: f64 = 0.25;
const HIDDEN_UNITS: usize = 512;
const MAXOUT_PIECES: usize = 4;
const HIDDEN_DROPOUT: f64 = 0.5;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Padding {
    /// Zero-pad so the output keeps the input's spatial size.
    Same,
    /// No padding; the output shrinks by `kernel - 1`.
    Valid,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Activation {
    Relu,
    Softmax,
}

/// Weight penalty attached to a dense layer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Regularizer {
    L1(f64),
    L2(f64),
}

impl Regularizer {
    pub fn weight(&self) -> f64 {
        match self {
            Self::L1(weight) | Self::L2(weight) => *weight,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Shape {
    Image {
        channels: usize,
        height: usize,
        width: usize,
    },
    Vector(usize),
}

impl Shape {
    pub fn rank(&self) -> usize {
        match self {
            Self::Image { .. } => 3,
            Self::Vector(_) => 1,
        }
    }

    pub fn len(&self) -> usize {
        match *self {
            Self::Image {
                channels,
                height,
                width,
            } => channels * height * width,
            Self::Vector(len) => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image {
                channels,
                height,
                width,
            } => write!(f, "({channels}, {height}, {width})"),
            Self::Vector(len) => write!(f, "({len})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Layer {
    GaussianNoise {
        sigma: f64,
    },
    Conv2d {
        filters: usize,
        kernel: [usize; 2],
        padding: Padding,
    },
    Activation(Activation),
    MaxPool2d {
        pool: [usize; 2],
    },
    Dropout {
        rate: f64,
    },
    Flatten,
    MaxoutDense {
        units: usize,
        pieces: usize,
    },
    Dense {
        units: usize,
        regularizer: Option<Regularizer>,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ShapeError {
    #[error("expected a {expected} input, found {found}")]
    RankMismatch {
        expected: &'static str,
        found: Shape,
    },
    #[error("window {window:?} does not fit input {found}")]
    WindowTooLarge { window: [usize; 2], found: Shape },
}

#[derive(Debug, Error, PartialEq)]
pub enum TopologyError {
    #[error("topology has no layers")]
    Empty,
    #[error("layer {index} ({name}): {source}")]
    Layer {
        index: usize,
        name: &'static str,
        #[source]
        source: ShapeError,
    },
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GaussianNoise { .. } => "gaussian_noise",
            Self::Conv2d { .. } => "conv2d",
            Self::Activation(Activation::Relu) => "relu",
            Self::Activation(Activation::Softmax) => "softmax",
            Self::MaxPool2d { .. } => "max_pool2d",
            Self::Dropout { .. } => "dropout",
            Self::Flatten => "flatten",
            Self::MaxoutDense { .. } => "maxout_dense",
            Self::Dense {
                regularizer: None, ..
            } => "dense",
            Self::Dense {
                regularizer: Some(Regularizer::L1(_)),
                ..
            } => "dense_l1",
            Self::Dense {
                regularizer: Some(Regularizer::L2(_)),
                ..
            } => "dense_l2",
        }
    }

    pub fn output_shape(&self, input: Shape) -> Result<Shape, ShapeError> {
        match *self {
            Self::GaussianNoise { .. } | Self::Dropout { .. } => Ok(input),
            Self::Activation(Activation::Relu) => Ok(input),
            Self::Activation(Activation::Softmax) => {
                let len = expect_vector(input)?;
                Ok(Shape::Vector(len))
            }
            Self::Conv2d {
                filters,
                kernel,
                padding,
            } => {
                let (_, height, width) = expect_image(input)?;
                let (height, width) = match padding {
                    Padding::Same => (height, width),
                    Padding::Valid => {
                        if kernel[0] > height || kernel[1] > width {
                            return Err(ShapeError::WindowTooLarge {
                                window: kernel,
                                found: input,
                            });
                        }
                        (height - kernel[0] + 1, width - kernel[1] + 1)
                    }
                };
                Ok(Shape::Image {
                    channels: filters,
                    height,
                    width,
                })
            }
            Self::MaxPool2d { pool } => {
                let (channels, height, width) = expect_image(input)?;
                if pool[0] == 0 || pool[1] == 0 || pool[0] > height || pool[1] > width {
                    return Err(ShapeError::WindowTooLarge {
                        window: pool,
                        found: input,
                    });
                }
                Ok(Shape::Image {
                    channels,
                    height: height / pool[0],
                    width: width / pool[1],
                })
            }
            Self::Flatten => {
                expect_image(input)?;
                Ok(Shape::Vector(input.len()))
            }
            Self::MaxoutDense { units, .. } | Self::Dense { units, .. } => {
                expect_vector(input)?;
                Ok(Shape::Vector(units))
            }
        }
    }

    /// Trainable weights and biases given the layer's input shape.
    pub fn parameter_count(&self, input: Shape) -> usize {
        match *self {
            Self::Conv2d {
                filters, kernel, ..
            } => {
                let channels = match input {
                    Shape::Image { channels, .. } => channels,
                    Shape::Vector(_) => 0,
                };
                kernel[0] * kernel[1] * channels * filters + filters
            }
            Self::MaxoutDense { units, pieces } => (input.len() + 1) * units * pieces,
            Self::Dense { units, .. } => (input.len() + 1) * units,
            _ => 0,
        }
    }
}

fn expect_image(shape: Shape) -> Result<(usize, usize, usize), ShapeError> {
    match shape {
        Shape::Image {
            channels,
            height,
            width,
        } => Ok((channels, height, width)),
        Shape::Vector(_) => Err(ShapeError::RankMismatch {
            expected: "rank-3 image",
            found: shape,
        }),
    }
}

fn expect_vector(shape: Shape) -> Result<usize, ShapeError> {
    match shape {
        Shape::Vector(len) => Ok(len),
        Shape::Image { .. } => Err(ShapeError::RankMismatch {
            expected: "rank-1 feature",
            found: shape,
        }),
    }
}

/// An ordered, shape-checked feed-forward stack.
#[derive(Clone, Debug, PartialEq)]
pub struct Topology {
    input: Shape,
    layers: Vec<Layer>,
    shapes: Vec<Shape>,
}

impl Topology {
    pub fn new(input: Shape, layers: Vec<Layer>) -> Result<Self, TopologyError> {
        let shapes = infer_shapes(input, &layers)?;
        Ok(Self {
            input,
            layers,
            shapes,
        })
    }

    /// Derive the classifier for one experiment.
    pub fn build(config: &ExperimentConfig, params: &HyperParameters) -> Result<Self, TopologyError> {
        let mut layers = Vec::new();

        if config.noise() {
            layers.push(Layer::GaussianNoise {
                sigma: params.noise_sigma,
            });
        }

        for filters in [BLOCK_A_FILTERS, BLOCK_B_FILTERS] {
            layers.extend(conv_block(filters, config.dropout()));
        }

        layers.push(Layer::Flatten);

        // Maxout is stacked in front of the hidden dense layer, not in place of it.
        if config.maxout() {
            layers.push(Layer::MaxoutDense {
                units: HIDDEN_UNITS,
                pieces: MAXOUT_PIECES,
            });
        }

        let regularizer = match config.regularization() {
            Regularization::None => None,
            Regularization::L1 => Some(Regularizer::L1(params.l1_weight)),
            Regularization::L2 => Some(Regularizer::L2(params.l2_weight)),
        };
        layers.push(Layer::Dense {
            units: HIDDEN_UNITS,
            regularizer,
        });
        layers.push(Layer::Activation(Activation::Relu));
        if config.dropout() {
            layers.push(Layer::Dropout {
                rate: HIDDEN_DROPOUT,
            });
        }

        layers.push(Layer::Dense {
            units: params.num_classes,
            regularizer: None,
        });
        layers.push(Layer::Activation(Activation::Softmax));

        let input = Shape::Image {
            channels: params.image_channels,
            height: params.image_rows,
            width: params.image_cols,
        };
        Self::new(input, layers)
    }

    pub fn input_shape(&self) -> Shape {
        self.input
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Output shape of every layer, in order.
    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn output_shape(&self) -> Shape {
        self.shapes.last().copied().unwrap_or(self.input)
    }

    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(Layer::name).collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.inputs()
            .zip(&self.layers)
            .map(|(input, layer)| layer.parameter_count(input))
            .sum()
    }

    /// Markdown table of layers, output shapes and parameter counts.
    pub fn describe(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(&mut output, "| # | Layer | Output shape | Params |");
        let _ = writeln!(&mut output, "| --- | --- | --- | --- |");
        let _ = writeln!(&mut output, "| 0 | input | {} | 0 |", self.input);

        for (index, ((input, layer), shape)) in
            self.inputs().zip(&self.layers).zip(&self.shapes).enumerate()
        {
            let _ = writeln!(
                &mut output,
                "| {} | {} | {} | {} |",
                index + 1,
                layer.name(),
                shape,
                layer.parameter_count(input)
            );
        }

        let _ = writeln!(&mut output, "\nTotal parameters: {}", self.parameter_count());
        output
    }

    /// Hand the layers over to a backend. The topology is gone afterwards.
    pub fn into_layers(self) -> (Shape, Vec<Layer>) {
        (self.input, self.layers)
    }

    fn inputs(&self) -> impl Iterator<Item = Shape> + '_ {
        std::iter::once(self.input).chain(self.shapes.iter().copied())
    }
}

fn conv_block(filters: usize, dropout: bool) -> Vec<Layer> {
    let mut block = vec![
        Layer::Conv2d {
            filters,
            kernel: KERNEL,
            padding: Padding::Same,
        },
        Layer::Activation(Activation::Relu),
        Layer::Conv2d {
            filters,
            kernel: KERNEL,
            padding: Padding::Valid,
        },
        Layer::Activation(Activation::Relu),
        Layer::MaxPool2d { pool: POOL },
    ];
    if dropout {
        block.push(Layer::Dropout { rate: CONV_DROPOUT });
    }
    block
}

fn infer_shapes(input: Shape, layers: &[Layer]) -> Result<Vec<Shape>, TopologyError> {
    if layers.is_empty() {
        return Err(TopologyError::Empty);
    }

    let mut shapes = Vec::with_capacity(layers.len());
    let mut current = input;
    for (index, layer) in layers.iter().enumerate() {
        current = layer
            .output_shape(current)
            .map_err(|source| TopologyError::Layer {
                index,
                name: layer.name(),
                source,
            })?;
        shapes.push(current);
    }
    Ok(shapes)
}
