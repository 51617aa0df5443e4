use convlab_core::{
    ConfigError, ExperimentArgs, ExperimentConfig, ExperimentFlags, HyperParameters, Layer,
    Regularization, Regularizer, Shape, Topology,
};

/// Every legal flag combination: five booleans times three regularization choices.
fn all_configs() -> Vec<ExperimentConfig> {
    let mut configs = Vec::new();
    for bits in 0u8..32 {
        let bit = |i: u8| bits & (1 << i) != 0;
        for regularization in Regularization::ALL {
            let epochs = if bit(4) { 2 } else { 1 };
            configs.push(
                ExperimentConfig::new(epochs, bit(0), bit(1), bit(2), bit(3), regularization).unwrap(),
            );
        }
    }
    configs
}

fn build(config: &ExperimentConfig) -> Topology {
    Topology::build(config, &HyperParameters::default()).unwrap()
}

fn rank(shape: Shape) -> usize {
    shape.rank()
}

#[test]
fn every_legal_combination_is_shape_consistent() {
    let configs = all_configs();
    assert_eq!(configs.len(), 96);

    for config in &configs {
        let topology = build(config);
        let shapes = topology.shapes();
        assert_eq!(shapes.len(), topology.len());

        let mut input = topology.input_shape();
        for (layer, &output) in topology.layers().iter().zip(shapes) {
            assert_eq!(layer.output_shape(input), Ok(output), "{config:?} at {}", layer.name());
            input = output;
        }
        assert_eq!(topology.output_shape(), Shape::Vector(10), "{config:?}");
    }
}

#[test]
fn dense_layers_always_follow_a_rank_one_shape() {
    for config in all_configs() {
        let topology = build(&config);
        let inputs = std::iter::once(topology.input_shape()).chain(topology.shapes().iter().copied());
        for (input, layer) in inputs.zip(topology.layers()) {
            match layer {
                Layer::Dense { .. } | Layer::MaxoutDense { .. } => assert_eq!(rank(input), 1),
                Layer::Conv2d { .. } | Layer::MaxPool2d { .. } | Layer::Flatten => {
                    assert_eq!(rank(input), 3)
                }
                _ => {}
            }
        }
    }
}

#[test]
fn conflicting_penalties_never_build() {
    for bits in 0u8..16 {
        let bit = |i: u8| bits & (1 << i) != 0;
        let flags = ExperimentFlags {
            epochs: Some(1),
            data_augmentation: bit(0),
            noise: bit(1),
            maxout: bit(2),
            dropout: bit(3),
            l1: true,
            l2: true,
        };
        assert!(matches!(
            flags.validate(),
            Err(ConfigError::ConflictingRegularization)
        ));
    }
}

#[test]
fn dropout_count_follows_the_flag() {
    for config in all_configs() {
        let dropouts = build(&config)
            .layers()
            .iter()
            .filter(|layer| matches!(layer, Layer::Dropout { .. }))
            .count();
        assert_eq!(dropouts, if config.dropout() { 3 } else { 0 });
    }
}

#[test]
fn dropout_rates_per_block() {
    let config = ExperimentConfig::new(1, false, false, false, true, Regularization::None).unwrap();
    let rates: Vec<f64> = build(&config)
        .layers()
        .iter()
        .filter_map(|layer| match layer {
            Layer::Dropout { rate } => Some(*rate),
            _ => None,
        })
        .collect();
    assert_eq!(rates, vec![0.25, 0.25, 0.5]);
}

#[test]
fn noise_comes_first_when_enabled() {
    for config in all_configs() {
        let topology = build(&config);
        let first = &topology.layers()[0];
        if config.noise() {
            assert_eq!(first, &Layer::GaussianNoise { sigma: 0.01 });
        } else {
            assert!(matches!(first, Layer::Conv2d { filters: 32, .. }));
        }
    }
}

#[test]
fn maxout_sits_between_flatten_and_hidden_dense() {
    for config in all_configs() {
        let layers = build(&config).layers().to_vec();
        let maxouts: Vec<usize> = layers
            .iter()
            .enumerate()
            .filter(|(_, layer)| matches!(layer, Layer::MaxoutDense { .. }))
            .map(|(index, _)| index)
            .collect();

        if config.maxout() {
            assert_eq!(maxouts.len(), 1);
            let index = maxouts[0];
            assert_eq!(layers[index], Layer::MaxoutDense { units: 512, pieces: 4 });
            assert_eq!(layers[index - 1], Layer::Flatten);
            assert!(matches!(layers[index + 1], Layer::Dense { units: 512, .. }));
        } else {
            assert!(maxouts.is_empty());
        }
    }
}

#[test]
fn hidden_dense_carries_the_selected_penalty() {
    for config in all_configs() {
        let topology = build(&config);
        let hidden = topology
            .layers()
            .iter()
            .find_map(|layer| match layer {
                Layer::Dense { units: 512, regularizer } => Some(*regularizer),
                _ => None,
            })
            .unwrap();
        let expected = match config.regularization() {
            Regularization::None => None,
            Regularization::L1 => Some(Regularizer::L1(0.5)),
            Regularization::L2 => Some(Regularizer::L2(0.5)),
        };
        assert_eq!(hidden, expected);
    }
}

#[test]
fn baseline_sequence_from_the_command_line() {
    let config = ExperimentArgs::parse(["-e", "1"])
        .unwrap()
        .into_config()
        .unwrap();
    assert_eq!(config.epochs(), 1);

    assert_eq!(
        build(&config).layer_names(),
        vec![
            "conv2d",
            "relu",
            "conv2d",
            "relu",
            "max_pool2d",
            "conv2d",
            "relu",
            "conv2d",
            "relu",
            "max_pool2d",
            "flatten",
            "dense",
            "relu",
            "dense",
            "softmax",
        ]
    );
}

#[test]
fn fully_loaded_sequence() {
    let config = ExperimentConfig::new(1, true, true, true, true, Regularization::L1).unwrap();
    assert_eq!(
        build(&config).layer_names(),
        vec![
            "gaussian_noise",
            "conv2d",
            "relu",
            "conv2d",
            "relu",
            "max_pool2d",
            "dropout",
            "conv2d",
            "relu",
            "conv2d",
            "relu",
            "max_pool2d",
            "dropout",
            "flatten",
            "maxout_dense",
            "dense_l1",
            "relu",
            "dropout",
            "dense",
            "softmax",
        ]
    );
}

#[test]
fn topology_is_deterministic() {
    for config in all_configs() {
        assert_eq!(build(&config), build(&config));
    }
}
