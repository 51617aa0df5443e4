//! The CIFAR-10 binary distribution.
//!
//! Download `cifar-10-binary.tar.gz` from <https://www.cs.toronto.edu/~kriz/cifar.html>
//! and unpack it so the `data_batch_*.bin` and `test_batch.bin` files sit in
//! the configured data directory.

use std::{fs, path::Path};

use anyhow::{bail, ensure, Context, Result};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use burn_dataset::Dataset;
use convlab_core::HyperParameters;
use rand::Rng;

use crate::augment::Augmentation;

pub const CHANNELS: usize = 3;
pub const HEIGHT: usize = 32;
pub const WIDTH: usize = 32;
pub const IMAGE_LEN: usize = CHANNELS * HEIGHT * WIDTH;
const RECORD_LEN: usize = IMAGE_LEN + 1;

pub const CLASS_NAMES: [&str; 10] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CifarItem {
    /// Planar channel-major pixels: all red, then green, then blue.
    pub image: Vec<u8>,
    pub label: u8,
}

#[derive(Clone, Debug, Default)]
pub struct CifarDataset {
    items: Vec<CifarItem>,
}

impl CifarDataset {
    pub fn new(items: Vec<CifarItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[CifarItem] {
        &self.items
    }

    /// Hold out the trailing `fraction` of the items, keeping their order.
    pub fn split_tail(mut self, fraction: f64) -> (Self, Self) {
        let keep = (self.items.len() as f64 * (1.0 - fraction)) as usize;
        let held_out = self.items.split_off(keep.min(self.items.len()));
        (self, Self::new(held_out))
    }
}

impl Dataset<CifarItem> for CifarDataset {
    fn get(&self, index: usize) -> Option<CifarItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

pub struct Cifar10 {
    pub train: CifarDataset,
    pub test: CifarDataset,
}

pub struct Cifar10Splits {
    pub train: CifarDataset,
    pub validation: CifarDataset,
    pub test: CifarDataset,
}

impl Cifar10 {
    pub fn split(self, validation_split: f64) -> Cifar10Splits {
        let (train, validation) = self.train.split_tail(validation_split);
        Cifar10Splits {
            train,
            validation,
            test: self.test,
        }
    }
}

pub fn load_dir(dir: &Path) -> Result<Cifar10> {
    let mut train = Vec::new();
    for name in TRAIN_FILES {
        train.extend(read_file(&dir.join(name))?);
    }
    let test = read_file(&dir.join(TEST_FILE))?;

    log::info!(
        "loaded CIFAR-10 from {}: {} train samples, {} test samples",
        dir.display(),
        train.len(),
        test.len()
    );

    Ok(Cifar10 {
        train: CifarDataset::new(train),
        test: CifarDataset::new(test),
    })
}

pub fn read_file(path: &Path) -> Result<Vec<CifarItem>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_records(&bytes).with_context(|| format!("malformed CIFAR-10 file {}", path.display()))
}

fn parse_records(bytes: &[u8]) -> Result<Vec<CifarItem>> {
    ensure!(!bytes.is_empty(), "file is empty");
    ensure!(
        bytes.len() % RECORD_LEN == 0,
        "length {} is not a multiple of the {}-byte record size",
        bytes.len(),
        RECORD_LEN
    );

    bytes
        .chunks_exact(RECORD_LEN)
        .enumerate()
        .map(|(index, record)| {
            let label = record[0];
            if label as usize >= CLASS_NAMES.len() {
                bail!("record {} has label {} outside 0..10", index, label);
            }
            Ok(CifarItem {
                image: record[1..].to_vec(),
                label,
            })
        })
        .collect()
}

/// The classifier's input and output sizes have to agree with the dataset.
pub fn ensure_compatible(params: &HyperParameters) -> Result<()> {
    ensure!(
        [params.image_channels, params.image_rows, params.image_cols] == [CHANNELS, HEIGHT, WIDTH],
        "CIFAR-10 images are {}x{}x{}, config asks for {}x{}x{}",
        CHANNELS,
        HEIGHT,
        WIDTH,
        params.image_channels,
        params.image_rows,
        params.image_cols
    );
    ensure!(
        params.num_classes == CLASS_NAMES.len(),
        "CIFAR-10 has {} classes, config asks for {}",
        CLASS_NAMES.len(),
        params.num_classes
    );
    Ok(())
}

#[derive(Clone, Debug)]
pub struct CifarBatch<B: Backend> {
    /// `[batch, channels, height, width]`, scaled to `[0, 1]`.
    pub images: Tensor<B, 4>,
    /// One-hot class matrix `[batch, classes]`.
    pub targets: Tensor<B, 2>,
    pub labels: Tensor<B, 1, Int>,
}

#[derive(Clone, Copy, Debug)]
pub struct CifarBatcher {
    num_classes: usize,
}

impl CifarBatcher {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }

    pub fn batch<B: Backend>(&self, items: &[&CifarItem], device: &B::Device) -> CifarBatch<B> {
        let pixels = scaled_pixels(items);
        self.assemble(items, pixels, device)
    }

    pub fn augmented_batch<B: Backend, R: Rng>(
        &self,
        items: &[&CifarItem],
        augmentation: &Augmentation,
        rng: &mut R,
        device: &B::Device,
    ) -> CifarBatch<B> {
        let mut pixels = scaled_pixels(items);
        for image in pixels.chunks_exact_mut(IMAGE_LEN) {
            augmentation.apply(image, [CHANNELS, HEIGHT, WIDTH], rng);
        }
        self.assemble(items, pixels, device)
    }

    fn assemble<B: Backend>(
        &self,
        items: &[&CifarItem],
        pixels: Vec<f32>,
        device: &B::Device,
    ) -> CifarBatch<B> {
        let batch_size = items.len();
        let mut one_hot = vec![0.0f32; batch_size * self.num_classes];
        let mut labels = Vec::with_capacity(batch_size);
        for (row, item) in items.iter().enumerate() {
            one_hot[row * self.num_classes + item.label as usize] = 1.0;
            labels.push(item.label as i64);
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(pixels, [batch_size, CHANNELS, HEIGHT, WIDTH]),
            device,
        );
        let targets = Tensor::<B, 2>::from_floats(
            TensorData::new(one_hot, [batch_size, self.num_classes]),
            device,
        );
        let labels = Tensor::<B, 1, Int>::from_ints(TensorData::new(labels, [batch_size]), device);

        CifarBatch {
            images,
            targets,
            labels,
        }
    }
}

fn scaled_pixels(items: &[&CifarItem]) -> Vec<f32> {
    let mut pixels = Vec::with_capacity(items.len() * IMAGE_LEN);
    for item in items {
        pixels.extend(item.image.iter().map(|&p| p as f32 / 255.0));
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_candle::{Candle, CandleDevice};
    use temp_dir::TempDir;

    type TestBackend = Candle<f32, i64>;

    fn record(label: u8, fill: u8) -> Vec<u8> {
        let mut bytes = vec![label];
        bytes.extend(std::iter::repeat(fill).take(IMAGE_LEN));
        bytes
    }

    fn item(label: u8, fill: u8) -> CifarItem {
        CifarItem {
            image: vec![fill; IMAGE_LEN],
            label,
        }
    }

    #[test]
    fn reads_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch.bin");
        let mut bytes = record(3, 10);
        bytes.extend(record(9, 255));
        fs::write(&path, bytes).unwrap();

        let items = read_file(&path).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], item(3, 10));
        assert_eq!(items[1].label, 9);
    }

    #[test]
    fn rejects_truncated_files() {
        let mut bytes = record(1, 0);
        bytes.pop();
        assert!(parse_records(&bytes).is_err());
        assert!(parse_records(&[]).is_err());
    }

    #[test]
    fn rejects_unknown_labels() {
        let err = parse_records(&record(10, 0)).unwrap_err();
        assert!(err.to_string().contains("label 10"));
    }

    #[test]
    fn missing_directory_names_the_file() {
        let dir = TempDir::new().unwrap();
        let err = load_dir(&dir.path().join("absent")).err().unwrap();
        assert!(format!("{err:#}").contains("data_batch_1.bin"));
    }

    #[test]
    fn split_holds_out_the_tail() {
        let dataset = CifarDataset::new((0..10).map(|label| item(label, label)).collect());
        let (train, validation) = dataset.split_tail(0.2);
        assert_eq!(train.len(), 8);
        assert_eq!(validation.len(), 2);
        assert_eq!(validation.items()[0].label, 8);
        assert_eq!(train.get(7).unwrap().label, 7);
    }

    #[test]
    fn default_hyper_parameters_fit_cifar() {
        ensure_compatible(&HyperParameters::default()).unwrap();
        let params = HyperParameters {
            num_classes: 100,
            ..Default::default()
        };
        assert!(ensure_compatible(&params).is_err());
    }

    #[test]
    fn batches_scale_pixels_and_encode_labels() {
        let device = CandleDevice::Cpu;
        let first = item(2, 255);
        let second = item(7, 0);
        let batch = CifarBatcher::new(10).batch::<TestBackend>(&[&first, &second], &device);

        assert_eq!(batch.images.dims(), [2, 3, 32, 32]);
        assert_eq!(batch.targets.dims(), [2, 10]);

        let targets = batch.targets.into_data().to_vec::<f32>().unwrap();
        assert_eq!(targets[2], 1.0);
        assert_eq!(targets[10 + 7], 1.0);
        assert_eq!(targets.iter().sum::<f32>(), 2.0);

        let images = batch.images.into_data().to_vec::<f32>().unwrap();
        assert_eq!(images[0], 1.0);
        assert_eq!(images[IMAGE_LEN], 0.0);

        let labels = batch.labels.into_data().to_vec::<i64>().unwrap();
        assert_eq!(labels, vec![2, 7]);
    }
}
