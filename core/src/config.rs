use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Load a JSON configuration from disk, creating it with the provided initializer if missing.
pub fn load_or_init<T, F>(path: &Path, initializer: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> T,
{
    if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        log::debug!("loaded config from {}", path.display());
        Ok(value)
    } else {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let value = initializer();
        let serialized = serde_json::to_string_pretty(&value)?;
        fs::write(path, serialized)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        log::info!("wrote default config to {}", path.display());
        Ok(value)
    }
}

/// Fixed settings shared by every run of the experiment.
///
/// Missing fields in an older `config.json` fall back to the defaults below.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperParameters {
    pub batch_size: usize,
    pub num_classes: usize,
    pub image_channels: usize,
    pub image_rows: usize,
    pub image_cols: usize,
    /// Standard deviation of the gaussian input noise.
    pub noise_sigma: f64,
    pub l1_weight: f64,
    pub l2_weight: f64,
    pub learning_rate: f64,
    pub momentum: f64,
    /// Per-iteration learning rate decay: `lr / (1 + decay * iteration)`.
    pub decay: f64,
    pub nesterov: bool,
    /// Trailing fraction of the training set held out for validation.
    pub validation_split: f64,
    pub width_shift_range: f64,
    pub height_shift_range: f64,
    pub horizontal_flip: bool,
    pub seed: u64,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub plot_width: u32,
    pub plot_height: u32,
}

impl Default for HyperParameters {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_classes: 10,
            image_channels: 3,
            image_rows: 32,
            image_cols: 32,
            noise_sigma: 0.01,
            l1_weight: 0.5,
            l2_weight: 0.5,
            learning_rate: 0.01,
            momentum: 0.9,
            decay: 1e-6,
            nesterov: true,
            validation_split: 0.2,
            width_shift_range: 0.1,
            height_shift_range: 0.1,
            horizontal_flip: true,
            seed: 1337,
            data_dir: PathBuf::from("data/cifar-10-batches-bin"),
            output_dir: PathBuf::from("output"),
            plot_width: 1800,
            plot_height: 1200,
        }
    }
}

impl HyperParameters {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.num_classes > 1, "num_classes must be at least 2");
        ensure!(
            self.image_channels > 0 && self.image_rows > 0 && self.image_cols > 0,
            "image dimensions must be positive"
        );
        ensure!(self.noise_sigma >= 0.0, "noise_sigma must not be negative");
        ensure!(
            self.l1_weight >= 0.0 && self.l2_weight >= 0.0,
            "regularization weights must not be negative"
        );
        ensure!(self.learning_rate > 0.0, "learning_rate must be positive");
        ensure!(
            (0.0..1.0).contains(&self.momentum),
            "momentum must be in [0, 1)"
        );
        ensure!(self.decay >= 0.0, "decay must not be negative");
        ensure!(
            self.validation_split > 0.0 && self.validation_split < 1.0,
            "validation_split must be in (0, 1), got {}",
            self.validation_split
        );
        ensure!(
            (0.0..1.0).contains(&self.width_shift_range)
                && (0.0..1.0).contains(&self.height_shift_range),
            "shift ranges must be in [0, 1)"
        );
        ensure!(
            self.plot_width >= 64 && self.plot_height >= 64,
            "plot must be at least 64x64 pixels"
        );
        Ok(())
    }

    /// Number of pixel values in one image.
    pub fn image_len(&self) -> usize {
        self.image_channels * self.image_rows * self.image_cols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_dir::TempDir;

    #[test]
    fn writes_defaults_then_reads_them_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.json");

        let created: HyperParameters = load_or_init(&path, HyperParameters::default).unwrap();
        assert!(path.exists());

        let loaded: HyperParameters = load_or_init(&path, || panic!("should not initialize")).unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "batch_size": 8, "seed": 7 }"#).unwrap();

        let loaded: HyperParameters = load_or_init(&path, HyperParameters::default).unwrap();
        assert_eq!(loaded.batch_size, 8);
        assert_eq!(loaded.seed, 7);
        assert_eq!(loaded.noise_sigma, 0.01);
        assert_eq!(loaded.l2_weight, 0.5);
    }

    #[test]
    fn malformed_files_are_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();

        let err = load_or_init::<HyperParameters, _>(&path, HyperParameters::default).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn defaults_are_valid() {
        let params = HyperParameters::default();
        params.validate().unwrap();
        assert_eq!(params.image_len(), 3 * 32 * 32);
    }

    #[test]
    fn rejects_degenerate_validation_split() {
        let params = HyperParameters {
            validation_split: 1.0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }
}
