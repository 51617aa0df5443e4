use std::{env, ffi::OsString};

use pico_args::Arguments;
use thiserror::Error;

pub const DEFAULT_EPOCHS: usize = 50;

/// The only value a boolean flag accepts as true. Anything else reads as false.
const TRUE_LITERAL: &str = "True";

pub const USAGE: &str = "\
Usage: cifar10-cnn [-e EPOCHS] [-a True] [-n True] [-m True] [-d True] [-l True | -r True]

  -e EPOCHS   number of training epochs (default 50)
  -a True     real-time data augmentation (shifts and horizontal flips)
  -n True     gaussian noise on the inputs
  -m True     maxout dense layer before the hidden dense layer
  -d True     dropout after each convolutional block and the hidden layer
  -l True     L1 weight penalty on the hidden dense layer
  -r True     L2 weight penalty on the hidden dense layer
  -h, --help  print this message

Boolean flags are enabled only by the literal value `True`.
Positional arguments are ignored; unknown options are an error.
";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No need to run l1 and l2 regularization in the same time")]
    ConflictingRegularization,
    #[error("epoch count must be positive")]
    InvalidEpochs,
    #[error("unknown options: {0:?}")]
    UnexpectedArguments(Vec<OsString>),
    #[error(transparent)]
    Arguments(#[from] pico_args::Error),
}

/// Weight penalty applied to the hidden dense layer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Regularization {
    #[default]
    None,
    L1,
    L2,
}

impl Regularization {
    pub const ALL: [Regularization; 3] = [Self::None, Self::L1, Self::L2];

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::L1 => "l1",
            Self::L2 => "l2",
        }
    }
}

/// Flags exactly as they were requested, before the L1/L2 conflict is checked.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExperimentFlags {
    pub epochs: Option<usize>,
    pub data_augmentation: bool,
    pub noise: bool,
    pub maxout: bool,
    pub dropout: bool,
    pub l1: bool,
    pub l2: bool,
}

impl ExperimentFlags {
    pub fn validate(self) -> Result<ExperimentConfig, ConfigError> {
        let regularization = match (self.l1, self.l2) {
            (true, true) => return Err(ConfigError::ConflictingRegularization),
            (true, false) => Regularization::L1,
            (false, true) => Regularization::L2,
            (false, false) => Regularization::None,
        };

        let epochs = self.epochs.unwrap_or(DEFAULT_EPOCHS);
        if epochs == 0 {
            return Err(ConfigError::InvalidEpochs);
        }

        Ok(ExperimentConfig {
            epochs,
            data_augmentation: self.data_augmentation,
            noise: self.noise,
            maxout: self.maxout,
            dropout: self.dropout,
            regularization,
        })
    }
}

/// A validated experiment. L1 and L2 can never both be set.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExperimentConfig {
    epochs: usize,
    data_augmentation: bool,
    noise: bool,
    maxout: bool,
    dropout: bool,
    regularization: Regularization,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            data_augmentation: false,
            noise: false,
            maxout: false,
            dropout: false,
            regularization: Regularization::None,
        }
    }
}

impl ExperimentConfig {
    pub fn new(
        epochs: usize,
        data_augmentation: bool,
        noise: bool,
        maxout: bool,
        dropout: bool,
        regularization: Regularization,
    ) -> Result<Self, ConfigError> {
        if epochs == 0 {
            return Err(ConfigError::InvalidEpochs);
        }
        Ok(Self {
            epochs,
            data_augmentation,
            noise,
            maxout,
            dropout,
            regularization,
        })
    }

    pub fn epochs(&self) -> usize {
        self.epochs
    }

    pub fn data_augmentation(&self) -> bool {
        self.data_augmentation
    }

    pub fn noise(&self) -> bool {
        self.noise
    }

    pub fn maxout(&self) -> bool {
        self.maxout
    }

    pub fn dropout(&self) -> bool {
        self.dropout
    }

    pub fn regularization(&self) -> Regularization {
        self.regularization
    }

    pub fn l1(&self) -> bool {
        self.regularization == Regularization::L1
    }

    pub fn l2(&self) -> bool {
        self.regularization == Regularization::L2
    }

    /// Human-readable settings in the order they are reported.
    pub fn settings_summary(&self) -> Vec<(&'static str, String)> {
        vec![
            ("number of epoch", self.epochs.to_string()),
            ("data augmentation", self.data_augmentation.to_string()),
            ("noise", self.noise.to_string()),
            ("maxout", self.maxout.to_string()),
            ("dropout", self.dropout.to_string()),
            ("l1", self.l1().to_string()),
            ("l2", self.l2().to_string()),
        ]
    }
}

#[derive(Clone, Debug)]
pub struct ExperimentArgs {
    flags: ExperimentFlags,
    help_requested: bool,
}

impl ExperimentArgs {
    pub fn parse_from_env() -> Result<Self, ConfigError> {
        Self::parse(env::args_os().skip(1))
    }

    pub fn parse<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut pargs = Arguments::from_vec(args.into_iter().map(Into::into).collect());

        if pargs.contains(["-h", "--help"]) {
            return Ok(Self {
                flags: ExperimentFlags::default(),
                help_requested: true,
            });
        }

        let flags = ExperimentFlags {
            epochs: pargs.opt_value_from_str("-e")?,
            data_augmentation: bool_flag(&mut pargs, "-a")?,
            noise: bool_flag(&mut pargs, "-n")?,
            maxout: bool_flag(&mut pargs, "-m")?,
            dropout: bool_flag(&mut pargs, "-d")?,
            l1: bool_flag(&mut pargs, "-l")?,
            l2: bool_flag(&mut pargs, "-r")?,
        };

        let (unknown, positional): (Vec<_>, Vec<_>) = pargs
            .finish()
            .into_iter()
            .partition(|arg| arg.to_string_lossy().starts_with('-'));
        if !unknown.is_empty() {
            return Err(ConfigError::UnexpectedArguments(unknown));
        }
        if !positional.is_empty() {
            log::warn!("ignoring positional arguments: {positional:?}");
        }

        Ok(Self {
            flags,
            help_requested: false,
        })
    }

    pub fn help_requested(&self) -> bool {
        self.help_requested
    }

    pub fn flags(&self) -> &ExperimentFlags {
        &self.flags
    }

    pub fn into_config(self) -> Result<ExperimentConfig, ConfigError> {
        self.flags.validate()
    }
}

fn bool_flag(pargs: &mut Arguments, key: &'static str) -> Result<bool, ConfigError> {
    let value: Option<String> = pargs.opt_value_from_str(key)?;
    Ok(value.as_deref() == Some(TRUE_LITERAL))
}
