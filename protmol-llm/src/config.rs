use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

/// Decoder hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Size of the combined protein + SMILES vocabulary
    pub vocab_size: usize,
    /// Longest sequence the positional table covers
    pub max_seq_len: usize,
    /// Embedding dimension
    pub d_model: usize,
    /// Number of decoder layers
    pub num_layers: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Hidden width of the feed-forward block
    pub ff_hidden_layer: usize,
    /// Dropout probability
    pub dropout: f64,
    /// Norm epsilon
    pub layer_norm_eps: f64,
}

impl ModelConfig {
    /// Small configuration for tests and smoke runs.
    pub fn nano(vocab_size: usize, max_seq_len: usize) -> Self {
        Self {
            vocab_size,
            max_seq_len,
            d_model: 32,
            num_layers: 2,
            num_heads: 2,
            ff_hidden_layer: 64,
            dropout: 0.0,
            layer_norm_eps: 1e-5,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.num_heads
    }
}

/// Loss functions the trainer knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LossFunction {
    CrossEntropy,
}

impl FromStr for LossFunction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crossentropy" => Ok(Self::CrossEntropy),
            other => Err(ConfigError::UnsupportedLoss(other.to_string())),
        }
    }
}

/// Optimizers the trainer knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OptimizerKind {
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Adam" => Ok(Self::Adam),
            other => Err(ConfigError::UnsupportedOptimizer(other.to_string())),
        }
    }
}

/// How the collator sizes each field before tokenization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLengths {
    /// Longest protein / molecule in each batch.
    BatchLocal,
    /// The same lengths for every batch.
    Fixed { protein: usize, molecule: usize },
}

/// The YAML run document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// CSV file holding the paired sequences (.gz / .zst accepted)
    pub data_path: PathBuf,
    /// Column holding protein sequences
    pub col_prots: String,
    /// Column holding SMILES strings
    pub col_mols: String,
    /// Protein tokenizer: `residues`, a tokenizer.json path, or a hub identifier
    pub protein_tokenizer: String,
    /// SMILES tokenizer: `smiles-chars`, a tokenizer.json path, or a hub identifier
    pub smiles_tokenizer: String,
    /// Where the best weights are written
    pub weights_path: PathBuf,

    #[serde(default = "defaults::d_model")]
    pub d_model: usize,
    #[serde(default = "defaults::num_heads")]
    pub num_heads: usize,
    #[serde(default = "defaults::ff_hidden_layer")]
    pub ff_hidden_layer: usize,
    #[serde(default = "defaults::dropout")]
    pub dropout: f64,
    #[serde(default = "defaults::num_layers")]
    pub num_layers: usize,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    #[serde(default = "defaults::num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "defaults::learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "defaults::loss_function")]
    pub loss_function: String,
    #[serde(default = "defaults::optimizer")]
    pub optimizer: String,
    #[serde(default)]
    pub teacher_forcing: bool,
    #[serde(default = "defaults::validation_split")]
    pub validation_split: f64,
    #[serde(default)]
    pub get_wandb: bool,
    #[serde(default = "defaults::num_gpus")]
    pub num_gpus: usize,
    #[serde(default)]
    pub verbose: bool,

    /// Run name for the metrics sink
    #[serde(default)]
    pub wandb_project: Option<String>,
    /// Metrics sink destination, defaults to `metrics/<project>.jsonl`
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
    /// Randomly keep this many rows of the source file
    #[serde(default)]
    pub sample_size: Option<usize>,
    /// Seed for subsampling and the train/validation split
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub prot_max_length: Option<usize>,
    #[serde(default)]
    pub mol_max_length: Option<usize>,
    /// Emit next-token labels with protein positions ignored
    #[serde(default)]
    pub shifted_labels: bool,
    /// Positional table size, derived from the data when absent
    #[serde(default)]
    pub max_seq_len: Option<usize>,
}

mod defaults {
    pub fn d_model() -> usize {
        1000
    }
    pub fn num_heads() -> usize {
        8
    }
    pub fn ff_hidden_layer() -> usize {
        4 * 1000
    }
    pub fn dropout() -> f64 {
        0.1
    }
    pub fn num_layers() -> usize {
        12
    }
    pub fn batch_size() -> usize {
        4
    }
    pub fn num_epochs() -> usize {
        10
    }
    pub fn learning_rate() -> f64 {
        1e-4
    }
    pub fn loss_function() -> String {
        "crossentropy".to_string()
    }
    pub fn optimizer() -> String {
        "Adam".to_string()
    }
    pub fn validation_split() -> f64 {
        0.2
    }
    pub fn num_gpus() -> usize {
        1
    }
}

impl RunConfig {
    /// Read and validate a YAML run document.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.loss()?;
        self.optimizer_kind()?;

        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(invalid("validation_split", "must lie in [0, 1)"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be positive"));
        }
        if self.num_heads == 0 || self.d_model % self.num_heads != 0 {
            return Err(invalid(
                "num_heads",
                format!("must divide d_model ({})", self.d_model),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(invalid("dropout", "must lie in [0, 1)"));
        }
        if self.learning_rate <= 0.0 {
            return Err(invalid("learning_rate", "must be positive"));
        }
        if self.prot_max_length.is_some() != self.mol_max_length.is_some() {
            return Err(invalid(
                "prot_max_length",
                "prot_max_length and mol_max_length must be set together",
            ));
        }
        if self.sample_size == Some(0) {
            return Err(invalid("sample_size", "must be positive"));
        }
        if self.shifted_labels && self.teacher_forcing {
            return Err(invalid(
                "teacher_forcing",
                "cannot be combined with shifted_labels",
            ));
        }
        Ok(())
    }

    pub fn loss(&self) -> Result<LossFunction, ConfigError> {
        self.loss_function.parse()
    }

    pub fn optimizer_kind(&self) -> Result<OptimizerKind, ConfigError> {
        self.optimizer.parse()
    }

    pub fn max_lengths(&self) -> MaxLengths {
        match (self.prot_max_length, self.mol_max_length) {
            (Some(protein), Some(molecule)) => MaxLengths::Fixed { protein, molecule },
            _ => MaxLengths::BatchLocal,
        }
    }

    pub fn world_size(&self) -> usize {
        self.num_gpus.max(1)
    }

    pub fn project_name(&self) -> &str {
        self.wandb_project.as_deref().unwrap_or("protmol")
    }

    pub fn metrics_destination(&self) -> PathBuf {
        self.metrics_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("metrics/{}.jsonl", self.project_name())))
    }

    pub fn model_config(&self, vocab_size: usize, max_seq_len: usize) -> ModelConfig {
        ModelConfig {
            vocab_size,
            max_seq_len,
            d_model: self.d_model,
            num_layers: self.num_layers,
            num_heads: self.num_heads,
            ff_hidden_layer: self.ff_hidden_layer,
            dropout: self.dropout,
            layer_norm_eps: 1e-5,
        }
    }

    pub fn training_config(&self) -> Result<TrainingConfig, ConfigError> {
        Ok(TrainingConfig {
            learning_rate: self.learning_rate,
            epochs: self.num_epochs,
            loss: self.loss()?,
            optimizer: self.optimizer_kind()?,
            teacher_forcing: self.teacher_forcing,
            weights_path: self.weights_path.clone(),
        })
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: reason.into(),
    }
}

/// Settings the trainer needs once the run document has been resolved.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub epochs: usize,
    pub loss: LossFunction,
    pub optimizer: OptimizerKind,
    /// Shift the post-delimiter segment by one position during training
    pub teacher_forcing: bool,
    pub weights_path: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            epochs: 10,
            loss: LossFunction::CrossEntropy,
            optimizer: OptimizerKind::Adam,
            teacher_forcing: false,
            weights_path: PathBuf::from("weights/best_model_weights.safetensors"),
        }
    }
}
