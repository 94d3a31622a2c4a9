pub mod collate;
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod distributed;
pub mod error;
pub mod io;
pub mod masking;
pub mod metrics;
pub mod model;
pub mod tokenizer;
pub mod training;

pub use collate::{Collator, EncodedBatch, IGNORE_INDEX};
pub use config::{ModelConfig, RunConfig, TrainingConfig};
pub use data::{DataLoader, PairedSequenceDataset, Sample};
pub use distributed::{DistributedConfig, Fabric, LocalFabric};
#[cfg(feature = "nccl")]
pub use distributed::{NcclCommunicator, NcclFabric};
pub use error::{ConfigError, DataError};
pub use metrics::{EpochRecord, JsonlMetricsSink, MetricsSink, RunningMetrics};
pub use model::{AttentionPattern, ProtMolDecoder};
pub use tokenizer::{CombinedTokenizer, PairEncoder};
pub use training::{TrainSummary, Trainer};
