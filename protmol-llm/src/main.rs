use anyhow::{Result, ensure};
use candle_core::Device;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use protmol_llm::collate::Collator;
use protmol_llm::config::{MaxLengths, RunConfig};
use protmol_llm::data::{DataLoader, PairedSequenceDataset, random_split, split_rng};
use protmol_llm::diagnostics;
use protmol_llm::distributed::{DistributedConfig, Fabric, LocalFabric};
use protmol_llm::io::read_pair_columns;
use protmol_llm::metrics::{JsonlMetricsSink, MetricsSink, RunRecord};
use protmol_llm::tokenizer::{CombinedTokenizer, PairEncoder};
use protmol_llm::training::Trainer;

#[derive(Parser)]
#[command(name = "protmol-llm")]
#[command(about = "Train a decoder over concatenated protein / SMILES sequences")]
struct Cli {
    /// Path to the YAML run configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Rank for distributed training (0 to num_gpus-1)
    #[arg(long, env = "RANK", default_value = "0")]
    rank: usize,

    /// Communication file for NCCL ID exchange
    #[arg(long, default_value = "nccl_id.txt")]
    comm_file: String,
}

#[allow(unused_variables)]
fn get_device(num_gpus: usize, gpu_id: usize) -> Result<Device> {
    if num_gpus > 0 {
        #[cfg(feature = "metal")]
        {
            return Ok(Device::new_metal(gpu_id)?);
        }
        #[cfg(feature = "cuda")]
        {
            return Ok(Device::new_cuda(gpu_id)?);
        }
        #[cfg(not(any(feature = "metal", feature = "cuda")))]
        {
            tracing::warn!(
                "No GPU feature enabled, using CPU. Build with --features metal or --features cuda"
            );
            return Ok(Device::Cpu);
        }
    }
    Ok(Device::Cpu)
}

/// Seed every rank agrees on, so all of them draw the same split.
fn shared_seed<F: Fabric>(configured: Option<u64>, fabric: &F) -> Result<Option<u64>> {
    if configured.is_some() || fabric.world_size() == 1 {
        return Ok(configured);
    }
    let local = if fabric.is_main_process() {
        f64::from(rand::random::<u32>())
    } else {
        0.0
    };
    let summed = fabric.all_reduce_sum(&[local])?;
    Ok(summed.first().map(|&seed| seed as u64))
}

fn run<F: Fabric>(config: &RunConfig, fabric: F) -> Result<()> {
    let rank = fabric.rank();
    let is_main = fabric.is_main_process();
    let training_config = config.training_config()?;

    let encoder: Arc<dyn PairEncoder> = Arc::new(CombinedTokenizer::load(
        &config.protein_tokenizer,
        &config.smiles_tokenizer,
    )?);
    info!(
        rank,
        vocab_size = encoder.vocab_size(),
        delim_token_id = encoder.delim_token_id(),
        "Loaded tokenizers"
    );

    info!(rank, path = ?config.data_path, "Loading dataset");
    let columns = read_pair_columns(&config.data_path, &config.col_prots, &config.col_mols)?;
    let mut dataset = PairedSequenceDataset::try_from(columns)?;

    let mut rng = split_rng(shared_seed(config.seed, &fabric)?);
    if let Some(n) = config.sample_size {
        dataset = dataset.subsample(n, &mut rng);
    }
    ensure!(
        !dataset.is_empty(),
        "no usable rows in {}",
        config.data_path.display()
    );
    let dataset = Arc::new(dataset);
    let split = random_split(dataset.len(), config.validation_split, &mut rng);
    info!(
        rank,
        train = split.train.len(),
        val = split.val.len(),
        "Split dataset"
    );

    let max_lengths = config.max_lengths();
    let max_seq_len = config.max_seq_len.unwrap_or_else(|| match max_lengths {
        MaxLengths::Fixed { protein, molecule } => encoder.sequence_length(protein, molecule),
        MaxLengths::BatchLocal => {
            let (protein, molecule) = dataset.max_lengths();
            encoder.sequence_length(protein, molecule)
        }
    });

    let collator =
        Collator::new(encoder.clone(), max_lengths).with_shifted_labels(config.shifted_labels);
    let mut train_loader = fabric.setup_loader(DataLoader::new(
        dataset.clone(),
        split.train,
        config.batch_size,
        collator.clone(),
    ));
    let mut val_loader = fabric.setup_loader(DataLoader::new(
        dataset.clone(),
        split.val,
        config.batch_size,
        collator,
    ));
    if config.verbose {
        info!(
            rank,
            train_batches = train_loader.num_batches(),
            val_batches = val_loader.num_batches(),
            max_seq_len,
            "Prepared loaders"
        );
    }

    let model_config = config.model_config(encoder.vocab_size(), max_seq_len);
    info!(rank, "Model config: {:?}", model_config);
    let mut trainer = Trainer::new(model_config, training_config, encoder.as_ref(), fabric)?;
    if config.verbose && is_main {
        diagnostics::log_model_summary(trainer.var_map())?;
    }

    let mut sink = if config.get_wandb && is_main {
        let mut sink = JsonlMetricsSink::create(config.metrics_destination())?;
        sink.log_run(&RunRecord {
            project: config.project_name().to_string(),
            architecture: "decoder-only",
            dataset: config
                .data_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            learning_rate: config.learning_rate,
            batch_size: config.batch_size,
            num_epochs: config.num_epochs,
            d_model: config.d_model,
            num_heads: config.num_heads,
            ff_hidden_layer: config.ff_hidden_layer,
            dropout: config.dropout,
            num_layers: config.num_layers,
        })?;
        info!(path = ?sink.path(), "Logging metrics");
        Some(sink)
    } else {
        None
    };

    let summary = trainer.train(
        &mut train_loader,
        &mut val_loader,
        sink.as_mut().map(|s| s as &mut dyn MetricsSink),
    )?;
    info!(
        rank,
        best_val_accuracy = summary.best_val_accuracy,
        checkpoints_saved = summary.checkpoints_saved,
        "Training complete"
    );

    if config.verbose && is_main {
        diagnostics::write_memory_snapshot(trainer.var_map(), "memory_snapshot.json")?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RunConfig::from_file(&cli.config)?;

    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let start = Instant::now();
    let dist_config = DistributedConfig {
        world_size: config.world_size(),
        rank: cli.rank,
        comm_file: cli.comm_file,
    };
    ensure!(
        dist_config.rank < dist_config.world_size,
        "rank {} is out of range for {} processes",
        dist_config.rank,
        dist_config.world_size
    );

    // For distributed training, use rank as GPU ID
    let device = get_device(config.num_gpus, dist_config.rank)?;
    info!(rank = dist_config.rank, "Using device: {:?}", device);

    if dist_config.is_distributed() {
        #[cfg(feature = "nccl")]
        {
            let fabric = protmol_llm::distributed::NcclFabric::launch(&dist_config, device)?;
            run(&config, fabric)?;
        }
        #[cfg(not(feature = "nccl"))]
        {
            anyhow::bail!("Distributed training requires --features nccl");
        }
    } else {
        run(&config, LocalFabric::new(device))?;
    }

    info!(
        rank = dist_config.rank,
        "Finished in {:.1}s",
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
