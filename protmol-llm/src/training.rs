use anyhow::{Result, ensure};
use candle_core::{DType, Tensor};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use candle_nn::{VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tracing::{debug, info};

use crate::collate::EncodedBatch;
use crate::config::{LossFunction, ModelConfig, OptimizerKind, TrainingConfig};
use crate::data::DataLoader;
use crate::distributed::Fabric;
use crate::masking::{
    MaskedLoss, delimiter_loss_mask, label_targets, masked_cross_entropy, teacher_forcing_inputs,
};
use crate::metrics::{EpochRecord, MetricsSink, RunningMetrics};
use crate::model::{AttentionPattern, ProtMolDecoder};
use crate::tokenizer::PairEncoder;

/// Host-side numbers for one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    pub loss: f64,
    pub correct: u64,
    pub tokens: u64,
    /// Whether the optimizer stepped
    pub updated: bool,
}

/// Outcome of a full `train` call.
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub best_val_accuracy: f64,
    pub checkpoints_saved: usize,
    pub history: Vec<EpochRecord>,
}

/// Only a strictly greater accuracy replaces the best one.
pub fn is_improvement(best: f64, candidate: f64) -> bool {
    candidate > best
}

/// Next-token labels are scored at every position, so no position may look ahead.
pub fn attention_pattern(batch: &EncodedBatch) -> AttentionPattern {
    if batch.labels.is_some() {
        AttentionPattern::Causal
    } else {
        AttentionPattern::PrefixLm
    }
}

pub struct Trainer<F: Fabric> {
    model: ProtMolDecoder,
    optimizer: AdamW,
    var_map: VarMap,
    training_config: TrainingConfig,
    fabric: F,
    delim_token_id: u32,
    pad_token_id: u32,
    best_val_accuracy: f64,
    global_step: usize,
}

impl<F: Fabric> Trainer<F> {
    pub fn new(
        model_config: ModelConfig,
        training_config: TrainingConfig,
        encoder: &dyn PairEncoder,
        fabric: F,
    ) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, fabric.device());
        let model = ProtMolDecoder::new(&model_config, vb)?;

        ensure!(
            model.output_vocab_size() == encoder.vocab_size(),
            "model output layer has {} classes but the tokenizer has {} tokens",
            model.output_vocab_size(),
            encoder.vocab_size()
        );

        let optimizer = match training_config.optimizer {
            OptimizerKind::Adam => {
                let params = ParamsAdamW {
                    lr: training_config.learning_rate,
                    beta1: 0.9,
                    beta2: 0.999,
                    eps: 1e-8,
                    weight_decay: 0.0,
                };
                AdamW::new(var_map.all_vars(), params)?
            }
        };

        fabric.setup(&var_map)?;

        info!(
            rank = fabric.rank(),
            "Initialized model with {} parameters",
            model.num_parameters()
        );

        Ok(Self {
            model,
            optimizer,
            var_map,
            training_config,
            delim_token_id: encoder.delim_token_id(),
            pad_token_id: encoder.pad_token_id(),
            fabric,
            best_val_accuracy: 0.0,
            global_step: 0,
        })
    }

    fn score(&self, batch: &EncodedBatch, train: bool) -> Result<MaskedLoss> {
        let input_ids = self.fabric.to_device(&batch.input_ids)?;
        let attention_mask = self.fabric.to_device(&batch.attention_mask)?;
        let pattern = attention_pattern(batch);

        let scored = match &batch.labels {
            Some(labels) => {
                let labels = self.fabric.to_device(labels)?;
                let logits = self.model.forward(
                    &input_ids,
                    &attention_mask,
                    self.delim_token_id,
                    pattern,
                    train,
                )?;
                let (targets, keep) = label_targets(&labels)?;
                self.loss(&logits, &targets, &keep)?
            }
            None => {
                let (inputs, mask) = teacher_forcing_inputs(
                    &input_ids,
                    &attention_mask,
                    self.delim_token_id,
                    train && self.training_config.teacher_forcing,
                )?;
                let logits =
                    self.model
                        .forward(&inputs, &mask, self.delim_token_id, pattern, train)?;
                let selection = delimiter_loss_mask(&input_ids, self.delim_token_id)?;
                self.loss(&logits, &input_ids, &selection)?
            }
        };
        Ok(scored)
    }

    fn loss(
        &self,
        logits: &Tensor,
        targets: &Tensor,
        selection: &Tensor,
    ) -> Result<MaskedLoss> {
        match self.training_config.loss {
            LossFunction::CrossEntropy => Ok(masked_cross_entropy(
                logits,
                targets,
                selection,
                self.pad_token_id,
            )?),
        }
    }

    /// Forward, backward and one optimizer step.
    ///
    /// When no rank has a scored token the step is skipped everywhere.
    pub fn train_step(&mut self, batch: &EncodedBatch) -> Result<StepStats> {
        let scored = self.score(batch, true)?;
        let global_tokens = self.fabric.all_reduce_sum(&[scored.tokens as f64])?;
        let updated = global_tokens.first().copied().unwrap_or(0.0) > 0.0;

        if updated {
            let grads = self
                .fabric
                .backward(&scored.loss, &self.var_map.all_vars())?;
            self.optimizer.step(&grads)?;
            self.global_step += 1;
        } else {
            debug!(rank = self.fabric.rank(), "Skipping batch with no scored tokens");
        }

        Ok(StepStats {
            loss: scored.loss.to_scalar::<f32>()? as f64,
            correct: scored.correct,
            tokens: scored.tokens,
            updated,
        })
    }

    pub fn eval_step(&self, batch: &EncodedBatch) -> Result<StepStats> {
        let scored = self.score(batch, false)?;
        Ok(StepStats {
            loss: scored.loss.to_scalar::<f32>()? as f64,
            correct: scored.correct,
            tokens: scored.tokens,
            updated: false,
        })
    }

    fn progress_bar(&self, len: usize, phase: &'static str) -> Result<ProgressBar> {
        if !self.fabric.is_main_process() {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss: {msg}")?
                .progress_chars("##-"),
        );
        pb.set_prefix(phase);
        Ok(pb)
    }

    /// One pass over this rank's shard; returned metrics are summed over all ranks.
    pub fn train_epoch(&mut self, train_loader: &mut DataLoader) -> Result<RunningMetrics> {
        let pb = self.progress_bar(train_loader.num_batches(), "train")?;
        let mut metrics = RunningMetrics::default();

        train_loader.reset();
        while let Some(batch) = train_loader.next_batch()? {
            let stats = self.train_step(&batch)?;
            metrics.record(stats.loss, stats.correct, stats.tokens);
            pb.set_message(format!("{:.4}", stats.loss));
            pb.inc(1);
        }
        pb.finish_with_message("done");

        let reduced = self.fabric.all_reduce_sum(&metrics.to_array())?;
        Ok(RunningMetrics::from_array(&reduced))
    }

    pub fn evaluate(&self, val_loader: &mut DataLoader) -> Result<RunningMetrics> {
        let pb = self.progress_bar(val_loader.num_batches(), "val")?;
        let mut metrics = RunningMetrics::default();

        val_loader.reset();
        while let Some(batch) = val_loader.next_batch()? {
            let stats = self.eval_step(&batch)?;
            metrics.record(stats.loss, stats.correct, stats.tokens);
            pb.set_message(format!("{:.4}", stats.loss));
            pb.inc(1);
        }
        pb.finish_with_message("done");

        let reduced = self.fabric.all_reduce_sum(&metrics.to_array())?;
        Ok(RunningMetrics::from_array(&reduced))
    }

    /// Runs every epoch, saving weights whenever validation accuracy strictly improves.
    pub fn train(
        &mut self,
        train_loader: &mut DataLoader,
        val_loader: &mut DataLoader,
        mut sink: Option<&mut dyn MetricsSink>,
    ) -> Result<TrainSummary> {
        let rank = self.fabric.rank();
        let epochs = self.training_config.epochs;
        let mut history = Vec::with_capacity(epochs);
        let mut checkpoints_saved = 0;

        info!(rank, "Starting training for {} epochs", epochs);

        for epoch in 1..=epochs {
            let train = self.train_epoch(train_loader)?;
            let val = self.evaluate(val_loader)?;
            let record = EpochRecord::new(epoch, &train, &val);

            info!(
                rank,
                epoch,
                train_loss = record.train_loss,
                train_accuracy = ?record.train_accuracy,
                val_loss = record.val_loss,
                val_accuracy = ?record.val_accuracy,
                "Epoch {}/{} finished",
                epoch,
                epochs
            );

            if let Some(sink) = sink.as_deref_mut() {
                sink.log_epoch(&record)?;
            }

            if let Some(accuracy) = record
                .val_accuracy
                .filter(|&acc| is_improvement(self.best_val_accuracy, acc))
            {
                self.best_val_accuracy = accuracy;
                checkpoints_saved += 1;
                if self.fabric.is_main_process() {
                    let path = self.training_config.weights_path.clone();
                    self.save_checkpoint(&path)?;
                    info!(rank, epoch, accuracy, path = ?path, "Saved best weights");
                }
            }

            self.fabric.barrier()?;
            history.push(record);
        }

        Ok(TrainSummary {
            best_val_accuracy: self.best_val_accuracy,
            checkpoints_saved,
            history,
        })
    }

    /// Writes all parameters as safetensors.
    ///
    /// The file is overwritten in place, so an interrupted write can leave it truncated.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        self.var_map.save(path)?;
        Ok(())
    }

    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.var_map.load(path)?;
        Ok(())
    }

    pub fn model(&self) -> &ProtMolDecoder {
        &self.model
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    pub fn fabric(&self) -> &F {
        &self.fabric
    }

    pub fn best_val_accuracy(&self) -> f64 {
        self.best_val_accuracy
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collate::Collator;
    use crate::config::MaxLengths;
    use crate::data::{PairedSequenceDataset, random_split, split_rng};
    use crate::distributed::LocalFabric;
    use crate::tokenizer::CombinedTokenizer;
    use candle_core::Device;
    use std::sync::Arc;

    fn encoder() -> Arc<dyn PairEncoder> {
        Arc::new(CombinedTokenizer::builtin())
    }

    fn dataset() -> Arc<PairedSequenceDataset> {
        let proteins = ["MKTAY", "MKV", "ACDE", "MKTAYIA", "GHIK", "LMNP", "QRST", "VWY"];
        let molecules = ["CCO", "c1ccccc1", "CCN", "CC(=O)O", "CO", "CCCl", "N#N", "C=C"];
        Arc::new(
            PairedSequenceDataset::new(
                proteins.iter().map(|s| s.to_string()).collect(),
                molecules.iter().map(|s| s.to_string()).collect(),
            )
            .unwrap(),
        )
    }

    fn loaders(shifted_labels: bool) -> (DataLoader, DataLoader) {
        let data = dataset();
        let split = random_split(data.len(), 0.25, &mut split_rng(Some(5)));
        let collator =
            Collator::new(encoder(), MaxLengths::BatchLocal).with_shifted_labels(shifted_labels);
        (
            DataLoader::new(data.clone(), split.train, 2, collator.clone()),
            DataLoader::new(data, split.val, 2, collator),
        )
    }

    fn trainer(
        weights_path: &Path,
        epochs: usize,
        teacher_forcing: bool,
    ) -> Trainer<LocalFabric> {
        trainer_with_lr(weights_path, epochs, teacher_forcing, 1e-2)
    }

    fn trainer_with_lr(
        weights_path: &Path,
        epochs: usize,
        teacher_forcing: bool,
        learning_rate: f64,
    ) -> Trainer<LocalFabric> {
        let encoder = encoder();
        let training_config = TrainingConfig {
            learning_rate,
            epochs,
            teacher_forcing,
            weights_path: weights_path.to_path_buf(),
            ..Default::default()
        };
        Trainer::new(
            ModelConfig::nano(encoder.vocab_size(), 64),
            training_config,
            encoder.as_ref(),
            LocalFabric::cpu(),
        )
        .unwrap()
    }

    #[test]
    fn test_improvement_is_strict() {
        assert!(is_improvement(0.0, 0.1));
        assert!(!is_improvement(0.5, 0.5));
        assert!(!is_improvement(0.5, 0.4));
        assert!(!is_improvement(0.0, 0.0));
    }

    #[test]
    fn test_vocab_mismatch_is_rejected() {
        let encoder = encoder();
        let result = Trainer::new(
            ModelConfig::nano(encoder.vocab_size() + 1, 64),
            TrainingConfig::default(),
            encoder.as_ref(),
            LocalFabric::cpu(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_end_to_end_on_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("weights").join("best.safetensors");
        let (mut train_loader, mut val_loader) = loaders(false);
        let mut trainer = trainer(&weights, 3, true);

        let summary = trainer
            .train(&mut train_loader, &mut val_loader, None)
            .unwrap();

        assert_eq!(summary.history.len(), 3);
        assert_eq!(trainer.global_step(), 3 * train_loader.num_batches());
        for record in &summary.history {
            assert!(record.train_loss.is_finite());
            assert!(record.val_accuracy.is_some());
        }
        let best = summary
            .history
            .iter()
            .filter_map(|r| r.val_accuracy)
            .fold(0.0, f64::max);
        assert_eq!(summary.best_val_accuracy, best);
        assert!(summary.checkpoints_saved <= 3);
        assert_eq!(summary.checkpoints_saved > 0, weights.exists());
    }

    #[test]
    fn test_checkpoint_reload_reproduces_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("best.safetensors");
        let (mut train_loader, mut val_loader) = loaders(false);

        let mut first = trainer(&weights, 1, false);
        first.train_epoch(&mut train_loader).unwrap();
        first.save_checkpoint(&weights).unwrap();
        let expected = first.evaluate(&mut val_loader).unwrap();

        let mut second = trainer(&weights, 1, false);
        second.load_checkpoint(&weights).unwrap();
        let reloaded = second.evaluate(&mut val_loader).unwrap();

        assert_eq!(reloaded.correct, expected.correct);
        assert_eq!(reloaded.tokens, expected.tokens);
        assert!((reloaded.loss_sum - expected.loss_sum).abs() < 1e-4);
    }

    #[test]
    fn test_batch_without_delimiter_does_not_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = trainer(&dir.path().join("w.safetensors"), 1, false);
        let before: Vec<f32> = trainer.var_map().all_vars()[0]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        let ids = Tensor::new(&[[1u32, 5, 6, 7, 2], [1, 8, 9, 2, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 1, 1], [1, 1, 1, 1, 0]], &Device::Cpu).unwrap();
        let batch = EncodedBatch {
            input_ids: ids,
            attention_mask: mask,
            labels: None,
        };

        let stats = trainer.train_step(&batch).unwrap();
        assert_eq!(stats.tokens, 0);
        assert_eq!(stats.loss, 0.0);
        assert!(!stats.updated);
        assert_eq!(trainer.global_step(), 0);

        let after: Vec<f32> = trainer.var_map().all_vars()[0]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_shifted_labels_objective_trains() {
        let dir = tempfile::tempdir().unwrap();
        let (mut train_loader, _) = loaders(true);
        let mut trainer = trainer(&dir.path().join("w.safetensors"), 1, false);

        let batch = train_loader.next_batch().unwrap().unwrap();
        assert!(batch.labels.is_some());
        assert_eq!(attention_pattern(&batch), AttentionPattern::Causal);
        let stats = trainer.train_step(&batch).unwrap();
        assert!(stats.tokens > 0);
        assert!(stats.updated);
        assert!(stats.loss.is_finite());
    }

    #[test]
    fn test_saved_weights_reproduce_best_accuracy() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("best.safetensors");
        let (mut train_loader, mut val_loader) = loaders(false);

        let mut trainer = trainer(&weights, 4, false);
        let summary = trainer
            .train(&mut train_loader, &mut val_loader, None)
            .unwrap();
        assert!(summary.checkpoints_saved > 0);
        assert!(summary.best_val_accuracy > 0.0);

        let mut reloaded = trainer_with_lr(&weights, 1, false, 1e-2);
        reloaded.load_checkpoint(&weights).unwrap();
        let metrics = reloaded.evaluate(&mut val_loader).unwrap();
        assert_eq!(metrics.accuracy(), Some(summary.best_val_accuracy));
    }

    #[test]
    fn test_undefined_validation_accuracy_never_saves() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("best.safetensors");
        let (mut train_loader, _) = loaders(false);
        let collator = Collator::new(encoder(), MaxLengths::BatchLocal);
        let mut empty_val = DataLoader::new(dataset(), Vec::new(), 2, collator);

        let mut trainer = trainer(&weights, 2, false);
        let summary = trainer
            .train(&mut train_loader, &mut empty_val, None)
            .unwrap();

        assert!(summary.history.iter().all(|r| r.val_accuracy.is_none()));
        assert_eq!(summary.checkpoints_saved, 0);
        assert_eq!(summary.best_val_accuracy, 0.0);
        assert!(!weights.exists());
    }

    #[test]
    fn test_tied_accuracy_does_not_checkpoint_again() {
        let dir = tempfile::tempdir().unwrap();
        let warm = dir.path().join("warm.safetensors");
        let weights = dir.path().join("best.safetensors");
        let (mut train_loader, mut val_loader) = loaders(false);

        let mut warmup = trainer(&warm, 3, false);
        warmup
            .train(&mut train_loader, &mut val_loader, None)
            .unwrap();
        assert!(warm.exists());

        // a zero learning rate keeps the weights, so every epoch ties the first
        let mut frozen = trainer_with_lr(&weights, 3, false, 0.0);
        frozen.load_checkpoint(&warm).unwrap();
        let summary = frozen
            .train(&mut train_loader, &mut val_loader, None)
            .unwrap();

        let first = summary.history[0].val_accuracy.unwrap();
        assert!(first > 0.0);
        assert!(
            summary
                .history
                .iter()
                .all(|r| r.val_accuracy == Some(first))
        );
        assert_eq!(summary.checkpoints_saved, 1);
        assert_eq!(summary.best_val_accuracy, first);
    }

    #[test]
    fn test_teacher_forcing_scores_unshifted_inputs() {
        use crate::masking::shift_after_delimiter;

        let dir = tempfile::tempdir().unwrap();
        let (mut train_loader, _) = loaders(false);
        let batch = train_loader.next_batch().unwrap().unwrap();
        let delim = encoder().delim_token_id();
        let trainer = trainer(&dir.path().join("w.safetensors"), 1, true);

        assert_eq!(attention_pattern(&batch), AttentionPattern::PrefixLm);
        let scored = trainer.score(&batch, true).unwrap();

        let (shifted, shifted_mask) =
            shift_after_delimiter(&batch.input_ids, &batch.attention_mask, delim).unwrap();
        let logits = trainer
            .model()
            .forward(&shifted, &shifted_mask, delim, AttentionPattern::PrefixLm, false)
            .unwrap();
        let selection = delimiter_loss_mask(&batch.input_ids, delim).unwrap();
        let expected = masked_cross_entropy(&logits, &batch.input_ids, &selection, 0).unwrap();
        let against_shifted = masked_cross_entropy(&logits, &shifted, &selection, 0).unwrap();

        assert_eq!(scored.tokens, expected.tokens);
        assert_eq!(scored.correct, expected.correct);
        let loss = scored.loss.to_scalar::<f32>().unwrap();
        let expected_loss = expected.loss.to_scalar::<f32>().unwrap();
        assert!((loss - expected_loss).abs() < 1e-5);
        assert!(against_shifted.tokens < expected.tokens);
    }
}
