use anyhow::{Result, ensure};
use candle_core::{Device, Tensor};
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::MaxLengths;
use crate::data::Sample;
use crate::tokenizer::PairEncoder;

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// One padded batch, built per step and dropped after it.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    /// `(batch, seq_len)` token ids, U32
    pub input_ids: Tensor,
    /// `(batch, seq_len)` 1 for real tokens, 0 for padding, U32
    pub attention_mask: Tensor,
    /// `(batch, seq_len)` next-token targets or `IGNORE_INDEX`, I64
    pub labels: Option<Tensor>,
}

impl EncodedBatch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.dims().get(1).copied().unwrap_or(0)
    }
}

/// Tokenizes raw pairs into an `EncodedBatch`.
#[derive(Clone)]
pub struct Collator {
    encoder: Arc<dyn PairEncoder>,
    max_lengths: MaxLengths,
    shifted_labels: bool,
    ignored_label_ids: HashSet<u32>,
}

impl Collator {
    pub fn new(encoder: Arc<dyn PairEncoder>, max_lengths: MaxLengths) -> Self {
        let ignored_label_ids = encoder.ignored_label_ids().into_iter().collect();
        Self {
            encoder,
            max_lengths,
            shifted_labels: false,
            ignored_label_ids,
        }
    }

    /// Emit `labels` shifted one position left, with protein-side targets ignored.
    pub fn with_shifted_labels(mut self, enabled: bool) -> Self {
        self.shifted_labels = enabled;
        self
    }

    pub fn encoder(&self) -> &Arc<dyn PairEncoder> {
        &self.encoder
    }

    fn field_lengths(&self, samples: &[Sample<'_>]) -> (usize, usize) {
        match self.max_lengths {
            MaxLengths::Fixed { protein, molecule } => (protein, molecule),
            MaxLengths::BatchLocal => samples.iter().fold((0, 0), |(p, m), s| {
                (
                    p.max(s.protein.chars().count()),
                    m.max(s.molecule.chars().count()),
                )
            }),
        }
    }

    pub fn collate(&self, samples: &[Sample<'_>]) -> Result<EncodedBatch> {
        ensure!(!samples.is_empty(), "cannot collate an empty batch");

        let (prot_max_length, mol_max_length) = self.field_lengths(samples);
        let proteins: Vec<&str> = samples.iter().map(|s| s.protein).collect();
        let molecules: Vec<&str> = samples.iter().map(|s| s.molecule).collect();
        let encoding =
            self.encoder
                .encode_pairs(&proteins, &molecules, prot_max_length, mol_max_length)?;
        let (rows, cols) = (encoding.rows, encoding.cols);

        if !self.shifted_labels {
            return Ok(EncodedBatch {
                input_ids: Tensor::from_vec(encoding.input_ids, (rows, cols), &Device::Cpu)?,
                attention_mask: Tensor::from_vec(
                    encoding.attention_mask,
                    (rows, cols),
                    &Device::Cpu,
                )?,
                labels: None,
            });
        }

        ensure!(cols >= 2, "sequences too short to shift ({} columns)", cols);
        let width = cols - 1;
        let mut input_ids = Vec::with_capacity(rows * width);
        let mut attention_mask = Vec::with_capacity(rows * width);
        let mut labels = Vec::with_capacity(rows * width);
        for r in 0..rows {
            let ids = &encoding.input_ids[r * cols..(r + 1) * cols];
            let mask = &encoding.attention_mask[r * cols..(r + 1) * cols];
            input_ids.extend_from_slice(&ids[..width]);
            attention_mask.extend_from_slice(&mask[..width]);
            labels.extend(ids[1..].iter().map(|&id| {
                if self.ignored_label_ids.contains(&id) {
                    IGNORE_INDEX
                } else {
                    i64::from(id)
                }
            }));
        }

        Ok(EncodedBatch {
            input_ids: Tensor::from_vec(input_ids, (rows, width), &Device::Cpu)?,
            attention_mask: Tensor::from_vec(attention_mask, (rows, width), &Device::Cpu)?,
            labels: Some(Tensor::from_vec(labels, (rows, width), &Device::Cpu)?),
        })
    }
}
