//! Delimiter-aware loss selection and teacher forcing.
//!
//! Every sequence is laid out as `[protein, DELIM, molecule]`. Only positions
//! strictly after the first delimiter of a row are scored; a row without a
//! delimiter contributes nothing. All operations are batched tensor ops, no
//! per-row loops.

use candle_core::{D, DType, Result, Tensor};

use crate::collate::IGNORE_INDEX;

/// `(batch, seq_len)` U8 mask that is 1 strictly after the first delimiter of each row.
pub fn delimiter_loss_mask(input_ids: &Tensor, delim_token_id: u32) -> Result<Tensor> {
    let delim = Tensor::full(delim_token_id, input_ids.dims(), input_ids.device())?;
    let is_delim = input_ids.eq(&delim)?.to_dtype(DType::F32)?;
    // delimiters seen before each position, excluding the position itself
    let seen_before = (is_delim.cumsum(1)? - &is_delim)?;
    seen_before.clamp(0f32, 1f32)?.to_dtype(DType::U8)
}

/// Shifts the post-delimiter segment of every row right by one.
///
/// The first position after the delimiter becomes 0 and the last value of the
/// row is dropped. Positions up to and including the delimiter are untouched,
/// as are rows without a delimiter. The same shift is applied to the mask.
pub fn shift_after_delimiter(
    input_ids: &Tensor,
    attention_mask: &Tensor,
    delim_token_id: u32,
) -> Result<(Tensor, Tensor)> {
    let (_, seq_len) = input_ids.dims2()?;
    if seq_len < 2 {
        return Ok((input_ids.clone(), attention_mask.clone()));
    }

    let after = delimiter_loss_mask(input_ids, delim_token_id)?;
    let after_f = after.to_dtype(DType::F32)?;
    let first_after = (&after_f - shift_right(&after_f)?)?.to_dtype(DType::U8)?;

    Ok((
        shift_segment(input_ids, &after, &first_after)?,
        shift_segment(attention_mask, &after, &first_after)?,
    ))
}

/// Model inputs for one step: shifted when teacher forcing is on, untouched otherwise.
pub fn teacher_forcing_inputs(
    input_ids: &Tensor,
    attention_mask: &Tensor,
    delim_token_id: u32,
    enabled: bool,
) -> Result<(Tensor, Tensor)> {
    if enabled {
        shift_after_delimiter(input_ids, attention_mask, delim_token_id)
    } else {
        Ok((input_ids.clone(), attention_mask.clone()))
    }
}

fn shift_right(x: &Tensor) -> Result<Tensor> {
    let (_, seq_len) = x.dims2()?;
    let filler = x.narrow(1, 0, 1)?.zeros_like()?;
    Tensor::cat(&[&filler, &x.narrow(1, 0, seq_len - 1)?], 1)
}

fn shift_segment(x: &Tensor, after: &Tensor, first_after: &Tensor) -> Result<Tensor> {
    let shifted = after.where_cond(&shift_right(x)?, x)?;
    first_after.where_cond(&x.zeros_like()?, &shifted)
}

/// Splits `IGNORE_INDEX`-carrying labels into U32 targets and a U8 selection mask.
pub fn label_targets(labels: &Tensor) -> Result<(Tensor, Tensor)> {
    let ignore = Tensor::full(IGNORE_INDEX, labels.dims(), labels.device())?;
    let keep = labels.ne(&ignore)?;
    let targets = keep
        .where_cond(labels, &labels.zeros_like()?)?
        .to_dtype(DType::U32)?;
    Ok((targets, keep))
}

/// Cross-entropy over the selected positions plus top-1 counts.
#[derive(Debug, Clone)]
pub struct MaskedLoss {
    /// Mean loss over counted tokens; zero (still differentiable) when none are counted
    pub loss: Tensor,
    pub correct: u64,
    pub tokens: u64,
}

/// Scores `logits` `(batch, seq_len, vocab)` against `targets` `(batch, seq_len)`
/// at positions where `selection` is set and the target is not `ignore_id`.
pub fn masked_cross_entropy(
    logits: &Tensor,
    targets: &Tensor,
    selection: &Tensor,
    ignore_id: u32,
) -> Result<MaskedLoss> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    let n = batch_size * seq_len;
    let logits = logits.reshape((n, vocab_size))?;
    let targets = targets.reshape(n)?;

    let ignore = Tensor::full(ignore_id, n, targets.device())?;
    let not_ignored = targets.ne(&ignore)?.to_dtype(DType::U32)?;
    let counted = (selection.reshape(n)?.to_dtype(DType::U32)? * not_ignored)?;
    let tokens = counted.sum_all()?.to_scalar::<u32>()? as u64;
    let weights = counted.to_dtype(DType::F32)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let nll = log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;
    let loss = (nll * &weights)?
        .sum_all()?
        .affine(1.0 / tokens.max(1) as f64, 0.0)?;

    let hits = logits.argmax(D::Minus1)?.eq(&targets)?.to_dtype(DType::U32)?;
    let correct = (hits * &counted)?.sum_all()?.to_scalar::<u32>()? as u64;

    Ok(MaskedLoss {
        loss,
        correct,
        tokens,
    })
}
