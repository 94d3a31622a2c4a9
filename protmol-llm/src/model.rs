use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Dropout, Embedding, Linear, VarBuilder, embedding, linear, linear_no_bias};

use crate::config::ModelConfig;
use crate::masking::delimiter_loss_mask;

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = on_false.shape();
    let mask = mask.broadcast_as(shape.dims())?;
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

/// Which keys a query may attend to, before padding is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionPattern {
    /// Positions up to and including the first delimiter see each other
    /// freely, later positions are causal
    PrefixLm,
    /// Every position sees itself and earlier positions only
    Causal,
}

/// `(batch, 1, seq_len, seq_len)` U8 mask, 1 where query `i` may not look at key `j`.
///
/// Padded keys are hidden and the diagonal is always open.
pub fn attention_block_mask(
    input_ids: &Tensor,
    attention_mask: &Tensor,
    delim_token_id: u32,
    pattern: AttentionPattern,
) -> Result<Tensor> {
    let (_, seq_len) = input_ids.dims2()?;
    let device = input_ids.device();

    let eye = Tensor::eye(seq_len, DType::F32, device)?;
    let future = (Tensor::triu2(seq_len, DType::F32, device)? - &eye)?.unsqueeze(0)?;

    let causal = match pattern {
        AttentionPattern::Causal => future,
        AttentionPattern::PrefixLm => {
            let prefix = delimiter_loss_mask(input_ids, delim_token_id)?
                .to_dtype(DType::F32)?
                .affine(-1.0, 1.0)?;
            let within_prefix = prefix.unsqueeze(2)?.broadcast_mul(&prefix.unsqueeze(1)?)?;
            future.broadcast_mul(&within_prefix.affine(-1.0, 1.0)?)?
        }
    };

    let padded_keys = attention_mask
        .to_dtype(DType::F32)?
        .affine(-1.0, 1.0)?
        .unsqueeze(1)?;
    let blocked = causal
        .broadcast_maximum(&padded_keys)?
        .broadcast_mul(&eye.affine(-1.0, 1.0)?)?;

    blocked.to_dtype(DType::U8)?.unsqueeze(1)
}

#[derive(Debug, Clone)]
pub struct RMSNorm {
    weight: Tensor,
    eps: f64,
}

impl RMSNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }
}

impl Module for RMSNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x = x.to_dtype(dtype)?;
        x.broadcast_mul(&self.weight)
    }
}

pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.d_model;
        Ok(Self {
            q_proj: linear(d, d, vb.pp("q_proj"))?,
            k_proj: linear(d, d, vb.pp("k_proj"))?,
            v_proj: linear(d, d, vb.pp("v_proj"))?,
            o_proj: linear(d, d, vb.pp("o_proj"))?,
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
            dropout: Dropout::new(config.dropout as f32),
        })
    }

    pub fn forward(&self, x: &Tensor, block_mask: &Tensor, train: bool) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;

        let heads = |t: Tensor| -> Result<Tensor> {
            t.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = heads(self.q_proj.forward(x)?)?;
        let k = heads(self.k_proj.forward(x)?)?;
        let v = heads(self.v_proj.forward(x)?)?;

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let attn_weights = q.matmul(&k_t)?.affine(1.0 / scale, 0.0)?;
        let attn_weights = masked_fill(&attn_weights, block_mask, f32::NEG_INFINITY)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;

        let output = attn_weights.matmul(&v)?;
        let output = output.transpose(1, 2)?.contiguous()?;
        let output = output.reshape((batch_size, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&output)
    }
}

pub struct FeedForward {
    up_proj: Linear,
    down_proj: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            up_proj: linear(config.d_model, config.ff_hidden_layer, vb.pp("up_proj"))?,
            down_proj: linear(config.ff_hidden_layer, config.d_model, vb.pp("down_proj"))?,
            dropout: Dropout::new(config.dropout as f32),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.up_proj.forward(x)?.gelu_erf()?;
        let hidden = self.dropout.forward(&hidden, train)?;
        self.down_proj.forward(&hidden)
    }
}

pub struct DecoderBlock {
    attention: MultiHeadAttention,
    feed_forward: FeedForward,
    input_layernorm: RMSNorm,
    post_attention_layernorm: RMSNorm,
}

impl DecoderBlock {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: MultiHeadAttention::new(config, vb.pp("attention"))?,
            feed_forward: FeedForward::new(config, vb.pp("feed_forward"))?,
            input_layernorm: RMSNorm::new(
                config.d_model,
                config.layer_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: RMSNorm::new(
                config.d_model,
                config.layer_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    pub fn forward(&self, x: &Tensor, block_mask: &Tensor, train: bool) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.attention.forward(&x, block_mask, train)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.feed_forward.forward(&x, train)?;
        residual + x
    }
}

/// Decoder-only transformer over `[protein, DELIM, molecule]` sequences.
pub struct ProtMolDecoder {
    token_embedding: Embedding,
    position_embedding: Embedding,
    layers: Vec<DecoderBlock>,
    norm: RMSNorm,
    lm_head: Linear,
    config: ModelConfig,
}

impl ProtMolDecoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let token_embedding =
            embedding(config.vocab_size, config.d_model, vb.pp("token_embedding"))?;
        let position_embedding =
            embedding(config.max_seq_len, config.d_model, vb.pp("position_embedding"))?;
        let layers = (0..config.num_layers)
            .map(|i| DecoderBlock::new(config, vb.pp(format!("layers.{}", i))))
            .collect::<Result<Vec<_>>>()?;
        let norm = RMSNorm::new(config.d_model, config.layer_norm_eps, vb.pp("norm"))?;
        let lm_head = linear_no_bias(config.d_model, config.vocab_size, vb.pp("lm_head"))?;
        Ok(Self {
            token_embedding,
            position_embedding,
            layers,
            norm,
            lm_head,
            config: config.clone(),
        })
    }

    /// Logits of shape `(batch, seq_len, vocab_size)`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        delim_token_id: u32,
        pattern: AttentionPattern,
        train: bool,
    ) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_seq_len {
            candle_core::bail!(
                "sequence length {} exceeds the positional table ({})",
                seq_len,
                self.config.max_seq_len
            );
        }

        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let mut x = self
            .token_embedding
            .forward(input_ids)?
            .broadcast_add(&self.position_embedding.forward(&positions)?)?;

        let block_mask = attention_block_mask(input_ids, attention_mask, delim_token_id, pattern)?;
        for layer in &self.layers {
            x = layer.forward(&x, &block_mask, train)?;
        }

        let x = self.norm.forward(&x)?;
        self.lm_head.forward(&x)
    }

    /// Width of the output projection.
    pub fn output_vocab_size(&self) -> usize {
        self.lm_head.weight().dims().first().copied().unwrap_or(0)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn num_parameters(&self) -> usize {
        let c = &self.config;
        let embed_params = (c.vocab_size + c.max_seq_len) * c.d_model;
        let attn_params = 4 * (c.d_model * c.d_model + c.d_model);
        let ff_params = 2 * c.d_model * c.ff_hidden_layer + c.ff_hidden_layer + c.d_model;
        let layer_params = attn_params + ff_params + 2 * c.d_model;
        let head_params = c.d_model * c.vocab_size;
        embed_params + c.num_layers * layer_params + c.d_model + head_params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    const DELIM: u32 = 5;

    fn u32s(rows: &[&[u32]]) -> Tensor {
        let cols = rows[0].len();
        let flat: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), cols), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_block_mask_prefix_and_causal() {
        let ids = u32s(&[&[1, 2, DELIM, 3, 0]]);
        let mask = u32s(&[&[1, 1, 1, 1, 0]]);
        let blocked = attention_block_mask(&ids, &mask, DELIM, AttentionPattern::PrefixLm).unwrap();
        assert_eq!(blocked.dims(), &[1, 1, 5, 5]);
        let blocked: Vec<Vec<Vec<u8>>> = blocked.squeeze(0).unwrap().to_vec3().unwrap();
        let m = &blocked[0];
        // prefix rows see the whole prefix, but not what follows or padding
        assert_eq!(m[0], vec![0, 0, 0, 1, 1]);
        assert_eq!(m[2], vec![0, 0, 0, 1, 1]);
        // post-delimiter rows are causal
        assert_eq!(m[3], vec![0, 0, 0, 0, 1]);
        // a padded query still sees itself
        assert_eq!(m[4], vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_causal_pattern_ignores_delimiter() {
        let ids = u32s(&[&[1, 2, DELIM, 3, 0]]);
        let mask = u32s(&[&[1, 1, 1, 1, 0]]);
        let blocked = attention_block_mask(&ids, &mask, DELIM, AttentionPattern::Causal).unwrap();
        let blocked: Vec<Vec<Vec<u8>>> = blocked.squeeze(0).unwrap().to_vec3().unwrap();
        let m = &blocked[0];
        assert_eq!(m[0], vec![0, 1, 1, 1, 1]);
        assert_eq!(m[1], vec![0, 0, 1, 1, 1]);
        assert_eq!(m[2], vec![0, 0, 0, 1, 1]);
        assert_eq!(m[3], vec![0, 0, 0, 0, 1]);
        assert_eq!(m[4], vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_shifted_label_targets_are_hidden_from_their_query() {
        use crate::collate::{Collator, IGNORE_INDEX};
        use crate::config::MaxLengths;
        use crate::data::Sample;
        use crate::tokenizer::{CombinedTokenizer, PairEncoder};
        use std::sync::Arc;

        let tokenizer = Arc::new(CombinedTokenizer::builtin());
        let delim = tokenizer.delim_token_id();
        let collator =
            Collator::new(tokenizer, MaxLengths::BatchLocal).with_shifted_labels(true);
        let batch = collator
            .collate(&[
                Sample {
                    protein: "MK",
                    molecule: "CCO",
                },
                Sample {
                    protein: "MKTAY",
                    molecule: "C",
                },
            ])
            .unwrap();
        let labels: Vec<Vec<i64>> = batch.labels.as_ref().unwrap().to_vec2().unwrap();

        let blocked = attention_block_mask(
            &batch.input_ids,
            &batch.attention_mask,
            delim,
            AttentionPattern::Causal,
        )
        .unwrap();
        let blocked: Vec<Vec<Vec<u8>>> = (0..batch.batch_size())
            .map(|r| blocked.get(r).unwrap().squeeze(0).unwrap().to_vec2().unwrap())
            .collect();

        let mut checked = 0;
        for (r, row) in labels.iter().enumerate() {
            for (j, &label) in row.iter().enumerate() {
                if label == IGNORE_INDEX {
                    continue;
                }
                // label j is input token j + 1, which query j must not see
                for k in j + 1..row.len() {
                    assert_eq!(blocked[r][j][k], 1, "row {r}: query {j} sees key {k}");
                }
                if label == i64::from(delim) {
                    checked += 1;
                }
            }
        }
        assert_eq!(checked, 2);
    }

    #[test]
    fn test_forward_shape_and_vocab() {
        let config = ModelConfig::nano(12, 16);
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let model = ProtMolDecoder::new(&config, vb).unwrap();
        assert_eq!(model.output_vocab_size(), 12);

        let ids = u32s(&[&[1, 2, DELIM, 3, 0], &[1, DELIM, 3, 4, 2]]);
        let mask = u32s(&[&[1, 1, 1, 1, 0], &[1, 1, 1, 1, 1]]);
        let logits = model.forward(&ids, &mask, DELIM, AttentionPattern::PrefixLm, false).unwrap();
        assert_eq!(logits.dims(), &[2, 5, 12]);
        let values: Vec<f32> = logits.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_sequence_longer_than_table_is_rejected() {
        let config = ModelConfig::nano(12, 4);
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let model = ProtMolDecoder::new(&config, vb).unwrap();
        let ids = u32s(&[&[1, 2, DELIM, 3, 0]]);
        let mask = u32s(&[&[1, 1, 1, 1, 0]]);
        assert!(model.forward(&ids, &mask, DELIM, AttentionPattern::PrefixLm, false).is_err());
    }
}
