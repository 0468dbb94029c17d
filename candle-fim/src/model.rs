//! Llama-architecture causal LM used by both DeepSeek-Coder and CodeLlama.
//!
//! Unlike the single-sequence llama example this variant runs left-padded
//! batches: every row carries its own position ids and a key padding mask,
//! so a padded row produces the same logits as the unpadded prompt would.
use candle::quantized::{GgmlDType, QMatMul, QTensor};
use candle::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Embedding, RmsNorm, VarBuilder};
use candle_transformers::utils::repeat_kv;

use crate::lora::LoraAdapter;

/// Added to attention scores of masked keys. Finite so fully-masked pad
/// queries stay NaN-free.
pub const MASK_VALUE: f32 = -1e9;

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct RopeScaling {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub rope_type: Option<String>,
    #[serde(default)]
    pub factor: Option<f64>,
}

fn default_rope_theta() -> f64 {
    10_000.
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_max_position_embeddings() -> usize {
    4096
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

impl LlamaConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Divisor applied to positions, only linear scaling is supported.
    pub fn rope_factor(&self) -> crate::Result<f64> {
        let scaling = match &self.rope_scaling {
            None => return Ok(1.),
            Some(scaling) => scaling,
        };
        let kind = scaling
            .rope_type
            .as_deref()
            .or(scaling.kind.as_deref())
            .unwrap_or("linear");
        match kind {
            "linear" => Ok(scaling.factor.unwrap_or(1.)),
            "default" => Ok(1.),
            other => Err(crate::Error::Config(format!(
                "rope scaling `{other}` is not supported"
            ))),
        }
    }
}

/// How projection weights are materialized.
#[derive(Default)]
pub struct LoadOptions {
    /// Store the decoder projections as 8-bit blocks.
    pub quantize: bool,
    pub adapter: Option<LoraAdapter>,
}

#[derive(Debug, Clone)]
enum ProjInner {
    Dense(candle_nn::Linear),
    Quantized(QMatMul),
}

/// Bias-free linear layer, either dense or Q8_0 quantized.
#[derive(Debug, Clone)]
pub struct Proj {
    inner: ProjInner,
    span: tracing::Span,
}

impl Proj {
    pub fn new(weight: Tensor, quantize: bool) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "proj");
        let inner = if quantize {
            let qtensor = QTensor::quantize(&weight.to_dtype(DType::F32)?, GgmlDType::Q8_0)?;
            ProjInner::Quantized(QMatMul::from_qtensor(qtensor)?)
        } else {
            ProjInner::Dense(candle_nn::Linear::new(weight, None))
        };
        Ok(Self { inner, span })
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.inner, ProjInner::Quantized(_))
    }
}

impl Module for Proj {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        match &self.inner {
            ProjInner::Dense(linear) => linear.forward(xs),
            ProjInner::Quantized(qmatmul) => {
                let dtype = xs.dtype();
                qmatmul.forward(&xs.to_dtype(DType::F32)?)?.to_dtype(dtype)
            }
        }
    }
}

fn proj(
    in_dim: usize,
    out_dim: usize,
    vb: VarBuilder,
    path: &str,
    opts: &LoadOptions,
) -> Result<Proj> {
    let weight = vb.get((out_dim, in_dim), "weight")?;
    let weight = match &opts.adapter {
        Some(adapter) => adapter.merge(path, weight)?,
        None => weight,
    };
    Proj::new(weight, opts.quantize)
}

#[derive(Debug, Clone)]
struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(dtype: DType, cfg: &LlamaConfig, factor: f64, dev: &Device) -> Result<Self> {
        let dim = cfg.head_dim();
        let max_seq_len = cfg.max_position_embeddings;
        let inv_freq: Vec<_> = (0..dim)
            .step_by(2)
            .map(|i| 1f32 / cfg.rope_theta.powf(i as f64 / dim as f64) as f32)
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), dev)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, dev)?
            .to_dtype(DType::F32)?
            .affine(1. / factor, 0.)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    /// `q` and `k` are (b, heads, t, head_dim), `position_ids` is (b, t).
    fn apply(&self, q: &Tensor, k: &Tensor, position_ids: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b_sz, seq_len) = position_ids.dims2()?;
        let flat = position_ids.flatten_all()?;
        let cos = self
            .cos
            .index_select(&flat, 0)?
            .reshape((b_sz, 1, seq_len, ()))?;
        let sin = self
            .sin
            .index_select(&flat, 0)?
            .reshape((b_sz, 1, seq_len, ()))?;
        let rotate = |xs: &Tensor| -> Result<Tensor> {
            let rotated = rotate_half(xs)?.broadcast_mul(&sin)?;
            xs.broadcast_mul(&cos)? + rotated
        };
        Ok((rotate(q)?, rotate(k)?))
    }
}

fn rotate_half(xs: &Tensor) -> Result<Tensor> {
    let last_dim = xs.dim(D::Minus1)?;
    let xs1 = xs.narrow(D::Minus1, 0, last_dim / 2)?;
    let xs2 = xs.narrow(D::Minus1, last_dim / 2, last_dim - last_dim / 2)?;
    Tensor::cat(&[&xs2.neg()?, &xs1], D::Minus1)
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: Proj,
    k_proj: Proj,
    v_proj: Proj,
    o_proj: Proj,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    hidden_size: usize,
    kv_cache: Option<(Tensor, Tensor)>,
    span: tracing::Span,
}

impl Attention {
    fn new(cfg: &LlamaConfig, vb: VarBuilder, path: &str, opts: &LoadOptions) -> Result<Self> {
        let hidden_sz = cfg.hidden_size;
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_kv_heads();
        let head_dim = cfg.head_dim();
        let q_proj = proj(
            hidden_sz,
            num_heads * head_dim,
            vb.pp("q_proj"),
            &format!("{path}.q_proj"),
            opts,
        )?;
        let k_proj = proj(
            hidden_sz,
            num_kv_heads * head_dim,
            vb.pp("k_proj"),
            &format!("{path}.k_proj"),
            opts,
        )?;
        let v_proj = proj(
            hidden_sz,
            num_kv_heads * head_dim,
            vb.pp("v_proj"),
            &format!("{path}.v_proj"),
            opts,
        )?;
        let o_proj = proj(
            num_heads * head_dim,
            hidden_sz,
            vb.pp("o_proj"),
            &format!("{path}.o_proj"),
            opts,
        )?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            head_dim,
            hidden_size: hidden_sz,
            kv_cache: None,
            span: tracing::span!(tracing::Level::TRACE, "attn"),
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        position_ids: &Tensor,
        attention_bias: &Tensor,
        rotary: &RotaryEmbedding,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, q_len, _) = xs.dims3()?;
        let dtype = xs.dtype();

        let query_states = xs.apply(&self.q_proj)?;
        let key_states = xs.apply(&self.k_proj)?;
        let value_states = xs.apply(&self.v_proj)?;

        let query_states = query_states
            .reshape((b_sz, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let key_states = key_states
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let value_states = value_states
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (query_states, key_states) = rotary.apply(&query_states, &key_states, position_ids)?;

        let (key_states, value_states) = match &self.kv_cache {
            None => (key_states, value_states),
            Some((prev_k, prev_v)) => {
                let key_states = Tensor::cat(&[prev_k, &key_states], 2)?;
                let value_states = Tensor::cat(&[prev_v, &value_states], 2)?;
                (key_states, value_states)
            }
        };
        self.kv_cache = Some((key_states.clone(), value_states.clone()));

        let n_rep = self.num_heads / self.num_kv_heads;
        let key_states = repeat_kv(key_states, n_rep)?.contiguous()?;
        let value_states = repeat_kv(value_states, n_rep)?.contiguous()?;

        let query_states = query_states.to_dtype(DType::F32)?;
        let key_states = key_states.to_dtype(DType::F32)?;
        let value_states = value_states.to_dtype(DType::F32)?;

        let scale = 1f64 / f64::sqrt(self.head_dim as f64);
        let attn_weights = (query_states.matmul(&key_states.transpose(2, 3)?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(attention_bias)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&value_states)?.to_dtype(dtype)?;

        attn_output
            .transpose(1, 2)?
            .reshape((b_sz, q_len, self.hidden_size))?
            .apply(&self.o_proj)
    }

    fn clear_kv_cache(&mut self) {
        self.kv_cache = None
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    gate_proj: Proj,
    up_proj: Proj,
    down_proj: Proj,
    span: tracing::Span,
}

impl Mlp {
    fn new(cfg: &LlamaConfig, vb: VarBuilder, path: &str, opts: &LoadOptions) -> Result<Self> {
        let h = cfg.hidden_size;
        let i = cfg.intermediate_size;
        Ok(Self {
            gate_proj: proj(h, i, vb.pp("gate_proj"), &format!("{path}.gate_proj"), opts)?,
            up_proj: proj(h, i, vb.pp("up_proj"), &format!("{path}.up_proj"), opts)?,
            down_proj: proj(i, h, vb.pp("down_proj"), &format!("{path}.down_proj"), opts)?,
            span: tracing::span!(tracing::Level::TRACE, "mlp"),
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let gate = candle_nn::ops::silu(&xs.apply(&self.gate_proj)?)?;
        (gate * xs.apply(&self.up_proj)?)?.apply(&self.down_proj)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
    span: tracing::Span,
}

impl DecoderLayer {
    fn new(cfg: &LlamaConfig, vb: VarBuilder, path: &str, opts: &LoadOptions) -> Result<Self> {
        let self_attn = Attention::new(
            cfg,
            vb.pp("self_attn"),
            &format!("{path}.self_attn"),
            opts,
        )?;
        let mlp = Mlp::new(cfg, vb.pp("mlp"), &format!("{path}.mlp"), opts)?;
        let input_layernorm =
            candle_nn::rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = candle_nn::rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
            span: tracing::span!(tracing::Level::TRACE, "block"),
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        position_ids: &Tensor,
        attention_bias: &Tensor,
        rotary: &RotaryEmbedding,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = self
            .self_attn
            .forward(&xs, position_ids, attention_bias, rotary)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let xs = xs.apply(&self.post_attention_layernorm)?.apply(&self.mlp)?;
        residual + xs
    }
}

#[derive(Debug, Clone)]
pub struct Llama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Proj,
    rotary: RotaryEmbedding,
    device: Device,
    dtype: DType,
    span: tracing::Span,
}

impl Llama {
    pub fn load(cfg: &LlamaConfig, vb: VarBuilder, opts: &LoadOptions) -> crate::Result<Self> {
        let factor = cfg.rope_factor()?;
        let vb_m = vb.pp("model");
        let embed_tokens =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb_m.pp("embed_tokens"))?;
        let rotary = RotaryEmbedding::new(vb.dtype(), cfg, factor, vb.device())?;
        let vb_l = vb_m.pp("layers");
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for layer_idx in 0..cfg.num_hidden_layers {
            let layer = DecoderLayer::new(
                cfg,
                vb_l.pp(layer_idx),
                &format!("model.layers.{layer_idx}"),
                opts,
            )?;
            layers.push(layer)
        }
        let norm = candle_nn::rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;
        let lm_head = if cfg.tie_word_embeddings {
            Proj::new(embed_tokens.embeddings().clone(), false)?
        } else {
            let weight = vb
                .pp("lm_head")
                .get((cfg.vocab_size, cfg.hidden_size), "weight")?;
            Proj::new(weight, false)?
        };
        tracing::info!(
            layers = cfg.num_hidden_layers,
            hidden = cfg.hidden_size,
            quantized = opts.quantize,
            adapter = opts.adapter.is_some(),
            "loaded llama weights"
        );
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            device: vb.device().clone(),
            dtype: vb.dtype(),
            span: tracing::span!(tracing::Level::TRACE, "model"),
        })
    }

    /// Runs `input_ids` (b, t) through the decoder, appending to the kv cache.
    /// `attention_bias` comes from [`attention_bias`] and covers the cached
    /// keys plus the new ones. Returns the logits of the last position as
    /// (b, vocab) in f32.
    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        position_ids: &Tensor,
        attention_bias: &Tensor,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_b_sz, seq_len) = input_ids.dims2()?;
        let mut xs = self.embed_tokens.forward(input_ids)?;
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, position_ids, attention_bias, &self.rotary)?
        }
        xs.narrow(1, seq_len - 1, 1)?
            .apply(&self.norm)?
            .apply(&self.lm_head)?
            .squeeze(1)?
            .to_dtype(DType::F32)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.self_attn.clear_kv_cache()
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

/// Builds the additive (b, 1, q_len, kv_len) bias for the last `q_len`
/// queries. `key_mask[row][j]` is 1 for a real token at key position `j`
/// and 0 for padding; a query may attend to real keys at or before itself.
pub fn attention_bias(key_mask: &[Vec<u32>], q_len: usize, device: &Device) -> Result<Tensor> {
    let b_sz = key_mask.len();
    let kv_len = key_mask.first().map_or(0, |row| row.len());
    if kv_len < q_len || key_mask.iter().any(|row| row.len() != kv_len) {
        candle::bail!("inconsistent key mask for {q_len} queries over {kv_len} keys")
    }
    let offset = kv_len - q_len;
    let mut bias = Vec::with_capacity(b_sz * q_len * kv_len);
    for row in key_mask {
        for i in 0..q_len {
            bias.extend(row.iter().enumerate().map(|(j, &m)| {
                if m != 0 && j <= offset + i {
                    0.
                } else {
                    MASK_VALUE
                }
            }))
        }
    }
    Tensor::from_vec(bias, (b_sz, 1, q_len, kv_len), device)
}

/// Position of each token among the real tokens of its row; padding gets 0.
pub fn position_ids(mask: &[u32]) -> Vec<u32> {
    let mut seen = 0u32;
    mask.iter()
        .map(|&m| {
            if m == 0 {
                0
            } else {
                seen += 1;
                seen - 1
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::collections::HashMap;

    pub(crate) fn tiny_config(vocab_size: usize) -> LlamaConfig {
        LlamaConfig {
            hidden_size: 32,
            intermediate_size: 64,
            vocab_size,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            rms_norm_eps: 1e-5,
            rope_theta: 10_000.,
            rope_scaling: None,
            max_position_embeddings: 128,
            tie_word_embeddings: false,
        }
    }

    pub(crate) fn tiny_weights(cfg: &LlamaConfig, seed: u64) -> HashMap<String, Tensor> {
        let dev = Device::Cpu;
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let mut rand = |shape: (usize, usize)| {
            let data: Vec<f32> = (0..shape.0 * shape.1)
                .map(|_| {
                    state = state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    ((state >> 33) as f32 / (1u64 << 31) as f32 - 0.5) * 0.5
                })
                .collect();
            Tensor::from_vec(data, shape, &dev).unwrap()
        };
        let h = cfg.hidden_size;
        let kv = cfg.num_kv_heads() * cfg.head_dim();
        let i = cfg.intermediate_size;
        let mut ws = HashMap::new();
        ws.insert(
            "model.embed_tokens.weight".to_string(),
            rand((cfg.vocab_size, h)),
        );
        for l in 0..cfg.num_hidden_layers {
            let p = format!("model.layers.{l}");
            ws.insert(format!("{p}.self_attn.q_proj.weight"), rand((h, h)));
            ws.insert(format!("{p}.self_attn.k_proj.weight"), rand((kv, h)));
            ws.insert(format!("{p}.self_attn.v_proj.weight"), rand((kv, h)));
            ws.insert(format!("{p}.self_attn.o_proj.weight"), rand((h, h)));
            ws.insert(format!("{p}.mlp.gate_proj.weight"), rand((i, h)));
            ws.insert(format!("{p}.mlp.up_proj.weight"), rand((i, h)));
            ws.insert(format!("{p}.mlp.down_proj.weight"), rand((h, i)));
            for norm in ["input_layernorm", "post_attention_layernorm"] {
                ws.insert(
                    format!("{p}.{norm}.weight"),
                    Tensor::ones(h, DType::F32, &dev).unwrap(),
                );
            }
        }
        ws.insert(
            "model.norm.weight".to_string(),
            Tensor::ones(h, DType::F32, &dev).unwrap(),
        );
        ws.insert("lm_head.weight".to_string(), rand((cfg.vocab_size, h)));
        ws
    }

    pub(crate) fn tiny_model(vocab_size: usize, opts: &LoadOptions) -> Llama {
        let cfg = tiny_config(vocab_size);
        let vb = VarBuilder::from_tensors(tiny_weights(&cfg, 42), DType::F32, &Device::Cpu);
        Llama::load(&cfg, vb, opts).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::tiny_model;
    use super::*;

    fn run(model: &mut Llama, rows: &[Vec<u32>], masks: &[Vec<u32>]) -> Result<Tensor> {
        let dev = Device::Cpu;
        let t = rows[0].len();
        let ids: Vec<u32> = rows.iter().flatten().copied().collect();
        let kv_len = masks[0].len();
        let pos: Vec<u32> = masks
            .iter()
            .flat_map(|m| {
                let p = position_ids(m);
                p[kv_len - t..].to_vec()
            })
            .collect();
        let input = Tensor::from_vec(ids, (rows.len(), t), &dev)?;
        let pos = Tensor::from_vec(pos, (rows.len(), t), &dev)?;
        let bias = attention_bias(masks, t, &dev)?;
        model.forward(&input, &pos, &bias)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn position_ids_skip_padding() {
        assert_eq!(position_ids(&[0, 0, 1, 1, 1]), [0, 0, 0, 1, 2]);
        assert_eq!(position_ids(&[1, 1]), [0, 1]);
        assert_eq!(position_ids(&[]), Vec::<u32>::new());
    }

    #[test]
    fn bias_combines_causality_and_padding() -> Result<()> {
        let bias = attention_bias(&[vec![0, 1, 1]], 3, &Device::Cpu)?;
        assert_eq!(bias.dims(), [1, 1, 3, 3]);
        let m = MASK_VALUE;
        assert_eq!(
            bias.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?,
            [[m, m, m], [m, 0., m], [m, 0., 0.]]
        );

        let step = attention_bias(&[vec![0, 1, 1, 1], vec![1, 1, 1, 1]], 1, &Device::Cpu)?;
        assert_eq!(step.dims(), [2, 1, 1, 4]);
        assert_eq!(
            step.flatten_all()?.to_vec1::<f32>()?,
            [m, 0., 0., 0., 0., 0., 0., 0.]
        );
        assert!(attention_bias(&[vec![1]], 2, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn rope_scaling_variants() -> anyhow::Result<()> {
        let mut cfg = super::test_utils::tiny_config(8);
        assert_eq!(cfg.rope_factor()?, 1.);
        cfg.rope_scaling = serde_json::from_str(r#"{"type": "linear", "factor": 4.0}"#)?;
        assert_eq!(cfg.rope_factor()?, 4.);
        cfg.rope_scaling = serde_json::from_str(r#"{"rope_type": "yarn", "factor": 4.0}"#)?;
        assert!(cfg.rope_factor().is_err());
        Ok(())
    }

    #[test]
    fn left_padding_does_not_change_logits() -> Result<()> {
        let mut model = tiny_model(16, &LoadOptions::default());

        let mut batch_masks = vec![vec![1, 1, 1, 1], vec![0, 0, 1, 1]];
        let batched = run(
            &mut model,
            &[vec![3, 4, 5, 6], vec![0, 0, 7, 8]],
            &batch_masks,
        )?;
        assert_eq!(batched.dims(), [2, 16]);
        for mask in batch_masks.iter_mut() {
            mask.push(1)
        }
        let batched_step = run(&mut model, &[vec![9], vec![9]], &batch_masks)?;

        model.clear_kv_cache();
        let mut single_mask = vec![vec![1, 1]];
        let single = run(&mut model, &[vec![7, 8]], &single_mask)?;
        single_mask[0].push(1);
        let single_step = run(&mut model, &[vec![9]], &single_mask)?;

        assert!(max_abs_diff(&batched.get(1)?, &single.get(0)?)? < 1e-4);
        assert!(max_abs_diff(&batched_step.get(1)?, &single_step.get(0)?)? < 1e-4);
        Ok(())
    }

    #[test]
    fn quantized_projections() -> Result<()> {
        let opts = LoadOptions {
            quantize: true,
            adapter: None,
        };
        let mut model = tiny_model(16, &opts);
        assert!(model.layers[0].self_attn.q_proj.is_quantized());
        assert!(!model.lm_head.is_quantized());
        let logits = run(&mut model, &[vec![1, 2, 3]], &[vec![1, 1, 1]])?;
        assert_eq!(logits.dims(), [1, 16]);
        assert!(logits
            .to_vec2::<f32>()?
            .iter()
            .flatten()
            .all(|v| v.is_finite()));
        Ok(())
    }
}
