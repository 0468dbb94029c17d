//! Batched generation: tokenize a batch with left padding, decode new tokens
//! until every row hits its stop token, and return the continuations.
use candle::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use tokenizers::{
    PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams,
};

use crate::model::{attention_bias, position_ids, Llama};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingPolicy {
    /// Pad to the longest prompt of the batch.
    Longest,
    /// Pad every prompt to `max_length`.
    MaxLength,
}

impl PaddingPolicy {
    /// `longest` selects [`PaddingPolicy::Longest`], anything else pads to
    /// the maximum length.
    pub fn from_flag(flag: &str) -> Self {
        if flag == "longest" {
            Self::Longest
        } else {
            Self::MaxLength
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// Prompts are truncated to this many tokens.
    pub max_length: usize,
    pub padding: PaddingPolicy,
    pub eos_token_id: u32,
    pub pad_token_id: u32,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub seed: u64,
}

impl GenerationConfig {
    /// Greedy decoding unless a positive temperature is set.
    pub fn sampling(&self) -> Sampling {
        let temperature = self.temperature;
        if temperature <= 0. {
            Sampling::ArgMax
        } else {
            match (self.top_k, self.top_p) {
                (None, None) => Sampling::All { temperature },
                (Some(k), None) => Sampling::TopK { k, temperature },
                (None, Some(p)) => Sampling::TopP { p, temperature },
                (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
            }
        }
    }
}

/// Produces token continuations for a batch of prompts.
pub trait Generator {
    /// Returns one id sequence per prompt, in prompt order, holding only the
    /// tokens produced after the padded prompt.
    fn generate(&mut self, prompts: &[String]) -> Result<Vec<Vec<u32>>>;

    /// Decodes a continuation, skipping special tokens.
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

/// Drops the first `prompt_len` ids of every full sequence.
pub fn continuation_ids(sequences: Vec<Vec<u32>>, prompt_len: usize) -> Vec<Vec<u32>> {
    sequences
        .into_iter()
        .map(|mut ids| ids.split_off(prompt_len.min(ids.len())))
        .collect()
}

/// Sets left padding and truncation on `tokenizer` for `config`.
pub fn configure_tokenizer(tokenizer: &mut Tokenizer, config: &GenerationConfig) -> Result<()> {
    let strategy = match config.padding {
        PaddingPolicy::Longest => PaddingStrategy::BatchLongest,
        PaddingPolicy::MaxLength => PaddingStrategy::Fixed(config.max_length),
    };
    let pad_token = tokenizer
        .id_to_token(config.pad_token_id)
        .unwrap_or_default();
    tokenizer.with_padding(Some(PaddingParams {
        strategy,
        direction: PaddingDirection::Left,
        pad_id: config.pad_token_id,
        pad_token,
        ..Default::default()
    }));
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: config.max_length,
            ..Default::default()
        }))
        .map_err(Error::tokenizer)?;
    Ok(())
}

pub struct LlamaGenerator {
    model: Llama,
    tokenizer: Tokenizer,
    config: GenerationConfig,
    logits_processor: LogitsProcessor,
}

impl LlamaGenerator {
    pub fn new(model: Llama, mut tokenizer: Tokenizer, config: GenerationConfig) -> Result<Self> {
        configure_tokenizer(&mut tokenizer, &config)?;
        let logits_processor = LogitsProcessor::from_sampling(config.seed, config.sampling());
        Ok(Self {
            model,
            tokenizer,
            config,
            logits_processor,
        })
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    fn device(&self) -> &Device {
        self.model.device()
    }
}

impl Generator for LlamaGenerator {
    fn generate(&mut self, prompts: &[String]) -> Result<Vec<Vec<u32>>> {
        if prompts.is_empty() {
            return Ok(vec![]);
        }
        let encodings = self
            .tokenizer
            .encode_batch(prompts.to_vec(), true)
            .map_err(Error::tokenizer)?;
        let b_sz = encodings.len();
        let prompt_len = encodings[0].get_ids().len();
        if prompt_len == 0 {
            return Err(Error::Generation("prompts encode to no tokens".to_string()));
        }
        if encodings.iter().any(|e| e.get_ids().len() != prompt_len) {
            return Err(Error::Generation("batch is not padded to a common length".to_string()));
        }

        let mut sequences: Vec<Vec<u32>> = encodings.iter().map(|e| e.get_ids().to_vec()).collect();
        let mut key_mask: Vec<Vec<u32>> = encodings
            .iter()
            .map(|e| e.get_attention_mask().to_vec())
            .collect();
        let mut next_position: Vec<u32> = key_mask
            .iter()
            .map(|m| m.iter().filter(|&&v| v != 0).count() as u32)
            .collect();
        let mut input: Vec<u32> = sequences.iter().flatten().copied().collect();
        let mut positions: Vec<u32> = key_mask.iter().flat_map(|m| position_ids(m)).collect();
        let mut step_len = prompt_len;
        let mut finished = vec![false; b_sz];

        let device = self.device().clone();
        self.model.clear_kv_cache();
        for index in 0..self.config.max_new_tokens {
            let input_ids = Tensor::from_vec(input, (b_sz, step_len), &device)?;
            let position_ids = Tensor::from_vec(positions, (b_sz, step_len), &device)?;
            let bias = attention_bias(&key_mask, step_len, &device)?;
            let logits = self.model.forward(&input_ids, &position_ids, &bias)?;

            let mut next_tokens = Vec::with_capacity(b_sz);
            for row in 0..b_sz {
                let token = if finished[row] {
                    self.config.pad_token_id
                } else {
                    self.logits_processor.sample(&logits.get(row)?)?
                };
                if token == self.config.eos_token_id {
                    finished[row] = true;
                }
                sequences[row].push(token);
                key_mask[row].push(1);
                next_tokens.push(token);
            }
            tracing::trace!(step = index, "sampled {next_tokens:?}");
            if finished.iter().all(|&f| f) {
                break;
            }
            input = next_tokens;
            positions = next_position.clone();
            next_position.iter_mut().for_each(|p| *p += 1);
            step_len = 1;
        }
        self.model.clear_kv_cache();
        Ok(continuation_ids(sequences, prompt_len))
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer.decode(ids, true).map_err(Error::tokenizer)
    }
}
