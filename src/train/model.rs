//! Llama-style causal LM with LoRA on the attention projections.
//!
//! The base weights load frozen from safetensors; only the adapter tensors
//! (when attached) are trainable. The forward pass recomputes the full
//! sequence every call — no KV cache — which keeps training and the small
//! interactive chat loop on one code path.

use std::path::Path;

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};
use candle_transformers::generation::LogitsProcessor;
use serde::Deserialize;

use crate::{Error, Result};

use super::lora::{LoraConfig, LoraLinear};

/// Architecture parameters, read from the checkpoint's `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    pub max_position_embeddings: usize,
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10_000.0
}

impl ModelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads
            .unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

struct Attention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(
        config: &ModelConfig,
        base_vb: VarBuilder,
        lora: Option<(&LoraConfig, VarBuilder)>,
    ) -> Result<Self> {
        let dim = config.hidden_size;
        let head_dim = config.head_dim();
        let kv_dim = config.kv_heads() * head_dim;

        let project = |name: &str, out_dim: usize| -> Result<LoraLinear> {
            match &lora {
                Some((cfg, lora_vb)) => LoraLinear::with_adapter(
                    dim,
                    out_dim,
                    cfg,
                    base_vb.pp(name),
                    lora_vb.pp(name),
                ),
                None => LoraLinear::plain(dim, out_dim, base_vb.pp(name)),
            }
        };

        Ok(Self {
            q_proj: project("q_proj", dim)?,
            k_proj: project("k_proj", kv_dim)?,
            v_proj: project("v_proj", kv_dim)?,
            o_proj: project("o_proj", dim)?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.kv_heads(),
            head_dim,
        })
    }

    fn forward(
        &self,
        hidden: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = hidden.dims3()?;

        let q = self
            .q_proj
            .forward_t(hidden, train)?
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward_t(hidden, train)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward_t(hidden, train)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = candle_nn::rotary_emb::rope(&q, cos, sin)?;
        let k = candle_nn::rotary_emb::rope(&k, cos, sin)?;

        let k = repeat_kv(&k, self.num_heads / self.num_kv_heads)?;
        let v = repeat_kv(&v, self.num_heads / self.num_kv_heads)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
        let scores = scores.broadcast_add(mask)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward_t(&out, train)
    }
}

/// Expand grouped KV heads to match the query head count.
fn repeat_kv(xs: &Tensor, groups: usize) -> Result<Tensor> {
    if groups == 1 {
        return Ok(xs.clone());
    }
    let (batch, kv_heads, seq_len, head_dim) = xs.dims4()?;
    let expanded = xs
        .unsqueeze(2)?
        .expand((batch, kv_heads, groups, seq_len, head_dim))?
        .reshape((batch, kv_heads * groups, seq_len, head_dim))?;
    Ok(expanded)
}

struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_proj: candle_nn::linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("gate_proj"),
            )?,
            up_proj: candle_nn::linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("up_proj"),
            )?,
            down_proj: candle_nn::linear_no_bias(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("down_proj"),
            )?,
        })
    }

    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(hidden)?)?;
        let up = self.up_proj.forward(hidden)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct Block {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl Block {
    fn load(
        config: &ModelConfig,
        base_vb: VarBuilder,
        lora: Option<(&LoraConfig, VarBuilder)>,
    ) -> Result<Self> {
        let lora_attn = lora.map(|(cfg, vb)| (cfg, vb.pp("self_attn")));
        Ok(Self {
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                base_vb.pp("input_layernorm"),
            )?,
            self_attn: Attention::load(config, base_vb.pp("self_attn"), lora_attn)?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                base_vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(config, base_vb.pp("mlp"))?,
        })
    }

    fn forward(
        &self,
        hidden: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let normed = self.input_layernorm.forward(hidden)?;
        let attn = self.self_attn.forward(&normed, cos, sin, mask, train)?;
        let hidden = (hidden + attn)?;

        let normed = self.post_attention_layernorm.forward(&hidden)?;
        let mlp = self.mlp.forward(&normed)?;
        Ok((hidden + mlp)?)
    }
}

/// The decoder, frozen base plus optional adapters.
pub struct CausalLM {
    embed_tokens: Embedding,
    blocks: Vec<Block>,
    norm: RmsNorm,
    lm_head: Linear,
    cos: Tensor,
    sin: Tensor,
    config: ModelConfig,
    device: Device,
}

impl CausalLM {
    /// Load the base checkpoint (frozen) and optionally attach adapters.
    ///
    /// - training: `lora = Some((config, varmap_vb))` — adapter tensors are
    ///   created in the VarMap with their init and are the only trainables;
    /// - chat: `lora = Some((config, safetensors_vb))` — adapter tensors
    ///   load from the saved adapter file;
    /// - plain completion: `lora = None`.
    pub fn load(
        config: &ModelConfig,
        base_vb: VarBuilder,
        lora: Option<(&LoraConfig, VarBuilder)>,
        device: &Device,
    ) -> Result<Self> {
        let model_vb = base_vb.pp("model");
        let embed_tokens = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            model_vb.pp("embed_tokens"),
        )?;
        let mut blocks = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let lora_block = lora
                .as_ref()
                .map(|(cfg, vb)| (*cfg, vb.pp(format!("layers.{i}"))));
            blocks.push(Block::load(
                config,
                model_vb.pp(format!("layers.{i}")),
                lora_block,
            )?);
        }
        let norm = candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, model_vb.pp("norm"))?;
        let lm_head =
            candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, base_vb.pp("lm_head"))?;

        let (cos, sin) = rope_tables(config, device)?;

        Ok(Self {
            embed_tokens,
            blocks,
            norm,
            lm_head,
            cos,
            sin,
            config: config.clone(),
            device: device.clone(),
        })
    }

    /// Open a checkpoint directory (`config.json` + `model.safetensors`).
    pub fn open_dir(
        dir: impl AsRef<Path>,
        lora: Option<(&LoraConfig, VarBuilder)>,
        device: &Device,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let config = ModelConfig::from_file(dir.join("config.json"))?;
        let weights = dir.join("model.safetensors");
        if !weights.is_file() {
            return Err(Error::Config(format!(
                "no model.safetensors under {}",
                dir.display()
            )));
        }
        // SAFETY: the checkpoint file is mmap'd read-only for the lifetime
        // of the VarBuilder.
        let base_vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        Self::load(&config, base_vb, lora, device)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Full-sequence forward. Returns logits `(batch, seq_len, vocab)`.
    pub fn forward(&self, ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_batch, seq_len) = ids.dims2()?;
        if seq_len > self.config.max_position_embeddings {
            return Err(Error::Config(format!(
                "sequence of {seq_len} tokens exceeds the {} position limit",
                self.config.max_position_embeddings
            )));
        }
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        let mask = causal_mask(seq_len, &self.device)?;

        let mut hidden = self.embed_tokens.forward(ids)?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, &cos, &sin, &mask, train)?;
        }
        let hidden = self.norm.forward(&hidden)?;
        Ok(self.lm_head.forward(&hidden)?)
    }

    /// Sample a completion for `prompt_ids`.
    ///
    /// Stops at `eos_token` or after `max_tokens`. The whole sequence is
    /// re-forwarded each step.
    pub fn generate(
        &self,
        prompt_ids: &[u32],
        eos_token: u32,
        max_tokens: usize,
        sampler: &mut LogitsProcessor,
        repeat_penalty: f32,
        repeat_last_n: usize,
    ) -> Result<Vec<u32>> {
        let mut tokens = prompt_ids.to_vec();
        let mut generated = Vec::new();
        for _ in 0..max_tokens {
            let len = tokens
                .len()
                .min(self.config.max_position_embeddings);
            let window = &tokens[tokens.len() - len..];
            let input = Tensor::from_slice(window, (1, len), &self.device)?;
            let logits = self.forward(&input, false)?;
            let logits = logits.i((0, len - 1, ..))?.to_dtype(DType::F32)?;
            let logits = if repeat_penalty == 1.0 {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    repeat_penalty,
                    &tokens[start_at..],
                )?
            };
            let next = sampler.sample(&logits)?;
            if next == eos_token {
                break;
            }
            tokens.push(next);
            generated.push(next);
        }
        Ok(generated)
    }
}

/// Precompute rotary tables `(max_seq, head_dim / 2)`.
fn rope_tables(config: &ModelConfig, device: &Device) -> Result<(Tensor, Tensor)> {
    let head_dim = config.head_dim();
    let half = head_dim / 2;
    let max_seq = config.max_position_embeddings;
    let mut cos = vec![0f32; max_seq * half];
    let mut sin = vec![0f32; max_seq * half];
    for pos in 0..max_seq {
        for i in 0..half {
            let freq = 1f64 / config.rope_theta.powf(2.0 * i as f64 / head_dim as f64);
            let angle = pos as f64 * freq;
            cos[pos * half + i] = angle.cos() as f32;
            sin[pos * half + i] = angle.sin() as f32;
        }
    }
    Ok((
        Tensor::from_vec(cos, (max_seq, half), device)?,
        Tensor::from_vec(sin, (max_seq, half), device)?,
    ))
}

/// Additive causal mask `[1, 1, T, T]`.
fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            data[i * seq_len + j] = f32::MIN;
        }
    }
    Ok(Tensor::from_vec(data, (seq_len, seq_len), device)?.reshape((1, 1, seq_len, seq_len))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 32,
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            rms_norm_eps: 1e-5,
            rope_theta: 10_000.0,
            max_position_embeddings: 64,
        }
    }

    fn tiny_model(lora: bool) -> (CausalLM, VarMap) {
        let device = Device::Cpu;
        // Random-initialized base stands in for a real checkpoint.
        let base_map = VarMap::new();
        let base_vb = VarBuilder::from_varmap(&base_map, DType::F32, &device);
        let adapter_map = VarMap::new();
        let adapter_vb = VarBuilder::from_varmap(&adapter_map, DType::F32, &device);
        let lora_config = LoraConfig::default();
        let lora_arg = lora.then_some((&lora_config, adapter_vb));
        let model = CausalLM::load(&tiny_config(), base_vb, lora_arg, &device).unwrap();
        (model, adapter_map)
    }

    #[test]
    fn test_forward_shape() {
        let (model, _) = tiny_model(false);
        let ids = Tensor::from_slice(&[1u32, 2, 3, 4, 5], (1, 5), &Device::Cpu).unwrap();
        let logits = model.forward(&ids, false).unwrap();
        assert_eq!(logits.dims(), &[1, 5, 32]);
    }

    #[test]
    fn test_adapter_var_count() {
        let (_, adapter_map) = tiny_model(true);
        // 2 layers × 4 projections × (A, B)
        assert_eq!(adapter_map.all_vars().len(), 16);
    }

    #[test]
    fn test_sequence_limit_enforced() {
        let (model, _) = tiny_model(false);
        let ids = vec![1u32; 65];
        let ids = Tensor::from_slice(&ids, (1, 65), &Device::Cpu).unwrap();
        assert!(model.forward(&ids, false).is_err());
    }

    #[test]
    fn test_repeat_kv_expands_heads() {
        let xs = Tensor::randn(0f32, 1f32, (1, 2, 3, 4), &Device::Cpu).unwrap();
        let out = repeat_kv(&xs, 3).unwrap();
        assert_eq!(out.dims(), &[1, 6, 3, 4]);
    }

    #[test]
    fn test_generate_stops_at_budget() {
        let (model, _) = tiny_model(false);
        let mut sampler = LogitsProcessor::new(7, Some(1.0), None);
        // eos outside the vocab so only the budget can stop generation
        let out = model
            .generate(&[1, 2, 3], u32::MAX, 8, &mut sampler, 1.2, 64)
            .unwrap();
        assert!(out.len() <= 8);
    }
}
