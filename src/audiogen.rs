//! Text-to-audio generation in the MusicGen family.
//!
//! The pipeline runs three stages:
//!
//! 1. T5 encodes the prompt into conditioning states
//!    (`candle-transformers` t5, projected into the decoder width)
//! 2. the MusicGen decoder samples EnCodec codebook tokens autoregressively
//!    with the delay pattern (codebook k lags k frames)
//! 3. EnCodec decodes the code frames into 32 kHz mono PCM
//!    (`candle-transformers` encodec)
//!
//! The same wrapper serves music and sound-effect checkpoints; they share
//! the architecture and differ only in the repository name.

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::{encodec, t5};
use tokenizers::Tokenizer;

use crate::config::AudioParams;
use crate::{Error, Result, hub};

/// Default checkpoints.
pub const MUSIC_REPO: &str = "facebook/musicgen-small";
pub const SOUND_REPO: &str = "facebook/audiogen-medium";
const TOKENIZER_REPO: &str = "t5-base";

/// Decoder frames per second of audio.
const FRAME_RATE: usize = 50;

/// Decoder section of the combined checkpoint config.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DecoderConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub ffn_dim: usize,
    pub num_codebooks: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,
}

fn default_pad_token_id() -> u32 {
    2048
}

/// Combined checkpoint config (text encoder + audio codec + decoder).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AudioGenConfig {
    pub text_encoder: t5::Config,
    pub audio_encoder: encodec::Config,
    pub decoder: DecoderConfig,
}

/// One generated clip.
pub struct GeneratedAudio {
    /// Interleaved f32 samples in [-1, 1].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

// ── Decoder transformer ──────────────────────────────────────────────────────

struct Attention {
    q_proj: candle_nn::Linear,
    k_proj: candle_nn::Linear,
    v_proj: candle_nn::Linear,
    out_proj: candle_nn::Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let q_proj = candle_nn::linear_no_bias(dim, dim, vb.pp("q_proj"))?;
        let k_proj = candle_nn::linear_no_bias(dim, dim, vb.pp("k_proj"))?;
        let v_proj = candle_nn::linear_no_bias(dim, dim, vb.pp("v_proj"))?;
        let out_proj = candle_nn::linear_no_bias(dim, dim, vb.pp("out_proj"))?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads,
            head_dim: dim / num_heads,
        })
    }

    /// Scaled dot-product attention over `keys_values` (self-attention when
    /// it is the input itself, cross-attention otherwise).
    fn forward(
        &self,
        hidden: &Tensor,
        keys_values: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, q_len, _) = hidden.dims3()?;
        let kv_len = keys_values.dim(1)?;

        let q = self
            .q_proj
            .forward(hidden)?
            .reshape((batch, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(keys_values)?
            .reshape((batch, kv_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(keys_values)?
            .reshape((batch, kv_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut scores = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, q_len, self.num_heads * self.head_dim))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: candle_nn::LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: candle_nn::LayerNorm,
    fc1: candle_nn::Linear,
    fc2: candle_nn::Linear,
    final_layer_norm: candle_nn::LayerNorm,
}

impl DecoderLayer {
    fn load(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.hidden_size;
        Ok(Self {
            self_attn: Attention::load(dim, cfg.num_attention_heads, vb.pp("self_attn"))?,
            self_attn_layer_norm: candle_nn::layer_norm(
                dim,
                1e-5,
                vb.pp("self_attn_layer_norm"),
            )?,
            encoder_attn: Attention::load(dim, cfg.num_attention_heads, vb.pp("encoder_attn"))?,
            encoder_attn_layer_norm: candle_nn::layer_norm(
                dim,
                1e-5,
                vb.pp("encoder_attn_layer_norm"),
            )?,
            fc1: candle_nn::linear_no_bias(dim, cfg.ffn_dim, vb.pp("fc1"))?,
            fc2: candle_nn::linear_no_bias(cfg.ffn_dim, dim, vb.pp("fc2"))?,
            final_layer_norm: candle_nn::layer_norm(dim, 1e-5, vb.pp("final_layer_norm"))?,
        })
    }

    fn forward(
        &self,
        hidden: &Tensor,
        encoder_states: &Tensor,
        causal_mask: &Tensor,
    ) -> Result<Tensor> {
        let residual = hidden;
        let normed = self.self_attn_layer_norm.forward(hidden)?;
        let attn = self.self_attn.forward(&normed, &normed, Some(causal_mask))?;
        let hidden = (residual + attn)?;

        let residual = &hidden;
        let normed = self.encoder_attn_layer_norm.forward(&hidden)?;
        let attn = self.encoder_attn.forward(&normed, encoder_states, None)?;
        let hidden = (residual + attn)?;

        let residual = &hidden;
        let normed = self.final_layer_norm.forward(&hidden)?;
        let mlp = self.fc2.forward(&self.fc1.forward(&normed)?.gelu()?)?;
        Ok((residual + mlp)?)
    }
}

struct Decoder {
    embed_tokens: Vec<candle_nn::Embedding>,
    layers: Vec<DecoderLayer>,
    layer_norm: candle_nn::LayerNorm,
    lm_heads: Vec<candle_nn::Linear>,
    cfg: DecoderConfig,
}

impl Decoder {
    fn load(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let model_vb = vb.pp("model").pp("decoder");
        let mut embed_tokens = Vec::with_capacity(cfg.num_codebooks);
        for k in 0..cfg.num_codebooks {
            // One embedding table per codebook; the extra row is the
            // pad/start token.
            embed_tokens.push(candle_nn::embedding(
                cfg.vocab_size + 1,
                cfg.hidden_size,
                model_vb.pp(format!("embed_tokens.{k}")),
            )?);
        }
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(DecoderLayer::load(cfg, model_vb.pp(format!("layers.{i}")))?);
        }
        let layer_norm = candle_nn::layer_norm(cfg.hidden_size, 1e-5, model_vb.pp("layer_norm"))?;
        let mut lm_heads = Vec::with_capacity(cfg.num_codebooks);
        for k in 0..cfg.num_codebooks {
            lm_heads.push(candle_nn::linear_no_bias(
                cfg.hidden_size,
                cfg.vocab_size,
                vb.pp(format!("lm_heads.{k}")),
            )?);
        }
        Ok(Self {
            embed_tokens,
            layers,
            layer_norm,
            lm_heads,
            cfg: cfg.clone(),
        })
    }

    /// Forward over the full delayed sequence.
    ///
    /// - `ids`: `[B, K, T]` codebook tokens
    /// - `encoder_states`: `[B, S, hidden]` projected text conditioning
    ///
    /// Returns per-codebook logits `[K, B, T, vocab]`.
    fn forward(&self, ids: &Tensor, encoder_states: &Tensor) -> Result<Vec<Tensor>> {
        let (_batch, num_codebooks, seq_len) = ids.dims3()?;
        let device = ids.device();

        let mut hidden = self.embed_tokens[0].forward(&ids.i((.., 0, ..))?)?;
        for k in 1..num_codebooks {
            let emb = self.embed_tokens[k].forward(&ids.i((.., k, ..))?)?;
            hidden = (hidden + emb)?;
        }
        let positions = sinusoidal_positions(seq_len, self.cfg.hidden_size, device)?;
        hidden = hidden.broadcast_add(&positions.unsqueeze(0)?)?;

        let causal_mask = causal_attention_mask(seq_len, device)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, encoder_states, &causal_mask)?;
        }
        let hidden = self.layer_norm.forward(&hidden)?;

        self.lm_heads
            .iter()
            .map(|head| Ok(head.forward(&hidden)?))
            .collect()
    }
}

/// Additive causal mask `[1, 1, T, T]`: 0 on/below the diagonal, a large
/// negative value above it.
fn causal_attention_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            data[i * seq_len + j] = f32::MIN;
        }
    }
    let mask = Tensor::from_vec(data, (seq_len, seq_len), device)?
        .reshape((1, 1, seq_len, seq_len))?;
    Ok(mask)
}

/// Sinusoidal position table `[T, dim]` (cos in the first half, sin in the
/// second, matching the checkpoint's embedding convention).
fn sinusoidal_positions(seq_len: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let half = dim / 2;
    let log_base = (10000f64).ln() / (half as f64 - 1.0);
    let mut data = vec![0f32; seq_len * dim];
    for pos in 0..seq_len {
        for i in 0..half {
            let angle = pos as f64 * (-(log_base * i as f64)).exp();
            data[pos * dim + i] = angle.cos() as f32;
            data[pos * dim + half + i] = angle.sin() as f32;
        }
    }
    Ok(Tensor::from_vec(data, (seq_len, dim), device)?)
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// A loaded text-to-audio pipeline.
pub struct AudioGenerator {
    tokenizer: Tokenizer,
    text_encoder: t5::T5EncoderModel,
    enc_to_dec_proj: candle_nn::Linear,
    decoder: Decoder,
    codec: encodec::Model,
    config: AudioGenConfig,
    device: Device,
}

impl AudioGenerator {
    /// Download the checkpoint from the hub and load it.
    pub fn load(repo: &str, device: &Device) -> Result<Self> {
        let config_path = hub::model_file(repo, "config.json")?;
        let weights_path = hub::model_file(repo, "model.safetensors")?;
        let tokenizer_path = hub::model_file(TOKENIZER_REPO, "tokenizer.json")?;
        Self::from_files(&config_path, &weights_path, &tokenizer_path, device)
    }

    /// Load from local checkpoint files.
    pub fn from_files(
        config_path: impl AsRef<std::path::Path>,
        weights_path: impl AsRef<std::path::Path>,
        tokenizer_path: impl AsRef<std::path::Path>,
        device: &Device,
    ) -> Result<Self> {
        let config: AudioGenConfig =
            serde_json::from_str(&std::fs::read_to_string(config_path.as_ref())?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)?;

        // SAFETY: the checkpoint file is mmap'd read-only for the lifetime
        // of the VarBuilder.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(
                &[weights_path.as_ref().to_path_buf()],
                DType::F32,
                device,
            )?
        };

        let text_encoder = t5::T5EncoderModel::load(vb.pp("text_encoder"), &config.text_encoder)?;
        let enc_to_dec_proj = candle_nn::linear(
            config.text_encoder.d_model,
            config.decoder.hidden_size,
            vb.pp("enc_to_dec_proj"),
        )?;
        let decoder = Decoder::load(&config.decoder, vb.pp("decoder"))?;
        let codec = encodec::Model::new(&config.audio_encoder, vb.pp("audio_encoder"))?;

        Ok(Self {
            tokenizer,
            text_encoder,
            enc_to_dec_proj,
            decoder,
            codec,
            config,
            device: device.clone(),
        })
    }

    /// Generate one clip.
    pub fn generate(&mut self, params: &AudioParams) -> Result<GeneratedAudio> {
        params.validate()?;
        let frames = (params.duration_s * FRAME_RATE as f64) as usize;
        let num_codebooks = self.config.decoder.num_codebooks;
        let pad = self.config.decoder.pad_token_id;
        let use_guidance = params.guidance_scale > 1.0;

        let cond_states = self.encode_text(&params.prompt)?;
        let encoder_states = if use_guidance {
            let uncond_states = self.encode_text("")?;
            pad_and_stack(&cond_states, &uncond_states)?
        } else {
            cond_states
        };
        let batch = encoder_states.dim(0)?;

        let seed = params.seed.unwrap_or_else(rand::random);
        let mut sampler = LogitsProcessor::from_sampling(
            seed,
            Sampling::TopK {
                k: params.top_k,
                temperature: params.temperature,
            },
        );

        // Delay pattern: codebook k is shifted k steps right, padded with
        // the start token. Sampled tokens land per codebook; positions a
        // codebook has not reached yet stay at pad.
        let total_steps = frames + num_codebooks - 1;
        let mut delayed: Vec<Vec<u32>> = vec![vec![pad]; num_codebooks];
        for step in 0..total_steps {
            let seq_len = delayed[0].len();
            let mut flat = Vec::with_capacity(num_codebooks * seq_len);
            for row in &delayed {
                flat.extend_from_slice(row);
            }
            let ids = Tensor::from_vec(flat, (1, num_codebooks, seq_len), &self.device)?
                .broadcast_as((batch, num_codebooks, seq_len))?
                .contiguous()?;

            let logits = self.decoder.forward(&ids, &encoder_states)?;
            for (k, head_logits) in logits.iter().enumerate() {
                let token = if step < k || step >= frames + k {
                    // Outside codebook k's active window.
                    pad
                } else {
                    let last = head_logits.i((0, seq_len - 1, ..))?;
                    let last = if use_guidance {
                        let uncond = head_logits.i((1, seq_len - 1, ..))?;
                        (&uncond + ((&last - &uncond)? * params.guidance_scale)?)?
                    } else {
                        last
                    };
                    sampler.sample(&last.to_dtype(DType::F32)?)?
                };
                delayed[k].push(token);
            }
            if step % FRAME_RATE == 0 {
                tracing::debug!(step, total_steps, "decoding audio tokens");
            }
        }

        // Undo the delay: frame f of codebook k sits at position f + k + 1
        // (the +1 skips the start token).
        let mut codes = Vec::with_capacity(num_codebooks * frames);
        for (k, row) in delayed.iter().enumerate() {
            for f in 0..frames {
                codes.push(row[f + k + 1]);
            }
        }
        let codes = Tensor::from_vec(codes, (1, num_codebooks, frames), &self.device)?;

        let pcm = self.codec.decode(&codes)?;
        let pcm = pcm.i(0)?.i(0)?.to_dtype(DType::F32)?;
        let mut samples = pcm.to_vec1::<f32>()?;
        crate::audio::peak_normalize(&mut samples);

        Ok(GeneratedAudio {
            samples,
            sample_rate: self.config.audio_encoder.sampling_rate as u32,
            channels: 1,
        })
    }

    fn encode_text(&mut self, text: &str) -> Result<Tensor> {
        let tokens = self.tokenizer.encode(text, true)?.get_ids().to_vec();
        if tokens.is_empty() {
            return Err(Error::Config("prompt tokenized to nothing".into()));
        }
        let ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let states = self.text_encoder.forward(&ids)?;
        Ok(self.enc_to_dec_proj.forward(&states)?)
    }
}

/// Stack conditional and unconditional encoder states into one batch,
/// right-padding the shorter sequence with zeros.
fn pad_and_stack(cond: &Tensor, uncond: &Tensor) -> Result<Tensor> {
    let (_, cond_len, dim) = cond.dims3()?;
    let (_, uncond_len, _) = uncond.dims3()?;
    let target = cond_len.max(uncond_len);
    let pad_to = |t: &Tensor, len: usize| -> Result<Tensor> {
        if len == target {
            return Ok(t.clone());
        }
        let padding = Tensor::zeros((1, target - len, dim), t.dtype(), t.device())?;
        Ok(Tensor::cat(&[t, &padding], 1)?)
    };
    let cond = pad_to(cond, cond_len)?;
    let uncond = pad_to(uncond, uncond_len)?;
    Ok(Tensor::cat(&[cond, uncond], 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_blocks_future() {
        let mask = causal_attention_mask(4, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 4, 4]);
        let vals: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        // Row 0: only position 0 visible.
        assert_eq!(vals[0], 0.0);
        assert!(vals[1] < -1e30);
        // Last row: everything visible.
        assert!(vals[12..16].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_sinusoidal_positions_shape() {
        let pos = sinusoidal_positions(6, 8, &Device::Cpu).unwrap();
        assert_eq!(pos.dims(), &[6, 8]);
        let row0: Vec<f32> = pos.i(0).unwrap().to_vec1().unwrap();
        // Position 0: cos(0)=1 in the first half, sin(0)=0 in the second.
        assert!(row0[..4].iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(row0[4..].iter().all(|&v| v.abs() < 1e-6));
    }

    #[test]
    fn test_pad_and_stack_unequal_lengths() {
        let dev = Device::Cpu;
        let cond = Tensor::ones((1usize, 5usize, 4usize), DType::F32, &dev).unwrap();
        let uncond = Tensor::ones((1usize, 2usize, 4usize), DType::F32, &dev).unwrap();
        let both = pad_and_stack(&cond, &uncond).unwrap();
        assert_eq!(both.dims(), &[2, 5, 4]);
        // Padded tail of the uncond row is zero.
        let tail: Vec<f32> = both
            .i((1, 4, ..))
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(tail.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_delay_pattern_arithmetic() {
        // 3 codebooks, 4 frames: codebook k's frame f is sampled at step f+k.
        let frames = 4;
        let num_codebooks = 3;
        let total_steps = frames + num_codebooks - 1;
        for k in 0..num_codebooks {
            let active: Vec<usize> = (0..total_steps)
                .filter(|&step| step >= k && step < frames + k)
                .collect();
            assert_eq!(active.len(), frames);
            assert_eq!(active[0], k);
        }
    }
}
