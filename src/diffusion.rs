//! Stable Diffusion text-to-image and instruction-guided editing.
//!
//! Wraps the diffusion family from `candle-transformers`: CLIP text encoder,
//! UNet denoiser, and VAE, driven by a DDIM schedule. Two entry points:
//!
//! - [`DiffusionPipeline::generate`] — prompt → image (txt2img)
//! - [`DiffusionPipeline::edit`] — input image + instruction → image
//!   (img2img: VAE-encode, renoise partway, denoise with the edit prompt)
//!
//! Checkpoint internals (UNet blocks, VAE, scheduler math) are entirely the
//! model crate's; this module owns prompt encoding, the denoising loop and
//! classifier-free guidance plumbing.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{self, StableDiffusionConfig};
use tokenizers::Tokenizer;

use crate::config::{EditParams, ImageParams};
use crate::{Error, Result, hub};

/// VAE latent scaling factor shared by the 1.x/2.x family.
const VAE_SCALE: f64 = 0.18215;

/// Which pretrained checkpoint family member to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SdVersion {
    V1_5,
    #[default]
    V2_1,
}

impl SdVersion {
    /// Hub repository holding the checkpoint.
    pub fn repo(&self) -> &'static str {
        match self {
            Self::V1_5 => "stable-diffusion-v1-5/stable-diffusion-v1-5",
            Self::V2_1 => "stabilityai/stable-diffusion-2-1",
        }
    }

    fn config(&self, height: usize, width: usize) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(None, Some(height), Some(width)),
            Self::V2_1 => StableDiffusionConfig::v2_1(None, Some(height), Some(width)),
        }
    }
}

impl fmt::Display for SdVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1_5 => write!(f, "v1-5"),
            Self::V2_1 => write!(f, "v2-1"),
        }
    }
}

impl FromStr for SdVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v1-5" | "v1.5" | "1.5" => Ok(Self::V1_5),
            "v2-1" | "v2.1" | "2.1" => Ok(Self::V2_1),
            other => Err(Error::Config(format!(
                "unknown stable-diffusion version '{other}' (expected v1-5 or v2-1)"
            ))),
        }
    }
}

/// A loaded diffusion pipeline, fixed to one output geometry.
pub struct DiffusionPipeline {
    tokenizer: Tokenizer,
    clip: stable_diffusion::clip::ClipTextTransformer,
    vae: stable_diffusion::vae::AutoEncoderKL,
    unet: stable_diffusion::unet_2d::UNet2DConditionModel,
    sd_config: StableDiffusionConfig,
    device: Device,
    dtype: DType,
    width: usize,
    height: usize,
}

impl DiffusionPipeline {
    /// Download (or reuse cached) weights and build the pipeline.
    pub fn load(
        version: SdVersion,
        width: usize,
        height: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let sd_config = version.config(height, width);

        let tokenizer_path = hub::model_file("openai/clip-vit-base-patch32", "tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)?;

        let repo = version.repo();
        tracing::info!(%repo, width, height, "loading diffusion weights");
        let clip_weights = hub::model_file(repo, "text_encoder/model.safetensors")?;
        let vae_weights = hub::model_file(repo, "vae/diffusion_pytorch_model.safetensors")?;
        let unet_weights = hub::model_file(repo, "unet/diffusion_pytorch_model.safetensors")?;

        let clip =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_weights, device, dtype)?;
        let vae = sd_config.build_vae(vae_weights, device, dtype)?;
        let unet = sd_config.build_unet(unet_weights, device, 4, false, dtype)?;

        Ok(Self {
            tokenizer,
            clip,
            vae,
            unet,
            sd_config,
            device: device.clone(),
            dtype,
            width,
            height,
        })
    }

    /// Generate one image from a text prompt.
    ///
    /// Returns a `(3, height, width)` f32 tensor with values in [0, 1].
    pub fn generate(&self, params: &ImageParams) -> Result<Tensor> {
        params.validate()?;
        if let Some(seed) = params.seed {
            self.device.set_seed(seed)?;
        }
        let use_guidance = params.guidance_scale > 1.0;
        let text_embeddings =
            self.encode_prompt(&params.prompt, &params.negative_prompt, use_guidance)?;

        let mut scheduler = self.sd_config.build_scheduler(params.steps)?;

        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, self.height / 8, self.width / 8),
            &self.device,
        )?
        .to_dtype(self.dtype)?;
        let latents = (latents * scheduler.init_noise_sigma())?;

        let latents = self.denoise(
            latents,
            &text_embeddings,
            scheduler.as_mut(),
            0,
            params.guidance_scale,
        )?;
        self.decode_latents(&latents)
    }

    /// Edit an input image according to a text instruction.
    ///
    /// The image is resized to the pipeline geometry, VAE-encoded, noised to
    /// `steps × (1 − strength)` into the schedule, then denoised under the
    /// instruction prompt.
    pub fn edit(&self, input: &image::DynamicImage, params: &EditParams) -> Result<Tensor> {
        params.validate()?;
        if let Some(seed) = params.seed {
            self.device.set_seed(seed)?;
        }
        let use_guidance = params.guidance_scale > 1.0;
        let text_embeddings =
            self.encode_prompt(&params.prompt, &params.negative_prompt, use_guidance)?;

        let mut scheduler = self.sd_config.build_scheduler(params.steps)?;
        let t_start = params.steps - (params.steps as f64 * params.strength) as usize;

        let image_tensor =
            crate::image::diffusion_input_tensor(input, self.width, self.height, &self.device)?
                .to_dtype(self.dtype)?;
        let latent_dist = self.vae.encode(&image_tensor)?;
        let init_latents = (latent_dist.sample()? * VAE_SCALE)?;

        let timesteps = scheduler.timesteps();
        let noise = init_latents.randn_like(0f64, 1f64)?;
        let latents = scheduler.add_noise(
            &init_latents,
            noise,
            timesteps[t_start.min(timesteps.len() - 1)],
        )?;

        let latents = self.denoise(
            latents,
            &text_embeddings,
            scheduler.as_mut(),
            t_start,
            params.guidance_scale,
        )?;
        self.decode_latents(&latents)
    }

    /// Encode the prompt (and, under guidance, the negative prompt) into
    /// CLIP hidden states. With guidance the batch is `[uncond, cond]`.
    fn encode_prompt(
        &self,
        prompt: &str,
        negative_prompt: &str,
        use_guidance: bool,
    ) -> Result<Tensor> {
        let cond = self.clip_hidden_states(prompt)?;
        if !use_guidance {
            return Ok(cond);
        }
        let uncond = self.clip_hidden_states(negative_prompt)?;
        Ok(Tensor::cat(&[uncond, cond], 0)?)
    }

    fn clip_hidden_states(&self, text: &str) -> Result<Tensor> {
        let pad_id = match &self.sd_config.clip.pad_with {
            Some(padding) => self
                .tokenizer
                .get_vocab(true)
                .get(padding.as_str())
                .copied()
                .ok_or_else(|| Error::Config(format!("pad token '{padding}' not in vocab")))?,
            None => self
                .tokenizer
                .get_vocab(true)
                .get("<|endoftext|>")
                .copied()
                .ok_or_else(|| Error::Config("no <|endoftext|> token in vocab".into()))?,
        };

        let mut tokens = self.tokenizer.encode(text, true)?.get_ids().to_vec();
        let max_len = self.sd_config.clip.max_position_embeddings;
        if tokens.len() > max_len {
            return Err(Error::Config(format!(
                "prompt is too long: {} tokens > {max_len}",
                tokens.len()
            )));
        }
        while tokens.len() < max_len {
            tokens.push(pad_id);
        }

        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let hidden = self.clip.forward(&tokens)?;
        Ok(hidden.to_dtype(self.dtype)?)
    }

    /// The denoising loop, shared by txt2img (`t_start` = 0) and img2img.
    fn denoise(
        &self,
        mut latents: Tensor,
        text_embeddings: &Tensor,
        scheduler: &mut dyn stable_diffusion::schedulers::Scheduler,
        t_start: usize,
        guidance_scale: f64,
    ) -> Result<Tensor> {
        let use_guidance = guidance_scale > 1.0;
        let timesteps = scheduler.timesteps().to_vec();
        for (step_index, &timestep) in timesteps.iter().enumerate() {
            if step_index < t_start {
                continue;
            }
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input =
                scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, text_embeddings)?;

            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            tracing::debug!(step = step_index + 1, total = timesteps.len(), "denoise");
        }
        Ok(latents)
    }

    /// VAE-decode latents into a `(3, height, width)` tensor in [0, 1].
    fn decode_latents(&self, latents: &Tensor) -> Result<Tensor> {
        let image = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?;
        let image = image.clamp(0f32, 1f32)?.to_dtype(DType::F32)?;
        Ok(image.i(0)?.to_device(&Device::Cpu)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        assert_eq!("v1-5".parse::<SdVersion>().unwrap(), SdVersion::V1_5);
        assert_eq!("2.1".parse::<SdVersion>().unwrap(), SdVersion::V2_1);
        assert!("v9".parse::<SdVersion>().is_err());
    }

    #[test]
    fn test_version_display_roundtrip() {
        for v in [SdVersion::V1_5, SdVersion::V2_1] {
            assert_eq!(v.to_string().parse::<SdVersion>().unwrap(), v);
        }
    }

    #[test]
    fn test_version_repo_names() {
        assert!(SdVersion::V2_1.repo().contains("stable-diffusion-2-1"));
    }
}
