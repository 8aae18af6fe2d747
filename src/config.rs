//! Per-modality parameter bags.
//!
//! Each pipeline takes a single params struct whose `Default` carries the
//! fixed literal values the tools were tuned with. Binaries expose every
//! field as a CLI flag; the structs are also what the service surfaces
//! deserialize their requests into.

use serde::{Deserialize, Serialize};

/// Parameters for diffusion text-to-image generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageParams {
    /// Text description of the image to generate.
    pub prompt: String,

    /// Negative prompt. Empty = unconditional guidance uses the empty string.
    #[serde(default)]
    pub negative_prompt: String,

    /// Output width in pixels. Must be a multiple of 8.
    pub width: usize,

    /// Output height in pixels. Must be a multiple of 8.
    pub height: usize,

    /// Number of denoising steps.
    pub steps: usize,

    /// Classifier-free guidance scale. Values <= 1 disable guidance.
    pub guidance_scale: f64,

    /// Random seed. `None` = random each run.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ImageParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            width: 768,
            height: 768,
            steps: 50,
            guidance_scale: 7.5,
            seed: None,
        }
    }
}

impl ImageParams {
    /// Validate dimension constraints before touching the pipeline.
    pub fn validate(&self) -> crate::Result<()> {
        if self.width % 8 != 0 || self.height % 8 != 0 {
            return Err(crate::Error::Config(format!(
                "width and height must be multiples of 8, got {}x{}",
                self.width, self.height
            )));
        }
        if self.steps == 0 {
            return Err(crate::Error::Config("steps must be at least 1".into()));
        }
        Ok(())
    }
}

/// Parameters for instruction-guided image editing (img2img).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditParams {
    /// Edit instruction, e.g. "make it a watercolor painting".
    pub prompt: String,

    #[serde(default)]
    pub negative_prompt: String,

    /// Number of denoising steps over the full schedule.
    pub steps: usize,

    /// Classifier-free guidance scale.
    pub guidance_scale: f64,

    /// How much of the noise schedule to traverse, in (0, 1].
    /// 1.0 discards the input entirely; low values stay close to it.
    pub strength: f64,

    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for EditParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: 40,
            guidance_scale: 7.5,
            strength: 0.8,
            seed: None,
        }
    }
}

impl EditParams {
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.strength > 0.0 && self.strength <= 1.0) {
            return Err(crate::Error::Config(format!(
                "strength must be in (0, 1], got {}",
                self.strength
            )));
        }
        if self.steps == 0 {
            return Err(crate::Error::Config("steps must be at least 1".into()));
        }
        Ok(())
    }
}

/// Parameters for text-to-audio generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioParams {
    /// Text description of the music or sound to generate.
    pub prompt: String,

    /// Duration in seconds. One second is 50 decoder frames.
    pub duration_s: f64,

    /// Sampling temperature.
    pub temperature: f64,

    /// Top-k sampling cutoff.
    pub top_k: usize,

    /// Classifier-free guidance over the null text condition.
    /// Values <= 1 run a single conditional pass.
    pub guidance_scale: f64,

    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            duration_s: 10.0,
            temperature: 1.0,
            top_k: 250,
            guidance_scale: 3.0,
            seed: None,
        }
    }
}

impl AudioParams {
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.duration_s >= 1.0 && self.duration_s <= 120.0) {
            return Err(crate::Error::Config(format!(
                "duration_s must be between 1 and 120, got {}",
                self.duration_s
            )));
        }
        Ok(())
    }
}

/// Parameters for local LLM text completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextGenParams {
    /// Maximum number of tokens to generate.
    pub max_tokens: usize,

    /// Sampling temperature.
    pub temperature: f64,

    /// Nucleus sampling cutoff. `None` = disabled.
    pub top_p: Option<f64>,

    /// Penalty applied to tokens seen in the recent context.
    pub repeat_penalty: f32,

    /// How many recent tokens the repeat penalty looks at.
    pub repeat_last_n: usize,

    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for TextGenParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.8,
            top_p: Some(0.95),
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: None,
        }
    }
}

/// Parameters for image question answering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VqaParams {
    /// Question asked about the image.
    pub question: String,

    /// Maximum answer length in tokens.
    pub max_tokens: usize,
}

impl Default for VqaParams {
    fn default() -> Self {
        Self {
            question: "Describe this image.".to_string(),
            max_tokens: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_defaults() {
        let p = ImageParams::default();
        assert_eq!(p.steps, 50);
        assert_eq!(p.guidance_scale, 7.5);
        assert_eq!((p.width, p.height), (768, 768));
        assert!(p.seed.is_none());
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_image_rejects_unaligned_dims() {
        let p = ImageParams {
            width: 770,
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_edit_defaults() {
        let p = EditParams::default();
        assert_eq!(p.steps, 40);
        assert_eq!(p.strength, 0.8);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_edit_rejects_bad_strength() {
        let p = EditParams {
            strength: 0.0,
            ..Default::default()
        };
        assert!(p.validate().is_err());
        let p = EditParams {
            strength: 1.5,
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_audio_defaults() {
        let p = AudioParams::default();
        assert_eq!(p.duration_s, 10.0);
        assert_eq!(p.top_k, 250);
        assert_eq!(p.guidance_scale, 3.0);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_audio_duration_bounds() {
        let p = AudioParams {
            duration_s: 0.5,
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_textgen_defaults() {
        let p = TextGenParams::default();
        assert_eq!(p.max_tokens, 512);
        assert_eq!(p.temperature, 0.8);
        assert_eq!(p.top_p, Some(0.95));
    }

    #[test]
    fn test_vqa_default_question() {
        assert_eq!(VqaParams::default().question, "Describe this image.");
    }
}
