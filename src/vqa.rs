//! Image description and question answering with Moondream2.
//!
//! Loads the quantized GGUF checkpoint, encodes the image once through the
//! vision encoder, then samples the answer autoregressively. Both the CLI
//! and the HTTP endpoint go through [`Moondream::answer`].

use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::{moondream, quantized_moondream};
use image::DynamicImage;
use tokenizers::Tokenizer;

use crate::config::VqaParams;
use crate::{Error, Result, hub};

/// Quantized checkpoint location.
const MODEL_REPO: &str = "santiagomed/candle-moondream";
const MODEL_FILE: &str = "model-q4_0.gguf";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Vision encoder input resolution.
const IMAGE_SIZE: usize = 378;

/// The model signals the end of an answer either with its single special
/// token or with the literal `<END>` character sequence.
const SPECIAL_TOKEN: &str = "<|endoftext|>";
const END_MARKER: &[u32] = &[27, 10619, 29];

/// A resident Moondream2 question-answering pipeline.
pub struct Moondream {
    model: quantized_moondream::Model,
    tokenizer: Tokenizer,
    device: Device,
    seed: u64,
    repeat_penalty: f32,
    repeat_last_n: usize,
}

impl Moondream {
    /// Fetch the quantized checkpoint from the hub and load it.
    pub fn load(device: &Device) -> Result<Self> {
        let model_path = hub::model_file(MODEL_REPO, MODEL_FILE)?;
        let tokenizer_path = hub::model_file(MODEL_REPO, TOKENIZER_FILE)?;
        Self::from_files(&model_path, &tokenizer_path, device)
    }

    /// Load from local checkpoint files.
    pub fn from_files(
        model_path: impl AsRef<std::path::Path>,
        tokenizer_path: impl AsRef<std::path::Path>,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)?;

        let config = moondream::Config::v2();
        let vb = candle_transformers::quantized_var_builder::VarBuilder::from_gguf(
            model_path.as_ref(),
            device,
        )?;
        let model = quantized_moondream::Model::new(&config, vb)?;

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
            seed: 1337,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
        })
    }

    /// Answer a question about an image.
    pub fn answer(
        &mut self,
        image: &DynamicImage,
        params: &VqaParams,
    ) -> Result<String> {
        // Fresh decode state per request; the KV cache belongs to the
        // previous answer.
        self.model.text_model.clear_kv_cache();
        let mut logits_processor = LogitsProcessor::new(self.seed, None, None);

        let image_tensor = crate::image::normalized_square_tensor(
            image,
            IMAGE_SIZE,
            0.5,
            0.5,
            &self.device,
        )?;
        let image_embeds = image_tensor.unsqueeze(0)?;
        let image_embeds = image_embeds.apply(self.model.vision_encoder())?;

        let prompt = format!("\n\nQuestion: {}\n\nAnswer:", params.question);
        let encoded = self.tokenizer.encode(prompt, true)?;
        if encoded.is_empty() {
            return Err(Error::Config("empty prompt after tokenization".into()));
        }
        let mut tokens = encoded.get_ids().to_vec();

        let special_token = *self
            .tokenizer
            .get_vocab(true)
            .get(SPECIAL_TOKEN)
            .ok_or_else(|| Error::Config(format!("{SPECIAL_TOKEN} not in vocab")))?;
        let (bos_token, eos_token) = (special_token, special_token);

        let mut answer_ids = Vec::new();
        for index in 0..params.max_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let context = &tokens[tokens.len().saturating_sub(context_size)..];
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = if index > 0 {
                self.model.text_model.forward(&input)?
            } else {
                let bos = Tensor::new(&[bos_token], &self.device)?.unsqueeze(0)?;
                self.model
                    .text_model
                    .forward_with_img(&bos, &input, &image_embeds)?
            };

            let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
            let logits = if self.repeat_penalty == 1. {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(self.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    self.repeat_penalty,
                    &tokens[start_at..],
                )?
            };

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            if next_token == eos_token || tokens.ends_with(END_MARKER) {
                break;
            }
            answer_ids.push(next_token);
        }

        let text = self.tokenizer.decode(&answer_ids, true)?;
        Ok(strip_end_marker(&text).trim().to_string())
    }
}

/// Remove a trailing `<END` fragment left when generation stops on the
/// literal end marker (its closing `>` terminates sampling before the
/// marker tokens are excluded from the answer).
fn strip_end_marker(text: &str) -> &str {
    text.strip_suffix("<END").unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_end_marker() {
        assert_eq!(strip_end_marker("a red bicycle<END"), "a red bicycle");
        assert_eq!(strip_end_marker("a red bicycle"), "a red bicycle");
    }

    #[test]
    fn test_end_marker_matching() {
        let tokens = vec![5u32, 9, 27, 10619, 29];
        assert!(tokens.ends_with(END_MARKER));
        assert!(![5u32, 27, 10619].ends_with(END_MARKER));
    }
}
