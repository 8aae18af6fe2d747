//! Local LLM text completion from quantized GGUF checkpoints.
//!
//! One llama-family model loaded from a GGUF file, one completion per call.
//! Also provides the docs-directory context template: every regular file in
//! the directory is concatenated and the question appended, so the model
//! answers from the supplied material.

use std::path::Path;

use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama;
use tokenizers::Tokenizer;

use crate::config::TextGenParams;
use crate::{Error, Result};

/// Default checkpoint when none is given on the command line.
pub const DEFAULT_GGUF_REPO: &str = "TheBloke/Mistral-7B-Instruct-v0.2-GGUF";
pub const DEFAULT_GGUF_FILE: &str = "mistral-7b-instruct-v0.2.Q4_K_M.gguf";
pub const DEFAULT_TOKENIZER_REPO: &str = "mistralai/Mistral-7B-Instruct-v0.2";

/// A loaded quantized causal LM.
pub struct TextGenerator {
    model: quantized_llama::ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    eos_token: u32,
}

impl TextGenerator {
    /// Load a GGUF checkpoint and its tokenizer from local files.
    pub fn load(
        gguf_path: impl AsRef<Path>,
        tokenizer_path: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)?;

        let mut file = std::fs::File::open(gguf_path.as_ref())?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| e.with_path(gguf_path.as_ref()))?;
        tracing::info!(
            tensors = content.tensor_infos.len(),
            "loading GGUF checkpoint"
        );
        let model = quantized_llama::ModelWeights::from_gguf(content, &mut file, device)?;

        let vocab = tokenizer.get_vocab(true);
        let eos_token = ["</s>", "<|im_end|>", "<|endoftext|>"]
            .iter()
            .find_map(|t| vocab.get(*t).copied())
            .ok_or_else(|| Error::Config("no end-of-sequence token in vocab".into()))?;

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
            eos_token,
        })
    }

    /// Run one completion for `prompt`.
    pub fn complete(&mut self, prompt: &str, params: &TextGenParams) -> Result<String> {
        let encoded = self.tokenizer.encode(prompt, true)?;
        let prompt_tokens = encoded.get_ids().to_vec();
        if prompt_tokens.is_empty() {
            return Err(Error::Config("prompt tokenized to nothing".into()));
        }

        let seed = params.seed.unwrap_or_else(rand::random);
        let temperature = (params.temperature > 0.0).then_some(params.temperature);
        let mut logits_processor = LogitsProcessor::new(seed, temperature, params.top_p);

        // Prefill on the whole prompt, then one token at a time.
        let input = Tensor::new(prompt_tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, 0)?;
        let logits = logits.squeeze(0)?;
        let mut next_token = logits_processor.sample(&logits)?;

        let mut all_tokens = prompt_tokens.clone();
        let mut generated = Vec::new();
        if next_token != self.eos_token {
            all_tokens.push(next_token);
            generated.push(next_token);
        }

        while generated.len() < params.max_tokens && next_token != self.eos_token {
            let input = Tensor::new(&[next_token], &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, all_tokens.len() - 1)?;
            let logits = logits.squeeze(0)?;
            let logits = if params.repeat_penalty == 1.0 {
                logits
            } else {
                let start_at = all_tokens.len().saturating_sub(params.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repeat_penalty,
                    &all_tokens[start_at..],
                )?
            };
            next_token = logits_processor.sample(&logits)?;
            if next_token == self.eos_token {
                break;
            }
            all_tokens.push(next_token);
            generated.push(next_token);
        }

        let text = self.tokenizer.decode(&generated, true)?;
        Ok(text)
    }
}

/// Build the context-grounded prompt used by the docs-dir mode.
///
/// Every regular file directly under `docs_dir` is read in directory order
/// and concatenated with a trailing newline each, then the question is
/// appended: `"Context: {content}Question: {question}"`.
pub fn context_prompt(docs_dir: impl AsRef<Path>, question: &str) -> Result<String> {
    let mut content = String::new();
    let mut entries: Vec<_> = std::fs::read_dir(docs_dir.as_ref())?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_file() {
            content.push_str(&std::fs::read_to_string(&path)?);
            content.push('\n');
        }
    }
    Ok(format!("Context: {content}Question: {question}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_prompt_concatenates_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.txt"), "beta").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/ignored.txt"), "nope").unwrap();

        let prompt = context_prompt(dir.path(), "how to create asset?").unwrap();
        assert_eq!(prompt, "Context: alpha\nbeta\nQuestion: how to create asset?");
    }

    #[test]
    fn test_context_prompt_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = context_prompt(dir.path(), "q").unwrap();
        assert_eq!(prompt, "Context: Question: q");
    }

    #[test]
    fn test_context_prompt_missing_dir() {
        assert!(context_prompt("/definitely/not/here", "q").is_err());
    }
}
