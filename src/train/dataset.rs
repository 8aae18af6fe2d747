//! Prompt/response training data.
//!
//! Examples arrive as JSONL records and are rendered through the
//! instruction template before tokenization. The same template (minus the
//! answer) is what the chat binary sends at inference, so the adapter sees
//! identical framing in both directions.

use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::{Error, Result};

/// One prompt/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Example {
    pub agent: String,
    pub question: String,
    pub answer: String,
}

/// Render a training example through the instruction template.
pub fn format_example(agent: &str, question: &str, answer: &str) -> String {
    format!("<s>[INST] Agent: {agent}\nQuestion: {question} [/INST] {answer}</s>")
}

/// Render an inference prompt (no answer) through the same template.
pub fn chat_prompt(agent: &str, question: &str) -> String {
    format!("<s>[INST] Agent: {agent}\nQuestion: {question} [/INST]")
}

/// Pull the answer out of a completion that still carries the prompt.
pub fn extract_answer(response: &str) -> &str {
    response
        .rsplit("[/INST]")
        .next()
        .unwrap_or(response)
        .trim()
}

/// Tokenized training sequences, one per example.
pub struct Dataset {
    sequences: Vec<Vec<u32>>,
}

impl Dataset {
    /// Load a JSONL file of [`Example`] records and tokenize them.
    ///
    /// Sequences are truncated at `max_len` tokens; records too short to
    /// form an (input, target) pair are skipped.
    pub fn from_jsonl(
        path: impl AsRef<Path>,
        tokenizer: &Tokenizer,
        max_len: usize,
    ) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut examples = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let example: Example = serde_json::from_str(line).map_err(|e| {
                Error::Config(format!("bad record on line {}: {e}", line_no + 1))
            })?;
            examples.push(example);
        }
        Self::from_examples(&examples, tokenizer, max_len)
    }

    /// Tokenize in-memory examples.
    pub fn from_examples(
        examples: &[Example],
        tokenizer: &Tokenizer,
        max_len: usize,
    ) -> Result<Self> {
        let mut sequences = Vec::with_capacity(examples.len());
        for example in examples {
            let text = format_example(&example.agent, &example.question, &example.answer);
            let mut ids = tokenizer.encode(text, true)?.get_ids().to_vec();
            ids.truncate(max_len);
            if ids.len() >= 2 {
                sequences.push(ids);
            }
        }
        Ok(Self { sequences })
    }

    /// Build a dataset directly from token sequences.
    pub fn from_token_sequences(sequences: Vec<Vec<u32>>) -> Self {
        let sequences = sequences.into_iter().filter(|s| s.len() >= 2).collect();
        Self { sequences }
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Next-token (input, target) tensors for one example, shape `(1, n-1)`.
    pub fn batch(&self, index: usize, device: &Device) -> Result<(Tensor, Tensor)> {
        let ids = self
            .sequences
            .get(index)
            .ok_or_else(|| Error::Config(format!("example index {index} out of range")))?;
        let n = ids.len();
        let input = Tensor::from_slice(&ids[..n - 1], (1, n - 1), device)?;
        let target = Tensor::from_slice(&ids[1..], (1, n - 1), device)?;
        Ok((input, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_example_template() {
        let text = format_example("coffee-agent", "what the best coffee?", "Arabica from Bolivia");
        assert_eq!(
            text,
            "<s>[INST] Agent: coffee-agent\nQuestion: what the best coffee? [/INST] Arabica from Bolivia</s>"
        );
    }

    #[test]
    fn test_chat_prompt_is_prefix_of_training_text() {
        let full = format_example("a", "q", "ans");
        let prompt = chat_prompt("a", "q");
        assert!(full.starts_with(&prompt));
    }

    #[test]
    fn test_extract_answer() {
        let response = "<s>[INST] Agent: a\nQuestion: q [/INST] The answer. ";
        assert_eq!(extract_answer(response), "The answer.");
        assert_eq!(extract_answer("no marker here"), "no marker here");
    }

    #[test]
    fn test_batch_shifts_by_one() {
        let dataset = Dataset::from_token_sequences(vec![vec![10, 11, 12, 13]]);
        let (input, target) = dataset.batch(0, &Device::Cpu).unwrap();
        assert_eq!(input.dims(), &[1, 3]);
        let input: Vec<u32> = input.flatten_all().unwrap().to_vec1().unwrap();
        let target: Vec<u32> = target.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(input, vec![10, 11, 12]);
        assert_eq!(target, vec![11, 12, 13]);
    }

    #[test]
    fn test_short_sequences_are_skipped() {
        let dataset = Dataset::from_token_sequences(vec![vec![1], vec![], vec![1, 2]]);
        assert_eq!(dataset.len(), 1);
    }

    #[test]
    fn test_batch_out_of_range() {
        let dataset = Dataset::from_token_sequences(vec![vec![1, 2]]);
        assert!(dataset.batch(5, &Device::Cpu).is_err());
    }
}
