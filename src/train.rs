//! LoRA fine-tuning.
//!
//! Fine-tunes adapter weights on top of a frozen llama-style base model:
//! prompt/response pairs are rendered through the instruction template,
//! tokenized, and pushed through an AdamW loop that only updates the
//! low-rank adapter tensors. The adapter is saved as safetensors and
//! applied again at inference by [`model::CausalLM`].
//!
//! - [`dataset`] — JSONL pairs, instruction template, token batches
//! - [`lora`] — adapter pairs injected on the attention projections
//! - [`model`] — the decoder itself, frozen base + trainable adapters

pub mod dataset;
pub mod lora;
pub mod model;

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use candle_nn::{Optimizer, VarMap};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::Result;
use dataset::Dataset;
use model::CausalLM;

/// Trainer hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub warmup_steps: usize,
    /// Micro-batches accumulated per optimizer step (batch size is 1).
    pub grad_accum: usize,
    pub save_steps: usize,
    pub save_total_limit: usize,
    pub logging_steps: usize,
    pub max_len: usize,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 5,
            learning_rate: 1e-4,
            weight_decay: 0.01,
            warmup_steps: 50,
            grad_accum: 8,
            save_steps: 100,
            save_total_limit: 3,
            logging_steps: 10,
            max_len: 512,
            seed: 42,
        }
    }
}

/// Result of a training run.
#[derive(Debug)]
pub struct TrainSummary {
    pub optimizer_steps: usize,
    pub final_loss: f64,
    pub adapter_path: PathBuf,
}

/// Learning rate at a given optimizer step: linear warmup to the peak,
/// then cosine decay to zero over the remaining steps.
fn lr_at(step: usize, total_steps: usize, config: &TrainConfig) -> f64 {
    let peak = config.learning_rate;
    if step < config.warmup_steps {
        return peak * (step + 1) as f64 / config.warmup_steps as f64;
    }
    let decay_steps = total_steps.saturating_sub(config.warmup_steps).max(1);
    let progress = (step - config.warmup_steps) as f64 / decay_steps as f64;
    let progress = progress.min(1.0);
    peak * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
}

/// Delete the oldest checkpoints beyond the retention cap.
fn prune_checkpoints(checkpoints: &mut Vec<PathBuf>, limit: usize) {
    while checkpoints.len() > limit {
        let oldest = checkpoints.remove(0);
        if let Err(error) = std::fs::remove_file(&oldest) {
            tracing::warn!(path = %oldest.display(), %error, "could not prune checkpoint");
        }
    }
}

/// Run the fine-tuning loop.
///
/// `varmap` must hold exactly the trainable adapter tensors of `model`.
/// Checkpoints land under `output_dir` as `checkpoint-{step}.safetensors`;
/// the final adapter is `adapter.safetensors`.
pub fn train(
    model: &CausalLM,
    varmap: &VarMap,
    dataset: &Dataset,
    config: &TrainConfig,
    output_dir: &Path,
) -> Result<TrainSummary> {
    if dataset.is_empty() {
        return Err(crate::Error::Config("training dataset is empty".into()));
    }
    std::fs::create_dir_all(output_dir)?;

    let micro_per_epoch = dataset.len();
    let steps_per_epoch = micro_per_epoch.div_ceil(config.grad_accum);
    let total_steps = steps_per_epoch * config.epochs;

    let params = candle_nn::ParamsAdamW {
        lr: config.learning_rate,
        weight_decay: config.weight_decay,
        ..Default::default()
    };
    let mut optimizer = candle_nn::AdamW::new(varmap.all_vars(), params)?;

    tracing::info!(
        examples = dataset.len(),
        epochs = config.epochs,
        total_steps,
        "starting fine-tune"
    );

    let mut rng = rand::rngs::StdRng::seed_from_u64(config.seed);
    let mut step = 0usize;
    let mut last_loss = f64::NAN;
    let mut checkpoints: Vec<PathBuf> = Vec::new();
    let mut pending: Vec<Tensor> = Vec::new();

    for epoch in 0..config.epochs {
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        order.shuffle(&mut rng);

        for index in order {
            let (input, target) = dataset.batch(index, model.device())?;
            let logits = model.forward(&input, true)?;
            let (batch, seq_len, vocab) = logits.dims3()?;
            let loss = candle_nn::loss::cross_entropy(
                &logits.reshape((batch * seq_len, vocab))?,
                &target.reshape(batch * seq_len)?,
            )?;
            pending.push(loss);

            if pending.len() < config.grad_accum {
                continue;
            }

            step += 1;
            optimizer.set_learning_rate(lr_at(step - 1, total_steps, config));
            let mean_loss = Tensor::stack(&pending, 0)?.mean(0)?;
            pending.clear();
            last_loss = mean_loss.to_scalar::<f32>()? as f64;
            optimizer.backward_step(&mean_loss)?;

            if step % config.logging_steps == 0 {
                tracing::info!(epoch, step, loss = last_loss, "train");
            }
            if step % config.save_steps == 0 {
                let path = output_dir.join(format!("checkpoint-{step}.safetensors"));
                varmap.save(&path)?;
                checkpoints.push(path);
                prune_checkpoints(&mut checkpoints, config.save_total_limit);
            }
        }

        // Flush a short trailing accumulation window at epoch end.
        if !pending.is_empty() {
            step += 1;
            optimizer.set_learning_rate(lr_at(step - 1, total_steps, config));
            let mean_loss = Tensor::stack(&pending, 0)?.mean(0)?;
            pending.clear();
            last_loss = mean_loss.to_scalar::<f32>()? as f64;
            optimizer.backward_step(&mean_loss)?;
        }
    }

    let adapter_path = output_dir.join("adapter.safetensors");
    varmap.save(&adapter_path)?;
    tracing::info!(path = %adapter_path.display(), "adapter saved");

    Ok(TrainSummary {
        optimizer_steps: step,
        final_loss: last_loss,
        adapter_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lr_warmup_ramps_linearly() {
        let config = TrainConfig::default();
        let first = lr_at(0, 1000, &config);
        let mid = lr_at(24, 1000, &config);
        let peak = lr_at(49, 1000, &config);
        assert!(first < mid && mid < peak);
        assert!((peak - config.learning_rate).abs() < 1e-9);
    }

    #[test]
    fn test_lr_cosine_decays_to_zero() {
        let config = TrainConfig::default();
        let late = lr_at(999, 1000, &config);
        assert!(late < config.learning_rate * 0.01);
        // Monotone decrease after warmup.
        assert!(lr_at(100, 1000, &config) > lr_at(500, 1000, &config));
    }

    #[test]
    fn test_prune_checkpoints_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for step in [100, 200, 300, 400] {
            let p = dir.path().join(format!("checkpoint-{step}.safetensors"));
            std::fs::write(&p, b"x").unwrap();
            paths.push(p);
        }
        prune_checkpoints(&mut paths, 3);
        assert_eq!(paths.len(), 3);
        assert!(!dir.path().join("checkpoint-100.safetensors").exists());
        assert!(dir.path().join("checkpoint-400.safetensors").exists());
    }

    #[test]
    fn test_default_hyperparameters() {
        let config = TrainConfig::default();
        assert_eq!(config.epochs, 5);
        assert_eq!(config.learning_rate, 1e-4);
        assert_eq!(config.grad_accum, 8);
        assert_eq!(config.warmup_steps, 50);
        assert_eq!(config.save_total_limit, 3);
        assert_eq!(config.max_len, 512);
    }
}
