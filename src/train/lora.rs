//! Low-rank adapters.
//!
//! A LoRA pair adds `ΔW·x = (α/r) · B·(A·x)` next to a frozen linear layer.
//! A is Kaiming-initialized, B starts at zero, so the adapted model is
//! exactly the base model until the first optimizer step. During training
//! the adapter tensors live in a `VarMap`; at inference they load from the
//! saved safetensors file.

use candle_core::Tensor;
use candle_nn::{Linear, Module, ModuleT, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Adapter hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraConfig {
    pub rank: usize,
    pub alpha: f64,
    pub dropout: f32,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 16,
            alpha: 32.0,
            dropout: 0.1,
        }
    }
}

impl LoraConfig {
    pub fn scale(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

struct Adapter {
    a: Tensor,
    b: Tensor,
    scale: f64,
    dropout: candle_nn::Dropout,
}

/// A linear layer with an optional low-rank adapter on the side.
pub struct LoraLinear {
    base: Linear,
    adapter: Option<Adapter>,
}

impl LoraLinear {
    /// Wrap a frozen base projection without an adapter (plain linear).
    pub fn plain(in_dim: usize, out_dim: usize, base_vb: VarBuilder) -> Result<Self> {
        let base = candle_nn::linear_no_bias(in_dim, out_dim, base_vb)?;
        Ok(Self {
            base,
            adapter: None,
        })
    }

    /// Wrap a frozen base projection and attach an adapter pair.
    ///
    /// `adapter_vb` is VarMap-backed during training (tensors are created
    /// with their init) and safetensors-backed at inference (tensors are
    /// loaded). Both paths use the names `lora_a` / `lora_b`.
    pub fn with_adapter(
        in_dim: usize,
        out_dim: usize,
        config: &LoraConfig,
        base_vb: VarBuilder,
        adapter_vb: VarBuilder,
    ) -> Result<Self> {
        let base = candle_nn::linear_no_bias(in_dim, out_dim, base_vb)?;
        let a = adapter_vb.get_with_hints(
            (config.rank, in_dim),
            "lora_a",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let b = adapter_vb.get_with_hints(
            (out_dim, config.rank),
            "lora_b",
            candle_nn::Init::Const(0.0),
        )?;
        Ok(Self {
            base,
            adapter: Some(Adapter {
                a,
                b,
                scale: config.scale(),
                dropout: candle_nn::Dropout::new(config.dropout),
            }),
        })
    }

    /// Forward with an explicit train flag (dropout on the adapter path).
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let base_out = self.base.forward(xs)?;
        let Some(adapter) = &self.adapter else {
            return Ok(base_out);
        };
        let dropped = adapter.dropout.forward_t(xs, train)?;
        let down = dropped.broadcast_matmul(&adapter.a.t()?)?;
        let up = down.broadcast_matmul(&adapter.b.t()?)?;
        Ok((base_out + (up * adapter.scale)?)?)
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_scale() {
        assert_eq!(LoraConfig::default().scale(), 2.0);
    }

    #[test]
    fn test_default_hyperparameters() {
        let config = LoraConfig::default();
        assert_eq!(config.rank, 16);
        assert_eq!(config.alpha, 32.0);
        assert!((config.dropout - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_fresh_adapter_is_identity_delta() {
        // B starts at zero, so adapted output == base output.
        let device = Device::Cpu;
        let base_map = VarMap::new();
        let base_vb = VarBuilder::from_varmap(&base_map, DType::F32, &device);
        let adapter_map = VarMap::new();
        let adapter_vb = VarBuilder::from_varmap(&adapter_map, DType::F32, &device);

        let config = LoraConfig::default();
        let with = LoraLinear::with_adapter(8, 8, &config, base_vb.pp("w"), adapter_vb).unwrap();
        let plain = LoraLinear::plain(8, 8, base_vb.pp("w")).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 3, 8), &device).unwrap();
        let a = with.forward_t(&x, false).unwrap();
        let b = plain.forward_t(&x, false).unwrap();
        let diff: f32 = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_adapter_tensors_are_registered() {
        let device = Device::Cpu;
        let base_map = VarMap::new();
        let base_vb = VarBuilder::from_varmap(&base_map, DType::F32, &device);
        let adapter_map = VarMap::new();
        let adapter_vb = VarBuilder::from_varmap(&adapter_map, DType::F32, &device);

        let config = LoraConfig::default();
        let layer = LoraLinear::with_adapter(
            16,
            16,
            &config,
            base_vb.pp("q_proj"),
            adapter_vb.pp("q_proj"),
        )
        .unwrap();
        assert!(layer.has_adapter());
        // Exactly the two adapter tensors are trainable.
        assert_eq!(adapter_map.all_vars().len(), 2);
    }
}
