//! Multimodal generation toolkit in pure Rust.
//!
//! A candle-based collection of invocation wrappers around pretrained
//! checkpoints: diffusion text-to-image, instruction-guided image editing,
//! image question answering, text-to-audio, local LLM text generation, and
//! LoRA fine-tuning. Model internals come from `candle-transformers`;
//! weights are fetched from the HuggingFace hub on first use.
//!
//! ## Shape
//!
//! Every tool follows the same linear sequence:
//!
//! ```text
//! named checkpoint → pipeline object
//!                  → one inference call with a fixed parameter bag
//!                  → artifact written under a collision-safe path
//! ```
//!
//! ## Modules
//!
//! - [`diffusion`] — Stable Diffusion text-to-image and img2img editing
//! - [`vqa`] — Moondream2 image description / question answering
//! - [`audiogen`] — MusicGen text-to-audio (music and sound effects)
//! - [`textgen`] — quantized GGUF LLM completion with docs-dir context
//! - [`train`] — LoRA adapters, prompt/response dataset, AdamW trainer
//! - [`audio`] — WAV/MP3 artifact I/O
//! - [`image`] — image decode/normalize and tensor→PNG save
//! - [`http`] — the bearer-authed VQA endpoint
//! - [`telegram`] — minimal Telegram Bot API client (long-poll)
//! - [`worker`] — resident pipeline behind a request queue
//! - [`output`] — collision-probed artifact filenames

pub mod audio;
pub mod audiogen;
pub mod config;
pub mod diffusion;
pub mod http;
pub mod hub;
pub mod image;
pub mod output;
pub mod telegram;
pub mod textgen;
pub mod train;
pub mod vqa;
pub mod worker;

mod error;

pub use error::{Error, Result};
