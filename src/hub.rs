//! Named-checkpoint fetch from the HuggingFace hub.
//!
//! Thin wrappers over the sync `hf-hub` API. Downloads are cached by the
//! hub client; callers on async paths wrap these in `spawn_blocking`.

use std::path::PathBuf;

use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};

use crate::Result;

/// Fetch one file from a model repository at the default revision.
pub fn model_file(repo: &str, file: &str) -> Result<PathBuf> {
    let api = Api::new()?;
    let path = api.model(repo.to_string()).get(file)?;
    Ok(path)
}

/// Fetch one file from a model repository pinned to a revision.
pub fn model_file_at(repo: &str, revision: &str, file: &str) -> Result<PathBuf> {
    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        repo.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));
    let path = repo.get(file)?;
    Ok(path)
}

/// Fetch several files from the same repository.
pub fn model_files(repo: &str, files: &[&str]) -> Result<Vec<PathBuf>> {
    let api = Api::new()?;
    let repo = api.model(repo.to_string());
    files
        .iter()
        .map(|f| repo.get(f).map_err(crate::Error::from))
        .collect()
}
