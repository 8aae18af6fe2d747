//! Artifact path handling.
//!
//! The one invariant every tool shares: never overwrite an existing file.
//! Batch tools probe `name.ext`, `name-1.ext`, `name-2.ext`, … linearly;
//! service surfaces name artifacts by timestamp.

use std::path::{Path, PathBuf};

use crate::Result;

/// Return the first non-existing path of the form `dir/stem[-n].ext`.
///
/// Probing is linear from the bare name upward, so the sequence of names is
/// stable across runs and gaps left by deleted files are reused.
pub fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let first = dir.join(format!("{stem}.{ext}"));
    if !first.exists() {
        return first;
    }
    let mut counter = 1u64;
    loop {
        let candidate = dir.join(format!("{stem}-{counter}.{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Variant of [`unique_path`] starting from a caller-chosen path.
///
/// If `path` is free it is returned as-is; otherwise its stem gets the same
/// `-n` probing treatment.
pub fn dedup_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    if ext.is_empty() {
        let mut counter = 1u64;
        loop {
            let candidate = dir.join(format!("{stem}-{counter}"));
            if !candidate.exists() {
                return candidate;
            }
            counter += 1;
        }
    }
    unique_path(dir, &stem, &ext)
}

/// Timestamp-based file name (`YYYYmmddHHMMSS.ext`), as used by the bot.
pub fn timestamp_name(ext: &str) -> String {
    let ts = chrono::Local::now().format("%Y%m%d%H%M%S");
    format!("{ts}.{ext}")
}

/// Create the parent directory of `path` if it has one.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Reduce a free-text prompt to a single safe path component.
///
/// Returns `None` when nothing safe remains. Used by the bot's
/// prompt-as-filename cache so a prompt can never escape the files
/// directory.
pub fn sanitize_component(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains('\0')
    {
        return None;
    }
    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_path_probes_linearly() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_path(dir.path(), "image", "png");
        assert_eq!(first, dir.path().join("image.png"));
        std::fs::write(&first, b"x").unwrap();

        let second = unique_path(dir.path(), "image", "png");
        assert_eq!(second, dir.path().join("image-1.png"));
        std::fs::write(&second, b"x").unwrap();

        let third = unique_path(dir.path(), "image", "png");
        assert_eq!(third, dir.path().join("image-2.png"));
    }

    #[test]
    fn test_unique_path_reuses_gaps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out.wav"), b"x").unwrap();
        std::fs::write(dir.path().join("out-2.wav"), b"x").unwrap();
        // out-1 is free, so probing stops there.
        assert_eq!(
            unique_path(dir.path(), "out", "wav"),
            dir.path().join("out-1.wav")
        );
    }

    #[test]
    fn test_dedup_path_keeps_free_path() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.png");
        assert_eq!(dedup_path(&p), p);
    }

    #[test]
    fn test_dedup_path_probes_taken_path() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.png");
        std::fs::write(&p, b"x").unwrap();
        assert_eq!(dedup_path(&p), dir.path().join("a-1.png"));
    }

    #[test]
    fn test_timestamp_name_shape() {
        let name = timestamp_name("mp3");
        // 14 digits + ".mp3"
        assert_eq!(name.len(), 18);
        assert!(name.ends_with(".mp3"));
        assert!(name[..14].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_ensure_parent_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c.wav");
        ensure_parent(&nested).unwrap();
        assert!(nested.parent().unwrap().is_dir());
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("  lofi beats "), Some("lofi beats".into()));
        assert_eq!(sanitize_component("../etc/passwd"), None);
        assert_eq!(sanitize_component("a/b"), None);
        assert_eq!(sanitize_component(""), None);
        assert_eq!(sanitize_component(".."), None);
    }
}
