//! Audio artifact I/O.
//!
//! The text-to-audio pipeline emits mono f32 PCM at 32 kHz; these helpers
//! persist it. WAV is always available; MP3 encoding needs the `audio-mp3`
//! feature (and libmp3lame on the system).

mod wav;

#[cfg(feature = "audio-mp3")]
mod mp3;

pub use wav::{read_wav, write_wav};

#[cfg(feature = "audio-mp3")]
pub use mp3::{write_mp3, write_mp3_to};

use std::path::Path;

use crate::{Error, Result};

/// Output formats selectable by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    #[cfg(feature = "audio-mp3")]
    Mp3,
}

impl AudioFormat {
    /// Parse a file extension (case-insensitive). `None` = unsupported.
    pub fn parse(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(Self::Wav),
            #[cfg(feature = "audio-mp3")]
            "mp3" => Some(Self::Mp3),
            _ => None,
        }
    }
}

/// Write interleaved f32 samples to `path`, picking the codec by extension.
pub fn write_audio(
    path: impl AsRef<Path>,
    samples: &[f32],
    sample_rate: u32,
    num_channels: u16,
) -> Result<()> {
    let path = path.as_ref();
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("wav");
    match AudioFormat::parse(ext) {
        Some(AudioFormat::Wav) => write_wav(path, samples, sample_rate, num_channels),
        #[cfg(feature = "audio-mp3")]
        Some(AudioFormat::Mp3) => write_mp3(path, samples, sample_rate, num_channels),
        None => Err(Error::Audio(format!(
            "unsupported output format '{ext}'"
        ))),
    }
}

/// Duration in seconds of an interleaved sample buffer.
pub fn duration_s(num_samples: usize, sample_rate: u32, num_channels: u16) -> f64 {
    if sample_rate == 0 || num_channels == 0 {
        return 0.0;
    }
    num_samples as f64 / num_channels as f64 / sample_rate as f64
}

/// Peak-normalize samples to [-1, 1]. Silence is left untouched.
pub fn peak_normalize(samples: &mut [f32]) {
    let max_abs = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    if max_abs > 1e-8 {
        let scale = 1.0 / max_abs;
        for s in samples.iter_mut() {
            *s *= scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!(AudioFormat::parse("wav"), Some(AudioFormat::Wav));
        assert_eq!(AudioFormat::parse("WAV"), Some(AudioFormat::Wav));
        assert_eq!(AudioFormat::parse("flac"), None);
    }

    #[test]
    fn test_duration() {
        // 2 seconds of mono at 32kHz
        assert_eq!(duration_s(64_000, 32_000, 1), 2.0);
        // 1 second of stereo at 48kHz
        assert_eq!(duration_s(96_000, 48_000, 2), 1.0);
        assert_eq!(duration_s(100, 0, 1), 0.0);
    }

    #[test]
    fn test_peak_normalize() {
        let mut samples = vec![0.5, -0.25, 0.1];
        peak_normalize(&mut samples);
        assert!((samples[0] - 1.0).abs() < 1e-6);
        assert!((samples[1] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_peak_normalize_leaves_silence() {
        let mut samples = vec![0.0f32; 8];
        peak_normalize(&mut samples);
        assert!(samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_write_audio_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_audio(dir.path().join("x.flac"), &[0.0], 32_000, 1).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }
}
