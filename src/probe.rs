/// Media probe module
///
/// Inspects a media file without decoding it: container format, duration and
/// basic audio track parameters. Pure and idempotent; never reads the whole
/// file into memory.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::debug;

/// File extensions the pipeline accepts (video containers and audio formats)
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mkv", "mov", "wmv", "flv", "webm", "m4v"];
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "aac", "flac", "ogg", "wma"];

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Not a regular file: {0}")]
    NotAFile(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Probe unavailable: {0}")]
    ProbeUnavailable(String),
}

/// Basic facts about a media file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Detected format tag (lowercase extension, e.g. "mp4")
    pub format: String,

    /// Total duration in seconds
    pub duration_seconds: f64,

    /// Sample rate of the default audio track, when known
    pub sample_rate: Option<u32>,

    /// Channel count of the default audio track, when known
    pub channels: Option<usize>,
}

/// Whether the extension is on the accepted video/audio allowlist
pub fn is_supported_extension(path: &Path) -> bool {
    match extension_of(path) {
        Some(ext) => {
            VIDEO_EXTENSIONS.contains(&ext.as_str()) || AUDIO_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Inspect a media file: format tag, duration, track parameters.
///
/// Opens the container and reads only the headers; audio packets are not
/// decoded.
pub fn probe(path: &Path) -> Result<MediaInfo, ProbeError> {
    if !path.exists() {
        return Err(ProbeError::NotFound(path.display().to_string()));
    }

    if !path.is_file() {
        return Err(ProbeError::NotAFile(path.display().to_string()));
    }

    let format_tag = extension_of(path)
        .ok_or_else(|| ProbeError::UnsupportedFormat(path.display().to_string()))?;

    if !is_supported_extension(path) {
        return Err(ProbeError::UnsupportedFormat(format!(
            "{} ({})",
            path.display(),
            format_tag
        )));
    }

    let file = File::open(path)
        .map_err(|e| ProbeError::ProbeUnavailable(format!("open failed: {}", e)))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    hint.with_extension(&format_tag);

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| ProbeError::UnsupportedFormat(format!("{}: {}", path.display(), e)))?;

    let format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
        .ok_or_else(|| {
            ProbeError::ProbeUnavailable(format!("no decodable audio track: {}", path.display()))
        })?;

    let params = &track.codec_params;

    let duration_seconds = match (params.time_base, params.n_frames) {
        (Some(tb), Some(frames)) => {
            let time = tb.calc_time(frames);
            time.seconds as f64 + time.frac
        }
        _ => {
            return Err(ProbeError::ProbeUnavailable(format!(
                "duration unknown: {}",
                path.display()
            )))
        }
    };

    let info = MediaInfo {
        format: format_tag,
        duration_seconds,
        sample_rate: params.sample_rate,
        channels: params.channels.map(|c| c.count()),
    };

    debug!(
        "Probed {}: format={} duration={:.1}s",
        path.display(),
        info.format,
        info.duration_seconds
    );

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_test_wav(dir: &Path, name: &str, seconds: f64) -> PathBuf {
        let path = dir.join(name);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        let samples = (16000.0 * seconds) as usize;
        for i in 0..samples {
            let t = i as f32 / 16000.0;
            let v = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5;
            writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn test_probe_missing_file() {
        let result = probe(Path::new("/nonexistent/input.mp4"));
        assert!(matches!(result, Err(ProbeError::NotFound(_))));
    }

    #[test]
    fn test_probe_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::create_dir(&path).unwrap();

        let result = probe(&path);
        assert!(matches!(result, Err(ProbeError::NotAFile(_))));
    }

    #[test]
    fn test_probe_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();

        let result = probe(&path);
        assert!(matches!(result, Err(ProbeError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_probe_wav_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(dir.path(), "input.wav", 2.0);

        let info = probe(&path).unwrap();
        assert_eq!(info.format, "wav");
        assert!((info.duration_seconds - 2.0).abs() < 0.05);
        assert_eq!(info.sample_rate, Some(16000));
        assert_eq!(info.channels, Some(1));
    }

    #[test]
    fn test_probe_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(dir.path(), "input.wav", 1.0);

        let a = probe(&path).unwrap();
        let b = probe(&path).unwrap();
        assert_eq!(a.duration_seconds, b.duration_seconds);
        assert_eq!(a.format, b.format);
    }

    #[test]
    fn test_extension_allowlist() {
        assert!(is_supported_extension(Path::new("a.MP4")));
        assert!(is_supported_extension(Path::new("a.flac")));
        assert!(!is_supported_extension(Path::new("a.txt")));
        assert!(!is_supported_extension(Path::new("noext")));
    }
}
