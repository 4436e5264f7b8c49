/// Audio preparation module
///
/// Decodes any supported media file into the format the speech backend
/// expects (16kHz, mono, PCM), normalizes loudness to a -20 dBFS target and
/// trims leading/trailing silence. Optimization failures fall back to the
/// plain decode; a job never fails for normalization alone.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Target sample rate for speech recognition (16kHz)
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Loudness target in dBFS
pub const TARGET_DBFS: f32 = -20.0;

/// Silence detection threshold in dBFS
pub const SILENCE_THRESHOLD_DBFS: f32 = -40.0;

/// Minimum run of silence eligible for trimming (seconds)
pub const MIN_SILENCE_SECONDS: f64 = 1.0;

/// Silence margin kept on each trimmed edge (seconds)
pub const KEEP_SILENCE_SECONDS: f64 = 0.5;

#[derive(Error, Debug)]
pub enum PrepareError {
    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("No decodable audio track: {0}")]
    NoAudioTrack(String),

    #[error("Failed to write prepared audio: {0}")]
    WriteFailed(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Prepared-audio facts handed to the chunker and the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDescriptor {
    /// Path of the prepared WAV file
    pub path: PathBuf,

    /// Duration in seconds
    pub duration_seconds: f64,

    /// Always 16000
    pub sample_rate: u32,

    /// Always 1
    pub channels: u16,
}

/// Coarse milestones reported while preparing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareMilestone {
    DecodeStarted,
    DecodeFinished,
    NormalizeFinished,
}

/// Decode, normalize and trim `input`, writing `prepared.wav` under
/// `out_dir`. The output file is owned by the caller; this module never
/// deletes it.
pub fn prepare(
    input: &Path,
    out_dir: &Path,
    cancel: &CancellationToken,
    sink: impl Fn(PrepareMilestone),
) -> Result<AudioDescriptor, PrepareError> {
    sink(PrepareMilestone::DecodeStarted);

    let samples = decode_to_mono_16k(input, cancel)?;
    sink(PrepareMilestone::DecodeFinished);

    if cancel.is_cancelled() {
        return Err(PrepareError::Cancelled);
    }

    let optimized = match optimize(&samples) {
        Ok(out) => out,
        Err(reason) => {
            warn!(
                "Audio optimization failed ({}), using plain decode: {}",
                reason,
                input.display()
            );
            samples
        }
    };
    sink(PrepareMilestone::NormalizeFinished);

    if cancel.is_cancelled() {
        return Err(PrepareError::Cancelled);
    }

    std::fs::create_dir_all(out_dir)
        .map_err(|e| PrepareError::WriteFailed(format!("create {}: {}", out_dir.display(), e)))?;
    let out_path = out_dir.join("prepared.wav");
    write_wav(&out_path, &optimized)?;

    let descriptor = AudioDescriptor {
        path: out_path,
        duration_seconds: optimized.len() as f64 / TARGET_SAMPLE_RATE as f64,
        sample_rate: TARGET_SAMPLE_RATE,
        channels: 1,
    };

    info!(
        "Prepared {}: {:.1}s of 16kHz mono audio",
        input.display(),
        descriptor.duration_seconds
    );

    Ok(descriptor)
}

/// Decode the default audio track to mono f32 at 16kHz.
///
/// Cancellation is polled roughly once per second of decoded audio.
fn decode_to_mono_16k(input: &Path, cancel: &CancellationToken) -> Result<Vec<f32>, PrepareError> {
    let file = File::open(input)
        .map_err(|e| PrepareError::DecodeFailed(format!("open {}: {}", input.display(), e)))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = input.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| PrepareError::DecodeFailed(e.to_string()))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
        .ok_or_else(|| PrepareError::NoAudioTrack(input.display().to_string()))?;

    let track_id = track.id;
    let source_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| PrepareError::DecodeFailed("source sample rate unknown".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| PrepareError::DecodeFailed(e.to_string()))?;

    let mut mono: Vec<f32> = Vec::new();
    let mut samples_since_poll: usize = 0;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            // End of stream surfaces as an I/O error in symphonia
            Err(SymphoniaError::IoError(_)) => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(PrepareError::DecodeFailed(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(audio_buf) => {
                let spec = *audio_buf.spec();
                let capacity = audio_buf.capacity() as u64;

                let mut sample_buf = SampleBuffer::<f32>::new(capacity, spec);
                sample_buf.copy_interleaved_ref(audio_buf);

                let channels = spec.channels.count().max(1);
                let interleaved = sample_buf.samples();

                if channels == 1 {
                    mono.extend_from_slice(interleaved);
                } else {
                    for frame in interleaved.chunks_exact(channels) {
                        mono.push(frame.iter().sum::<f32>() / channels as f32);
                    }
                }

                samples_since_poll += interleaved.len() / channels;
                if samples_since_poll >= source_rate as usize {
                    samples_since_poll = 0;
                    if cancel.is_cancelled() {
                        return Err(PrepareError::Cancelled);
                    }
                }
            }
            // Skip over corrupt frames, keep decoding
            Err(SymphoniaError::DecodeError(_)) | Err(SymphoniaError::IoError(_)) => continue,
            Err(e) => return Err(PrepareError::DecodeFailed(e.to_string())),
        }
    }

    if mono.is_empty() {
        return Err(PrepareError::NoAudioTrack(input.display().to_string()));
    }

    resample(&mono, source_rate, cancel)
}

/// Resample mono audio to the target rate using a sinc interpolator
fn resample(
    samples: &[f32],
    from_rate: u32,
    cancel: &CancellationToken,
) -> Result<Vec<f32>, PrepareError> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    if from_rate == TARGET_SAMPLE_RATE {
        return Ok(samples.to_vec());
    }

    debug!("Resampling: {} Hz -> {} Hz", from_rate, TARGET_SAMPLE_RATE);

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    const BLOCK_FRAMES: usize = 8192;

    let ratio = TARGET_SAMPLE_RATE as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, BLOCK_FRAMES, 1)
        .map_err(|e| PrepareError::DecodeFailed(format!("resampler init: {}", e)))?;

    let mut out = Vec::with_capacity((samples.len() as f64 * ratio) as usize + BLOCK_FRAMES);
    let blocks_per_second = (from_rate as usize / BLOCK_FRAMES).max(1);

    for (i, block) in samples.chunks(BLOCK_FRAMES).enumerate() {
        if i % blocks_per_second == 0 && cancel.is_cancelled() {
            return Err(PrepareError::Cancelled);
        }

        let input = vec![block.to_vec()];
        let waves = if block.len() == BLOCK_FRAMES {
            resampler.process(&input, None)
        } else {
            resampler.process_partial(Some(&input), None)
        }
        .map_err(|e| PrepareError::DecodeFailed(format!("resample: {}", e)))?;

        out.extend_from_slice(&waves[0]);
    }

    Ok(out)
}

/// Loudness-normalize and trim edge silence. Returns a reason string on
/// failure so the caller can fall back to the plain decode.
fn optimize(samples: &[f32]) -> Result<Vec<f32>, String> {
    let normalized = normalize_loudness(samples)?;
    Ok(trim_edge_silence(&normalized))
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

fn dbfs(level: f32) -> f32 {
    if level <= 0.0 {
        f32::NEG_INFINITY
    } else {
        20.0 * level.log10()
    }
}

/// Apply gain so overall RMS loudness hits the -20 dBFS target
fn normalize_loudness(samples: &[f32]) -> Result<Vec<f32>, String> {
    let current = dbfs(rms(samples));

    if !current.is_finite() {
        // Silent input, nothing to normalize
        debug!("Silent audio detected, skipping loudness normalization");
        return Ok(samples.to_vec());
    }

    let gain_db = TARGET_DBFS - current;
    let scale = 10.0f32.powf(gain_db / 20.0);

    if !scale.is_finite() || scale <= 0.0 {
        return Err(format!("bad gain scale {} (input {} dBFS)", scale, current));
    }

    debug!(
        "Loudness normalize: {:.1} dBFS -> {:.1} dBFS (gain {:+.1} dB)",
        current, TARGET_DBFS, gain_db
    );

    Ok(samples.iter().map(|&s| (s * scale).clamp(-1.0, 1.0)).collect())
}

/// Trim leading and trailing silence (threshold -40 dBFS, runs of at least
/// 1s), keeping a 500ms margin on each trimmed edge.
fn trim_edge_silence(samples: &[f32]) -> Vec<f32> {
    // 100ms analysis windows
    let window = TARGET_SAMPLE_RATE as usize / 10;
    if samples.len() < window * 2 {
        return samples.to_vec();
    }

    let min_silence_windows = (MIN_SILENCE_SECONDS * 10.0) as usize;
    let keep_samples = (KEEP_SILENCE_SECONDS * TARGET_SAMPLE_RATE as f64) as usize;

    let is_silent =
        |chunk: &[f32]| -> bool { dbfs(rms(chunk)) < SILENCE_THRESHOLD_DBFS };

    let mut leading_windows = 0;
    for chunk in samples.chunks(window) {
        if is_silent(chunk) {
            leading_windows += 1;
        } else {
            break;
        }
    }

    let mut trailing_windows = 0;
    for chunk in samples.rchunks(window) {
        if is_silent(chunk) {
            trailing_windows += 1;
        } else {
            break;
        }
    }

    let mut start = 0;
    if leading_windows >= min_silence_windows {
        start = (leading_windows * window).saturating_sub(keep_samples);
    }

    let mut end = samples.len();
    if trailing_windows >= min_silence_windows {
        end = (samples.len() - trailing_windows * window + keep_samples).min(samples.len());
    }

    if start >= end {
        // Entirely silent; keep the input untouched
        return samples.to_vec();
    }

    if start > 0 || end < samples.len() {
        debug!(
            "Trimmed edge silence: {} -> {} samples",
            samples.len(),
            end - start
        );
    }

    samples[start..end].to_vec()
}

/// Write mono 16kHz samples as 16-bit PCM WAV
fn write_wav(path: &Path, samples: &[f32]) -> Result<(), PrepareError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| PrepareError::WriteFailed(format!("{}: {}", path.display(), e)))?;

    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer
            .write_sample(v)
            .map_err(|e| PrepareError::WriteFailed(e.to_string()))?;
    }

    writer
        .finalize()
        .map_err(|e| PrepareError::WriteFailed(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tone(seconds: f64, amplitude: f32) -> Vec<f32> {
        let n = (TARGET_SAMPLE_RATE as f64 * seconds) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / TARGET_SAMPLE_RATE as f32;
                (2.0 * std::f32::consts::PI * 440.0 * t).sin() * amplitude
            })
            .collect()
    }

    #[test]
    fn test_normalize_hits_target() {
        let quiet = tone(1.0, 0.01);
        let normalized = normalize_loudness(&quiet).unwrap();

        let level = dbfs(rms(&normalized));
        assert_relative_eq!(level, TARGET_DBFS, epsilon = 0.5);
    }

    #[test]
    fn test_normalize_silent_input_unchanged() {
        let silent = vec![0.0f32; 16000];
        let normalized = normalize_loudness(&silent).unwrap();
        assert_eq!(normalized, silent);
    }

    #[test]
    fn test_normalize_never_clips() {
        let loud = tone(0.5, 0.9);
        let normalized = normalize_loudness(&loud).unwrap();
        assert!(normalized.iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }

    #[test]
    fn test_trim_leading_silence() {
        // 2s silence, then 1s tone
        let mut samples = vec![0.0f32; 2 * TARGET_SAMPLE_RATE as usize];
        samples.extend(tone(1.0, 0.5));

        let trimmed = trim_edge_silence(&samples);

        // Roughly 500ms of kept margin plus the 1s tone
        let expected = (1.5 * TARGET_SAMPLE_RATE as f64) as usize;
        let tolerance = (0.2 * TARGET_SAMPLE_RATE as f64) as usize;
        assert!(
            (trimmed.len() as i64 - expected as i64).unsigned_abs() as usize <= tolerance,
            "expected ~{} samples, got {}",
            expected,
            trimmed.len()
        );
    }

    #[test]
    fn test_short_silence_is_kept() {
        // 300ms silence is below the 1s minimum run, so nothing is trimmed
        let mut samples = vec![0.0f32; (0.3 * TARGET_SAMPLE_RATE as f64) as usize];
        samples.extend(tone(1.0, 0.5));

        let trimmed = trim_edge_silence(&samples);
        assert_eq!(trimmed.len(), samples.len());
    }

    #[test]
    fn test_entirely_silent_input_kept() {
        let silent = vec![0.0f32; 3 * TARGET_SAMPLE_RATE as usize];
        let trimmed = trim_edge_silence(&silent);
        assert_eq!(trimmed.len(), silent.len());
    }

    #[test]
    fn test_prepare_wav_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.wav");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&input, spec).unwrap();
        for s in tone(2.0, 0.5) {
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let out_dir = dir.path().join("job");
        let cancel = CancellationToken::new();
        let mut milestones = Vec::new();

        let descriptor = {
            let milestones = std::cell::RefCell::new(&mut milestones);
            prepare(&input, &out_dir, &cancel, |m| {
                milestones.borrow_mut().push(m);
            })
            .unwrap()
        };

        assert_eq!(descriptor.sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(descriptor.channels, 1);
        assert!(descriptor.path.exists());
        assert!((descriptor.duration_seconds - 2.0).abs() < 0.1);
        assert_eq!(
            milestones,
            vec![
                PrepareMilestone::DecodeStarted,
                PrepareMilestone::DecodeFinished,
                PrepareMilestone::NormalizeFinished,
            ]
        );
    }

    #[test]
    fn test_prepare_observes_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.wav");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&input, spec).unwrap();
        for i in 0..48000 * 3 {
            let t = i as f32 / 48000.0;
            let s = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5;
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = prepare(&input, &dir.path().join("job"), &cancel, |_| {});
        assert!(matches!(result, Err(PrepareError::Cancelled)));
    }
}
