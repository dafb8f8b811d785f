use serde::Serialize;

use crate::cache::MediaInput;
use crate::probe::MonoPairHint;

const WAVEFORM_SAMPLE_RATE: u32 = 8_000;

/// Compressor ahead of the resample, to lift low-amplitude detail for
/// visualization. Keep the curve in one place.
const WAVEFORM_COMPAND: &str =
    "compand=attacks=0.3:decays=0.8:points=-80/-80|-45/-15|-27/-9|0/-7:gain=5";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveformPayload {
    pub duration: f64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub has_audio: bool,
    pub samples_per_second: f64,
}

impl WaveformPayload {
    /// Record for assets with no audio streams: present but empty.
    pub fn silent(duration: f64) -> Self {
        Self {
            duration,
            samples: Vec::new(),
            sample_rate: 0,
            has_audio: false,
            samples_per_second: 0.0,
        }
    }
}

/// Decode path: optional mono-pair merge, compand, then 8 kHz mono f32le
/// raw PCM on stdout.
pub(super) fn build_waveform_args(
    input: &MediaInput,
    pair: Option<&MonoPairHint>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        input.as_arg(),
    ];
    match pair {
        Some(pair) => {
            args.push("-filter_complex".into());
            args.push(format!(
                "[0:a:{}][0:a:{}]amerge=inputs=2,{WAVEFORM_COMPAND}[aout]",
                pair.first, pair.second
            ));
            args.push("-map".into());
            args.push("[aout]".into());
        }
        None => {
            args.push("-map".into());
            args.push("0:a:0".into());
            args.push("-af".into());
            args.push(WAVEFORM_COMPAND.into());
        }
    }
    args.extend([
        "-ac".into(),
        "1".into(),
        "-ar".into(),
        WAVEFORM_SAMPLE_RATE.to_string(),
        "-c:a".into(),
        "pcm_f32le".into(),
        "-f".into(),
        "f32le".into(),
        "pipe:1".into(),
    ]);
    args
}

pub(super) fn payload_from_pcm(raw: &[u8], buckets: usize, duration: f64) -> WaveformPayload {
    let samples: Vec<f32> = raw
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    let samples = bucket_rms(&samples, buckets);
    let samples_per_second = if duration > 0.0 {
        buckets as f64 / duration
    } else {
        0.0
    };
    WaveformPayload {
        duration,
        samples,
        sample_rate: WAVEFORM_SAMPLE_RATE,
        has_audio: true,
        samples_per_second,
    }
}

/// Partition `samples` into `buckets` equal slices and compute each one's
/// RMS, clamped to [0, 1].
pub(super) fn bucket_rms(samples: &[f32], buckets: usize) -> Vec<f32> {
    if buckets == 0 {
        return Vec::new();
    }
    if samples.is_empty() {
        return vec![0.0; buckets];
    }
    let mut out = Vec::with_capacity(buckets);
    let per_bucket = samples.len() as f64 / buckets as f64;
    for bucket in 0..buckets {
        let start = (bucket as f64 * per_bucket) as usize;
        let end = (((bucket + 1) as f64 * per_bucket) as usize).min(samples.len());
        let slice = &samples[start..end.max(start + 1).min(samples.len())];
        let mean_square: f64 = slice
            .iter()
            .map(|sample| (*sample as f64) * (*sample as f64))
            .sum::<f64>()
            / slice.len().max(1) as f64;
        out.push((mean_square.sqrt() as f32).clamp(0.0, 1.0));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MonoPairHint;
    use std::path::PathBuf;

    fn pair() -> MonoPairHint {
        MonoPairHint {
            first: 0,
            second: 1,
            stream_indices: (1, 2),
            compatible: true,
            title: "L + R (Stereo)".into(),
            language: None,
        }
    }

    #[test]
    fn rms_of_constant_signal() {
        let samples = vec![0.5f32; 8000];
        let out = bucket_rms(&samples, 4);
        assert_eq!(out.len(), 4);
        for value in out {
            assert!((value - 0.5).abs() < 1e-4);
        }
    }

    #[test]
    fn rms_square_wave_is_full_scale() {
        let samples = vec![1.0f32, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        let out = bucket_rms(&samples, 2);
        assert_eq!(out, vec![1.0, 1.0]);
    }

    #[test]
    fn rms_clamps_hot_signals() {
        let samples = vec![4.0f32; 100];
        let out = bucket_rms(&samples, 1);
        assert_eq!(out, vec![1.0]);
    }

    #[test]
    fn empty_input_yields_zeroed_buckets() {
        assert_eq!(bucket_rms(&[], 3), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn pcm_decoding_little_endian() {
        let mut raw = Vec::new();
        for value in [0.25f32, -0.25, 0.25, -0.25] {
            raw.extend_from_slice(&value.to_le_bytes());
        }
        let payload = payload_from_pcm(&raw, 2, 10.0);
        assert!(payload.has_audio);
        assert_eq!(payload.sample_rate, 8000);
        assert_eq!(payload.samples.len(), 2);
        assert!((payload.samples[0] - 0.25).abs() < 1e-4);
        assert!((payload.samples_per_second - 0.2).abs() < 1e-9);
    }

    #[test]
    fn merged_pair_uses_filter_complex() {
        let args = build_waveform_args(
            &MediaInput::Local(PathBuf::from("/tmp/a.mov")),
            Some(&pair()),
        );
        let joined = args.join(" ");
        assert!(joined.contains("amerge=inputs=2"));
        assert!(joined.contains("compand="));
        assert!(joined.contains("-map [aout]"));
        assert!(joined.contains("-ar 8000"));
        assert!(joined.contains("-f f32le"));
        assert!(joined.ends_with("pipe:1"));
    }

    #[test]
    fn standard_path_maps_first_audio() {
        let args = build_waveform_args(&MediaInput::Remote("https://signed".into()), None);
        let joined = args.join(" ");
        assert!(joined.contains("-map 0:a:0"));
        assert!(joined.contains("-af compand="));
        assert!(!joined.contains("amerge"));
    }

    #[test]
    fn silent_payload_shape() {
        let payload = WaveformPayload::silent(20.0);
        assert!(!payload.has_audio);
        assert!(payload.samples.is_empty());
        assert_eq!(payload.sample_rate, 0);
    }
}
