use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::cache::MediaInput;
use crate::config::TranscoderSection;

pub type ProbeResult<T> = Result<T, ProbeError>;

const PROBE_TIMEOUT: Duration = Duration::from_secs(20);
const PROBE_TTL: Duration = Duration::from_secs(3600);
const FALLBACK_BITRATE_BPS: u64 = 8_000_000;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to spawn ffprobe: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),
    #[error("ffprobe exited with status {status:?}: {stderr}")]
    Failed {
        status: Option<i32>,
        stderr: String,
    },
    #[error("invalid ffprobe payload: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for ProbeError {
    fn from(source: serde_json::Error) -> Self {
        ProbeError::Parse(source.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStreamInfo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub bitrate_bps: Option<u64>,
}

impl VideoStreamInfo {
    /// Nearest-integer frame rate for callers that need one.
    pub fn frame_rate_rounded(&self) -> u32 {
        self.frame_rate.round().max(1.0) as u32
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStreamInfo {
    /// Original stream index as reported by the container.
    pub index: usize,
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub channel_layout: String,
    pub bitrate_bps: Option<u64>,
    pub bits_per_sample: Option<u32>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub duration_seconds: Option<f64>,
}

impl AudioStreamInfo {
    fn display_title(&self, audio_position: usize) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| format!("Audio {}", audio_position + 1))
    }
}

/// The first two single-channel audio streams of the asset, if present.
/// `first`/`second` are positions within [`ProbeRecord::audio`] (the values
/// the transcoder maps with); `stream_indices` keep the container's own
/// numbering for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonoPairHint {
    pub first: usize,
    pub second: usize,
    pub stream_indices: (usize, usize),
    pub compatible: bool,
    pub title: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRecord {
    pub duration_seconds: f64,
    pub total_bytes: u64,
    pub container: String,
    pub container_bitrate_bps: Option<u64>,
    pub video: Option<VideoStreamInfo>,
    pub audio: Vec<AudioStreamInfo>,
    pub mono_pair: Option<MonoPairHint>,
}

impl ProbeRecord {
    pub fn has_audio(&self) -> bool {
        !self.audio.is_empty()
    }

    /// True when the mono pair exists and is codec/sample-rate compatible,
    /// i.e. the transcoder may merge it into a stereo track.
    pub fn combinable_pair(&self) -> Option<&MonoPairHint> {
        self.mono_pair.as_ref().filter(|hint| hint.compatible)
    }

    /// Best-effort bitrate: container, then video stream, then size over
    /// duration, then a flat 8 Mbit/s.
    pub fn bitrate_bps(&self) -> u64 {
        if let Some(rate) = self.container_bitrate_bps {
            return rate;
        }
        if let Some(rate) = self.video.as_ref().and_then(|v| v.bitrate_bps) {
            return rate;
        }
        if self.duration_seconds > 0.0 && self.total_bytes > 0 {
            return ((self.total_bytes as f64) * 8.0 / self.duration_seconds) as u64;
        }
        FALLBACK_BITRATE_BPS
    }
}

/// ffprobe wrapper with per-key memoization.
pub struct Prober {
    ffprobe: PathBuf,
    cache: Mutex<HashMap<String, CachedProbe>>,
}

struct CachedProbe {
    at: Instant,
    record: Arc<ProbeRecord>,
}

impl Prober {
    pub fn new(transcoder: &TranscoderSection) -> Self {
        Self {
            ffprobe: PathBuf::from(&transcoder.ffprobe),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Probe the asset behind `input`, reusing a memoized record when one
    /// is younger than an hour.
    pub async fn probe(&self, key: &str, input: &MediaInput) -> ProbeResult<Arc<ProbeRecord>> {
        if let Some(record) = self.cached(key) {
            return Ok(record);
        }
        let output = self.run_ffprobe(input).await?;
        let record = Arc::new(record_from_output(output)?);
        debug!(
            key = %key,
            duration = record.duration_seconds,
            audio_streams = record.audio.len(),
            "probe complete"
        );
        let mut cache = self.cache.lock().expect("probe cache poisoned");
        cache.insert(
            key.to_string(),
            CachedProbe {
                at: Instant::now(),
                record: record.clone(),
            },
        );
        Ok(record)
    }

    pub fn cached(&self, key: &str) -> Option<Arc<ProbeRecord>> {
        let mut cache = self.cache.lock().expect("probe cache poisoned");
        match cache.get(key) {
            Some(entry) if entry.at.elapsed() < PROBE_TTL => Some(entry.record.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn forget(&self, key: &str) {
        let mut cache = self.cache.lock().expect("probe cache poisoned");
        cache.remove(key);
    }

    /// Drop records older than the TTL. Called by the periodic sweeper.
    pub fn expire(&self) {
        let mut cache = self.cache.lock().expect("probe cache poisoned");
        cache.retain(|_, entry| entry.at.elapsed() < PROBE_TTL);
    }

    async fn run_ffprobe(&self, input: &MediaInput) -> ProbeResult<FfprobeOutput> {
        let mut command = Command::new(&self.ffprobe);
        command
            .kill_on_drop(true)
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(input.as_arg());
        let output = match timeout(PROBE_TIMEOUT, command.output()).await {
            Ok(result) => result?,
            Err(_) => return Err(ProbeError::Timeout(PROBE_TIMEOUT)),
        };
        if !output.status.success() {
            return Err(ProbeError::Failed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

fn record_from_output(data: FfprobeOutput) -> ProbeResult<ProbeRecord> {
    let duration_seconds = data
        .format
        .duration
        .as_deref()
        .and_then(|value| value.parse::<f64>().ok())
        .unwrap_or_default();
    let total_bytes = data
        .format
        .size
        .as_deref()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or_default();
    let container_bitrate_bps = data
        .format
        .bit_rate
        .as_deref()
        .and_then(|value| value.parse::<u64>().ok());

    let video = data
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"))
        .map(|stream| VideoStreamInfo {
            codec: stream.codec_name.clone().unwrap_or_else(|| "unknown".into()),
            width: stream.width.unwrap_or(0),
            height: stream.height.unwrap_or(0),
            frame_rate: parse_rate(stream.avg_frame_rate.as_deref())
                .or_else(|| parse_rate(stream.r_frame_rate.as_deref()))
                .unwrap_or(25.0),
            bitrate_bps: stream.bit_rate.as_deref().and_then(|v| v.parse().ok()),
        });

    let audio: Vec<AudioStreamInfo> = data
        .streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("audio"))
        .map(|stream| {
            let channels = stream.channels.unwrap_or(0);
            AudioStreamInfo {
                index: stream.index.unwrap_or(0),
                codec: stream.codec_name.clone().unwrap_or_else(|| "unknown".into()),
                sample_rate: stream
                    .sample_rate
                    .as_deref()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                channels,
                channel_layout: stream
                    .channel_layout
                    .clone()
                    .unwrap_or_else(|| default_channel_layout(channels)),
                bitrate_bps: stream.bit_rate.as_deref().and_then(|v| v.parse().ok()),
                bits_per_sample: stream.bits_per_sample.filter(|bits| *bits > 0),
                language: stream.tags.as_ref().and_then(|t| t.language.clone()),
                title: stream.tags.as_ref().and_then(|t| t.title.clone()),
                duration_seconds: stream.duration.as_deref().and_then(|v| v.parse().ok()),
            }
        })
        .collect();

    let mono_pair = mono_pair_hint(&audio);

    Ok(ProbeRecord {
        duration_seconds,
        total_bytes,
        container: data
            .format
            .format_name
            .unwrap_or_else(|| "unknown".into()),
        container_bitrate_bps,
        video,
        audio,
        mono_pair,
    })
}

fn mono_pair_hint(audio: &[AudioStreamInfo]) -> Option<MonoPairHint> {
    let mut monos = audio
        .iter()
        .enumerate()
        .filter(|(_, stream)| stream.channels == 1);
    let (first, a) = monos.next()?;
    let (second, b) = monos.next()?;
    let compatible = a.codec == b.codec && a.sample_rate == b.sample_rate;
    let title = format!(
        "{} + {} (Stereo)",
        a.display_title(first),
        b.display_title(second)
    );
    let language = a.language.clone().or_else(|| b.language.clone());
    Some(MonoPairHint {
        first,
        second,
        stream_indices: (a.index, b.index),
        compatible,
        title,
        language,
    })
}

pub fn default_channel_layout(channels: u32) -> String {
    match channels {
        1 => "mono".into(),
        2 => "stereo".into(),
        3 => "2.1".into(),
        4 => "quad".into(),
        5 => "4.1".into(),
        6 => "5.1".into(),
        7 => "6.1".into(),
        8 => "7.1".into(),
        n => format!("{n} channels"),
    }
}

fn parse_rate(rate: Option<&str>) -> Option<f64> {
    let rate = rate?;
    if rate.contains('/') {
        let mut parts = rate.split('/');
        let numerator = parts.next()?.parse::<f64>().ok()?;
        let denominator = parts.next()?.parse::<f64>().ok()?;
        if denominator == 0.0 {
            return None;
        }
        Some(numerator / denominator)
    } else {
        rate.parse::<f64>().ok()
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    avg_frame_rate: Option<String>,
    #[serde(default)]
    r_frame_rate: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
    #[serde(default)]
    sample_rate: Option<String>,
    #[serde(default)]
    channels: Option<u32>,
    #[serde(default)]
    channel_layout: Option<String>,
    #[serde(default)]
    bits_per_sample: Option<u32>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    tags: Option<FfprobeTags>,
}

#[derive(Debug, Deserialize)]
struct FfprobeTags {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FfprobeFormat {
    #[serde(default)]
    format_name: Option<String>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_fixture(json: &str) -> ProbeRecord {
        let output: FfprobeOutput = serde_json::from_str(json).unwrap();
        record_from_output(output).unwrap()
    }

    #[test]
    fn rational_frame_rates() {
        assert_eq!(parse_rate(Some("25/1")), Some(25.0));
        assert_eq!(parse_rate(Some("30000/1001")).map(|v| v.round()), Some(30.0));
        assert_eq!(parse_rate(Some("0/0")), None);
        assert_eq!(parse_rate(None), None);
    }

    #[test]
    fn channel_layout_defaults() {
        assert_eq!(default_channel_layout(1), "mono");
        assert_eq!(default_channel_layout(2), "stereo");
        assert_eq!(default_channel_layout(6), "5.1");
        assert_eq!(default_channel_layout(8), "7.1");
        assert_eq!(default_channel_layout(12), "12 channels");
    }

    #[test]
    fn mono_pair_from_four_mono_tracks() {
        let record = parse_fixture(
            r#"{
                "streams": [
                    {"index": 0, "codec_type": "video", "codec_name": "h264",
                     "width": 1920, "height": 1080, "avg_frame_rate": "25/1"},
                    {"index": 1, "codec_type": "audio", "codec_name": "pcm_s24le",
                     "sample_rate": "48000", "channels": 1, "tags": {"title": "Mix L", "language": "eng"}},
                    {"index": 2, "codec_type": "audio", "codec_name": "pcm_s24le",
                     "sample_rate": "48000", "channels": 1, "tags": {"title": "Mix R"}},
                    {"index": 3, "codec_type": "audio", "codec_name": "pcm_s24le",
                     "sample_rate": "48000", "channels": 1},
                    {"index": 4, "codec_type": "audio", "codec_name": "pcm_s24le",
                     "sample_rate": "48000", "channels": 1}
                ],
                "format": {"format_name": "mov,mp4", "duration": "35.2", "size": "52428800"}
            }"#,
        );
        let hint = record.mono_pair.as_ref().expect("hint");
        assert_eq!(hint.first, 0);
        assert_eq!(hint.second, 1);
        assert_eq!(hint.stream_indices, (1, 2));
        assert!(hint.compatible);
        assert_eq!(hint.title, "Mix L + Mix R (Stereo)");
        assert_eq!(hint.language.as_deref(), Some("eng"));
        assert!(record.combinable_pair().is_some());
    }

    #[test]
    fn mono_pair_incompatible_when_rates_differ() {
        let record = parse_fixture(
            r#"{
                "streams": [
                    {"index": 0, "codec_type": "audio", "codec_name": "aac",
                     "sample_rate": "48000", "channels": 1},
                    {"index": 1, "codec_type": "audio", "codec_name": "aac",
                     "sample_rate": "44100", "channels": 1}
                ],
                "format": {}
            }"#,
        );
        let hint = record.mono_pair.as_ref().expect("hint");
        assert!(!hint.compatible);
        assert!(record.combinable_pair().is_none());
    }

    #[test]
    fn no_hint_for_stereo_only_assets() {
        let record = parse_fixture(
            r#"{
                "streams": [
                    {"index": 0, "codec_type": "audio", "codec_name": "aac",
                     "sample_rate": "48000", "channels": 2, "channel_layout": "stereo"}
                ],
                "format": {}
            }"#,
        );
        assert!(record.mono_pair.is_none());
        assert_eq!(record.audio[0].channel_layout, "stereo");
    }

    #[test]
    fn bitrate_fallback_chain() {
        let with_container = parse_fixture(
            r#"{"streams": [], "format": {"bit_rate": "5000000", "duration": "10", "size": "100"}}"#,
        );
        assert_eq!(with_container.bitrate_bps(), 5_000_000);

        let from_size = parse_fixture(
            r#"{"streams": [], "format": {"duration": "10", "size": "20000000"}}"#,
        );
        assert_eq!(from_size.bitrate_bps(), 16_000_000);

        let empty = parse_fixture(r#"{"streams": [], "format": {}}"#);
        assert_eq!(empty.bitrate_bps(), FALLBACK_BITRATE_BPS);
    }
}
