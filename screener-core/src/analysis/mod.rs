mod loudness;
mod waveform;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::cache::MediaInput;
use crate::config::TranscoderSection;
use crate::probe::ProbeRecord;

pub use loudness::LoudnessWindow;
pub use waveform::WaveformPayload;

pub type AnalysisResult<T> = Result<T, AnalysisError>;

const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(300);
const ANALYSIS_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("failed to spawn analyzer: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),
    #[error("analyzer exited with status {status:?}: {stderr}")]
    Failed {
        status: Option<i32>,
        stderr: String,
    },
    #[error("could not parse analyzer output: {0}")]
    Parse(String),
}

type WaveformKey = (String, usize, bool);
type LoudnessKey = (String, u64, u64);

/// One-shot waveform and loudness extraction against the best available
/// input, memoized per (key, kind, parameters). Entries are dropped when
/// the asset's session is evicted or after the TTL.
pub struct AnalysisWorkers {
    ffmpeg: PathBuf,
    waveforms: Mutex<HashMap<WaveformKey, (Instant, Arc<WaveformPayload>)>>,
    loudness: Mutex<HashMap<LoudnessKey, (Instant, Arc<LoudnessWindow>)>>,
}

impl AnalysisWorkers {
    pub fn new(transcoder: &TranscoderSection) -> Self {
        Self {
            ffmpeg: PathBuf::from(&transcoder.ffmpeg),
            waveforms: Mutex::new(HashMap::new()),
            loudness: Mutex::new(HashMap::new()),
        }
    }

    pub async fn waveform(
        &self,
        key: &str,
        input: &MediaInput,
        probe: &ProbeRecord,
        samples: usize,
    ) -> AnalysisResult<Arc<WaveformPayload>> {
        let samples = samples.clamp(1, 100_000);
        let combined = probe.combinable_pair().is_some();
        let cache_key = (key.to_string(), samples, combined);
        {
            let mut cache = self.waveforms.lock().expect("waveform cache poisoned");
            if let Some((at, payload)) = cache.get(&cache_key) {
                if at.elapsed() < ANALYSIS_TTL {
                    return Ok(payload.clone());
                }
                cache.remove(&cache_key);
            }
        }

        let payload = if probe.has_audio() {
            let args = waveform::build_waveform_args(input, probe.combinable_pair());
            let stdout = self.run(&args).await?;
            Arc::new(waveform::payload_from_pcm(
                &stdout,
                samples,
                probe.duration_seconds,
            ))
        } else {
            Arc::new(WaveformPayload::silent(probe.duration_seconds))
        };
        debug!(key = %key, samples, combined, "waveform computed");
        let mut cache = self.waveforms.lock().expect("waveform cache poisoned");
        cache.insert(cache_key, (Instant::now(), payload.clone()));
        Ok(payload)
    }

    pub async fn loudness(
        &self,
        key: &str,
        input: &MediaInput,
        probe: &ProbeRecord,
        start: f64,
        duration: f64,
    ) -> AnalysisResult<Arc<LoudnessWindow>> {
        let start = start.max(0.0);
        let duration = duration.max(0.1);
        let cache_key = (
            key.to_string(),
            (start * 1000.0) as u64,
            (duration * 1000.0) as u64,
        );
        {
            let mut cache = self.loudness.lock().expect("loudness cache poisoned");
            if let Some((at, window)) = cache.get(&cache_key) {
                if at.elapsed() < ANALYSIS_TTL {
                    return Ok(window.clone());
                }
                cache.remove(&cache_key);
            }
        }

        let args =
            loudness::build_loudness_args(input, probe.combinable_pair(), start, duration);
        let stderr = self.run_collect_stderr(&args).await?;
        let window = Arc::new(loudness::parse_summary(&stderr, start, duration)?);
        debug!(key = %key, start, duration, "loudness window computed");
        let mut cache = self.loudness.lock().expect("loudness cache poisoned");
        cache.insert(cache_key, (Instant::now(), window.clone()));
        Ok(window)
    }

    /// Drop every cached analysis for `key` (session evicted).
    pub fn forget(&self, key: &str) {
        let mut waveforms = self.waveforms.lock().expect("waveform cache poisoned");
        waveforms.retain(|entry, _| entry.0 != key);
        let mut loudness = self.loudness.lock().expect("loudness cache poisoned");
        loudness.retain(|entry, _| entry.0 != key);
    }

    /// Lazy TTL expiry, driven by the periodic sweeper.
    pub fn expire(&self) {
        let mut waveforms = self.waveforms.lock().expect("waveform cache poisoned");
        waveforms.retain(|_, (at, _)| at.elapsed() < ANALYSIS_TTL);
        let mut loudness = self.loudness.lock().expect("loudness cache poisoned");
        loudness.retain(|_, (at, _)| at.elapsed() < ANALYSIS_TTL);
    }

    async fn run(&self, args: &[String]) -> AnalysisResult<Vec<u8>> {
        let output = self.run_inner(args).await?;
        Ok(output.stdout)
    }

    async fn run_collect_stderr(&self, args: &[String]) -> AnalysisResult<String> {
        let output = self.run_inner(args).await?;
        Ok(String::from_utf8_lossy(&output.stderr).to_string())
    }

    async fn run_inner(&self, args: &[String]) -> AnalysisResult<std::process::Output> {
        let mut command = Command::new(&self.ffmpeg);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        let output = match timeout(ANALYSIS_TIMEOUT, command.output()).await {
            Ok(result) => result?,
            Err(_) => return Err(AnalysisError::Timeout(ANALYSIS_TIMEOUT)),
        };
        if !output.status.success() {
            return Err(AnalysisError::Failed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .rev()
                    .take(10)
                    .collect::<Vec<_>>()
                    .join("\n"),
            });
        }
        Ok(output)
    }
}
