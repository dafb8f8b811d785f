use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analysis::{AnalysisError, AnalysisWorkers, LoudnessWindow, WaveformPayload};
use crate::cache::{CacheError, MediaInput, SourceCache, SourceProgress};
use crate::config::ScreenerConfig;
use crate::probe::{ProbeError, ProbeRecord, Prober};
use crate::session::{
    HlsSession, SessionError, SessionOptions, SessionRegistry, TranscodeSupervisor,
};
use crate::store::{ObjectStore, StoreError};

pub type ServiceResult<T> = Result<T, ServiceError>;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("playlist not available for {0}")]
    PlaylistUnavailable(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

/// The per-asset pipeline controller. Owns the singleton "currently
/// loaded" key; switching it tears down the previous key's session and
/// download. Everything the HTTP surface does goes through here.
pub struct ReviewService {
    config: ScreenerConfig,
    store: ObjectStore,
    registry: Arc<SessionRegistry>,
    cache: SourceCache,
    prober: Prober,
    supervisor: TranscodeSupervisor,
    analysis: AnalysisWorkers,
    loaded: Mutex<Option<String>>,
    errors: Mutex<HashMap<String, String>>,
}

impl ReviewService {
    pub async fn new(config: ScreenerConfig) -> Self {
        let store = ObjectStore::new(&config.object_store).await;
        let registry = Arc::new(SessionRegistry::new());
        let cache = SourceCache::new(&config.paths, &config.cache, registry.clone());
        let prober = Prober::new(&config.transcoder);
        let supervisor = TranscodeSupervisor::new(
            &config.transcoder,
            &config.hls,
            &config.paths,
            registry.clone(),
        );
        let analysis = AnalysisWorkers::new(&config.transcoder);
        Self {
            config,
            store,
            registry,
            cache,
            prober,
            supervisor,
            analysis,
            loaded: Mutex::new(None),
            errors: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ScreenerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn default_options(&self) -> SessionOptions {
        SessionOptions::new(self.config.hls.segment_duration)
    }

    /// Commit resources to `key`. A different previous key is fully torn
    /// down: its transcoder, its download task (the local file stays for
    /// cache reuse), its analysis entries. Loading the same key re-checks
    /// child liveness and clears a dead, unfinished session so the next
    /// playlist request restarts it.
    pub async fn load(&self, key: &str) -> ServiceResult<()> {
        let previous = {
            let mut loaded = self.loaded.lock().expect("loaded key poisoned");
            if loaded.as_deref() == Some(key) {
                None
            } else {
                loaded.replace(key.to_string())
            }
        };
        match previous {
            Some(previous) => {
                info!(from = %previous, to = %key, "switching loaded asset");
                self.supervisor.abort(&previous).await;
                self.cache.abort_download(&previous);
                self.analysis.forget(&previous);
                self.clear_error(&previous);
            }
            None => {
                if let Some(session) = self.registry.get(key) {
                    if !session.is_alive() && !session.transcode_complete() {
                        warn!(key = %key, "loaded session died, tearing down for restart");
                        self.supervisor.abort(key).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Probe record for `key`; the `info` endpoint's side effect of
    /// committing to the key happens in the caller via [`load`].
    pub async fn probe(&self, key: &str) -> ServiceResult<Arc<ProbeRecord>> {
        let input = self.probe_input(key).await?;
        Ok(self.prober.probe(key, &input).await?)
    }

    /// Current playlist bytes. Creates the session (download + transcode +
    /// readiness gate) when none exists.
    pub async fn playlist(&self, key: &str, options: SessionOptions) -> ServiceResult<Vec<u8>> {
        self.load(key).await?;
        let session = match self.ensure_session(key, options).await {
            Ok(session) => session,
            Err(err) => {
                self.record_error(key, &err);
                return Err(err);
            }
        };
        self.clear_error(key);
        let path = session.playlist_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ServiceError::PlaylistUnavailable(key.to_string()))
            }
            Err(err) => Err(ServiceError::Session(SessionError::Workdir {
                path,
                message: err.to_string(),
            })),
        }
    }

    /// Path of an existing segment file, for streaming.
    pub fn segment(&self, key: &str, index: u32) -> ServiceResult<std::path::PathBuf> {
        let session = self
            .registry
            .get(key)
            .ok_or_else(|| ServiceError::NotFound(format!("no session for {key}")))?;
        let path = session.segment_path(index);
        if path.is_file() {
            Ok(path)
        } else {
            Err(ServiceError::NotFound(format!("segment{index:03}.ts")))
        }
    }

    /// Path of an existing thumbnail file; callers fall back to the
    /// placeholder when this errs.
    pub fn thumbnail(&self, key: &str, index: u32) -> ServiceResult<std::path::PathBuf> {
        let session = self
            .registry
            .get(key)
            .ok_or_else(|| ServiceError::NotFound(format!("no session for {key}")))?;
        let path = session.thumb_path(index);
        if path.is_file() {
            Ok(path)
        } else {
            Err(ServiceError::NotFound(format!("thumb{index:03}.jpg")))
        }
    }

    /// Thumbnail inventory for `key`. A key with no session simply has no
    /// thumbnails yet; that is an empty listing, not an error.
    pub fn thumbnail_listing(&self, key: &str) -> ServiceResult<Vec<ThumbnailEntry>> {
        let Some(session) = self.registry.get(key) else {
            return Ok(Vec::new());
        };
        let seg = session.options.segment_duration as f64;
        let on_disk = crate::session::contiguous_thumbs(&session.workdir);
        let count = session
            .expected_segments
            .map(|expected| expected as usize)
            .unwrap_or(on_disk)
            .max(on_disk);
        let mut entries = Vec::with_capacity(count);
        for index in 0..count as u32 {
            let path = session.thumb_path(index);
            let data = std::fs::read(&path).ok().map(|bytes| {
                use base64::Engine;
                format!(
                    "data:image/jpeg;base64,{}",
                    base64::engine::general_purpose::STANDARD.encode(bytes)
                )
            });
            entries.push(ThumbnailEntry {
                segment_index: index,
                time: index as f64 * seg + seg / 2.0,
                source: if data.is_some() { "transcoder" } else { "pending" }.to_string(),
                data,
            });
        }
        Ok(entries)
    }

    pub async fn waveform(
        &self,
        key: &str,
        samples: usize,
    ) -> ServiceResult<Arc<WaveformPayload>> {
        let probe = self.probe(key).await?;
        let input = self.analysis_input(key).await?;
        Ok(self.analysis.waveform(key, &input, &probe, samples).await?)
    }

    pub async fn loudness(
        &self,
        key: &str,
        start: f64,
        duration: f64,
    ) -> ServiceResult<Arc<LoudnessWindow>> {
        let probe = self.probe(key).await?;
        if !probe.has_audio() {
            return Err(ServiceError::Analysis(AnalysisError::Failed {
                status: None,
                stderr: "asset has no audio streams".into(),
            }));
        }
        let input = self.analysis_input(key).await?;
        Ok(self
            .analysis
            .loudness(key, &input, &probe, start, duration)
            .await?)
    }

    /// One-shot MP4 fragment with burned-in timecode, for scrubbing.
    pub async fn stream_fragment(
        &self,
        key: &str,
        start: f64,
        duration: f64,
    ) -> ServiceResult<Vec<u8>> {
        let input = self.analysis_input(key).await?;
        Ok(self.supervisor.render_fragment(&input, start, duration).await?)
    }

    pub async fn abort(&self, key: &str) -> bool {
        let aborted = self.supervisor.abort(key).await;
        self.cache.abort_download(key);
        self.analysis.forget(key);
        aborted
    }

    pub async fn abort_all(&self) -> usize {
        let sessions = self.supervisor.abort_all().await;
        let downloads = self.cache.abort_all_downloads();
        {
            let mut loaded = self.loaded.lock().expect("loaded key poisoned");
            *loaded = None;
        }
        info!(sessions, downloads, "aborted all work");
        sessions + downloads
    }

    pub fn progress(&self, key: &str) -> ProgressReport {
        if let Some(message) = self.error_for(key) {
            return ProgressReport::error(message);
        }
        let source = self.cache.progress(key);
        let session = self.registry.get(key);
        ProgressReport::compose(
            &source,
            session.as_deref(),
            self.config.hls.min_ready_segments,
        )
    }

    /// One periodic task owns every TTL: probe records, analysis entries,
    /// and finished sessions past the reclaim window.
    pub fn spawn_ttl_sweeper(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let ttl = Duration::from_secs(service.config.hls.session_ttl_seconds);
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                service.prober.expire();
                service.analysis.expire();
                for session in service.registry.list() {
                    let age = chrono::Utc::now() - session.started_at;
                    let expired = age.to_std().map(|age| age > ttl).unwrap_or(false);
                    if expired && !session.is_alive() {
                        info!(key = %session.key, "reclaiming expired session");
                        service.registry.evict(&session.key);
                        service.analysis.forget(&session.key);
                        if let Err(err) = tokio::fs::remove_dir_all(&session.workdir).await {
                            if err.kind() != std::io::ErrorKind::NotFound {
                                warn!(
                                    key = %session.key,
                                    error = %err,
                                    "failed to reclaim workdir"
                                );
                            }
                        }
                    }
                }
            }
        });
    }

    async fn ensure_session(
        &self,
        key: &str,
        options: SessionOptions,
    ) -> ServiceResult<Arc<HlsSession>> {
        if let Some(session) = self.registry.get(key) {
            if session.is_alive() || session.transcode_complete() {
                return Ok(session);
            }
        }
        let probe = self.probe(key).await?;
        // Enough source bytes for the initial segments before launch; the
        // download keeps filling the file behind the transcoder.
        let need_secs =
            (self.config.hls.min_ready_segments as f64 + 1.0) * options.segment_duration as f64;
        let input = self.media_input(key, Some(need_secs), &probe).await?;
        let streaming_mode = input.is_local() && self.cache.is_partial(key);
        debug!(key = %key, streaming_mode, input = %input.as_arg(), "starting session");
        let session = self
            .supervisor
            .start(key, &input, &probe, options, streaming_mode)
            .await?;
        Ok(session)
    }

    /// Input for the probe: the local copy when one exists, else a signed
    /// URL.
    async fn probe_input(&self, key: &str) -> ServiceResult<MediaInput> {
        if self.cache.has_local(key) {
            return Ok(MediaInput::Local(self.cache.local_path(key)));
        }
        Ok(MediaInput::Remote(self.store.signed_url(key).await?))
    }

    /// Input for one-shot analyses and fragment renders: a complete local
    /// copy when available, the signed URL otherwise (a partial file would
    /// truncate the measurement).
    async fn analysis_input(&self, key: &str) -> ServiceResult<MediaInput> {
        if self.cache.has_local(key) && !self.cache.is_partial(key) {
            return Ok(MediaInput::Local(self.cache.local_path(key)));
        }
        Ok(MediaInput::Remote(self.store.signed_url(key).await?))
    }

    /// Input for the transcoder: the (possibly growing) local file when
    /// caching is on, the signed URL when it is off.
    async fn media_input(
        &self,
        key: &str,
        need_secs: Option<f64>,
        probe: &ProbeRecord,
    ) -> ServiceResult<MediaInput> {
        if !self.cache.enabled() {
            return Ok(MediaInput::Remote(self.store.signed_url(key).await?));
        }
        let url = self.store.signed_url(key).await?;
        match self.cache.ensure(key, &url, need_secs, Some(probe)).await {
            Ok(path) => Ok(MediaInput::Local(path)),
            Err(CacheError::Disabled) => Ok(MediaInput::Remote(url)),
            Err(err) => Err(err.into()),
        }
    }

    fn record_error(&self, key: &str, err: &ServiceError) {
        let mut errors = self.errors.lock().expect("error table poisoned");
        errors.insert(key.to_string(), err.to_string());
    }

    fn clear_error(&self, key: &str) {
        let mut errors = self.errors.lock().expect("error table poisoned");
        errors.remove(key);
    }

    fn error_for(&self, key: &str) -> Option<String> {
        let errors = self.errors.lock().expect("error table poisoned");
        errors.get(key).cloned()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailEntry {
    pub segment_index: u32,
    pub time: f64,
    pub data: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub status: String,
    pub message: String,
    pub download_progress: u8,
    pub processing_progress: u8,
    pub overall_progress: u8,
    pub estimated_time_remaining: Option<f64>,
    pub ready: bool,
}

impl ProgressReport {
    fn error(message: String) -> Self {
        Self {
            status: "error".into(),
            message,
            download_progress: 0,
            processing_progress: 0,
            overall_progress: 0,
            estimated_time_remaining: None,
            ready: false,
        }
    }

    fn compose(
        source: &SourceProgress,
        session: Option<&HlsSession>,
        min_ready_segments: usize,
    ) -> Self {
        let download_progress = if source.complete {
            100u8
        } else {
            match source.bytes_total {
                Some(total) if total > 0 => {
                    ((source.bytes_have as f64 / total as f64) * 100.0).min(99.0) as u8
                }
                _ => 0,
            }
        };

        let (processing_progress, segments_done, expected) = match session {
            Some(session) => {
                let done = crate::session::contiguous_segments(&session.workdir);
                match session.expected_segments {
                    Some(expected) if expected > 0 => (
                        ((done as f64 / expected as f64) * 100.0).min(100.0) as u8,
                        done,
                        Some(expected),
                    ),
                    _ => (0, done, None),
                }
            }
            None => (0, 0, None),
        };

        let ready = match session {
            Some(session) => {
                let needed = match session.expected_segments {
                    Some(expected) => (expected as usize).min(min_ready_segments.max(1)),
                    None => min_ready_segments.max(1),
                };
                segments_done >= needed || session.transcode_complete()
            }
            None => false,
        };

        let seg_secs = session
            .map(|session| session.options.segment_duration as f64)
            .unwrap_or(0.0);
        let (status, overall, estimate): (&str, u8, Option<f64>) = if ready {
            ("ready", 100, None)
        } else if let Some(session) = session {
            let remaining = expected
                .map(|expected| (expected as f64 - segments_done as f64).max(0.0) * seg_secs);
            if segments_done == 0 && session.is_alive() {
                ("starting", 50, remaining)
            } else {
                (
                    "processing",
                    (50.0 + processing_progress as f64 * 0.5).round() as u8,
                    remaining,
                )
            }
        } else if source.started_at.is_some() && !source.complete {
            let estimate = source.bytes_total.and_then(|total| {
                let elapsed = source
                    .started_at
                    .map(|at| (chrono::Utc::now() - at).num_milliseconds() as f64 / 1000.0)?;
                if elapsed <= 0.0 || source.bytes_have == 0 {
                    return None;
                }
                let rate = source.bytes_have as f64 / elapsed;
                Some((total.saturating_sub(source.bytes_have)) as f64 / rate)
            });
            (
                "downloading",
                (download_progress as f64 * 0.5).round() as u8,
                estimate,
            )
        } else if source.complete {
            ("downloaded", 50, None)
        } else {
            ("initializing", 0, None)
        };

        Self {
            status: status.to_string(),
            message: match status {
                "ready" => "stream ready".into(),
                "processing" | "starting" => format!(
                    "transcoded {segments_done}{} segments",
                    expected
                        .map(|expected| format!(" of {expected}"))
                        .unwrap_or_default()
                ),
                "downloading" => format!(
                    "fetched {} of {} bytes",
                    source.bytes_have,
                    source
                        .bytes_total
                        .map(|total| total.to_string())
                        .unwrap_or_else(|| "?".into())
                ),
                "downloaded" => "source cached, transcode not started".into(),
                _ => "no work in flight".into(),
            },
            download_progress,
            processing_progress,
            overall_progress: overall,
            estimated_time_remaining: estimate,
            ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(bytes: u64, total: Option<u64>, complete: bool) -> SourceProgress {
        SourceProgress {
            bytes_have: bytes,
            bytes_total: total,
            complete,
            started_at: Some(chrono::Utc::now()),
        }
    }

    #[test]
    fn progress_idle_is_initializing() {
        let report = ProgressReport::compose(
            &SourceProgress {
                bytes_have: 0,
                bytes_total: None,
                complete: false,
                started_at: None,
            },
            None,
            2,
        );
        assert_eq!(report.status, "initializing");
        assert_eq!(report.overall_progress, 0);
        assert!(!report.ready);
    }

    #[test]
    fn progress_downloading_halves_overall() {
        let report = ProgressReport::compose(&source(50, Some(100), false), None, 2);
        assert_eq!(report.status, "downloading");
        assert_eq!(report.download_progress, 50);
        assert_eq!(report.overall_progress, 25);
    }

    #[test]
    fn progress_downloaded_without_session() {
        let report = ProgressReport::compose(&source(100, Some(100), true), None, 2);
        assert_eq!(report.status, "downloaded");
        assert_eq!(report.overall_progress, 50);
    }

    #[test]
    fn progress_error_wins() {
        let report = ProgressReport::error("transcoder exploded".into());
        assert_eq!(report.status, "error");
        assert_eq!(report.message, "transcoder exploded");
        assert!(!report.ready);
    }
}
