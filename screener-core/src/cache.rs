use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use hex::encode as hex_encode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{CacheSection, PathsSection};
use crate::probe::ProbeRecord;
use crate::session::SessionRegistry;

pub type CacheResult<T> = Result<T, CacheError>;

/// Fixed safety buffer on top of `need_secs · bitrate` for decoder
/// lookahead. Mandated, do not tune per source.
const READAHEAD_FACTOR: f64 = 2.0;
/// Waiters re-check on every advance but give up on the progressive path
/// after this long and fall back to waiting for full completion.
const PROGRESSIVE_WAIT: Duration = Duration::from_secs(30);
/// A download making no progress for this long is failed.
const STALL_TIMEOUT: Duration = Duration::from_secs(300);
/// Byte-counter granularity for the "bytes advanced" signal.
const ADVANCE_GRANULARITY: u64 = 1024 * 1024;
/// Eviction drains to this fraction of the byte budget.
const EVICT_LOW_WATER: f64 = 0.8;
/// Consecutive disk failures before local caching is disabled for the
/// process; callers fall back to signed URLs.
const MAX_IO_FAILURES: u32 = 3;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("local cache disabled")]
    Disabled,
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("download stalled for {0:?} without progress")]
    Stalled(Duration),
    #[error("cache i/o failure at {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("download cancelled")]
    Cancelled,
}

impl CacheError {
    fn io(path: &Path, err: &std::io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Best available input for the probe, transcoder and analysis workers.
#[derive(Debug, Clone)]
pub enum MediaInput {
    Local(PathBuf),
    Remote(String),
}

impl MediaInput {
    pub fn as_arg(&self) -> String {
        match self {
            MediaInput::Local(path) => path.to_string_lossy().to_string(),
            MediaInput::Remote(url) => url.clone(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MediaInput::Local(_))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceProgress {
    pub bytes_have: u64,
    pub bytes_total: Option<u64>,
    pub complete: bool,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct DownloadState {
    bytes: u64,
    total: Option<u64>,
    finished: bool,
    failure: Option<CacheError>,
}

struct DownloadTask {
    rx: watch::Receiver<DownloadState>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

struct CacheEntry {
    path: PathBuf,
    total: Option<u64>,
    partial: bool,
    started_at: DateTime<Utc>,
    last_access: Instant,
}

struct Inner {
    root: PathBuf,
    enabled: AtomicBool,
    max_bytes: u64,
    http: reqwest::Client,
    registry: Arc<SessionRegistry>,
    entries: Mutex<HashMap<String, CacheEntry>>,
    downloads: Mutex<HashMap<String, Arc<DownloadTask>>>,
    io_failures: AtomicU32,
}

/// Per-key progressive download cache. One download task per key; waiters
/// block on a `watch` channel carrying the byte counter and re-evaluate
/// their readiness condition on every 1 MiB advance.
#[derive(Clone)]
pub struct SourceCache {
    inner: Arc<Inner>,
}

impl SourceCache {
    pub fn new(
        paths: &PathsSection,
        section: &CacheSection,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let root = PathBuf::from(&paths.cache_dir);
        if section.enabled {
            if let Err(err) = std::fs::create_dir_all(&root) {
                warn!(path = %root.display(), error = %err, "failed to create cache root");
            }
        }
        let cache = Self {
            inner: Arc::new(Inner {
                root,
                enabled: AtomicBool::new(section.enabled),
                max_bytes: section.max_bytes,
                http: reqwest::Client::new(),
                registry,
                entries: Mutex::new(HashMap::new()),
                downloads: Mutex::new(HashMap::new()),
                io_failures: AtomicU32::new(0),
            }),
        };
        if section.enabled {
            cache.bootstrap();
        }
        cache
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Local path for `key`: `cacheDir / sha256(key) + ext(key)`.
    pub fn local_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hex_encode(hasher.finalize());
        let name = match key_extension(key) {
            Some(ext) => format!("{digest}.{ext}"),
            None => digest,
        };
        self.inner.root.join(name)
    }

    /// Seed bookkeeping from files already on disk from a previous run. A
    /// `.partial` marker next to a file means the download never finished;
    /// those are dropped rather than trusted.
    fn bootstrap(&self) {
        let read_dir = match std::fs::read_dir(&self.inner.root) {
            Ok(read_dir) => read_dir,
            Err(_) => return,
        };
        let mut entries = self.inner.entries.lock().expect("cache entries poisoned");
        for dir_entry in read_dir.flatten() {
            let path = dir_entry.path();
            if !path.is_file() {
                continue;
            }
            let name = dir_entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".partial") {
                continue;
            }
            if marker_path(&path).exists() {
                debug!(path = %path.display(), "dropping unfinished download from previous run");
                let _ = std::fs::remove_file(marker_path(&path));
                let _ = std::fs::remove_file(&path);
                continue;
            }
            let Ok(metadata) = dir_entry.metadata() else {
                continue;
            };
            entries.insert(
                name,
                CacheEntry {
                    path,
                    total: Some(metadata.len()),
                    partial: false,
                    started_at: Utc::now(),
                    last_access: Instant::now(),
                },
            );
        }
        if !entries.is_empty() {
            info!(count = entries.len(), "seeded source cache from disk");
        }
    }

    /// Return a path holding at least enough bytes to decode `need_secs`
    /// from the start of the source, or the complete file when `need_secs`
    /// is `None`. Starts (or joins) the per-key download task as needed.
    ///
    /// `source_url` is a signed GET URL issued by the object-store client;
    /// `file://` URLs are honored for tests.
    pub async fn ensure(
        &self,
        key: &str,
        source_url: &str,
        need_secs: Option<f64>,
        probe: Option<&ProbeRecord>,
    ) -> CacheResult<PathBuf> {
        if !self.enabled() {
            return Err(CacheError::Disabled);
        }
        let path = self.local_path(key);

        if self.satisfied(&path, need_secs, probe) {
            return Ok(path);
        }

        let task = self.get_or_start_download(key, source_url, &path);
        let mut rx = task.rx.clone();
        let deadline = Instant::now() + PROGRESSIVE_WAIT;
        loop {
            {
                let state = rx.borrow();
                if let Some(failure) = &state.failure {
                    return Err(failure.clone());
                }
                if state.finished {
                    return Ok(path);
                }
            }
            if self.satisfied(&path, need_secs, probe) {
                return Ok(path);
            }
            let progressive = need_secs.is_some() && Instant::now() < deadline;
            if progressive {
                let remaining = deadline.saturating_duration_since(Instant::now());
                // Timeout here only ends the progressive phase; afterwards
                // the waiter blocks until full completion.
                let _ = tokio::time::timeout(remaining, rx.changed()).await;
            } else if rx.changed().await.is_err() {
                // Sender dropped without a terminal state.
                return Err(CacheError::Cancelled);
            }
        }
    }

    /// Download state for `key`.
    pub fn progress(&self, key: &str) -> SourceProgress {
        let downloads = self.inner.downloads.lock().expect("downloads poisoned");
        if let Some(task) = downloads.get(key) {
            let state = task.rx.borrow();
            return SourceProgress {
                bytes_have: state.bytes,
                bytes_total: state.total,
                complete: state.finished,
                started_at: Some(task.started_at),
            };
        }
        drop(downloads);
        let entries = self.inner.entries.lock().expect("cache entries poisoned");
        match entries.get(&entry_key(&self.local_path(key))) {
            Some(entry) => SourceProgress {
                bytes_have: entry
                    .path
                    .metadata()
                    .map(|metadata| metadata.len())
                    .unwrap_or(0),
                bytes_total: entry.total,
                complete: !entry.partial,
                started_at: Some(entry.started_at),
            },
            None => SourceProgress {
                bytes_have: 0,
                bytes_total: None,
                complete: false,
                started_at: None,
            },
        }
    }

    /// Cancel the download task for `key`, waking all waiters. The partial
    /// file stays on disk and the next `ensure` resumes it.
    pub fn abort_download(&self, key: &str) {
        let task = {
            let mut downloads = self.inner.downloads.lock().expect("downloads poisoned");
            downloads.remove(key)
        };
        if let Some(task) = task {
            info!(key = %key, "aborting download");
            task.cancel.cancel();
        }
    }

    pub fn abort_all_downloads(&self) -> usize {
        let tasks: Vec<Arc<DownloadTask>> = {
            let mut downloads = self.inner.downloads.lock().expect("downloads poisoned");
            downloads.drain().map(|(_, task)| task).collect()
        };
        for task in &tasks {
            task.cancel.cancel();
        }
        tasks.len()
    }

    pub fn has_local(&self, key: &str) -> bool {
        self.enabled() && self.local_path(key).exists()
    }

    pub fn is_partial(&self, key: &str) -> bool {
        let entries = self.inner.entries.lock().expect("cache entries poisoned");
        entries
            .get(&entry_key(&self.local_path(key)))
            .map(|entry| entry.partial)
            .unwrap_or(false)
    }

    /// Bring total cached bytes under the byte budget by deleting complete
    /// files in ascending last-access order. Files that are partial or back
    /// an active HLS session are never evicted.
    pub fn evict_lru(&self) -> u64 {
        let protected: Vec<PathBuf> = self
            .inner
            .registry
            .list()
            .iter()
            .map(|session| self.local_path(&session.key))
            .collect();
        let mut entries = self.inner.entries.lock().expect("cache entries poisoned");

        let mut total: u64 = entries
            .values()
            .map(|entry| entry.path.metadata().map(|m| m.len()).unwrap_or(0))
            .sum();
        if total <= self.inner.max_bytes {
            return 0;
        }
        let low_water = (self.inner.max_bytes as f64 * EVICT_LOW_WATER) as u64;

        let mut candidates: Vec<(String, Instant, u64)> = entries
            .iter()
            .filter(|(_, entry)| !entry.partial && !protected.contains(&entry.path))
            .map(|(name, entry)| {
                let size = entry.path.metadata().map(|m| m.len()).unwrap_or(0);
                (name.clone(), entry.last_access, size)
            })
            .collect();
        candidates.sort_by_key(|(_, last_access, _)| *last_access);

        let mut freed = 0u64;
        for (name, _, size) in candidates {
            if total <= low_water {
                break;
            }
            if let Some(entry) = entries.remove(&name) {
                if let Err(err) = std::fs::remove_file(&entry.path) {
                    warn!(path = %entry.path.display(), error = %err, "eviction failed");
                    entries.insert(name, entry);
                    continue;
                }
                debug!(path = %entry.path.display(), size, "evicted cache entry");
                total = total.saturating_sub(size);
                freed += size;
            }
        }
        freed
    }

    fn satisfied(
        &self,
        path: &Path,
        need_secs: Option<f64>,
        probe: Option<&ProbeRecord>,
    ) -> bool {
        let Ok(metadata) = path.metadata() else {
            return false;
        };
        let on_disk = metadata.len();
        let (partial, total) = {
            let mut entries = self.inner.entries.lock().expect("cache entries poisoned");
            match entries.get_mut(&entry_key(path)) {
                Some(entry) => {
                    entry.last_access = Instant::now();
                    (entry.partial, entry.total)
                }
                // File exists but is untracked (placed by an earlier run
                // after bootstrap); treat as complete.
                None => (false, Some(on_disk)),
            }
        };
        let Some(need) = need_secs else {
            return !partial;
        };
        if !partial {
            return true;
        }
        let bitrate = probe.map(|record| record.bitrate_bps()).unwrap_or(8_000_000);
        let total = total.or(probe.map(|record| record.total_bytes).filter(|t| *t > 0));
        on_disk >= required_bytes(need, bitrate, total)
    }

    fn get_or_start_download(&self, key: &str, source_url: &str, path: &Path) -> Arc<DownloadTask> {
        let mut downloads = self.inner.downloads.lock().expect("downloads poisoned");
        if let Some(task) = downloads.get(key) {
            return task.clone();
        }
        let started_at = Utc::now();
        let existing = path.metadata().map(|m| m.len()).unwrap_or(0);
        let (tx, rx) = watch::channel(DownloadState {
            bytes: existing,
            total: None,
            finished: false,
            failure: None,
        });
        let cancel = CancellationToken::new();
        let task = Arc::new(DownloadTask {
            rx,
            cancel: cancel.clone(),
            started_at,
        });
        downloads.insert(key.to_string(), task.clone());
        drop(downloads);

        if let Err(err) = std::fs::write(marker_path(path), b"") {
            warn!(path = %path.display(), error = %err, "failed to write partial marker");
        }
        {
            let mut entries = self.inner.entries.lock().expect("cache entries poisoned");
            entries.insert(
                entry_key(path),
                CacheEntry {
                    path: path.to_path_buf(),
                    total: None,
                    partial: true,
                    started_at,
                    last_access: Instant::now(),
                },
            );
        }

        let cache = self.clone();
        let key = key.to_string();
        let url = source_url.to_string();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            let result = cache.run_download(&url, &path, &tx, &cancel, existing).await;
            cache.finish_download(&key, &path, &tx, result);
        });
        task
    }

    fn finish_download(
        &self,
        key: &str,
        path: &Path,
        tx: &watch::Sender<DownloadState>,
        result: CacheResult<u64>,
    ) {
        {
            let mut downloads = self.inner.downloads.lock().expect("downloads poisoned");
            downloads.remove(key);
        }
        match result {
            Ok(bytes) => {
                {
                    let mut entries = self.inner.entries.lock().expect("cache entries poisoned");
                    if let Some(entry) = entries.get_mut(&entry_key(path)) {
                        entry.partial = false;
                        entry.total = Some(bytes);
                    }
                }
                let _ = std::fs::remove_file(marker_path(path));
                self.inner.io_failures.store(0, Ordering::Release);
                info!(key = %key, bytes, "download complete");
                tx.send_modify(|state| {
                    state.bytes = bytes;
                    state.total = Some(bytes);
                    state.finished = true;
                });
                self.evict_lru();
            }
            Err(CacheError::Cancelled) => {
                // Key switch or operator abort: keep the partial file so a
                // later ensure can resume it.
                debug!(key = %key, "download cancelled");
                tx.send_modify(|state| state.failure = Some(CacheError::Cancelled));
            }
            Err(err) => {
                warn!(key = %key, error = %err, "download failed, dropping partial file");
                if matches!(err, CacheError::Io { .. }) {
                    let failures = self.inner.io_failures.fetch_add(1, Ordering::AcqRel) + 1;
                    if failures >= MAX_IO_FAILURES && self.enabled() {
                        warn!(failures, "persistent disk failures, disabling local cache");
                        self.inner.enabled.store(false, Ordering::Release);
                    }
                }
                {
                    let mut entries = self.inner.entries.lock().expect("cache entries poisoned");
                    entries.remove(&entry_key(path));
                }
                let _ = std::fs::remove_file(path);
                let _ = std::fs::remove_file(marker_path(path));
                tx.send_modify(|state| state.failure = Some(err.clone()));
            }
        }
    }

    async fn run_download(
        &self,
        url: &str,
        path: &Path,
        tx: &watch::Sender<DownloadState>,
        cancel: &CancellationToken,
        resume_from: u64,
    ) -> CacheResult<u64> {
        if let Ok(parsed) = Url::parse(url) {
            if parsed.scheme() == "file" {
                let source = parsed
                    .to_file_path()
                    .map_err(|_| CacheError::SourceUnavailable("invalid file url".into()))?;
                return self.copy_local(&source, path, tx, cancel, resume_from).await;
            }
        }

        let mut request = self.inner.http.get(url);
        if resume_from > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={resume_from}-"));
        }
        let response = tokio::select! {
            result = request.send() => {
                result.map_err(|err| CacheError::SourceUnavailable(err.to_string()))?
            }
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
        };

        let status = response.status();
        let mut written = resume_from;
        let mut file = if status == reqwest::StatusCode::PARTIAL_CONTENT && resume_from > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(path)
                .await
                .map_err(|err| CacheError::io(path, &err))?
        } else if status.is_success() {
            written = 0;
            tokio::fs::File::create(path)
                .await
                .map_err(|err| CacheError::io(path, &err))?
        } else {
            return Err(CacheError::SourceUnavailable(format!(
                "unexpected status {status}"
            )));
        };

        let total = response.content_length().map(|length| written + length);
        tx.send_modify(|state| {
            state.total = total;
            state.bytes = written;
        });
        {
            let mut entries = self.inner.entries.lock().expect("cache entries poisoned");
            if let Some(entry) = entries.get_mut(&entry_key(path)) {
                entry.total = total;
            }
        }

        let mut stream = response.bytes_stream();
        let mut unsignalled = 0u64;
        loop {
            let next = tokio::select! {
                chunk = tokio::time::timeout(STALL_TIMEOUT, stream.next()) => match chunk {
                    Ok(value) => value,
                    Err(_) => return Err(CacheError::Stalled(STALL_TIMEOUT)),
                },
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            };
            let Some(chunk) = next else {
                break;
            };
            let data = chunk.map_err(|err| CacheError::SourceUnavailable(err.to_string()))?;
            file.write_all(&data)
                .await
                .map_err(|err| CacheError::io(path, &err))?;
            written += data.len() as u64;
            unsignalled += data.len() as u64;
            if unsignalled >= ADVANCE_GRANULARITY {
                unsignalled = 0;
                tx.send_modify(|state| state.bytes = written);
            }
        }
        file.flush()
            .await
            .map_err(|err| CacheError::io(path, &err))?;
        Ok(written)
    }

    /// `file://` sources: chunked copy so waiters still observe advances.
    async fn copy_local(
        &self,
        source: &Path,
        path: &Path,
        tx: &watch::Sender<DownloadState>,
        cancel: &CancellationToken,
        resume_from: u64,
    ) -> CacheResult<u64> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let mut input = tokio::fs::File::open(source)
            .await
            .map_err(|err| CacheError::SourceUnavailable(err.to_string()))?;
        let total = input
            .metadata()
            .await
            .map_err(|err| CacheError::SourceUnavailable(err.to_string()))?
            .len();
        let resume = resume_from.min(total);
        input
            .seek(std::io::SeekFrom::Start(resume))
            .await
            .map_err(|err| CacheError::SourceUnavailable(err.to_string()))?;

        let mut file = if resume > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(path)
                .await
                .map_err(|err| CacheError::io(path, &err))?
        } else {
            tokio::fs::File::create(path)
                .await
                .map_err(|err| CacheError::io(path, &err))?
        };

        tx.send_modify(|state| {
            state.total = Some(total);
            state.bytes = resume;
        });
        {
            let mut entries = self.inner.entries.lock().expect("cache entries poisoned");
            if let Some(entry) = entries.get_mut(&entry_key(path)) {
                entry.total = Some(total);
            }
        }

        let mut written = resume;
        let mut buffer = vec![0u8; ADVANCE_GRANULARITY as usize];
        loop {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            let read = input
                .read(&mut buffer)
                .await
                .map_err(|err| CacheError::SourceUnavailable(err.to_string()))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .await
                .map_err(|err| CacheError::io(path, &err))?;
            written += read as u64;
            tx.send_modify(|state| state.bytes = written);
        }
        file.flush()
            .await
            .map_err(|err| CacheError::io(path, &err))?;
        Ok(written)
    }
}

fn marker_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

fn entry_key(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn key_extension(key: &str) -> Option<String> {
    let name = key.rsplit('/').next().unwrap_or(key);
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn required_bytes(need_secs: f64, bitrate_bps: u64, total: Option<u64>) -> u64 {
    let need = (need_secs * bitrate_bps as f64 / 8.0 * READAHEAD_FACTOR) as u64;
    match total {
        Some(total) => need.min(total),
        None => need,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheSection, PathsSection};
    use tempfile::TempDir;

    fn test_cache(dir: &TempDir, max_bytes: u64) -> SourceCache {
        let paths = PathsSection {
            cache_dir: dir.path().to_string_lossy().to_string(),
        };
        let section = CacheSection {
            enabled: true,
            max_bytes,
        };
        SourceCache::new(&paths, &section, Arc::new(SessionRegistry::new()))
    }

    fn file_url(path: &Path) -> String {
        Url::from_file_path(path).unwrap().to_string()
    }

    #[test]
    fn local_path_uses_sha256_and_extension() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, u64::MAX);
        let path = cache.local_path("masters/show_101.mxf");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(".mxf"));
        assert_eq!(name.len(), 64 + 4);

        let bare = cache.local_path("no-extension-key");
        assert_eq!(bare.file_name().unwrap().to_string_lossy().len(), 64);
    }

    #[test]
    fn required_bytes_honors_buffer_and_total() {
        // 10 s at 8 Mbit/s with the 2.0 buffer = 20 MB.
        assert_eq!(required_bytes(10.0, 8_000_000, None), 20_000_000);
        // Clamped to the known object size.
        assert_eq!(required_bytes(10.0, 8_000_000, Some(5_000_000)), 5_000_000);
    }

    #[tokio::test]
    async fn ensure_downloads_file_url_to_completion() {
        let source_dir = TempDir::new().unwrap();
        let source = source_dir.path().join("asset.mp4");
        std::fs::write(&source, vec![7u8; 3 * 1024 * 1024]).unwrap();

        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, u64::MAX);
        let path = cache
            .ensure("masters/asset.mp4", &file_url(&source), None, None)
            .await
            .unwrap();
        assert_eq!(path.metadata().unwrap().len(), 3 * 1024 * 1024);
        assert!(!cache.is_partial("masters/asset.mp4"));

        let progress = cache.progress("masters/asset.mp4");
        assert!(progress.complete);
        assert_eq!(progress.bytes_have, 3 * 1024 * 1024);
    }

    #[tokio::test]
    async fn ensure_fails_for_missing_source() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, u64::MAX);
        let missing = dir.path().join("nope.mp4");
        let err = cache
            .ensure("missing.mp4", &file_url(&missing), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::SourceUnavailable(_)));
        // Failed downloads leave nothing behind.
        assert!(!cache.local_path("missing.mp4").exists());
    }

    #[tokio::test]
    async fn eviction_removes_least_recently_accessed_first() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, 100);

        for (key, age_rank) in [("a.ts", 3u64), ("b.ts", 2), ("c.ts", 1)] {
            let path = cache.local_path(key);
            std::fs::write(&path, vec![0u8; 60]).unwrap();
            let mut entries = cache.inner.entries.lock().unwrap();
            entries.insert(
                entry_key(&path),
                CacheEntry {
                    path: path.clone(),
                    total: Some(60),
                    partial: false,
                    started_at: Utc::now(),
                    last_access: Instant::now() - Duration::from_secs(age_rank * 100),
                },
            );
        }

        let freed = cache.evict_lru();
        // 180 bytes total, budget 100, low water 80: the two oldest go.
        assert_eq!(freed, 120);
        assert!(!cache.local_path("a.ts").exists());
        assert!(!cache.local_path("b.ts").exists());
        assert!(cache.local_path("c.ts").exists());
    }

    #[tokio::test]
    async fn eviction_skips_partial_entries() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, 50);

        let path = cache.local_path("growing.mp4");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        {
            let mut entries = cache.inner.entries.lock().unwrap();
            entries.insert(
                entry_key(&path),
                CacheEntry {
                    path: path.clone(),
                    total: Some(200),
                    partial: true,
                    started_at: Utc::now(),
                    last_access: Instant::now() - Duration::from_secs(1000),
                },
            );
        }
        assert_eq!(cache.evict_lru(), 0);
        assert!(path.exists());
    }

    #[test]
    fn key_extension_rejects_oddities() {
        assert_eq!(key_extension("a/b/c.MP4").as_deref(), Some("mp4"));
        assert_eq!(key_extension("clip.mxf").as_deref(), Some("mxf"));
        assert_eq!(key_extension("noext"), None);
        assert_eq!(key_extension("weird.ext-with-dash"), None);
        assert_eq!(key_extension("trailingdot."), None);
    }
}
