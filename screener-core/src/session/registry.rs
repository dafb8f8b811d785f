use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use super::options::SessionOptions;

/// Lines of transcoder stderr kept for failure reports.
const STDERR_TAIL_LINES: usize = 40;

/// One live transcode: working directory, child handle, cancellation scope
/// for the supervisor task. The session references the cached source file
/// by key only and must tolerate it being absent or partial.
pub struct HlsSession {
    pub key: String,
    pub workdir: PathBuf,
    pub options: SessionOptions,
    pub started_at: DateTime<Utc>,
    pub expected_segments: Option<u32>,
    pub(super) child: Mutex<Option<Child>>,
    pub(super) stderr_tail: Mutex<VecDeque<String>>,
    pub(super) deletion_pending: AtomicBool,
    pub(super) cancel: CancellationToken,
}

impl HlsSession {
    pub(super) fn new(
        key: String,
        workdir: PathBuf,
        options: SessionOptions,
        expected_segments: Option<u32>,
        child: Child,
    ) -> Self {
        Self {
            key,
            workdir,
            options,
            started_at: Utc::now(),
            expected_segments,
            child: Mutex::new(Some(child)),
            stderr_tail: Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
            deletion_pending: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Current playlist bytes location. Transcoders that rename atomically
    /// leave a `.tmp` alongside; prefer it when present.
    pub fn playlist_path(&self) -> PathBuf {
        let tmp = self.workdir.join("playlist.m3u8.tmp");
        if tmp.is_file() {
            tmp
        } else {
            self.workdir.join("playlist.m3u8")
        }
    }

    pub fn segment_path(&self, index: u32) -> PathBuf {
        self.workdir.join(format!("segment{index:03}.ts"))
    }

    pub fn thumb_path(&self, index: u32) -> PathBuf {
        self.workdir.join(format!("thumb{index:03}.jpg"))
    }

    /// Probe child liveness without blocking.
    pub fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().expect("session child poisoned");
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Exit status, if the child has terminated and is still owned here.
    pub fn exit_status(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.child.lock().expect("session child poisoned");
        guard.as_mut().and_then(|child| child.try_wait().ok().flatten())
    }

    /// True once the transcoder ran to normal completion; the artifacts on
    /// disk are final and the session stays servable.
    pub fn transcode_complete(&self) -> bool {
        self.exit_status().map(|status| status.success()).unwrap_or(false)
    }

    pub fn deletion_pending(&self) -> bool {
        self.deletion_pending.load(Ordering::Acquire)
    }

    pub(super) fn push_stderr_line(&self, line: String) {
        let mut tail = self.stderr_tail.lock().expect("stderr tail poisoned");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().expect("stderr tail poisoned");
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Authoritative map of key → live session. If a key is absent here, it has
/// no playable artifacts.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<HlsSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<HlsSession>> {
        let sessions = self.sessions.lock().expect("session registry poisoned");
        sessions.get(key).cloned()
    }

    pub fn put(&self, session: Arc<HlsSession>) {
        let mut sessions = self.sessions.lock().expect("session registry poisoned");
        sessions.insert(session.key.clone(), session);
    }

    pub fn evict(&self, key: &str) -> Option<Arc<HlsSession>> {
        let mut sessions = self.sessions.lock().expect("session registry poisoned");
        sessions.remove(key)
    }

    /// Snapshot of all sessions; safe to iterate while others mutate.
    pub fn list(&self) -> Vec<Arc<HlsSession>> {
        let sessions = self.sessions.lock().expect("session registry poisoned");
        sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.lock().expect("session registry poisoned");
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_session(key: &str) -> Arc<HlsSession> {
        // A session whose child exits immediately serves registry tests
        // without a real transcoder.
        let mut command = tokio::process::Command::new("true");
        let child = command.spawn().expect("spawn true");
        Arc::new(HlsSession::new(
            key.to_string(),
            PathBuf::from("/tmp/screener-test").join(key),
            SessionOptions::default(),
            None,
            child,
        ))
    }

    #[tokio::test]
    async fn registry_put_get_evict() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());
        registry.put(dummy_session("k1"));
        registry.put(dummy_session("k2"));
        assert_eq!(registry.len(), 2);
        assert!(registry.get("k1").is_some());
        assert!(registry.evict("k1").is_some());
        assert!(registry.get("k1").is_none());
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn stderr_tail_is_bounded() {
        let session = dummy_session("k");
        for index in 0..100 {
            session.push_stderr_line(format!("line {index}"));
        }
        let tail = session.stderr_tail();
        assert!(tail.starts_with("line 60"));
        assert!(tail.ends_with("line 99"));
    }

    #[tokio::test]
    async fn playlist_path_prefers_tmp() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut session = dummy_session("k");
        Arc::get_mut(&mut session).unwrap().workdir = dir.path().to_path_buf();
        assert_eq!(session.playlist_path(), dir.path().join("playlist.m3u8"));
        std::fs::write(dir.path().join("playlist.m3u8.tmp"), b"#EXTM3U").unwrap();
        assert_eq!(
            session.playlist_path(),
            dir.path().join("playlist.m3u8.tmp")
        );
    }
}
