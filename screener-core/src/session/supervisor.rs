use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::cache::MediaInput;
use crate::config::{EncoderPath, HlsSection, PathsSection, TranscoderSection};
use crate::probe::ProbeRecord;

use super::options::SessionOptions;
use super::readiness::{contiguous_segments, wait_for_segments};
use super::registry::{HlsSession, SessionRegistry};

pub type SessionResult<T> = Result<T, SessionError>;

/// Grace period between the quit request and the hard kill.
const GRACEFUL_WAIT: Duration = Duration::from_secs(2);
/// Post-kill reap window before the child is declared stuck.
const KILL_WAIT: Duration = Duration::from_secs(3);
/// Workdir removal is deferred so the child can release file handles.
const WORKDIR_REMOVAL_DELAY: Duration = Duration::from_secs(5);
/// Ceiling for one-shot fragment renders.
const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(120);

const TIMECODE_DRAWTEXT: &str = "drawtext=text='%{pts\\:hms}':fontcolor=white:fontsize=36:\
box=1:boxcolor=black@0.5:boxborderw=8:x=w-tw-24:y=h-th-24";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn transcoder: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("transcoder exited before readiness (status {status:?}): {stderr}")]
    StartupFailed {
        status: Option<i32>,
        stderr: String,
    },
    #[error("no session for key {0}")]
    NotFound(String),
    #[error("fragment render failed (status {status:?}): {stderr}")]
    FragmentFailed {
        status: Option<i32>,
        stderr: String,
    },
    #[error("workdir failure at {path}: {message}")]
    Workdir { path: PathBuf, message: String },
}

/// Owns the per-key transcoder child: launch, readiness, stderr drain,
/// abort with escalation, fragment one-shots. Registry installation and the
/// session cancellation scope both happen here.
pub struct TranscodeSupervisor {
    ffmpeg: PathBuf,
    encoder: EncoderPath,
    log_level: String,
    hls: HlsSection,
    live_root: PathBuf,
    registry: Arc<SessionRegistry>,
    start_lock: tokio::sync::Mutex<()>,
}

impl TranscodeSupervisor {
    pub fn new(
        transcoder: &TranscoderSection,
        hls: &HlsSection,
        paths: &PathsSection,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            ffmpeg: PathBuf::from(&transcoder.ffmpeg),
            encoder: transcoder.encoder,
            log_level: transcoder.log_level.clone(),
            hls: hls.clone(),
            live_root: Path::new(&paths.cache_dir).join("live-hls"),
            registry,
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn workdir_for(&self, key: &str) -> PathBuf {
        self.live_root.join(sanitize_key(key))
    }

    /// Ensure a live session for `key`, starting the transcoder if none is
    /// running. Returns once the readiness gate unlocks.
    pub async fn start(
        &self,
        key: &str,
        input: &MediaInput,
        probe: &ProbeRecord,
        options: SessionOptions,
        streaming_mode: bool,
    ) -> SessionResult<Arc<HlsSession>> {
        let _guard = self.start_lock.lock().await;

        if let Some(existing) = self.registry.get(key) {
            if existing.is_alive() || existing.transcode_complete() {
                return Ok(existing);
            }
            warn!(key = %key, "existing session is dead, restarting");
            self.registry.evict(key);
            existing.cancel.cancel();
        }

        let workdir = self.workdir_for(key);
        purge_and_create(&workdir)?;
        let expected = expected_segments(probe.duration_seconds, options.segment_duration);
        let args = build_transcode_args(
            input,
            probe,
            &options,
            self.encoder,
            &self.log_level,
            streaming_mode,
            &workdir,
        );
        debug!(key = %key, args = %args.join(" "), "launching transcoder");

        let mut command = Command::new(&self.ffmpeg);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("transcoder stderr not captured"))?;

        let session = Arc::new(HlsSession::new(
            key.to_string(),
            workdir.clone(),
            options,
            expected,
            child,
        ));
        self.registry.put(session.clone());
        spawn_supervisor_task(session.clone(), stderr);

        let ready = wait_for_segments(
            &workdir,
            self.hls.min_ready_segments,
            Duration::from_secs(self.hls.ready_timeout_seconds),
            expected,
        )
        .await;

        if let Some(status) = session.exit_status() {
            if !status.success() {
                self.registry.evict(key);
                session.cancel.cancel();
                let stderr_tail = session.stderr_tail();
                let _ = tokio::fs::remove_dir_all(&workdir).await;
                return Err(SessionError::StartupFailed {
                    status: status.code(),
                    stderr: stderr_tail,
                });
            }
        }
        info!(key = %key, ready_segments = ready, "session ready");
        Ok(session)
    }

    /// Quit the child for `key` and evict the session. Working-directory
    /// removal is deferred so readers and the child itself can let go of
    /// open handles; a child that survives the kill keeps its workdir until
    /// the next start purges it.
    pub async fn abort(&self, key: &str) -> bool {
        let Some(session) = self.registry.evict(key) else {
            return false;
        };
        info!(key = %key, "aborting session");
        self.shutdown_session(session).await;
        true
    }

    pub async fn abort_all(&self) -> usize {
        let sessions = self.registry.list();
        let mut aborted = 0usize;
        for session in sessions {
            self.registry.evict(&session.key);
            self.shutdown_session(session).await;
            aborted += 1;
        }
        aborted
    }

    async fn shutdown_session(&self, session: Arc<HlsSession>) {
        session.cancel.cancel();
        let child = {
            let mut guard = session.child.lock().expect("session child poisoned");
            guard.take()
        };
        let dead = match child {
            Some(mut child) => terminate_child(&mut child).await,
            None => true,
        };
        session
            .deletion_pending
            .store(true, std::sync::atomic::Ordering::Release);
        let workdir = session.workdir.clone();
        let key = session.key.clone();
        tokio::spawn(async move {
            sleep(WORKDIR_REMOVAL_DELAY).await;
            if !dead {
                warn!(key = %key, "transcoder still alive, keeping workdir");
                return;
            }
            if let Err(err) = tokio::fs::remove_dir_all(&workdir).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(key = %key, error = %err, "failed to remove workdir");
                }
            }
        });
    }

    /// One-shot MP4 fragment of `duration` seconds starting at `start`,
    /// with the same burned-in timecode (offset to the asset clock).
    pub async fn render_fragment(
        &self,
        input: &MediaInput,
        start: f64,
        duration: f64,
    ) -> SessionResult<Vec<u8>> {
        let args = build_fragment_args(input, start, duration, self.encoder);
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = timeout(FRAGMENT_TIMEOUT, command.output())
            .await
            .map_err(|_| SessionError::FragmentFailed {
                status: None,
                stderr: format!("fragment render timed out after {FRAGMENT_TIMEOUT:?}"),
            })??;
        if !output.status.success() {
            return Err(SessionError::FragmentFailed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .rev()
                    .take(10)
                    .collect::<Vec<_>>()
                    .join("\n"),
            });
        }
        Ok(output.stdout)
    }
}

/// Graceful quit (`q` over stdin), then SIGKILL after the grace period.
/// Returns whether the child is known dead.
async fn terminate_child(child: &mut Child) -> bool {
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(b"q").await;
        let _ = stdin.shutdown().await;
    }
    if timeout(GRACEFUL_WAIT, child.wait()).await.is_ok() {
        return true;
    }
    if child.start_kill().is_err() {
        // Already reaped.
        return true;
    }
    timeout(KILL_WAIT, child.wait()).await.is_ok()
}

/// Drain stderr (the child blocks if we do not), keep the failure tail,
/// surface per-segment markers, and log the exit. One task per session;
/// the session's cancellation token closes the whole scope.
fn spawn_supervisor_task(session: Arc<HlsSession>, stderr: ChildStderr) {
    let cancel = session.cancel.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => scan_stderr_line(&session, &line),
                    Ok(None) | Err(_) => break,
                }
            }
        }
        // stderr closed: the child is exiting. Reap and record.
        for _ in 0..50 {
            match session.exit_status() {
                Some(status) => {
                    let segments = contiguous_segments(&session.workdir);
                    if status.success() {
                        info!(
                            key = %session.key,
                            segments,
                            "transcode finished"
                        );
                    } else {
                        warn!(
                            key = %session.key,
                            status = status.code(),
                            segments,
                            "transcoder exited mid-run, existing segments stay servable"
                        );
                    }
                    return;
                }
                None => sleep(Duration::from_millis(100)).await,
            }
        }
    });
}

fn scan_stderr_line(session: &HlsSession, line: &str) {
    session.push_stderr_line(line.to_string());
    static MARKER: OnceLock<Regex> = OnceLock::new();
    let marker = MARKER.get_or_init(|| {
        Regex::new(r"Opening '([^']*(segment|thumb)(\d{3})\.(ts|jpg))'")
            .expect("segment marker regex")
    });
    if let Some(captures) = marker.captures(line) {
        debug!(
            key = %session.key,
            artifact = &captures[1],
            "transcoder opened output artifact"
        );
    }
}

/// Workdir name: any character outside `[A-Za-z0-9._-]` becomes `_`, runs
/// of `_` collapse.
pub fn sanitize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut last_underscore = false;
    for c in key.chars() {
        let mapped = if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') {
            c
        } else {
            '_'
        };
        if mapped == '_' {
            if last_underscore {
                continue;
            }
            last_underscore = true;
        } else {
            last_underscore = false;
        }
        out.push(mapped);
    }
    out
}

fn purge_and_create(workdir: &Path) -> SessionResult<()> {
    match std::fs::remove_dir_all(workdir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(SessionError::Workdir {
                path: workdir.to_path_buf(),
                message: err.to_string(),
            })
        }
    }
    std::fs::create_dir_all(workdir).map_err(|err| SessionError::Workdir {
        path: workdir.to_path_buf(),
        message: err.to_string(),
    })
}

pub(super) fn expected_segments(duration_seconds: f64, segment_duration: u32) -> Option<u32> {
    if duration_seconds <= 0.0 || segment_duration == 0 {
        return None;
    }
    Some((duration_seconds / segment_duration as f64).ceil().max(1.0) as u32)
}

/// Compose the long-running transcode invocation: one filter graph feeding
/// an HLS output (video + mapped audio) and a thumbnail output.
fn build_transcode_args(
    input: &MediaInput,
    probe: &ProbeRecord,
    options: &SessionOptions,
    encoder: EncoderPath,
    log_level: &str,
    streaming_mode: bool,
    workdir: &Path,
) -> Vec<String> {
    let seg = options.segment_duration;
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        log_level.into(),
        "-y".into(),
    ];
    if streaming_mode {
        // The local file is still growing: ignore input DTS, generate PTS,
        // normalize negatives. The output duration cap below keeps the
        // process from quitting at the current EOF.
        args.push("-fflags".into());
        args.push("+igndts+genpts".into());
        args.push("-avoid_negative_ts".into());
        args.push("make_zero".into());
    }
    args.push("-i".into());
    args.push(input.as_arg());

    let gonio = options.goniometer && probe.has_audio();
    let pair = probe.combinable_pair();

    let mut graph: Vec<String> = Vec::new();
    graph.push("[0:v:0]split=2[vmain][vthumb]".into());

    // Audio track 0 and the goniometer source.
    let mut audio_maps: Vec<String> = Vec::new();
    match (pair, gonio) {
        (Some(pair), true) => {
            graph.push(format!(
                "[0:a:{}][0:a:{}]amerge=inputs=2[amerged]",
                pair.first, pair.second
            ));
            graph.push("[amerged]asplit=2[atrack0][ascope]".into());
            audio_maps.push("[atrack0]".into());
        }
        (Some(pair), false) => {
            graph.push(format!(
                "[0:a:{}][0:a:{}]amerge=inputs=2[atrack0]",
                pair.first, pair.second
            ));
            audio_maps.push("[atrack0]".into());
        }
        (None, true) => {
            graph.push("[0:a:0]asplit=2[atrack0][ascope]".into());
            audio_maps.push("[atrack0]".into());
        }
        (None, false) => {
            if probe.has_audio() {
                audio_maps.push("0:a:0".into());
            }
        }
    }
    let remaining: Vec<usize> = match pair {
        Some(pair) => (0..probe.audio.len())
            .filter(|position| *position != pair.first && *position != pair.second)
            .collect(),
        None if probe.has_audio() => (1..probe.audio.len()).collect(),
        None => Vec::new(),
    };
    for position in &remaining {
        audio_maps.push(format!("0:a:{position}"));
    }

    let video_head = format!(
        "[vmain]setpts=PTS-STARTPTS,scale=1280:720,fps=25,format=yuv420p,{TIMECODE_DRAWTEXT}"
    );
    if gonio {
        graph.push(format!("{video_head}[vtc]"));
        graph.push("[ascope]avectorscope=s=300x300:r=25[scope]".into());
        graph.push("[vtc][scope]overlay=x=W-w-20:y=H-h-50[vout]".into());
    } else {
        graph.push(format!("{video_head}[vout]"));
    }

    let thumb_offset = seg as f64 / 2.0;
    graph.push(format!(
        "[vthumb]fps=1/{seg}:start_time={thumb_offset},scale=320:180[thumbs]"
    ));

    args.push("-filter_complex".into());
    args.push(graph.join(";"));

    // HLS output.
    args.push("-map".into());
    args.push("[vout]".into());
    for map in &audio_maps {
        args.push("-map".into());
        args.push(map.clone());
    }
    args.push("-c:v".into());
    args.push(encoder.video_codec().into());
    args.push("-profile:v".into());
    args.push("high".into());
    args.push("-level:v".into());
    args.push("4.0".into());
    args.push("-r".into());
    args.push("25".into());
    if encoder == EncoderPath::Software {
        args.push("-preset".into());
        args.push("veryfast".into());
        args.push("-sc_threshold".into());
        args.push("0".into());
    }
    args.push("-force_key_frames".into());
    args.push(format!("expr:gte(t,n_forced*{seg})"));
    if probe.has_audio() {
        args.push("-c:a".into());
        args.push("aac".into());
        args.push("-b:a".into());
        args.push("128k".into());
    }
    if let Some(pair) = pair {
        args.push("-metadata:s:a:0".into());
        args.push(format!("title={}", pair.title));
        if let Some(language) = &pair.language {
            args.push("-metadata:s:a:0".into());
            args.push(format!("language={language}"));
        }
    }
    if streaming_mode && probe.duration_seconds > 0.0 {
        args.push("-t".into());
        args.push(format!("{:.3}", probe.duration_seconds));
    }
    args.push("-f".into());
    args.push("hls".into());
    args.push("-hls_time".into());
    args.push(seg.to_string());
    args.push("-hls_playlist_type".into());
    args.push("event".into());
    args.push("-hls_flags".into());
    args.push("independent_segments+split_by_time".into());
    args.push("-hls_segment_filename".into());
    args.push(workdir.join("segment%03d.ts").to_string_lossy().to_string());
    args.push(workdir.join("playlist.m3u8").to_string_lossy().to_string());

    // Thumbnail output: one JPEG per segment, sampled at the midpoint.
    args.push("-map".into());
    args.push("[thumbs]".into());
    if let Some(expected) = expected_segments(probe.duration_seconds, seg) {
        args.push("-frames:v".into());
        args.push(expected.to_string());
    }
    args.push("-q:v".into());
    args.push("3".into());
    args.push("-start_number".into());
    args.push("0".into());
    args.push("-f".into());
    args.push("image2".into());
    args.push(workdir.join("thumb%03d.jpg").to_string_lossy().to_string());

    args
}

fn build_fragment_args(
    input: &MediaInput,
    start: f64,
    duration: f64,
    encoder: EncoderPath,
) -> Vec<String> {
    let timecode = format!(
        "drawtext=text='%{{pts\\:hms\\:{start:.3}}}':fontcolor=white:fontsize=36:\
box=1:boxcolor=black@0.5:boxborderw=8:x=w-tw-24:y=h-th-24"
    );
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-ss".into(),
        format!("{start:.3}"),
        "-t".into(),
        format!("{duration:.3}"),
        "-i".into(),
        input.as_arg(),
        "-vf".into(),
        format!("setpts=PTS-STARTPTS,scale=1280:720,fps=25,format=yuv420p,{timecode}"),
        "-c:v".into(),
        encoder.video_codec().into(),
    ];
    if encoder == EncoderPath::Software {
        args.push("-preset".into());
        args.push("veryfast".into());
    }
    args.extend([
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-movflags".into(),
        "frag_keyframe+empty_moov".into(),
        "-f".into(),
        "mp4".into(),
        "pipe:1".into(),
    ]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{AudioStreamInfo, MonoPairHint, VideoStreamInfo};

    fn audio_stream(index: usize, channels: u32) -> AudioStreamInfo {
        AudioStreamInfo {
            index,
            codec: "pcm_s24le".into(),
            sample_rate: 48_000,
            channels,
            channel_layout: if channels == 1 { "mono".into() } else { "stereo".into() },
            bitrate_bps: None,
            bits_per_sample: Some(24),
            language: None,
            title: None,
            duration_seconds: None,
        }
    }

    fn probe_with_audio(streams: Vec<AudioStreamInfo>, pair: Option<MonoPairHint>) -> ProbeRecord {
        ProbeRecord {
            duration_seconds: 35.0,
            total_bytes: 50_000_000,
            container: "mov,mp4".into(),
            container_bitrate_bps: None,
            video: Some(VideoStreamInfo {
                codec: "h264".into(),
                width: 1920,
                height: 1080,
                frame_rate: 25.0,
                bitrate_bps: None,
            }),
            audio: streams,
            mono_pair: pair,
        }
    }

    fn mono_pair() -> MonoPairHint {
        MonoPairHint {
            first: 0,
            second: 1,
            stream_indices: (1, 2),
            compatible: true,
            title: "Mix L + Mix R (Stereo)".into(),
            language: Some("eng".into()),
        }
    }

    #[test]
    fn sanitize_collapses_and_replaces() {
        assert_eq!(sanitize_key("masters/show 101.mxf"), "masters_show_101.mxf");
        assert_eq!(sanitize_key("a//b::c"), "a_b_c");
        assert_eq!(sanitize_key("clean-name_01.mp4"), "clean-name_01.mp4");
        assert_eq!(sanitize_key("ü#+x"), "_x");
    }

    #[test]
    fn expected_segment_counts() {
        assert_eq!(expected_segments(35.0, 10), Some(4));
        assert_eq!(expected_segments(20.0, 10), Some(2));
        assert_eq!(expected_segments(5.0, 10), Some(1));
        assert_eq!(expected_segments(0.0, 10), None);
    }

    #[test]
    fn stereo_asset_maps_single_track() {
        let probe = probe_with_audio(vec![audio_stream(1, 2)], None);
        let args = build_transcode_args(
            &MediaInput::Local(PathBuf::from("/tmp/a.mp4")),
            &probe,
            &SessionOptions::new(10),
            EncoderPath::Software,
            "info",
            false,
            Path::new("/work"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-map [vout] -map 0:a:0"));
        assert!(joined.contains("-f hls"));
        assert!(joined.contains("-hls_playlist_type event"));
        assert!(joined.contains("-hls_flags independent_segments+split_by_time"));
        assert!(joined.contains("force_key_frames expr:gte(t,n_forced*10)"));
        assert!(joined.contains("/work/segment%03d.ts"));
        assert!(joined.contains("/work/thumb%03d.jpg"));
        assert!(joined.contains("-frames:v 4"));
        assert!(!joined.contains("amerge"));
    }

    #[test]
    fn mono_pair_merges_then_maps_rest() {
        let probe = probe_with_audio(
            vec![
                audio_stream(1, 1),
                audio_stream(2, 1),
                audio_stream(3, 1),
                audio_stream(4, 1),
            ],
            Some(mono_pair()),
        );
        let args = build_transcode_args(
            &MediaInput::Local(PathBuf::from("/tmp/a.mov")),
            &probe,
            &SessionOptions::new(10),
            EncoderPath::Software,
            "info",
            false,
            Path::new("/work"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("[0:a:0][0:a:1]amerge=inputs=2[atrack0]"));
        assert!(joined.contains("-map [atrack0] -map 0:a:2 -map 0:a:3"));
        assert!(joined.contains("title=Mix L + Mix R (Stereo)"));
        assert!(joined.contains("language=eng"));
    }

    #[test]
    fn goniometer_overlays_scope() {
        let mut options = SessionOptions::new(10);
        options.goniometer = true;
        let probe = probe_with_audio(vec![audio_stream(1, 2)], None);
        let args = build_transcode_args(
            &MediaInput::Local(PathBuf::from("/tmp/a.mp4")),
            &probe,
            &options,
            EncoderPath::Software,
            "info",
            false,
            Path::new("/work"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("avectorscope=s=300x300"));
        assert!(joined.contains("overlay=x=W-w-20:y=H-h-50"));
        assert!(joined.contains("[0:a:0]asplit=2[atrack0][ascope]"));
        assert!(joined.contains("-map [atrack0]"));
    }

    #[test]
    fn goniometer_skipped_without_audio() {
        let mut options = SessionOptions::new(10);
        options.goniometer = true;
        let probe = probe_with_audio(vec![], None);
        let args = build_transcode_args(
            &MediaInput::Local(PathBuf::from("/tmp/video_only.mp4")),
            &probe,
            &options,
            EncoderPath::Software,
            "info",
            false,
            Path::new("/work"),
        );
        let joined = args.join(" ");
        assert!(!joined.contains("avectorscope"));
        assert!(!joined.contains("-c:a"));
        assert!(!joined.contains("-map 0:a"));
    }

    #[test]
    fn streaming_mode_sets_input_flags_and_duration_cap() {
        let probe = probe_with_audio(vec![audio_stream(1, 2)], None);
        let args = build_transcode_args(
            &MediaInput::Local(PathBuf::from("/tmp/a.mp4")),
            &probe,
            &SessionOptions::new(10),
            EncoderPath::Software,
            "info",
            true,
            Path::new("/work"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-fflags +igndts+genpts"));
        assert!(joined.contains("-avoid_negative_ts make_zero"));
        assert!(joined.contains("-t 35.000"));
    }

    #[test]
    fn timecode_burnin_present_in_both_paths() {
        let probe = probe_with_audio(vec![], None);
        let hls = build_transcode_args(
            &MediaInput::Local(PathBuf::from("/tmp/a.mp4")),
            &probe,
            &SessionOptions::new(10),
            EncoderPath::Software,
            "info",
            false,
            Path::new("/work"),
        );
        assert!(hls.join(" ").contains("drawtext=text='%{pts\\:hms}'"));

        let fragment = build_fragment_args(
            &MediaInput::Local(PathBuf::from("/tmp/a.mp4")),
            30.0,
            10.0,
            EncoderPath::Software,
        );
        let joined = fragment.join(" ");
        assert!(joined.contains("-ss 30.000"));
        assert!(joined.contains("-t 10.000"));
        assert!(joined.contains("pts\\:hms\\:30.000"));
        assert!(joined.contains("frag_keyframe+empty_moov"));
        assert!(joined.contains("pipe:1"));
    }

    #[test]
    fn hardware_encoder_swaps_codec_only() {
        let probe = probe_with_audio(vec![audio_stream(1, 2)], None);
        let args = build_transcode_args(
            &MediaInput::Local(PathBuf::from("/tmp/a.mp4")),
            &probe,
            &SessionOptions::new(10),
            EncoderPath::Videotoolbox,
            "info",
            false,
            Path::new("/work"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-c:v h264_videotoolbox"));
        // CPU filters stay in the graph: decode remains software.
        assert!(joined.contains("drawtext"));
        assert!(!joined.contains("-sc_threshold"));
    }
}
