use std::path::Path;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SHORT_ASSET_TIMEOUT: Duration = Duration::from_secs(10);

/// Readiness parameters after the short-asset shrink rule is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessSpec {
    pub min_segments: usize,
    pub timeout: Duration,
}

impl ReadinessSpec {
    /// Assets expected to produce two segments or fewer unlock with half
    /// the expected count and a tighter deadline.
    pub fn resolve(
        min_segments: usize,
        timeout: Duration,
        expected_total: Option<u32>,
    ) -> Self {
        match expected_total {
            Some(total) if total <= 2 => Self {
                min_segments: (total as usize).div_ceil(2).max(1),
                timeout: timeout.min(SHORT_ASSET_TIMEOUT),
            },
            _ => Self {
                min_segments: min_segments.max(1),
                timeout,
            },
        }
    }
}

/// Wait until `min_segments` contiguous `segment<NNN>.ts` files exist in
/// `workdir`, or all expected segments exist, or the deadline passes. Never
/// fails: on timeout the current contiguous count is returned and the
/// caller serves whatever playlist exists.
pub async fn wait_for_segments(
    workdir: &Path,
    min_segments: usize,
    timeout: Duration,
    expected_total: Option<u32>,
) -> usize {
    let spec = ReadinessSpec::resolve(min_segments, timeout, expected_total);
    let deadline = Instant::now() + spec.timeout;
    loop {
        let count = contiguous_segments(workdir);
        if count >= spec.min_segments {
            return count;
        }
        if let Some(expected) = expected_total {
            if count >= expected as usize {
                return count;
            }
        }
        if Instant::now() >= deadline {
            debug!(
                workdir = %workdir.display(),
                count,
                wanted = spec.min_segments,
                "readiness deadline passed, serving what exists"
            );
            return count;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Number of `segment000.ts, segment001.ts, …` files present with no gap.
pub fn contiguous_segments(workdir: &Path) -> usize {
    contiguous_files(workdir, "segment", "ts")
}

/// Same, for `thumb000.jpg, thumb001.jpg, …`.
pub fn contiguous_thumbs(workdir: &Path) -> usize {
    contiguous_files(workdir, "thumb", "jpg")
}

fn contiguous_files(workdir: &Path, prefix: &str, ext: &str) -> usize {
    let mut count = 0usize;
    loop {
        let candidate = workdir.join(format!("{prefix}{count:03}.{ext}"));
        if !candidate.is_file() {
            return count;
        }
        count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn shrink_rule_for_short_assets() {
        let spec = ReadinessSpec::resolve(2, Duration::from_secs(30), Some(1));
        assert_eq!(spec.min_segments, 1);
        assert_eq!(spec.timeout, Duration::from_secs(10));

        let spec = ReadinessSpec::resolve(2, Duration::from_secs(30), Some(2));
        assert_eq!(spec.min_segments, 1);

        let spec = ReadinessSpec::resolve(2, Duration::from_secs(30), Some(8));
        assert_eq!(spec.min_segments, 2);
        assert_eq!(spec.timeout, Duration::from_secs(30));
    }

    #[test]
    fn contiguous_count_stops_at_gap() {
        let dir = TempDir::new().unwrap();
        for index in [0usize, 1, 3] {
            std::fs::write(dir.path().join(format!("segment{index:03}.ts")), b"ts").unwrap();
        }
        assert_eq!(contiguous_segments(dir.path()), 2);
    }

    #[tokio::test]
    async fn unlocks_when_segments_appear() {
        let dir = TempDir::new().unwrap();
        let workdir = dir.path().to_path_buf();
        let writer = tokio::spawn(write_segments(workdir.clone()));
        let count =
            wait_for_segments(&workdir, 2, Duration::from_secs(5), None).await;
        assert!(count >= 2);
        writer.await.unwrap();
    }

    async fn write_segments(workdir: std::path::PathBuf) {
        for index in 0..2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(workdir.join(format!("segment{index:03}.ts")), b"ts").unwrap();
        }
    }

    #[tokio::test]
    async fn returns_on_timeout_with_partial_count() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("segment000.ts"), b"ts").unwrap();
        let count =
            wait_for_segments(dir.path(), 4, Duration::from_millis(250), None).await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn expected_total_satisfies_readiness() {
        let dir = TempDir::new().unwrap();
        for index in 0..3 {
            std::fs::write(dir.path().join(format!("segment{index:03}.ts")), b"ts").unwrap();
        }
        // All three expected segments exist even though min is higher.
        let count =
            wait_for_segments(dir.path(), 5, Duration::from_millis(250), Some(3)).await;
        assert_eq!(count, 3);
    }
}
