use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScreenerConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub cache: CacheSection,
    pub hls: HlsSection,
    pub transcoder: TranscoderSection,
    pub object_store: ObjectStoreSection,
    pub http: HttpSection,
    pub logging: LoggingSection,
}

impl ScreenerConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.cache_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub cache_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// When false all media I/O goes through signed URLs; HLS and analyses
    /// still work, nothing is written under `cache_dir` except workdirs.
    pub enabled: bool,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HlsSection {
    pub segment_duration: u32,
    pub min_ready_segments: usize,
    pub ready_timeout_seconds: u64,
    pub session_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscoderSection {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub encoder: EncoderPath,
    pub log_level: String,
}

/// Encoder selection is a startup-time configuration, never a runtime
/// switch. Timecode burn-in keeps decode on the CPU regardless, since the
/// drawtext/overlay graph runs in software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderPath {
    Software,
    Videotoolbox,
    Vaapi,
}

impl EncoderPath {
    pub fn video_codec(&self) -> &'static str {
        match self {
            EncoderPath::Software => "libx264",
            EncoderPath::Videotoolbox => "h264_videotoolbox",
            EncoderPath::Vaapi => "h264_vaapi",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreSection {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    pub url_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    pub bind: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    pub debug: bool,
}

pub fn load_screener_config<P: AsRef<Path>>(path: P) -> Result<ScreenerConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/screener.toml");
        let config = load_screener_config(path).expect("fixture config should parse");
        assert_eq!(config.hls.segment_duration, 10);
        assert_eq!(config.transcoder.encoder, EncoderPath::Software);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_bytes, 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn encoder_path_maps_to_codec() {
        assert_eq!(EncoderPath::Software.video_codec(), "libx264");
        assert_eq!(EncoderPath::Vaapi.video_codec(), "h264_vaapi");
    }
}
