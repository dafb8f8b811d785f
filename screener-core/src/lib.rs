pub mod analysis;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod probe;
pub mod service;
pub mod session;
pub mod store;

pub use analysis::{AnalysisError, AnalysisWorkers, LoudnessWindow, WaveformPayload};
pub use cache::{CacheError, MediaInput, SourceCache, SourceProgress};
pub use config::{load_screener_config, EncoderPath, ScreenerConfig};
pub use error::{ConfigError, Result};
pub use http::router;
pub use probe::{ProbeError, ProbeRecord, Prober};
pub use service::{ProgressReport, ReviewService, ServiceError, ServiceResult, ThumbnailEntry};
pub use session::{
    sanitize_key, HlsSession, SessionError, SessionOptions, SessionRegistry, TranscodeSupervisor,
};
pub use store::{ObjectHead, ObjectStore, StoreError};
