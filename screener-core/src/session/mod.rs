mod options;
mod readiness;
mod registry;
mod supervisor;

pub use options::SessionOptions;
pub use readiness::{contiguous_segments, contiguous_thumbs, wait_for_segments, ReadinessSpec};
pub use registry::{HlsSession, SessionRegistry};
pub use supervisor::{sanitize_key, SessionError, SessionResult, TranscodeSupervisor};
