/// Options that travel from the request query string into one transcode
/// session. Fixed value type; widen deliberately, not ad hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// HLS target segment length in seconds; also the thumbnail cadence.
    pub segment_duration: u32,
    /// Overlay a 300×300 audio vectorscope bottom-right when audio exists.
    pub goniometer: bool,
    /// Reserved. Loudness is served as data by the analysis workers and is
    /// never burned into the picture.
    pub loudness_overlay: bool,
}

impl SessionOptions {
    pub fn new(segment_duration: u32) -> Self {
        Self {
            segment_duration: segment_duration.max(1),
            goniometer: false,
            loudness_overlay: false,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(10)
    }
}
