use std::time::Duration;

/// One still frame to pull from a video source.
///
/// `source` is an opaque locator (file path, URL, device) handed to the
/// producer untouched. Width and height are always non-zero once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRequest {
    source: String,
    width: u16,
    height: u16,
    offset: Duration,
}

impl FrameRequest {
    pub fn new(
        source: impl Into<String>,
        width: u16,
        height: u16,
        offset: Duration,
    ) -> Result<Self, RequestError> {
        if width == 0 || height == 0 {
            return Err(RequestError::ZeroDimension { width, height });
        }
        Ok(Self {
            source: source.into(),
            width,
            height,
            offset,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (u32::from(self.width), u32::from(self.height))
    }

    /// Seek position in the `HH:MM:SS` form the producer expects.
    pub fn seek_position(&self) -> String {
        format_offset(self.offset)
    }

    /// `W:H` argument for the scale filter.
    pub fn scale_filter(&self) -> String {
        format!("scale={}:{}", self.width, self.height)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("frame dimensions must be positive, got {width}x{height}")]
    ZeroDimension { width: u16, height: u16 },
}

/// Format an offset as zero-padded `HH:MM:SS`, rounded to the nearest second
/// (halves round up). Hours are not capped at two digits.
pub fn format_offset(offset: Duration) -> String {
    let total = (offset.as_nanos() + 500_000_000) / 1_000_000_000;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Parse an offset given in whole seconds.
///
/// Accepts the same range the HTTP layer always has (`u16`). Returns `None`
/// for anything else; callers treat that as "no offset".
pub fn parse_offset(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<u16>()
        .ok()
        .map(|secs| Duration::from_secs(u64::from(secs)))
}
