/// Result alias that carries the custom [`SoundstageError`] type.
pub type Result<T> = std::result::Result<T, SoundstageError>;

/// Common error type for the core crate.
///
/// Session-level operations (transport buttons, device switches, preset
/// rotation) never surface these to the caller; they log and degrade. The
/// primitives underneath them return this type so the sessions can decide.
#[derive(Debug, thiserror::Error)]
pub enum SoundstageError {
    /// Free-form failure reported by a backend.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration or preset catalog could not be parsed.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// Opening a capture stream failed (permission denied, device gone, ...).
    #[error("failed to open input stream on `{device}`: {reason}")]
    StreamOpen { device: String, reason: String },
    /// The file-decode primitive rejected an input.
    #[error("failed to decode `{name}`: {reason}")]
    Decode { name: String, reason: String },
    #[error("unknown preset `{0}`")]
    UnknownPreset(String),
    #[error("unknown input device `{0}`")]
    UnknownDevice(String),
    /// Connecting or disconnecting an audio-graph node failed.
    #[error("audio graph: {0}")]
    Graph(String),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("fft failure: {0}")]
    Fft(#[from] realfft::FftError),
    /// A shared lock was poisoned by a panicking holder.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
}

impl SoundstageError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn graph<T: Into<String>>(msg: T) -> Self {
        Self::Graph(msg.into())
    }
}

impl From<&str> for SoundstageError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for SoundstageError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
