//! Primitives the sessions are built on.
//!
//! Everything in here is implemented by a platform backend (or by
//! [`crate::headless`] for tests and the command line demo). The sessions only
//! ever talk to these traits.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Which kind of producer currently feeds the visualiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// A decoded file from the playlist.
    File,
    /// A live capture stream from an input device.
    LiveInput,
}

/// Identity of a producer node inside the shared audio context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Consumers a producer can be wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// The visualisation sink's single input slot.
    Visualizer,
    /// The audible speaker output.
    Output,
}

/// Anything that can hand out mono samples on demand.
pub trait SignalSource: Send + Sync {
    /// Fills `out` with the next block of samples and returns how many were
    /// written. Silence or an exhausted source writes fewer (or zero).
    fn fill(&self, out: &mut [f32]) -> usize;
}

/// Audio-graph element that emits a signal and can be wired to consumers.
pub trait ProducerNode: Send + Sync + fmt::Debug {
    fn id(&self) -> NodeId;

    fn kind(&self) -> SourceKind;

    fn connect(&self, destination: Destination) -> Result<()>;

    /// Drops every outgoing connection of the node. Calling this on a node
    /// that is not connected is allowed to fail; callers swallow the error.
    fn disconnect(&self) -> Result<()>;

    fn is_connected(&self, destination: Destination) -> bool;

    /// Reads the node's current signal for analysers such as the visualiser.
    fn pull(&self, out: &mut [f32]) -> usize;
}

pub type SharedProducer = Arc<dyn ProducerNode>;

/// Lifecycle of the shared audio-processing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

/// The single process-wide audio-processing context.
///
/// Every component that creates producers receives it explicitly.
#[async_trait]
pub trait AudioContext: Send + Sync {
    fn state(&self) -> ContextState;

    /// Resumes a suspended context. A running context resolves immediately.
    async fn resume(&self) -> Result<()>;

    /// Wraps a decoded file in a producer node.
    fn media_source(&self, audio: &dyn PlayableAudio) -> Result<SharedProducer>;

    /// Wraps a live capture stream in a producer node.
    fn stream_source(&self, stream: &dyn CaptureStream) -> Result<SharedProducer>;
}

/// Resumes `context` only if it is suspended.
pub async fn resume_if_suspended(context: &dyn AudioContext) -> Result<()> {
    if context.state() == ContextState::Suspended {
        context.resume().await?;
    }
    Ok(())
}

/// Invoked once when a playable handle reaches its natural end.
pub type EndedCallback = Box<dyn FnOnce() + Send>;

/// A decoded, playable audio resource.
pub trait PlayableAudio: Send {
    fn play(&mut self) -> Result<()>;

    fn pause(&mut self);

    /// Moves the playhead back to zero.
    fn rewind(&mut self);

    fn is_paused(&self) -> bool;

    /// Replaces the end-of-track callback. `None` clears it.
    fn set_on_ended(&mut self, callback: Option<EndedCallback>);

    /// Stops playback and releases the underlying decode handle. Must be
    /// idempotent.
    fn release(&mut self);

    fn signal(&self) -> Arc<dyn SignalSource>;
}

/// Raw file input handed to the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSource {
    pub name: String,
    pub path: PathBuf,
}

impl TrackSource {
    /// Builds a source named after the final path component.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { name, path }
    }
}

/// Decodes local files into playable handles. Content is not validated by the
/// sessions; success or failure here is final.
pub trait FileDecoder: Send + Sync {
    fn decode(&self, source: &TrackSource) -> Result<Box<dyn PlayableAudio>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
    VideoInput,
}

/// One entry of the device enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    /// Empty until the user has granted capture permission on most platforms.
    pub label: String,
    pub kind: DeviceKind,
}

impl DeviceInfo {
    /// Label to show in a selector, falling back to the id.
    pub fn display_label(&self) -> String {
        if self.label.is_empty() {
            format!("Input {}", self.device_id)
        } else {
            self.label.clone()
        }
    }
}

/// An open live capture stream.
pub trait CaptureStream: Send {
    fn device_id(&self) -> &str;

    /// Stops every underlying hardware track. Must be idempotent.
    fn stop(&mut self);

    fn is_live(&self) -> bool;

    fn signal(&self) -> Arc<dyn SignalSource>;
}

/// Device enumeration and stream opening.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Opens a capture stream on `device`, or on the backend's default device
    /// when `None`.
    async fn open_stream(&self, device: Option<String>) -> Result<Box<dyn CaptureStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_source_is_named_after_file() {
        let source = TrackSource::from_path("/music/album/01 - Intro.flac");
        assert_eq!(source.name, "01 - Intro.flac");
    }

    #[test]
    fn unlabeled_devices_fall_back_to_id() {
        let device = DeviceInfo {
            device_id: "abc".to_string(),
            label: String::new(),
            kind: DeviceKind::AudioInput,
        };
        assert_eq!(device.display_label(), "Input abc");
    }
}
