//! Core library for the Soundstage player and visualiser.
//!
//! Each module owns one part of the session: the audio primitives and the
//! shared graph, the playlist and live-input sessions that feed it, preset
//! rotation, and the render loop that drives the visualisation sink. The
//! [`player`] module ties them together behind a single event loop, and
//! [`headless`] supplies in-process backends so all of it runs without audio
//! hardware.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod graph;
pub mod headless;
pub mod input;
pub mod player;
pub mod playlist;
pub mod presets;
pub mod render;
pub mod rotator;
pub mod shuffle;
pub mod visual;

pub use analysis::{AnalysisFrame, SpectrumAnalyzer};
pub use audio::{SourceKind, TrackSource};
pub use config::{AppConfig, AudioConfig, PresetConfig, RenderConfig};
pub use error::{Result, SoundstageError};
pub use graph::{ActiveSource, AudioSourceGraph};
pub use input::{InputDeviceSession, SelectOutcome};
pub use player::{Player, PlayerCommand, PlayerEvent, PlayerHandle, PlayerSnapshot};
pub use playlist::{PlaybackState, PlaybackTicket, PlaylistSession};
pub use presets::{JsonPresetCatalog, PresetCatalog, PresetData};
pub use render::RenderLoop;
pub use rotator::PresetRotator;
pub use shuffle::ShuffleSequencer;
pub use visual::{SpectrumVisualizer, VisualizationSink};
