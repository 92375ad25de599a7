//! Visualisation sink boundary and a headless spectrum visualiser.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::audio::{NodeId, SharedProducer};
use crate::config::AppConfig;
use crate::presets::PresetData;
use crate::{AnalysisFrame, Result, SoundstageError, SpectrumAnalyzer};

/// External rendering capability driven by a single audio producer.
pub trait VisualizationSink: Send {
    /// Points the sink's single input slot at `producer`, replacing whatever
    /// it read from before.
    fn connect_audio(&mut self, producer: SharedProducer);

    /// Empties the input slot.
    fn disconnect_audio(&mut self);

    fn connected(&self) -> Option<NodeId>;

    fn load_preset(&mut self, preset: &PresetData, transition_secs: f32);

    fn set_renderer_size(&mut self, width: u32, height: u32);

    /// Produces one frame. Called once per animation frame.
    fn render(&mut self) -> Result<()>;
}

pub type SharedSink = Arc<Mutex<dyn VisualizationSink>>;

/// Locks a shared sink, mapping poisoning to an error.
pub fn lock_sink(sink: &SharedSink) -> Result<MutexGuard<'_, dyn VisualizationSink + 'static>> {
    sink.lock()
        .map_err(|_| SoundstageError::Poisoned("visualisation sink"))
}

/// Values a frame hands to the drawing backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderParams {
    pub intensity: f32,
    pub motion: f32,
    pub bass: f32,
    pub treble: f32,
    pub beat: f32,
    pub hue: f32,
}

#[derive(Debug, Clone)]
struct Look {
    gain: f32,
    decay: f32,
    hue: f32,
}

impl Look {
    fn from_preset(preset: &PresetData) -> Self {
        Self {
            gain: preset.param("gain").unwrap_or(1.0),
            decay: preset.param("decay").unwrap_or(0.9).clamp(0.0, 0.999),
            hue: preset.param("hue").unwrap_or(0.0),
        }
    }

    fn blend(&self, to: &Look, t: f32) -> Look {
        let lerp = |a: f32, b: f32| a + (b - a) * t;
        Look {
            gain: lerp(self.gain, to.gain),
            decay: lerp(self.decay, to.decay),
            hue: lerp(self.hue, to.hue),
        }
    }
}

#[derive(Debug)]
struct Transition {
    from: Look,
    total_frames: u32,
    elapsed_frames: u32,
}

/// Sink that analyses whatever producer is connected and turns the spectrum
/// into [`RenderParams`] shaped by the active preset.
#[derive(Debug)]
pub struct SpectrumVisualizer {
    analyzer: SpectrumAnalyzer,
    block: Vec<f32>,
    fps: u32,
    width: u32,
    height: u32,
    input: Option<SharedProducer>,
    look: Look,
    transition: Option<Transition>,
    params: RenderParams,
    last_frame: AnalysisFrame,
    frames_rendered: u64,
    presets_loaded: u64,
}

impl SpectrumVisualizer {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            analyzer: SpectrumAnalyzer::new(config.audio.sample_rate),
            block: vec![0.0; config.audio.block_size.max(2)],
            fps: config.render.fps.max(1),
            width: config.render.width,
            height: config.render.height,
            input: None,
            look: Look {
                gain: 1.0,
                decay: 0.9,
                hue: 0.0,
            },
            transition: None,
            params: RenderParams::default(),
            last_frame: AnalysisFrame::default(),
            frames_rendered: 0,
            presets_loaded: 0,
        }
    }

    /// Wraps the visualiser so it can be shared with the sessions.
    pub fn shared(config: &AppConfig) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(config)))
    }

    pub fn params(&self) -> &RenderParams {
        &self.params
    }

    pub fn last_frame(&self) -> &AnalysisFrame {
        &self.last_frame
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn presets_loaded(&self) -> u64 {
        self.presets_loaded
    }

    pub fn renderer_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn in_transition(&self) -> bool {
        self.transition.is_some()
    }

    fn current_look(&mut self) -> Look {
        let Some(transition) = self.transition.as_mut() else {
            return self.look.clone();
        };
        transition.elapsed_frames += 1;
        if transition.elapsed_frames >= transition.total_frames {
            self.transition = None;
            return self.look.clone();
        }
        let t = transition.elapsed_frames as f32 / transition.total_frames as f32;
        transition.from.blend(&self.look, t)
    }
}

impl VisualizationSink for SpectrumVisualizer {
    fn connect_audio(&mut self, producer: SharedProducer) {
        tracing::debug!(node = %producer.id(), "visualiser input connected");
        self.input = Some(producer);
        self.analyzer.reset();
    }

    fn disconnect_audio(&mut self) {
        self.input = None;
    }

    fn connected(&self) -> Option<NodeId> {
        self.input.as_ref().map(|producer| producer.id())
    }

    fn load_preset(&mut self, preset: &PresetData, transition_secs: f32) {
        let next = Look::from_preset(preset);
        let total_frames = (transition_secs.max(0.0) * self.fps as f32).round() as u32;
        self.transition = (total_frames > 0).then(|| Transition {
            from: self.look.clone(),
            total_frames,
            elapsed_frames: 0,
        });
        self.look = next;
        self.presets_loaded += 1;
    }

    fn set_renderer_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    fn render(&mut self) -> Result<()> {
        // The input slot is read fresh on every frame.
        let written = match &self.input {
            Some(producer) => producer.pull(&mut self.block),
            None => 0,
        };
        let written = written.min(self.block.len());
        self.block[written..].fill(0.0);

        let frame = self.analyzer.analyse(&self.block)?;
        let look = self.current_look();
        let intensity = (frame.rms * look.gain).max(self.params.intensity * look.decay);

        self.params = RenderParams {
            intensity,
            motion: frame.spectral_centroid,
            bass: frame.low_band_energy,
            treble: frame.high_band_energy,
            beat: frame.beat_confidence,
            hue: look.hue,
        };
        self.last_frame = frame;
        self.frames_rendered += 1;
        Ok(())
    }
}
