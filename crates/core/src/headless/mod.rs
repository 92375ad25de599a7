//! In-process backends that need no audio hardware.
//!
//! The command line demo runs on these, and so do the tests. Playback time is
//! driven by the visualiser: every block a sink pulls from a track advances
//! its playhead by the same number of samples.

use std::collections::{HashMap, HashSet};
use std::f32::consts::PI;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::audio::{
    AudioContext, CaptureBackend, CaptureStream, ContextState, Destination, DeviceInfo,
    DeviceKind, EndedCallback, FileDecoder, NodeId, PlayableAudio, ProducerNode, SharedProducer,
    SignalSource, SourceKind, TrackSource,
};
use crate::{Result, SoundstageError};

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| SoundstageError::Poisoned(what))
}

/// Shared audio context that keeps track of every node it created.
#[derive(Debug)]
pub struct HeadlessContext {
    state: Mutex<ContextState>,
    next_id: AtomicU64,
    nodes: Mutex<Vec<Weak<HeadlessNode>>>,
    resumes: AtomicUsize,
    fail_resume: AtomicBool,
    fail_output: Arc<AtomicBool>,
}

impl HeadlessContext {
    /// Creates a context in the suspended state, like a browser context
    /// created before any user gesture.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ContextState::Suspended),
            next_id: AtomicU64::new(1),
            nodes: Mutex::new(Vec::new()),
            resumes: AtomicUsize::new(0),
            fail_resume: AtomicBool::new(false),
            fail_output: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of times the context actually went from suspended to running.
    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn suspend(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = ContextState::Suspended;
        }
    }

    pub fn set_fail_resume(&self, fail: bool) {
        self.fail_resume.store(fail, Ordering::SeqCst);
    }

    /// Makes every node refuse connections to the speakers, as when the
    /// output device has gone away.
    pub fn set_fail_output(&self, fail: bool) {
        self.fail_output.store(fail, Ordering::SeqCst);
    }

    /// Ids of live nodes that currently hold a connection to `destination`.
    pub fn connected_nodes(&self, destination: Destination) -> Vec<NodeId> {
        let Ok(nodes) = self.nodes.lock() else {
            return Vec::new();
        };
        nodes
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|node| node.is_connected(destination))
            .map(|node| node.id)
            .collect()
    }

    fn register(&self, kind: SourceKind, tap: Arc<dyn SignalSource>) -> Result<SharedProducer> {
        let node = Arc::new(HeadlessNode {
            id: NodeId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            kind,
            tap,
            connections: Mutex::new(HashSet::new()),
            fail_output: self.fail_output.clone(),
        });
        let mut nodes = lock(&self.nodes, "node registry")?;
        nodes.retain(|weak| weak.strong_count() > 0);
        nodes.push(Arc::downgrade(&node));
        Ok(node)
    }
}

impl Default for HeadlessContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioContext for HeadlessContext {
    fn state(&self) -> ContextState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ContextState::Closed)
    }

    async fn resume(&self) -> Result<()> {
        tokio::task::yield_now().await;
        if self.fail_resume.load(Ordering::SeqCst) {
            return Err(SoundstageError::msg("audio context refused to resume"));
        }
        let mut state = lock(&self.state, "context state")?;
        if *state == ContextState::Suspended {
            *state = ContextState::Running;
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn media_source(&self, audio: &dyn PlayableAudio) -> Result<SharedProducer> {
        self.register(SourceKind::File, audio.signal())
    }

    fn stream_source(&self, stream: &dyn CaptureStream) -> Result<SharedProducer> {
        self.register(SourceKind::LiveInput, stream.signal())
    }
}

/// Producer created by [`HeadlessContext`].
pub struct HeadlessNode {
    id: NodeId,
    kind: SourceKind,
    tap: Arc<dyn SignalSource>,
    connections: Mutex<HashSet<Destination>>,
    fail_output: Arc<AtomicBool>,
}

impl fmt::Debug for HeadlessNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadlessNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl ProducerNode for HeadlessNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn connect(&self, destination: Destination) -> Result<()> {
        if destination == Destination::Output && self.fail_output.load(Ordering::SeqCst) {
            return Err(SoundstageError::graph(format!("{} has no output device", self.id)));
        }
        lock(&self.connections, "node connections")?.insert(destination);
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let mut connections = lock(&self.connections, "node connections")?;
        if connections.is_empty() {
            return Err(SoundstageError::graph(format!("{} is not connected", self.id)));
        }
        connections.clear();
        Ok(())
    }

    fn is_connected(&self, destination: Destination) -> bool {
        self.connections
            .lock()
            .map(|connections| connections.contains(&destination))
            .unwrap_or(false)
    }

    fn pull(&self, out: &mut [f32]) -> usize {
        if !self.is_connected(Destination::Visualizer) {
            return 0;
        }
        self.tap.fill(out)
    }
}

struct ToneState {
    name: String,
    frequency: f32,
    sample_rate: u32,
    total_samples: u64,
    position: u64,
    paused: bool,
    released: bool,
    plays: usize,
    on_ended: Option<EndedCallback>,
}

/// Pull side of a [`ToneTrack`]; produces the sine while playing and fires
/// the end-of-track callback when the playhead reaches the end.
struct ToneSignal {
    state: Arc<Mutex<ToneState>>,
}

impl SignalSource for ToneSignal {
    fn fill(&self, out: &mut [f32]) -> usize {
        let (written, ended) = {
            let Ok(mut state) = self.state.lock() else {
                return 0;
            };
            if state.paused || state.released {
                return 0;
            }
            let remaining = state.total_samples.saturating_sub(state.position);
            let written = out.len().min(remaining as usize);
            let step = 2.0 * PI * state.frequency / state.sample_rate as f32;
            for (offset, sample) in out[..written].iter_mut().enumerate() {
                let n = (state.position + offset as u64) % u64::from(state.sample_rate);
                *sample = 0.5 * (step * n as f32).sin();
            }
            state.position += written as u64;
            let ended = if state.position >= state.total_samples {
                state.paused = true;
                state.on_ended.take()
            } else {
                None
            };
            (written, ended)
        };
        if let Some(callback) = ended {
            callback();
        }
        written
    }
}

/// Decoded "file" that plays a sine tone for a fixed duration.
pub struct ToneTrack {
    state: Arc<Mutex<ToneState>>,
}

impl PlayableAudio for ToneTrack {
    fn play(&mut self) -> Result<()> {
        let mut state = lock(&self.state, "tone track")?;
        if state.released {
            return Err(SoundstageError::Decode {
                name: state.name.clone(),
                reason: "decode handle already released".to_string(),
            });
        }
        if state.position >= state.total_samples {
            state.position = 0;
        }
        state.paused = false;
        state.plays += 1;
        Ok(())
    }

    fn pause(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.paused = true;
        }
    }

    fn rewind(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.position = 0;
        }
    }

    fn is_paused(&self) -> bool {
        self.state.lock().map(|state| state.paused).unwrap_or(true)
    }

    fn set_on_ended(&mut self, callback: Option<EndedCallback>) {
        if let Ok(mut state) = self.state.lock() {
            state.on_ended = callback;
        }
    }

    fn release(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.paused = true;
            state.released = true;
            state.on_ended = None;
        }
    }

    fn signal(&self) -> Arc<dyn SignalSource> {
        Arc::new(ToneSignal {
            state: self.state.clone(),
        })
    }
}

/// Observer and remote control for a decoded [`ToneTrack`].
#[derive(Clone)]
pub struct ToneHandle {
    state: Arc<Mutex<ToneState>>,
}

impl ToneHandle {
    pub fn name(&self) -> String {
        self.state
            .lock()
            .map(|state| state.name.clone())
            .unwrap_or_default()
    }

    pub fn is_playing(&self) -> bool {
        self.state
            .lock()
            .map(|state| !state.paused && !state.released)
            .unwrap_or(false)
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().map(|state| state.released).unwrap_or(true)
    }

    pub fn position(&self) -> u64 {
        self.state.lock().map(|state| state.position).unwrap_or(0)
    }

    pub fn play_count(&self) -> usize {
        self.state.lock().map(|state| state.plays).unwrap_or(0)
    }

    pub fn has_end_callback(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.on_ended.is_some())
            .unwrap_or(false)
    }

    /// Jumps the playhead forward as if `samples` had been played.
    pub fn advance(&self, samples: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.position = (state.position + samples).min(state.total_samples);
        }
    }

    /// Simulates the track reaching its natural end.
    pub fn finish(&self) {
        let callback = match self.state.lock() {
            Ok(mut state) if !state.paused && !state.released => {
                state.position = state.total_samples;
                state.paused = true;
                state.on_ended.take()
            }
            _ => None,
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl fmt::Debug for ToneHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToneHandle").field("name", &self.name()).finish()
    }
}

/// Decoder that turns every file into a [`ToneTrack`] without reading it.
#[derive(Debug)]
pub struct ToneDecoder {
    sample_rate: u32,
    track_secs: f32,
    rejected: Mutex<HashSet<String>>,
    decoded: Mutex<Vec<ToneHandle>>,
}

impl ToneDecoder {
    pub fn new(sample_rate: u32, track_secs: f32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            track_secs: track_secs.max(0.0),
            rejected: Mutex::new(HashSet::new()),
            decoded: Mutex::new(Vec::new()),
        }
    }

    /// Makes every later decode of `name` fail.
    pub fn reject(&self, name: impl Into<String>) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.insert(name.into());
        }
    }

    /// Handles of every track decoded so far, oldest first.
    pub fn handles(&self) -> Vec<ToneHandle> {
        self.decoded
            .lock()
            .map(|decoded| decoded.clone())
            .unwrap_or_default()
    }

    /// Most recently decoded track called `name`.
    pub fn handle(&self, name: &str) -> Option<ToneHandle> {
        self.handles()
            .into_iter()
            .rev()
            .find(|handle| handle.name() == name)
    }

    fn frequency_for(name: &str) -> f32 {
        let hash = name
            .bytes()
            .fold(0u32, |acc, byte| acc.wrapping_mul(31).wrapping_add(u32::from(byte)));
        110.0 * 2f32.powf((hash % 36) as f32 / 12.0)
    }
}

impl FileDecoder for ToneDecoder {
    fn decode(&self, source: &TrackSource) -> Result<Box<dyn PlayableAudio>> {
        if lock(&self.rejected, "decoder")?.contains(&source.name) {
            return Err(SoundstageError::Decode {
                name: source.name.clone(),
                reason: "unsupported format".to_string(),
            });
        }

        let state = Arc::new(Mutex::new(ToneState {
            name: source.name.clone(),
            frequency: Self::frequency_for(&source.name),
            sample_rate: self.sample_rate,
            total_samples: (self.track_secs * self.sample_rate as f32) as u64,
            position: 0,
            paused: true,
            released: false,
            plays: 0,
            on_ended: None,
        }));
        lock(&self.decoded, "decoder")?.push(ToneHandle {
            state: state.clone(),
        });
        Ok(Box::new(ToneTrack { state }))
    }
}

/// Low-level noise standing in for a microphone signal.
struct NoiseSignal {
    live: Arc<AtomicBool>,
    rng: Mutex<StdRng>,
}

impl SignalSource for NoiseSignal {
    fn fill(&self, out: &mut [f32]) -> usize {
        if !self.live.load(Ordering::SeqCst) {
            return 0;
        }
        let Ok(mut rng) = self.rng.lock() else {
            return 0;
        };
        for sample in out.iter_mut() {
            *sample = rng.gen_range(-0.2..0.2);
        }
        out.len()
    }
}

/// Capture stream opened by [`SimulatedCapture`]. Stops itself when dropped.
pub struct SimulatedStream {
    device_id: String,
    live: Arc<AtomicBool>,
    open_streams: Arc<AtomicUsize>,
    signal: Arc<NoiseSignal>,
}

impl CaptureStream for SimulatedStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn stop(&mut self) {
        if self.live.swap(false, Ordering::SeqCst) {
            self.open_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn signal(&self) -> Arc<dyn SignalSource> {
        self.signal.clone()
    }
}

impl Drop for SimulatedStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture backend with a fixed device list.
///
/// Labels are hidden until the first stream has been opened, the way a
/// browser withholds them before the user grants permission.
#[derive(Debug)]
pub struct SimulatedCapture {
    devices: Vec<DeviceInfo>,
    open_delays: Mutex<HashMap<String, Duration>>,
    permission_granted: AtomicBool,
    deny_permission: AtomicBool,
    open_streams: Arc<AtomicUsize>,
    opened_total: AtomicUsize,
}

impl SimulatedCapture {
    pub fn new<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self {
            devices: devices
                .into_iter()
                .map(|(id, label)| DeviceInfo {
                    device_id: id.into(),
                    label: label.into(),
                    kind: DeviceKind::AudioInput,
                })
                .collect(),
            open_delays: Mutex::new(HashMap::new()),
            permission_granted: AtomicBool::new(false),
            deny_permission: AtomicBool::new(false),
            open_streams: Arc::new(AtomicUsize::new(0)),
            opened_total: AtomicUsize::new(0),
        }
    }

    /// Makes opening `device` take `delay` before it resolves.
    pub fn set_open_delay(&self, device: impl Into<String>, delay: Duration) {
        if let Ok(mut delays) = self.open_delays.lock() {
            delays.insert(device.into(), delay);
        }
    }

    pub fn set_deny_permission(&self, deny: bool) {
        self.deny_permission.store(deny, Ordering::SeqCst);
    }

    /// Streams opened and not yet stopped.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn opened_total(&self) -> usize {
        self.opened_total.load(Ordering::SeqCst)
    }

    fn open_delay(&self, device: &str) -> Duration {
        self.open_delays
            .lock()
            .ok()
            .and_then(|delays| delays.get(device).copied())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CaptureBackend for SimulatedCapture {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        let granted = self.permission_granted.load(Ordering::SeqCst);
        Ok(self
            .devices
            .iter()
            .map(|device| DeviceInfo {
                label: if granted {
                    device.label.clone()
                } else {
                    String::new()
                },
                ..device.clone()
            })
            .collect())
    }

    async fn open_stream(&self, device: Option<String>) -> Result<Box<dyn CaptureStream>> {
        let device_id = match device {
            Some(id) => id,
            None => self
                .devices
                .first()
                .map(|device| device.device_id.clone())
                .ok_or_else(|| SoundstageError::StreamOpen {
                    device: "default".to_string(),
                    reason: "no capture devices available".to_string(),
                })?,
        };

        let delay = self.open_delay(&device_id);
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        if self.deny_permission.load(Ordering::SeqCst) {
            return Err(SoundstageError::StreamOpen {
                device: device_id,
                reason: "permission denied".to_string(),
            });
        }
        if !self.devices.iter().any(|d| d.device_id == device_id) {
            return Err(SoundstageError::UnknownDevice(device_id));
        }

        self.permission_granted.store(true, Ordering::SeqCst);
        self.opened_total.fetch_add(1, Ordering::SeqCst);
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let live = Arc::new(AtomicBool::new(true));
        let seed = self.opened_total.load(Ordering::SeqCst) as u64;
        Ok(Box::new(SimulatedStream {
            device_id,
            live: live.clone(),
            open_streams: self.open_streams.clone(),
            signal: Arc::new(NoiseSignal {
                live,
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_track_fires_end_callback_once() {
        let decoder = ToneDecoder::new(100, 1.0);
        let mut track = decoder.decode(&TrackSource::from_path("a.wav")).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        track.set_on_ended(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        track.play().unwrap();

        let signal = track.signal();
        let mut block = [0.0f32; 64];
        assert_eq!(signal.fill(&mut block), 64);
        assert_eq!(signal.fill(&mut block), 36);
        assert_eq!(signal.fill(&mut block), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(track.is_paused());
    }

    #[test]
    fn disconnecting_an_idle_node_errors() {
        let context = HeadlessContext::new();
        let decoder = ToneDecoder::new(100, 1.0);
        let track = decoder.decode(&TrackSource::from_path("a.wav")).unwrap();
        let node = context.media_source(track.as_ref()).unwrap();

        assert!(node.disconnect().is_err());
        node.connect(Destination::Visualizer).unwrap();
        assert_eq!(context.connected_nodes(Destination::Visualizer), vec![node.id()]);
        assert!(node.disconnect().is_ok());
        assert!(context.connected_nodes(Destination::Visualizer).is_empty());
    }

    #[tokio::test]
    async fn labels_appear_after_first_open() {
        let capture = SimulatedCapture::new([("mic", "Microphone")]);
        assert_eq!(capture.enumerate_devices().await.unwrap()[0].label, "");

        let mut stream = capture.open_stream(None).await.unwrap();
        assert_eq!(stream.device_id(), "mic");
        assert_eq!(capture.open_streams(), 1);
        assert_eq!(capture.enumerate_devices().await.unwrap()[0].label, "Microphone");

        stream.stop();
        stream.stop();
        assert_eq!(capture.open_streams(), 0);
    }

    #[tokio::test]
    async fn context_resumes_once() {
        let context = HeadlessContext::new();
        assert_eq!(context.state(), ContextState::Suspended);
        context.resume().await.unwrap();
        context.resume().await.unwrap();
        assert_eq!(context.state(), ContextState::Running);
        assert_eq!(context.resume_count(), 1);
    }
}
