//! The player event loop.
//!
//! A [`Player`] owns every session and processes one command or event at a
//! time, so the playlist, the live input and the preset rotator never see
//! interleaved state transitions. Observers read [`PlayerSnapshot`]s from a
//! `watch` channel; they never hold a second copy of session state.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::audio::{AudioContext, CaptureBackend, DeviceInfo, FileDecoder, SourceKind, TrackSource};
use crate::graph::ActiveSource;
use crate::headless::{HeadlessContext, SimulatedCapture, ToneDecoder};
use crate::input::{InputDeviceSession, SelectOutcome};
use crate::playlist::{PlaybackTicket, PlaylistSession};
use crate::presets::{JsonPresetCatalog, PresetCatalog};
use crate::render::RenderLoop;
use crate::rotator::PresetRotator;
use crate::visual::SharedSink;
use crate::{AppConfig, AudioSourceGraph, Result, SoundstageError, SpectrumVisualizer};

/// User actions accepted by the player.
#[derive(Debug)]
pub enum PlayerCommand {
    LoadPlaylist(Vec<TrackSource>),
    PlayTrack(usize),
    TogglePlay,
    Next,
    Prev,
    ToggleShuffle,
    /// Switch the live input; `None` picks the backend default.
    SelectDevice(Option<String>),
    CloseInput,
    ListDevices(oneshot::Sender<Vec<DeviceInfo>>),
    SelectPreset(String),
    RandomPreset,
    SetAutoRotation(bool),
    ToggleAutoRotation,
    Resize { width: u32, height: u32 },
    Shutdown,
}

/// Completions that arrive from outside the command stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    TrackEnded(PlaybackTicket),
    InputSelected(SelectOutcome),
    InputClosed,
}

/// Read-only view of the player, republished after every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub tracks: Vec<String>,
    pub current_index: Option<usize>,
    pub is_playing: bool,
    pub shuffle: bool,
    pub active_source: Option<ActiveSource>,
    pub input_device: Option<String>,
    pub preset: Option<String>,
    pub preset_index: Option<usize>,
    pub auto_rotation: bool,
}

impl PlayerSnapshot {
    pub fn current_track(&self) -> Option<&str> {
        self.current_index
            .and_then(|index| self.tracks.get(index))
            .map(String::as_str)
    }
}

/// External capabilities the player is wired to.
pub struct Backends {
    pub context: Arc<dyn AudioContext>,
    pub decoder: Arc<dyn FileDecoder>,
    pub capture: Arc<dyn CaptureBackend>,
    pub catalog: Arc<dyn PresetCatalog>,
    pub sink: SharedSink,
}

/// Concrete handles on the in-process backends behind
/// [`Player::headless`].
#[derive(Debug, Clone)]
pub struct HeadlessRig {
    pub context: Arc<HeadlessContext>,
    pub decoder: Arc<ToneDecoder>,
    pub capture: Arc<SimulatedCapture>,
    pub visualizer: Arc<Mutex<SpectrumVisualizer>>,
}

impl HeadlessRig {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            context: HeadlessContext::shared(),
            decoder: Arc::new(ToneDecoder::new(
                config.audio.sample_rate,
                config.demo.track_secs,
            )),
            capture: Arc::new(SimulatedCapture::new(
                config
                    .demo
                    .devices
                    .iter()
                    .map(|(id, label)| (id.clone(), label.clone())),
            )),
            visualizer: SpectrumVisualizer::shared(config),
        }
    }

    pub fn backends(&self, catalog: Arc<dyn PresetCatalog>) -> Backends {
        Backends {
            context: self.context.clone(),
            decoder: self.decoder.clone(),
            capture: self.capture.clone(),
            catalog,
            sink: self.visualizer.clone(),
        }
    }
}

/// Cloneable front end for a running [`Player`].
#[derive(Debug, Clone)]
pub struct PlayerHandle {
    commands: mpsc::UnboundedSender<PlayerCommand>,
    snapshots: watch::Receiver<PlayerSnapshot>,
}

impl PlayerHandle {
    pub fn send(&self, command: PlayerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SoundstageError::msg("player has shut down"))
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerSnapshot> {
        self.snapshots.clone()
    }

    /// Waits for the first snapshot that satisfies `predicate`.
    pub async fn wait_for<F>(&mut self, predicate: F) -> Result<PlayerSnapshot>
    where
        F: FnMut(&PlayerSnapshot) -> bool,
    {
        self.snapshots
            .wait_for(predicate)
            .await
            .map(|snapshot| snapshot.clone())
            .map_err(|_| SoundstageError::msg("player has shut down"))
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let (reply, response) = oneshot::channel();
        self.send(PlayerCommand::ListDevices(reply))?;
        response
            .await
            .map_err(|_| SoundstageError::msg("player has shut down"))
    }
}

pub struct Player {
    graph: Arc<AudioSourceGraph>,
    playlist: PlaylistSession,
    input: Arc<InputDeviceSession>,
    rotator: PresetRotator,
    render: RenderLoop,
    commands: mpsc::UnboundedReceiver<PlayerCommand>,
    ended: mpsc::UnboundedReceiver<PlaybackTicket>,
    events_tx: mpsc::UnboundedSender<PlayerEvent>,
    events: mpsc::UnboundedReceiver<PlayerEvent>,
    presets: watch::Receiver<Option<String>>,
    snapshots: watch::Sender<PlayerSnapshot>,
}

impl Player {
    /// Wires the sessions to `backends` and loads the initial preset.
    ///
    /// Must be called inside a tokio runtime: the render loop starts
    /// immediately.
    pub fn new(backends: Backends, config: &AppConfig) -> Result<(Self, PlayerHandle)> {
        config.validate()?;
        let Backends {
            context,
            decoder,
            capture,
            catalog,
            sink,
        } = backends;

        let graph = Arc::new(AudioSourceGraph::new(context, sink.clone()));
        let (ended_tx, ended) = mpsc::unbounded_channel();
        let playlist = PlaylistSession::new(graph.clone(), decoder, ended_tx);
        let input = Arc::new(InputDeviceSession::new(graph.clone(), capture));

        let rotator = PresetRotator::new(catalog, sink.clone(), &config.presets);
        rotator.load_initial(config.presets.initial.as_deref())?;

        let render = RenderLoop::start(sink, config.render.frame_interval());
        render.resize(config.render.width, config.render.height)?;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (snapshots, snapshots_rx) = watch::channel(PlayerSnapshot::default());
        let presets = rotator.subscribe();

        let player = Self {
            graph,
            playlist,
            input,
            rotator,
            render,
            commands,
            ended,
            events_tx,
            events,
            presets,
            snapshots,
        };
        player.publish();

        let handle = PlayerHandle {
            commands: commands_tx,
            snapshots: snapshots_rx,
        };
        Ok((player, handle))
    }

    /// Player on the in-process backends, with the preset catalog taken from
    /// the configuration or the built-in set.
    pub fn headless(config: &AppConfig) -> Result<(Self, PlayerHandle, HeadlessRig)> {
        let catalog: Arc<dyn PresetCatalog> = match &config.presets.catalog {
            Some(path) => Arc::new(JsonPresetCatalog::from_path(path)?),
            None => Arc::new(JsonPresetCatalog::builtin()),
        };
        let rig = HeadlessRig::new(config);
        let (player, handle) = Self::new(rig.backends(catalog), config)?;
        Ok((player, handle, rig))
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        let state = self.playlist.state();
        let active_source = self.graph.active_source();
        let live = active_source.map(|source| source.kind) == Some(SourceKind::LiveInput);
        PlayerSnapshot {
            tracks: self.playlist.track_names(),
            current_index: state.current_index,
            is_playing: state.is_playing,
            shuffle: self.playlist.shuffle().is_enabled(),
            active_source,
            input_device: self.input.attached_device().filter(|_| live),
            preset: self.rotator.current(),
            preset_index: self.rotator.current_index(),
            auto_rotation: self.rotator.is_auto_rotating(),
        }
    }

    /// Processes commands and events until `Shutdown` or every handle is
    /// dropped, then tears the sessions down.
    pub async fn run(mut self) {
        tracing::info!("player started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PlayerCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(ticket) = self.ended.recv() => {
                    self.handle_event(PlayerEvent::TrackEnded(ticket)).await;
                }
                Some(event) = self.events.recv() => self.handle_event(event).await,
                Ok(()) = self.presets.changed() => {}
            }
            self.publish();
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: PlayerCommand) {
        tracing::debug!(?command, "player command");
        match command {
            PlayerCommand::LoadPlaylist(sources) => self.playlist.load_playlist(sources).await,
            PlayerCommand::PlayTrack(index) => self.playlist.play_track(index).await,
            PlayerCommand::TogglePlay => self.playlist.toggle_play_pause().await,
            PlayerCommand::Next => self.playlist.skip_next().await,
            PlayerCommand::Prev => self.playlist.skip_prev().await,
            PlayerCommand::ToggleShuffle => {
                self.playlist.toggle_shuffle();
            }
            PlayerCommand::SelectDevice(device) => self.spawn_select(device),
            PlayerCommand::CloseInput => self.spawn_close(),
            PlayerCommand::ListDevices(reply) => {
                let devices = self.input.list_devices().await;
                if reply.send(devices).is_err() {
                    tracing::debug!("device list requester went away");
                }
            }
            PlayerCommand::SelectPreset(name) => {
                if let Err(err) = self.rotator.select(&name) {
                    tracing::warn!(preset = %name, %err, "preset selection failed");
                }
            }
            PlayerCommand::RandomPreset => {
                if let Err(err) = self.rotator.random() {
                    tracing::warn!(%err, "random preset failed");
                }
            }
            PlayerCommand::SetAutoRotation(enabled) => self.rotator.set_auto_rotation(enabled),
            PlayerCommand::ToggleAutoRotation => {
                self.rotator.toggle_auto_rotation();
            }
            PlayerCommand::Resize { width, height } => {
                if let Err(err) = self.render.resize(width, height) {
                    tracing::warn!(%err, "resize failed");
                }
            }
            PlayerCommand::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::TrackEnded(ticket) => self.playlist.handle_track_ended(ticket).await,
            PlayerEvent::InputSelected(SelectOutcome::Attached { device, node }) => {
                // A track played since the attach owns the slot again.
                if self.graph.active_source().map(|source| source.node) != Some(node) {
                    tracing::debug!(%device, %node, "live input already replaced");
                    return;
                }
                // The track lost the visualiser and the speakers to the live input.
                if self.playlist.state().is_playing {
                    self.playlist.pause();
                }
            }
            PlayerEvent::InputSelected(outcome) => {
                tracing::debug!(?outcome, "device selection settled");
            }
            PlayerEvent::InputClosed => {}
        }
    }

    /// Device switches run off the loop so a slow stream open never stalls
    /// transport commands. Their ordering is kept by the input session.
    fn spawn_select(&self, device: Option<String>) {
        let input = Arc::clone(&self.input);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = input.select_device(device).await;
            if events.send(PlayerEvent::InputSelected(outcome)).is_err() {
                tracing::debug!("player stopped before device selection settled");
            }
        });
    }

    fn spawn_close(&self) {
        let input = Arc::clone(&self.input);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            input.close().await;
            if events.send(PlayerEvent::InputClosed).is_err() {
                tracing::debug!("player stopped before input closed");
            }
        });
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    async fn shutdown(&mut self) {
        self.rotator.set_auto_rotation(false);
        self.render.stop();
        self.input.close().await;
        self.playlist.pause();
        self.publish();
        tracing::info!("player stopped");
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("playlist", &self.playlist)
            .field("input", &self.input)
            .field("rotator", &self.rotator)
            .field("render", &self.render)
            .finish()
    }
}
