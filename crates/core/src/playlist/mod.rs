//! Playlist, transport state and auto-advance.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::audio::{FileDecoder, PlayableAudio, SharedProducer, TrackSource};
use crate::{AudioSourceGraph, ShuffleSequencer};

/// A decoded playlist entry and the producer node wrapping it.
pub struct Track {
    name: String,
    audio: Box<dyn PlayableAudio>,
    node: SharedProducer,
}

impl Track {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> &SharedProducer {
        &self.node
    }

    fn stop(&mut self) {
        self.audio.set_on_ended(None);
        self.audio.pause();
        self.audio.rewind();
    }

    fn release(&mut self, graph: &AudioSourceGraph) {
        self.audio.set_on_ended(None);
        self.audio.release();
        graph.release(&self.node);
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("name", &self.name)
            .field("node", &self.node.id())
            .finish()
    }
}

/// Now-playing position. `is_playing` is never true without a current index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub current_index: Option<usize>,
    pub is_playing: bool,
}

/// Sent when a track reaches its natural end.
///
/// `started_index` is the index the track was started at; `generation`
/// identifies the play call, so tickets from superseded plays are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackTicket {
    pub started_index: usize,
    pub generation: u64,
}

/// Authoritative playlist and transport state for one session.
pub struct PlaylistSession {
    graph: Arc<AudioSourceGraph>,
    decoder: Arc<dyn FileDecoder>,
    ended_tx: mpsc::UnboundedSender<PlaybackTicket>,
    tracks: Vec<Track>,
    state: PlaybackState,
    shuffle: ShuffleSequencer,
    generation: u64,
}

impl PlaylistSession {
    /// End-of-track tickets are delivered on `ended_tx`; feed them back
    /// through [`PlaylistSession::handle_track_ended`].
    pub fn new(
        graph: Arc<AudioSourceGraph>,
        decoder: Arc<dyn FileDecoder>,
        ended_tx: mpsc::UnboundedSender<PlaybackTicket>,
    ) -> Self {
        Self::with_shuffle(graph, decoder, ended_tx, ShuffleSequencer::new())
    }

    pub fn with_shuffle(
        graph: Arc<AudioSourceGraph>,
        decoder: Arc<dyn FileDecoder>,
        ended_tx: mpsc::UnboundedSender<PlaybackTicket>,
        shuffle: ShuffleSequencer,
    ) -> Self {
        Self {
            graph,
            decoder,
            ended_tx,
            tracks: Vec::new(),
            state: PlaybackState::default(),
            shuffle,
            generation: 0,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track_names(&self) -> Vec<String> {
        self.tracks.iter().map(|track| track.name.clone()).collect()
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.state.current_index.and_then(|index| self.tracks.get(index))
    }

    pub fn shuffle(&self) -> &ShuffleSequencer {
        &self.shuffle
    }

    /// Replaces the playlist. Every prior track is stopped, released and
    /// disconnected first. Files the decoder rejects are skipped. Playback
    /// starts at index 0 when anything was loaded.
    pub async fn load_playlist(&mut self, sources: Vec<TrackSource>) {
        self.teardown();
        self.generation += 1;
        self.state = PlaybackState::default();

        for source in sources {
            let mut audio = match self.decoder.decode(&source) {
                Ok(audio) => audio,
                Err(err) => {
                    tracing::warn!(track = %source.name, %err, "skipping file that failed to decode");
                    continue;
                }
            };
            match self.graph.context().media_source(audio.as_ref()) {
                Ok(node) => self.tracks.push(Track {
                    name: source.name,
                    audio,
                    node,
                }),
                Err(err) => {
                    tracing::warn!(track = %source.name, %err, "could not create producer for track");
                    audio.release();
                }
            }
        }

        self.shuffle.playlist_replaced(self.tracks.len());
        tracing::info!(tracks = self.tracks.len(), "playlist loaded");

        if !self.tracks.is_empty() {
            self.play_track(0).await;
        }
    }

    /// Starts `index` from the top. Out-of-range indices are ignored.
    pub async fn play_track(&mut self, index: usize) {
        if index >= self.tracks.len() {
            tracing::debug!(index, len = self.tracks.len(), "ignoring play of missing track");
            return;
        }

        if let Some(current) = self.state.current_index {
            if let Some(track) = self.tracks.get_mut(current) {
                track.stop();
            }
        }

        self.generation += 1;
        self.state.current_index = Some(index);

        let node = self.tracks[index].node.clone();
        if let Err(err) = self.graph.connect_to_visualizer(&node) {
            tracing::warn!(%err, "failed to attach track to visualiser");
        }
        self.graph.connect_to_output(&node);

        if let Err(err) = self.graph.resume().await {
            tracing::warn!(%err, "audio context did not resume");
        }

        self.tracks[index].audio.rewind();
        self.arm_end_of_track(index);
        self.state.is_playing = match self.tracks[index].audio.play() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(track = %self.tracks[index].name, %err, "playback failed to start");
                false
            }
        };
        tracing::info!(index, track = %self.tracks[index].name, "now playing");
    }

    /// Applies the auto-advance policy for a finished track.
    pub async fn handle_track_ended(&mut self, ticket: PlaybackTicket) {
        if ticket.generation != self.generation {
            tracing::debug!(?ticket, current = self.generation, "ignoring stale end-of-track");
            return;
        }

        let len = self.tracks.len();
        if len > 1 {
            self.play_track((ticket.started_index + 1) % len).await;
        } else {
            self.state.is_playing = false;
            tracing::debug!("playlist finished");
        }
    }

    /// Pauses or resumes the current track, or starts the first one when
    /// nothing is active. Pausing never touches the audio graph. Resuming
    /// re-wires the track only if another source took the visualiser slot in
    /// the meantime, and never rewinds it.
    pub async fn toggle_play_pause(&mut self) {
        let Some(index) = self.state.current_index else {
            self.play_track(0).await;
            return;
        };

        if self.state.is_playing {
            self.pause();
            return;
        }

        let node = self.tracks[index].node.clone();
        if !self.graph.holds_slot(&node) {
            tracing::debug!(index, "track lost the visualiser slot, re-attaching");
            if let Err(err) = self.graph.connect_to_visualizer(&node) {
                tracing::warn!(%err, "failed to attach track to visualiser");
            }
            self.graph.connect_to_output(&node);
        }

        self.arm_end_of_track(index);
        match self.tracks[index].audio.play() {
            Ok(()) => self.state.is_playing = true,
            Err(err) => tracing::warn!(%err, "failed to resume playback"),
        }
    }

    pub fn pause(&mut self) {
        if let Some(track) = self.state.current_index.and_then(|i| self.tracks.get_mut(i)) {
            track.audio.pause();
        }
        self.state.is_playing = false;
    }

    pub async fn skip_next(&mut self) {
        let len = self.tracks.len();
        if len == 0 {
            return;
        }
        let next = if self.shuffle.is_enabled() {
            self.shuffle.next(len)
        } else {
            Some(self.state.current_index.map(|i| (i + 1) % len).unwrap_or(0))
        };
        if let Some(index) = next {
            self.play_track(index).await;
        }
    }

    pub async fn skip_prev(&mut self) {
        let len = self.tracks.len();
        if len == 0 {
            return;
        }
        let prev = if self.shuffle.is_enabled() {
            self.shuffle.prev(len)
        } else {
            Some(
                self.state
                    .current_index
                    .map(|i| (i + len - 1) % len)
                    .unwrap_or(len - 1),
            )
        };
        if let Some(index) = prev {
            self.play_track(index).await;
        }
    }

    /// Flips shuffle and returns whether it is now on.
    pub fn toggle_shuffle(&mut self) -> bool {
        let enabled = self.shuffle.toggle(self.tracks.len());
        tracing::info!(enabled, "shuffle toggled");
        enabled
    }

    fn arm_end_of_track(&mut self, index: usize) {
        let ticket = PlaybackTicket {
            started_index: index,
            generation: self.generation,
        };
        let tx = self.ended_tx.clone();
        self.tracks[index].audio.set_on_ended(Some(Box::new(move || {
            if tx.send(ticket).is_err() {
                tracing::debug!(?ticket, "end-of-track receiver is gone");
            }
        })));
    }

    fn teardown(&mut self) {
        for mut track in self.tracks.drain(..) {
            track.release(&self.graph);
        }
    }
}

impl Drop for PlaylistSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for PlaylistSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaylistSession")
            .field("tracks", &self.tracks)
            .field("state", &self.state)
            .field("shuffle", &self.shuffle.is_enabled())
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioContext, Destination};
    use crate::headless::{HeadlessContext, ToneDecoder};
    use crate::{AppConfig, SpectrumVisualizer};

    struct Fixture {
        context: Arc<HeadlessContext>,
        graph: Arc<AudioSourceGraph>,
        decoder: Arc<ToneDecoder>,
        session: PlaylistSession,
        ended_rx: mpsc::UnboundedReceiver<PlaybackTicket>,
    }

    fn fixture() -> Fixture {
        let config = AppConfig::default();
        let context = HeadlessContext::shared();
        let graph = Arc::new(AudioSourceGraph::new(
            context.clone(),
            SpectrumVisualizer::shared(&config),
        ));
        let decoder = Arc::new(ToneDecoder::new(48_000, 1.0));
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let session = PlaylistSession::with_shuffle(
            graph.clone(),
            decoder.clone(),
            ended_tx,
            ShuffleSequencer::with_seed(42),
        );
        Fixture {
            context,
            graph,
            decoder,
            session,
            ended_rx,
        }
    }

    fn sources(names: &[&str]) -> Vec<TrackSource> {
        names.iter().map(|name| TrackSource::from_path(name)).collect()
    }

    impl Fixture {
        fn playing(&self) -> Vec<String> {
            self.decoder
                .handles()
                .into_iter()
                .filter(|handle| handle.is_playing())
                .map(|handle| handle.name())
                .collect()
        }

        async fn finish(&mut self, name: &str) {
            self.decoder.handle(name).unwrap().finish();
            let ticket = self.ended_rx.recv().await.unwrap();
            self.session.handle_track_ended(ticket).await;
        }
    }

    #[tokio::test]
    async fn loading_starts_first_track() {
        let mut fx = fixture();
        fx.session.load_playlist(sources(&["a", "b", "c"])).await;

        assert_eq!(
            fx.session.state(),
            PlaybackState {
                current_index: Some(0),
                is_playing: true
            }
        );
        assert_eq!(fx.playing(), vec!["a"]);
        assert_eq!(fx.context.resume_count(), 1);
        let node = fx.session.tracks()[0].node().id();
        assert_eq!(fx.context.connected_nodes(Destination::Visualizer), vec![node]);
        assert_eq!(fx.context.connected_nodes(Destination::Output), vec![node]);
    }

    #[tokio::test]
    async fn play_track_leaves_one_track_and_one_connection() {
        let mut fx = fixture();
        fx.session.load_playlist(sources(&["a", "b", "c"])).await;

        for index in [2, 1, 1, 0] {
            fx.session.play_track(index).await;
            let expected = fx.session.tracks()[index].name().to_string();
            assert_eq!(fx.playing(), vec![expected]);
            assert_eq!(
                fx.context.connected_nodes(Destination::Visualizer),
                vec![fx.session.tracks()[index].node().id()]
            );
        }
    }

    #[tokio::test]
    async fn previous_track_is_rewound_and_unhooked() {
        let mut fx = fixture();
        fx.session.load_playlist(sources(&["a", "b"])).await;
        let a = fx.decoder.handle("a").unwrap();
        a.advance(1_000);

        fx.session.play_track(1).await;

        assert_eq!(a.position(), 0);
        assert!(!a.is_playing());
        assert!(!a.has_end_callback());
    }

    #[tokio::test]
    async fn auto_advance_moves_forward_and_wraps() {
        let mut fx = fixture();
        fx.session.load_playlist(sources(&["a", "b", "c"])).await;

        fx.finish("a").await;
        assert_eq!(fx.session.state().current_index, Some(1));
        assert_eq!(fx.playing(), vec!["b"]);

        fx.session.play_track(2).await;
        fx.finish("c").await;
        assert_eq!(fx.session.state().current_index, Some(0));
        assert_eq!(fx.playing(), vec!["a"]);
    }

    #[tokio::test]
    async fn single_track_stops_instead_of_looping() {
        let mut fx = fixture();
        fx.session.load_playlist(sources(&["only"])).await;

        fx.finish("only").await;

        assert_eq!(
            fx.session.state(),
            PlaybackState {
                current_index: Some(0),
                is_playing: false
            }
        );
        assert!(fx.playing().is_empty());
    }

    #[tokio::test]
    async fn stale_end_of_track_is_ignored() {
        let mut fx = fixture();
        fx.session.load_playlist(sources(&["a", "b", "c"])).await;

        fx.decoder.handle("a").unwrap().finish();
        let stale = fx.ended_rx.recv().await.unwrap();
        fx.session.play_track(2).await;
        fx.session.handle_track_ended(stale).await;

        assert_eq!(fx.session.state().current_index, Some(2));
        assert_eq!(fx.playing(), vec!["c"]);
    }

    #[tokio::test]
    async fn toggle_starts_pauses_and_resumes_without_rewiring() {
        let mut fx = fixture();
        fx.session.toggle_play_pause().await;
        assert_eq!(fx.session.state(), PlaybackState::default());

        fx.session.load_playlist(sources(&["a", "b"])).await;
        let node = fx.session.tracks()[0].node().clone();

        fx.session.toggle_play_pause().await;
        assert!(!fx.session.state().is_playing);
        assert!(fx.playing().is_empty());

        fx.session.toggle_play_pause().await;
        assert!(fx.session.state().is_playing);
        assert_eq!(fx.playing(), vec!["a"]);
        assert_eq!(fx.decoder.handle("a").unwrap().play_count(), 2);
        assert!(node.is_connected(Destination::Visualizer));
        assert!(node.is_connected(Destination::Output));
    }

    #[tokio::test]
    async fn resumed_single_track_still_reports_its_end() {
        let mut fx = fixture();
        fx.session.load_playlist(sources(&["only"])).await;
        fx.finish("only").await;

        fx.session.toggle_play_pause().await;
        assert!(fx.session.state().is_playing);
        fx.finish("only").await;
        assert!(!fx.session.state().is_playing);
    }

    #[tokio::test]
    async fn linear_skips_wrap_around() {
        let mut fx = fixture();
        fx.session.load_playlist(sources(&["a", "b", "c"])).await;

        fx.session.skip_prev().await;
        assert_eq!(fx.session.state().current_index, Some(2));
        fx.session.skip_next().await;
        assert_eq!(fx.session.state().current_index, Some(0));
        fx.session.skip_next().await;
        assert_eq!(fx.session.state().current_index, Some(1));
    }

    #[tokio::test]
    async fn shuffled_skips_follow_the_permutation() {
        let mut fx = fixture();
        fx.session.load_playlist(sources(&["a", "b", "c", "d"])).await;
        assert!(fx.session.toggle_shuffle());
        let order = fx.session.shuffle().order().to_vec();

        fx.session.skip_next().await;
        assert_eq!(fx.session.state().current_index, Some(order[1]));
        fx.session.skip_next().await;
        assert_eq!(fx.session.state().current_index, Some(order[2]));
        fx.session.skip_prev().await;
        assert_eq!(fx.session.state().current_index, Some(order[1]));
    }

    #[tokio::test]
    async fn invalid_indices_and_empty_playlists_are_ignored() {
        let mut fx = fixture();
        fx.session.play_track(0).await;
        fx.session.skip_next().await;
        fx.session.skip_prev().await;
        assert_eq!(fx.session.state(), PlaybackState::default());

        fx.session.load_playlist(sources(&["a"])).await;
        fx.session.play_track(5).await;
        assert_eq!(fx.session.state().current_index, Some(0));
    }

    #[tokio::test]
    async fn reloading_releases_previous_tracks() {
        let mut fx = fixture();
        fx.session.load_playlist(sources(&["a", "b"])).await;
        let old_nodes: Vec<_> = fx.session.tracks().iter().map(|t| t.node().clone()).collect();
        fx.session.toggle_shuffle();

        fx.session.load_playlist(sources(&["c"])).await;

        for name in ["a", "b"] {
            assert!(fx.decoder.handle(name).unwrap().is_released());
        }
        for node in old_nodes {
            assert!(!node.is_connected(Destination::Visualizer));
            assert!(!node.is_connected(Destination::Output));
        }
        assert_eq!(fx.session.track_names(), vec!["c"]);
        assert_eq!(fx.session.shuffle().order(), &[0]);
        assert_eq!(fx.playing(), vec!["c"]);
    }

    #[tokio::test]
    async fn undecodable_files_are_skipped() {
        let mut fx = fixture();
        fx.decoder.reject("broken");
        fx.session.load_playlist(sources(&["broken", "good"])).await;

        assert_eq!(fx.session.track_names(), vec!["good"]);
        assert_eq!(fx.session.state().current_index, Some(0));
    }

    #[tokio::test]
    async fn empty_load_resets_state() {
        let mut fx = fixture();
        fx.session.load_playlist(sources(&["a"])).await;
        fx.session.load_playlist(Vec::new()).await;

        assert_eq!(fx.session.state(), PlaybackState::default());
        assert!(fx.context.connected_nodes(Destination::Visualizer).is_empty());
    }

    #[tokio::test]
    async fn refused_resume_still_starts_playback() {
        let mut fx = fixture();
        fx.context.set_fail_resume(true);
        fx.session.load_playlist(sources(&["a"])).await;

        assert!(fx.session.state().is_playing);
    }

    #[tokio::test]
    async fn resume_after_losing_the_slot_rewires_without_rewinding() {
        let mut fx = fixture();
        fx.session.load_playlist(sources(&["a", "b"])).await;
        let node = fx.session.tracks()[0].node().clone();
        let a = fx.decoder.handle("a").unwrap();
        a.advance(1_000);

        let other = fx.decoder.decode(&TrackSource::from_path("other")).unwrap();
        let intruder = fx.context.media_source(other.as_ref()).unwrap();
        fx.graph.connect_to_visualizer(&intruder).unwrap();
        fx.session.pause();
        assert!(!node.is_connected(Destination::Output));

        fx.session.toggle_play_pause().await;

        assert!(fx.session.state().is_playing);
        assert!(fx.graph.holds_slot(&node));
        assert_eq!(fx.context.connected_nodes(Destination::Visualizer), vec![node.id()]);
        assert_eq!(fx.context.connected_nodes(Destination::Output), vec![node.id()]);
        assert_eq!(a.position(), 1_000);
    }

    #[tokio::test]
    async fn output_failure_still_plays_through_the_visualiser() {
        let mut fx = fixture();
        fx.context.set_fail_output(true);
        fx.session.load_playlist(sources(&["a", "b"])).await;

        let node = fx.session.tracks()[0].node().id();
        assert!(fx.session.state().is_playing);
        assert_eq!(fx.playing(), vec!["a"]);
        assert_eq!(fx.context.connected_nodes(Destination::Visualizer), vec![node]);
        assert!(fx.context.connected_nodes(Destination::Output).is_empty());

        fx.session.skip_next().await;
        let next = fx.session.tracks()[1].node().id();
        assert_eq!(fx.context.connected_nodes(Destination::Visualizer), vec![next]);
    }
}
