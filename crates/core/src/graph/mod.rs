use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::audio::{self, AudioContext, Destination, NodeId, SharedProducer, SourceKind};
use crate::visual::{lock_sink, SharedSink};
use crate::{Result, SoundstageError};

/// The producer currently feeding the visualiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSource {
    pub node: NodeId,
    pub kind: SourceKind,
}

/// Owner of the shared audio context and of the visualiser's single input
/// slot.
///
/// Both sessions route their producers through here, so at most one producer
/// is ever connected to the sink. Every attempt to take the slot first takes
/// a claim; an attach made under an older claim is refused.
pub struct AudioSourceGraph {
    context: Arc<dyn AudioContext>,
    sink: SharedSink,
    active: Mutex<Option<SharedProducer>>,
    claims: AtomicU64,
}

impl AudioSourceGraph {
    pub fn new(context: Arc<dyn AudioContext>, sink: SharedSink) -> Self {
        Self {
            context,
            sink,
            active: Mutex::new(None),
            claims: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> &Arc<dyn AudioContext> {
        &self.context
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    /// Resumes the shared context if it is suspended.
    pub async fn resume(&self) -> Result<()> {
        audio::resume_if_suspended(self.context.as_ref()).await
    }

    /// Starts a new bid for the visualiser slot. Any earlier claim that has
    /// not attached yet goes stale.
    pub fn claim(&self) -> u64 {
        self.claims.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, claim: u64) -> bool {
        self.claims.load(Ordering::SeqCst) == claim
    }

    /// Hands the visualiser slot to `producer`, disconnecting whichever
    /// producer held it first. Connecting the current holder again leaves a
    /// single connection. Supersedes any pending claim.
    pub fn connect_to_visualizer(&self, producer: &SharedProducer) -> Result<()> {
        let claim = self.claim();
        self.connect_claimed(producer, claim).map(|_| ())
    }

    /// Like [`connect_to_visualizer`](Self::connect_to_visualizer), but only
    /// while `claim` is still the latest one. Returns `Ok(false)` and leaves
    /// the slot alone otherwise.
    pub fn connect_claimed(&self, producer: &SharedProducer, claim: u64) -> Result<bool> {
        let mut active = self.lock_active()?;
        if !self.is_current(claim) {
            tracing::debug!(node = %producer.id(), claim, "stale claim on visualiser slot");
            return Ok(false);
        }
        let mut sink = lock_sink(&self.sink)?;

        if let Some(previous) = active.take() {
            sink.disconnect_audio();
            detach(&previous);
        }

        producer.connect(Destination::Visualizer)?;
        sink.connect_audio(producer.clone());
        *active = Some(producer.clone());
        tracing::debug!(node = %producer.id(), kind = ?producer.kind(), "visualiser source switched");
        Ok(true)
    }

    /// Whether `producer` currently holds the visualiser slot.
    pub fn holds_slot(&self, producer: &SharedProducer) -> bool {
        self.active_source()
            .map(|active| active.node == producer.id())
            .unwrap_or(false)
    }

    /// Best-effort connection to the speakers. Returns whether it succeeded.
    pub fn connect_to_output(&self, producer: &SharedProducer) -> bool {
        match producer.connect(Destination::Output) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(node = %producer.id(), %err, "failed to connect audio source to output");
                false
            }
        }
    }

    /// Disconnects `producer` everywhere and frees the visualiser slot if it
    /// held it. Safe to call on nodes that are already disconnected.
    pub fn release(&self, producer: &SharedProducer) {
        match self.lock_active() {
            Ok(mut active) => {
                let holds_slot = active
                    .as_ref()
                    .map(|current| current.id() == producer.id())
                    .unwrap_or(false);
                if holds_slot {
                    *active = None;
                    match lock_sink(&self.sink) {
                        Ok(mut sink) => sink.disconnect_audio(),
                        Err(err) => tracing::warn!(%err, "could not clear visualiser input"),
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "could not inspect visualiser slot"),
        }
        detach(producer);
    }

    pub fn active_source(&self) -> Option<ActiveSource> {
        let active = self.active.lock().ok()?;
        active.as_ref().map(|producer| ActiveSource {
            node: producer.id(),
            kind: producer.kind(),
        })
    }

    fn lock_active(&self) -> Result<MutexGuard<'_, Option<SharedProducer>>> {
        self.active
            .lock()
            .map_err(|_| SoundstageError::Poisoned("visualiser slot"))
    }
}

impl std::fmt::Debug for AudioSourceGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSourceGraph")
            .field("active", &self.active_source())
            .finish()
    }
}

/// Teardown never fails: a node that is already disconnected is fine.
fn detach(producer: &SharedProducer) {
    if let Err(err) = producer.disconnect() {
        tracing::debug!(node = %producer.id(), %err, "ignoring disconnect failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FileDecoder, TrackSource};
    use crate::headless::{HeadlessContext, ToneDecoder};
    use crate::{AppConfig, SpectrumVisualizer, VisualizationSink};

    struct Fixture {
        context: Arc<HeadlessContext>,
        visualizer: Arc<Mutex<SpectrumVisualizer>>,
        graph: AudioSourceGraph,
        decoder: ToneDecoder,
    }

    fn fixture() -> Fixture {
        let config = AppConfig::default();
        let context = HeadlessContext::shared();
        let visualizer = SpectrumVisualizer::shared(&config);
        let graph = AudioSourceGraph::new(context.clone(), visualizer.clone());
        Fixture {
            context,
            visualizer,
            graph,
            decoder: ToneDecoder::new(48_000, 1.0),
        }
    }

    fn producer(fx: &Fixture, name: &str) -> SharedProducer {
        let track = fx.decoder.decode(&TrackSource::from_path(name)).unwrap();
        fx.context.media_source(track.as_ref()).unwrap()
    }

    #[test]
    fn reconnecting_same_producer_keeps_one_connection() {
        let fx = fixture();
        let node = producer(&fx, "a.wav");

        fx.graph.connect_to_visualizer(&node).unwrap();
        fx.graph.connect_to_visualizer(&node).unwrap();

        assert_eq!(fx.context.connected_nodes(Destination::Visualizer), vec![node.id()]);
        assert_eq!(fx.visualizer.lock().unwrap().connected(), Some(node.id()));
    }

    #[test]
    fn switching_producers_disconnects_previous() {
        let fx = fixture();
        let first = producer(&fx, "a.wav");
        let second = producer(&fx, "b.wav");

        fx.graph.connect_to_visualizer(&first).unwrap();
        assert!(fx.graph.connect_to_output(&first));
        fx.graph.connect_to_visualizer(&second).unwrap();

        assert!(!first.is_connected(Destination::Visualizer));
        assert!(!first.is_connected(Destination::Output));
        assert_eq!(fx.context.connected_nodes(Destination::Visualizer), vec![second.id()]);
        assert_eq!(
            fx.graph.active_source(),
            Some(ActiveSource {
                node: second.id(),
                kind: SourceKind::File
            })
        );
    }

    #[test]
    fn release_is_idempotent() {
        let fx = fixture();
        let node = producer(&fx, "a.wav");
        fx.graph.connect_to_visualizer(&node).unwrap();

        fx.graph.release(&node);
        fx.graph.release(&node);

        assert!(fx.graph.active_source().is_none());
        assert!(fx.visualizer.lock().unwrap().connected().is_none());
    }

    #[test]
    fn releasing_a_bystander_keeps_slot() {
        let fx = fixture();
        let holder = producer(&fx, "a.wav");
        let bystander = producer(&fx, "b.wav");
        fx.graph.connect_to_visualizer(&holder).unwrap();

        fx.graph.release(&bystander);

        assert_eq!(fx.graph.active_source().map(|s| s.node), Some(holder.id()));
    }

    #[test]
    fn stale_claim_cannot_take_the_slot() {
        let fx = fixture();
        let late = producer(&fx, "late.wav");
        let prompt = producer(&fx, "prompt.wav");

        let claim = fx.graph.claim();
        fx.graph.connect_to_visualizer(&prompt).unwrap();

        assert!(!fx.graph.is_current(claim));
        assert!(!fx.graph.connect_claimed(&late, claim).unwrap());
        assert!(!late.is_connected(Destination::Visualizer));
        assert!(fx.graph.holds_slot(&prompt));
        assert_eq!(fx.visualizer.lock().unwrap().connected(), Some(prompt.id()));
    }

    #[test]
    fn current_claim_attaches() {
        let fx = fixture();
        let node = producer(&fx, "a.wav");

        let claim = fx.graph.claim();
        assert!(fx.graph.connect_claimed(&node, claim).unwrap());
        assert!(fx.graph.holds_slot(&node));
    }

    #[test]
    fn failed_output_connection_is_reported() {
        let fx = fixture();
        let node = producer(&fx, "a.wav");
        fx.context.set_fail_output(true);

        fx.graph.connect_to_visualizer(&node).unwrap();

        assert!(!fx.graph.connect_to_output(&node));
        assert!(fx.context.connected_nodes(Destination::Output).is_empty());
        assert!(fx.graph.holds_slot(&node));
    }
}
