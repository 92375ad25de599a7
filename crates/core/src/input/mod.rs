use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::audio::{CaptureBackend, CaptureStream, DeviceInfo, DeviceKind, NodeId, SharedProducer};
use crate::AudioSourceGraph;

/// The live capture currently feeding the visualiser.
pub struct InputSession {
    device_id: Option<String>,
    stream: Box<dyn CaptureStream>,
    node: SharedProducer,
}

impl InputSession {
    /// Requested device, `None` when the backend default was used.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn node(&self) -> &SharedProducer {
        &self.node
    }
}

impl fmt::Debug for InputSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSession")
            .field("device_id", &self.device_id)
            .field("opened_on", &self.stream.device_id())
            .field("node", &self.node.id())
            .finish()
    }
}

/// How a [`InputDeviceSession::select_device`] call settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectOutcome {
    /// The new stream is live and owns the visualiser slot.
    Attached { device: String, node: NodeId },
    /// A later selection, or a track taking the visualiser, started before
    /// this one finished; nothing attached.
    Superseded,
    /// The stream could not be opened or wired. Logged, never fatal.
    Failed,
}

/// Lifecycle of the live-capture source.
///
/// Selections are queued behind each other and stamped with a generation.
/// Each also claims the visualiser slot when it starts, so a selection
/// overtaken by a newer one, or by a track played in the meantime, never
/// attaches its stream.
pub struct InputDeviceSession {
    graph: Arc<AudioSourceGraph>,
    backend: Arc<dyn CaptureBackend>,
    current: Mutex<Option<InputSession>>,
    attached: StdMutex<Option<String>>,
    generation: AtomicU64,
}

impl InputDeviceSession {
    pub fn new(graph: Arc<AudioSourceGraph>, backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            graph,
            backend,
            current: Mutex::new(None),
            attached: StdMutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Capture devices as currently enumerated. Labels may be empty until
    /// capture permission has been granted.
    pub async fn list_devices(&self) -> Vec<DeviceInfo> {
        match self.backend.enumerate_devices().await {
            Ok(devices) => devices
                .into_iter()
                .filter(|device| device.kind == DeviceKind::AudioInput)
                .collect(),
            Err(err) => {
                tracing::warn!(%err, "device enumeration failed");
                Vec::new()
            }
        }
    }

    pub async fn current_device(&self) -> Option<String> {
        let current = self.current.lock().await;
        current
            .as_ref()
            .map(|session| session.stream.device_id().to_string())
    }

    /// Device the open stream was opened on, readable without waiting for
    /// a pending selection.
    pub fn attached_device(&self) -> Option<String> {
        self.attached.lock().ok().and_then(|attached| attached.clone())
    }

    /// Switches the live input to `device_id` (backend default when `None`).
    ///
    /// The previous session is torn down before the new stream is opened.
    /// The new producer feeds the visualiser only, never the speakers.
    pub async fn select_device(&self, device_id: Option<String>) -> SelectOutcome {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let claim = self.graph.claim();
        let mut current = self.current.lock().await;
        if self.is_stale(generation) || !self.graph.is_current(claim) {
            tracing::debug!(?device_id, "device selection overtaken while queued");
            return SelectOutcome::Superseded;
        }

        if let Err(err) = self.graph.resume().await {
            tracing::warn!(%err, "audio context did not resume");
        }

        if let Some(previous) = current.take() {
            self.teardown(previous);
        }

        let mut stream = match self.backend.open_stream(device_id.clone()).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(?device_id, %err, "could not open input stream");
                return SelectOutcome::Failed;
            }
        };

        if self.is_stale(generation) {
            tracing::debug!(device = stream.device_id(), "discarding stream of superseded selection");
            stream.stop();
            return SelectOutcome::Superseded;
        }

        let node = match self.graph.context().stream_source(stream.as_ref()) {
            Ok(node) => node,
            Err(err) => {
                tracing::warn!(%err, "could not wrap input stream");
                stream.stop();
                return SelectOutcome::Failed;
            }
        };

        match self.graph.connect_claimed(&node, claim) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(device = stream.device_id(), "visualiser claimed by a newer source");
                stream.stop();
                self.graph.release(&node);
                return SelectOutcome::Superseded;
            }
            Err(err) => {
                tracing::warn!(%err, "could not attach input to visualiser");
                stream.stop();
                self.graph.release(&node);
                return SelectOutcome::Failed;
            }
        }

        let device = stream.device_id().to_string();
        self.set_attached(Some(device.clone()));
        tracing::info!(device = %device, node = %node.id(), "live input attached");
        *current = Some(InputSession {
            device_id,
            stream,
            node: node.clone(),
        });
        SelectOutcome::Attached {
            device,
            node: node.id(),
        }
    }

    /// Stops the live input, if any. Pending selections are superseded.
    pub async fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            self.teardown(previous);
        }
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    fn teardown(&self, mut session: InputSession) {
        tracing::debug!(device = session.stream.device_id(), "tearing down live input");
        session.stream.stop();
        self.graph.release(&session.node);
        self.set_attached(None);
    }

    fn set_attached(&self, device: Option<String>) {
        match self.attached.lock() {
            Ok(mut attached) => *attached = device,
            Err(err) => tracing::warn!(%err, "could not record attached device"),
        }
    }
}

impl Drop for InputDeviceSession {
    fn drop(&mut self) {
        if let Some(previous) = self.current.get_mut().take() {
            self.teardown(previous);
        }
    }
}

impl fmt::Debug for InputDeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputDeviceSession")
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}
