use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::visual::{lock_sink, SharedSink};
use crate::Result;

/// Per-frame driver for the visualisation sink.
///
/// Each tick locks the sink and calls `render()`, so a source switched
/// between frames is picked up on the next one. Frame errors are logged and
/// the loop carries on; it only ends on [`RenderLoop::stop`] or drop.
pub struct RenderLoop {
    sink: SharedSink,
    handle: Option<JoinHandle<()>>,
}

impl RenderLoop {
    pub fn start(sink: SharedSink, frame_interval: Duration) -> Self {
        let frames = sink.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(frame_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = render_frame(&frames) {
                    tracing::warn!(%err, "frame render failed");
                }
            }
        });
        tracing::debug!(?frame_interval, "render loop started");
        Self {
            sink,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Forwards a new output size to the sink.
    pub fn resize(&self, width: u32, height: u32) -> Result<()> {
        lock_sink(&self.sink)?.set_renderer_size(width, height);
        tracing::debug!(width, height, "renderer resized");
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!("render loop stopped");
        }
    }
}

impl Drop for RenderLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn render_frame(sink: &SharedSink) -> Result<()> {
    lock_sink(sink)?.render()
}

impl std::fmt::Debug for RenderLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderLoop")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{AppConfig, SpectrumVisualizer};

    fn visualizer() -> Arc<Mutex<SpectrumVisualizer>> {
        SpectrumVisualizer::shared(&AppConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn renders_once_per_frame_until_stopped() {
        let visualizer = visualizer();
        let mut render = RenderLoop::start(visualizer.clone(), Duration::from_millis(10));

        time::sleep(Duration::from_millis(95)).await;
        let rendered = visualizer.lock().unwrap().frames_rendered();
        assert_eq!(rendered, 10);

        render.stop();
        assert!(!render.is_running());
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(visualizer.lock().unwrap().frames_rendered(), rendered);
    }

    #[tokio::test]
    async fn resize_reaches_the_sink() {
        let visualizer = visualizer();
        let render = RenderLoop::start(visualizer.clone(), Duration::from_millis(10));

        render.resize(640, 360).unwrap();

        assert_eq!(visualizer.lock().unwrap().renderer_size(), (640, 360));
    }
}
