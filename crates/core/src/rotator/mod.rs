//! Manual and timed preset switching.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::PresetConfig;
use crate::presets::PresetCatalog;
use crate::visual::{lock_sink, SharedSink};
use crate::{Result, SoundstageError};

struct RotatorState {
    catalog: Arc<dyn PresetCatalog>,
    sink: SharedSink,
    current: Option<String>,
    current_index: Option<usize>,
    deny_list: HashSet<String>,
    rng: StdRng,
    announce: watch::Sender<Option<String>>,
}

impl RotatorState {
    fn load(&mut self, name: &str, transition_secs: f32) -> Result<()> {
        let preset = self
            .catalog
            .get(name)
            .ok_or_else(|| SoundstageError::UnknownPreset(name.to_string()))?;
        lock_sink(&self.sink)?.load_preset(&preset, transition_secs);
        self.current_index = self.catalog.names().iter().position(|n| n == name);
        self.current = Some(name.to_string());
        self.announce.send_replace(self.current.clone());
        tracing::info!(preset = name, transition_secs, "preset loaded");
        Ok(())
    }

    /// Uniform pick that avoids the current preset whenever anything else is
    /// available. Timed picks also skip the deny list, unless that would
    /// leave nothing.
    fn pick(&mut self, timed: bool) -> Option<String> {
        let names = self.catalog.names();
        if names.len() <= 1 {
            return names.into_iter().next();
        }

        let current = self.current.as_deref();
        let mut candidates: Vec<&String> = names
            .iter()
            .filter(|name| Some(name.as_str()) != current)
            .collect();
        if timed {
            let allowed: Vec<&String> = candidates
                .iter()
                .copied()
                .filter(|name| !self.deny_list.contains(name.as_str()))
                .collect();
            if !allowed.is_empty() {
                candidates = allowed;
            }
        }
        candidates.choose(&mut self.rng).map(|name| name.to_string())
    }
}

/// Owns the current preset and the optional auto-rotation timer.
///
/// The timer runs only while auto-rotation is on and is aborted when it is
/// switched off or the rotator is dropped.
pub struct PresetRotator {
    state: Arc<Mutex<RotatorState>>,
    interval: Duration,
    manual_transition: f32,
    auto_transition: f32,
    timer: Option<JoinHandle<()>>,
}

impl PresetRotator {
    pub fn new(catalog: Arc<dyn PresetCatalog>, sink: SharedSink, config: &PresetConfig) -> Self {
        Self::with_rng(catalog, sink, config, StdRng::from_entropy())
    }

    pub fn with_rng(
        catalog: Arc<dyn PresetCatalog>,
        sink: SharedSink,
        config: &PresetConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(RotatorState {
                catalog,
                sink,
                current: None,
                current_index: None,
                deny_list: config.deny_list.iter().cloned().collect(),
                rng,
                announce: watch::channel(None).0,
            })),
            interval: config.rotation_interval(),
            manual_transition: config.manual_transition_secs,
            auto_transition: config.auto_transition_secs,
            timer: None,
        }
    }

    pub fn current(&self) -> Option<String> {
        self.lock().ok()?.current.clone()
    }

    /// Catalog position of the current preset.
    pub fn current_index(&self) -> Option<usize> {
        self.lock().ok()?.current_index
    }

    pub fn names(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.catalog.names())
            .unwrap_or_default()
    }

    /// Receiver that sees every preset change, timed ones included.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        match self.lock() {
            Ok(state) => state.announce.subscribe(),
            Err(_) => watch::channel(None).1,
        }
    }

    pub fn is_auto_rotating(&self) -> bool {
        self.timer.is_some()
    }

    /// Loads `name` into the sink and makes it current.
    pub fn load_preset(&self, name: &str, transition_secs: f32) -> Result<()> {
        self.lock()?.load(name, transition_secs)
    }

    /// Startup load: `initial` if given, otherwise the first catalog entry,
    /// applied without a crossfade.
    pub fn load_initial(&self, initial: Option<&str>) -> Result<()> {
        let mut state = self.lock()?;
        let name = match initial {
            Some(name) => name.to_string(),
            None => match state.catalog.names().into_iter().next() {
                Some(name) => name,
                None => {
                    tracing::warn!("preset catalog is empty");
                    return Ok(());
                }
            },
        };
        state.load(&name, 0.0)
    }

    /// User selection. A running rotation timer starts its interval over.
    pub fn select(&mut self, name: &str) -> Result<()> {
        self.load_preset(name, self.manual_transition)?;
        self.restart_timer();
        Ok(())
    }

    /// Loads a random preset other than the current one. Returns its name.
    pub fn random(&mut self) -> Result<Option<String>> {
        let picked = {
            let mut state = self.lock()?;
            match state.pick(false) {
                Some(name) => {
                    state.load(&name, self.manual_transition)?;
                    Some(name)
                }
                None => None,
            }
        };
        if picked.is_some() {
            self.restart_timer();
        }
        Ok(picked)
    }

    pub fn set_auto_rotation(&mut self, enabled: bool) {
        if enabled == self.is_auto_rotating() {
            return;
        }
        if enabled {
            self.start_timer();
            tracing::info!(interval = ?self.interval, "preset auto-rotation on");
        } else {
            self.stop_timer();
            tracing::info!("preset auto-rotation off");
        }
    }

    /// Flips auto-rotation and returns the new state.
    pub fn toggle_auto_rotation(&mut self) -> bool {
        let enabled = !self.is_auto_rotating();
        self.set_auto_rotation(enabled);
        enabled
    }

    fn restart_timer(&mut self) {
        if self.is_auto_rotating() {
            self.stop_timer();
            self.start_timer();
        }
    }

    fn start_timer(&mut self) {
        let shared = Arc::clone(&self.state);
        let period = self.interval;
        let transition = self.auto_transition;
        self.timer = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = rotate(&shared, transition) {
                    tracing::error!(%err, "stopping auto-rotation");
                    return;
                }
            }
        }));
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RotatorState>> {
        self.state
            .lock()
            .map_err(|_| SoundstageError::Poisoned("preset rotator"))
    }
}

fn rotate(shared: &Mutex<RotatorState>, transition_secs: f32) -> Result<()> {
    let mut state = shared
        .lock()
        .map_err(|_| SoundstageError::Poisoned("preset rotator"))?;
    if let Some(name) = state.pick(true) {
        if let Err(err) = state.load(&name, transition_secs) {
            tracing::warn!(preset = %name, %err, "auto-rotation could not load preset");
        }
    }
    Ok(())
}

impl Drop for PresetRotator {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

impl std::fmt::Debug for PresetRotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresetRotator")
            .field("current", &self.current())
            .field("auto_rotating", &self.is_auto_rotating())
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets::{JsonPresetCatalog, PresetData};
    use crate::{AppConfig, SpectrumVisualizer};

    fn catalog(names: &[&str]) -> Arc<JsonPresetCatalog> {
        let mut catalog = JsonPresetCatalog::default();
        for (i, name) in names.iter().enumerate() {
            catalog.insert(*name, PresetData(serde_json::json!({ "hue": i as f64 / 10.0 })));
        }
        Arc::new(catalog)
    }

    fn rotator(names: &[&str], deny: &[&str]) -> (PresetRotator, Arc<Mutex<SpectrumVisualizer>>) {
        let mut config = AppConfig::default();
        config.presets.deny_list = deny.iter().map(|name| name.to_string()).collect();
        let visualizer = SpectrumVisualizer::shared(&config);
        let rotator = PresetRotator::with_rng(
            catalog(names),
            visualizer.clone(),
            &config.presets,
            StdRng::seed_from_u64(42),
        );
        (rotator, visualizer)
    }

    #[test]
    fn initial_preset_is_first_entry() {
        let (rotator, visualizer) = rotator(&["a", "b", "c"], &[]);
        rotator.load_initial(None).unwrap();

        assert_eq!(rotator.current().as_deref(), Some("a"));
        assert_eq!(rotator.current_index(), Some(0));
        assert!(!visualizer.lock().unwrap().in_transition());
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let (mut rotator, _) = rotator(&["a"], &[]);
        let err = rotator.select("zzz").unwrap_err();
        assert!(matches!(err, SoundstageError::UnknownPreset(name) if name == "zzz"));
        assert!(rotator.current().is_none());
    }

    #[test]
    fn manual_selection_crossfades() {
        let (mut rotator, visualizer) = rotator(&["a", "b"], &[]);
        rotator.load_initial(None).unwrap();
        rotator.select("b").unwrap();

        assert_eq!(rotator.current_index(), Some(1));
        assert!(visualizer.lock().unwrap().in_transition());
    }

    #[test]
    fn random_never_repeats_current() {
        let (mut rotator, _) = rotator(&["a", "b", "c"], &[]);
        rotator.load_initial(None).unwrap();
        for _ in 0..50 {
            let before = rotator.current();
            let picked = rotator.random().unwrap();
            assert_ne!(picked, before);
        }
    }

    #[test]
    fn single_preset_may_repeat() {
        let (mut rotator, _) = rotator(&["only"], &[]);
        rotator.load_initial(None).unwrap();
        assert_eq!(rotator.random().unwrap().as_deref(), Some("only"));
    }

    #[test]
    fn timed_picks_skip_deny_list() {
        let (rotator, _) = rotator(&["a", "b", "c", "d"], &["c", "d"]);
        rotator.load_initial(None).unwrap();
        let mut state = rotator.lock().unwrap();
        for _ in 0..50 {
            assert_eq!(state.pick(true).as_deref(), Some("b"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rotates_only_while_enabled() {
        let (mut rotator, visualizer) = rotator(&["a", "b", "c"], &[]);
        rotator.load_initial(None).unwrap();
        let loads = || visualizer.lock().unwrap().presets_loaded();
        assert_eq!(loads(), 1);

        rotator.set_auto_rotation(true);
        time::sleep(Duration::from_secs(24)).await;
        assert_eq!(loads(), 1);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(loads(), 2);
        assert_ne!(rotator.current().as_deref(), Some("a"));

        assert!(!rotator.toggle_auto_rotation());
        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(loads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_timed_changes() {
        let (mut rotator, _) = rotator(&["a", "b"], &[]);
        rotator.load_initial(None).unwrap();
        let mut changes = rotator.subscribe();
        changes.borrow_and_update();

        rotator.set_auto_rotation(true);
        changes.changed().await.unwrap();

        assert_eq!(changes.borrow().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_cancels_the_timer() {
        let (mut rotator, visualizer) = rotator(&["a", "b"], &[]);
        rotator.set_auto_rotation(true);
        drop(rotator);

        time::sleep(Duration::from_secs(100)).await;
        assert_eq!(visualizer.lock().unwrap().presets_loaded(), 0);
    }
}
